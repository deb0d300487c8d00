//! # GeoJSON Tiles
//!
//! Serves slippy map tiles as GeoJSON feature collections.
//!
//! ## How a tile is rendered
//!
//! A tile address (zoom, column, row) is projected to a geographic bounding box.
//! Records whose geometry intersects the box are fetched from a geometry store,
//! optionally trimmed to the box, and each one is encoded as a GeoJSON feature:
//! the primary key becomes the feature id, one geometry field becomes the
//! feature geometry, and the remaining fields become properties, subject to an
//! optional whitelist or rename map. Relations are written as the referenced key
//! or, on request, the related record's natural key.
//!
//! ## Stores
//!
//! [`postgis::PostGisStore`] queries PostGIS through a `sqlx` pool and computes
//! trimmed geometries server side. [`memory::MemoryStore`] keeps records in
//! memory. Other backends implement [`store::GeometryStore`].
//!
//! ## Known Limitations
//!
//! Serving HTTP is left to the calling application; this crate produces the
//! response body and its [`CONTENT_TYPE`]. Schemas are introspected on every
//! request, so applications serving heavy traffic may want to wrap their store.

#![deny(warnings)]

// TODO: remove once async fn in traits become stable
use async_trait::async_trait;

pub mod collection;
pub mod encoder;
pub mod error;
pub mod geometry;
pub mod layer;
pub mod memory;
pub mod postgis;
pub mod record;
pub mod schema;
pub mod store;
pub mod tile;

pub use error::Error;
pub use layer::{TileConfig, TileLayer};
pub use store::GeometryStore;
pub use tile::{BoundingBox, TileAddress};

/// Media type of a rendered tile.
pub const CONTENT_TYPE: &str = "application/json";

/// This is the main trait exported by this crate.
#[async_trait]
pub trait TileSource {
    /// Renders the GeoJSON feature collection for a slippy map tile in XYZ format.
    async fn render_geojson<S: GeometryStore>(
        &self,
        store: &S,
        tile: TileAddress,
    ) -> Result<Vec<u8>, Error>;
}
