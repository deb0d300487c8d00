/// GeoJSON tile layer configuration (YAML)
///
/// ```yaml
/// name: City Parks
/// layers:
///   - id: parks
///     table: public.parks
///     properties: {name: title}
/// ```
use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use sqlx::PgPool;

use crate::collection::{CollectionOptions, FeatureCollectionBuilder};
use crate::encoder::{EncodeOptions, FeatureEncoder, PropertyProjection};
use crate::error::Error;
use crate::postgis::{LinkTable, PostGisStore};
use crate::store::{GeometryStore, SpatialQuery};
use crate::tile::{Projection, TileAddress, TileProjection, DEFAULT_SRID};
use crate::TileSource;

/// A set of GeoJSON tile layers.
#[derive(Clone, Deserialize, Debug)]
pub struct TileConfig {
    pub name: String,
    pub layers: Vec<TileLayer>,
    /// Natural key columns per related table.
    #[serde(default)]
    pub natural_keys: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub link_tables: Vec<LinkTable>,
}

/// One table served as GeoJSON tiles.
#[derive(Clone, Deserialize, Debug)]
pub struct TileLayer {
    pub id: String,
    pub table: String,
    /// Inferred from the table schema when absent.
    pub geometry_field: Option<String>,
    pub primary_key: Option<String>,
    #[serde(default = "enabled")]
    pub trim_to_boundary: bool,
    pub properties: Option<PropertyProjection>,
    #[serde(default)]
    pub use_natural_keys: bool,
    #[serde(default = "enabled")]
    pub crs: bool,
    #[serde(default = "default_srid")]
    pub srid: i32,
    #[serde(default)]
    pub projection: Projection,
    #[serde(default)]
    pub pretty: bool,
}

fn enabled() -> bool {
    true
}

fn default_srid() -> i32 {
    DEFAULT_SRID
}

impl TileConfig {
    /// Constructs a new TileConfig from a YAML string
    pub fn from(data: &str) -> Result<TileConfig, Error> {
        let config: TileConfig = serde_yaml::from_str(data)?;
        Ok(config)
    }

    pub fn layer(&self, id: &str) -> Option<&TileLayer> {
        self.layers.iter().find(|layer| layer.id == id)
    }

    /// Renders a tile of the layer named `id`.
    pub async fn render<S: GeometryStore>(
        &self,
        id: &str,
        store: &S,
        tile: TileAddress,
    ) -> Result<Vec<u8>, Error> {
        self.layer(id)
            .ok_or_else(|| Error::UnknownLayer(id.to_string()))?
            .render_geojson(store, tile)
            .await
    }
}

impl TileLayer {
    /// A layer over `table` with default options.
    pub fn new(id: &str, table: &str) -> TileLayer {
        TileLayer {
            id: id.to_string(),
            table: table.to_string(),
            geometry_field: None,
            primary_key: None,
            trim_to_boundary: true,
            properties: None,
            use_natural_keys: false,
            crs: true,
            srid: DEFAULT_SRID,
            projection: Projection::default(),
            pretty: false,
        }
    }
}

#[async_trait]
impl TileSource for TileLayer {
    async fn render_geojson<S: GeometryStore>(
        &self,
        store: &S,
        tile: TileAddress,
    ) -> Result<Vec<u8>, Error> {
        let bbox = self.projection.tile_bounds(tile, self.srid);
        let table = store.describe(&self.table).await?;
        let schema = store.schema(&table);
        let query = SpatialQuery::plan(
            schema,
            &self.table,
            self.geometry_field.as_deref(),
            bbox,
            self.trim_to_boundary,
            self.use_natural_keys,
        )?;

        let records = store.fetch_intersecting(&table, &query).await?;

        let options = EncodeOptions {
            geometry_field: query.output_geometry_field().to_string(),
            primary_key: self.primary_key.clone(),
            properties: self.properties.clone(),
            use_natural_keys: self.use_natural_keys,
        };
        let encoder = FeatureEncoder::new(schema, &options);

        let mut collection = FeatureCollectionBuilder::new(CollectionOptions {
            crs: self.crs,
            srid: self.srid,
            bbox: Some(bbox),
            pretty: self.pretty,
        });
        for record in &records {
            collection.push(encoder.encode(record)?);
        }

        debug!(
            "Rendered {} features for {} tile {}",
            collection.len(),
            self.id,
            tile
        );
        collection.finish().to_vec()
    }
}

impl PostGisStore {
    /// A store with the natural keys and link tables declared in `config`.
    pub fn from_config(pool: PgPool, config: &TileConfig) -> PostGisStore {
        let store = config
            .natural_keys
            .iter()
            .fold(PostGisStore::new(pool), |store, (table, columns)| {
                store.with_natural_key(table, columns.clone())
            });
        config
            .link_tables
            .iter()
            .cloned()
            .fold(store, |store, link| store.with_link_table(link))
    }
}
