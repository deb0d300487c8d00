/// Slippy map tile addressing and the tile → bounding box projection.
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::Error;

/// Deepest supported zoom level. The grid size `2^zoom` must fit a signed 32 bit integer.
pub const MAX_ZOOM: u8 = 30;

/// Spatial reference used for bounding boxes unless configured otherwise.
pub const DEFAULT_SRID: i32 = 4326;

/// A (zoom, column, row) triple in XYZ order, always inside the grid of its zoom.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileAddress {
    zoom: u8,
    col: u32,
    row: u32,
}

impl TileAddress {
    pub fn new(zoom: u8, col: u32, row: u32) -> Result<TileAddress, Error> {
        if zoom > MAX_ZOOM {
            return Err(Error::InvalidTileAddress(format!(
                "zoom {} exceeds {}",
                zoom, MAX_ZOOM
            )));
        }

        let tiles = 1u64 << zoom;
        if u64::from(col) >= tiles || u64::from(row) >= tiles {
            return Err(Error::InvalidTileAddress(format!(
                "{}/{}/{} is outside the {}x{} grid",
                zoom, col, row, tiles, tiles
            )));
        }

        Ok(TileAddress { zoom, col, row })
    }

    /// Builds an address from raw path parameters, e.g. the `{z}/{x}/{y}` of a route.
    pub fn from_path_params(z: &str, x: &str, y: &str) -> Result<TileAddress, Error> {
        TileAddress::new(parse_part(z, "zoom")?, parse_part(x, "col")?, parse_part(y, "row")?)
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn col(&self) -> u32 {
        self.col
    }

    pub fn row(&self) -> u32 {
        self.row
    }
}

fn parse_part<T: FromStr>(value: &str, name: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidTileAddress(format!("{} {:?} is not an integer", name, value)))
}

impl FromStr for TileAddress {
    type Err = Error;

    /// Parses `z/x/y`, tolerating a leading slash and a `.json`/`.geojson` suffix.
    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let path = path.trim_start_matches('/');
        let path = path
            .strip_suffix(".geojson")
            .or_else(|| path.strip_suffix(".json"))
            .unwrap_or(path);

        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            [z, x, y] => TileAddress::from_path_params(z, x, y),
            _ => Err(Error::InvalidTileAddress(format!(
                "expected z/x/y, got {:?}",
                path
            ))),
        }
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.col, self.row)
    }
}

/// An axis-aligned box in geographic coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
    pub srid: i32,
}

impl BoundingBox {
    /// `[min-x, min-y, max-x, max-y]`, the GeoJSON `bbox` member.
    pub fn to_array(&self) -> [f64; 4] {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
    }

    pub fn to_rect(&self) -> geo::Rect<f64> {
        geo::Rect::new(
            geo::coord! { x: self.min_lon, y: self.min_lat },
            geo::coord! { x: self.max_lon, y: self.max_lat },
        )
    }
}

/// Converts tile corners to geographic coordinates.
pub trait TileProjection {
    /// Longitude and latitude of the top-left corner of tile (col, row) at `zoom`.
    fn coordinate_location(&self, zoom: u8, col: u32, row: u32) -> (f64, f64);

    /// Spans the tile's top-left corner to the top-left corner of the tile
    /// diagonally below and to the right of it.
    fn tile_bounds(&self, tile: TileAddress, srid: i32) -> BoundingBox {
        let (west, north) = self.coordinate_location(tile.zoom(), tile.col(), tile.row());
        let (east, south) = self.coordinate_location(tile.zoom(), tile.col() + 1, tile.row() + 1);

        BoundingBox {
            min_lon: west.min(east),
            min_lat: south.min(north),
            max_lon: west.max(east),
            max_lat: south.max(north),
            srid,
        }
    }
}

/// Spherical (web) mercator, as used by OSM-style slippy maps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SphericalMercator;

impl TileProjection for SphericalMercator {
    fn coordinate_location(&self, zoom: u8, col: u32, row: u32) -> (f64, f64) {
        slippy_map_tilenames::tile2lonlat(col, row, zoom)
    }
}

/// Projection selection for a configured layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    #[default]
    SphericalMercator,
}

impl TileProjection for Projection {
    fn coordinate_location(&self, zoom: u8, col: u32, row: u32) -> (f64, f64) {
        match self {
            Projection::SphericalMercator => SphericalMercator.coordinate_location(zoom, col, row),
        }
    }
}
