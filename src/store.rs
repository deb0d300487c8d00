/// The spatial query gateway between tile rendering and a geometry store.
use async_trait::async_trait;

use crate::error::Error;
use crate::record::Record;
use crate::schema::Schema;
use crate::tile::BoundingBox;

/// Name of the synthetic field holding a record's geometry clipped to the tile.
pub const INTERSECTION_FIELD: &str = "intersection";

/// A store of records with at least one geometry column.
///
/// Stores are shared by concurrent tile requests, so implementations must be
/// safe to query from several tasks at once.
#[async_trait]
pub trait GeometryStore: Send + Sync {
    /// What the store learns about a table when introspecting it. A request
    /// describes its table once and hands the description back to
    /// [`GeometryStore::fetch_intersecting`].
    type Table: Send + Sync;

    async fn describe(&self, table: &str) -> Result<Self::Table, Error>;

    /// The fields of a described table in declaration order.
    fn schema<'t>(&self, table: &'t Self::Table) -> &'t Schema;

    /// Returns every record of `query.table` whose geometry intersects the
    /// query's bounding box. When `query.clip` is set, each record also carries
    /// its geometry clipped to the box under [`INTERSECTION_FIELD`].
    async fn fetch_intersecting(
        &self,
        table: &Self::Table,
        query: &SpatialQuery,
    ) -> Result<Vec<Record>, Error>;
}

/// An intersects query against one geometry field.
#[derive(Clone, Debug, PartialEq)]
pub struct SpatialQuery {
    pub table: String,
    pub geometry_field: String,
    pub bbox: BoundingBox,
    pub clip: bool,
    pub use_natural_keys: bool,
}

impl SpatialQuery {
    /// Plans the query for one tile.
    ///
    /// Without an explicit `geometry_field` the first geometry field of the
    /// schema is used. Trimming is skipped for point and multi-point fields.
    pub fn plan(
        schema: &Schema,
        table: &str,
        geometry_field: Option<&str>,
        bbox: BoundingBox,
        trim_to_boundary: bool,
        use_natural_keys: bool,
    ) -> Result<SpatialQuery, Error> {
        let field = match geometry_field {
            Some(name) => schema.field(name),
            None => schema.infer_geometry_field(),
        };

        let (geometry_field, geometry_type) = field
            .and_then(|field| Some((field.name.clone(), field.kind.geometry_type()?)))
            .ok_or_else(|| match geometry_field {
                Some(name) => Error::MissingGeometryField(format!("{}.{}", table, name)),
                None => Error::MissingGeometryField(table.to_string()),
            })?;

        Ok(SpatialQuery {
            table: table.to_string(),
            geometry_field,
            bbox,
            clip: trim_to_boundary && !geometry_type.is_point_like(),
            use_natural_keys,
        })
    }

    /// The record field that holds the geometry to emit.
    pub fn output_geometry_field(&self) -> &str {
        if self.clip {
            INTERSECTION_FIELD
        } else {
            &self.geometry_field
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDescriptor, GeometryType};

    fn bbox() -> BoundingBox {
        BoundingBox {
            min_lon: 0.0,
            min_lat: 0.0,
            max_lon: 1.0,
            max_lat: 1.0,
            srid: 4326,
        }
    }

    fn schema() -> Schema {
        Schema::new(vec![
            FieldDescriptor::scalar("id").primary_key(),
            FieldDescriptor::geometry("outline", GeometryType::MultiPolygon),
            FieldDescriptor::geometry("entrance", GeometryType::Point),
        ])
    }

    #[test]
    fn test_plan_infers_first_geometry() {
        let query = SpatialQuery::plan(&schema(), "parks", None, bbox(), true, false).unwrap();
        assert_eq!("outline", query.geometry_field);
        assert!(query.clip);
        assert_eq!(INTERSECTION_FIELD, query.output_geometry_field());
    }

    #[test]
    fn test_points_are_not_trimmed() {
        let query = SpatialQuery::plan(&schema(), "parks", Some("entrance"), bbox(), true, false).unwrap();
        assert!(!query.clip);
        assert_eq!("entrance", query.output_geometry_field());
    }

    #[test]
    fn test_trimming_disabled() {
        let query = SpatialQuery::plan(&schema(), "parks", Some("outline"), bbox(), false, true).unwrap();
        assert!(!query.clip);
        assert!(query.use_natural_keys);
        assert_eq!("outline", query.output_geometry_field());
    }

    #[test]
    fn test_missing_geometry_field() {
        let flat = Schema::new(vec![FieldDescriptor::scalar("id").primary_key()]);
        assert!(matches!(
            SpatialQuery::plan(&flat, "parks", None, bbox(), true, false),
            Err(Error::MissingGeometryField(_))
        ));

        // Named fields must exist and be geometries.
        assert!(matches!(
            SpatialQuery::plan(&schema(), "parks", Some("id"), bbox(), true, false),
            Err(Error::MissingGeometryField(_))
        ));
        assert!(matches!(
            SpatialQuery::plan(&schema(), "parks", Some("shape"), bbox(), true, false),
            Err(Error::MissingGeometryField(_))
        ));
    }
}
