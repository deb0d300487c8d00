/// Encoding of store records as GeoJSON features.
use indexmap::IndexMap;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::Error;
use crate::geometry;
use crate::record::{Record, RelatedRecord, Value};
use crate::schema::{FieldDescriptor, FieldKind, Schema};

/// Selects, and optionally renames, the fields emitted as properties.
///
/// In YAML a list selects fields under their own names and a mapping renames
/// them: `properties: [name, category]` or `properties: {name: title}`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PropertyProjection {
    Fields(Vec<String>),
    Rename(IndexMap<String, String>),
}

impl PropertyProjection {
    /// The property name for `field`, or `None` when the field is not selected.
    pub fn output_name<'a>(&'a self, field: &'a str) -> Option<&'a str> {
        match self {
            PropertyProjection::Fields(fields) => fields
                .iter()
                .find(|name| name.as_str() == field)
                .map(String::as_str),
            PropertyProjection::Rename(names) => names.get(field).map(String::as_str),
        }
    }
}

/// Per-request encoding options.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EncodeOptions {
    /// Field whose geometry becomes the feature geometry.
    pub geometry_field: String,
    /// Overrides the schema's primary key as the feature id.
    pub primary_key: Option<String>,
    pub properties: Option<PropertyProjection>,
    /// Represent related records by their natural key where one is known.
    pub use_natural_keys: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Feature {
    #[serde(rename = "type")]
    feature_type: &'static str,
    pub id: JsonValue,
    #[serde(serialize_with = "geometry::serialize_optional")]
    pub geometry: Option<geo::Geometry<f64>>,
    pub properties: Map<String, JsonValue>,
}

impl Feature {
    pub fn new(id: JsonValue, geometry: Option<geo::Geometry<f64>>) -> Feature {
        Feature {
            feature_type: "Feature",
            id,
            geometry,
            properties: Map::new(),
        }
    }
}

/// Turns records of one schema into features.
///
/// The encoder only borrows its schema and options, so a fresh one per
/// request costs nothing and nothing carries over between requests.
pub struct FeatureEncoder<'a> {
    schema: &'a Schema,
    options: &'a EncodeOptions,
    primary_key: Option<&'a str>,
}

impl<'a> FeatureEncoder<'a> {
    pub fn new(schema: &'a Schema, options: &'a EncodeOptions) -> FeatureEncoder<'a> {
        let primary_key = options
            .primary_key
            .as_deref()
            .or_else(|| schema.primary_key().map(|field| field.name.as_str()));

        FeatureEncoder {
            schema,
            options,
            primary_key,
        }
    }

    pub fn encode(&self, record: &Record) -> Result<Feature, Error> {
        let id = self
            .primary_key
            .and_then(|key| record.get(key))
            .map(Value::to_property)
            .unwrap_or(JsonValue::Null);

        // Only the designated geometry is kept, whatever other geometries the record holds.
        let geometry = match record.get(&self.options.geometry_field) {
            Some(Value::Geometry(geometry)) => Some(geometry.clone()),
            _ => None,
        };

        let mut feature = Feature::new(id, geometry);
        for field in &self.schema.fields {
            if let Some((name, property)) = self.encode_field(record, field)? {
                feature.properties.insert(name.to_string(), property);
            }
        }

        Ok(feature)
    }

    fn encode_field(
        &self,
        record: &Record,
        field: &'a FieldDescriptor,
    ) -> Result<Option<(&'a str, JsonValue)>, Error> {
        // The primary key is carried as the feature id only.
        if self.primary_key == Some(field.name.as_str()) {
            return Ok(None);
        }
        if !(field.serializable || field.primary_key) {
            return Ok(None);
        }

        let name = match &self.options.properties {
            None => field.name.as_str(),
            Some(projection) => match projection.output_name(&field.name) {
                Some(name) => name,
                None => return Ok(None),
            },
        };

        let value = record.get(&field.name).unwrap_or(&Value::Null);
        let property = match &field.kind {
            FieldKind::Geometry(_) => return Ok(None),
            FieldKind::Scalar => scalar(field, value)?,
            FieldKind::ForeignRelation { to_field, .. } => {
                recover(&field.name, self.foreign(field, value, to_field.as_deref()))?
            }
            FieldKind::ManyToMany { auto_created, .. } => {
                if !auto_created {
                    return Ok(None);
                }
                self.many_to_many(field, value)?
            }
        };

        Ok(Some((name, property)))
    }

    fn foreign(
        &self,
        field: &FieldDescriptor,
        value: &Value,
        to_field: Option<&str>,
    ) -> Result<JsonValue, Error> {
        match value {
            Value::Null | Value::Related(None) => Ok(JsonValue::Null),
            Value::Related(Some(related)) => self.reference(&field.name, related, to_field),
            Value::RelatedMany(_) | Value::Geometry(_) => Err(mismatch(field, value)),
            // Stores may hand over the referenced value itself.
            other => Ok(other.to_property()),
        }
    }

    fn many_to_many(&self, field: &FieldDescriptor, value: &Value) -> Result<JsonValue, Error> {
        let members = match value {
            Value::Null => return Ok(JsonValue::Array(Vec::new())),
            Value::RelatedMany(members) => members,
            other => return Err(mismatch(field, other)),
        };

        members
            .iter()
            .map(|member| recover(&field.name, self.reference(&field.name, member, None)))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array)
    }

    fn reference(
        &self,
        name: &str,
        related: &RelatedRecord,
        to_field: Option<&str>,
    ) -> Result<JsonValue, Error> {
        if self.options.use_natural_keys {
            if let Some(natural_key) = &related.natural_key {
                return Ok(JsonValue::Array(
                    natural_key.iter().map(Value::to_property).collect(),
                ));
            }
        }

        related
            .referenced(to_field)
            .map(Value::to_property)
            .ok_or_else(|| Error::UnresolvedRelation(name.to_string()))
    }
}

fn scalar(field: &FieldDescriptor, value: &Value) -> Result<JsonValue, Error> {
    match value {
        Value::Geometry(_) | Value::Related(_) | Value::RelatedMany(_) => Err(mismatch(field, value)),
        value => Ok(value.to_property()),
    }
}

fn mismatch(field: &FieldDescriptor, value: &Value) -> Error {
    Error::UnsupportedFieldKind(format!(
        "{} is declared {:?} but holds {}",
        field.name,
        field.kind,
        match value {
            Value::Geometry(_) => "a geometry",
            Value::Related(_) => "a relation",
            Value::RelatedMany(_) => "a list of relations",
            _ => "a scalar",
        }
    ))
}

/// A dangling reference degrades to `null` instead of failing the feature.
fn recover(name: &str, result: Result<JsonValue, Error>) -> Result<JsonValue, Error> {
    match result {
        Err(Error::UnresolvedRelation(_)) => {
            warn!("Relation {} is dangling, emitting null", name);
            Ok(JsonValue::Null)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use geo::{point, Geometry};
    use serde_json::json;

    use super::*;
    use crate::schema::GeometryType;

    fn schema() -> Schema {
        Schema::new(vec![
            FieldDescriptor::scalar("id").primary_key(),
            FieldDescriptor::scalar("name"),
            FieldDescriptor::scalar("category"),
            FieldDescriptor::scalar("secret").hidden(),
            FieldDescriptor::geometry("geom", GeometryType::Point),
            FieldDescriptor::geometry("label_point", GeometryType::Point),
        ])
    }

    fn record() -> Record {
        Record::new()
            .with("id", 7)
            .with("name", "Park A")
            .with("category", "river")
            .with("secret", "hunter2")
            .with("geom", Geometry::Point(point!(x: 1.0, y: 2.0)))
            .with("label_point", Geometry::Point(point!(x: 3.0, y: 4.0)))
    }

    fn options(properties: Option<PropertyProjection>) -> EncodeOptions {
        EncodeOptions {
            geometry_field: "geom".to_string(),
            properties,
            ..EncodeOptions::default()
        }
    }

    fn encode(schema: &Schema, options: &EncodeOptions, record: &Record) -> JsonValue {
        let feature = FeatureEncoder::new(schema, options).encode(record).unwrap();
        serde_json::to_value(feature).unwrap()
    }

    #[test]
    fn test_all_fields_without_projection() {
        let feature = encode(&schema(), &options(None), &record());

        assert_eq!(
            json!({
                "type": "Feature",
                "id": 7,
                "geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
                "properties": {"name": "Park A", "category": "river"}
            }),
            feature
        );
    }

    #[test]
    fn test_rename_projection() {
        let projection = PropertyProjection::Rename(IndexMap::from([(
            "name".to_string(),
            "title".to_string(),
        )]));
        let feature = encode(&schema(), &options(Some(projection)), &record());
        assert_eq!(json!({"title": "Park A"}), feature["properties"]);
    }

    #[test]
    fn test_field_list_projection() {
        let projection = PropertyProjection::Fields(vec!["category".to_string(), "id".to_string()]);
        let feature = encode(&schema(), &options(Some(projection)), &record());

        // Listing the primary key has no effect.
        assert_eq!(json!({"category": "river"}), feature["properties"]);
        assert_eq!(json!(7), feature["id"]);
    }

    #[test]
    fn test_empty_projection_selects_nothing() {
        let feature = encode(&schema(), &options(Some(PropertyProjection::Fields(Vec::new()))), &record());
        assert_eq!(json!({}), feature["properties"]);
    }

    #[test]
    fn test_primary_key_override() {
        let mut options = options(None);
        options.primary_key = Some("name".to_string());
        let feature = encode(&schema(), &options, &record());

        assert_eq!(json!("Park A"), feature["id"]);
        // The schema's own key is re-included once it is no longer the id.
        assert_eq!(json!({"id": 7, "category": "river"}), feature["properties"]);
    }

    #[test]
    fn test_missing_geometry_is_null() {
        let mut options = options(None);
        options.geometry_field = "intersection".to_string();
        let feature = encode(&schema(), &options, &record());
        assert_eq!(JsonValue::Null, feature["geometry"]);
    }

    #[test]
    fn test_projection_from_yaml() {
        let fields: PropertyProjection = serde_yaml::from_str("[name, category]").unwrap();
        assert_eq!(
            PropertyProjection::Fields(vec!["name".to_string(), "category".to_string()]),
            fields
        );

        let rename: PropertyProjection = serde_yaml::from_str("{name: title}").unwrap();
        assert_eq!(Some("title"), rename.output_name("name"));
        assert_eq!(None, rename.output_name("category"));
    }

    fn relation_schema() -> Schema {
        Schema::new(vec![
            FieldDescriptor::scalar("id").primary_key(),
            FieldDescriptor::geometry("geom", GeometryType::Polygon),
            FieldDescriptor::new(
                "category",
                FieldKind::ForeignRelation {
                    related: "categories".to_string(),
                    to_field: None,
                },
            ),
            FieldDescriptor::new(
                "operator",
                FieldKind::ForeignRelation {
                    related: "operators".to_string(),
                    to_field: Some("code".to_string()),
                },
            ),
            FieldDescriptor::new(
                "tags",
                FieldKind::ManyToMany {
                    related: "tags".to_string(),
                    auto_created: true,
                },
            ),
            FieldDescriptor::new(
                "visits",
                FieldKind::ManyToMany {
                    related: "visitors".to_string(),
                    auto_created: false,
                },
            ),
        ])
    }

    fn relation_record() -> Record {
        Record::new()
            .with("id", 1)
            .with(
                "category",
                RelatedRecord::with_primary_key(Value::Int(3)).with_natural_key(vec!["parks".into()]),
            )
            .with(
                "operator",
                RelatedRecord::with_primary_key(Value::Int(9)).with_field("code", "NPS".into()),
            )
            .with(
                "tags",
                Value::RelatedMany(vec![
                    RelatedRecord::with_primary_key(Value::Int(4)).with_natural_key(vec!["shade".into()]),
                    RelatedRecord::with_primary_key(Value::Int(5)),
                ]),
            )
            .with("visits", Value::RelatedMany(vec![RelatedRecord::with_primary_key(Value::Int(1))]))
    }

    #[test]
    fn test_relations_by_referenced_field() {
        let options = EncodeOptions {
            geometry_field: "geom".to_string(),
            ..EncodeOptions::default()
        };
        let feature = encode(&relation_schema(), &options, &relation_record());

        assert_eq!(
            json!({"category": 3, "operator": "NPS", "tags": [4, 5]}),
            feature["properties"]
        );
    }

    #[test]
    fn test_relations_by_natural_key() {
        let options = EncodeOptions {
            geometry_field: "geom".to_string(),
            use_natural_keys: true,
            ..EncodeOptions::default()
        };
        let feature = encode(&relation_schema(), &options, &relation_record());

        assert_eq!(
            json!({"category": ["parks"], "operator": "NPS", "tags": [["shade"], 5]}),
            feature["properties"]
        );
    }

    #[test]
    fn test_relation_renaming() {
        let options = EncodeOptions {
            geometry_field: "geom".to_string(),
            properties: Some(PropertyProjection::Rename(IndexMap::from([(
                "category".to_string(),
                "kind".to_string(),
            )]))),
            ..EncodeOptions::default()
        };
        let feature = encode(&relation_schema(), &options, &relation_record());
        assert_eq!(json!({"kind": 3}), feature["properties"]);
    }

    #[test_log::test]
    fn test_dangling_relations_become_null() {
        let record = Record::new()
            .with("id", 2)
            .with("category", Value::Related(None))
            .with("operator", RelatedRecord::with_primary_key(Value::Int(9)))
            .with("tags", Value::RelatedMany(vec![RelatedRecord::default()]));
        let options = EncodeOptions {
            geometry_field: "geom".to_string(),
            ..EncodeOptions::default()
        };
        let feature = encode(&relation_schema(), &options, &record);

        assert_eq!(
            json!({"category": null, "operator": null, "tags": [null]}),
            feature["properties"]
        );
    }

    #[test]
    fn test_kind_mismatch_is_fatal() {
        let record = Record::new()
            .with("id", 7)
            .with("name", RelatedRecord::with_primary_key(Value::Int(1)));
        let options = options(None);
        let result = FeatureEncoder::new(&schema(), &options).encode(&record);
        assert!(matches!(result, Err(Error::UnsupportedFieldKind(_))));
    }
}
