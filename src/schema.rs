/// Record schemas as reported by a geometry store.
use std::str::FromStr;

use serde::Deserialize;

use crate::error::Error;

/// Declared type of a geometry column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryType {
    Point,
    MultiPoint,
    LineString,
    MultiLineString,
    Polygon,
    MultiPolygon,
    GeometryCollection,
    Geometry,
}

impl GeometryType {
    /// Point types are never trimmed: the intersects filter already decides them.
    pub fn is_point_like(&self) -> bool {
        matches!(self, GeometryType::Point | GeometryType::MultiPoint)
    }
}

impl FromStr for GeometryType {
    type Err = Error;

    /// Accepts PostGIS / OGC names in any case. Measured and 3D suffixes
    /// (`POINTM`, `POINTZ`, `POINTZM`) map onto their 2D type.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let upper = name.trim().to_ascii_uppercase();
        let base = ["ZM", "Z", "M"]
            .iter()
            .find_map(|suffix| upper.strip_suffix(suffix))
            .filter(|base| !base.is_empty())
            .unwrap_or(upper.as_str());

        match base {
            "POINT" => Ok(GeometryType::Point),
            "MULTIPOINT" => Ok(GeometryType::MultiPoint),
            "LINESTRING" => Ok(GeometryType::LineString),
            "MULTILINESTRING" => Ok(GeometryType::MultiLineString),
            "POLYGON" => Ok(GeometryType::Polygon),
            "MULTIPOLYGON" => Ok(GeometryType::MultiPolygon),
            "GEOMETRYCOLLECTION" => Ok(GeometryType::GeometryCollection),
            "GEOMETRY" => Ok(GeometryType::Geometry),
            _ => Err(Error::UnsupportedFieldKind(format!("geometry type {}", name))),
        }
    }
}

/// How a field is represented and therefore how it is encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    Geometry(GeometryType),
    /// Many-to-one reference. `to_field` names the referenced column when it
    /// is not the related table's primary key.
    ForeignRelation {
        related: String,
        to_field: Option<String>,
    },
    /// `auto_created` is false when the link table is a model of its own; such
    /// relations are not encoded.
    ManyToMany { related: String, auto_created: bool },
}

impl FieldKind {
    /// Builds a kind from a textual tag such as `scalar`, `geometry:polygon`,
    /// `foreign:categories` or `many_to_many:tags`.
    pub fn parse(tag: &str) -> Result<FieldKind, Error> {
        let (kind, argument) = match tag.split_once(':') {
            Some((kind, argument)) => (kind.trim(), Some(argument.trim())),
            None => (tag.trim(), None),
        };

        match (kind, argument) {
            ("scalar", None) => Ok(FieldKind::Scalar),
            ("geometry", None) => Ok(FieldKind::Geometry(GeometryType::Geometry)),
            ("geometry", Some(geometry_type)) => Ok(FieldKind::Geometry(geometry_type.parse()?)),
            ("foreign", Some(related)) => {
                let (related, to_field) = match related.split_once('.') {
                    Some((related, field)) => (related, Some(field.to_string())),
                    None => (related, None),
                };
                Ok(FieldKind::ForeignRelation {
                    related: related.to_string(),
                    to_field,
                })
            }
            ("many_to_many", Some(related)) => Ok(FieldKind::ManyToMany {
                related: related.to_string(),
                auto_created: true,
            }),
            _ => Err(Error::UnsupportedFieldKind(tag.to_string())),
        }
    }

    pub fn geometry_type(&self) -> Option<GeometryType> {
        match self {
            FieldKind::Geometry(geometry_type) => Some(*geometry_type),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub primary_key: bool,
    pub serializable: bool,
}

impl FieldDescriptor {
    pub fn new(name: &str, kind: FieldKind) -> FieldDescriptor {
        FieldDescriptor {
            name: name.to_string(),
            kind,
            primary_key: false,
            serializable: true,
        }
    }

    pub fn scalar(name: &str) -> FieldDescriptor {
        FieldDescriptor::new(name, FieldKind::Scalar)
    }

    pub fn geometry(name: &str, geometry_type: GeometryType) -> FieldDescriptor {
        FieldDescriptor::new(name, FieldKind::Geometry(geometry_type))
    }

    pub fn primary_key(mut self) -> FieldDescriptor {
        self.primary_key = true;
        self
    }

    pub fn hidden(mut self) -> FieldDescriptor {
        self.serializable = false;
        self
    }
}

/// Field declarations in a YAML schema, e.g. for an in-memory store.
#[derive(Clone, Deserialize, Debug)]
pub struct FieldDeclaration {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default = "default_serializable")]
    pub serializable: bool,
}

fn default_serializable() -> bool {
    true
}

impl TryFrom<&FieldDeclaration> for FieldDescriptor {
    type Error = Error;

    fn try_from(declaration: &FieldDeclaration) -> Result<Self, Self::Error> {
        Ok(FieldDescriptor {
            name: declaration.name.clone(),
            kind: FieldKind::parse(&declaration.kind)?,
            primary_key: declaration.primary_key,
            serializable: declaration.serializable,
        })
    }
}

/// The fields of one table, in declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schema {
    pub fields: Vec<FieldDescriptor>,
}

impl Schema {
    pub fn new(fields: Vec<FieldDescriptor>) -> Schema {
        Schema { fields }
    }

    pub fn from_declarations(declarations: &[FieldDeclaration]) -> Result<Schema, Error> {
        let fields = declarations
            .iter()
            .map(FieldDescriptor::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Schema { fields })
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn primary_key(&self) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.primary_key)
    }

    /// The first geometry-typed field in declaration order.
    pub fn infer_geometry_field(&self) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|field| matches!(field.kind, FieldKind::Geometry(_)))
    }
}
