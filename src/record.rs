/// Records returned by a geometry store and their attribute values.
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A single attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary precision number in its canonical decimal text.
    Decimal(String),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(DateTime<Utc>),
    NaiveDateTime(NaiveDateTime),
    Uuid(Uuid),
    Bytes(Vec<u8>),
    Json(JsonValue),
    Geometry(geo::Geometry<f64>),
    /// A many-to-one reference. `None` when the reference is null.
    Related(Option<Box<RelatedRecord>>),
    RelatedMany(Vec<RelatedRecord>),
}

/// The parts of a related record needed to represent a reference to it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RelatedRecord {
    pub primary_key: Option<Box<Value>>,
    /// Other referenced columns, for relations that do not target the primary key.
    pub fields: IndexMap<String, Value>,
    pub natural_key: Option<Vec<Value>>,
}

impl RelatedRecord {
    pub fn with_primary_key(value: Value) -> RelatedRecord {
        RelatedRecord {
            primary_key: Some(Box::new(value)),
            ..RelatedRecord::default()
        }
    }

    pub fn with_field(mut self, name: &str, value: Value) -> RelatedRecord {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn with_natural_key(mut self, natural_key: Vec<Value>) -> RelatedRecord {
        self.natural_key = Some(natural_key);
        self
    }

    /// The referenced column value: the primary key when `to_field` is `None`.
    pub fn referenced(&self, to_field: Option<&str>) -> Option<&Value> {
        match to_field {
            None => self.primary_key.as_deref(),
            Some(name) => self.fields.get(name),
        }
    }
}

impl Value {
    /// Renders the value as a GeoJSON property.
    ///
    /// Primitive values keep their JSON type. Decimals and temporal values use
    /// locale independent canonical text; anything else becomes its string form.
    /// Geometries and relations have dedicated encodings and render as `null` here.
    pub fn to_property(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(value) => JsonValue::Bool(*value),
            Value::Int(value) => JsonValue::from(*value),
            Value::Float(value) => serde_json::Number::from_f64(*value)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Decimal(value) | Value::Text(value) => JsonValue::String(value.clone()),
            Value::Date(value) => JsonValue::String(value.format("%Y-%m-%d").to_string()),
            Value::Time(value) => JsonValue::String(format_time(value)),
            Value::DateTime(value) => JsonValue::String(format_datetime(value)),
            Value::NaiveDateTime(value) => JsonValue::String(format!(
                "{}T{}",
                value.date().format("%Y-%m-%d"),
                format_time(&value.time())
            )),
            Value::Uuid(value) => JsonValue::String(value.hyphenated().to_string()),
            Value::Bytes(value) => JsonValue::String(value.iter().map(|b| format!("{:02x}", b)).collect()),
            Value::Json(value) => JsonValue::String(value.to_string()),
            Value::Geometry(_) | Value::Related(_) | Value::RelatedMany(_) => JsonValue::Null,
        }
    }
}

// Fractional seconds are written only when present, in groups of 3, 6 or 9
// digits as needed to keep the value exact.
fn format_time(time: &NaiveTime) -> String {
    time.format("%H:%M:%S%.f").to_string()
}

fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl From<&JsonValue> for Value {
    fn from(json: &JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(value) => Value::Bool(*value),
            JsonValue::Number(number) => match number.as_i64() {
                Some(value) => Value::Int(value),
                None => number.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            JsonValue::String(value) => Value::Text(value.clone()),
            other => Value::Json(other.clone()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One row of a geometry store, keyed by field name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    pub values: IndexMap<String, Value>,
}

impl Record {
    pub fn new() -> Record {
        Record::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Record {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.values.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

impl From<geo::Geometry<f64>> for Value {
    fn from(value: geo::Geometry<f64>) -> Self {
        Value::Geometry(value)
    }
}

impl From<RelatedRecord> for Value {
    fn from(value: RelatedRecord) -> Self {
        Value::Related(Some(Box::new(value)))
    }
}
