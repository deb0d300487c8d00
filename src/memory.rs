/// An in-process geometry store.
use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Error;
use crate::geometry::{clip_to_bbox, intersects_bbox};
use crate::record::{Record, Value};
use crate::schema::Schema;
use crate::store::{GeometryStore, SpatialQuery, INTERSECTION_FIELD};

#[derive(Clone, Debug, Default)]
struct Table {
    schema: Schema,
    records: Vec<Record>,
}

/// Holds tables in memory and answers intersects queries by scanning them.
///
/// Tables are added up front; queries only read, so a store can be shared
/// between tasks without locking.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    tables: HashMap<String, Table>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn with_table(mut self, name: &str, schema: Schema, records: Vec<Record>) -> MemoryStore {
        self.tables
            .insert(name.to_string(), Table { schema, records });
        self
    }

    pub fn insert(&mut self, table: &str, record: Record) -> Result<(), Error> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| Error::UnknownTable(table.to_string()))?
            .records
            .push(record);
        Ok(())
    }

    fn table(&self, name: &str) -> Result<&Table, Error> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }
}

#[async_trait]
impl GeometryStore for MemoryStore {
    type Table = Schema;

    async fn describe(&self, table: &str) -> Result<Schema, Error> {
        Ok(self.table(table)?.schema.clone())
    }

    fn schema<'t>(&self, table: &'t Schema) -> &'t Schema {
        table
    }

    async fn fetch_intersecting(
        &self,
        _schema: &Schema,
        query: &SpatialQuery,
    ) -> Result<Vec<Record>, Error> {
        let table = self.table(&query.table)?;

        let records = table
            .records
            .iter()
            .filter_map(|record| {
                let geometry = match record.get(&query.geometry_field) {
                    Some(Value::Geometry(geometry)) if intersects_bbox(geometry, &query.bbox) => geometry,
                    _ => return None,
                };

                let mut record = record.clone();
                if query.clip {
                    let clipped = clip_to_bbox(geometry, &query.bbox);
                    record.set(INTERSECTION_FIELD, clipped.map(Value::Geometry));
                }
                Some(record)
            })
            .collect();

        Ok(records)
    }
}
