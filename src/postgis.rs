/// PostGIS backed geometry store
///
/// Further reading: https://postgis.net/docs/reference.html
use std::collections::HashMap;

use async_trait::async_trait;
use futures::TryStreamExt;
use log::{debug, trace};
use serde::Deserialize;
use sqlx::postgres::PgRow;
use sqlx::{query, query_as, PgPool, Row};
use wkt::TryFromWkt;

use crate::error::Error;
use crate::record::{Record, RelatedRecord, Value};
use crate::schema::{FieldDescriptor, FieldKind, GeometryType, Schema};
use crate::store::{GeometryStore, SpatialQuery, INTERSECTION_FIELD};

/// A many-to-many relation stored in a link table.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct LinkTable {
    /// Name of the list-valued property on the source records.
    pub field: String,
    pub source_table: String,
    pub through: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    /// False when the link table carries data of its own; such relations are skipped.
    #[serde(default = "default_auto_created")]
    pub auto_created: bool,
}

fn default_auto_created() -> bool {
    true
}

/// Column types with a dedicated decoding. Everything else is read as text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ColumnType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Bytea,
    Json,
    Geometry,
    Other,
}

impl ColumnType {
    fn from_udt(udt_name: &str) -> ColumnType {
        match udt_name {
            "bool" => ColumnType::Bool,
            "int2" => ColumnType::Int2,
            "int4" => ColumnType::Int4,
            "int8" => ColumnType::Int8,
            "float4" => ColumnType::Float4,
            "float8" => ColumnType::Float8,
            "numeric" => ColumnType::Numeric,
            "text" | "varchar" | "bpchar" => ColumnType::Text,
            "date" => ColumnType::Date,
            "time" => ColumnType::Time,
            "timestamp" => ColumnType::Timestamp,
            "timestamptz" => ColumnType::TimestampTz,
            "uuid" => ColumnType::Uuid,
            "bytea" => ColumnType::Bytea,
            "json" | "jsonb" => ColumnType::Json,
            "geometry" => ColumnType::Geometry,
            _ => ColumnType::Other,
        }
    }
}

#[derive(Clone, Debug)]
struct Column {
    name: String,
    column_type: ColumnType,
    /// SRID declared in `geometry_columns`; 0 when unknown.
    srid: i32,
}

/// The introspected layout of a table.
#[derive(Clone, Debug)]
pub struct TableDescription {
    table: String,
    columns: Vec<Column>,
    schema: Schema,
    links: Vec<LinkTable>,
}

/// Queries a PostGIS database through a shared connection pool.
#[derive(Clone, Debug)]
pub struct PostGisStore {
    pool: PgPool,
    natural_keys: HashMap<String, Vec<String>>,
    link_tables: Vec<LinkTable>,
}

/// Adds the default `public` schema to unqualified table names.
pub fn qualify(table: &str) -> String {
    if table.contains('.') {
        table.to_string()
    } else {
        format!("public.{}", table)
    }
}

fn split_table(table: &str) -> (String, String) {
    let qualified = qualify(table);
    match qualified.split_once('.') {
        Some((schema, name)) => (schema.to_string(), name.to_string()),
        None => ("public".to_string(), qualified),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_table(table: &str) -> String {
    let (schema, name) = split_table(table);
    format!("{}.{}", quote_ident(&schema), quote_ident(&name))
}

const COLUMNS_SQL: &str = "SELECT column_name::text, udt_name::text \
    FROM information_schema.columns \
    WHERE table_schema = $1 AND table_name = $2 \
    ORDER BY ordinal_position";

const GEOMETRY_COLUMNS_SQL: &str = "SELECT f_geometry_column::text, type::text, srid \
    FROM geometry_columns \
    WHERE f_table_schema = $1 AND f_table_name = $2";

const PRIMARY_KEY_SQL: &str = "SELECT kcu.column_name::text \
    FROM information_schema.table_constraints tc \
    JOIN information_schema.key_column_usage kcu \
      ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
    WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = $1 AND tc.table_name = $2 \
    ORDER BY kcu.ordinal_position";

const FOREIGN_KEYS_SQL: &str = "SELECT kcu.column_name::text, ccu.table_schema::text, \
      ccu.table_name::text, ccu.column_name::text, \
      EXISTS (SELECT 1 FROM information_schema.table_constraints rtc \
        JOIN information_schema.key_column_usage rkcu \
          ON rtc.constraint_name = rkcu.constraint_name AND rtc.table_schema = rkcu.table_schema \
        WHERE rtc.constraint_type = 'PRIMARY KEY' AND rtc.table_schema = ccu.table_schema \
          AND rtc.table_name = ccu.table_name AND rkcu.column_name = ccu.column_name) \
    FROM information_schema.table_constraints tc \
    JOIN information_schema.key_column_usage kcu \
      ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
    JOIN information_schema.constraint_column_usage ccu \
      ON tc.constraint_name = ccu.constraint_name AND tc.table_schema = ccu.constraint_schema \
    WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1 AND tc.table_name = $2";

impl PostGisStore {
    pub fn new(pool: PgPool) -> PostGisStore {
        PostGisStore {
            pool,
            natural_keys: HashMap::new(),
            link_tables: Vec::new(),
        }
    }

    /// Declares the columns forming the natural key of `table`.
    pub fn with_natural_key(mut self, table: &str, columns: Vec<String>) -> PostGisStore {
        self.natural_keys.insert(qualify(table), columns);
        self
    }

    pub fn with_link_table(mut self, link: LinkTable) -> PostGisStore {
        self.link_tables.push(LinkTable {
            source_table: qualify(&link.source_table),
            target_table: qualify(&link.target_table),
            ..link
        });
        self
    }

    async fn primary_key(&self, table: &str) -> Result<Option<String>, Error> {
        let (schema, name) = split_table(table);
        let key: Option<(String,)> = query_as(PRIMARY_KEY_SQL)
            .bind(schema)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(key.map(|(column,)| column))
    }

    async fn introspect(&self, table: &str) -> Result<TableDescription, Error> {
        let table = qualify(table);
        let (schema_name, name) = split_table(&table);

        let columns: Vec<(String, String)> = query_as(COLUMNS_SQL)
            .bind(&schema_name)
            .bind(&name)
            .fetch_all(&self.pool)
            .await?;
        if columns.is_empty() {
            return Err(Error::UnknownTable(table));
        }

        let geometry_columns: Vec<(String, String, i32)> = query_as(GEOMETRY_COLUMNS_SQL)
            .bind(&schema_name)
            .bind(&name)
            .fetch_all(&self.pool)
            .await?;
        let geometry_columns: HashMap<String, (String, i32)> = geometry_columns
            .into_iter()
            .map(|(column, geometry_type, srid)| (column, (geometry_type, srid)))
            .collect();

        let primary_key = self.primary_key(&table).await?;

        let foreign_keys: Vec<(String, String, String, String, bool)> = query_as(FOREIGN_KEYS_SQL)
            .bind(&schema_name)
            .bind(&name)
            .fetch_all(&self.pool)
            .await?;
        let mut relations: HashMap<String, FieldKind> = foreign_keys
            .into_iter()
            .map(|(column, related_schema, related_name, related_column, targets_primary_key)| {
                let kind = FieldKind::ForeignRelation {
                    related: format!("{}.{}", related_schema, related_name),
                    to_field: (!targets_primary_key).then_some(related_column),
                };
                (column, kind)
            })
            .collect();

        let mut fields = Vec::with_capacity(columns.len());
        let mut described = Vec::with_capacity(columns.len());
        for (column, udt_name) in columns {
            let column_type = ColumnType::from_udt(&udt_name);
            let (kind, srid) = match (column_type, geometry_columns.get(&column)) {
                (ColumnType::Geometry, Some((geometry_type, srid))) => {
                    (FieldKind::Geometry(geometry_type.parse()?), *srid)
                }
                (ColumnType::Geometry, None) => (FieldKind::Geometry(GeometryType::Geometry), 0),
                _ => (relations.remove(&column).unwrap_or(FieldKind::Scalar), 0),
            };

            let mut field = FieldDescriptor::new(&column, kind);
            field.primary_key = primary_key.as_deref() == Some(column.as_str());
            fields.push(field);
            described.push(Column {
                name: column,
                column_type,
                srid,
            });
        }

        let links: Vec<LinkTable> = self
            .link_tables
            .iter()
            .filter(|link| link.source_table == table)
            .cloned()
            .collect();
        for link in &links {
            fields.push(FieldDescriptor::new(
                &link.field,
                FieldKind::ManyToMany {
                    related: link.target_table.clone(),
                    auto_created: link.auto_created,
                },
            ));
        }

        Ok(TableDescription {
            table,
            columns: described,
            schema: Schema::new(fields),
            links,
        })
    }

    /// Resolves natural keys of the related records referenced by `field`.
    async fn attach_natural_keys(
        &self,
        records: &mut [Record],
        field: &str,
        related_table: &str,
        to_field: Option<&str>,
    ) -> Result<(), Error> {
        let columns = match self.natural_keys.get(related_table) {
            Some(columns) => columns,
            None => return Ok(()),
        };
        let key_column = match to_field {
            Some(column) => column.to_string(),
            None => match self.primary_key(related_table).await? {
                Some(column) => column,
                None => return Ok(()),
            },
        };

        let mut keys: Vec<String> = records
            .iter()
            .filter_map(|record| match record.get(field) {
                Some(Value::Related(Some(related))) => related.referenced(to_field).map(key_text),
                _ => None,
            })
            .collect();
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Ok(());
        }

        let sql = natural_key_sql(related_table, &key_column, columns);
        trace!("{}", sql);
        let natural_keys: Vec<(String, String)> =
            query_as(&sql).bind(keys).fetch_all(&self.pool).await?;
        let natural_keys: HashMap<String, Vec<Value>> = natural_keys
            .into_iter()
            .map(|(key, natural_key)| Ok((key, parse_natural_key(&natural_key)?)))
            .collect::<Result<_, Error>>()?;

        for record in records.iter_mut() {
            let reference = match record.values.get_mut(field) {
                Some(Value::Related(reference)) => reference,
                _ => continue,
            };
            let key = match reference.as_deref().and_then(|related| related.referenced(to_field)) {
                Some(value) => key_text(value),
                None => continue,
            };

            if let Some(related) = reference.as_mut() {
                let natural_key = natural_keys.get(&key).cloned();
                if natural_key.is_none() {
                    debug!("{} = {} has no row in {}", field, key, related_table);
                }
                attach_natural_key(related, natural_key);
            }
        }

        Ok(())
    }

    /// Fills the list-valued property of a many-to-many relation.
    async fn attach_links(
        &self,
        records: &mut [Record],
        primary_key: &str,
        link: &LinkTable,
        use_natural_keys: bool,
    ) -> Result<(), Error> {
        let keys: Vec<String> = records
            .iter()
            .filter_map(|record| record.get(primary_key).map(key_text))
            .collect();

        let natural_key = match (use_natural_keys, self.natural_keys.get(&link.target_table)) {
            (true, Some(columns)) => match self.primary_key(&link.target_table).await? {
                Some(target_key) => Some((target_key, columns.as_slice())),
                None => None,
            },
            _ => None,
        };

        let sql = link_sql(link, natural_key.as_ref().map(|(key, columns)| (key.as_str(), *columns)));
        trace!("{}", sql);

        let mut members: HashMap<String, Vec<RelatedRecord>> = HashMap::new();
        let mut rows = query(&sql).bind(keys).fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            let source: String = row.try_get(0)?;
            let target: String = row.try_get(1)?;
            let target: serde_json::Value = serde_json::from_str(&target)?;

            let mut member = RelatedRecord::with_primary_key(Value::from(&target));
            if natural_key.is_some() {
                let natural: Option<String> = row.try_get(2)?;
                let natural = natural.as_deref().map(parse_natural_key).transpose()?;
                attach_natural_key(&mut member, natural);
            }
            members.entry(source).or_default().push(member);
        }

        for record in records.iter_mut() {
            let list = record
                .get(primary_key)
                .map(key_text)
                .and_then(|key| members.remove(&key))
                .unwrap_or_default();
            record.set(&link.field, Value::RelatedMany(list));
        }

        Ok(())
    }
}

/// Attaches a looked-up natural key. Without one the related row is gone, so
/// the reference is emptied and the encoder reports it as dangling.
fn attach_natural_key(related: &mut RelatedRecord, natural_key: Option<Vec<Value>>) {
    match natural_key {
        Some(natural_key) => related.natural_key = Some(natural_key),
        None => *related = RelatedRecord::default(),
    }
}

/// Postgres' text rendering of a key value, used to match keys across queries.
fn key_text(value: &Value) -> String {
    match value.to_property() {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    }
}

fn parse_natural_key(text: &str) -> Result<Vec<Value>, Error> {
    let parts: Vec<serde_json::Value> = serde_json::from_str(text)?;
    Ok(parts.iter().map(Value::from).collect())
}

fn natural_key_sql(table: &str, key_column: &str, columns: &[String]) -> String {
    let key = quote_ident(key_column);
    let natural: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "SELECT {key}::text, json_build_array({natural})::text FROM {table} WHERE {key}::text = ANY($1::text[])",
        key = key,
        natural = natural.join(", "),
        table = quote_table(table),
    )
}

fn link_sql(link: &LinkTable, natural_key: Option<(&str, &[String])>) -> String {
    let source = format!("l.{}", quote_ident(&link.source_column));
    let target = format!("l.{}", quote_ident(&link.target_column));

    let (natural, join) = match natural_key {
        Some((target_key, columns)) => {
            let columns: Vec<String> = columns
                .iter()
                .map(|c| format!("t.{}", quote_ident(c)))
                .collect();
            (
                format!(", json_build_array({})::text", columns.join(", ")),
                format!(
                    " LEFT JOIN {} t ON t.{} = {}",
                    quote_table(&link.target_table),
                    quote_ident(target_key),
                    target
                ),
            )
        }
        None => (String::new(), String::new()),
    };

    format!(
        "SELECT {source}::text, to_json({target})::text{natural} FROM {through} l{join} \
         WHERE {source}::text = ANY($1::text[]) ORDER BY {source}, {target}",
        source = source,
        target = target,
        natural = natural,
        through = quote_table(&link.through),
        join = join,
    )
}

/// Output form of a geometry expression: WKT in the requested SRID, `NULL` when empty.
fn geometry_output(expression: &str, column_srid: i32) -> String {
    let projected = if column_srid == 0 {
        expression.to_string()
    } else {
        format!("ST_Transform({}, $5)", expression)
    };
    format!(
        "CASE WHEN {e} IS NULL OR ST_IsEmpty({e}) THEN NULL ELSE ST_AsText({p}) END",
        e = expression,
        p = projected
    )
}

/// The query envelope in the SRID of the geometry column.
fn envelope(column_srid: i32) -> String {
    let envelope = "ST_MakeEnvelope($1, $2, $3, $4, $5)";
    if column_srid == 0 {
        envelope.to_string()
    } else {
        format!("ST_Transform({}, {})", envelope, column_srid)
    }
}

fn select_sql(description: &TableDescription, spatial: &SpatialQuery) -> Result<String, Error> {
    let geometry = description
        .columns
        .iter()
        .find(|column| column.name == spatial.geometry_field)
        .ok_or_else(|| {
            Error::MissingGeometryField(format!("{}.{}", description.table, spatial.geometry_field))
        })?;
    // Columns without a declared SRID are taken to be in the requested one.
    let geometry_column = if geometry.srid == 0 {
        format!("ST_SetSRID({}, $5)", quote_ident(&geometry.name))
    } else {
        quote_ident(&geometry.name)
    };
    let envelope = envelope(geometry.srid);

    let mut select: Vec<String> = description
        .columns
        .iter()
        .map(|column| {
            let name = quote_ident(&column.name);
            match column.column_type {
                ColumnType::Geometry => format!("{} AS {}", geometry_output(&name, column.srid), name),
                ColumnType::Numeric | ColumnType::Json | ColumnType::Other => {
                    format!("{}::text AS {}", name, name)
                }
                _ => name,
            }
        })
        .collect();

    if spatial.clip {
        let intersection = format!("ST_Intersection({}, {})", geometry_column, envelope);
        select.push(format!(
            "{} AS {}",
            geometry_output(&intersection, geometry.srid),
            quote_ident(INTERSECTION_FIELD)
        ));
    }

    Ok(format!(
        "SELECT {} FROM {} WHERE ST_Intersects({}, {})",
        select.join(", "),
        quote_table(&description.table),
        geometry_column,
        envelope
    ))
}

fn decode_column(row: &PgRow, index: usize, column_type: ColumnType) -> Result<Value, Error> {
    let value: Value = match column_type {
        ColumnType::Bool => row.try_get::<Option<bool>, _>(index)?.into(),
        ColumnType::Int2 => row.try_get::<Option<i16>, _>(index)?.map(|v| Value::Int(v.into())).into(),
        ColumnType::Int4 => row.try_get::<Option<i32>, _>(index)?.into(),
        ColumnType::Int8 => row.try_get::<Option<i64>, _>(index)?.into(),
        ColumnType::Float4 => row.try_get::<Option<f32>, _>(index)?.map(|v| Value::Float(v.into())).into(),
        ColumnType::Float8 => row.try_get::<Option<f64>, _>(index)?.into(),
        ColumnType::Numeric => row.try_get::<Option<String>, _>(index)?.map(Value::Decimal).into(),
        ColumnType::Text | ColumnType::Other => row.try_get::<Option<String>, _>(index)?.map(Value::Text).into(),
        ColumnType::Date => row.try_get::<Option<chrono::NaiveDate>, _>(index)?.map(Value::Date).into(),
        ColumnType::Time => row.try_get::<Option<chrono::NaiveTime>, _>(index)?.map(Value::Time).into(),
        ColumnType::Timestamp => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)?
            .map(Value::NaiveDateTime)
            .into(),
        ColumnType::TimestampTz => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)?
            .map(Value::DateTime)
            .into(),
        ColumnType::Uuid => row.try_get::<Option<uuid::Uuid>, _>(index)?.map(Value::Uuid).into(),
        ColumnType::Bytea => row.try_get::<Option<Vec<u8>>, _>(index)?.map(Value::Bytes).into(),
        ColumnType::Json => match row.try_get::<Option<String>, _>(index)? {
            Some(text) => Value::Json(serde_json::from_str(&text)?),
            None => Value::Null,
        },
        ColumnType::Geometry => decode_geometry(row.try_get(index)?)?,
    };
    Ok(value)
}

fn decode_geometry(wkt: Option<String>) -> Result<Value, Error> {
    match wkt {
        Some(wkt) => geo::Geometry::try_from_wkt_str(&wkt)
            .map(Value::Geometry)
            .map_err(|e| Error::Geometry(format!("{}: {}", e, wkt))),
        None => Ok(Value::Null),
    }
}

/// Wraps the raw value of a foreign key column as a reference.
fn reference(value: Value, to_field: Option<&str>) -> Value {
    match (value, to_field) {
        (Value::Null, _) => Value::Related(None),
        (value, None) => RelatedRecord::with_primary_key(value).into(),
        (value, Some(field)) => RelatedRecord::default().with_field(field, value).into(),
    }
}

#[async_trait]
impl GeometryStore for PostGisStore {
    type Table = TableDescription;

    async fn describe(&self, table: &str) -> Result<TableDescription, Error> {
        self.introspect(table).await
    }

    fn schema<'t>(&self, table: &'t TableDescription) -> &'t Schema {
        &table.schema
    }

    async fn fetch_intersecting(
        &self,
        description: &TableDescription,
        spatial: &SpatialQuery,
    ) -> Result<Vec<Record>, Error> {
        let sql = select_sql(description, spatial)?;
        trace!("{}", sql);

        let bbox = spatial.bbox;
        let mut records = Vec::new();
        let mut rows = query(&sql)
            .bind(bbox.min_lon)
            .bind(bbox.min_lat)
            .bind(bbox.max_lon)
            .bind(bbox.max_lat)
            .bind(bbox.srid)
            .fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            let mut record = Record::new();
            for (index, (column, field)) in description
                .columns
                .iter()
                .zip(description.schema.fields.iter())
                .enumerate()
            {
                let value = decode_column(&row, index, column.column_type)?;
                let value = match &field.kind {
                    FieldKind::ForeignRelation { to_field, .. } => reference(value, to_field.as_deref()),
                    _ => value,
                };
                record.set(&column.name, value);
            }
            if spatial.clip {
                let clipped = decode_geometry(row.try_get(description.columns.len())?)?;
                record.set(INTERSECTION_FIELD, clipped);
            }
            records.push(record);
        }

        if spatial.use_natural_keys {
            for field in &description.schema.fields {
                if let FieldKind::ForeignRelation { related, to_field } = &field.kind {
                    self.attach_natural_keys(&mut records, &field.name, related, to_field.as_deref())
                        .await?;
                }
            }
        }

        if let Some(primary_key) = description.schema.primary_key() {
            for link in description.links.iter().filter(|link| link.auto_created) {
                self.attach_links(&mut records, &primary_key.name, link, spatial.use_natural_keys)
                    .await?;
            }
        }

        debug!("{} records from {} intersect {:?}", records.len(), description.table, bbox);
        Ok(records)
    }
}
