#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid tile address: {0}")]
    InvalidTileAddress(String),
    #[error("No geometry field configured or inferable for table {0}.")]
    MissingGeometryField(String),
    #[error("Relation {0} does not resolve to a related record.")]
    UnresolvedRelation(String),
    #[error("Unsupported field kind: {0}")]
    UnsupportedFieldKind(String),
    #[error("No table named {0}.")]
    UnknownTable(String),
    #[error("No layer named {0}.")]
    UnknownLayer(String),
    #[error("Unreadable geometry: {0}")]
    Geometry(String),
    #[error("Invalid YAML in tile configuration.")]
    Config(#[from] serde_yaml::Error),
    #[error("Spatial store query failed.")]
    Database(#[from] sqlx::Error),
    #[error("GeoJSON serialization failed.")]
    Serialization(#[from] serde_json::Error),
}
