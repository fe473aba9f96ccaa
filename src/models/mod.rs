//! Data models shared across the gateway: schema metadata and the
//! request/response envelope.

pub mod query;
pub mod schema;

pub use query::{QueryRequest, QueryResponse, QueryResult, ReturnType, ValidationResult};
pub use schema::{
    ColumnInfo, DatabaseSchema, EnumTypeInfo, ForeignKeyInfo, IndexInfo, TableInfo,
};
