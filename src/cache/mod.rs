//! TTL caching of introspected schemas.

pub mod schema_cache;

pub use schema_cache::{SchemaCache, SchemaCacheSnapshot};
