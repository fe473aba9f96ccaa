//! Database access: connection pooling and schema introspection.

pub mod introspection;
pub mod pool;

pub use introspection::{SchemaIntrospector, SchemaLoader};
pub use pool::ConnectionManager;
