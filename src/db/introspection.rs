//! PostgreSQL schema introspection via the system catalogs.
//!
//! Reads tables, views, columns, constraints, indexes and enum types into a
//! [`DatabaseSchema`]. The catalog queries intentionally avoid
//! `information_schema` views in favor of `pg_catalog` directly, which is
//! both faster and unaffected by the caller's privileges on the underlying
//! objects' schemas.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::Client;

use crate::db::ConnectionManager;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{
    ColumnInfo, DatabaseSchema, EnumTypeInfo, ForeignKeyInfo, IndexInfo, TableInfo,
};

/// Capability to produce a fresh schema for a configured database.
///
/// The cache depends on this trait rather than the concrete introspector so
/// tests can substitute canned schemas.
#[async_trait]
pub trait SchemaLoader: Send + Sync {
    async fn load_schema(&self, database: &str) -> GatewayResult<DatabaseSchema>;
}

const TABLES_SQL: &str = "
    SELECT
        n.nspname AS schema_name,
        c.relname AS table_name,
        obj_description(c.oid, 'pg_class') AS comment
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind = 'r'
      AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
    ORDER BY n.nspname, c.relname
";

const VIEWS_SQL: &str = "
    SELECT
        n.nspname AS schema_name,
        c.relname AS table_name,
        obj_description(c.oid, 'pg_class') AS comment
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind = 'v'
      AND n.nspname NOT IN ('pg_catalog', 'information_schema')
    ORDER BY n.nspname, c.relname
";

const COLUMNS_SQL: &str = "
    SELECT
        a.attname AS column_name,
        pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
        NOT a.attnotnull AS is_nullable,
        pg_get_expr(ad.adbin, ad.adrelid) AS default_value,
        col_description(a.attrelid, a.attnum) AS comment
    FROM pg_attribute a
    JOIN pg_class c ON a.attrelid = c.oid
    JOIN pg_namespace n ON c.relnamespace = n.oid
    LEFT JOIN pg_attrdef ad ON a.attrelid = ad.adrelid AND a.attnum = ad.adnum
    WHERE c.relname = $1
      AND n.nspname = $2
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum
";

const COLUMN_UNIQUE_SQL: &str = "
    SELECT EXISTS(
        SELECT 1
        FROM pg_constraint con
        JOIN pg_class c ON con.conrelid = c.oid
        JOIN pg_namespace n ON c.relnamespace = n.oid
        JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(con.conkey)
        WHERE c.relname = $1
          AND n.nspname = $2
          AND a.attname = $3
          AND con.contype = 'u'
    )
";

const PRIMARY_KEYS_SQL: &str = "
    SELECT a.attname AS column_name
    FROM pg_index i
    JOIN pg_class c ON i.indrelid = c.oid
    JOIN pg_namespace n ON c.relnamespace = n.oid
    JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey)
    WHERE c.relname = $1
      AND n.nspname = $2
      AND i.indisprimary
    ORDER BY array_position(i.indkey, a.attnum)
";

const FOREIGN_KEYS_SQL: &str = "
    SELECT
        con.conname AS constraint_name,
        a.attname AS column_name,
        ref_c.relname AS referenced_table,
        ref_a.attname AS referenced_column
    FROM pg_constraint con
    JOIN pg_class c ON con.conrelid = c.oid
    JOIN pg_namespace n ON c.relnamespace = n.oid
    JOIN pg_attribute a
        ON a.attrelid = c.oid AND a.attnum = ANY(con.conkey)
    JOIN pg_class ref_c ON con.confrelid = ref_c.oid
    JOIN pg_attribute ref_a
        ON ref_a.attrelid = ref_c.oid
        AND ref_a.attnum = ANY(con.confkey)
    WHERE c.relname = $1
      AND n.nspname = $2
      AND con.contype = 'f'
    ORDER BY con.conname
";

const INDEXES_SQL: &str = "
    SELECT
        i.relname AS index_name,
        idx.indisunique AS is_unique,
        am.amname AS index_type,
        ARRAY(
            SELECT a.attname
            FROM pg_attribute a
            WHERE a.attrelid = idx.indrelid
              AND a.attnum = ANY(idx.indkey)
            ORDER BY array_position(idx.indkey, a.attnum)
        ) AS columns
    FROM pg_index idx
    JOIN pg_class i ON i.oid = idx.indexrelid
    JOIN pg_class c ON c.oid = idx.indrelid
    JOIN pg_namespace n ON c.relnamespace = n.oid
    JOIN pg_am am ON i.relam = am.oid
    WHERE c.relname = $1
      AND n.nspname = $2
      AND NOT idx.indisprimary
    ORDER BY i.relname
";

const ENUM_TYPES_SQL: &str = "
    SELECT
        n.nspname AS schema_name,
        t.typname AS type_name,
        ARRAY(
            SELECT e.enumlabel
            FROM pg_enum e
            WHERE e.enumtypid = t.oid
            ORDER BY e.enumsortorder
        ) AS values
    FROM pg_type t
    JOIN pg_namespace n ON t.typnamespace = n.oid
    WHERE t.typtype = 'e'
      AND n.nspname NOT IN ('pg_catalog', 'information_schema')
    ORDER BY n.nspname, t.typname
";

const ROW_ESTIMATE_SQL: &str = "
    SELECT reltuples::bigint AS estimate
    FROM pg_class c
    JOIN pg_namespace n ON c.relnamespace = n.oid
    WHERE c.relname = $1
      AND n.nspname = $2
";

/// Reads complete schema metadata through the connection manager's pools.
#[derive(Debug)]
pub struct SchemaIntrospector {
    manager: Arc<ConnectionManager>,
}

impl SchemaIntrospector {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Introspects `database` in full: relations, columns, keys, indexes,
    /// enum types and the server version.
    pub async fn introspect(&self, database: &str) -> GatewayResult<DatabaseSchema> {
        let pool = self.manager.pool(database)?;
        let client = pool.get().await.map_err(|e| {
            GatewayError::schema_load_error(format!(
                "Failed to connect to '{database}' for schema introspection: {e}"
            ))
        })?;

        let started = std::time::Instant::now();
        let schema = self
            .introspect_client(&client, database)
            .await
            .map_err(|e| {
                GatewayError::schema_load_error(format!(
                    "Failed to introspect database '{database}': {e}"
                ))
            })?;

        tracing::info!(
            database = %database,
            tables = schema.tables.len(),
            enum_types = schema.enum_types.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "schema introspection complete"
        );
        Ok(schema)
    }

    async fn introspect_client(
        &self,
        client: &Client,
        database: &str,
    ) -> Result<DatabaseSchema, tokio_postgres::Error> {
        let version_row = client.query_one("SELECT version()", &[]).await?;
        let version: String = version_row.get(0);
        let version = version.split(',').next().map(str::to_string);

        let mut tables = fetch_relations(client, TABLES_SQL).await?;
        let views = fetch_relations(client, VIEWS_SQL).await?;
        tables.extend(views);

        let enum_types = fetch_enum_types(client).await?;

        for table in &mut tables {
            let table_name = table.table_name.clone();
            let schema_name = table.schema_name.clone();

            table.columns = fetch_columns(client, &table_name, &schema_name).await?;

            let primary_keys = fetch_primary_keys(client, &table_name, &schema_name).await?;
            for column in &mut table.columns {
                if primary_keys.contains(&column.name) {
                    column.is_primary_key = true;
                }
            }

            table.foreign_keys = fetch_foreign_keys(client, &table_name, &schema_name).await?;
            table.indexes = fetch_indexes(client, &table_name, &schema_name).await?;
            table.row_count_estimate =
                Some(fetch_row_estimate(client, &table_name, &schema_name).await?);
        }

        Ok(DatabaseSchema {
            database_name: database.to_string(),
            tables,
            enum_types,
            version,
        })
    }
}

#[async_trait]
impl SchemaLoader for SchemaIntrospector {
    async fn load_schema(&self, database: &str) -> GatewayResult<DatabaseSchema> {
        self.introspect(database).await
    }
}

async fn fetch_relations(
    client: &Client,
    sql: &str,
) -> Result<Vec<TableInfo>, tokio_postgres::Error> {
    let rows = client.query(sql, &[]).await?;
    Ok(rows
        .iter()
        .map(|row| TableInfo {
            schema_name: row.get("schema_name"),
            table_name: row.get("table_name"),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            comment: row.get("comment"),
            row_count_estimate: None,
        })
        .collect())
}

async fn fetch_columns(
    client: &Client,
    table_name: &str,
    schema_name: &str,
) -> Result<Vec<ColumnInfo>, tokio_postgres::Error> {
    let rows = client
        .query(COLUMNS_SQL, &[&table_name, &schema_name])
        .await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in &rows {
        let column_name: String = row.get("column_name");
        let unique_row = client
            .query_one(COLUMN_UNIQUE_SQL, &[&table_name, &schema_name, &column_name])
            .await?;
        let is_unique: bool = unique_row.get(0);

        columns.push(ColumnInfo {
            name: column_name,
            data_type: row.get("data_type"),
            is_nullable: row.get("is_nullable"),
            default_value: row.get("default_value"),
            is_primary_key: false,
            is_unique,
            comment: row.get("comment"),
        });
    }
    Ok(columns)
}

async fn fetch_primary_keys(
    client: &Client,
    table_name: &str,
    schema_name: &str,
) -> Result<HashSet<String>, tokio_postgres::Error> {
    let rows = client
        .query(PRIMARY_KEYS_SQL, &[&table_name, &schema_name])
        .await?;
    Ok(rows.iter().map(|row| row.get("column_name")).collect())
}

async fn fetch_foreign_keys(
    client: &Client,
    table_name: &str,
    schema_name: &str,
) -> Result<Vec<ForeignKeyInfo>, tokio_postgres::Error> {
    let rows = client
        .query(FOREIGN_KEYS_SQL, &[&table_name, &schema_name])
        .await?;
    Ok(rows
        .iter()
        .map(|row| ForeignKeyInfo {
            constraint_name: row.get("constraint_name"),
            column_name: row.get("column_name"),
            referenced_table: row.get("referenced_table"),
            referenced_column: row.get("referenced_column"),
        })
        .collect())
}

async fn fetch_indexes(
    client: &Client,
    table_name: &str,
    schema_name: &str,
) -> Result<Vec<IndexInfo>, tokio_postgres::Error> {
    let rows = client
        .query(INDEXES_SQL, &[&table_name, &schema_name])
        .await?;
    Ok(rows
        .iter()
        .map(|row| IndexInfo {
            name: row.get("index_name"),
            columns: row.get("columns"),
            is_unique: row.get("is_unique"),
            index_type: row.get("index_type"),
        })
        .collect())
}

async fn fetch_enum_types(client: &Client) -> Result<Vec<EnumTypeInfo>, tokio_postgres::Error> {
    let rows = client.query(ENUM_TYPES_SQL, &[]).await?;
    Ok(rows
        .iter()
        .map(|row| EnumTypeInfo {
            schema_name: row.get("schema_name"),
            type_name: row.get("type_name"),
            values: row.get("values"),
        })
        .collect())
}

async fn fetch_row_estimate(
    client: &Client,
    table_name: &str,
    schema_name: &str,
) -> Result<i64, tokio_postgres::Error> {
    let row = client
        .query_opt(ROW_ESTIMATE_SQL, &[&table_name, &schema_name])
        .await?;
    Ok(row.map_or(0, |r| r.get("estimate")))
}
