//! Introspected database schema models.
//!
//! These types mirror what the introspector reads out of the PostgreSQL
//! system catalogs. Each one knows how to render itself into the plain-text
//! schema context that is embedded in SQL generation prompts, so the prompt
//! format lives next to the data it describes.

use serde::{Deserialize, Serialize};

fn default_schema_name() -> String {
    "public".to_string()
}

fn default_index_type() -> String {
    "btree".to_string()
}

/// A single column of a table or view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// PostgreSQL type as rendered by `format_type`, e.g. `character varying(64)`.
    pub data_type: String,
    pub is_nullable: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

impl ColumnInfo {
    /// Renders one prompt line, e.g.
    /// `  - id: bigint (PRIMARY KEY, NOT NULL) -- surrogate key`.
    pub fn to_prompt_line(&self) -> String {
        let mut line = format!("  - {}: {}", self.name, self.data_type);

        let mut flags: Vec<String> = Vec::new();
        if self.is_primary_key {
            flags.push("PRIMARY KEY".to_string());
        }
        if self.is_unique && !self.is_primary_key {
            flags.push("UNIQUE".to_string());
        }
        if !self.is_nullable {
            flags.push("NOT NULL".to_string());
        }
        if let Some(default) = self.default_value.as_deref().filter(|d| !d.is_empty()) {
            flags.push(format!("DEFAULT {default}"));
        }

        if !flags.is_empty() {
            line.push_str(&format!(" ({})", flags.join(", ")));
        }

        if let Some(comment) = self.comment.as_deref().filter(|c| !c.is_empty()) {
            line.push_str(&format!(" -- {comment}"));
        }

        line
    }
}

/// A foreign key edge from one column to a referenced table/column.
///
/// Composite keys appear as one entry per participating column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub constraint_name: String,
    pub column_name: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

impl ForeignKeyInfo {
    pub fn to_prompt_line(&self) -> String {
        format!(
            "  - {} -> {}.{}",
            self.column_name, self.referenced_table, self.referenced_column
        )
    }
}

/// A secondary index (primary key indexes are listed as column flags instead).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default = "default_index_type")]
    pub index_type: String,
}

impl IndexInfo {
    pub fn to_prompt_line(&self) -> String {
        let unique = if self.is_unique { "UNIQUE " } else { "" };
        format!(
            "  - {}{} INDEX on ({})",
            unique,
            self.index_type.to_uppercase(),
            self.columns.join(", ")
        )
    }
}

/// A table or view with everything the generator needs to know about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    #[serde(default = "default_schema_name")]
    pub schema_name: String,
    pub table_name: String,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyInfo>,
    #[serde(default)]
    pub indexes: Vec<IndexInfo>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub row_count_estimate: Option<i64>,
}

impl TableInfo {
    /// Schema-qualified name, e.g. `public.orders`.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    /// Renders the table as a prompt section: header, columns, foreign keys
    /// and indexes, each group present only when non-empty.
    pub fn to_prompt_section(&self) -> String {
        let mut lines = vec![format!("\nTable: {}", self.full_name())];

        if let Some(comment) = self.comment.as_deref().filter(|c| !c.is_empty()) {
            lines.push(format!("Description: {comment}"));
        }

        if let Some(estimate) = self.row_count_estimate {
            lines.push(format!("Approximate rows: {}", group_thousands(estimate)));
        }

        lines.push("\nColumns:".to_string());
        for col in &self.columns {
            lines.push(col.to_prompt_line());
        }

        if !self.foreign_keys.is_empty() {
            lines.push("\nForeign Keys:".to_string());
            for fk in &self.foreign_keys {
                lines.push(fk.to_prompt_line());
            }
        }

        if !self.indexes.is_empty() {
            lines.push("\nIndexes:".to_string());
            for idx in &self.indexes {
                lines.push(idx.to_prompt_line());
            }
        }

        lines.join("\n")
    }
}

/// A user-defined ENUM type and its allowed labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumTypeInfo {
    #[serde(default = "default_schema_name")]
    pub schema_name: String,
    pub type_name: String,
    pub values: Vec<String>,
}

impl EnumTypeInfo {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.type_name)
    }

    pub fn to_prompt_line(&self) -> String {
        let values = self
            .values
            .iter()
            .map(|v| format!("'{v}'"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("  - {}: {}", self.type_name, values)
    }
}

/// The full introspected schema of one configured database.
///
/// Tables and views share the `tables` list; views simply have no primary
/// keys. Instances are immutable once built and shared behind `Arc` by the
/// schema cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub database_name: String,
    #[serde(default)]
    pub tables: Vec<TableInfo>,
    #[serde(default)]
    pub enum_types: Vec<EnumTypeInfo>,
    #[serde(default)]
    pub version: Option<String>,
}

impl DatabaseSchema {
    /// Looks up a table by name within a schema.
    pub fn get_table(&self, table_name: &str, schema_name: &str) -> Option<&TableInfo> {
        self.tables
            .iter()
            .find(|t| t.table_name == table_name && t.schema_name == schema_name)
    }

    /// Renders the entire schema as the context block embedded in SQL
    /// generation prompts.
    pub fn to_prompt_context(&self) -> String {
        let mut lines = vec![format!("Database: {}", self.database_name)];

        if let Some(version) = self.version.as_deref().filter(|v| !v.is_empty()) {
            lines.push(format!("PostgreSQL Version: {version}"));
        }

        if !self.enum_types.is_empty() {
            lines.push("\n=== Custom Types ===".to_string());
            for enum_type in &self.enum_types {
                lines.push(enum_type.to_prompt_line());
            }
        }

        if !self.tables.is_empty() {
            lines.push("\n=== Tables ===".to_string());
            for table in &self.tables {
                lines.push(table.to_prompt_section());
            }
        }

        lines.join("\n")
    }
}

/// Formats an integer with thousands separators, e.g. `1234567` -> `1,234,567`.
fn group_thousands(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    let offset = digits.len() % 3;
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (i + 3 - offset) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if n < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}
