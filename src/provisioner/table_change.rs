//! Structural change descriptor rendered to Postgres DDL
//!
//! One `TableChange` describes one batch of structural work against a
//! provisioned table (create, add/drop/rename/resize columns, index and
//! constraint changes). Callers compose a change, then execute it inside the
//! transaction that also carries the matching metadata writes.

use crate::properties::types::{ForeignKeySpec, PropertyStorageSpec, PropertyType, TableIndex};
use crate::provisioner::naming::legal_identifier;

/// The kind of structural change a `TableChange` performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    CreateTable,
    DropTable,
    AddColumns,
    DropColumns,
    RenameColumns,
    ResizeColumns,
    AddIndices,
    DropIndicesByName,
}

/// A single column rename (old physical name to new physical name)
#[derive(Debug, Clone)]
pub struct ColumnRename {
    pub from: String,
    pub to: String,
}

/// A single column resize to a new scale
#[derive(Debug, Clone)]
pub struct ColumnResize {
    pub column: String,
    pub property_type: PropertyType,
    pub new_scale: i32,
}

/// One batch of structural changes against one physical table
#[derive(Debug, Clone)]
pub struct TableChange {
    pub change_type: ChangeType,
    pub schema: String,
    pub table: String,
    pub columns: Vec<PropertyStorageSpec>,
    pub drop_columns: Vec<String>,
    pub renames: Vec<ColumnRename>,
    pub resizes: Vec<ColumnResize>,
    pub indices: Vec<TableIndex>,
    pub drop_index_names: Vec<String>,
    pub foreign_keys: Vec<ForeignKeySpec>,
}

impl TableChange {
    pub fn new(change_type: ChangeType, schema: &str, table: &str) -> Self {
        Self {
            change_type,
            schema: schema.to_string(),
            table: table.to_string(),
            columns: Vec::new(),
            drop_columns: Vec::new(),
            renames: Vec::new(),
            resizes: Vec::new(),
            indices: Vec::new(),
            drop_index_names: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn add_column(&mut self, spec: PropertyStorageSpec) {
        self.columns.push(spec);
    }

    pub fn drop_column_exact_name(&mut self, name: &str) {
        self.drop_columns.push(name.to_string());
    }

    pub fn add_column_rename(&mut self, from: &str, to: &str) {
        self.renames.push(ColumnRename {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    pub fn add_column_resize(&mut self, column: &str, property_type: PropertyType, new_scale: i32) {
        self.resizes.push(ColumnResize {
            column: column.to_string(),
            property_type,
            new_scale,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
            && self.drop_columns.is_empty()
            && self.renames.is_empty()
            && self.resizes.is_empty()
            && self.indices.is_empty()
            && self.drop_index_names.is_empty()
    }

    fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }

    /// Render this change to the SQL statements that execute it, in order.
    pub fn render_sql(&self) -> Vec<String> {
        match self.change_type {
            ChangeType::CreateTable => self.render_create_table(),
            ChangeType::DropTable => vec![format!("DROP TABLE IF EXISTS {}", self.qualified())],
            ChangeType::AddColumns => self
                .columns
                .iter()
                .map(|c| {
                    format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        self.qualified(),
                        render_column(c)
                    )
                })
                .collect(),
            ChangeType::DropColumns => self
                .drop_columns
                .iter()
                .map(|c| format!("ALTER TABLE {} DROP COLUMN \"{c}\"", self.qualified()))
                .collect(),
            ChangeType::RenameColumns => self
                .renames
                .iter()
                .map(|r| {
                    format!(
                        "ALTER TABLE {} RENAME COLUMN \"{}\" TO \"{}\"",
                        self.qualified(),
                        r.from,
                        r.to
                    )
                })
                .collect(),
            ChangeType::ResizeColumns => self
                .resizes
                .iter()
                .map(|r| {
                    format!(
                        "ALTER TABLE {} ALTER COLUMN \"{}\" TYPE {}",
                        self.qualified(),
                        r.column,
                        r.property_type.sql_type(r.new_scale)
                    )
                })
                .collect(),
            ChangeType::AddIndices => self
                .indices
                .iter()
                .map(|ix| {
                    format!(
                        "CREATE {}INDEX \"{}\" ON {} ({})",
                        if ix.unique { "UNIQUE " } else { "" },
                        canonical_index_name(&self.table, ix),
                        self.qualified(),
                        quote_list(&ix.columns)
                    )
                })
                .collect(),
            ChangeType::DropIndicesByName => self
                .drop_index_names
                .iter()
                .map(|name| format!("DROP INDEX IF EXISTS \"{}\".\"{}\"", self.schema, name))
                .collect(),
        }
    }

    fn render_create_table(&self) -> Vec<String> {
        let mut defs: Vec<String> = self.columns.iter().map(render_column).collect();
        let pk_cols: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| format!("\"{}\"", c.name))
            .collect();
        if !pk_cols.is_empty() {
            defs.push(format!("PRIMARY KEY ({})", pk_cols.join(", ")));
        }
        for fk in &self.foreign_keys {
            defs.push(format!(
                "FOREIGN KEY (\"{}\") REFERENCES \"{}\".\"{}\" (\"{}\")",
                fk.column, fk.referenced_schema, fk.referenced_table, fk.referenced_column
            ));
        }

        let mut statements = vec![format!(
            "CREATE TABLE {} ({})",
            self.qualified(),
            defs.join(", ")
        )];
        for ix in &self.indices {
            statements.push(format!(
                "CREATE {}INDEX \"{}\" ON {} ({})",
                if ix.unique { "UNIQUE " } else { "" },
                canonical_index_name(&self.table, ix),
                self.qualified(),
                quote_list(&ix.columns)
            ));
        }
        statements
    }
}

fn render_column(spec: &PropertyStorageSpec) -> String {
    let sql_type = if spec.auto_increment {
        match spec.property_type {
            PropertyType::BigInt => "BIGSERIAL".to_string(),
            _ => "SERIAL".to_string(),
        }
    } else {
        spec.property_type.sql_type(spec.scale)
    };
    let nullability = if spec.nullable { "" } else { " NOT NULL" };
    format!("\"{}\" {}{}", spec.name, sql_type, nullability)
}

fn quote_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Canonical name for a declared index: deterministic so required indices
/// can be diffed against the live catalog by name alone.
pub fn canonical_index_name(table: &str, index: &TableIndex) -> String {
    let prefix = if index.unique { "uq" } else { "ix" };
    let cols = index.columns.join("_");
    let mut name = legal_identifier(&format!("{prefix}_{table}_{cols}"));
    name.truncate(63);
    name
}
