//! Declarative schema model, diffing, and PostgreSQL rendering.
//!
//! A `SchemaModel` is what a service expects its tables to look like (loaded
//! from its model file) or what the datastore currently holds (introspected by
//! a `MigrationStore`). `SchemaModel::diff` turns the gap between the two into
//! an ordered list of `SchemaChange`s, which is also the body of a revision
//! script.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    #[serde(rename = "type")]
    pub sql_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(sql_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            sql_type: sql_type.into(),
            nullable,
        }
    }

    /// Equal up to type aliases (`int4` vs `integer`, ...).
    pub fn same_as(&self, other: &ColumnDef) -> bool {
        self.nullable == other.nullable
            && normalize_type(&self.sql_type) == normalize_type(&other.sql_type)
    }

    fn describe(&self) -> String {
        let null = if self.nullable { "null" } else { "not null" };
        format!("{} {null}", self.sql_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaModel {
    #[serde(default)]
    pub tables: BTreeMap<String, TableDef>,
}

impl SchemaModel {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    /// Changes that turn `self` (the live schema) into `desired`.
    ///
    /// Order: created tables, then per shared table added / altered / dropped
    /// columns, then dropped tables. Names iterate in sorted order.
    pub fn diff(&self, desired: &SchemaModel) -> SchemaDiff {
        let mut changes = Vec::new();

        for (name, table) in &desired.tables {
            if !self.tables.contains_key(name) {
                changes.push(SchemaChange::CreateTable {
                    table: name.clone(),
                    columns: table.columns.clone(),
                });
            }
        }

        for (name, live) in &self.tables {
            let Some(want) = desired.tables.get(name) else {
                continue;
            };
            for (col, def) in &want.columns {
                match live.columns.get(col) {
                    None => changes.push(SchemaChange::AddColumn {
                        table: name.clone(),
                        column: col.clone(),
                        definition: def.clone(),
                    }),
                    Some(current) if !current.same_as(def) => {
                        changes.push(SchemaChange::AlterColumn {
                            table: name.clone(),
                            column: col.clone(),
                            from: current.clone(),
                            to: def.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
            for col in live.columns.keys() {
                if !want.columns.contains_key(col) {
                    changes.push(SchemaChange::DropColumn {
                        table: name.clone(),
                        column: col.clone(),
                    });
                }
            }
        }

        for name in self.tables.keys() {
            if !desired.tables.contains_key(name) {
                changes.push(SchemaChange::DropTable {
                    table: name.clone(),
                });
            }
        }

        SchemaDiff { changes }
    }

    /// Apply one change in memory. Errors describe why the change does not fit.
    pub fn apply(&mut self, change: &SchemaChange) -> std::result::Result<(), String> {
        match change {
            SchemaChange::CreateTable { table, columns } => {
                if self.tables.contains_key(table) {
                    return Err(format!("table '{table}' already exists"));
                }
                self.tables.insert(
                    table.clone(),
                    TableDef {
                        columns: columns.clone(),
                    },
                );
            }
            SchemaChange::DropTable { table } => {
                if self.tables.remove(table).is_none() {
                    return Err(format!("table '{table}' does not exist"));
                }
            }
            SchemaChange::AddColumn {
                table,
                column,
                definition,
            } => {
                let t = self.table_mut(table)?;
                if t.columns.contains_key(column) {
                    return Err(format!("column '{table}.{column}' already exists"));
                }
                t.columns.insert(column.clone(), definition.clone());
            }
            SchemaChange::DropColumn { table, column } => {
                let t = self.table_mut(table)?;
                if t.columns.remove(column).is_none() {
                    return Err(format!("column '{table}.{column}' does not exist"));
                }
            }
            SchemaChange::AlterColumn {
                table, column, to, ..
            } => {
                let t = self.table_mut(table)?;
                let Some(def) = t.columns.get_mut(column) else {
                    return Err(format!("column '{table}.{column}' does not exist"));
                };
                *def = to.clone();
            }
        }
        Ok(())
    }

    fn table_mut(&mut self, table: &str) -> std::result::Result<&mut TableDef, String> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| format!("table '{table}' does not exist"))
    }

    /// Structural equality up to type aliases.
    pub fn matches(&self, other: &SchemaModel) -> bool {
        self.diff(other).is_empty()
    }
}

// ---------------------------------------------------------------------------
// Changes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaChange {
    CreateTable {
        table: String,
        columns: BTreeMap<String, ColumnDef>,
    },
    DropTable {
        table: String,
    },
    AddColumn {
        table: String,
        column: String,
        definition: ColumnDef,
    },
    DropColumn {
        table: String,
        column: String,
    },
    AlterColumn {
        table: String,
        column: String,
        from: ColumnDef,
        to: ColumnDef,
    },
}

impl SchemaChange {
    /// One-line human summary used in drift reports.
    pub fn summary(&self) -> String {
        match self {
            SchemaChange::CreateTable { table, columns } => {
                format!("+ table {table} ({} columns)", columns.len())
            }
            SchemaChange::DropTable { table } => format!("- table {table}"),
            SchemaChange::AddColumn {
                table,
                column,
                definition,
            } => format!("+ column {table}.{column} {}", definition.describe()),
            SchemaChange::DropColumn { table, column } => format!("- column {table}.{column}"),
            SchemaChange::AlterColumn {
                table,
                column,
                from,
                to,
            } => format!(
                "~ column {table}.{column}: {} -> {}",
                from.describe(),
                to.describe()
            ),
        }
    }

    /// PostgreSQL DDL for this change inside `schema`.
    pub fn to_sql(&self, schema: &str) -> Vec<String> {
        let qualified = |table: &str| format!("{}.{}", quote_ident(schema), quote_ident(table));
        match self {
            SchemaChange::CreateTable { table, columns } => {
                let cols: Vec<String> = columns
                    .iter()
                    .map(|(name, def)| column_sql(name, def))
                    .collect();
                vec![format!(
                    "CREATE TABLE {} ({})",
                    qualified(table),
                    cols.join(", ")
                )]
            }
            SchemaChange::DropTable { table } => vec![format!("DROP TABLE {}", qualified(table))],
            SchemaChange::AddColumn {
                table,
                column,
                definition,
            } => vec![format!(
                "ALTER TABLE {} ADD COLUMN {}",
                qualified(table),
                column_sql(column, definition)
            )],
            SchemaChange::DropColumn { table, column } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                qualified(table),
                quote_ident(column)
            )],
            SchemaChange::AlterColumn {
                table,
                column,
                from,
                to,
            } => {
                let mut stmts = Vec::new();
                if normalize_type(&from.sql_type) != normalize_type(&to.sql_type) {
                    stmts.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                        qualified(table),
                        quote_ident(column),
                        to.sql_type
                    ));
                }
                if from.nullable != to.nullable {
                    let action = if to.nullable {
                        "DROP NOT NULL"
                    } else {
                        "SET NOT NULL"
                    };
                    stmts.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} {action}",
                        qualified(table),
                        quote_ident(column)
                    ));
                }
                stmts
            }
        }
    }
}

fn column_sql(name: &str, def: &ColumnDef) -> String {
    let null = if def.nullable { "" } else { " NOT NULL" };
    format!("{} {}{null}", quote_ident(name), def.sql_type)
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Canonical spelling of a PostgreSQL type name for comparisons.
///
/// Accepts both the short forms model files use (`int4`, `timestamptz(3)`,
/// `decimal(10, 2)`) and what `format_type` reports (`timestamp(3) with time
/// zone`, `integer[]`).
pub fn normalize_type(sql_type: &str) -> String {
    let mut lowered = sql_type
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();

    let mut dims = 0;
    while let Some(rest) = lowered.strip_suffix("[]") {
        lowered = rest.trim_end().to_string();
        dims += 1;
    }

    // modifiers may sit mid-name: `timestamp(3) without time zone`
    let (name, args) = match (lowered.find('('), lowered.find(')')) {
        (Some(open), Some(close)) if open < close => {
            let name = format!("{} {}", lowered[..open].trim_end(), lowered[close + 1..].trim());
            let args: String = lowered[open..=close]
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            (name.trim().to_string(), args)
        }
        _ => (lowered.clone(), String::new()),
    };

    let base = match name.as_str() {
        "int" | "int4" | "serial" | "serial4" => "integer",
        "int8" | "bigserial" | "serial8" => "bigint",
        "int2" | "smallserial" | "serial2" => "smallint",
        "varchar" => "character varying",
        "char" | "bpchar" => "character",
        "bool" => "boolean",
        "float8" => "double precision",
        "float4" => "real",
        "timestamptz" => "timestamp with time zone",
        "timestamp" => "timestamp without time zone",
        "timetz" => "time with time zone",
        "time" => "time without time zone",
        "decimal" => "numeric",
        other => other,
    };
    format!("{base}{args}{}", "[]".repeat(dims))
}

// ---------------------------------------------------------------------------
// SchemaDiff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub changes: Vec<SchemaChange>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn report(&self) -> String {
        let mut out = String::new();
        for change in &self.changes {
            let _ = writeln!(out, "  {}", change.summary());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
