//! # Entity Declarations
//!
//! Entities and their index tables are declared as plain data by the
//! application. Nothing is discovered at run time: the column list of every
//! index table is written down once and both schema provisioning and index
//! lookups read it from here.
//!
//! ```rust
//! use dbshard::entity::{ColumnType, EntityKind, IndexDef};
//!
//! let users = EntityKind::new("user")?
//!     .with_index(IndexDef::new("user_email", &[("email", ColumnType::Text)])?.unique())
//!     .with_index(IndexDef::new("user_org", &[("org.id", ColumnType::Integer)])?);
//!
//! assert_eq!(users.index("user_org")?.columns()[0].0, "org__id");
//! # Ok::<(), dbshard::Error>(())
//! ```
//!
//! ## Column Names
//!
//! Field paths may use `.` for nesting (`org.id`); the column name replaces
//! each `.` with `__`. After that, only ASCII letters, digits and `_` are
//! accepted, and the first character must not be a digit. Names are quoted
//! in generated SQL regardless.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::FieldValue;

/// Columns every index table carries in front of its declared columns.
pub const INDEX_BASE_COLUMNS: [&str; 2] = ["id", "created"];

// =============================================================================
// Columns
// =============================================================================

/// SQL type of a declared column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// 64-bit integer.
    Integer,
    /// Double precision float.
    Real,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Blob,
    /// Stored as 0/1.
    Boolean,
}

impl ColumnType {
    /// Returns the SQL type name used in DDL.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
        }
    }
}

/// Converts a field path into a validated column name.
pub fn column_name(field: &str) -> Result<String> {
    let name = field.replace('.', "__");
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(Error::InvalidField(field.to_string()))
    }
}

/// Quotes an already validated identifier for SQL.
pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

// =============================================================================
// Index Definitions
// =============================================================================

/// One index table: `id`, `created` and the declared columns.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    table: String,
    columns: Vec<(String, ColumnType)>,
    unique: bool,
}

impl IndexDef {
    /// Declares an index table with the given `(field, type)` columns.
    pub fn new(table: &str, columns: &[(&str, ColumnType)]) -> Result<Self> {
        let table = column_name(table)?;
        let mut out: Vec<(String, ColumnType)> = Vec::with_capacity(columns.len());
        for (field, ty) in columns {
            let name = column_name(field)?;
            if INDEX_BASE_COLUMNS.contains(&name.as_str()) || out.iter().any(|(n, _)| *n == name) {
                return Err(Error::InvalidField(field.to_string()));
            }
            out.push((name, *ty));
        }
        Ok(Self {
            table,
            columns: out,
            unique: false,
        })
    }

    /// Makes the declared columns unique together.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Returns the table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the declared columns.
    pub fn columns(&self) -> &[(String, ColumnType)] {
        &self.columns
    }

    /// Returns true if the declared columns are unique together.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Returns the type of `column`, if it is a column of this table.
    pub fn column_type(&self, column: &str) -> Option<ColumnType> {
        match column {
            "id" => Some(ColumnType::Text),
            "created" => Some(ColumnType::Integer),
            _ => self
                .columns
                .iter()
                .find(|(n, _)| n == column)
                .map(|(_, t)| *t),
        }
    }

    /// Resolves the fields of a lookup to column names of this table.
    pub(crate) fn resolve_fields<'a>(
        &self,
        values: &'a BTreeMap<String, FieldValue>,
    ) -> Result<Vec<(String, &'a FieldValue)>> {
        values
            .iter()
            .map(|(field, value)| {
                let column = column_name(field)?;
                if self.column_type(&column).is_none() {
                    return Err(Error::InvalidField(format!("{}.{}", self.table, field)));
                }
                Ok((column, value))
            })
            .collect()
    }

    /// Cache key of a lookup on this table.
    ///
    /// The key is the table name followed by the fields in sorted order with
    /// their value signatures, so equal lookups share one key.
    pub fn lookup_key(&self, values: &BTreeMap<String, FieldValue>) -> String {
        let parts: Vec<String> = values
            .iter()
            .map(|(field, value)| format!("{}={}", field.replace('.', "__"), value.signature()))
            .collect();
        format!("{}?{}", self.table, parts.join("&"))
    }
}

// =============================================================================
// Entity Kinds
// =============================================================================

/// A record type: its object table and its index tables.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityKind {
    name: String,
    indexes: Vec<IndexDef>,
}

impl EntityKind {
    /// Declares an entity stored in table `name`.
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self {
            name: column_name(name)?,
            indexes: Vec::new(),
        })
    }

    /// Adds an index table.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.retain(|i| i.table != index.table);
        self.indexes.push(index);
        self
    }

    /// Returns the entity (and object table) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns all index tables.
    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    /// Returns the index table called `table`.
    pub fn index(&self, table: &str) -> Result<&IndexDef> {
        self.indexes
            .iter()
            .find(|i| i.table == table)
            .ok_or_else(|| Error::InvalidField(format!("{} has no index {}", self.name, table)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_names() {
        assert_eq!(column_name("email").unwrap(), "email");
        assert_eq!(column_name("org.id").unwrap(), "org__id");
        assert_eq!(column_name("_x1").unwrap(), "_x1");
        for bad in ["", "1abc", "a b", "a;drop", "na\"me", "é"] {
            assert!(column_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_index_rejects_reserved_and_duplicate_columns() {
        assert!(IndexDef::new("ix", &[("id", ColumnType::Text)]).is_err());
        assert!(IndexDef::new("ix", &[("a", ColumnType::Text), ("a", ColumnType::Integer)]).is_err());
    }

    #[test]
    fn test_lookup_key_is_order_independent() {
        let index = IndexDef::new("user_email", &[("email", ColumnType::Text), ("org", ColumnType::Integer)])
            .unwrap();

        let mut a = BTreeMap::new();
        a.insert("org".to_string(), FieldValue::from(7));
        a.insert("email".to_string(), FieldValue::from("x@y"));
        let mut b = BTreeMap::new();
        b.insert("email".to_string(), FieldValue::from("x@y"));
        b.insert("org".to_string(), FieldValue::from(7));

        assert_eq!(index.lookup_key(&a), index.lookup_key(&b));
        assert_eq!(index.lookup_key(&a), "user_email?email='x@y'&org=7");
    }

    #[test]
    fn test_resolve_fields_checks_columns() {
        let index = IndexDef::new("user_email", &[("email", ColumnType::Text)]).unwrap();
        let mut values = BTreeMap::new();
        values.insert("email".to_string(), FieldValue::from("x"));
        assert_eq!(index.resolve_fields(&values).unwrap()[0].0, "email");

        values.insert("phone".to_string(), FieldValue::from("1"));
        assert!(matches!(index.resolve_fields(&values), Err(Error::InvalidField(_))));
    }

    #[test]
    fn test_entity_index_lookup() {
        let kind = EntityKind::new("user")
            .unwrap()
            .with_index(IndexDef::new("user_email", &[("email", ColumnType::Text)]).unwrap());
        assert!(kind.index("user_email").is_ok());
        assert!(kind.index("user_phone").is_err());
    }
}
