//! Database value and type representations.
//!
//! `SqlValue` is the unified value type that flows through parameter binding,
//! result cursors, and row mapping. `SqlType` is the native-type marker used
//! to declare output and input/output parameters, and `TableValue` carries an
//! in-memory table for table-valued parameters.

use crate::error::{DbError, DbResult};
use chrono::NaiveDateTime;
use uuid::Uuid;

/// A single database value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Guid(Uuid),
    DateTime(NaiveDateTime),
    Table(TableValue),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn is_table(&self) -> bool {
        matches!(self, SqlValue::Table(_))
    }

    /// Short type label used in error messages.
    pub fn type_label(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "bit",
            SqlValue::Int(_) => "int",
            SqlValue::BigInt(_) => "bigint",
            SqlValue::Float(_) => "float",
            SqlValue::String(_) => "string",
            SqlValue::Bytes(_) => "binary",
            SqlValue::Guid(_) => "uniqueidentifier",
            SqlValue::DateTime(_) => "datetime",
            SqlValue::Table(_) => "table",
        }
    }

    /// True if the value is a string containing only 7-bit-clean characters.
    /// Used by the SBCS input-parameter defaulting rule.
    pub fn is_ascii_string(&self) -> bool {
        matches!(self, SqlValue::String(s) if s.chars().all(|c| (c as u32) <= 127))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::BigInt(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::String(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::String(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Guid(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl From<TableValue> for SqlValue {
    fn from(v: TableValue) -> Self {
        SqlValue::Table(v)
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

/// Native database type markers. Setting a parameter under an output or
/// input/output key prefix with one of these declares the parameter's type
/// without supplying a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Bit,
    Int,
    BigInt,
    Float,
    VarChar,
    NVarChar,
    VarBinary,
    DateTime,
    UniqueIdentifier,
}

impl SqlType {
    /// Variable-length kinds need an explicit capacity when bound as output
    /// parameters; fixed-size kinds do not.
    pub fn is_variable_size(&self) -> bool {
        matches!(
            self,
            SqlType::VarChar | SqlType::NVarChar | SqlType::VarBinary
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SqlType::Bit => "bit",
            SqlType::Int => "int",
            SqlType::BigInt => "bigint",
            SqlType::Float => "float",
            SqlType::VarChar => "varchar",
            SqlType::NVarChar => "nvarchar",
            SqlType::VarBinary => "varbinary",
            SqlType::DateTime => "datetime",
            SqlType::UniqueIdentifier => "uniqueidentifier",
        }
    }
}

/// An in-memory table passed to the database in one call (table-valued
/// parameter). The optional type name is the server-side table type; when
/// present it is carried onto the bound parameter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableValue {
    type_name: Option<String>,
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
}

impl TableValue {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            type_name: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Attach the server-side table type name, e.g. `dbo.IntList`.
    pub fn with_type_name(mut self, name: impl Into<String>) -> Self {
        self.type_name = Some(name.into());
        self
    }

    /// Single-column table from a sequence of scalars. The column is named
    /// `t` by convention.
    pub fn from_values<T, I>(values: I) -> Self
    where
        T: Into<SqlValue>,
        I: IntoIterator<Item = T>,
    {
        let mut table = Self::new(&["t"]);
        for v in values {
            table.rows.push(vec![v.into()]);
        }
        table
    }

    pub fn add_row(&mut self, row: Vec<SqlValue>) -> DbResult<()> {
        if row.len() != self.columns.len() {
            return Err(DbError::usage(format!(
                "Row has {} values but the table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<SqlValue>] {
        &self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_conversion() {
        assert_eq!(SqlValue::from(None::<i32>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(7)), SqlValue::Int(7));
    }

    #[test]
    fn test_ascii_string_detection() {
        assert!(SqlValue::from("plain ascii").is_ascii_string());
        assert!(!SqlValue::from("smörgåsbord").is_ascii_string());
        assert!(!SqlValue::Int(1).is_ascii_string());
    }

    #[test]
    fn test_variable_size_types() {
        assert!(SqlType::NVarChar.is_variable_size());
        assert!(SqlType::VarBinary.is_variable_size());
        assert!(!SqlType::Int.is_variable_size());
    }

    #[test]
    fn test_table_value_arity_check() {
        let mut table = TableValue::new(&["A", "B"]);
        assert!(
            table
                .add_row(vec![SqlValue::Int(1), SqlValue::Int(2)])
                .is_ok()
        );
        assert!(table.add_row(vec![SqlValue::Int(1)]).is_err());
    }

    #[test]
    fn test_table_from_values() {
        let table = TableValue::from_values([1, 2, 3]);
        assert_eq!(table.columns(), &["t".to_string()]);
        assert_eq!(table.rows().len(), 3);
    }
}
