//! Row-to-record mapping.
//!
//! Records register their writable fields through [`impl_record!`]; the
//! cursor builds a [`Mapping`] once per result set and applies it per row.
//! Column resolution is positional-free: each column name is prefix-stripped,
//! primary-key-renamed and matched case-insensitively (ignoring underscores,
//! so `CustomerName` finds `customer_name`) against the record's field table.
//! Columns with no matching field are skipped; null cells leave the field at
//! its default.

use crate::error::{DbError, DbResult};
use crate::value::SqlValue;
use chrono::NaiveDateTime;
use uuid::Uuid;

/// Conversion from a database cell into a field type. The error string is
/// wrapped with the column name by whoever applies the conversion.
pub trait FromSql: Sized {
    fn from_sql(value: &SqlValue) -> Result<Self, String>;

    /// Type name used in mismatch errors.
    fn expected() -> &'static str;
}

fn mismatch<T>(value: &SqlValue, wanted: &str) -> Result<T, String> {
    Err(format!("cannot convert {} to {wanted}", value.type_label()))
}

impl FromSql for i32 {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Int(v) => Ok(*v),
            SqlValue::BigInt(v) => i32::try_from(*v).map_err(|e| e.to_string()),
            SqlValue::Bool(v) => Ok(i32::from(*v)),
            // legacy schemas store counters in text columns
            SqlValue::String(s) => s.trim().parse().map_err(|_| format!("cannot parse '{s}' as int")),
            v => mismatch(v, "int"),
        }
    }

    fn expected() -> &'static str {
        "int"
    }
}

impl FromSql for i64 {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::BigInt(v) => Ok(*v),
            SqlValue::Int(v) => Ok(i64::from(*v)),
            SqlValue::String(s) => s.trim().parse().map_err(|_| format!("cannot parse '{s}' as bigint")),
            v => mismatch(v, "bigint"),
        }
    }

    fn expected() -> &'static str {
        "bigint"
    }
}

impl FromSql for f64 {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Float(v) => Ok(*v),
            SqlValue::Int(v) => Ok(f64::from(*v)),
            SqlValue::BigInt(v) => Ok(*v as f64),
            SqlValue::String(s) => s.trim().parse().map_err(|_| format!("cannot parse '{s}' as float")),
            v => mismatch(v, "float"),
        }
    }

    fn expected() -> &'static str {
        "float"
    }
}

impl FromSql for bool {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Bool(v) => Ok(*v),
            SqlValue::Int(0) => Ok(false),
            SqlValue::Int(1) => Ok(true),
            v => mismatch(v, "bit"),
        }
    }

    fn expected() -> &'static str {
        "bit"
    }
}

impl FromSql for String {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::String(s) => Ok(s.clone()),
            SqlValue::Int(v) => Ok(v.to_string()),
            SqlValue::BigInt(v) => Ok(v.to_string()),
            SqlValue::Float(v) => Ok(v.to_string()),
            SqlValue::Guid(g) => Ok(g.to_string()),
            v => mismatch(v, "string"),
        }
    }

    fn expected() -> &'static str {
        "string"
    }
}

impl FromSql for Vec<u8> {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Bytes(b) => Ok(b.clone()),
            v => mismatch(v, "binary"),
        }
    }

    fn expected() -> &'static str {
        "binary"
    }
}

impl FromSql for Uuid {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Guid(g) => Ok(*g),
            SqlValue::String(s) => Uuid::parse_str(s.trim()).map_err(|e| e.to_string()),
            v => mismatch(v, "uniqueidentifier"),
        }
    }

    fn expected() -> &'static str {
        "uniqueidentifier"
    }
}

impl FromSql for NaiveDateTime {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::DateTime(dt) => Ok(*dt),
            v => mismatch(v, "datetime"),
        }
    }

    fn expected() -> &'static str {
        "datetime"
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Null => Ok(None),
            v => T::from_sql(v).map(Some),
        }
    }

    fn expected() -> &'static str {
        T::expected()
    }
}

/// One writable field of a record.
pub struct FieldDef<T> {
    /// Field name matched against (prefix-stripped) column names.
    pub name: &'static str,
    /// Opted out of column matching; a column resolving here is skipped.
    pub excluded: bool,
    pub assign: fn(&mut T, &SqlValue) -> Result<(), String>,
}

/// A type whose instances can be materialized from result rows.
pub trait Record: Default + Send {
    /// Bare type name; `<type_name>ID` columns map to the `id` field.
    fn type_name() -> &'static str;

    fn fields() -> &'static [FieldDef<Self>]
    where
        Self: Sized;
}

/// Register a type's writable fields for row mapping.
///
/// ```ignore
/// #[derive(Default)]
/// struct Customer {
///     id: i32,
///     display_name: String,
///     revision: i32,
/// }
///
/// impl_record!(Customer {
///     id,
///     display_name,
///     excluded revision,
/// });
/// ```
#[macro_export]
macro_rules! impl_record {
    ($ty:ident { $($first:ident $($second:ident)?),* $(,)? }) => {
        impl $crate::mapper::Record for $ty {
            fn type_name() -> &'static str {
                stringify!($ty)
            }

            fn fields() -> &'static [$crate::mapper::FieldDef<Self>] {
                static FIELDS: &[$crate::mapper::FieldDef<$ty>] = &[
                    $($crate::impl_record!(@def $ty, $first $($second)?),)*
                ];
                FIELDS
            }
        }
    };
    (@def $ty:ident, excluded $field:ident) => {
        $crate::mapper::FieldDef {
            name: stringify!($field),
            excluded: true,
            assign: |_, _| Ok(()),
        }
    };
    (@def $ty:ident, $field:ident) => {
        $crate::mapper::FieldDef {
            name: stringify!($field),
            excluded: false,
            assign: |record: &mut $ty, value| {
                record.$field = $crate::mapper::FromSql::from_sql(value)?;
                Ok(())
            },
        }
    };
}

/// Case-insensitive name comparison ignoring underscores, bridging
/// `PascalCase` column names and snake_case field names.
fn names_match(field: &str, column: &str) -> bool {
    let mut f = field.bytes().filter(|b| *b != b'_');
    let mut c = column.bytes().filter(|b| *b != b'_');
    loop {
        match (f.next(), c.next()) {
            (None, None) => return true,
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(&b) => {}
            _ => return false,
        }
    }
}

/// `<TypeName>ID` columns carry the row's primary key; they map to the
/// record's `id` field.
fn primary_key_target<'a>(column: &'a str, type_name: &str) -> &'a str {
    let renames = column.len() == type_name.len() + 2
        && column
            .get(..type_name.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(type_name))
        && column[column.len() - 2..].eq_ignore_ascii_case("ID");
    if renames { "ID" } else { column }
}

/// Column-ordinal to field resolution for one result set layout. Built once
/// per result set and applied to every row.
pub struct Mapping<T: Record + 'static> {
    slots: Vec<Option<&'static FieldDef<T>>>,
}

impl<T: Record + 'static> Mapping<T> {
    pub fn build(columns: &[String], prefix: &str) -> Self {
        let prefix = if prefix.trim().is_empty() { None } else { Some(prefix) };
        let slots = columns
            .iter()
            .map(|column| {
                let mut name = column.as_str();
                if let Some(prefix) = prefix {
                    let matches = name.len() >= prefix.len()
                        && name
                            .get(..prefix.len())
                            .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
                    if !matches {
                        // prefixed mode only considers the prefixed columns
                        return None;
                    }
                    name = &name[prefix.len()..];
                }
                let target = primary_key_target(name, T::type_name());
                T::fields()
                    .iter()
                    .find(|f| !f.excluded && names_match(f.name, target))
            })
            .collect();
        Self { slots }
    }

    /// True when the ordinal resolves to a field.
    pub fn maps(&self, ordinal: usize) -> bool {
        self.slots.get(ordinal).copied().flatten().is_some()
    }

    /// Assign one cell. Unmapped ordinals and null cells are no-ops; a
    /// conversion failure is wrapped with the column name.
    pub fn assign(
        &self,
        record: &mut T,
        ordinal: usize,
        column: &str,
        value: &SqlValue,
    ) -> DbResult<()> {
        let Some(field) = self.slots.get(ordinal).copied().flatten() else {
            return Ok(());
        };
        if value.is_null() {
            return Ok(());
        }
        (field.assign)(record, value).map_err(|msg| DbError::mapping(column, msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug, PartialEq)]
    struct Customer {
        id: i32,
        display_name: String,
        balance: Option<f64>,
        revision: i32,
    }

    impl_record!(Customer {
        id,
        display_name,
        balance,
        excluded revision,
    });

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_maps_case_insensitively_across_naming_styles() {
        let mapping =
            Mapping::<Customer>::build(&columns(&["DisplayName", "Balance", "Unrelated"]), "");
        assert!(mapping.maps(0));
        assert!(mapping.maps(1));
        assert!(!mapping.maps(2));
    }

    #[test]
    fn test_primary_key_column_maps_to_id() {
        let mapping = Mapping::<Customer>::build(&columns(&["CustomerID"]), "");
        let mut c = Customer::default();
        mapping
            .assign(&mut c, 0, "CustomerID", &SqlValue::Int(42))
            .unwrap();
        assert_eq!(c.id, 42);
    }

    #[test]
    fn test_prefix_strips_and_skips_unrelated() {
        let mapping =
            Mapping::<Customer>::build(&columns(&["C_DisplayName", "DisplayName"]), "C_");
        let mut c = Customer::default();
        mapping
            .assign(&mut c, 0, "C_DisplayName", &SqlValue::from("Ada"))
            .unwrap();
        assert_eq!(c.display_name, "Ada");
        // the bare column does not carry the prefix and is ignored
        assert!(!mapping.maps(1));
    }

    #[test]
    fn test_excluded_field_never_matches() {
        let mapping = Mapping::<Customer>::build(&columns(&["Revision"]), "");
        assert!(!mapping.maps(0));
    }

    #[test]
    fn test_null_cell_keeps_default() {
        let mapping = Mapping::<Customer>::build(&columns(&["DisplayName"]), "");
        let mut c = Customer::default();
        mapping
            .assign(&mut c, 0, "DisplayName", &SqlValue::Null)
            .unwrap();
        assert_eq!(c.display_name, "");
    }

    #[test]
    fn test_conversion_failure_names_column() {
        let mapping = Mapping::<Customer>::build(&columns(&["Balance"]), "");
        let mut c = Customer::default();
        let err = mapping
            .assign(&mut c, 0, "Balance", &SqlValue::Bytes(vec![1]))
            .unwrap_err();
        assert!(err.to_string().contains("'Balance'"));
    }

    #[test]
    fn test_string_to_int_parsing() {
        assert_eq!(i32::from_sql(&SqlValue::from(" 17 ")), Ok(17));
        assert!(i32::from_sql(&SqlValue::from("x")).is_err());
    }

    #[test]
    fn test_option_from_null() {
        assert_eq!(Option::<i32>::from_sql(&SqlValue::Null), Ok(None));
        assert_eq!(Option::<i32>::from_sql(&SqlValue::Int(3)), Ok(Some(3)));
    }
}
