//! Parameter binding protocol.
//!
//! Parameter direction is encoded in the key, not stored separately: a plain
//! key binds as input, `ZO_` as output, `ZX_` as input/output, `ZS_` (or any
//! inherently tabular value) as a table-valued parameter, and the reserved
//! `ZR_Return` key carries the return value written by the harvest step.
//! These prefixes are part of the public contract; callers spell them out in
//! parameter keys to request non-default direction or shape.

use crate::config::ReaderOptions;
use crate::driver::{NativeParam, ParamDirection};
use crate::error::{DbError, DbResult};
use crate::value::{SqlType, SqlValue};

/// Key prefix for output parameters.
pub const OUTPUT_PREFIX: &str = "ZO_";
/// Key prefix for input/output parameters.
pub const INPUT_OUTPUT_PREFIX: &str = "ZX_";
/// Key prefix for table-valued parameters.
pub const TABLE_PREFIX: &str = "ZS_";
/// Reserved key holding the return value after execution.
pub const RETURN_PARAM: &str = "ZR_Return";

/// Capacity allocated for variable-length output parameters.
pub const DEFAULT_VARIABLE_CAPACITY: u32 = 4000;

/// What a parameter key maps to: either a concrete value or a native-type
/// marker declaring an output slot.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Value(SqlValue),
    TypeMarker(SqlType),
}

/// One entry of a command's parameter store. The key comparison is
/// case-insensitive; `name` preserves the caller's spelling.
#[derive(Debug, Clone)]
pub(crate) struct ParamEntry {
    pub name: String,
    pub value: ParamValue,
}

fn has_prefix(name: &str, prefix: &str) -> bool {
    name.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

pub(crate) fn has_direction_prefix(name: &str) -> bool {
    has_prefix(name, OUTPUT_PREFIX) || has_prefix(name, INPUT_OUTPUT_PREFIX)
}

fn strip_prefix<'a>(name: &'a str, prefix: &str) -> &'a str {
    &name[prefix.len()..]
}

pub(crate) fn is_return_key(name: &str) -> bool {
    name.eq_ignore_ascii_case(RETURN_PARAM)
}

/// Resolve one store entry into a native parameter per the binding protocol.
/// Returns `None` for the reserved return key, which is never bound from the
/// store (a dedicated return slot is appended by the executor instead).
pub(crate) fn bind_native(
    entry: &ParamEntry,
    options: ReaderOptions,
) -> DbResult<Option<NativeParam>> {
    let name = entry.name.as_str();

    if is_return_key(name) {
        return Ok(None);
    }

    if has_prefix(name, OUTPUT_PREFIX) {
        let ParamValue::TypeMarker(ty) = entry.value else {
            return Err(DbError::usage(format!(
                "Output parameter '{name}' requires a type marker value"
            )));
        };
        return Ok(Some(sized_marker_param(
            strip_prefix(name, OUTPUT_PREFIX),
            ty,
            ParamDirection::Output,
        )));
    }

    if has_prefix(name, INPUT_OUTPUT_PREFIX) {
        let bare = strip_prefix(name, INPUT_OUTPUT_PREFIX);
        return Ok(Some(match &entry.value {
            ParamValue::TypeMarker(ty) => {
                sized_marker_param(bare, *ty, ParamDirection::InputOutput)
            }
            ParamValue::Value(v) => NativeParam {
                name: format!("@{bare}"),
                value: v.clone(),
                direction: ParamDirection::InputOutput,
                sql_type: None,
                size: None,
                type_name: None,
            },
        }));
    }

    let is_table_value = matches!(&entry.value, ParamValue::Value(v) if v.is_table());
    if has_prefix(name, TABLE_PREFIX) || is_table_value {
        let bare = if has_prefix(name, TABLE_PREFIX) {
            strip_prefix(name, TABLE_PREFIX)
        } else {
            name
        };
        let ParamValue::Value(SqlValue::Table(table)) = &entry.value else {
            return Err(DbError::usage(format!(
                "Table-valued parameter '{name}' requires a table value"
            )));
        };
        return Ok(Some(NativeParam {
            name: format!("@{bare}"),
            value: SqlValue::Table(table.clone()),
            direction: ParamDirection::Structured,
            sql_type: None,
            size: None,
            type_name: table.type_name().map(str::to_string),
        }));
    }

    let ParamValue::Value(value) = &entry.value else {
        return Err(DbError::usage(format!(
            "Parameter '{name}' holds a bare type marker; did you mean the '{OUTPUT_PREFIX}' or '{INPUT_OUTPUT_PREFIX}' prefix?"
        )));
    };

    // avoid the wide text default for plain ASCII input since most indexes
    // are on the SBCS format
    let sql_type = if options.default_parameters_to_sbcs && value.is_ascii_string() {
        Some(SqlType::VarChar)
    } else {
        None
    };

    Ok(Some(NativeParam {
        name: format!("@{name}"),
        value: value.clone(),
        direction: ParamDirection::Input,
        sql_type,
        size: None,
        type_name: None,
    }))
}

fn sized_marker_param(bare: &str, ty: SqlType, direction: ParamDirection) -> NativeParam {
    NativeParam {
        name: format!("@{bare}"),
        value: SqlValue::Null,
        direction,
        sql_type: Some(ty),
        size: ty.is_variable_size().then_some(DEFAULT_VARIABLE_CAPACITY),
        type_name: None,
    }
}

/// An explicit field bag that can merge its readable fields into a command's
/// parameter store and receive output parameter values back. Replaces the
/// reflection-driven parameter object of schema-first codebases with an
/// explicitly implemented seam.
pub trait ParamBag {
    /// Name/value pairs to bind as parameters (names may carry the
    /// direction prefixes).
    fn read_params(&self) -> Vec<(String, SqlValue)>;

    /// Receive a harvested output or input/output value by (prefixed) name.
    fn write_param(&mut self, name: &str, value: &SqlValue);
}
