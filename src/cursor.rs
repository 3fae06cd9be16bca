//! Typed result cursor.
//!
//! `ResultCursor` wraps a live driver cursor together with the connection
//! that produced it and the command it came from. It applies the configured
//! value interpretations (string trimming, the 1900-01-01 sentinel date) and
//! materializes records through the row mapper, caching the column-to-field
//! mapping per result set.
//!
//! # Closing
//!
//! Two distinct teardown paths exist and exactly one of them must run:
//!
//! * [`close_reader`](ResultCursor::close_reader) drains the native command
//!   and copies output/return parameters back onto the command, leaving the
//!   connection open for a following [`end`](ResultCursor::end) (or, inside
//!   the queue listener, a transaction commit).
//! * [`end`](ResultCursor::end) closes the cursor (discarding any unharvested
//!   outputs) and the connection.
//!
//! Dropping a cursor without `end` leaks the connection; there is no
//! synchronous close that an async teardown could hide behind.

use crate::command::Command;
use crate::config::ReaderOptions;
use crate::driver::{Connection, RowCursor};
use crate::error::{DbError, DbResult};
use crate::mapper::{FromSql, Mapping, Record};
use crate::value::SqlValue;
use chrono::NaiveDate;
use std::any::{Any, TypeId};
use std::sync::Arc;

struct MappingCache {
    type_id: TypeId,
    prefix: String,
    mapping: Box<dyn Any + Send>,
}

/// A live cursor over one or more result sets.
pub struct ResultCursor<'a> {
    cursor: Option<Box<dyn RowCursor>>,
    conn: Option<Box<dyn Connection>>,
    cmd: &'a mut Command,
    options: ReaderOptions,
    cache: Option<MappingCache>,
}

impl<'a> ResultCursor<'a> {
    pub(crate) fn new(
        cursor: Box<dyn RowCursor>,
        conn: Box<dyn Connection>,
        cmd: &'a mut Command,
    ) -> Self {
        let options = cmd.config().options();
        Self {
            cursor: Some(cursor),
            conn: Some(conn),
            cmd,
            options,
            cache: None,
        }
    }

    fn require_cursor(&self) -> DbResult<&dyn RowCursor> {
        self.cursor
            .as_deref()
            .ok_or_else(|| DbError::usage("Cursor is closed"))
    }

    fn require_cursor_mut(&mut self) -> DbResult<&mut Box<dyn RowCursor>> {
        self.cursor
            .as_mut()
            .ok_or_else(|| DbError::usage("Cursor is closed"))
    }

    /// Advance one row; false at the end of the current result set.
    pub async fn read(&mut self) -> DbResult<bool> {
        Ok(self.require_cursor_mut()?.read().await?)
    }

    /// Advance to the next result set; false when none remains.
    pub async fn next_result(&mut self) -> DbResult<bool> {
        let advanced = self.require_cursor_mut()?.next_result().await?;
        // the column layout changed; any cached mapping is stale
        self.cache = None;
        Ok(advanced)
    }

    /// Column names of the current result set, by ordinal.
    pub fn columns(&self) -> DbResult<&[String]> {
        Ok(self.require_cursor()?.columns())
    }

    fn ordinal(&self, column: &str) -> DbResult<usize> {
        self.require_cursor()?
            .columns()
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .ok_or_else(|| DbError::column_not_found(column))
    }

    /// Apply the configured value interpretations to a raw cell.
    fn interpret(&self, value: SqlValue) -> SqlValue {
        match value {
            SqlValue::String(s) if self.options.trim_string_values => {
                SqlValue::String(s.trim().to_string())
            }
            SqlValue::DateTime(dt)
                if self.options.interpret_19000101_as_null && is_sentinel_date(dt) =>
            {
                SqlValue::Null
            }
            v => v,
        }
    }

    fn cell(&self, ordinal: usize) -> DbResult<SqlValue> {
        Ok(self.interpret(self.require_cursor()?.value(ordinal)?))
    }

    pub fn has_column(&self, column: &str) -> DbResult<bool> {
        Ok(self
            .require_cursor()?
            .columns()
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column)))
    }

    pub fn is_null(&self, column: &str) -> DbResult<bool> {
        Ok(self.cell(self.ordinal(column)?)?.is_null())
    }

    /// Typed cell access; null is an error. Use [`get_opt`](Self::get_opt)
    /// or [`get_or_default`](Self::get_or_default) for nullable columns.
    pub fn get<T: FromSql>(&self, column: &str) -> DbResult<T> {
        let value = self.cell(self.ordinal(column)?)?;
        if value.is_null() {
            return Err(DbError::null_column(column));
        }
        T::from_sql(&value)
            .map_err(|_| DbError::column_type(column, T::expected(), value.type_label()))
    }

    /// Typed cell access; null becomes `None`.
    pub fn get_opt<T: FromSql>(&self, column: &str) -> DbResult<Option<T>> {
        let value = self.cell(self.ordinal(column)?)?;
        if value.is_null() {
            return Ok(None);
        }
        T::from_sql(&value)
            .map(Some)
            .map_err(|_| DbError::column_type(column, T::expected(), value.type_label()))
    }

    /// Typed cell access; null becomes the type's default.
    pub fn get_or_default<T: FromSql + Default>(&self, column: &str) -> DbResult<T> {
        Ok(self.get_opt(column)?.unwrap_or_default())
    }

    /// Materialize the current row as a record.
    pub fn map_row<T: Record + 'static>(&mut self) -> DbResult<T> {
        self.map_row_prefixed("")
    }

    /// Materialize the current row, considering only columns carrying the
    /// given prefix (stripped before field matching).
    pub fn map_row_prefixed<T: Record + 'static>(&mut self, prefix: &str) -> DbResult<T> {
        let mapping = self.mapping_for::<T>(prefix)?;
        let cursor = self.require_cursor()?;

        let mut record = T::default();
        for ordinal in 0..cursor.columns().len() {
            if !mapping.maps(ordinal) {
                continue;
            }
            if cursor.is_null(ordinal)? {
                continue;
            }
            let value = self.interpret(cursor.value(ordinal)?);
            mapping.assign(&mut record, ordinal, &cursor.columns()[ordinal], &value)?;
        }
        Ok(record)
    }

    /// Drain the current result set into records.
    pub async fn read_all<T: Record + 'static>(&mut self) -> DbResult<Vec<T>> {
        self.read_all_prefixed("").await
    }

    /// Drain the current result set into records using a column prefix.
    pub async fn read_all_prefixed<T: Record + 'static>(
        &mut self,
        prefix: &str,
    ) -> DbResult<Vec<T>> {
        let mut out = Vec::new();
        while self.read().await? {
            out.push(self.map_row_prefixed::<T>(prefix)?);
        }
        Ok(out)
    }

    /// Apply a callback to every remaining row of the current result set.
    /// Consuming the rows this way exhausts the cursor.
    pub async fn for_each_row<F>(&mut self, mut f: F) -> DbResult<()>
    where
        F: FnMut(&mut Self) -> DbResult<()>,
    {
        while self.read().await? {
            f(self)?;
        }
        Ok(())
    }

    /// The column-to-field mapping for the current result set, built on
    /// first use and reused across rows.
    fn mapping_for<T: Record + 'static>(&mut self, prefix: &str) -> DbResult<Arc<Mapping<T>>> {
        if let Some(cache) = &self.cache {
            if cache.type_id == TypeId::of::<T>() && cache.prefix == prefix {
                if let Some(mapping) = cache.mapping.downcast_ref::<Arc<Mapping<T>>>() {
                    return Ok(mapping.clone());
                }
            }
        }
        let mapping = Arc::new(Mapping::<T>::build(self.require_cursor()?.columns(), prefix));
        self.cache = Some(MappingCache {
            type_id: TypeId::of::<T>(),
            prefix: prefix.to_string(),
            mapping: Box::new(mapping.clone()),
        });
        Ok(mapping)
    }

    /// Close the cursor and harvest output/return parameters back onto the
    /// command. The connection stays open; follow with [`end`](Self::end).
    /// A second call is a no-op.
    pub async fn close_reader(&mut self) -> DbResult<()> {
        let Some(mut cursor) = self.cursor.take() else {
            return Ok(());
        };
        let harvest = cursor.close().await?;
        self.cmd.load_parameters(harvest)
    }

    /// Close the cursor (without harvesting) and the connection. Idempotent.
    pub async fn end(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            let _ = cursor.close().await;
        }
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }

    /// Hand the still-open connection to the caller, e.g. to commit a
    /// transaction the cursor ran under. Valid after `close_reader`.
    pub(crate) fn take_connection(&mut self) -> Option<Box<dyn Connection>> {
        self.conn.take()
    }
}

fn is_sentinel_date(dt: chrono::NaiveDateTime) -> bool {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .map(|d| d.and_hms_opt(0, 0, 0) == Some(dt))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_is_midnight_only() {
        let midnight = NaiveDate::from_ymd_opt(1900, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let later = NaiveDate::from_ymd_opt(1900, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 1)
            .unwrap();
        assert!(is_sentinel_date(midnight));
        assert!(!is_sentinel_date(later));
    }
}
