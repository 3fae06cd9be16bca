//! SQL Call Library
//!
//! This library provides a thin data-access layer over a SQL Server style
//! database: parameterized command execution with prefix-encoded parameter
//! directions, output/return parameter harvesting, in-band progress
//! reporting, a typed result cursor with record mapping, and a transactional
//! queue listener.

pub mod client_name;
pub mod command;
pub mod config;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod listener;
pub mod mapper;
pub mod params;
pub mod progress;
pub mod value;

pub use command::{CancelSignal, Command, USER_RAISED_ERROR};
pub use config::{DEFAULT_SCHEMA, DbConfig, ReaderOptions};
pub use cursor::ResultCursor;
pub use error::{DbError, DbResult};
pub use listener::{MIN_RECEIVE_TIMEOUT_SECS, MessageHandler, QueueListener};
pub use mapper::{FieldDef, FromSql, Mapping, Record};
pub use params::{
    INPUT_OUTPUT_PREFIX, OUTPUT_PREFIX, ParamBag, RETURN_PARAM, TABLE_PREFIX,
};
pub use progress::ProgressReport;
pub use value::{SqlType, SqlValue, TableValue};
