//! Connection configuration and the connection factory.
//!
//! `DbConfig` pairs a native driver with a connection string, target schema
//! and reader options. It is cheap to clone and is the factory both for
//! physical connections and for `Command` instances.

use crate::client_name;
use crate::command::Command;
use crate::driver::{Connection, Driver};
use crate::error::DbResult;
use std::sync::Arc;

/// Default schema for stored procedure resolution.
pub const DEFAULT_SCHEMA: &str = "dbo";

const ISOLATION_RESET: &str = "SET TRANSACTION ISOLATION LEVEL READ COMMITTED;";

/// Value-interpretation options applied by the result cursor and row mapper.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct ReaderOptions {
    /// Trim leading/trailing whitespace from text columns on read.
    pub trim_string_values: bool,
    /// Treat the legacy sentinel date 1900-01-01 as null on read.
    pub interpret_19000101_as_null: bool,
    /// Bind 7-bit-clean text input parameters as single-byte text instead of
    /// the wide default, so indexes on SBCS columns stay usable.
    pub default_parameters_to_sbcs: bool,
}

struct DbConfigInner {
    driver: Arc<dyn Driver>,
    connection_string: String,
    schema: String,
    options: ReaderOptions,
}

/// Connection factory and command source.
#[derive(Clone)]
pub struct DbConfig {
    inner: Arc<DbConfigInner>,
}

impl DbConfig {
    pub fn new(driver: Arc<dyn Driver>, connection_string: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DbConfigInner {
                driver,
                connection_string: connection_string.into(),
                schema: DEFAULT_SCHEMA.to_string(),
                options: ReaderOptions::default(),
            }),
        }
    }

    pub fn with_schema(self, schema: impl Into<String>) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(DbConfigInner {
                driver: inner.driver.clone(),
                connection_string: inner.connection_string.clone(),
                schema: schema.into(),
                options: inner.options,
            }),
        }
    }

    pub fn with_options(self, options: ReaderOptions) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(DbConfigInner {
                driver: inner.driver.clone(),
                connection_string: inner.connection_string.clone(),
                schema: inner.schema.clone(),
                options,
            }),
        }
    }

    pub fn schema(&self) -> &str {
        &self.inner.schema
    }

    pub fn options(&self) -> ReaderOptions {
        self.inner.options
    }

    pub fn connection_string(&self) -> &str {
        &self.inner.connection_string
    }

    /// Schema-qualified object name, e.g. `[dbo].[spPostInvoice]`.
    pub fn format_object(&self, object: &str) -> String {
        format!("[{}].[{}]", self.inner.schema, object)
    }

    /// Open a physical connection: apply the client-name suffix to the
    /// connection string, open through the driver, and reset the session's
    /// isolation level (pooled sessions can leak a different level set by a
    /// previous transactional user).
    pub async fn open(&self) -> DbResult<Box<dyn Connection>> {
        let constr = self.effective_connection_string();
        let mut conn = self.inner.driver.open(&constr).await?;
        if let Err(e) = conn.run_batch(ISOLATION_RESET).await {
            conn.close().await;
            return Err(e.into());
        }
        Ok(conn)
    }

    /// Connection string with the application-name suffix applied.
    pub(crate) fn effective_connection_string(&self) -> String {
        append_application_name(&self.inner.connection_string, &client_name::name_suffix())
    }

    /// A plain text command against this database.
    pub fn command(&self, text: impl Into<String>) -> Command {
        Command::new(self.clone(), text)
    }

    /// A stored procedure command; the name is schema-qualified through
    /// [`format_object`](Self::format_object).
    pub fn stored_procedure(&self, name: &str) -> Command {
        Command::stored_procedure(self.clone(), name)
    }
}

/// Append `suffix` to the `Application Name` entry of a key=value;
/// connection string, adding the entry when absent. The connection string is
/// otherwise treated as opaque.
fn append_application_name(connection_string: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return connection_string.to_string();
    }

    let mut parts: Vec<String> = Vec::new();
    let mut found = false;
    for part in connection_string.split(';') {
        let (key, _) = part.split_once('=').unwrap_or((part, ""));
        let key = key.trim();
        if key.eq_ignore_ascii_case("application name") || key.eq_ignore_ascii_case("app name") {
            found = true;
            parts.push(format!("{}{}", part.trim_end(), suffix));
        } else {
            parts.push(part.to_string());
        }
    }

    if !found {
        let fresh = suffix.trim_start_matches('-');
        let sep = if connection_string.trim_end().ends_with(';') || connection_string.is_empty() {
            ""
        } else {
            ";"
        };
        return format!("{connection_string}{sep}Application Name={fresh}");
    }
    parts.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;

    fn config() -> DbConfig {
        DbConfig::new(
            Arc::new(MockDriver::new()),
            "Server=.;Database=app;Application Name=Pool",
        )
    }

    #[test]
    fn test_format_object_uses_schema() {
        let conf = config().with_schema("audit");
        assert_eq!(conf.format_object("spWrite"), "[audit].[spWrite]");
    }

    #[test]
    fn test_default_schema() {
        assert_eq!(config().schema(), DEFAULT_SCHEMA);
    }

    #[test]
    fn test_append_to_existing_application_name() {
        let result = append_application_name("Server=.;Application Name=Pool", "-Svc-Job");
        assert_eq!(result, "Server=.;Application Name=Pool-Svc-Job");
    }

    #[test]
    fn test_append_adds_missing_entry() {
        let result = append_application_name("Server=.", "-Svc");
        assert_eq!(result, "Server=.;Application Name=Svc");
    }

    #[test]
    fn test_append_matches_key_case_insensitively() {
        let result = append_application_name("APP NAME=Pool", "-Svc");
        assert_eq!(result, "APP NAME=Pool-Svc");
    }

    #[tokio::test]
    async fn test_open_resets_isolation_level() {
        let driver = MockDriver::new();
        let conf = DbConfig::new(Arc::new(driver.clone()), "Server=.");
        let mut conn = conf.open().await.unwrap();
        conn.close().await;

        let log = driver.log();
        assert_eq!(log.batches, vec![ISOLATION_RESET.to_string()]);
        assert!(log.opened[0].contains("Application Name="));
    }
}
