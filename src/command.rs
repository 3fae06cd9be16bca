//! Command execution pipeline.
//!
//! A `Command` owns one call's worth of state: the SQL text or procedure
//! name, the parameter store, timeout, cancellation state and the in-band
//! message plumbing. One execution at a time; a command may be reused
//! sequentially and keeps accumulated parameter state (including harvested
//! outputs) until cleared.
//!
//! # Execution sequence
//!
//! 1. Bind the parameter store into a native command spec.
//! 2. Acquire a connection from the config.
//! 3. Attach the in-band message hook, but only when a progress subscriber
//!    is registered.
//! 4. Raise the pre-execution notification with the interpolated text.
//! 5. Execute; readers hand the open connection to the `ResultCursor`.
//! 6. Harvest output/return parameters (non-reader) and classify failures.

use crate::config::DbConfig;
use crate::cursor::ResultCursor;
use crate::driver::{
    CancelState, CommandKind, CommandSpec, Connection, ExecContext, HarvestedParam, NativeParam,
    ParamDirection, ServerMessage, SqlFault,
};
use crate::error::{DbError, DbResult};
use crate::params::{
    self, INPUT_OUTPUT_PREFIX, OUTPUT_PREFIX, ParamBag, ParamEntry, ParamValue, RETURN_PARAM,
};
use crate::progress::ProgressReport;
use crate::value::{SqlType, SqlValue};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Error number reserved for application-raised faults (`RAISERROR` without
/// an explicit number). These pass through untranslated and unlogged; the
/// application layer owns their presentation.
pub const USER_RAISED_ERROR: i32 = 50000;

/// Cloneable handle that cancels a command's in-flight execution from
/// another task.
#[derive(Clone)]
pub struct CancelSignal {
    state: Arc<CancelState>,
}

impl CancelSignal {
    /// Best-effort: flags the command cancelled and forwards the request to
    /// the currently-executing native call, if any.
    pub fn cancel(&self) {
        self.state.cancel();
    }
}

type ProgressCallback = Arc<dyn Fn(ProgressReport) + Send + Sync>;
type PreExecCallback = Box<dyn Fn(&CommandSpec, &str) + Send + Sync>;

/// A parameterized command against one database.
pub struct Command {
    conf: DbConfig,
    kind: CommandKind,
    text: String,
    name: Option<String>,
    /// Keyed by uppercased name; entries keep the caller's spelling.
    params: BTreeMap<String, ParamEntry>,
    timeout_secs: i32,
    next_param: u32,
    next_table: u32,
    cancel: Arc<CancelState>,
    pending_fault: Arc<Mutex<Option<SqlFault>>>,
    on_progress: Option<ProgressCallback>,
    on_pre_exec: Option<PreExecCallback>,
}

impl Command {
    /// A plain text command.
    pub fn new(conf: DbConfig, text: impl Into<String>) -> Self {
        Self {
            conf,
            kind: CommandKind::Text,
            text: text.into(),
            name: None,
            params: BTreeMap::new(),
            timeout_secs: -1,
            next_param: 1000,
            next_table: 1000,
            cancel: CancelState::new(),
            pending_fault: Arc::new(Mutex::new(None)),
            on_progress: None,
            on_pre_exec: None,
        }
    }

    /// A stored procedure command; the procedure name is schema-qualified
    /// through the config.
    pub fn stored_procedure(conf: DbConfig, name: &str) -> Self {
        let text = conf.format_object(name);
        let mut cmd = Self::new(conf, text);
        cmd.kind = CommandKind::StoredProcedure;
        cmd
    }

    /// Attach a human-readable name used in logging. Whitespace-only names
    /// are a usage error.
    pub fn with_name(mut self, name: impl Into<String>) -> DbResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DbError::usage("Command name cannot be whitespace"));
        }
        self.name = Some(name);
        Ok(self)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Timeout in seconds; `-1` delegates to the driver default.
    pub fn timeout_secs(&self) -> i32 {
        self.timeout_secs
    }

    pub fn set_timeout_secs(&mut self, secs: i32) {
        self.timeout_secs = secs;
    }

    // ---------------------------------------------------------------------
    // Parameter store
    // ---------------------------------------------------------------------

    fn store_key(name: &str) -> String {
        name.to_ascii_uppercase()
    }

    fn normalize(name: &str) -> &str {
        name.strip_prefix('@').unwrap_or(name)
    }

    /// Set a parameter. Direction is resolved from the key prefix at bind
    /// time; a later set with the same key overwrites. The reserved return
    /// key cannot be set directly.
    pub fn set(&mut self, name: &str, value: impl Into<SqlValue>) -> DbResult<()> {
        self.set_entry(name, ParamValue::Value(value.into()))
    }

    /// Declare an output (`ZO_`) or input/output (`ZX_`) parameter by native
    /// type. Requires one of those prefixes on the key.
    pub fn set_type(&mut self, name: &str, ty: SqlType) -> DbResult<()> {
        let bare = Self::normalize(name);
        if !params::has_direction_prefix(bare) {
            return Err(DbError::usage(format!(
                "Type marker for '{name}' requires the '{OUTPUT_PREFIX}' or '{INPUT_OUTPUT_PREFIX}' key prefix"
            )));
        }
        self.set_entry(name, ParamValue::TypeMarker(ty))
    }

    fn set_entry(&mut self, name: &str, value: ParamValue) -> DbResult<()> {
        let bare = Self::normalize(name);
        if params::is_return_key(bare) {
            return Err(DbError::usage(format!(
                "'{RETURN_PARAM}' is reserved; it is populated by execution"
            )));
        }
        self.insert_raw(bare, value);
        Ok(())
    }

    fn insert_raw(&mut self, name: &str, value: ParamValue) {
        self.params.insert(
            Self::store_key(name),
            ParamEntry {
                name: name.to_string(),
                value,
            },
        );
    }

    /// Read a parameter value back, including harvested outputs.
    pub fn get(&self, name: &str) -> DbResult<&SqlValue> {
        let bare = Self::normalize(name);
        let entry = self
            .params
            .get(&Self::store_key(bare))
            .ok_or_else(|| DbError::parameter_not_found(bare))?;
        match &entry.value {
            ParamValue::Value(v) => Ok(v),
            ParamValue::TypeMarker(_) => Err(DbError::usage(format!(
                "Parameter '{bare}' holds a type marker, not a value"
            ))),
        }
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params
            .contains_key(&Self::store_key(Self::normalize(name)))
    }

    pub fn clear_params(&mut self) {
        self.params.clear();
    }

    /// Return code of the last non-reader execution.
    pub fn return_value(&self) -> DbResult<i32> {
        match self.get(RETURN_PARAM) {
            Ok(SqlValue::Int(v)) => Ok(*v),
            Ok(_) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Merge a field bag's readable fields into the parameter store as
    /// (possibly prefixed) parameters.
    pub fn apply_params(&mut self, bag: &impl ParamBag) -> DbResult<()> {
        for (name, value) in bag.read_params() {
            self.set(&name, value)?;
        }
        Ok(())
    }

    /// Copy harvested output and input/output values onto a field bag's
    /// matching writable fields.
    pub fn copy_outputs_to(&self, bag: &mut impl ParamBag) {
        for entry in self.params.values() {
            if !params::has_direction_prefix(&entry.name) {
                continue;
            }
            if let ParamValue::Value(v) = &entry.value {
                bag.write_param(&entry.name, v);
            }
        }
    }

    /// Auto-generated parameter name (`@p1000`, `@p1001`, ...). Collaborators
    /// such as IN-list builders use this to avoid collisions with
    /// caller-supplied parameters.
    pub fn new_param_name(&mut self) -> String {
        let n = self.next_param;
        self.next_param += 1;
        format!("@p{n}")
    }

    /// Auto-generated table alias (`t1000`, `t1001`, ...).
    pub fn new_table_alias(&mut self) -> String {
        let n = self.next_table;
        self.next_table += 1;
        format!("t{n}")
    }

    // ---------------------------------------------------------------------
    // Events and cancellation
    // ---------------------------------------------------------------------

    /// Subscribe to in-band progress reports. Registering a subscriber is
    /// what turns on the message hook for subsequent executions.
    pub fn on_progress(&mut self, callback: impl Fn(ProgressReport) + Send + Sync + 'static) {
        self.on_progress = Some(Arc::new(callback));
    }

    /// Subscribe to the pre-execution notification carrying the bound spec
    /// and the interpolated debug text.
    pub fn on_pre_exec(&mut self, callback: impl Fn(&CommandSpec, &str) + Send + Sync + 'static) {
        self.on_pre_exec = Some(Box::new(callback));
    }

    /// Handle for cancelling from another task.
    pub fn cancel_signal(&self) -> CancelSignal {
        CancelSignal {
            state: self.cancel.clone(),
        }
    }

    /// Cancel the in-flight execution, if any. A cancel arriving after
    /// completion is a no-op.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    // ---------------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------------

    /// Execute to completion, harvest output parameters and report the
    /// procedure's return code.
    pub async fn execute(&mut self) -> DbResult<i32> {
        let spec = self.build_spec(true)?;
        let text = interpolated_text(&spec);
        let mut conn = self.conf.open().await?;
        let ctx = self.exec_context();
        self.notify_pre_exec(&spec, &text);

        let result = conn.execute(&spec, &ctx).await;
        conn.close().await;

        let harvest = match result {
            Ok(harvest) => harvest,
            Err(e) => return Err(self.translate(e.into(), &text)),
        };
        if let Err(e) = self.load_parameters(harvest) {
            return Err(self.translate(e, &text));
        }
        self.return_value()
    }

    /// Execute and stream results. The returned cursor keeps the connection
    /// open; the caller must run exactly one of `close_reader`+`end` or
    /// `end` on it.
    pub async fn execute_reader(&mut self) -> DbResult<ResultCursor<'_>> {
        let spec = self.build_spec(false)?;
        let conn = self.conf.open().await?;
        self.reader_with_conn(conn, spec).await
    }

    /// Execute a reader on a caller-supplied connection, e.g. one carrying
    /// an explicit transaction. The connection is closed on failure.
    pub async fn execute_reader_on(
        &mut self,
        mut conn: Box<dyn Connection>,
    ) -> DbResult<ResultCursor<'_>> {
        let spec = match self.build_spec(false) {
            Ok(spec) => spec,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };
        self.reader_with_conn(conn, spec).await
    }

    async fn reader_with_conn(
        &mut self,
        mut conn: Box<dyn Connection>,
        spec: CommandSpec,
    ) -> DbResult<ResultCursor<'_>> {
        let text = interpolated_text(&spec);
        let ctx = self.exec_context();
        self.notify_pre_exec(&spec, &text);

        match conn.execute_reader(&spec, &ctx).await {
            Ok(cursor) => Ok(ResultCursor::new(cursor, conn, self)),
            Err(e) => {
                conn.close().await;
                Err(self.translate(e.into(), &text))
            }
        }
    }

    pub(crate) fn config(&self) -> &DbConfig {
        &self.conf
    }

    /// Bind the parameter store into a native command spec.
    fn build_spec(&self, include_return: bool) -> DbResult<CommandSpec> {
        if self.text.trim().is_empty() {
            return Err(DbError::usage("Command text is empty"));
        }
        let mut native = Vec::with_capacity(self.params.len() + 1);
        for entry in self.params.values() {
            if let Some(p) = params::bind_native(entry, self.conf.options())? {
                native.push(p);
            }
        }
        if include_return {
            native.push(NativeParam {
                name: "@RETURN_VALUE".to_string(),
                value: SqlValue::Null,
                direction: ParamDirection::ReturnValue,
                sql_type: None,
                size: None,
                type_name: None,
            });
        }
        Ok(CommandSpec {
            text: self.text.clone(),
            kind: self.kind,
            timeout: (self.timeout_secs >= 0)
                .then(|| Duration::from_secs(self.timeout_secs as u64)),
            params: native,
        })
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.text)
    }

    /// Reset per-execution state and build the driver context, attaching the
    /// message hook only when a progress subscriber is registered.
    fn exec_context(&self) -> ExecContext {
        self.cancel.reset();
        *self.pending_fault.lock().unwrap() = None;

        let mut ctx = ExecContext::new(self.cancel.clone());
        if let Some(progress) = &self.on_progress {
            let progress = progress.clone();
            let pending = self.pending_fault.clone();
            let label = self.label().to_string();
            ctx.on_message = Some(Arc::new(move |msg: ServerMessage| {
                if let Some(mut report) = ProgressReport::parse(&msg.text) {
                    report.source = msg.source.clone();
                    progress(report);
                } else if msg.is_severe() {
                    // the driver's message channel is not a safe place to
                    // unwind from; re-raised at the next harvest
                    *pending.lock().unwrap() = Some(SqlFault::from_message(&msg));
                } else {
                    debug!(command = %label, message = %msg.text, "received output from sql command");
                }
            }));
        }
        ctx
    }

    fn notify_pre_exec(&self, spec: &CommandSpec, text: &str) {
        if let Some(callback) = &self.on_pre_exec {
            callback(spec, text);
        }
        if let Some(name) = &self.name {
            debug!(
                command = %name,
                connection = %self.conf.connection_string(),
                schema = %self.conf.schema(),
                text = %text,
                "executing command"
            );
        }
    }

    /// Copy engine-written output/return parameter values back into the
    /// store, then surface any severe fault captured on the message channel
    /// during execution.
    pub(crate) fn load_parameters(&mut self, harvest: Vec<HarvestedParam>) -> DbResult<()> {
        for p in harvest {
            match p.direction {
                ParamDirection::ReturnValue => {
                    let code = match p.value {
                        SqlValue::Int(v) => v,
                        SqlValue::BigInt(v) => v as i32,
                        _ => 0,
                    };
                    self.insert_raw(RETURN_PARAM, ParamValue::Value(SqlValue::Int(code)));
                }
                ParamDirection::InputOutput => {
                    let key = format!("{INPUT_OUTPUT_PREFIX}{}", p.name);
                    self.insert_raw(&key, ParamValue::Value(p.value));
                }
                ParamDirection::Output => {
                    let key = format!("{OUTPUT_PREFIX}{}", p.name);
                    self.insert_raw(&key, ParamValue::Value(p.value));
                }
                ParamDirection::Input | ParamDirection::Structured => {}
            }
        }

        if let Some(fault) = self.pending_fault.lock().unwrap().take() {
            return Err(DbError::Sql { fault });
        }
        Ok(())
    }

    /// Classify a failed call once, before rethrow. Cooperative cancellation
    /// and user-raised faults stay unlogged by design.
    fn translate(&self, err: DbError, text: &str) -> DbError {
        if let Some(fault) = err.sql_fault() {
            // the engine reports a cancelled call as number 0, state 0,
            // class 11; only our own cancel flag disambiguates it
            if fault.number == 0
                && fault.state == 0
                && fault.class == 11
                && self.cancel.is_cancelled()
            {
                return DbError::cancelled(fault.message.clone());
            }
            if fault.number == USER_RAISED_ERROR {
                return err;
            }
        }
        warn!(
            schema = %self.conf.schema(),
            command = %text,
            error = %err,
            "exception occurred while executing command"
        );
        err
    }
}

/// Fully-interpolated command text for logging and the pre-execution
/// notification. For stored procedures this is the procedure name; for plain
/// text commands, parameter references are literal-substituted. Best-effort
/// human-readable debug text, never an executable artifact.
pub(crate) fn interpolated_text(spec: &CommandSpec) -> String {
    if spec.kind == CommandKind::StoredProcedure {
        return spec.text.clone();
    }
    let mut params: Vec<&NativeParam> = spec.params.iter().collect();
    // longest first so @p10 is not clobbered by @p1
    params.sort_by_key(|p| std::cmp::Reverse(p.name.len()));

    let mut text = spec.text.clone();
    for p in &params {
        match p.direction {
            ParamDirection::Input | ParamDirection::InputOutput => {
                text = text.replace(&p.name, &sql_literal(&p.value));
            }
            // output-only and table parameters keep their names
            _ => {}
        }
    }
    text
}

fn sql_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Bool(true) => "1".to_string(),
        SqlValue::Bool(false) => "0".to_string(),
        SqlValue::Int(v) => v.to_string(),
        SqlValue::BigInt(v) => v.to_string(),
        SqlValue::Float(v) => v.to_string(),
        SqlValue::String(s) => format!("N'{}'", s.replace('\'', "''")),
        SqlValue::Bytes(b) => {
            let mut hex = String::with_capacity(2 + b.len() * 2);
            hex.push_str("0x");
            for byte in b {
                hex.push_str(&format!("{byte:02X}"));
            }
            hex
        }
        SqlValue::Guid(g) => format!("'{g}'"),
        SqlValue::DateTime(dt) => format!("'{}'", dt.format("%Y-%m-%dT%H:%M:%S%.3f")),
        SqlValue::Table(_) => "(table value)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;

    fn config() -> DbConfig {
        DbConfig::new(Arc::new(MockDriver::new()), "Server=.")
    }

    #[test]
    fn test_param_round_trip() {
        let mut cmd = config().command("SELECT 1");
        cmd.set("CustomerID", 42).unwrap();
        assert_eq!(cmd.get("CustomerID").unwrap(), &SqlValue::Int(42));
        // leading sigil and different case resolve to the same entry
        assert_eq!(cmd.get("@customerid").unwrap(), &SqlValue::Int(42));
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let mut cmd = config().command("SELECT 1");
        cmd.set("A", 1).unwrap();
        cmd.set("a", "two").unwrap();
        assert_eq!(cmd.get("A").unwrap(), &SqlValue::from("two"));
    }

    #[test]
    fn test_get_unset_parameter_fails() {
        let cmd = config().command("SELECT 1");
        assert!(matches!(
            cmd.get("Missing"),
            Err(DbError::ParameterNotFound { .. })
        ));
    }

    #[test]
    fn test_return_key_is_reserved() {
        let mut cmd = config().command("SELECT 1");
        assert!(cmd.set(RETURN_PARAM, 1).is_err());
    }

    #[test]
    fn test_set_type_requires_direction_prefix() {
        let mut cmd = config().command("SELECT 1");
        assert!(cmd.set_type("Plain", SqlType::Int).is_err());
        assert!(cmd.set_type("ZO_Out", SqlType::Int).is_ok());
        assert!(cmd.set_type("ZX_Both", SqlType::Int).is_ok());
    }

    #[test]
    fn test_generated_names_and_aliases() {
        let mut cmd = config().command("SELECT 1");
        assert_eq!(cmd.new_param_name(), "@p1000");
        assert_eq!(cmd.new_param_name(), "@p1001");
        assert_eq!(cmd.new_table_alias(), "t1000");
        assert_eq!(cmd.new_table_alias(), "t1001");
    }

    #[test]
    fn test_whitespace_command_name_rejected() {
        assert!(config().command("SELECT 1").with_name("   ").is_err());
        assert!(config().command("SELECT 1").with_name("Lookup").is_ok());
    }

    #[test]
    fn test_stored_procedure_is_schema_qualified() {
        let cmd = config().stored_procedure("spPost");
        assert_eq!(cmd.text(), "[dbo].[spPost]");
    }

    #[test]
    fn test_interpolated_text_substitutes_literals() {
        let spec = CommandSpec {
            text: "SELECT * FROM T WHERE A = @p1 AND B = @p10".to_string(),
            kind: CommandKind::Text,
            timeout: None,
            params: vec![
                NativeParam {
                    name: "@p1".to_string(),
                    value: SqlValue::Int(5),
                    direction: ParamDirection::Input,
                    sql_type: None,
                    size: None,
                    type_name: None,
                },
                NativeParam {
                    name: "@p10".to_string(),
                    value: SqlValue::from("O'Neil"),
                    direction: ParamDirection::Input,
                    sql_type: None,
                    size: None,
                    type_name: None,
                },
            ],
        };
        assert_eq!(
            interpolated_text(&spec),
            "SELECT * FROM T WHERE A = 5 AND B = N'O''Neil'"
        );
    }

    #[test]
    fn test_interpolated_text_for_procedures_is_the_name() {
        let spec = CommandSpec {
            text: "[dbo].[spPost]".to_string(),
            kind: CommandKind::StoredProcedure,
            timeout: None,
            params: vec![],
        };
        assert_eq!(interpolated_text(&spec), "[dbo].[spPost]");
    }

    #[test]
    fn test_sql_literal_rendering() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        assert_eq!(sql_literal(&SqlValue::Null), "NULL");
        assert_eq!(sql_literal(&SqlValue::Bool(true)), "1");
        assert_eq!(sql_literal(&SqlValue::Bytes(vec![0xAB, 0x01])), "0xAB01");
        assert_eq!(
            sql_literal(&SqlValue::DateTime(date)),
            "'2024-03-01T10:30:00.000'"
        );
    }
}
