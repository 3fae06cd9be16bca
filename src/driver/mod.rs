//! Native driver seam.
//!
//! The execution pipeline talks to the physical database through the traits
//! in this module rather than to a concrete client library. A production
//! backend (e.g. tiberius for SQL Server) implements `Driver`, `Connection`
//! and `RowCursor`; the `mock` submodule provides an in-memory scriptable
//! backend used by this crate's tests.
//!
//! The seam carries everything the pipeline needs that a plain query API
//! does not: parameter directions, output/return parameter harvesting,
//! in-band informational messages, and a cooperative cancellation handle.

pub mod mock;

use crate::value::{SqlValue, SqlType};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;

/// Severity threshold at or above which an informational message is treated
/// as a captured fault rather than chatter.
pub const SEVERE_CLASS: u8 = 16;

/// Resolved direction of a bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDirection {
    Input,
    Output,
    InputOutput,
    ReturnValue,
    /// Table-valued parameter.
    Structured,
}

/// One parameter as handed to the native driver.
#[derive(Debug, Clone)]
pub struct NativeParam {
    /// Native name including the `@` sigil.
    pub name: String,
    pub value: SqlValue,
    pub direction: ParamDirection,
    /// Explicit native type, when the binding protocol requires one.
    pub sql_type: Option<SqlType>,
    /// Capacity for variable-length output parameters.
    pub size: Option<u32>,
    /// Server-side type name for table-valued parameters.
    pub type_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Text,
    StoredProcedure,
}

/// A fully-bound command ready for the native driver.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub text: String,
    pub kind: CommandKind,
    pub timeout: Option<Duration>,
    pub params: Vec<NativeParam>,
}

/// An informational message emitted by the engine during execution.
#[derive(Debug, Clone)]
pub struct ServerMessage {
    pub text: String,
    pub number: i32,
    pub state: u8,
    pub class: u8,
    pub source: Option<String>,
}

impl ServerMessage {
    pub fn is_severe(&self) -> bool {
        self.class >= SEVERE_CLASS
    }
}

/// A fault raised by the database engine, with its native identification.
#[derive(Debug, Clone, Error)]
#[error("Database fault {number} (severity {class}, state {state}): {message}")]
pub struct SqlFault {
    pub number: i32,
    pub state: u8,
    pub class: u8,
    pub message: String,
}

impl SqlFault {
    pub fn from_message(msg: &ServerMessage) -> Self {
        Self {
            number: msg.number,
            state: msg.state,
            class: msg.class,
            message: msg.text.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Server(SqlFault),
    #[error("{0}")]
    Transport(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Cancel handle exposed by an in-flight native command.
pub trait CancelToken: Send + Sync {
    /// Request cancellation of the in-flight call. Best-effort; a request
    /// arriving after completion is a no-op.
    fn cancel(&self);
}

/// Shared cancellation state for one logical command.
///
/// The command executor owns this; the driver registers the in-flight call's
/// token at execution start and clears it on completion. The stored reference
/// is weak so the state never keeps a finished native command alive.
#[derive(Default)]
pub struct CancelState {
    cancelled: AtomicBool,
    token: Mutex<Option<Weak<dyn CancelToken>>>,
}

impl CancelState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reset at the start of each execution.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        *self.token.lock().unwrap() = None;
    }

    /// Driver side: make the in-flight call cancellable.
    pub fn register(&self, token: &Arc<dyn CancelToken>) {
        *self.token.lock().unwrap() = Some(Arc::downgrade(token));
    }

    /// Driver side: the call completed; drop the handle.
    pub fn clear(&self) {
        *self.token.lock().unwrap() = None;
    }

    /// Caller side: flag the command cancelled and forward the request to
    /// whatever call is currently in flight, if any.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let token = self.token.lock().unwrap().clone();
        if let Some(token) = token.and_then(|w| w.upgrade()) {
            token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Callback invoked for each in-band informational message.
pub type MessageHook = Arc<dyn Fn(ServerMessage) + Send + Sync>;

/// Per-execution context handed to the driver.
pub struct ExecContext {
    /// Present only when a progress subscriber is registered; attaching the
    /// hook unconditionally would add overhead to every call.
    pub on_message: Option<MessageHook>,
    pub cancel: Arc<CancelState>,
}

impl ExecContext {
    pub fn new(cancel: Arc<CancelState>) -> Self {
        Self {
            on_message: None,
            cancel,
        }
    }
}

/// A parameter value written by the engine, read back after execution.
#[derive(Debug, Clone)]
pub struct HarvestedParam {
    /// Bare name without the `@` sigil.
    pub name: String,
    pub direction: ParamDirection,
    pub value: SqlValue,
}

/// Opens physical connections. Implementations own pooling; this layer never
/// pools connections itself.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn open(&self, connection_string: &str) -> DriverResult<Box<dyn Connection>>;
}

/// One physical connection.
#[async_trait]
pub trait Connection: Send {
    /// Run a plain statement outside the command pipeline (session setup
    /// such as the isolation-level reset).
    async fn run_batch(&mut self, sql: &str) -> DriverResult<()>;

    /// Execute a bound command to completion. Output, input/output and
    /// return parameters come back in the harvest.
    async fn execute(
        &mut self,
        spec: &CommandSpec,
        ctx: &ExecContext,
    ) -> DriverResult<Vec<HarvestedParam>>;

    /// Execute a bound command and open a row cursor over its results.
    /// The cursor is independent of this handle but the connection must stay
    /// open until the cursor is closed.
    async fn execute_reader(
        &mut self,
        spec: &CommandSpec,
        ctx: &ExecContext,
    ) -> DriverResult<Box<dyn RowCursor>>;

    /// Begin an explicit transaction with the given timeout. Queue receive
    /// transactions run far longer than engine defaults, so the timeout is
    /// caller-controlled.
    async fn begin(&mut self, timeout: Duration) -> DriverResult<()>;

    async fn commit(&mut self) -> DriverResult<()>;

    /// Force enlistment in the distributed transaction coordinator so that
    /// cross-resource work inside the transaction does not fail later.
    async fn enlist_distributed(&mut self) -> DriverResult<()>;

    async fn close(&mut self);
}

/// A live cursor over one or more result sets.
#[async_trait]
pub trait RowCursor: Send {
    /// Column names of the current result set, by ordinal.
    fn columns(&self) -> &[String];

    /// Advance one row; false at end of the current result set.
    async fn read(&mut self) -> DriverResult<bool>;

    /// Advance to the next result set; false when none remains.
    async fn next_result(&mut self) -> DriverResult<bool>;

    fn is_null(&self, ordinal: usize) -> DriverResult<bool>;

    /// Cell value at the given ordinal of the current row.
    fn value(&self, ordinal: usize) -> DriverResult<SqlValue>;

    /// Close the cursor and read back output/return parameters from the
    /// originating native command. Only valid once.
    async fn close(&mut self) -> DriverResult<Vec<HarvestedParam>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlagToken(AtomicBool);

    impl CancelToken for FlagToken {
        fn cancel(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_cancel_state_forwards_to_registered_token() {
        let state = CancelState::new();
        let token = Arc::new(FlagToken(AtomicBool::new(false)));
        let dyn_token: Arc<dyn CancelToken> = token.clone();
        state.register(&dyn_token);

        state.cancel();
        assert!(state.is_cancelled());
        assert!(token.0.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_after_clear_is_noop() {
        let state = CancelState::new();
        let token = Arc::new(FlagToken(AtomicBool::new(false)));
        let dyn_token: Arc<dyn CancelToken> = token.clone();
        state.register(&dyn_token);
        state.clear();

        state.cancel();
        assert!(state.is_cancelled());
        assert!(!token.0.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_with_dropped_token() {
        let state = CancelState::new();
        {
            let token: Arc<dyn CancelToken> = Arc::new(FlagToken(AtomicBool::new(false)));
            state.register(&token);
        }
        // token dropped; weak upgrade fails, cancel only flags
        state.cancel();
        assert!(state.is_cancelled());
    }

    #[test]
    fn test_reset_clears_flag() {
        let state = CancelState::new();
        state.cancel();
        state.reset();
        assert!(!state.is_cancelled());
    }

    #[test]
    fn test_severe_message_threshold() {
        let mut msg = ServerMessage {
            text: "boom".into(),
            number: 50000,
            state: 1,
            class: 16,
            source: None,
        };
        assert!(msg.is_severe());
        msg.class = 10;
        assert!(!msg.is_severe());
    }
}
