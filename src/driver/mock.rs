//! In-memory scriptable driver backend.
//!
//! Each queued `MockExecution` describes what the next command execution
//! observes: in-band messages, result sets, output/return parameter values,
//! a fault, or a receive call that blocks until cancelled. The driver keeps
//! an activity log (connection strings, session batches, transactions,
//! bound command specs) so tests can assert on the pipeline's behavior.

use super::{
    CancelToken, CommandSpec, Connection, Driver, DriverError, DriverResult, ExecContext,
    HarvestedParam, ParamDirection, RowCursor, ServerMessage, SqlFault,
};
use crate::value::SqlValue;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// One result set delivered by a scripted execution.
#[derive(Debug, Clone, Default)]
pub struct MockResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

/// Script for a single command execution.
#[derive(Default)]
pub struct MockExecution {
    messages: Vec<ServerMessage>,
    result_sets: Vec<MockResultSet>,
    outputs: Vec<(String, SqlValue)>,
    return_value: i32,
    fault: Option<DriverError>,
    block_until_cancel: bool,
}

impl MockExecution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(mut self, msg: ServerMessage) -> Self {
        self.messages.push(msg);
        self
    }

    /// Queue a low-severity informational message.
    pub fn with_info(self, text: impl Into<String>) -> Self {
        self.with_message(ServerMessage {
            text: text.into(),
            number: 0,
            state: 1,
            class: 0,
            source: None,
        })
    }

    pub fn with_result_set(mut self, columns: &[&str], rows: Vec<Vec<SqlValue>>) -> Self {
        self.result_sets.push(MockResultSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        });
        self
    }

    /// Value the engine "wrote" into an output or input/output parameter,
    /// keyed by bare parameter name.
    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.outputs.push((name.into(), value.into()));
        self
    }

    pub fn with_return_value(mut self, value: i32) -> Self {
        self.return_value = value;
        self
    }

    pub fn failing(fault: SqlFault) -> Self {
        Self {
            fault: Some(DriverError::Server(fault)),
            ..Self::default()
        }
    }

    pub fn failing_transport(message: impl Into<String>) -> Self {
        Self {
            fault: Some(DriverError::Transport(message.into())),
            ..Self::default()
        }
    }

    /// A receive-style execution that blocks until the command is cancelled,
    /// then fails with the driver's cancellation fault shape.
    pub fn blocking_until_cancel() -> Self {
        Self {
            block_until_cancel: true,
            ..Self::default()
        }
    }
}

/// Activity observed by the mock backend.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    pub opened: Vec<String>,
    pub batches: Vec<String>,
    pub begun: Vec<Duration>,
    pub commits: u32,
    pub enlists: u32,
    pub closes: u32,
    pub specs: Vec<CommandSpec>,
}

#[derive(Default)]
struct MockState {
    scripts: Mutex<VecDeque<MockExecution>>,
    log: Mutex<MockLog>,
}

/// Scriptable in-memory driver.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the script for the next execution.
    pub fn push(&self, exec: MockExecution) {
        self.state.scripts.lock().unwrap().push_back(exec);
    }

    pub fn log(&self) -> MockLog {
        self.state.log.lock().unwrap().clone()
    }

    /// Number of queued executions not yet consumed.
    pub fn remaining(&self) -> usize {
        self.state.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn open(&self, connection_string: &str) -> DriverResult<Box<dyn Connection>> {
        self.state
            .log
            .lock()
            .unwrap()
            .opened
            .push(connection_string.to_string());
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct MockCancelToken {
    notify: Notify,
}

impl MockCancelToken {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            notify: Notify::new(),
        })
    }
}

impl CancelToken for MockCancelToken {
    fn cancel(&self) {
        // notify_one stores a permit, so a cancel that races ahead of the
        // blocking wait is not lost
        self.notify.notify_one();
    }
}

struct MockConnection {
    state: Arc<MockState>,
    closed: bool,
}

impl MockConnection {
    fn next_script(&self, spec: &CommandSpec) -> MockExecution {
        let mut log = self.state.log.lock().unwrap();
        log.specs.push(spec.clone());
        drop(log);
        self.state
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default()
    }

    /// Run the scripted pre-result phase shared by both execution shapes:
    /// cancel registration, message delivery, blocking, scripted faults.
    async fn run_preamble(
        &self,
        exec: &mut MockExecution,
        ctx: &ExecContext,
    ) -> DriverResult<()> {
        let token = MockCancelToken::new();
        let dyn_token: Arc<dyn CancelToken> = token.clone();
        ctx.cancel.register(&dyn_token);

        if let Some(hook) = &ctx.on_message {
            for msg in exec.messages.drain(..) {
                hook(msg);
            }
        }

        if exec.block_until_cancel {
            token.notify.notified().await;
            ctx.cancel.clear();
            return Err(DriverError::Server(SqlFault {
                number: 0,
                state: 0,
                class: 11,
                message: "Operation cancelled by user.".to_string(),
            }));
        }

        ctx.cancel.clear();
        if let Some(fault) = exec.fault.take() {
            return Err(fault);
        }
        Ok(())
    }
}

fn build_harvest(spec: &CommandSpec, exec: &MockExecution) -> Vec<HarvestedParam> {
    let mut harvest = Vec::new();
    for p in &spec.params {
        let bare = p.name.trim_start_matches('@');
        match p.direction {
            ParamDirection::Output | ParamDirection::InputOutput => {
                let value = exec
                    .outputs
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case(bare))
                    .map(|(_, v)| v.clone())
                    .unwrap_or(SqlValue::Null);
                harvest.push(HarvestedParam {
                    name: bare.to_string(),
                    direction: p.direction,
                    value,
                });
            }
            ParamDirection::ReturnValue => {
                harvest.push(HarvestedParam {
                    name: bare.to_string(),
                    direction: p.direction,
                    value: SqlValue::Int(exec.return_value),
                });
            }
            ParamDirection::Input | ParamDirection::Structured => {}
        }
    }
    harvest
}

#[async_trait]
impl Connection for MockConnection {
    async fn run_batch(&mut self, sql: &str) -> DriverResult<()> {
        self.state.log.lock().unwrap().batches.push(sql.to_string());
        Ok(())
    }

    async fn execute(
        &mut self,
        spec: &CommandSpec,
        ctx: &ExecContext,
    ) -> DriverResult<Vec<HarvestedParam>> {
        let mut exec = self.next_script(spec);
        self.run_preamble(&mut exec, ctx).await?;
        Ok(build_harvest(spec, &exec))
    }

    async fn execute_reader(
        &mut self,
        spec: &CommandSpec,
        ctx: &ExecContext,
    ) -> DriverResult<Box<dyn RowCursor>> {
        let mut exec = self.next_script(spec);
        self.run_preamble(&mut exec, ctx).await?;
        let harvest = build_harvest(spec, &exec);
        Ok(Box::new(MockRowCursor {
            sets: exec.result_sets,
            set_idx: 0,
            row: None,
            harvest,
            closed: false,
        }))
    }

    async fn begin(&mut self, timeout: Duration) -> DriverResult<()> {
        self.state.log.lock().unwrap().begun.push(timeout);
        Ok(())
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.state.log.lock().unwrap().commits += 1;
        Ok(())
    }

    async fn enlist_distributed(&mut self) -> DriverResult<()> {
        self.state.log.lock().unwrap().enlists += 1;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.log.lock().unwrap().closes += 1;
        }
    }
}

struct MockRowCursor {
    sets: Vec<MockResultSet>,
    set_idx: usize,
    row: Option<usize>,
    harvest: Vec<HarvestedParam>,
    closed: bool,
}

impl MockRowCursor {
    fn current_set(&self) -> Option<&MockResultSet> {
        self.sets.get(self.set_idx)
    }

    fn current_row(&self) -> DriverResult<&Vec<SqlValue>> {
        let set = self
            .current_set()
            .ok_or_else(|| DriverError::Transport("no current result set".to_string()))?;
        self.row
            .and_then(|r| set.rows.get(r))
            .ok_or_else(|| DriverError::Transport("no current row".to_string()))
    }
}

#[async_trait]
impl RowCursor for MockRowCursor {
    fn columns(&self) -> &[String] {
        self.current_set().map(|s| s.columns.as_slice()).unwrap_or(&[])
    }

    async fn read(&mut self) -> DriverResult<bool> {
        if self.closed {
            return Err(DriverError::Transport("cursor is closed".to_string()));
        }
        let Some(set) = self.current_set() else {
            return Ok(false);
        };
        let next = self.row.map(|r| r + 1).unwrap_or(0);
        if next < set.rows.len() {
            self.row = Some(next);
            Ok(true)
        } else {
            self.row = Some(set.rows.len());
            Ok(false)
        }
    }

    async fn next_result(&mut self) -> DriverResult<bool> {
        if self.closed {
            return Err(DriverError::Transport("cursor is closed".to_string()));
        }
        if self.set_idx + 1 < self.sets.len() {
            self.set_idx += 1;
            self.row = None;
            Ok(true)
        } else {
            self.set_idx = self.sets.len();
            Ok(false)
        }
    }

    fn is_null(&self, ordinal: usize) -> DriverResult<bool> {
        Ok(self.current_row()?.get(ordinal).is_none_or(SqlValue::is_null))
    }

    fn value(&self, ordinal: usize) -> DriverResult<SqlValue> {
        self.current_row()?
            .get(ordinal)
            .cloned()
            .ok_or_else(|| DriverError::Transport(format!("ordinal {ordinal} out of range")))
    }

    async fn close(&mut self) -> DriverResult<Vec<HarvestedParam>> {
        self.closed = true;
        Ok(std::mem::take(&mut self.harvest))
    }
}
