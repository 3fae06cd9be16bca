//! Transactional queue listener.
//!
//! Runs a polling stored procedure (a blocking queue receive) on a dedicated
//! worker task. Each iteration opens a connection, begins a long transaction,
//! forces distributed enlistment, executes the receive and hands every row to
//! the message handler, then commits. A connection closed without commit
//! rolls the receive back, so a handler failure returns the message to the
//! queue.
//!
//! Receive procedures block server-side until a message arrives, so the
//! polling command's timeout must be well above interactive defaults; the
//! constructor rejects anything at or below 30 seconds.

use crate::command::{CancelSignal, Command};
use crate::cursor::ResultCursor;
use crate::error::{DbError, DbResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Smallest accepted polling-command timeout, in seconds.
pub const MIN_RECEIVE_TIMEOUT_SECS: i32 = 31;

/// Receive transactions outlive engine defaults by design; the queue blocks
/// until a message arrives.
const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Pause after a failed iteration so repeated failure does not hammer the
/// network.
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Per-row message callback. The row is positioned; the handler reads it
/// through the cursor. An error rolls the receive back.
pub type MessageHandler =
    Arc<dyn for<'a, 'b> Fn(&'a mut ResultCursor<'b>) -> DbResult<()> + Send + Sync>;

/// Listens on a transactional queue by repeatedly executing a blocking
/// receive procedure.
pub struct QueueListener {
    command: Option<Command>,
    handler: MessageHandler,
    cancel: CancelSignal,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    worker: Option<JoinHandle<()>>,
}

impl QueueListener {
    /// Wrap a polling command. Its timeout must exceed 30 seconds; queue
    /// receive timeouts are usually much longer.
    pub fn new(command: Command, handler: MessageHandler) -> DbResult<Self> {
        if command.timeout_secs() < MIN_RECEIVE_TIMEOUT_SECS {
            return Err(DbError::usage(format!(
                "Polling command has a timeout under {MIN_RECEIVE_TIMEOUT_SECS} seconds; queue receive timeouts should be much longer"
            )));
        }
        let cancel = command.cancel_signal();
        Ok(Self {
            command: Some(command),
            handler,
            cancel,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            worker: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the worker. A listener runs once; starting an already-started
    /// (or stopped) listener is a usage error.
    pub fn start(&mut self) -> DbResult<()> {
        let Some(mut command) = self.command.take() else {
            return Err(DbError::usage("Listener already started"));
        };
        self.running.store(true, Ordering::SeqCst);

        let handler = self.handler.clone();
        let running = self.running.clone();
        let shutdown = self.shutdown.clone();
        self.worker = Some(tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match receive_once(&mut command, &handler).await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {
                        // our own Stop cancelling the blocking receive
                        debug!(command = %command.text(), "queue receive cancelled");
                    }
                    Err(e) => {
                        warn!(
                            command = %command.text(),
                            error = %e,
                            "exception while receiving a message"
                        );
                        if running.load(Ordering::SeqCst) {
                            tokio::select! {
                                _ = shutdown.notified() => {}
                                _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                            }
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    /// Stop the worker: cancel the in-flight receive and wait for the loop
    /// to exit. A no-op when not running.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.shutdown.notify_waiters();
        if worker.await.is_err() {
            warn!("queue listener worker panicked during shutdown");
        }
    }
}

/// One receive iteration: transaction, blocking receive, per-row dispatch,
/// commit. Any error path closes the connection, rolling the receive back.
async fn receive_once(command: &mut Command, handler: &MessageHandler) -> DbResult<()> {
    let mut conn = command.config().open().await?;
    if let Err(e) = conn.begin(TRANSACTION_TIMEOUT).await {
        conn.close().await;
        return Err(e.into());
    }
    // a call to another server or a message queue inside the handler fails
    // unless the transaction is distributed from the start
    if let Err(e) = conn.enlist_distributed().await {
        conn.close().await;
        return Err(e.into());
    }

    debug!(command = %command.text(), "waiting for message");
    let mut rows = command.execute_reader_on(conn).await?;

    if let Err(e) = dispatch_rows(&mut rows, handler).await {
        rows.end().await;
        return Err(e);
    }
    if let Err(e) = rows.close_reader().await {
        rows.end().await;
        return Err(e);
    }

    let Some(mut conn) = rows.take_connection() else {
        return Err(DbError::usage("Receive connection already released"));
    };
    if let Err(e) = conn.commit().await {
        conn.close().await;
        return Err(e.into());
    }
    conn.close().await;
    Ok(())
}

async fn dispatch_rows(
    rows: &mut ResultCursor<'_>,
    handler: &MessageHandler,
) -> DbResult<()> {
    while rows.read().await? {
        handler(rows)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::driver::mock::MockDriver;

    #[test]
    fn test_short_timeout_rejected() {
        let conf = DbConfig::new(Arc::new(MockDriver::new()), "Server=.");
        let mut command = conf.stored_procedure("spReceive");
        command.set_timeout_secs(30);
        let handler: MessageHandler = Arc::new(|_| Ok(()));
        assert!(QueueListener::new(command, handler).is_err());
    }

    #[test]
    fn test_long_timeout_accepted() {
        let conf = DbConfig::new(Arc::new(MockDriver::new()), "Server=.");
        let mut command = conf.stored_procedure("spReceive");
        command.set_timeout_secs(600);
        let handler: MessageHandler = Arc::new(|_| Ok(()));
        assert!(QueueListener::new(command, handler).is_ok());
    }
}
