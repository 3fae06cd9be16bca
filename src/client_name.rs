//! Client-name tagging for opened connections.
//!
//! Every connection is tagged with a two-part application-name suffix: a
//! process-wide static name resolved once at startup, and an optional
//! call-scoped name that propagates across the asynchronous continuations of
//! one logical call but never to unrelated calls.

use crate::error::{DbError, DbResult};
use std::sync::OnceLock;

static STATIC_NAME: OnceLock<String> = OnceLock::new();

fn resolve_static_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Process-wide client name. Resolved from the running executable on first
/// use, falling back to `"Unknown"`.
pub fn static_name() -> &'static str {
    STATIC_NAME.get_or_init(resolve_static_name)
}

/// Override the process-wide client name. Only effective before the first
/// connection is opened; later calls are ignored.
pub fn set_static_name(name: impl Into<String>) {
    let _ = STATIC_NAME.set(name.into());
}

tokio::task_local! {
    static CURRENT_NAME: String;
}

/// The call-scoped client name, if one is active on this logical call.
pub fn current_name() -> Option<String> {
    CURRENT_NAME.try_with(|n| n.clone()).ok()
}

/// Run `fut` with the call-scoped client name set. Fails if a name is
/// already active; use [`scope_if_absent`] to tolerate nesting.
pub async fn scope<F>(name: impl Into<String>, fut: F) -> DbResult<F::Output>
where
    F: Future,
{
    if let Some(active) = current_name() {
        return Err(DbError::usage(format!("Already in context '{active}'")));
    }
    Ok(CURRENT_NAME.scope(name.into(), fut).await)
}

/// Run `fut` with the call-scoped client name set, unless one is already
/// active, in which case the existing name wins.
pub async fn scope_if_absent<F>(name: impl Into<String>, fut: F) -> F::Output
where
    F: Future,
{
    if current_name().is_some() {
        fut.await
    } else {
        CURRENT_NAME.scope(name.into(), fut).await
    }
}

/// Build the application-name suffix appended to the connection string:
/// `-<static>` plus `-<scoped>` when a scoped name is active.
pub(crate) fn name_suffix() -> String {
    let mut suffix = String::new();
    let static_part = static_name();
    if !static_part.is_empty() {
        suffix.push('-');
        suffix.push_str(static_part);
    }
    if let Some(scoped) = current_name() {
        if !scoped.is_empty() {
            suffix.push('-');
            suffix.push_str(&scoped);
        }
    }
    suffix
}
