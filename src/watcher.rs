//! Credential file supervision.
//!
//! Watches the configured root-CA / client cert / client key files and
//! signals the multiplexer to reset the upstream connection when any of
//! them change. Rotation tooling rewrites several files in quick
//! succession, so events are debounced into a single reset.

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::metrics;

/// Debounce window for credential rotation bursts.
const WATCH_DEBOUNCE_DELAY: Duration = Duration::from_millis(100);

/// Keeps the underlying watcher alive; dropping it stops watching.
pub struct CredentialWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
}

/// Start watching the given credential files. Returns `None` when nothing
/// is configured (plaintext control plane): the supervisor is a no-op.
pub fn watch_credentials(
    paths: Vec<PathBuf>,
    reset_tx: watch::Sender<()>,
) -> Result<Option<CredentialWatcher>, AgentError> {
    if paths.is_empty() {
        return Ok(None);
    }

    let mut debouncer = new_debouncer(
        WATCH_DEBOUNCE_DELAY,
        move |result: DebounceEventResult| match result {
            Ok(events) if !events.is_empty() => {
                info!("credential files changed, resetting the upstream connection");
                metrics::record_credential_reset();
                let _ = reset_tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!("credential watch error: {e}"),
        },
    )?;

    for path in &paths {
        debouncer
            .watcher()
            .watch(path, RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "watching credential file");
    }

    Ok(Some(CredentialWatcher {
        _debouncer: debouncer,
    }))
}
