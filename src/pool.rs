//! Worker pool & cooperative cancellation (component A3).
//!
//! Mirrors the teacher's `tokio::task::spawn_blocking` + `rayon::par_iter` combination: CPU-bound
//! work (hashing, compression, diffing) runs on rayon's global thread pool, reached from async
//! code through `spawn_blocking` so the tokio runtime's own worker threads stay free for I/O and
//! signal handling. [`CancellationToken`] races a ctrl-c listener against the blocking pipeline —
//! in-flight subprocess workers are allowed to finish their current unit of work rather than
//! being hard-killed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

/// A cheap, cloneable flag checked between pipeline stages and inside long-running loops (e.g.
/// between candidate-patch jobs in component C8).
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return an error if cancellation has been requested; call at stage boundaries to unwind
    /// promptly instead of polling inside tight loops.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            anyhow::bail!("operation cancelled");
        }
        Ok(())
    }
}

/// Run a blocking closure on a dedicated OS thread (via `tokio::task::spawn_blocking`), racing it
/// against ctrl-c. On ctrl-c, the token is set so the blocking work can notice and unwind at its
/// next checkpoint; this function still waits for the blocking task to actually finish, since
/// rayon/subprocess work cannot be forcibly aborted.
pub async fn run_cancellable<F, T>(token: CancellationToken, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::task::spawn_blocking(work);
    tokio::pin!(handle);

    loop {
        tokio::select! {
            result = &mut handle => {
                return result.context("worker task panicked")?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                token.cancel();
                // Keep waiting: the blocking closure is expected to notice `token` and return an
                // error promptly, but we don't detach from it.
            }
        }
    }
}
