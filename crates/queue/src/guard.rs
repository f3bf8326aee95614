#![forbid(unsafe_code)]

use crate::queue::{QueueError, SqliteJobQueue};
use sq_core::SessionKey;
use std::fmt::Display;

/// How a guarded run concluded. Ordinary work failures are recorded on the
/// job and reported here instead of propagating, so callers keep normal
/// control flow.
#[derive(Debug, PartialEq, Eq)]
pub enum Guarded<T> {
    Finished(T),
    Errored(String),
}

/// Scoped status bookkeeping for one job.
///
/// `begin` marks the job started. `finish`/`fail` record the outcome and
/// disarm the guard. If the guard is dropped while still armed — an unwind,
/// or a caller bailing out early — the job is requeued so another worker can
/// pick it up, and the unwind continues uncaught.
pub struct StatusGuard<'q> {
    queue: &'q mut SqliteJobQueue,
    session: String,
    armed: bool,
}

impl<'q> StatusGuard<'q> {
    pub fn begin(
        queue: &'q mut SqliteJobQueue,
        key: &impl SessionKey,
    ) -> Result<Self, QueueError> {
        let job = queue.set_started(key)?;
        tracing::debug!(session = %job.session, host = %queue.hostname(), "job started");
        Ok(Self {
            queue,
            session: job.session,
            armed: true,
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Mark the job finished and disarm.
    pub fn finish(mut self) -> Result<(), QueueError> {
        self.armed = false;
        self.queue.set_finished(&self.session)?;
        tracing::debug!(session = %self.session, "job finished");
        Ok(())
    }

    /// Record `error` on the job and disarm. Returns the recorded text.
    pub fn fail(mut self, error: impl Display) -> Result<String, QueueError> {
        self.armed = false;
        let message = error.to_string();
        self.queue.set_errored(&self.session, &message)?;
        tracing::warn!(session = %self.session, error = %message, "job errored");
        Ok(message)
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Interrupted mid-flight: leave the job eligible, not abandoned.
        if let Err(err) = self.queue.set_queued(&self.session) {
            tracing::warn!(
                session = %self.session,
                error = %err,
                "failed to requeue interrupted job"
            );
        } else {
            tracing::debug!(session = %self.session, "job requeued after interruption");
        }
    }
}

/// Run `work` for the job named by `key` with automatic status bookkeeping:
/// started before, finished on `Ok`, errored (recorded, swallowed) on `Err`,
/// requeued on panic — the panic itself keeps unwinding.
pub fn run_guarded<T, E: Display>(
    queue: &mut SqliteJobQueue,
    key: &impl SessionKey,
    work: impl FnOnce() -> Result<T, E>,
) -> Result<Guarded<T>, QueueError> {
    let guard = StatusGuard::begin(queue, key)?;
    match work() {
        Ok(value) => {
            guard.finish()?;
            Ok(Guarded::Finished(value))
        }
        Err(error) => {
            let message = guard.fail(error)?;
            Ok(Guarded::Errored(message))
        }
    }
}
