#![forbid(unsafe_code)]

/// One unit of work, keyed by its `session` string.
///
/// Mirrors the persisted row one-to-one. Timestamps are integer milliseconds
/// since the Unix epoch. `finished` is tri-state: `None` = never finished,
/// `Some(false)` = claimed or explicitly requeued, `Some(true)` = done.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub session: String,
    pub added_ms: i64,
    pub priority: i64,
    pub started_ms: Option<i64>,
    pub hostname: Option<String>,
    pub finished: Option<bool>,
    pub error: Option<String>,
}

impl Job {
    /// A fresh, unclaimed job for `session`, added at `added_ms`.
    pub fn new(session: impl Into<String>, added_ms: i64) -> Self {
        Self {
            session: session.into(),
            added_ms,
            priority: 0,
            started_ms: None,
            hostname: None,
            finished: None,
            error: None,
        }
    }

    /// Actively in progress: claimed, not finished, and no recorded error.
    pub fn is_in_progress(&self) -> bool {
        self.started_ms.is_some()
            && !self.finished.unwrap_or(false)
            && self.error.as_deref().is_none_or(str::is_empty)
    }
}

/// Patch for one nullable field: leave it, null it, or set it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Patch<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T> Patch<T> {
    pub fn apply_to(self, slot: &mut Option<T>) {
        match self {
            Self::Keep => {}
            Self::Clear => *slot = None,
            Self::Set(value) => *slot = Some(value),
        }
    }
}

/// Partial update applied by the queue's `update` primitive.
///
/// Non-nullable columns (`added_ms`, `priority`) use `Option` (None = leave
/// unchanged). Nullable columns use [`Patch`] so "set to NULL" and "leave
/// unchanged" stay distinct. The `session` key is immutable after insert and
/// is deliberately absent here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub added_ms: Option<i64>,
    pub priority: Option<i64>,
    pub started_ms: Patch<i64>,
    pub hostname: Patch<String>,
    pub finished: Patch<bool>,
    pub error: Patch<String>,
}

impl JobUpdate {
    pub fn apply_to(self, job: &mut Job) {
        if let Some(added_ms) = self.added_ms {
            job.added_ms = added_ms;
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        self.started_ms.apply_to(&mut job.started_ms);
        self.hostname.apply_to(&mut job.hostname);
        self.finished.apply_to(&mut job.finished);
        self.error.apply_to(&mut job.error);
    }
}

/// Anything that can name a queue entry.
///
/// The queue treats session identifiers as opaque, already-normalized
/// strings; parsing and validating raw work-unit identifiers belongs to an
/// external resolver that produces the canonical string before it reaches
/// this trait.
pub trait SessionKey {
    fn session(&self) -> &str;
}

impl SessionKey for str {
    fn session(&self) -> &str {
        self
    }
}

impl SessionKey for String {
    fn session(&self) -> &str {
        self
    }
}

impl SessionKey for Job {
    fn session(&self) -> &str {
        &self.session
    }
}

impl<T: SessionKey + ?Sized> SessionKey for &T {
    fn session(&self) -> &str {
        (**self).session()
    }
}
