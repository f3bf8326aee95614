#![forbid(unsafe_code)]

#[derive(Debug)]
pub enum QueueError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidInput(&'static str),
    NotFound {
        session: String,
    },
    Ambiguous {
        session: String,
        count: usize,
    },
    KeyMismatch {
        key: String,
        session: String,
    },
    LockTimeout,
    SchemaMismatch {
        column: &'static str,
    },
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::NotFound { session } => write!(f, "no job for session {session}"),
            Self::Ambiguous { session, count } => write!(
                f,
                "found {count} jobs for session {session}, expected session to be unique"
            ),
            Self::KeyMismatch { key, session } => write!(
                f,
                "job session does not match target key (key={key}, job.session={session})"
            ),
            Self::LockTimeout => write!(f, "timed out acquiring exclusive queue transaction"),
            Self::SchemaMismatch { column } => {
                write!(f, "existing job table is missing required column {column}")
            }
        }
    }
}

impl std::error::Error for QueueError {}

impl From<std::io::Error> for QueueError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}
