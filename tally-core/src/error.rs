use crate::connectors;

#[derive(Debug, derive_more::Display)]
pub enum Error {
    #[display("Aggregate name {_0:?} is not a valid identifier")]
    AggregateName(String),
    #[display("Aggregate {name} has an unresolved placeholder {placeholder}")]
    AggregateTemplate { name: String, placeholder: String },
    #[display("Coordinator has already run")]
    AlreadyRun,
    #[display("Write failed after {committed} committed rows: {source}")]
    Batch { committed: usize, source: Box<Error> },
    #[display("Run was cancelled")]
    Cancelled,
    #[display("Connector error: {_0}")]
    Connector(connectors::Error),
    #[display("Run deadline exceeded")]
    DeadlineExceeded,
    #[display("Invalid configuration: {_0}")]
    InvalidConfig(String),
    #[display("Background task failed: {_0}")]
    Join(tokio::task::JoinError),
    #[display("Migration error: {_0}")]
    Migration(String),
    #[display("Connection pool error: {_0}")]
    Pool(diesel::r2d2::PoolError),
    #[display("Suite {_0} was not found")]
    SuiteNotFound(String),
    #[display("Suite registry is unavailable")]
    SuiteRegistryUnavailable,
    #[display("Unexpected database error: {_0}")]
    UnexpectedDatabaseError(diesel::result::Error),
    #[display("Unexpected JSON error: {_0}")]
    UnexpectedJsonError(serde_json::Error),
    #[display("Unexpected time error: {_0}")]
    UnexpectedTimeError(time::error::ComponentRange),
}

impl Error {
    /// Internal errors point at a bug or a broken store rather than at a
    /// misbehaving source.
    pub fn is_internal(&self) -> bool {
        use Error::*;
        match self {
            Batch { source, .. } => source.is_internal(),
            Join(_)
            | Migration(_)
            | Pool(_)
            | UnexpectedDatabaseError(_)
            | UnexpectedJsonError(_)
            | UnexpectedTimeError(_) => true,
            _ => false,
        }
    }

    /// SQLite reports lock contention as a generic database error.
    pub fn is_busy(&self) -> bool {
        use diesel::result::Error::DatabaseError;
        match self {
            Error::UnexpectedDatabaseError(DatabaseError(_, info)) => {
                let message = info.message();
                message.contains("locked") || message.contains("busy")
            }
            _ => false,
        }
    }
}

impl std::error::Error for Error {}

impl From<diesel::result::Error> for Error {
    fn from(e: diesel::result::Error) -> Error {
        Error::UnexpectedDatabaseError(e)
    }
}

impl From<diesel::r2d2::PoolError> for Error {
    fn from(e: diesel::r2d2::PoolError) -> Error {
        Error::Pool(e)
    }
}

impl From<connectors::Error> for Error {
    fn from(e: connectors::Error) -> Error {
        Error::Connector(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::UnexpectedJsonError(e)
    }
}

impl From<time::error::ComponentRange> for Error {
    fn from(e: time::error::ComponentRange) -> Error {
        Error::UnexpectedTimeError(e)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Error {
        Error::Join(e)
    }
}
