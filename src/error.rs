use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrexdError {
    #[error("malformed frame header")]
    MalformedHeader,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("language not supported: {0}")]
    LanguageNotSupported(String),

    #[error("script too large: {0} bytes")]
    ScriptTooLarge(usize),

    #[error("job not found: {0}")]
    JobNotFound(i64),

    #[error("job name already registered: {0}")]
    NameTaken(String),

    #[error("no free shared-memory slot for job {0}")]
    NoFreeSlot(i64),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("system error: {0}")]
    Sys(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, PrexdError>;

/// Wire-level error codes carried in `{err: int}` response frames.
///
/// Workers map every local failure to one of these before responding;
/// the master reconciler treats any non-zero code as a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    FatalNode,
    LanguageNotSupported,
    TaskTimeout,
    QueueTimeout,
    WorkerUnreachable,
    RetriesExhausted,
    MalformedHeader,
    MalformedPayload,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::FatalNode => -1,
            ErrorCode::LanguageNotSupported => -2,
            ErrorCode::TaskTimeout => -3,
            ErrorCode::QueueTimeout => -4,
            ErrorCode::WorkerUnreachable => -5,
            ErrorCode::RetriesExhausted => -6,
            ErrorCode::MalformedHeader => -7,
            ErrorCode::MalformedPayload => -8,
        }
    }

    /// Unknown codes collapse to `FatalNode`; anything a worker sends that
    /// the master does not recognize is still a failure.
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => ErrorCode::Ok,
            -2 => ErrorCode::LanguageNotSupported,
            -3 => ErrorCode::TaskTimeout,
            -4 => ErrorCode::QueueTimeout,
            -5 => ErrorCode::WorkerUnreachable,
            -6 => ErrorCode::RetriesExhausted,
            -7 => ErrorCode::MalformedHeader,
            -8 => ErrorCode::MalformedPayload,
            _ => ErrorCode::FatalNode,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::Ok => "ok",
            ErrorCode::FatalNode => "fatal_node_error",
            ErrorCode::LanguageNotSupported => "language_not_supported",
            ErrorCode::TaskTimeout => "task_timeout",
            ErrorCode::QueueTimeout => "queue_timeout",
            ErrorCode::WorkerUnreachable => "worker_unreachable",
            ErrorCode::RetriesExhausted => "retries_exhausted",
            ErrorCode::MalformedHeader => "malformed_header",
            ErrorCode::MalformedPayload => "malformed_payload",
        };
        write!(f, "{}", name)
    }
}
