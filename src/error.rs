use thiserror::Error;

/// Framing/transport failures (§4.1). All variants are connection-fatal —
/// the reader loop exits and the connection is torn down.
#[derive(Debug, Error)]
pub enum FramerError {
    #[error("frame length {0} exceeds maximum of {max} bytes", max = crate::framer::MAX_FRAME_BYTES)]
    OversizeFrame(u32),

    #[error("zero-length frame is not valid")]
    ZeroLengthFrame,

    #[error("peer closed the connection")]
    EndOfStream,

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramerError {
    /// True if the frame reader must stop processing further input.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, FramerError::WriteTimeout(_))
    }
}

/// Startup and runtime validation failures for `ServerConfig` (§6.2).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file exceeds size limit of {limit} bytes (was {actual})")]
    TooLarge { limit: u64, actual: u64 },

    #[error("config nesting exceeds {limit} levels")]
    TooDeep { limit: u32 },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("executablePath must be an absolute path: {0}")]
    NotAbsolute(String),

    #[error("executablePath does not canonicalize to itself (symlink or traversal): {0}")]
    NotCanonical(String),

    #[error("executablePath does not refer to an existing regular file: {0}")]
    NotARegularFile(String),

    #[error("restartDelaySeconds must be >= 1")]
    InvalidRestartDelay,

    #[error("cpuLimitPercent must be within 0..=100 (was {0})")]
    InvalidCpuLimit(u32),

    #[error("gracefulShutdownTimeoutSeconds must be >= 1")]
    InvalidGracefulTimeout,

    #[error("i/o error reading config: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Concatenate every validation failure into a single exit reason, per §6.2.
    pub fn concat(errors: &[ConfigError]) -> String {
        errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Process spawn, isolation, and lifecycle failures (§4.3-§4.5, §7).
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn child process: {0}")]
    SpawnFailed(std::io::Error),

    #[error("failed to assign child to resource group: {0}")]
    IsolationAssignFailed(String),

    #[error("child exited with code {code:?}")]
    ChildExited { code: Option<i32> },

    #[error("operation attempted after disposal")]
    Disposed,

    #[error("stdin is not redirected for this process")]
    StdinNotRedirected,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reservation engine failures (§4.6, §7). Every variant is reported to the
/// caller verbatim; none causes a partial state mutation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReservationError {
    #[error("insufficient capacity on node")]
    InsufficientCapacity,

    #[error("ttl must be > 0 and <= {max_seconds}s", max_seconds = crate::reservation::MAX_RESERVATION_TTL.as_secs())]
    InvalidTtl,

    #[error("node is not accepting reservations")]
    NodeNotAccepting,

    #[error("reservation not found")]
    NotFound,

    #[error("reservation is not in Pending state")]
    NotPending,

    #[error("reservation has expired")]
    Expired,

    #[error("reservation is already in a terminal state")]
    AlreadyTerminal,
}
