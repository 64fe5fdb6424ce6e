use thiserror::Error;

/// Primary error type for QuiverMQ operations.
///
/// Structured variants for the failure classes the engine distinguishes:
/// syscall failures (which carry the file name and the failing operation so
/// an operator can tell *which* of the node's files misbehaved), on-disk
/// consistency failures, index parse failures, and operational refusals.
#[derive(Error, Debug)]
pub enum QmqError {
    // === I/O ===
    /// A syscall on one of the engine's files failed.
    #[error("I/O error on '{file}' during {op}: {source}")]
    Io {
        file: String,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Fewer bytes than required were available at the given offset.
    #[error("short read on '{file}' at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        file: String,
        offset: u64,
        expected: usize,
        actual: usize,
    },

    // === On-disk consistency ===
    /// A record header failed its parity or field validation.
    #[error("overflow data corrupt in '{file}' at offset {offset}: {detail}")]
    Corrupt {
        file: String,
        offset: u64,
        detail: String,
    },

    /// The data file does not begin with the expected magic bytes.
    #[error("'{file}' is not an overflow data file")]
    BadMagic { file: String },

    // === Index file ===
    /// A line of the channel index failed to parse.
    #[error("index parse error in '{file}' line {line}: {detail}")]
    IndexParse {
        file: String,
        line: u32,
        detail: String,
    },

    // === Startup ===
    /// A cross-file invariant did not hold during startup recovery.
    #[error("recovery failed: {detail}")]
    Recovery { detail: String },

    // === Naming ===
    /// A channel or storage name violates the naming rules.
    #[error("invalid storage name '{name}': {detail}")]
    InvalidName { name: String, detail: String },

    // === Operational ===
    /// Every 32-bit channel id has been handed out.
    #[error("channel id space exhausted")]
    ChannelIdExhausted,

    /// The configured memory budget cannot accommodate another ring.
    #[error("memory budget exhausted: in use {in_use} + requested {requested} > budget {budget}")]
    BudgetExhausted {
        in_use: u64,
        requested: u64,
        budget: u64,
    },

    /// Channel size rules are malformed (e.g. overlapping prefixes).
    #[error("invalid channel configuration: {detail}")]
    InvalidConfig { detail: String },

    /// Direct pop was attempted on a channel that has subscribers.
    #[error("channel '{channel}' has subscribers; records are consumed per subscriber")]
    HasSubscribers { channel: String },

    /// Channel creation was requested after shutdown began.
    #[error("node is shutting down")]
    ShuttingDown,
}

impl QmqError {
    /// Build an I/O error carrying the file name and operation.
    pub fn io(file: impl Into<String>, op: &'static str, source: std::io::Error) -> Self {
        Self::Io {
            file: file.into(),
            op,
            source,
        }
    }

    /// Build a corruption error for a record read from the data file.
    pub fn corrupt(file: impl Into<String>, offset: u64, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            file: file.into(),
            offset,
            detail: detail.into(),
        }
    }

    /// Build a recovery error.
    pub fn recovery(detail: impl Into<String>) -> Self {
        Self::Recovery {
            detail: detail.into(),
        }
    }

    /// Build an invalid-name error.
    pub fn invalid_name(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            detail: detail.into(),
        }
    }

    /// The OS errno behind this error, if it wraps a syscall failure.
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Whether this error aborts startup rather than failing one request.
    ///
    /// During steady state a corrupt header fails the current pop; the same
    /// condition observed while rebuilding state from disk is fatal.
    #[must_use]
    pub const fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. }
                | Self::BadMagic { .. }
                | Self::IndexParse { .. }
                | Self::Recovery { .. }
        )
    }
}

/// Result type alias using `QmqError`.
pub type Result<T> = std::result::Result<T, QmqError>;
