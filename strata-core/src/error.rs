//! Error taxonomy for the synchronization core.
//!
//! Errors are classified by kind so callers can match on them: the HTTP layer
//! maps kinds to status codes, the CLI maps them to exit codes, and the clone
//! engine decides compensation by kind alone.

use crate::layer::{CommitId, LayerId};

/// Errors raised by a layer store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("layer not found: {0}")]
    NotFound(LayerId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt layer record: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Reason a received pack was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackFailReason {
    /// A layer references a parent that is neither in the pack nor the store.
    MissingParent(LayerId),
    /// A layer's bytes do not hash to its claimed id.
    ChecksumMismatch(LayerId),
    /// The pack or payload is structurally invalid.
    Malformed(String),
}

impl std::fmt::Display for PackFailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackFailReason::MissingParent(id) => write!(f, "missing parent {}", id),
            PackFailReason::ChecksumMismatch(id) => write!(f, "checksum mismatch for {}", id),
            PackFailReason::Malformed(msg) => write!(f, "malformed pack: {}", msg),
        }
    }
}

/// The synchronization error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database already exists: {0}")]
    DatabaseAlreadyExists(String),

    #[error("remote already exists: {0}")]
    RemoteAlreadyExists(String),

    #[error("push requires a branch target, got {0}")]
    PushRequiresBranch(String),

    #[error("push attempted on non-remote repository {0}")]
    PushAttemptedOnNonRemote(String),

    #[error("no repository head for remote {0}; fetch first")]
    PushHasNoRepositoryHead(String),

    #[error("remote branch is not empty while local branch is empty")]
    RemoteNotEmptyOnLocalEmpty,

    #[error("remote has diverged; {} unmerged remote commit(s)", .0.len())]
    RemoteDiverged(Vec<CommitId>),

    #[error("no common history between local and remote branches")]
    NoCommonHistory,

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("remote pack failed: {0}")]
    RemotePackFailed(PackFailReason),

    #[error("remote unpack failed (status {status}): {body}")]
    RemoteUnpackFailed { status: u16, body: String },

    #[error("remote pack failed unexpectedly: {0}")]
    RemotePackUnexpectedFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Machine-readable error term carried in the API envelope.
    pub fn error_term(&self) -> &'static str {
        match self {
            SyncError::Unauthorized(_) => "api:Unauthorized",
            SyncError::NotFound(_) => "api:NotFound",
            SyncError::DatabaseAlreadyExists(_) => "api:DatabaseAlreadyExists",
            SyncError::RemoteAlreadyExists(_) => "api:RemoteAlreadyExists",
            SyncError::PushRequiresBranch(_) => "api:PushRequiresBranch",
            SyncError::PushAttemptedOnNonRemote(_) => "api:PushAttemptedOnNonRemote",
            SyncError::PushHasNoRepositoryHead(_) => "api:PushHasNoRepositoryHead",
            SyncError::RemoteNotEmptyOnLocalEmpty => "api:RemoteNotEmptyOnLocalEmpty",
            SyncError::RemoteDiverged(_) => "api:RemoteDiverged",
            SyncError::NoCommonHistory => "api:NoCommonHistory",
            SyncError::NetworkError(_) => "api:NetworkError",
            SyncError::RemotePackFailed(_) => "api:RemotePackFailed",
            SyncError::RemoteUnpackFailed { .. } => "api:RemoteUnpackFailed",
            SyncError::RemotePackUnexpectedFailure(_) => "api:RemotePackUnexpectedFailure",
            SyncError::Internal(_) => "api:InternalError",
        }
    }

    /// HTTP status code this error maps to at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            SyncError::Unauthorized(_) => 401,
            SyncError::NotFound(_) => 404,
            SyncError::DatabaseAlreadyExists(_)
            | SyncError::RemoteAlreadyExists(_)
            | SyncError::PushRequiresBranch(_)
            | SyncError::PushAttemptedOnNonRemote(_)
            | SyncError::PushHasNoRepositoryHead(_)
            | SyncError::RemoteNotEmptyOnLocalEmpty => 400,
            SyncError::RemoteDiverged(_) | SyncError::NoCommonHistory => 409,
            SyncError::NetworkError(_)
            | SyncError::RemotePackFailed(_)
            | SyncError::RemoteUnpackFailed { .. }
            | SyncError::RemotePackUnexpectedFailure(_) => 502,
            SyncError::Internal(_) => 500,
        }
    }

    /// Process exit code for the CLI: 1 user error, 2 remote/protocol error,
    /// 3 internal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Unauthorized(_)
            | SyncError::NotFound(_)
            | SyncError::DatabaseAlreadyExists(_)
            | SyncError::RemoteAlreadyExists(_)
            | SyncError::PushRequiresBranch(_)
            | SyncError::PushAttemptedOnNonRemote(_)
            | SyncError::PushHasNoRepositoryHead(_)
            | SyncError::RemoteNotEmptyOnLocalEmpty => 1,
            SyncError::RemoteDiverged(_)
            | SyncError::NoCommonHistory
            | SyncError::NetworkError(_)
            | SyncError::RemotePackFailed(_)
            | SyncError::RemoteUnpackFailed { .. }
            | SyncError::RemotePackUnexpectedFailure(_) => 2,
            SyncError::Internal(_) => 3,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SyncError::NotFound(format!("layer {}", id)),
            other => SyncError::Internal(other.to_string()),
        }
    }
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Internal(format!("serialization error: {}", e))
    }
}
