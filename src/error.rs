//! Nimbus error types
//!
//! Provides a unified error type hierarchy for all Nimbus operations.
//!
//! # Design
//! Uses thiserror for ergonomic error definitions. All errors implement
//! std::error::Error and can be converted to NimbusError via the From trait.
//!
//! Every module error carries a stable integer code (`code()`); asynchronous
//! operations surface that code plus the Display message through their
//! [`Future`](crate::future::Future) once the operation completes. Code `0`
//! is reserved for success and is what an untouched future reports.

use thiserror::Error;

/// Top-level Nimbus error type
///
/// Wraps specific error types (Auth, Database, etc.) into a unified type.
/// Supports conversion from all module-specific errors via the `From` trait.
///
/// # Example
/// ```
/// use nimbus_sdk::{NimbusError, AuthError};
///
/// let auth_err: NimbusError = AuthError::InvalidEmail.into();
/// ```
#[derive(Debug, Error)]
pub enum NimbusError {
    /// Authentication-related errors
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Realtime database errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Cloud storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Push messaging errors
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// API key not configured
    #[error("API key not configured")]
    ApiKeyNotConfigured,

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Unknown error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Authentication errors
///
/// Each variant maps to a stable code via [`AuthError::code`]. Code `0` is
/// success and never appears here; `-1` marks functionality that a later
/// revision of the API will provide.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Catch-all failure; details live in the error message
    #[error("Authentication failed: {0}")]
    Failure(String),

    /// Function will be implemented in a later revision of the API
    #[error("Not yet implemented")]
    Unimplemented,

    /// Email address is malformed
    #[error("Invalid email address")]
    InvalidEmail,

    /// Password does not meet the platform requirements
    #[error("Invalid password")]
    InvalidPassword,

    /// Email already in use by another account
    #[error("Email already in use")]
    EmailAlreadyInUse,

    /// User not found
    #[error("User not found")]
    UserNotFound,

    /// Wrong password
    #[error("Wrong password")]
    WrongPassword,

    /// User account has been disabled
    #[error("User account disabled")]
    UserDisabled,

    /// Too many failed attempts
    #[error("Too many requests, try again later")]
    TooManyRequests,

    /// Operation not allowed (e.g. provider disabled)
    #[error("Operation not allowed")]
    OperationNotAllowed,

    /// Credential is malformed or rejected
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Id token has expired
    #[error("User token expired")]
    UserTokenExpired,

    /// Id token is malformed
    #[error("Invalid user token")]
    InvalidUserToken,

    /// No signed-in user for an operation that needs one
    #[error("No user is currently signed in")]
    NoSignedInUser,

    /// Operation requires recent authentication
    #[error("This operation requires recent authentication")]
    RequiresRecentLogin,

    /// API key rejected
    #[error("Invalid API key")]
    InvalidApiKey,

    /// Unknown error with code
    #[error("Unknown auth error: code {0}")]
    Unknown(i32),
}

/// Realtime database errors
///
/// Transaction outcomes get two distinguished codes:
/// [`DatabaseError::TransactionAbortedByUser`] when the transaction closure
/// votes to abort, and [`DatabaseError::TransactionRetriesExhausted`] when
/// the retry budget runs out. Conflicting concurrent writes never surface
/// here; the transaction runner absorbs them by retrying.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// Instance has been shut down (app deleted)
    #[error("Database disconnected")]
    Disconnected,

    /// Transaction gave up after the configured number of attempts
    #[error("Transaction retry limit exceeded")]
    TransactionRetriesExhausted,

    /// Operation failed for an unspecified server-side reason
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Write superseded by a later overlapping set
    #[error("Write overridden by a later set")]
    OverriddenBySet,

    /// Caller lacks permission at this location
    #[error("Permission denied")]
    PermissionDenied,

    /// Service temporarily unavailable
    #[error("Service unavailable")]
    Unavailable,

    /// Write abandoned before reaching the server
    #[error("Write canceled")]
    WriteCanceled,

    /// Malformed location path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Value cannot be stored at this location
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The transaction closure voted to abort
    #[error("Transaction aborted by the caller")]
    TransactionAbortedByUser,

    /// Unknown error with code
    #[error("Unknown database error: code {0}")]
    Unknown(i32),
}

/// Cloud storage errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// An unknown error occurred
    #[error("Unknown storage error")]
    Unknown,

    /// No object exists at the desired reference
    #[error("Object not found")]
    ObjectNotFound,

    /// No bucket is configured for this app
    #[error("Bucket not found")]
    BucketNotFound,

    /// No project is configured for this app
    #[error("Project not found")]
    ProjectNotFound,

    /// Quota on the storage bucket has been exceeded
    #[error("Quota exceeded")]
    QuotaExceeded,

    /// User is unauthenticated
    #[error("Unauthenticated")]
    Unauthenticated,

    /// User is not authorized to perform the desired action
    #[error("Unauthorized")]
    Unauthorized,

    /// The maximum time limit on an operation has been exceeded
    #[error("Retry limit exceeded")]
    RetryLimitExceeded,

    /// Downloaded data does not match the stored checksum
    #[error("Non-matching checksum")]
    NonMatchingChecksum,

    /// Object is larger than the size cap passed to the download
    #[error("Download size exceeded")]
    DownloadSizeExceeded,

    /// Caller cancelled the operation through its controller
    #[error("Operation cancelled")]
    Cancelled,
}

/// Push messaging errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Topic names must match `[a-zA-Z0-9-_.~%]+`
    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    /// No registration token is available yet
    #[error("No registration token")]
    NoRegistrationToken,

    /// Messaging has not been initialized for this app
    #[error("Messaging not initialized")]
    NotInitialized,

    /// Message has no target (neither token nor topic)
    #[error("Message has no recipient")]
    MissingRecipient,

    /// Unknown error with code
    #[error("Unknown messaging error: code {0}")]
    Unknown(i32),
}

impl NimbusError {
    /// Create an internal error from a string
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an unknown error from a string
    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Auth(AuthError::TooManyRequests)
                | Self::Database(DatabaseError::Unavailable)
                | Self::Database(DatabaseError::TransactionRetriesExhausted)
                | Self::Storage(StorageError::RetryLimitExceeded)
                | Self::Storage(StorageError::QuotaExceeded)
        )
    }

    /// Check if the error indicates authentication is required
    pub fn requires_auth(&self) -> bool {
        matches!(
            self,
            Self::Auth(AuthError::NoSignedInUser)
                | Self::Auth(AuthError::RequiresRecentLogin)
                | Self::Auth(AuthError::UserTokenExpired)
                | Self::Auth(AuthError::InvalidUserToken)
                | Self::Storage(StorageError::Unauthenticated)
        )
    }

    /// Stable integer code for this error, as surfaced by futures
    pub fn code(&self) -> i32 {
        match self {
            Self::Auth(e) => e.code(),
            Self::Database(e) => e.code(),
            Self::Storage(e) => e.code(),
            Self::Messaging(e) => e.code(),
            Self::Serialization(_) => 100,
            Self::Internal(_) => 101,
            Self::ApiKeyNotConfigured => 102,
            Self::Cancelled => 103,
            Self::Unknown(_) => 104,
        }
    }
}

impl AuthError {
    /// Stable integer code for this error
    ///
    /// `0` is reserved for success; `-1` marks unimplemented surface.
    pub fn code(&self) -> i32 {
        match self {
            Self::Failure(_) => 1,
            Self::Unimplemented => -1,
            Self::InvalidEmail => 2,
            Self::InvalidPassword => 3,
            Self::EmailAlreadyInUse => 4,
            Self::UserNotFound => 5,
            Self::WrongPassword => 6,
            Self::UserDisabled => 7,
            Self::TooManyRequests => 8,
            Self::OperationNotAllowed => 9,
            Self::InvalidCredential(_) => 10,
            Self::UserTokenExpired => 11,
            Self::InvalidUserToken => 12,
            Self::NoSignedInUser => 13,
            Self::RequiresRecentLogin => 14,
            Self::InvalidApiKey => 15,
            Self::Unknown(code) => *code,
        }
    }
}

impl DatabaseError {
    /// Stable integer code for this error
    pub fn code(&self) -> i32 {
        match self {
            Self::Disconnected => 1,
            Self::TransactionRetriesExhausted => 2,
            Self::OperationFailed(_) => 3,
            Self::OverriddenBySet => 4,
            Self::PermissionDenied => 5,
            Self::Unavailable => 6,
            Self::WriteCanceled => 7,
            Self::InvalidPath(_) => 8,
            Self::InvalidValue(_) => 9,
            Self::TransactionAbortedByUser => 10,
            Self::Unknown(code) => *code,
        }
    }
}

impl StorageError {
    /// Stable integer code for this error
    pub fn code(&self) -> i32 {
        match self {
            Self::Unknown => 1,
            Self::ObjectNotFound => 2,
            Self::BucketNotFound => 3,
            Self::ProjectNotFound => 4,
            Self::QuotaExceeded => 5,
            Self::Unauthenticated => 6,
            Self::Unauthorized => 7,
            Self::RetryLimitExceeded => 8,
            Self::NonMatchingChecksum => 9,
            Self::DownloadSizeExceeded => 10,
            Self::Cancelled => 11,
        }
    }

    /// Create from a stable storage error code
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => Self::ObjectNotFound,
            3 => Self::BucketNotFound,
            4 => Self::ProjectNotFound,
            5 => Self::QuotaExceeded,
            6 => Self::Unauthenticated,
            7 => Self::Unauthorized,
            8 => Self::RetryLimitExceeded,
            9 => Self::NonMatchingChecksum,
            10 => Self::DownloadSizeExceeded,
            11 => Self::Cancelled,
            _ => Self::Unknown,
        }
    }
}

impl MessagingError {
    /// Stable integer code for this error
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidTopicName(_) => 1,
            Self::NoRegistrationToken => 2,
            Self::NotInitialized => 3,
            Self::MissingRecipient => 4,
            Self::Unknown(code) => *code,
        }
    }
}
