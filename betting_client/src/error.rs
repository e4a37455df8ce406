//! Session-level error taxonomy
//!
//! Every failure a private-betting operation can surface ends up as a
//! [`SessionError`] whose [`ErrorKind`] is one of a closed set, whether it
//! came from a contract revert, the wallet, the durable store or a local
//! precondition check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Market lifecycle
    MarketNotReady,
    MarketExpired,
    MarketAlreadyResolved,
    MarketNotResolved,

    Unauthorized,

    // Commitment lifecycle
    CommitmentConflict,
    NoCommitment,
    SecretNotFound,
    AlreadyRevealed,
    RevealedElsewhere,
    AlreadyClaimed,
    PhaseMismatch,
    InvalidReveal,

    // Funds
    InsufficientFunds,
    InsufficientAllowance,

    // Client side
    UserRejected,
    WalletNotConnected,
    InvalidInput,
    OperationPending,
    StorageFailure,

    Unknown,
}

impl ErrorKind {
    /// Default text when nothing more specific is known
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::MarketNotReady => "Market is not ready for this action.",
            ErrorKind::MarketExpired => "This market has expired.",
            ErrorKind::MarketAlreadyResolved => "This market has already been resolved.",
            ErrorKind::MarketNotResolved => "This market has not been resolved yet.",
            ErrorKind::Unauthorized => "You are not allowed to perform this action.",
            ErrorKind::CommitmentConflict => "You already have an active commitment.",
            ErrorKind::NoCommitment => "No commitment found.",
            ErrorKind::SecretNotFound => {
                "Secret not found. Did you commit from this device?"
            }
            ErrorKind::AlreadyRevealed => "Bet has already been revealed.",
            ErrorKind::RevealedElsewhere => {
                "Bet was already revealed from another device."
            }
            ErrorKind::AlreadyClaimed => "Winnings have already been claimed.",
            ErrorKind::PhaseMismatch => "This action is not available in the current phase.",
            ErrorKind::InvalidReveal => "Invalid reveal - hash does not match commitment.",
            ErrorKind::InsufficientFunds => "Insufficient funds.",
            ErrorKind::InsufficientAllowance => "Insufficient token allowance.",
            ErrorKind::UserRejected => "Transaction was rejected.",
            ErrorKind::WalletNotConnected => "Wallet not connected.",
            ErrorKind::InvalidInput => "Invalid input.",
            ErrorKind::OperationPending => "A previous transaction is still pending.",
            ErrorKind::StorageFailure => "Local storage is unavailable.",
            ErrorKind::Unknown => "Transaction failed.",
        }
    }

    /// Whether the same action can succeed later without the user changing
    /// anything but time or wallet state
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::SecretNotFound
                | ErrorKind::AlreadyRevealed
                | ErrorKind::RevealedElsewhere
                | ErrorKind::AlreadyClaimed
                | ErrorKind::InvalidReveal
                | ErrorKind::MarketExpired
                | ErrorKind::MarketAlreadyResolved
                | ErrorKind::Unauthorized
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
    /// Raw provider text or revert name, for logs and bug reports
    pub detail: Option<String>,
    pub error_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let error = Self {
            kind,
            message: message.into(),
            detail: None,
            error_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };
        error.log();
        error
    }

    /// Error carrying the kind's default message
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::new(kind, kind.user_message())
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn log(&self) {
        match self.kind {
            ErrorKind::StorageFailure | ErrorKind::Unknown | ErrorKind::InvalidReveal => {
                error!(error_id = %self.error_id, kind = %self.kind, "{}", self.message);
            }
            _ => {
                warn!(error_id = %self.error_id, kind = %self.kind, "{}", self.message);
            }
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SessionError {}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::new(ErrorKind::StorageFailure, ErrorKind::StorageFailure.user_message())
            .with_detail(err.to_string())
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
