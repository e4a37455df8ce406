//! Chain failure → [`SessionError`]
//!
//! Providers surface reverts inconsistently: some hand back the raw revert
//! bytes, some only a message with the payload pasted in, some only prose.
//! Translation tries, in order:
//!
//! 1. revert data attached to the error, decoded by selector
//! 2. hex payloads found inside the provider message
//! 3. known substrings (wallet rejection, balance, allowance, error names)
//! 4. the raw message as [`ErrorKind::Unknown`]
//!
//! It never fails and never panics.

use std::collections::HashMap;

use ethereum_types::U256;
use regex::Regex;
use tracing::debug;
use web3::ethabi::{self, ParamType};

use crate::{
    chain::ChainError,
    error::{ErrorKind, SessionError},
    hook::{hook_error_message, selector, HOOK_ERRORS, HOOK_ERROR_SELECTORS},
};

const ERROR_STRING: &str = "Error(string)";
const PANIC_UINT: &str = "Panic(uint256)";
const ERC20_INSUFFICIENT_BALANCE: &str = "ERC20InsufficientBalance(address,uint256,uint256)";
const ERC20_INSUFFICIENT_ALLOWANCE: &str = "ERC20InsufficientAllowance(address,uint256,uint256)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StandardError {
    Reason,
    Panic,
    InsufficientBalance,
    InsufficientAllowance,
}

lazy_static::lazy_static! {
    static ref STANDARD_ERRORS: HashMap<[u8; 4], StandardError> = [
        (selector(ERROR_STRING), StandardError::Reason),
        (selector(PANIC_UINT), StandardError::Panic),
        (selector(ERC20_INSUFFICIENT_BALANCE), StandardError::InsufficientBalance),
        (selector(ERC20_INSUFFICIENT_ALLOWANCE), StandardError::InsufficientAllowance),
    ]
    .into_iter()
    .collect();

    static ref HEX_PAYLOAD: Regex = Regex::new(r"0x[0-9a-fA-F]{8,}").unwrap();
}

/// Taxonomy category for a named hook error
pub fn kind_for_hook_error(name: &str) -> ErrorKind {
    match name {
        "MarketNotInitialized" | "MarketNotExpired" => ErrorKind::MarketNotReady,
        "MarketExpired" => ErrorKind::MarketExpired,
        "MarketAlreadyResolved" => ErrorKind::MarketAlreadyResolved,
        "MarketNotResolved" => ErrorKind::MarketNotResolved,
        "OnlyOracle" => ErrorKind::Unauthorized,
        "InvalidExpiry" | "InsufficientAmount" => ErrorKind::InvalidInput,
        "CommitmentAlreadyExists" => ErrorKind::CommitmentConflict,
        "NoCommitment" | "NoWinnings" => ErrorKind::NoCommitment,
        "AlreadyRevealed" => ErrorKind::AlreadyRevealed,
        "RevealWindowNotOpen" | "RevealWindowClosed" | "BatchNotSettled" => {
            ErrorKind::PhaseMismatch
        }
        "InvalidReveal" => ErrorKind::InvalidReveal,
        "AlreadyExecuted" => ErrorKind::AlreadyClaimed,
        _ => ErrorKind::Unknown,
    }
}

/// Translate any Chain Client failure
pub fn translate(err: &ChainError) -> SessionError {
    let raw = err.message();
    match err {
        ChainError::NoAccount => return SessionError::from_kind(ErrorKind::WalletNotConnected),
        ChainError::ConfirmationTimeout(tx) => {
            return SessionError::new(
                ErrorKind::OperationPending,
                "Transaction is still waiting for confirmation.",
            )
            .with_detail(format!("{:?}", tx));
        }
        ChainError::Rejected(_) => {
            return SessionError::from_kind(ErrorKind::UserRejected).with_detail(raw);
        }
        ChainError::TransactionFailed(_) => {
            return SessionError::new(ErrorKind::Unknown, "Transaction failed on-chain.")
                .with_detail(raw);
        }
        _ => {}
    }

    if let Some(data) = err.revert_data() {
        if let Some(error) = from_revert_data(data) {
            return error.with_detail(raw);
        }
        debug!(len = data.len(), "Revert data did not match a known error");
    }

    translate_message(&raw)
}

/// Layers 2 to 4, for failures that only came with text
pub fn translate_message(raw: &str) -> SessionError {
    for found in HEX_PAYLOAD.find_iter(raw) {
        let digits = &found.as_str()[2..];
        let even = &digits[..digits.len() - digits.len() % 2];
        if let Ok(bytes) = hex::decode(even) {
            if let Some(error) = from_revert_data(&bytes) {
                return error.with_detail(raw);
            }
        }
    }

    if let Some((kind, message)) = classify_text(raw) {
        return SessionError::new(kind, message).with_detail(raw);
    }

    SessionError::new(ErrorKind::Unknown, non_empty(raw)).with_detail(raw)
}

/// Decode a revert payload by its selector
pub fn from_revert_data(data: &[u8]) -> Option<SessionError> {
    let selector: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let args = &data[4..];

    if let Some(name) = HOOK_ERROR_SELECTORS.get(&selector) {
        let message = hook_error_message(name).unwrap_or("Transaction failed.");
        return Some(SessionError::new(kind_for_hook_error(name), message));
    }

    match STANDARD_ERRORS.get(&selector)? {
        StandardError::Reason => {
            let reason = ethabi::decode(&[ParamType::String], args)
                .ok()?
                .pop()?
                .into_string()?;
            Some(match classify_text(&reason) {
                Some((kind, message)) => SessionError::new(kind, message).with_detail(reason),
                None => SessionError::new(ErrorKind::Unknown, non_empty(&reason)),
            })
        }
        StandardError::Panic => {
            let code = ethabi::decode(&[ParamType::Uint(256)], args)
                .ok()
                .and_then(|mut tokens| tokens.pop())
                .and_then(|token| token.into_uint())
                .unwrap_or_else(U256::zero);
            Some(SessionError::new(
                ErrorKind::Unknown,
                format!("Contract panicked (code 0x{:x}).", code),
            ))
        }
        StandardError::InsufficientBalance => {
            Some(SessionError::from_kind(ErrorKind::InsufficientFunds))
        }
        StandardError::InsufficientAllowance => {
            Some(SessionError::from_kind(ErrorKind::InsufficientAllowance))
        }
    }
}

/// Substring rules over provider text or a revert reason
fn classify_text(text: &str) -> Option<(ErrorKind, &'static str)> {
    // Names first: "reverted with custom error 'NoCommitment()'"
    if let Some((name, message)) = HOOK_ERRORS.iter().find(|(name, _)| contains_word(text, name)) {
        return Some((kind_for_hook_error(name), *message));
    }

    let lowered = text.to_lowercase();
    if lowered.contains("user rejected")
        || lowered.contains("user denied")
        || lowered.contains("rejected the request")
    {
        return Some((ErrorKind::UserRejected, ErrorKind::UserRejected.user_message()));
    }
    if lowered.contains("insufficient funds") || lowered.contains("insufficient balance") {
        return Some((ErrorKind::InsufficientFunds, ErrorKind::InsufficientFunds.user_message()));
    }
    if lowered.contains("allowance") {
        return Some((
            ErrorKind::InsufficientAllowance,
            ErrorKind::InsufficientAllowance.user_message(),
        ));
    }
    None
}

/// `name` appears in `text` and is not part of a longer identifier
fn contains_word(text: &str, name: &str) -> bool {
    text.match_indices(name).any(|(at, _)| {
        let before = text[..at].chars().next_back();
        let after = text[at + name.len()..].chars().next();
        !before.map_or(false, |c| c.is_ascii_alphanumeric())
            && !after.map_or(false, |c| c.is_ascii_alphanumeric())
    })
}

fn non_empty(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        ErrorKind::Unknown.user_message().to_string()
    } else {
        trimmed.to_string()
    }
}
