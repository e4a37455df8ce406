//! Chain access
//!
//! The session talks to the hook only through [`ChainClient`], so tests can
//! swap in a scripted contract and production uses [`Web3ChainClient`].

pub mod web3_client;

use async_trait::async_trait;
use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

pub use web3_client::Web3ChainClient;

/// Encoded call against one contract function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub to: Address,
    /// Function name, for logs only
    pub function: &'static str,
    /// Selector followed by ABI-encoded arguments
    pub data: Vec<u8>,
}

impl ContractCall {
    pub fn new(to: Address, function: &'static str, data: Vec<u8>) -> Self {
        Self { to, function, data }
    }

    pub fn selector(&self) -> Option<[u8; 4]> {
        self.data.get(..4).map(|s| [s[0], s[1], s[2], s[3]])
    }
}

/// Mined transaction summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub gas_used: Option<U256>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// Execution reverted; `data` holds the raw revert payload when the
    /// provider surfaced one
    #[error("execution reverted: {message}")]
    Reverted {
        message: String,
        data: Option<Vec<u8>>,
    },

    /// The signer refused to sign or send
    #[error("signer rejected the request: {0}")]
    Rejected(String),

    #[error("no account connected")]
    NoAccount,

    #[error("transaction {0:?} was mined but failed")]
    TransactionFailed(H256),

    /// Stopped waiting; the transaction itself may still be mined
    #[error("timed out waiting for transaction {0:?}")]
    ConfirmationTimeout(H256),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("could not decode {function} response: {reason}")]
    Decode {
        function: &'static str,
        reason: String,
    },
}

impl ChainError {
    /// Human-readable text as a provider would show it
    pub fn message(&self) -> String {
        self.to_string()
    }

    pub fn revert_data(&self) -> Option<&[u8]> {
        match self {
            ChainError::Reverted { data, .. } => data.as_deref(),
            _ => None,
        }
    }
}

/// Read, simulate, send and confirm contract calls
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// View call; returns the raw ABI-encoded output
    async fn read(&self, call: &ContractCall) -> Result<Vec<u8>, ChainError>;

    /// Dry-run a state-changing call as `from` without spending gas
    async fn simulate(&self, call: &ContractCall, from: Address) -> Result<Vec<u8>, ChainError>;

    /// Submit from the connected account; returns before confirmation
    async fn write(&self, call: &ContractCall) -> Result<H256, ChainError>;

    /// Wait until the transaction is mined
    async fn await_confirmation(&self, tx_hash: H256) -> Result<TxReceipt, ChainError>;

    /// Connected signing account, if any
    fn account(&self) -> Option<Address>;
}
