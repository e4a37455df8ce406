//! JSON-RPC chain client on top of `web3`
//!
//! Reads and simulations are `eth_call`s; writes are signed locally and sent
//! raw; confirmation polls `eth_getTransactionReceipt`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use ethereum_types::{Address, H256, U256};
use tracing::{debug, info, warn};
use web3::{
    signing::{Key, SecretKey, SecretKeyRef},
    transports::Http,
    types::{Bytes, CallRequest, TransactionParameters},
    Web3,
};

use super::{ChainClient, ChainError, ContractCall, TxReceipt};
use crate::config::ChainConfig;

/// Headroom added on top of `eth_estimateGas`, in percent
const GAS_BUFFER_PERCENT: u64 = 20;

pub struct Web3ChainClient {
    web3: Web3<Http>,
    chain_id: u64,
    signer: Option<LocalSigner>,
    poll_interval: Duration,
    confirmation_timeout: Option<Duration>,
}

struct LocalSigner {
    key: SecretKey,
    address: Address,
}

impl Web3ChainClient {
    /// Connect to the configured RPC endpoint. Without a private key the
    /// client can read and simulate but not write.
    pub fn new(config: &ChainConfig) -> Result<Self, ChainError> {
        let transport = Http::new(&config.rpc_url)
            .map_err(|e| ChainError::Rpc(format!("invalid rpc url {}: {}", config.rpc_url, e)))?;
        let web3 = Web3::new(transport);

        let signer = match config.private_key.as_ref() {
            Some(secret) => Some(LocalSigner::from_hex(secret.expose())?),
            None => None,
        };
        if let Some(signer) = &signer {
            info!("Chain client signing as {:?}", signer.address);
        }

        Ok(Self {
            web3,
            chain_id: config.chain_id,
            signer,
            poll_interval: config.poll_interval,
            confirmation_timeout: config.confirmation_timeout,
        })
    }

    fn call_request(call: &ContractCall, from: Option<Address>) -> CallRequest {
        CallRequest {
            from,
            to: Some(call.to),
            data: Some(Bytes(call.data.clone())),
            ..Default::default()
        }
    }
}

impl LocalSigner {
    fn from_hex(secret: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(secret.trim_start_matches("0x"))
            .map_err(|_| ChainError::Rpc("private key is not valid hex".to_string()))?;
        let key = SecretKey::from_slice(&bytes)
            .map_err(|_| ChainError::Rpc("private key is not a valid secp256k1 key".to_string()))?;
        let address = SecretKeyRef::new(&key).address();
        Ok(Self { key, address })
    }
}

#[async_trait]
impl ChainClient for Web3ChainClient {
    async fn read(&self, call: &ContractCall) -> Result<Vec<u8>, ChainError> {
        debug!(function = call.function, to = ?call.to, "eth_call");
        let output = self
            .web3
            .eth()
            .call(Self::call_request(call, None), None)
            .await
            .map_err(map_web3_error)?;
        Ok(output.0)
    }

    async fn simulate(&self, call: &ContractCall, from: Address) -> Result<Vec<u8>, ChainError> {
        debug!(function = call.function, from = ?from, "Simulating call");
        let output = self
            .web3
            .eth()
            .call(Self::call_request(call, Some(from)), None)
            .await
            .map_err(map_web3_error)?;
        Ok(output.0)
    }

    async fn write(&self, call: &ContractCall) -> Result<H256, ChainError> {
        let signer = self.signer.as_ref().ok_or(ChainError::NoAccount)?;

        let estimate = self
            .web3
            .eth()
            .estimate_gas(Self::call_request(call, Some(signer.address)), None)
            .await
            .map_err(map_web3_error)?;
        let gas = estimate + estimate * U256::from(GAS_BUFFER_PERCENT) / U256::from(100u64);

        let tx = TransactionParameters {
            to: Some(call.to),
            gas,
            data: Bytes(call.data.clone()),
            chain_id: Some(self.chain_id),
            ..Default::default()
        };

        let signed = self
            .web3
            .accounts()
            .sign_transaction(tx, SecretKeyRef::new(&signer.key))
            .await
            .map_err(|e| ChainError::Rejected(e.to_string()))?;

        let tx_hash = self
            .web3
            .eth()
            .send_raw_transaction(signed.raw_transaction)
            .await
            .map_err(map_web3_error)?;

        info!(function = call.function, tx = ?tx_hash, gas = %gas, "Transaction submitted");
        Ok(tx_hash)
    }

    async fn await_confirmation(&self, tx_hash: H256) -> Result<TxReceipt, ChainError> {
        let started = Instant::now();
        loop {
            let receipt = self
                .web3
                .eth()
                .transaction_receipt(tx_hash)
                .await
                .map_err(map_web3_error)?;

            if let Some(receipt) = receipt {
                let success = receipt.status.map(|s| s.as_u64() == 1).unwrap_or(true);
                let receipt = TxReceipt {
                    tx_hash,
                    block_number: receipt.block_number.map(|n| n.as_u64()),
                    gas_used: receipt.gas_used,
                    success,
                };
                if !success {
                    warn!(tx = ?tx_hash, "Transaction mined with failed status");
                    return Err(ChainError::TransactionFailed(tx_hash));
                }
                debug!(tx = ?tx_hash, block = ?receipt.block_number, "Transaction confirmed");
                return Ok(receipt);
            }

            if let Some(timeout) = self.confirmation_timeout {
                if started.elapsed() >= timeout {
                    return Err(ChainError::ConfirmationTimeout(tx_hash));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn account(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address)
    }
}

/// Lift provider errors into [`ChainError`], keeping any revert payload
fn map_web3_error(err: web3::Error) -> ChainError {
    match err {
        web3::Error::Rpc(rpc) => {
            let data = rpc.data.as_ref().and_then(extract_revert_data);
            let message = rpc.message;
            let lowered = message.to_lowercase();
            if data.is_some() || lowered.contains("revert") {
                ChainError::Reverted { message, data }
            } else if lowered.contains("rejected") || lowered.contains("denied") {
                ChainError::Rejected(message)
            } else {
                ChainError::Rpc(message)
            }
        }
        other => ChainError::Rpc(other.to_string()),
    }
}

/// Providers put revert bytes either directly in `error.data` or nested
/// one level down (`error.data.data`)
fn extract_revert_data(value: &serde_json::Value) -> Option<Vec<u8>> {
    match value {
        serde_json::Value::String(s) if s.starts_with("0x") => {
            hex::decode(&s[2..]).ok().filter(|bytes| !bytes.is_empty())
        }
        serde_json::Value::Object(map) => map.get("data").and_then(extract_revert_data),
        _ => None,
    }
}
