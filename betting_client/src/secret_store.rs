//! Per-market, per-participant bet secrets
//!
//! The salt and outcome behind an on-chain commit hash exist only here. A
//! secret is written before the commit transaction leaves the client and is
//! deleted once the claim is submitted.

use std::sync::Arc;

use ethereum_types::{Address, H256};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    clock::Timestamp,
    storage::{KeyValueStore, StorageError},
};

const STORAGE_KEY_PREFIX: &str = "private_bet_";
const PENDING_KEY_PREFIX: &str = "private_bet_pending_";

/// Hidden side of a committed bet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetCommitmentSecret {
    pub outcome: bool,
    pub salt: H256,
    /// Stake as typed by the user, in the native unit ("0.1")
    #[serde(rename = "amount")]
    pub amount_deposited: String,
    #[serde(rename = "timestamp")]
    pub created_at: Timestamp,
    /// Set once this device's reveal is confirmed
    #[serde(default)]
    pub revealed: bool,
}

/// Chain write that was submitted but not yet seen confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetAction {
    Commit,
    Reveal,
    Claim,
    SettleBatch,
}

impl BetAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetAction::Commit => "commit",
            BetAction::Reveal => "reveal",
            BetAction::Claim => "claim",
            BetAction::SettleBatch => "settle_batch",
        }
    }
}

impl std::fmt::Display for BetAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransaction {
    pub action: BetAction,
    pub tx_hash: H256,
    pub submitted_at: Timestamp,
    /// Hash a pending commit publishes; only that hash on-chain settles it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<H256>,
    /// Secret being claimed, kept so a failed claim can put it back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_secret: Option<BetCommitmentSecret>,
}

/// Secret persistence scoped by market key and participant
#[derive(Clone)]
pub struct BetSecretStore {
    store: Arc<dyn KeyValueStore>,
}

impl BetSecretStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// `private_bet_<market key>_<lowercase address>`
    pub fn storage_key(market_key: &H256, participant: &Address) -> String {
        format!("{}{:#x}_{:#x}", STORAGE_KEY_PREFIX, market_key, participant)
    }

    fn pending_key(market_key: &H256, participant: &Address) -> String {
        format!("{}{:#x}_{:#x}", PENDING_KEY_PREFIX, market_key, participant)
    }

    /// Overwrites any secret already stored under the same key
    pub async fn save(
        &self,
        market_key: &H256,
        participant: &Address,
        secret: &BetCommitmentSecret,
    ) -> Result<(), StorageError> {
        let key = Self::storage_key(market_key, participant);
        let bytes = serde_json::to_vec(secret).map_err(|e| StorageError::Encode {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, &bytes).await?;
        debug!(key = %key, "Bet secret saved");
        Ok(())
    }

    /// Unreadable entries are treated as absent
    pub async fn load(
        &self,
        market_key: &H256,
        participant: &Address,
    ) -> Result<Option<BetCommitmentSecret>, StorageError> {
        let key = Self::storage_key(market_key, participant);
        self.read_json(&key).await
    }

    pub async fn clear(&self, market_key: &H256, participant: &Address) -> Result<(), StorageError> {
        let key = Self::storage_key(market_key, participant);
        self.store.delete(&key).await?;
        debug!(key = %key, "Bet secret cleared");
        Ok(())
    }

    pub async fn save_pending(
        &self,
        market_key: &H256,
        participant: &Address,
        pending: &PendingTransaction,
    ) -> Result<(), StorageError> {
        let key = Self::pending_key(market_key, participant);
        let bytes = serde_json::to_vec(pending).map_err(|e| StorageError::Encode {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, &bytes).await
    }

    pub async fn load_pending(
        &self,
        market_key: &H256,
        participant: &Address,
    ) -> Result<Option<PendingTransaction>, StorageError> {
        let key = Self::pending_key(market_key, participant);
        self.read_json(&key).await
    }

    pub async fn clear_pending(
        &self,
        market_key: &H256,
        participant: &Address,
    ) -> Result<(), StorageError> {
        self.store.delete(&Self::pending_key(market_key, participant)).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key = %key, "Ignoring unreadable stored entry: {}", e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::str::FromStr;

    fn participant() -> Address {
        Address::from_str("0x5B38Da6a701c568545dCfcB03FcB875f56beddC4").unwrap()
    }

    fn secret() -> BetCommitmentSecret {
        BetCommitmentSecret {
            outcome: true,
            salt: H256::repeat_byte(0x42),
            amount_deposited: "0.1".to_string(),
            created_at: Timestamp::from_unix(1_700_000_000),
            revealed: false,
        }
    }

    #[test]
    fn test_storage_key_is_lowercase_and_scoped() {
        let market = H256::repeat_byte(0xab);
        let key = BetSecretStore::storage_key(&market, &participant());
        assert_eq!(
            key,
            format!(
                "private_bet_0x{}_0x5b38da6a701c568545dcfcb03fcb875f56beddc4",
                "ab".repeat(32)
            )
        );
        assert_ne!(key, BetSecretStore::storage_key(&H256::repeat_byte(0xac), &participant()));
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let store = BetSecretStore::new(Arc::new(MemoryStore::new()));
        let market = H256::repeat_byte(1);

        assert!(store.load(&market, &participant()).await.unwrap().is_none());

        store.save(&market, &participant(), &secret()).await.unwrap();
        assert_eq!(store.load(&market, &participant()).await.unwrap(), Some(secret()));

        store.clear(&market, &participant()).await.unwrap();
        assert!(store.load(&market, &participant()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_markets_do_not_share_secrets() {
        let store = BetSecretStore::new(Arc::new(MemoryStore::new()));
        store.save(&H256::repeat_byte(1), &participant(), &secret()).await.unwrap();
        assert!(store.load(&H256::repeat_byte(2), &participant()).await.unwrap().is_none());
        assert!(store.load(&H256::repeat_byte(1), &Address::zero()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reads_browser_format() {
        let kv = Arc::new(MemoryStore::new());
        let market = H256::repeat_byte(9);
        let key = BetSecretStore::storage_key(&market, &participant());
        let json = format!(
            r#"{{"salt":"0x{}","outcome":false,"amount":"0.25","timestamp":1700000123}}"#,
            "11".repeat(32)
        );
        kv.set(&key, json.as_bytes()).await.unwrap();

        let loaded = BetSecretStore::new(kv).load(&market, &participant()).await.unwrap().unwrap();
        assert!(!loaded.outcome);
        assert_eq!(loaded.salt, H256::repeat_byte(0x11));
        assert_eq!(loaded.amount_deposited, "0.25");
        assert!(!loaded.revealed);
    }

    #[tokio::test]
    async fn test_corrupt_entry_reads_as_absent() {
        let kv = Arc::new(MemoryStore::new());
        let market = H256::repeat_byte(3);
        kv.set(&BetSecretStore::storage_key(&market, &participant()), b"{not json")
            .await
            .unwrap();
        let store = BetSecretStore::new(kv);
        assert!(store.load(&market, &participant()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_roundtrip() {
        let store = BetSecretStore::new(Arc::new(MemoryStore::new()));
        let market = H256::repeat_byte(5);
        let pending = PendingTransaction {
            action: BetAction::Claim,
            tx_hash: H256::repeat_byte(0xee),
            submitted_at: Timestamp::from_unix(10),
            commit_hash: None,
            claimed_secret: Some(secret()),
        };

        store.save_pending(&market, &participant(), &pending).await.unwrap();
        assert_eq!(store.load_pending(&market, &participant()).await.unwrap(), Some(pending));
        assert!(store.load(&market, &participant()).await.unwrap().is_none());

        store.clear_pending(&market, &participant()).await.unwrap();
        assert!(store.load_pending(&market, &participant()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_commit_keeps_hash() {
        let store = BetSecretStore::new(Arc::new(MemoryStore::new()));
        let market = H256::repeat_byte(6);
        let pending = PendingTransaction {
            action: BetAction::Commit,
            tx_hash: H256::repeat_byte(0x01),
            submitted_at: Timestamp::from_unix(20),
            commit_hash: Some(H256::repeat_byte(0xc0)),
            claimed_secret: None,
        };

        store.save_pending(&market, &participant(), &pending).await.unwrap();
        let loaded = store.load_pending(&market, &participant()).await.unwrap().unwrap();
        assert_eq!(loaded.commit_hash, Some(H256::repeat_byte(0xc0)));
    }
}
