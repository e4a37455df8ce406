//! Commit-reveal private betting client
//!
//! A participant commits `keccak256(outcome ‖ salt ‖ address)` to the
//! prediction-market hook during a batch's commit window, reveals the
//! outcome and salt during the reveal window, and claims once the market
//! resolves. The salt only ever lives in the local secret store, which is
//! written before the commit transaction is sent.

pub mod amount;
pub mod chain;
pub mod clock;
pub mod commitment;
pub mod config;
pub mod error;
pub mod error_translator;
pub mod hook;
pub mod logging;
pub mod phase_clock;
pub mod secret_store;
pub mod session;
pub mod storage;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

pub use chain::{ChainClient, ChainError, ContractCall, TxReceipt, Web3ChainClient};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::ClientConfig;
pub use error::{ErrorKind, SessionError, SessionResult};
pub use hook::{PoolKey, PrivateBettingHook};
pub use phase_clock::{format_countdown, BatchSchedule, BatchWindow, Phase};
pub use secret_store::{BetAction, BetCommitmentSecret, BetSecretStore};
pub use session::{BetStage, PhaseTick, PrivateBettingSession, SessionSnapshot};
pub use storage::{FileStore, KeyValueStore, MemoryStore};

/// Wire a session from configuration: JSON-RPC chain client, file-backed
/// secret store, system clock. Reads the hook schedule when configured and
/// does an initial refresh.
pub async fn connect(config: &ClientConfig) -> anyhow::Result<Arc<PrivateBettingSession>> {
    let chain = Web3ChainClient::new(&config.chain)
        .with_context(|| format!("failed to create chain client for {}", config.chain.rpc_url))?;

    let store = FileStore::open(&config.storage.data_dir).await.with_context(|| {
        format!("failed to open secret store at {}", config.storage.data_dir.display())
    })?;

    let hook = PrivateBettingHook::new(config.chain.hook_address, config.pool_key());
    let session = Arc::new(PrivateBettingSession::new(
        Arc::new(chain),
        Arc::new(store),
        hook,
        config.batch.schedule(),
        Arc::new(SystemClock),
    ));

    if config.batch.sync_from_chain {
        session
            .sync_schedule()
            .await
            .context("failed to read batch schedule from hook")?;
    }
    session.refresh().await.context("initial refresh failed")?;

    info!(
        pool_id = ?session.pool_id(),
        participant = ?session.participant(),
        "Private betting session ready"
    );
    Ok(session)
}
