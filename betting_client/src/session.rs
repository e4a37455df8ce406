//! Private betting session
//!
//! Drives one participant's bet on one market through commit → reveal →
//! claim against the hook. Ground truth is always the chain plus the
//! durable secret store; in-memory state is a cache refreshed after every
//! write and can be rebuilt from scratch with [`PrivateBettingSession::refresh`].
//!
//! Every write follows the same shape: local precondition checks, then a
//! simulation, then the transaction, then a pending-transaction record that
//! survives a restart until the receipt is seen.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::DashSet;
use ethereum_types::{Address, H256, U256};
use serde::Serialize;
use tokio::{
    sync::{watch, RwLock},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn, Instrument};

use crate::{
    amount::parse_ether,
    chain::{ChainClient, ChainError, ContractCall, TxReceipt},
    clock::{Clock, Timestamp},
    commitment::{compute_commit_hash, generate_salt},
    error::{ErrorKind, SessionError, SessionResult},
    error_translator::translate,
    hook::{
        decode_batch_info, decode_bytes32, decode_commitment, decode_market, decode_uint,
        BatchInfo, PrivateBettingHook, PrivateMarket, RemoteCommitment, BATCH_DURATION,
        REVEAL_WINDOW,
    },
    logging::OperationContext,
    phase_clock::{BatchSchedule, BatchWindow, Phase},
    secret_store::{BetAction, BetCommitmentSecret, BetSecretStore, PendingTransaction},
    storage::KeyValueStore,
};

/// Where the participant's bet stands, derived from chain state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStage {
    Idle,
    Committed,
    Revealed,
    /// Revealed and the batch is past its reveal window
    Settled,
    Claimed,
}

/// Published by [`PrivateBettingSession::watch_phases`] on every tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseTick {
    pub phase: Option<Phase>,
    pub time_remaining: Duration,
    pub batch_id: Option<U256>,
}

/// Stored bet without its salt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBet {
    pub outcome: bool,
    pub amount: String,
    pub created_at: Timestamp,
    pub revealed: bool,
}

impl From<&BetCommitmentSecret> for StoredBet {
    fn from(secret: &BetCommitmentSecret) -> Self {
        Self {
            outcome: secret.outcome,
            amount: secret.amount_deposited.clone(),
            created_at: secret.created_at,
            revealed: secret.revealed,
        }
    }
}

/// Read-only view for a UI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub participant: Option<Address>,
    pub pool_id: H256,
    pub schedule: BatchSchedule,
    pub current_batch_id: Option<U256>,
    pub current_batch: Option<BatchInfo>,
    pub commitment: Option<RemoteCommitment>,
    pub commitment_batch: Option<BatchInfo>,
    pub market: Option<PrivateMarket>,
    pub stored_bet: Option<StoredBet>,
    pub pending_action: Option<BetAction>,
    pub pending_tx: Option<H256>,
    pub phase: Option<Phase>,
    #[serde(with = "humantime_serde")]
    pub time_remaining: Option<Duration>,
    pub in_flight: Vec<BetAction>,
    pub last_receipt: Option<TxReceipt>,
    pub last_error: Option<SessionError>,
    pub stage: BetStage,
}

#[derive(Debug, Clone)]
struct SessionState {
    schedule: BatchSchedule,
    current_batch_id: Option<U256>,
    current_batch: Option<BatchInfo>,
    commitment: Option<RemoteCommitment>,
    commitment_batch: Option<BatchInfo>,
    market: Option<PrivateMarket>,
    stored_bet: Option<BetCommitmentSecret>,
    pending: Option<PendingTransaction>,
    last_receipt: Option<TxReceipt>,
    last_error: Option<SessionError>,
}

impl SessionState {
    fn new(schedule: BatchSchedule) -> Self {
        Self {
            schedule,
            current_batch_id: None,
            current_batch: None,
            commitment: None,
            commitment_batch: None,
            market: None,
            stored_bet: None,
            pending: None,
            last_receipt: None,
            last_error: None,
        }
    }

    /// The participant's live commitment batch, else the current batch
    fn active_window(&self) -> Option<(BatchWindow, U256)> {
        if let (Some(commitment), Some(batch)) = (&self.commitment, &self.commitment_batch) {
            if !commitment.executed {
                return Some((self.schedule.window(batch.start_time), commitment.batch_id));
            }
        }
        match (&self.current_batch, self.current_batch_id) {
            (Some(batch), Some(id)) => Some((self.schedule.window(batch.start_time), id)),
            _ => None,
        }
    }

    fn stage(&self, now: Timestamp) -> BetStage {
        match &self.commitment {
            None => BetStage::Idle,
            Some(c) if c.executed => BetStage::Claimed,
            Some(c) if c.revealed => {
                let settled = self
                    .commitment_batch
                    .as_ref()
                    .map(|batch| self.schedule.window(batch.start_time).current_phase(now))
                    == Some(Phase::Settled);
                if settled {
                    BetStage::Settled
                } else {
                    BetStage::Revealed
                }
            }
            Some(_) => BetStage::Committed,
        }
    }
}

/// Marks an action as in flight until dropped
struct InFlight<'a> {
    actions: &'a DashSet<BetAction>,
    action: BetAction,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.actions.remove(&self.action);
    }
}

/// Extra fields of a pending-transaction record
#[derive(Default)]
struct PendingContext {
    commit_hash: Option<H256>,
    claimed_secret: Option<BetCommitmentSecret>,
}

/// A sent transaction and whether its pending record reached the store
struct Submission {
    tx_hash: H256,
    recorded: bool,
}

fn chain_error(err: ChainError) -> SessionError {
    translate(&err)
}

pub struct PrivateBettingSession {
    chain: Arc<dyn ChainClient>,
    secrets: BetSecretStore,
    hook: PrivateBettingHook,
    pool_id: H256,
    clock: Arc<dyn Clock>,
    state: RwLock<SessionState>,
    in_flight: DashSet<BetAction>,
}

impl PrivateBettingSession {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn KeyValueStore>,
        hook: PrivateBettingHook,
        schedule: BatchSchedule,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pool_id = hook.pool_key().pool_id();
        info!(pool_id = ?pool_id, hook = ?hook.address(), "Private betting session created");
        Self {
            chain,
            secrets: BetSecretStore::new(store),
            hook,
            pool_id,
            clock,
            state: RwLock::new(SessionState::new(schedule)),
            in_flight: DashSet::new(),
        }
    }

    pub fn pool_id(&self) -> H256 {
        self.pool_id
    }

    pub fn participant(&self) -> Option<Address> {
        self.chain.account()
    }

    pub async fn schedule(&self) -> BatchSchedule {
        self.state.read().await.schedule
    }

    /// Commit a hidden bet of `amount` (native unit, e.g. "0.1") on `outcome`
    pub async fn commit(&self, amount: &str, outcome: bool) -> SessionResult<TxReceipt> {
        let ctx = self.operation("commit");
        let result = self.run_commit(amount, outcome).instrument(ctx.span.clone()).await;
        self.finish(&ctx, result).await
    }

    /// Reveal the stored outcome and salt during the reveal window
    pub async fn reveal(&self) -> SessionResult<TxReceipt> {
        let ctx = self.operation("reveal");
        let result = self.run_reveal().instrument(ctx.span.clone()).await;
        self.finish(&ctx, result).await
    }

    /// Claim after settlement; the stored secret is deleted once the claim
    /// transaction is submitted
    pub async fn claim_winnings(&self) -> SessionResult<TxReceipt> {
        let ctx = self.operation("claim");
        let result = self.run_claim().instrument(ctx.span.clone()).await;
        self.finish(&ctx, result).await
    }

    /// Settle a batch; anyone may call this once its reveal window closed
    pub async fn settle_batch(&self, batch_id: U256) -> SessionResult<TxReceipt> {
        let ctx = self.operation("settle_batch");
        let result = self.run_settle(batch_id).instrument(ctx.span.clone()).await;
        self.finish(&ctx, result).await
    }

    /// Wait for a transaction recorded before a restart. `None` when
    /// nothing was pending.
    pub async fn resume(&self) -> SessionResult<Option<TxReceipt>> {
        let ctx = self.operation("resume");
        let result = self.run_resume().instrument(ctx.span.clone()).await;
        self.finish(&ctx, result).await
    }

    /// Re-read batch, commitment, market and local records
    pub async fn refresh(&self) -> SessionResult<()> {
        let ctx = self.operation("refresh");
        let result = self.refresh_state().instrument(ctx.span.clone()).await;
        self.finish(&ctx, result).await
    }

    /// Check the local hash recipe against the hook's own
    /// `generateCommitHash` for a throwaway salt
    pub async fn verify_hash_recipe(&self) -> SessionResult<()> {
        let ctx = self.operation("verify_hash_recipe");
        let result = self.run_verify_hash_recipe().instrument(ctx.span.clone()).await;
        self.finish(&ctx, result).await
    }

    /// Adopt the hook's `BATCH_DURATION` / `REVEAL_WINDOW`
    pub async fn sync_schedule(&self) -> SessionResult<BatchSchedule> {
        let ctx = self.operation("sync_schedule");
        let result = self.run_sync_schedule().instrument(ctx.span.clone()).await;
        self.finish(&ctx, result).await
    }

    pub async fn clear_error(&self) {
        self.state.write().await.last_error = None;
    }

    pub async fn last_error(&self) -> Option<SessionError> {
        self.state.read().await.last_error.clone()
    }

    pub async fn stage(&self) -> BetStage {
        self.state.read().await.stage(self.clock.now())
    }

    /// Phase of the active batch, recomputed from the clock on every call
    pub async fn phase_tick(&self) -> PhaseTick {
        let now = self.clock.now();
        let state = self.state.read().await;
        match state.active_window() {
            Some((window, batch_id)) => PhaseTick {
                phase: Some(window.current_phase(now)),
                time_remaining: window.time_remaining(now),
                batch_id: Some(batch_id),
            },
            None => PhaseTick::default(),
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let now = self.clock.now();
        let mut in_flight: Vec<BetAction> = self.in_flight.iter().map(|a| *a.key()).collect();
        in_flight.sort_by_key(|action| action.as_str());

        let state = self.state.read().await;
        let window = state.active_window();
        SessionSnapshot {
            participant: self.chain.account(),
            pool_id: self.pool_id,
            schedule: state.schedule,
            current_batch_id: state.current_batch_id,
            current_batch: state.current_batch.clone(),
            commitment: state.commitment.clone(),
            commitment_batch: state.commitment_batch.clone(),
            market: state.market.clone(),
            stored_bet: state.stored_bet.as_ref().map(StoredBet::from),
            pending_action: state.pending.as_ref().map(|p| p.action),
            pending_tx: state.pending.as_ref().map(|p| p.tx_hash),
            phase: window.map(|(w, _)| w.current_phase(now)),
            time_remaining: window.map(|(w, _)| w.time_remaining(now)),
            in_flight,
            last_receipt: state.last_receipt.clone(),
            last_error: state.last_error.clone(),
            stage: state.stage(now),
        }
    }

    /// Tick every `every`, publishing the phase and countdown. A phase
    /// change triggers a read-only refresh; the task never writes to chain
    /// and stops once the session or every receiver is dropped.
    pub fn watch_phases(
        self: &Arc<Self>,
        every: Duration,
    ) -> (watch::Receiver<PhaseTick>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(PhaseTick::default());
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_phase: Option<Phase> = None;

            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else { break };

                let mut tick = session.phase_tick().await;
                if last_phase.is_some() && tick.phase != last_phase {
                    info!(from = ?last_phase, to = ?tick.phase, "Batch phase changed");
                    if let Err(err) = session.refresh_state().await {
                        debug!(kind = %err.kind, "Refresh after phase change failed");
                    }
                    tick = session.phase_tick().await;
                }
                last_phase = tick.phase;

                if tx.send(tick).is_err() {
                    break;
                }
            }
            debug!("Phase watcher stopped");
        });

        (rx, handle)
    }

    async fn run_commit(&self, amount: &str, outcome: bool) -> SessionResult<TxReceipt> {
        let participant = self.require_account()?;

        let wei = parse_ether(amount).map_err(|e| {
            SessionError::new(ErrorKind::InvalidInput, format!("Invalid amount: {}", e))
        })?;
        if wei.is_zero() {
            return Err(SessionError::new(
                ErrorKind::InvalidInput,
                "Amount must be greater than zero.",
            ));
        }

        let _guard = self.begin(BetAction::Commit)?;

        let remote = self.read_commitment(participant).await?;
        let local = self.secrets.load(&self.pool_id, &participant).await?;

        if let Some(pending) = self.secrets.load_pending(&self.pool_id, &participant).await? {
            if !pending_resolved(&pending, remote.as_ref()) {
                return Err(SessionError::new(
                    ErrorKind::OperationPending,
                    format!(
                        "A previous {} transaction is still pending. Resume it before committing again.",
                        pending.action
                    ),
                )
                .with_detail(format!("{:?}", pending.tx_hash)));
            }
            self.secrets.clear_pending(&self.pool_id, &participant).await?;
        }

        if self.read_market().await?.resolved {
            return Err(SessionError::from_kind(ErrorKind::MarketAlreadyResolved));
        }

        match (&remote, &local) {
            (Some(c), _) if !c.revealed => {
                return Err(SessionError::from_kind(ErrorKind::CommitmentConflict));
            }
            (Some(c), Some(_)) if !c.executed => {
                return Err(SessionError::new(
                    ErrorKind::CommitmentConflict,
                    "Claim your revealed bet before committing again.",
                ));
            }
            _ => {}
        }

        let salt = generate_salt();
        let commit_hash = compute_commit_hash(outcome, &salt, &participant);
        let secret = BetCommitmentSecret {
            outcome,
            salt,
            amount_deposited: amount.trim().to_string(),
            created_at: self.clock.now(),
            revealed: false,
        };

        // Must be durable before anything reaches the chain
        self.secrets.save(&self.pool_id, &participant, &secret).await?;
        info!(commit_hash = ?commit_hash, amount = %secret.amount_deposited, "Bet secret stored");

        let call = self.hook.commit_bet(commit_hash, wei);
        let context = PendingContext {
            commit_hash: Some(commit_hash),
            ..Default::default()
        };
        let submission = self.submit(BetAction::Commit, &call, participant, context).await?;
        let receipt = self
            .confirm(BetAction::Commit, participant, submission.tx_hash)
            .await?;

        self.after_write(&receipt).await;
        Ok(receipt)
    }

    async fn run_reveal(&self) -> SessionResult<TxReceipt> {
        let participant = self.require_account()?;
        let _guard = self.begin(BetAction::Reveal)?;

        let Some(mut secret) = self.secrets.load(&self.pool_id, &participant).await? else {
            return Err(SessionError::from_kind(ErrorKind::SecretNotFound));
        };

        let Some(remote) = self.read_commitment(participant).await? else {
            return Err(SessionError::from_kind(ErrorKind::NoCommitment));
        };
        if remote.executed {
            return Err(SessionError::from_kind(ErrorKind::AlreadyClaimed));
        }
        if remote.revealed {
            let kind = if secret.revealed {
                ErrorKind::AlreadyRevealed
            } else {
                ErrorKind::RevealedElsewhere
            };
            return Err(SessionError::from_kind(kind));
        }

        match self.commitment_phase(&remote).await? {
            Phase::Reveal => {}
            Phase::Commit => {
                return Err(SessionError::new(
                    ErrorKind::PhaseMismatch,
                    "Reveal window is not open yet.",
                ));
            }
            Phase::Settled => {
                return Err(SessionError::new(
                    ErrorKind::PhaseMismatch,
                    "Reveal window has closed.",
                ));
            }
        }

        let expected = compute_commit_hash(secret.outcome, &secret.salt, &participant);
        if expected != remote.commit_hash {
            return Err(SessionError::from_kind(ErrorKind::InvalidReveal).with_detail(format!(
                "local {:?} != on-chain {:?}",
                expected, remote.commit_hash
            )));
        }

        let call = self.hook.reveal_bet(secret.outcome, secret.salt);
        let submission = self
            .submit(BetAction::Reveal, &call, participant, PendingContext::default())
            .await?;
        let receipt = self
            .confirm(BetAction::Reveal, participant, submission.tx_hash)
            .await?;

        secret.revealed = true;
        self.secrets.save(&self.pool_id, &participant, &secret).await?;

        self.after_write(&receipt).await;
        Ok(receipt)
    }

    async fn run_claim(&self) -> SessionResult<TxReceipt> {
        let participant = self.require_account()?;
        let _guard = self.begin(BetAction::Claim)?;

        let Some(secret) = self.secrets.load(&self.pool_id, &participant).await? else {
            return Err(SessionError::from_kind(ErrorKind::SecretNotFound));
        };

        let Some(remote) = self.read_commitment(participant).await? else {
            return Err(SessionError::from_kind(ErrorKind::NoCommitment));
        };
        if remote.executed {
            self.secrets.clear(&self.pool_id, &participant).await?;
            return Err(SessionError::from_kind(ErrorKind::AlreadyClaimed));
        }

        let market = self.read_market().await?;
        if !market.resolved {
            return Err(SessionError::from_kind(ErrorKind::MarketNotResolved));
        }
        if self.commitment_phase(&remote).await? != Phase::Settled {
            return Err(SessionError::new(
                ErrorKind::PhaseMismatch,
                "Batch has not been settled yet.",
            ));
        }

        // A revealed losing bet has nothing left to claim
        let lost = remote.revealed
            && secret.outcome != market.outcome
            && compute_commit_hash(secret.outcome, &secret.salt, &participant) == remote.commit_hash;
        if lost {
            self.secrets.clear(&self.pool_id, &participant).await?;
            info!(outcome = market.outcome, "Bet lost; secret cleared");
            return Err(SessionError::new(ErrorKind::NoCommitment, "No winnings to claim."));
        }

        let call = self.hook.claim_winnings(secret.outcome, secret.salt);
        let context = PendingContext {
            claimed_secret: Some(secret.clone()),
            ..Default::default()
        };
        let submission = self.submit(BetAction::Claim, &call, participant, context).await?;

        // The pending record is the only other copy of the secret
        let cleared = submission.recorded;
        if cleared {
            self.secrets.clear(&self.pool_id, &participant).await?;
            debug!(tx = ?submission.tx_hash, "Bet secret cleared after claim submission");
        } else {
            warn!(tx = ?submission.tx_hash, "Keeping bet secret until the claim confirms");
        }

        let receipt = match self
            .confirm(BetAction::Claim, participant, submission.tx_hash)
            .await
        {
            Ok(receipt) => receipt,
            Err(err) => {
                if cleared && err.kind != ErrorKind::OperationPending {
                    self.restore_secret(participant, &secret).await;
                }
                return Err(err);
            }
        };
        if !cleared {
            if let Err(err) = self.secrets.clear(&self.pool_id, &participant).await {
                warn!("Could not clear bet secret after confirmed claim: {}", err);
            }
        }

        self.after_write(&receipt).await;
        Ok(receipt)
    }

    async fn run_settle(&self, batch_id: U256) -> SessionResult<TxReceipt> {
        let participant = self.require_account()?;
        let _guard = self.begin(BetAction::SettleBatch)?;

        let call = self.hook.settle_batch(batch_id);
        let submission = self
            .submit(BetAction::SettleBatch, &call, participant, PendingContext::default())
            .await?;
        let receipt = self
            .confirm(BetAction::SettleBatch, participant, submission.tx_hash)
            .await?;

        self.after_write(&receipt).await;
        Ok(receipt)
    }

    async fn run_resume(&self) -> SessionResult<Option<TxReceipt>> {
        let participant = self.require_account()?;
        let Some(pending) = self.secrets.load_pending(&self.pool_id, &participant).await? else {
            return Ok(None);
        };
        let _guard = self.begin(pending.action)?;
        info!(action = %pending.action, tx = ?pending.tx_hash, "Resuming pending transaction");

        match self.confirm(pending.action, participant, pending.tx_hash).await {
            Ok(receipt) => {
                match pending.action {
                    BetAction::Reveal => {
                        if let Some(mut secret) =
                            self.secrets.load(&self.pool_id, &participant).await?
                        {
                            secret.revealed = true;
                            self.secrets.save(&self.pool_id, &participant, &secret).await?;
                        }
                    }
                    BetAction::Claim => {
                        self.secrets.clear(&self.pool_id, &participant).await?;
                    }
                    BetAction::Commit | BetAction::SettleBatch => {}
                }
                self.after_write(&receipt).await;
                Ok(Some(receipt))
            }
            Err(err) => {
                if err.kind != ErrorKind::OperationPending {
                    if let Some(secret) = &pending.claimed_secret {
                        self.restore_secret(participant, secret).await;
                    }
                }
                Err(err)
            }
        }
    }

    async fn run_verify_hash_recipe(&self) -> SessionResult<()> {
        let participant = self.chain.account().unwrap_or_else(Address::zero);
        let salt = generate_salt();
        let local = compute_commit_hash(true, &salt, &participant);

        let call = self.hook.generate_commit_hash(true, salt, participant);
        let data = self.chain.read(&call).await.map_err(chain_error)?;
        let remote = decode_bytes32(call.function, &data).map_err(chain_error)?;

        if local != remote {
            return Err(SessionError::new(
                ErrorKind::InvalidReveal,
                "Local commit hash does not match the hook's formula.",
            )
            .with_detail(format!("local {:?} != hook {:?}", local, remote)));
        }
        debug!("Commit hash recipe matches the hook");
        Ok(())
    }

    async fn run_sync_schedule(&self) -> SessionResult<BatchSchedule> {
        let commit = self.read_duration(self.hook.batch_duration(), BATCH_DURATION).await?;
        let reveal = self.read_duration(self.hook.reveal_window(), REVEAL_WINDOW).await?;
        let schedule = BatchSchedule::new(commit, reveal);

        self.state.write().await.schedule = schedule;
        info!(commit = ?commit, reveal = ?reveal, "Batch schedule synced from hook");
        Ok(schedule)
    }

    async fn refresh_state(&self) -> SessionResult<()> {
        let batch_id_call = self.hook.get_current_batch_id();
        let data = self.chain.read(&batch_id_call).await.map_err(chain_error)?;
        let current_batch_id = decode_uint(batch_id_call.function, &data).map_err(chain_error)?;
        let current_batch = self.read_batch(current_batch_id).await?;
        let market = self.read_market().await?;

        let (commitment, commitment_batch, stored_bet, pending) = match self.chain.account() {
            Some(participant) => {
                let commitment = self.read_commitment(participant).await?;
                let commitment_batch = match &commitment {
                    Some(c) if c.batch_id == current_batch_id => Some(current_batch.clone()),
                    Some(c) => Some(self.read_batch(c.batch_id).await?),
                    None => None,
                };
                let stored_bet = self.secrets.load(&self.pool_id, &participant).await?;

                let mut pending = self.secrets.load_pending(&self.pool_id, &participant).await?;
                if let Some(record) = &pending {
                    if pending_resolved(record, commitment.as_ref()) {
                        debug!(action = %record.action, "Clearing resolved pending record");
                        self.secrets.clear_pending(&self.pool_id, &participant).await?;
                        pending = None;
                    }
                }
                (commitment, commitment_batch, stored_bet, pending)
            }
            None => (None, None, None, None),
        };

        let mut state = self.state.write().await;
        state.current_batch_id = Some(current_batch_id);
        state.current_batch = Some(current_batch);
        state.market = Some(market);
        state.commitment = commitment;
        state.commitment_batch = commitment_batch;
        state.stored_bet = stored_bet;
        state.pending = pending;
        Ok(())
    }

    fn operation(&self, name: &'static str) -> OperationContext {
        OperationContext::new(name, &self.pool_id, self.chain.account())
    }

    async fn finish<T>(&self, ctx: &OperationContext, result: SessionResult<T>) -> SessionResult<T> {
        let elapsed_ms = ctx.elapsed().as_millis() as u64;
        let mut state = self.state.write().await;
        match &result {
            Ok(_) => {
                state.last_error = None;
                info!(parent: &ctx.span, elapsed_ms, "{} completed", ctx.operation);
            }
            Err(err) => {
                state.last_error = Some(err.clone());
                warn!(
                    parent: &ctx.span,
                    elapsed_ms,
                    kind = %err.kind,
                    error_id = %err.error_id,
                    "{} failed",
                    ctx.operation
                );
            }
        }
        result
    }

    fn require_account(&self) -> SessionResult<Address> {
        self.chain
            .account()
            .ok_or_else(|| SessionError::from_kind(ErrorKind::WalletNotConnected))
    }

    fn begin(&self, action: BetAction) -> SessionResult<InFlight<'_>> {
        if !self.in_flight.insert(action) {
            return Err(SessionError::new(
                ErrorKind::OperationPending,
                format!("A {} is already in progress.", action),
            ));
        }
        Ok(InFlight {
            actions: &self.in_flight,
            action,
        })
    }

    /// Simulate, send, and record the pending transaction
    async fn submit(
        &self,
        action: BetAction,
        call: &ContractCall,
        participant: Address,
        context: PendingContext,
    ) -> SessionResult<Submission> {
        self.chain
            .simulate(call, participant)
            .await
            .map_err(chain_error)?;
        debug!(function = call.function, "Simulation passed");

        let tx_hash = self.chain.write(call).await.map_err(chain_error)?;
        info!(action = %action, tx = ?tx_hash, "Transaction submitted");

        let pending = PendingTransaction {
            action,
            tx_hash,
            submitted_at: self.clock.now(),
            commit_hash: context.commit_hash,
            claimed_secret: context.claimed_secret,
        };
        let recorded = match self.secrets.save_pending(&self.pool_id, &participant, &pending).await {
            Ok(()) => true,
            Err(err) => {
                warn!(tx = ?tx_hash, "Could not record pending transaction: {}", err);
                false
            }
        };
        self.state.write().await.pending = Some(pending);
        Ok(Submission { tx_hash, recorded })
    }

    /// Wait for the receipt. The pending record is dropped once the outcome
    /// is known and kept when we only lost track of the transaction.
    async fn confirm(
        &self,
        action: BetAction,
        participant: Address,
        tx_hash: H256,
    ) -> SessionResult<TxReceipt> {
        match self.chain.await_confirmation(tx_hash).await {
            Ok(receipt) => {
                self.forget_pending(participant).await?;
                info!(action = %action, tx = ?tx_hash, block = ?receipt.block_number, "Transaction confirmed");
                Ok(receipt)
            }
            Err(err @ ChainError::TransactionFailed(_)) => {
                self.forget_pending(participant).await?;
                Err(chain_error(err))
            }
            Err(err) => {
                warn!(action = %action, tx = ?tx_hash, "Stopped waiting; transaction still pending: {}", err);
                Err(SessionError::new(
                    ErrorKind::OperationPending,
                    "Transaction is still waiting for confirmation.",
                )
                .with_detail(err.to_string()))
            }
        }
    }

    async fn forget_pending(&self, participant: Address) -> SessionResult<()> {
        self.secrets.clear_pending(&self.pool_id, &participant).await?;
        self.state.write().await.pending = None;
        Ok(())
    }

    async fn after_write(&self, receipt: &TxReceipt) {
        self.state.write().await.last_receipt = Some(receipt.clone());
        if let Err(err) = self.refresh_state().await {
            warn!(kind = %err.kind, "Refresh after write failed: {}", err);
        }
    }

    async fn restore_secret(&self, participant: Address, secret: &BetCommitmentSecret) {
        match self.secrets.save(&self.pool_id, &participant, secret).await {
            Ok(()) => info!("Bet secret restored after failed claim"),
            Err(err) => warn!("Could not restore bet secret after failed claim: {}", err),
        }
    }

    async fn commitment_phase(&self, commitment: &RemoteCommitment) -> SessionResult<Phase> {
        let batch = self.read_batch(commitment.batch_id).await?;
        let schedule = self.state.read().await.schedule;
        Ok(schedule.window(batch.start_time).current_phase(self.clock.now()))
    }

    async fn read_commitment(&self, participant: Address) -> SessionResult<Option<RemoteCommitment>> {
        let data = self
            .chain
            .read(&self.hook.get_commitment(participant))
            .await
            .map_err(chain_error)?;
        decode_commitment(&data).map_err(chain_error)
    }

    async fn read_batch(&self, batch_id: U256) -> SessionResult<BatchInfo> {
        let data = self
            .chain
            .read(&self.hook.get_batch_info(batch_id))
            .await
            .map_err(chain_error)?;
        decode_batch_info(&data).map_err(chain_error)
    }

    async fn read_market(&self) -> SessionResult<PrivateMarket> {
        let data = self
            .chain
            .read(&self.hook.get_market())
            .await
            .map_err(chain_error)?;
        decode_market(&data).map_err(chain_error)
    }

    async fn read_duration(&self, call: ContractCall, signature: &str) -> SessionResult<Duration> {
        let data = self.chain.read(&call).await.map_err(chain_error)?;
        let value = decode_uint(call.function, &data).map_err(chain_error)?;
        if value.is_zero() || value > U256::from(i64::MAX as u64) {
            return Err(SessionError::new(
                ErrorKind::Unknown,
                format!("Hook returned an unusable {}: {}", signature, value),
            ));
        }
        Ok(Duration::from_secs(value.low_u64()))
    }
}

/// Whether chain state already shows the effect of a pending write
fn pending_resolved(pending: &PendingTransaction, remote: Option<&RemoteCommitment>) -> bool {
    match pending.action {
        BetAction::Commit => match (pending.commit_hash, remote) {
            (Some(hash), Some(c)) => c.commit_hash == hash,
            // records written before the hash was kept
            (None, Some(c)) => !c.executed,
            (_, None) => false,
        },
        BetAction::Reveal => remote.map_or(true, |c| c.revealed),
        BetAction::Claim => remote.map_or(true, |c| c.executed),
        BetAction::SettleBatch => true,
    }
}
