//! Test doubles for session tests
//!
//! `FakeHook` implements `ChainClient` by decoding real calldata and
//! modelling the commit-reveal hook in memory; `RecordingStore` wraps
//! `MemoryStore`. Both append to one shared `EventLog` so tests can assert
//! the order in which storage and chain calls happened.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use betting_client::{
    chain::{ChainClient, ChainError, ContractCall, TxReceipt},
    hook::{self, selector, PoolKey, PrivateBettingHook},
    storage::{KeyValueStore, MemoryStore, StorageError},
    BatchSchedule, BetCommitmentSecret, BetSecretStore, Clock, ManualClock,
    PrivateBettingSession, Timestamp,
};
use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use tokio::sync::Notify;
use web3::ethabi::{self, ParamType, Token};

pub const T0: i64 = 1_700_000_000;

pub fn participant() -> Address {
    Address::from_str("0x5B38Da6a701c568545dCfcB03FcB875f56beddC4").unwrap()
}

pub fn hook_address() -> Address {
    Address::repeat_byte(0x22)
}

pub fn pool_key() -> PoolKey {
    PoolKey {
        currency0: Address::zero(),
        currency1: Address::repeat_byte(0x11),
        fee: 3000,
        tick_spacing: 60,
        hooks: hook_address(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StoreSet(String),
    StoreDelete(String),
    Read(&'static str),
    Simulate(&'static str),
    Write(&'static str),
    Confirm(H256),
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn all(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        self.all().iter().position(|e| e == event)
    }

    pub fn writes(&self, function: &str) -> usize {
        self.all()
            .iter()
            .filter(|e| matches!(e, Event::Write(f) if *f == function))
            .count()
    }

    pub fn chain_calls(&self) -> usize {
        self.all()
            .iter()
            .filter(|e| matches!(e, Event::Read(_) | Event::Simulate(_) | Event::Write(_)))
            .count()
    }
}

/// `MemoryStore` that logs every mutation
pub struct RecordingStore {
    inner: MemoryStore,
    events: EventLog,
    fail_writes: AtomicBool,
    fail_prefix: Mutex<Option<String>>,
}

impl RecordingStore {
    pub fn new(events: EventLog) -> Self {
        Self {
            inner: MemoryStore::new(),
            events,
            fail_writes: AtomicBool::new(false),
            fail_prefix: Mutex::new(None),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail only writes to keys starting with `prefix`
    pub fn fail_writes_with_prefix(&self, prefix: Option<&str>) {
        *self.fail_prefix.lock().unwrap() = prefix.map(str::to_string);
    }
}

#[async_trait]
impl KeyValueStore for RecordingStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let prefixed = self
            .fail_prefix
            .lock()
            .unwrap()
            .as_deref()
            .map_or(false, |prefix| key.starts_with(prefix));
        if prefixed || self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io {
                key: key.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        self.events.push(Event::StoreSet(key.to_string()));
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.events.push(Event::StoreDelete(key.to_string()));
        self.inner.delete(key).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub start_time: i64,
    pub total_yes: U256,
    pub total_no: U256,
    pub yes_count: u64,
    pub no_count: u64,
    pub settled: bool,
}

#[derive(Debug, Clone)]
pub struct Commitment {
    pub hash: H256,
    pub amount: U256,
    pub batch_id: u64,
    pub revealed: bool,
    pub executed: bool,
}

enum TxState {
    Mined,
    Reverted,
    Held { from: Address, data: Vec<u8> },
}

struct HookState {
    batch_duration: u64,
    reveal_window: u64,
    current_batch_id: u64,
    batches: HashMap<u64, Batch>,
    commitments: HashMap<Address, Commitment>,
    resolved: bool,
    outcome: bool,
    expiry: i64,
    next_tx: u64,
    txs: HashMap<H256, TxState>,
}

impl HookState {
    fn batch_end(&self, batch_id: u64) -> (i64, i64) {
        let start = self.batches.get(&batch_id).map(|b| b.start_time).unwrap_or(0);
        let commit_end = start + self.batch_duration as i64;
        (commit_end, commit_end + self.reveal_window as i64)
    }

    /// Current batch, or a fresh one if its commit window is over
    fn open_batch(&mut self, now: i64) -> u64 {
        let (commit_end, _) = self.batch_end(self.current_batch_id);
        if now >= commit_end {
            self.current_batch_id += 1;
            self.batches.insert(
                self.current_batch_id,
                Batch {
                    start_time: now,
                    ..Default::default()
                },
            );
        }
        self.current_batch_id
    }
}

#[derive(Default)]
struct Script {
    simulate_error: Option<ChainError>,
    write_error: Option<ChainError>,
    revert_onchain: bool,
    hold: bool,
    gate: Option<Arc<Notify>>,
}

/// In-memory private betting hook
pub struct FakeHook {
    clock: Arc<ManualClock>,
    account: Option<Address>,
    events: EventLog,
    state: Mutex<HookState>,
    script: Mutex<Script>,
}

fn revert(name: &str) -> ChainError {
    ChainError::Reverted {
        message: "execution reverted".to_string(),
        data: Some(selector(&format!("{}()", name)).to_vec()),
    }
}

fn revert_reason(reason: &str) -> ChainError {
    let mut data = selector("Error(string)").to_vec();
    data.extend(ethabi::encode(&[Token::String(reason.to_string())]));
    ChainError::Reverted {
        message: format!("execution reverted: {}", reason),
        data: Some(data),
    }
}

fn expected_hash(outcome: bool, salt: &[u8], who: &Address) -> H256 {
    let mut packed = vec![outcome as u8];
    packed.extend_from_slice(salt);
    packed.extend_from_slice(who.as_bytes());
    H256(keccak(&packed).0)
}

fn key_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(24),
        ParamType::Int(24),
        ParamType::Address,
    ])
}

fn args(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>, ChainError> {
    ethabi::decode(types, data).map_err(|e| ChainError::Rpc(format!("bad calldata: {}", e)))
}

fn uint_word(value: u64) -> Vec<u8> {
    ethabi::encode(&[Token::Uint(U256::from(value))])
}

impl FakeHook {
    pub fn new(clock: Arc<ManualClock>, events: EventLog) -> Self {
        let now = clock.now().as_unix();
        let mut batches = HashMap::new();
        batches.insert(
            1,
            Batch {
                start_time: now,
                ..Default::default()
            },
        );
        Self {
            clock,
            account: Some(participant()),
            events,
            state: Mutex::new(HookState {
                batch_duration: 300,
                reveal_window: 600,
                current_batch_id: 1,
                batches,
                commitments: HashMap::new(),
                resolved: false,
                outcome: false,
                expiry: now + 86_400,
                next_tx: 1,
                txs: HashMap::new(),
            }),
            script: Mutex::new(Script::default()),
        }
    }

    pub fn without_account(mut self) -> Self {
        self.account = None;
        self
    }

    pub fn with_schedule(self, batch_duration: u64, reveal_window: u64) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.batch_duration = batch_duration;
            state.reveal_window = reveal_window;
        }
        self
    }

    pub fn resolve(&self, outcome: bool) {
        let mut state = self.state.lock().unwrap();
        state.resolved = true;
        state.outcome = outcome;
    }

    pub fn commitment(&self, who: Address) -> Option<Commitment> {
        self.state.lock().unwrap().commitments.get(&who).cloned()
    }

    pub fn set_commitment(&self, who: Address, commitment: Commitment) {
        self.state.lock().unwrap().commitments.insert(who, commitment);
    }

    pub fn mark_revealed(&self, who: Address) {
        if let Some(c) = self.state.lock().unwrap().commitments.get_mut(&who) {
            c.revealed = true;
        }
    }

    pub fn batch(&self, batch_id: u64) -> Batch {
        self.state.lock().unwrap().batches.get(&batch_id).cloned().unwrap_or_default()
    }

    pub fn fail_next_simulate(&self, err: ChainError) {
        self.script.lock().unwrap().simulate_error = Some(err);
    }

    pub fn fail_next_write(&self, err: ChainError) {
        self.script.lock().unwrap().write_error = Some(err);
    }

    /// Next write is accepted but its transaction fails when mined
    pub fn revert_next_onchain(&self) {
        self.script.lock().unwrap().revert_onchain = true;
    }

    /// Next write stays unmined until [`FakeHook::mine_held`]
    pub fn hold_next(&self) {
        self.script.lock().unwrap().hold = true;
    }

    /// Confirmations wait for a permit on `gate`
    pub fn gate_confirmations(&self, gate: Arc<Notify>) {
        self.script.lock().unwrap().gate = Some(gate);
    }

    pub fn mine_held(&self) {
        let held: Vec<(H256, Address, Vec<u8>)> = {
            let state = self.state.lock().unwrap();
            state
                .txs
                .iter()
                .filter_map(|(hash, tx)| match tx {
                    TxState::Held { from, data } => Some((*hash, *from, data.clone())),
                    _ => None,
                })
                .collect()
        };
        for (hash, from, data) in held {
            let mined = self.execute(from, &data, true).is_ok();
            let status = if mined { TxState::Mined } else { TxState::Reverted };
            self.state.lock().unwrap().txs.insert(hash, status);
        }
    }

    fn execute(&self, from: Address, data: &[u8], apply: bool) -> Result<Vec<u8>, ChainError> {
        if data.len() < 4 {
            return Err(ChainError::Rpc("calldata too short".to_string()));
        }
        let now = self.clock.now().as_unix();
        let (sel, input) = data.split_at(4);
        let mut state = self.state.lock().unwrap();

        if sel == selector(hook::COMMIT_BET) {
            let t = args(&[key_type(), ParamType::FixedBytes(32), ParamType::Uint(256)], input)?;
            let hash = H256::from_slice(&t[1].clone().into_fixed_bytes().unwrap());
            let amount = t[2].clone().into_uint().unwrap();
            if amount.is_zero() {
                return Err(revert("InsufficientAmount"));
            }
            if state.resolved {
                return Err(revert("MarketAlreadyResolved"));
            }
            if let Some(c) = state.commitments.get(&from) {
                if !c.executed {
                    return Err(revert("CommitmentAlreadyExists"));
                }
            }
            if apply {
                let batch_id = state.open_batch(now);
                state.commitments.insert(
                    from,
                    Commitment {
                        hash,
                        amount,
                        batch_id,
                        revealed: false,
                        executed: false,
                    },
                );
            }
            return Ok(Vec::new());
        }

        if sel == selector(hook::REVEAL_BET) {
            let t = args(&[key_type(), ParamType::Bool, ParamType::FixedBytes(32)], input)?;
            let outcome = t[1].clone().into_bool().unwrap();
            let salt = t[2].clone().into_fixed_bytes().unwrap();
            let Some(c) = state.commitments.get(&from).cloned() else {
                return Err(revert("NoCommitment"));
            };
            if c.revealed {
                return Err(revert("AlreadyRevealed"));
            }
            let (commit_end, reveal_end) = state.batch_end(c.batch_id);
            if now < commit_end {
                return Err(revert("RevealWindowNotOpen"));
            }
            if now >= reveal_end {
                return Err(revert("RevealWindowClosed"));
            }
            if expected_hash(outcome, &salt, &from) != c.hash {
                return Err(revert("InvalidReveal"));
            }
            if apply {
                if let Some(c) = state.commitments.get_mut(&from) {
                    c.revealed = true;
                }
                if let Some(batch) = state.batches.get_mut(&c.batch_id) {
                    if outcome {
                        batch.total_yes += c.amount;
                        batch.yes_count += 1;
                    } else {
                        batch.total_no += c.amount;
                        batch.no_count += 1;
                    }
                }
            }
            return Ok(Vec::new());
        }

        if sel == selector(hook::CLAIM_WINNINGS) {
            let t = args(&[key_type(), ParamType::Bool, ParamType::FixedBytes(32)], input)?;
            let outcome = t[1].clone().into_bool().unwrap();
            let salt = t[2].clone().into_fixed_bytes().unwrap();
            let Some(c) = state.commitments.get(&from).cloned() else {
                return Err(revert("NoCommitment"));
            };
            if c.executed {
                return Err(revert("AlreadyExecuted"));
            }
            if !state.resolved {
                return Err(revert("MarketNotResolved"));
            }
            let (_, reveal_end) = state.batch_end(c.batch_id);
            if now < reveal_end {
                return Err(revert("BatchNotSettled"));
            }
            if !c.revealed || expected_hash(outcome, &salt, &from) != c.hash {
                return Err(revert("InvalidReveal"));
            }
            if outcome != state.outcome {
                return Err(revert("NoWinnings"));
            }
            if apply {
                if let Some(c) = state.commitments.get_mut(&from) {
                    c.executed = true;
                }
            }
            return Ok(Vec::new());
        }

        if sel == selector(hook::SETTLE_BATCH) {
            let t = args(&[key_type(), ParamType::Uint(256)], input)?;
            let batch_id = t[1].clone().into_uint().unwrap().low_u64();
            let (_, reveal_end) = state.batch_end(batch_id);
            if now < reveal_end {
                return Err(revert_reason("Reveal window still open"));
            }
            if apply {
                if let Some(batch) = state.batches.get_mut(&batch_id) {
                    batch.settled = true;
                }
            }
            return Ok(Vec::new());
        }

        if sel == selector(hook::GET_CURRENT_BATCH_ID) {
            return Ok(uint_word(state.current_batch_id));
        }

        if sel == selector(hook::GET_BATCH_INFO) {
            let t = args(&[key_type(), ParamType::Uint(256)], input)?;
            let batch_id = t[1].clone().into_uint().unwrap().low_u64();
            let batch = state.batches.get(&batch_id).cloned().unwrap_or_default();
            return Ok(ethabi::encode(&[Token::Tuple(vec![
                Token::Uint(U256::from(batch.start_time as u64)),
                Token::Uint(batch.total_yes),
                Token::Uint(batch.total_no),
                Token::Uint(U256::from(batch.yes_count)),
                Token::Uint(U256::from(batch.no_count)),
                Token::Bool(batch.settled),
            ])]));
        }

        if sel == selector(hook::GET_COMMITMENT) {
            let t = args(&[key_type(), ParamType::Address], input)?;
            let who = t[1].clone().into_address().unwrap();
            let tuple = match state.commitments.get(&who) {
                Some(c) => vec![
                    Token::FixedBytes(c.hash.as_bytes().to_vec()),
                    Token::Uint(c.amount),
                    Token::Uint(U256::from(c.batch_id)),
                    Token::Bool(c.revealed),
                    Token::Bool(c.executed),
                ],
                None => vec![
                    Token::FixedBytes(vec![0; 32]),
                    Token::Uint(U256::zero()),
                    Token::Uint(U256::zero()),
                    Token::Bool(false),
                    Token::Bool(false),
                ],
            };
            return Ok(ethabi::encode(&[Token::Tuple(tuple)]));
        }

        if sel == selector(hook::GET_MARKET) {
            return Ok(ethabi::encode(&[Token::Tuple(vec![
                Token::Address(Address::repeat_byte(0x01)),
                Token::Address(Address::repeat_byte(0x02)),
                Token::Address(Address::repeat_byte(0x03)),
                Token::Address(Address::repeat_byte(0x04)),
                Token::Uint(U256::from(state.expiry as u64)),
                Token::Bool(state.resolved),
                Token::Bool(state.outcome),
                Token::Uint(U256::from(state.current_batch_id)),
            ])]));
        }

        if sel == selector(hook::GENERATE_COMMIT_HASH) {
            let t = args(
                &[ParamType::Bool, ParamType::FixedBytes(32), ParamType::Address],
                input,
            )?;
            let outcome = t[0].clone().into_bool().unwrap();
            let salt = t[1].clone().into_fixed_bytes().unwrap();
            let who = t[2].clone().into_address().unwrap();
            let hash = expected_hash(outcome, &salt, &who);
            return Ok(ethabi::encode(&[Token::FixedBytes(hash.as_bytes().to_vec())]));
        }

        if sel == selector(hook::BATCH_DURATION) {
            return Ok(uint_word(state.batch_duration));
        }
        if sel == selector(hook::REVEAL_WINDOW) {
            return Ok(uint_word(state.reveal_window));
        }

        Err(ChainError::Rpc(format!("unknown selector 0x{}", hex::encode(sel))))
    }
}

#[async_trait]
impl ChainClient for FakeHook {
    async fn read(&self, call: &ContractCall) -> Result<Vec<u8>, ChainError> {
        self.events.push(Event::Read(call.function));
        self.execute(Address::zero(), &call.data, false)
    }

    async fn simulate(&self, call: &ContractCall, from: Address) -> Result<Vec<u8>, ChainError> {
        self.events.push(Event::Simulate(call.function));
        if let Some(err) = self.script.lock().unwrap().simulate_error.take() {
            return Err(err);
        }
        self.execute(from, &call.data, false)
    }

    async fn write(&self, call: &ContractCall) -> Result<H256, ChainError> {
        self.events.push(Event::Write(call.function));
        let from = self.account.ok_or(ChainError::NoAccount)?;

        let (write_error, revert_onchain, hold) = {
            let mut script = self.script.lock().unwrap();
            (
                script.write_error.take(),
                std::mem::take(&mut script.revert_onchain),
                std::mem::take(&mut script.hold),
            )
        };
        if let Some(err) = write_error {
            return Err(err);
        }

        let status = if revert_onchain {
            TxState::Reverted
        } else if hold {
            TxState::Held {
                from,
                data: call.data.clone(),
            }
        } else {
            self.execute(from, &call.data, true)?;
            TxState::Mined
        };

        let mut state = self.state.lock().unwrap();
        let tx_hash = H256::from_low_u64_be(state.next_tx);
        state.next_tx += 1;
        state.txs.insert(tx_hash, status);
        Ok(tx_hash)
    }

    async fn await_confirmation(&self, tx_hash: H256) -> Result<TxReceipt, ChainError> {
        self.events.push(Event::Confirm(tx_hash));
        let gate = self.script.lock().unwrap().gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let state = self.state.lock().unwrap();
        match state.txs.get(&tx_hash) {
            Some(TxState::Mined) => Ok(TxReceipt {
                tx_hash,
                block_number: Some(state.next_tx),
                gas_used: Some(U256::from(21_000u64)),
                success: true,
            }),
            Some(TxState::Reverted) => Err(ChainError::TransactionFailed(tx_hash)),
            Some(TxState::Held { .. }) => Err(ChainError::ConfirmationTimeout(tx_hash)),
            None => Err(ChainError::Rpc(format!("unknown transaction {:?}", tx_hash))),
        }
    }

    fn account(&self) -> Option<Address> {
        self.account
    }
}

/// Session wired to a fake hook and a recording store
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub events: EventLog,
    pub hook: Arc<FakeHook>,
    pub store: Arc<RecordingStore>,
    pub session: Arc<PrivateBettingSession>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(|hook| hook)
    }

    pub fn build(configure: impl FnOnce(FakeHook) -> FakeHook) -> Self {
        let clock = Arc::new(ManualClock::new(Timestamp::from_unix(T0)));
        let events = EventLog::default();
        let hook = Arc::new(configure(FakeHook::new(clock.clone(), events.clone())));
        let store = Arc::new(RecordingStore::new(events.clone()));
        let session = Arc::new(session_for(hook.clone(), store.clone(), clock.clone()));
        Self {
            clock,
            events,
            hook,
            store,
            session,
        }
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    /// Move to `T0 + secs`
    pub fn at(&self, secs: i64) {
        self.clock.set(Timestamp::from_unix(T0 + secs));
    }

    pub fn secret_key(&self) -> String {
        BetSecretStore::storage_key(&pool_key().pool_id(), &participant())
    }

    pub async fn stored_secret(&self) -> Option<BetCommitmentSecret> {
        BetSecretStore::new(self.store.clone())
            .load(&pool_key().pool_id(), &participant())
            .await
            .unwrap()
    }
}

pub fn session_for(
    hook: Arc<dyn ChainClient>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<ManualClock>,
) -> PrivateBettingSession {
    PrivateBettingSession::new(
        hook,
        store,
        PrivateBettingHook::new(hook_address(), pool_key()),
        BatchSchedule::default(),
        clock,
    )
}
