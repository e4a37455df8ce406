//! Private betting hook contract binding
//!
//! Calldata encoders and output decoders for the hook functions the client
//! uses, plus the table of custom errors the hook can revert with.

use std::collections::HashMap;

use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use serde::{Deserialize, Serialize};
use web3::ethabi::{self, ParamType, Token};

use crate::{
    chain::{ChainError, ContractCall},
    clock::Timestamp,
};

pub const COMMIT_BET: &str = "commitBet((address,address,uint24,int24,address),bytes32,uint256)";
pub const REVEAL_BET: &str = "revealBet((address,address,uint24,int24,address),bool,bytes32)";
pub const CLAIM_WINNINGS: &str = "claimWinnings((address,address,uint24,int24,address),bool,bytes32)";
pub const SETTLE_BATCH: &str = "settleBatch((address,address,uint24,int24,address),uint256)";
pub const GET_CURRENT_BATCH_ID: &str = "getCurrentBatchId((address,address,uint24,int24,address))";
pub const GET_BATCH_INFO: &str = "getBatchInfo((address,address,uint24,int24,address),uint256)";
pub const GET_COMMITMENT: &str = "getCommitment((address,address,uint24,int24,address),address)";
pub const GET_MARKET: &str = "getMarket((address,address,uint24,int24,address))";
pub const GENERATE_COMMIT_HASH: &str = "generateCommitHash(bool,bytes32,address)";
pub const BATCH_DURATION: &str = "BATCH_DURATION()";
pub const REVEAL_WINDOW: &str = "REVEAL_WINDOW()";

/// First four bytes of the keccak of a canonical signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn function_name(signature: &'static str) -> &'static str {
    signature.split('(').next().unwrap_or(signature)
}

/// Uniswap v4 style pool key identifying a market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolKey {
    pub currency0: Address,
    pub currency1: Address,
    /// uint24
    pub fee: u32,
    /// int24
    pub tick_spacing: i32,
    pub hooks: Address,
}

impl PoolKey {
    /// `keccak256(abi.encodePacked(currency0, currency1, fee, tickSpacing, hooks))`
    pub fn pool_id(&self) -> H256 {
        let mut packed = Vec::with_capacity(20 + 20 + 3 + 3 + 20);
        packed.extend_from_slice(self.currency0.as_bytes());
        packed.extend_from_slice(self.currency1.as_bytes());
        packed.extend_from_slice(&self.fee.to_be_bytes()[1..]);
        packed.extend_from_slice(&self.tick_spacing.to_be_bytes()[1..]);
        packed.extend_from_slice(self.hooks.as_bytes());
        H256(keccak(&packed).0)
    }

    fn to_token(self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.currency0),
            Token::Address(self.currency1),
            Token::Uint(U256::from(self.fee)),
            Token::Int(int_to_word(self.tick_spacing as i64)),
            Token::Address(self.hooks),
        ])
    }
}

/// Two's complement 256-bit word
fn int_to_word(value: i64) -> U256 {
    if value >= 0 {
        U256::from(value as u64)
    } else {
        !U256::from((-(value + 1)) as u64)
    }
}

/// Per-batch totals and start time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchInfo {
    pub start_time: Timestamp,
    pub total_yes_amount: U256,
    pub total_no_amount: U256,
    pub yes_count: U256,
    pub no_count: U256,
    pub settled: bool,
}

impl BatchInfo {
    /// Share of YES volume in percent; 50 for an empty batch
    pub fn yes_share(&self) -> f64 {
        let yes = self.total_yes_amount.low_u128() as f64;
        let total = yes + self.total_no_amount.low_u128() as f64;
        if total > 0.0 {
            yes / total * 100.0
        } else {
            50.0
        }
    }
}

/// On-chain mirror of a participant's commitment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommitment {
    pub commit_hash: H256,
    pub amount: U256,
    pub batch_id: U256,
    pub revealed: bool,
    pub executed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMarket {
    pub yes_token: Address,
    pub no_token: Address,
    pub collateral_token: Address,
    pub oracle: Address,
    pub expiry: Timestamp,
    pub resolved: bool,
    pub outcome: bool,
    pub current_batch_id: U256,
}

/// Calldata builders for one hook deployment and pool
#[derive(Debug, Clone)]
pub struct PrivateBettingHook {
    address: Address,
    pool_key: PoolKey,
}

impl PrivateBettingHook {
    pub fn new(address: Address, pool_key: PoolKey) -> Self {
        Self { address, pool_key }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn pool_key(&self) -> &PoolKey {
        &self.pool_key
    }

    fn call(&self, signature: &'static str, args: &[Token]) -> ContractCall {
        let mut data = selector(signature).to_vec();
        data.extend(ethabi::encode(args));
        ContractCall::new(self.address, function_name(signature), data)
    }

    pub fn commit_bet(&self, commit_hash: H256, amount: U256) -> ContractCall {
        self.call(
            COMMIT_BET,
            &[
                self.pool_key.to_token(),
                Token::FixedBytes(commit_hash.as_bytes().to_vec()),
                Token::Uint(amount),
            ],
        )
    }

    pub fn reveal_bet(&self, outcome: bool, salt: H256) -> ContractCall {
        self.call(
            REVEAL_BET,
            &[
                self.pool_key.to_token(),
                Token::Bool(outcome),
                Token::FixedBytes(salt.as_bytes().to_vec()),
            ],
        )
    }

    pub fn claim_winnings(&self, outcome: bool, salt: H256) -> ContractCall {
        self.call(
            CLAIM_WINNINGS,
            &[
                self.pool_key.to_token(),
                Token::Bool(outcome),
                Token::FixedBytes(salt.as_bytes().to_vec()),
            ],
        )
    }

    pub fn settle_batch(&self, batch_id: U256) -> ContractCall {
        self.call(SETTLE_BATCH, &[self.pool_key.to_token(), Token::Uint(batch_id)])
    }

    pub fn get_current_batch_id(&self) -> ContractCall {
        self.call(GET_CURRENT_BATCH_ID, &[self.pool_key.to_token()])
    }

    pub fn get_batch_info(&self, batch_id: U256) -> ContractCall {
        self.call(GET_BATCH_INFO, &[self.pool_key.to_token(), Token::Uint(batch_id)])
    }

    pub fn get_commitment(&self, participant: Address) -> ContractCall {
        self.call(GET_COMMITMENT, &[self.pool_key.to_token(), Token::Address(participant)])
    }

    pub fn get_market(&self) -> ContractCall {
        self.call(GET_MARKET, &[self.pool_key.to_token()])
    }

    pub fn generate_commit_hash(&self, outcome: bool, salt: H256, participant: Address) -> ContractCall {
        self.call(
            GENERATE_COMMIT_HASH,
            &[
                Token::Bool(outcome),
                Token::FixedBytes(salt.as_bytes().to_vec()),
                Token::Address(participant),
            ],
        )
    }

    pub fn batch_duration(&self) -> ContractCall {
        self.call(BATCH_DURATION, &[])
    }

    pub fn reveal_window(&self) -> ContractCall {
        self.call(REVEAL_WINDOW, &[])
    }
}

fn decode(function: &'static str, types: &[ParamType], data: &[u8]) -> Result<Vec<Token>, ChainError> {
    ethabi::decode(types, data).map_err(|e| ChainError::Decode {
        function,
        reason: e.to_string(),
    })
}

fn tuple_fields(function: &'static str, mut tokens: Vec<Token>, arity: usize) -> Result<Vec<Token>, ChainError> {
    match tokens.pop() {
        Some(Token::Tuple(fields)) if tokens.is_empty() && fields.len() == arity => Ok(fields),
        _ => Err(ChainError::Decode {
            function,
            reason: format!("expected a single {}-field tuple", arity),
        }),
    }
}

fn uint(function: &'static str, token: Token) -> Result<U256, ChainError> {
    token.into_uint().ok_or(ChainError::Decode {
        function,
        reason: "expected uint".to_string(),
    })
}

fn boolean(function: &'static str, token: Token) -> Result<bool, ChainError> {
    token.into_bool().ok_or(ChainError::Decode {
        function,
        reason: "expected bool".to_string(),
    })
}

fn address(function: &'static str, token: Token) -> Result<Address, ChainError> {
    token.into_address().ok_or(ChainError::Decode {
        function,
        reason: "expected address".to_string(),
    })
}

fn bytes32(function: &'static str, token: Token) -> Result<H256, ChainError> {
    match token.into_fixed_bytes() {
        Some(bytes) if bytes.len() == 32 => Ok(H256::from_slice(&bytes)),
        _ => Err(ChainError::Decode {
            function,
            reason: "expected bytes32".to_string(),
        }),
    }
}

fn timestamp(function: &'static str, value: U256) -> Result<Timestamp, ChainError> {
    if value > U256::from(i64::MAX as u64) {
        return Err(ChainError::Decode {
            function,
            reason: format!("timestamp {} out of range", value),
        });
    }
    Ok(Timestamp::from_unix(value.low_u64() as i64))
}

pub fn decode_uint(function: &'static str, data: &[u8]) -> Result<U256, ChainError> {
    let mut tokens = decode(function, &[ParamType::Uint(256)], data)?;
    uint(function, tokens.remove(0))
}

pub fn decode_bytes32(function: &'static str, data: &[u8]) -> Result<H256, ChainError> {
    let mut tokens = decode(function, &[ParamType::FixedBytes(32)], data)?;
    bytes32(function, tokens.remove(0))
}

pub fn decode_batch_info(data: &[u8]) -> Result<BatchInfo, ChainError> {
    let function = "getBatchInfo";
    let types = [ParamType::Tuple(vec![
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Bool,
    ])];
    let mut fields = tuple_fields(function, decode(function, &types, data)?, 6)?.into_iter();
    let mut next = || fields.next().ok_or(ChainError::Decode { function, reason: "short tuple".to_string() });

    Ok(BatchInfo {
        start_time: timestamp(function, uint(function, next()?)?)?,
        total_yes_amount: uint(function, next()?)?,
        total_no_amount: uint(function, next()?)?,
        yes_count: uint(function, next()?)?,
        no_count: uint(function, next()?)?,
        settled: boolean(function, next()?)?,
    })
}

/// `None` when the hook returns the zero commitment
pub fn decode_commitment(data: &[u8]) -> Result<Option<RemoteCommitment>, ChainError> {
    let function = "getCommitment";
    let types = [ParamType::Tuple(vec![
        ParamType::FixedBytes(32),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Bool,
        ParamType::Bool,
    ])];
    let mut fields = tuple_fields(function, decode(function, &types, data)?, 5)?.into_iter();
    let mut next = || fields.next().ok_or(ChainError::Decode { function, reason: "short tuple".to_string() });

    let commitment = RemoteCommitment {
        commit_hash: bytes32(function, next()?)?,
        amount: uint(function, next()?)?,
        batch_id: uint(function, next()?)?,
        revealed: boolean(function, next()?)?,
        executed: boolean(function, next()?)?,
    };
    if commitment.commit_hash.is_zero() {
        return Ok(None);
    }
    Ok(Some(commitment))
}

pub fn decode_market(data: &[u8]) -> Result<PrivateMarket, ChainError> {
    let function = "getMarket";
    let types = [ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Address,
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Bool,
        ParamType::Bool,
        ParamType::Uint(256),
    ])];
    let mut fields = tuple_fields(function, decode(function, &types, data)?, 8)?.into_iter();
    let mut next = || fields.next().ok_or(ChainError::Decode { function, reason: "short tuple".to_string() });

    Ok(PrivateMarket {
        yes_token: address(function, next()?)?,
        no_token: address(function, next()?)?,
        collateral_token: address(function, next()?)?,
        oracle: address(function, next()?)?,
        expiry: timestamp(function, uint(function, next()?)?)?,
        resolved: boolean(function, next()?)?,
        outcome: boolean(function, next()?)?,
        current_batch_id: uint(function, next()?)?,
    })
}

/// Custom errors declared by the hook, with the text shown to users
pub const HOOK_ERRORS: &[(&str, &str)] = &[
    ("MarketNotInitialized", "Market has not been initialized."),
    ("MarketExpired", "This market has expired."),
    ("MarketNotExpired", "Market has not expired yet."),
    ("MarketAlreadyResolved", "This market has already been resolved."),
    ("MarketNotResolved", "This market has not been resolved yet."),
    ("OnlyOracle", "Only the oracle can perform this action."),
    ("InvalidExpiry", "Invalid expiry time."),
    ("CommitmentAlreadyExists", "You already have an active commitment."),
    ("NoCommitment", "No commitment found."),
    ("AlreadyRevealed", "Bet has already been revealed."),
    ("RevealWindowNotOpen", "Reveal window is not open yet."),
    ("RevealWindowClosed", "Reveal window has closed."),
    ("InvalidReveal", "Invalid reveal - hash does not match commitment."),
    ("BatchNotSettled", "Batch has not been settled yet."),
    ("AlreadyExecuted", "Winnings have already been claimed."),
    ("NoWinnings", "No winnings to claim."),
    ("InsufficientAmount", "Amount must be greater than zero."),
];

lazy_static::lazy_static! {
    /// Selector of every argument-less hook error, keyed to its name
    pub static ref HOOK_ERROR_SELECTORS: HashMap<[u8; 4], &'static str> = HOOK_ERRORS
        .iter()
        .map(|(name, _)| (selector(&format!("{}()", name)), *name))
        .collect();
}

pub fn hook_error_message(name: &str) -> Option<&'static str> {
    HOOK_ERRORS
        .iter()
        .find(|(error, _)| *error == name)
        .map(|(_, message)| *message)
}
