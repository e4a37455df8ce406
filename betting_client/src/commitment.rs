//! Commit hash and salt generation
//!
//! The hook verifies a reveal with
//! `keccak256(abi.encodePacked(bool outcome, bytes32 salt, address user))`,
//! so the preimage here is exactly 1 + 32 + 20 bytes in that order. Binding
//! the caller's address stops anyone from replaying a commit hash they saw
//! in the mempool.

use ethereum_types::{Address, H256};
use keccak_hash::keccak;
use rand::{rngs::OsRng, RngCore};

/// Length of the packed `(bool, bytes32, address)` preimage
pub const COMMIT_PREIMAGE_LEN: usize = 1 + 32 + 20;

/// Fresh 32-byte salt from the operating system CSPRNG
pub fn generate_salt() -> H256 {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    H256(bytes)
}

/// `abi.encodePacked(outcome, salt, participant)`
pub fn encode_commit_preimage(
    outcome: bool,
    salt: &H256,
    participant: &Address,
) -> [u8; COMMIT_PREIMAGE_LEN] {
    let mut packed = [0u8; COMMIT_PREIMAGE_LEN];
    packed[0] = outcome as u8;
    packed[1..33].copy_from_slice(salt.as_bytes());
    packed[33..].copy_from_slice(participant.as_bytes());
    packed
}

/// Hash published on-chain at commit time
pub fn compute_commit_hash(outcome: bool, salt: &H256, participant: &Address) -> H256 {
    let packed = encode_commit_preimage(outcome, salt, participant);
    H256(keccak(&packed[..]).0)
}
