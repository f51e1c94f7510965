// Copyright (C) 2025, 2026 Metapool Developers (see AUTHORS)
//
// This file is part of Metapool
//
// Metapool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Metapool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Metapool. If not, see <https://www.gnu.org/licenses/>.

use num_bigint::BigUint;
use num_traits::{One, Zero};
use sha3::{Digest, Keccak256, Keccak512};

/// One sealed proof-of-work attempt, checked against a difficulty target.
/// The share and block checks differ only in `difficulty`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofOfWork {
    pub height: u64,
    pub hash_no_nonce: [u8; 32],
    pub difficulty: BigUint,
    pub nonce: u64,
    pub mix_digest: [u8; 32],
}

/// Deterministic seal check. `verify` at difficulty D implies `verify` at
/// any D' <= D for the same (height, hash, nonce, mix); the share processor
/// relies on that monotonicity for its two-tier test.
pub trait PowVerifier: Send + Sync {
    fn verify(&self, pow: &ProofOfWork) -> bool;
}

/// Hashimoto seal check: seed = keccak512(header_hash || nonce_le),
/// result = keccak256(seed || mix_digest), valid iff result <= 2^256 / difficulty.
#[derive(Debug, Clone, Copy, Default)]
pub struct EthashSeal;

impl PowVerifier for EthashSeal {
    fn verify(&self, pow: &ProofOfWork) -> bool {
        if pow.difficulty.is_zero() {
            return false;
        }
        let target = pow256() / &pow.difficulty;

        let mut seed = Keccak512::new();
        seed.update(pow.hash_no_nonce);
        seed.update(pow.nonce.to_le_bytes());
        let seed = seed.finalize();

        let mut result = Keccak256::new();
        result.update(seed);
        result.update(pow.mix_digest);
        let result = result.finalize();

        BigUint::from_bytes_be(&result) <= target
    }
}

/// 2^256, the numerator of all difficulty-to-target conversions.
pub fn pow256() -> BigUint {
    BigUint::one() << 256u32
}

/// Target hex for a fixed share difficulty, as handed to miners in the
/// third getWork element.
pub fn target_hex(difficulty: u64) -> String {
    if difficulty == 0 {
        return "0x0".to_string();
    }
    format!(
        "0x{}",
        (pow256() / BigUint::from(difficulty)).to_str_radix(16)
    )
}
