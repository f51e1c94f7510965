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

//! Syntactic checks on miner-submitted identifiers. All patterns are
//! fixed-width, so they are checked byte-wise.

/// Payout address: `M`, one of `[A-Z0-9]`, then 32 alphanumerics.
pub fn is_valid_address(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 34
        && bytes[0] == b'M'
        && (bytes[1].is_ascii_uppercase() || bytes[1].is_ascii_digit())
        && bytes[2..].iter().all(|b| b.is_ascii_alphanumeric())
}

/// Nonce: `0x` followed by exactly 16 lowercase hex digits.
pub fn is_valid_nonce(s: &str) -> bool {
    is_prefixed_lower_hex(s, 16)
}

/// Hash: `0x` followed by exactly 64 lowercase hex digits.
pub fn is_valid_hash(s: &str) -> bool {
    is_prefixed_lower_hex(s, 64)
}

/// Worker id: 1 to 8 characters from `[0-9a-zA-Z_-]`. Submissions with an
/// invalid worker id are not rejected; the handler substitutes "0".
pub fn is_valid_worker_id(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 8
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
}

fn is_prefixed_lower_hex(s: &str, digits: usize) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == digits + 2
        && bytes[0] == b'0'
        && bytes[1] == b'x'
        && bytes[2..]
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
}
