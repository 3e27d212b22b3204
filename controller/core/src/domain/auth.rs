// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-server authentication keys
//!
//! Every managed server gets a fresh random key when its state machine is
//! created. The process controller hands it to the child, and the child
//! presents it when opening its management back-channel.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand_core::{OsRng, RngCore};
use std::fmt;
use subtle::ConstantTimeEq;

pub const AUTH_KEY_LEN: usize = 16;

#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey([u8; AUTH_KEY_LEN]);

impl AuthKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; AUTH_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; AUTH_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Option<Self> {
        let decoded = STANDARD.decode(encoded).ok()?;
        let bytes: [u8; AUTH_KEY_LEN] = decoded.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Constant-time comparison against a presented key.
    pub fn verify(&self, presented: &[u8]) -> bool {
        presented.len() == AUTH_KEY_LEN && bool::from(self.0.ct_eq(presented))
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(****)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(AuthKey::generate(), AuthKey::generate());
    }

    #[test]
    fn test_verify() {
        let key = AuthKey::from_bytes([7u8; AUTH_KEY_LEN]);
        assert!(key.verify(&[7u8; AUTH_KEY_LEN]));
        assert!(!key.verify(&[8u8; AUTH_KEY_LEN]));
        assert!(!key.verify(&[7u8; 4]));
    }

    #[test]
    fn test_base64() {
        let key = AuthKey::generate();
        let decoded = AuthKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(decoded, key);
        assert!(AuthKey::from_base64("c2hvcnQ=").is_none());
    }

    #[test]
    fn test_debug_hides_bytes() {
        let key = AuthKey::from_bytes([1u8; AUTH_KEY_LEN]);
        assert_eq!(format!("{key:?}"), "AuthKey(****)");
    }
}
