//! SHA-256 handshake: `digest = sha256(secret_key || ascii_decimal(t))`
//! where `t` is the current time rounded down to a 10-second boundary.
//! Verification rounds the peer's timestamp, recomputes the digest, and
//! constant-time compares against a tolerance window of candidates.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::Handshake;
use crate::error::{CatsError, Result};

pub const DIGEST_LEN: usize = 32;
const TIME_STEP_SECS: u64 = 10;

/// Time-bounded SHA-256 handshake. `valid_window` bounds how many 10-second
/// steps in either direction the responder will try before rejecting.
pub struct Sha256Handshake {
    secret_key: Vec<u8>,
    valid_window: u32,
}

impl Sha256Handshake {
    pub fn new(secret_key: impl Into<Vec<u8>>, valid_window: u32) -> Self {
        Self { secret_key: secret_key.into(), valid_window }
    }

    fn digest_at(&self, t_seconds_floor: u64) -> [u8; DIGEST_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret_key);
        hasher.update(t_seconds_floor.to_string().as_bytes());
        hasher.finalize().into()
    }

    fn now_floored() -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs();
        floor_to_step(now)
    }
}

fn floor_to_step(t: u64) -> u64 {
    (t / TIME_STEP_SECS) * TIME_STEP_SECS
}

impl Handshake for Sha256Handshake {
    fn payload_len(&self) -> usize {
        DIGEST_LEN
    }

    fn sign(&self) -> Vec<u8> {
        self.digest_at(Self::now_floored()).to_vec()
    }

    fn verify(&self, received: &[u8]) -> Result<()> {
        if received.len() != DIGEST_LEN {
            return Err(CatsError::handshake(format!(
                "expected {DIGEST_LEN}-byte digest, got {}",
                received.len()
            )));
        }

        let base = Self::now_floored();
        for step in 0..=self.valid_window as u64 {
            for candidate in [base.saturating_sub(step * TIME_STEP_SECS), base + step * TIME_STEP_SECS] {
                let expected = self.digest_at(candidate);
                if received.ct_eq(&expected).unwrap_u8() == 1 {
                    return Ok(());
                }
            }
        }

        Err(CatsError::handshake("signature mismatch or timestamp outside tolerance window"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_succeeds_with_same_key() {
        let hs = Sha256Handshake::new("secret", 3);
        let sig = hs.sign();
        assert!(hs.verify(&sig).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let signer = Sha256Handshake::new("secret-a", 3);
        let verifier = Sha256Handshake::new("secret-b", 3);
        let sig = signer.sign();
        assert!(verifier.verify(&sig).is_err());
    }

    #[test]
    fn digest_at_old_timestamp_outside_window_is_rejected() {
        let hs = Sha256Handshake::new("secret", 1);
        let old = Sha256Handshake::new("secret", 1).digest_at(0);
        assert!(hs.verify(&old).is_err());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let hs = Sha256Handshake::new("secret", 1);
        assert!(hs.verify(&[0u8; 10]).is_err());
    }
}
