//! Pluggable post-statement handshake. Ships a time-bounded SHA-256 scheme
//! as the default, a digest exchanged directly over the wire rather than
//! carried in a header.

mod sha256;

pub use sha256::Sha256Handshake;

use crate::error::Result;

/// A pluggable handshake verifier. The initiator computes [`Handshake::sign`]
/// and writes it to the wire; the responder calls [`Handshake::verify`] on
/// the received bytes.
pub trait Handshake: Send + Sync {
    /// Raw byte length of the handshake payload written to the wire.
    fn payload_len(&self) -> usize;

    /// Compute the initiator's handshake bytes for the current time.
    fn sign(&self) -> Vec<u8>;

    /// Verify handshake bytes received from a peer.
    fn verify(&self, received: &[u8]) -> Result<()>;
}

/// No-op handshake used when the connection is configured without
/// authentication; `STATEMENT_EXCHANGE` proceeds directly to `RUNNING`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandshake;

impl Handshake for NoHandshake {
    fn payload_len(&self) -> usize {
        0
    }

    fn sign(&self) -> Vec<u8> {
        Vec::new()
    }

    fn verify(&self, _received: &[u8]) -> Result<()> {
        Ok(())
    }
}
