//! Seed/key security access.
//!
//! The controller hands out a 4-byte seed; the tester answers with a 4-byte
//! key derived by one of four known algorithms. Which algorithm a given
//! controller expects is not discoverable up front, so the client supports a
//! try-all policy over a configured order, requesting a fresh seed after
//! every rejected key.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::client::{DiagClient, DiagError, SessionState};
use super::constants::{Nrc, SID_SECURITY_ACCESS};
use crate::transport::CanTransport;

/// Consecutive key failures before honouring the controller's lockout timer.
const FAILURES_BEFORE_BACKOFF: u32 = 3;

/// One seed-to-key derivation behind the common `u32 -> u32` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeedKeyAlgorithm {
    /// Published 16-bit XOR/ADD derivation, widened to the 4-byte wire form.
    Rftx,
    /// `MH` XOR with cross-folded low bytes.
    LegacyA,
    /// Byte-pair swap, then the repeating `MH` pattern.
    LegacyB,
    /// The repeating `BM` pattern.
    LegacyC,
}

impl SeedKeyAlgorithm {
    pub fn compute(self, seed: u32) -> u32 {
        let s = seed.to_be_bytes();
        match self {
            SeedKeyAlgorithm::Rftx => {
                let hi = (seed >> 16) as u16;
                ((hi ^ 0x5A3C).wrapping_add(0x7F1B)) as u32
            }
            SeedKeyAlgorithm::LegacyA => {
                u32::from_be_bytes([s[0] ^ 0x48, s[1] ^ 0x4D, s[2] ^ s[0], s[3] ^ s[1]])
            }
            SeedKeyAlgorithm::LegacyB => {
                u32::from_be_bytes([s[1] ^ 0x4D, s[0] ^ 0x48, s[3] ^ 0x4D, s[2] ^ 0x48])
            }
            SeedKeyAlgorithm::LegacyC => {
                u32::from_be_bytes([s[0] ^ 0x42, s[1] ^ 0x4D, s[2] ^ 0x42, s[3] ^ 0x4D])
            }
        }
    }
}

impl std::fmt::Display for SeedKeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeedKeyAlgorithm::Rftx => write!(f, "rftx"),
            SeedKeyAlgorithm::LegacyA => write!(f, "legacy-a"),
            SeedKeyAlgorithm::LegacyB => write!(f, "legacy-b"),
            SeedKeyAlgorithm::LegacyC => write!(f, "legacy-c"),
        }
    }
}

/// Default try order: the proven published algorithm first, the legacy trio
/// as fallbacks.
pub fn default_algorithm_order() -> Vec<SeedKeyAlgorithm> {
    vec![
        SeedKeyAlgorithm::Rftx,
        SeedKeyAlgorithm::LegacyA,
        SeedKeyAlgorithm::LegacyB,
        SeedKeyAlgorithm::LegacyC,
    ]
}

/// Unlock policy: algorithm order is configuration, not hard-coded.
#[derive(Debug, Clone)]
pub struct UnlockPolicy {
    /// Odd request-seed sub-function; the key reply uses `level + 1`.
    pub access_level: u8,
    pub order: Vec<SeedKeyAlgorithm>,
    /// Backoff honouring the controller's lockout timer.
    pub lockout_backoff: Duration,
}

impl Default for UnlockPolicy {
    fn default() -> Self {
        Self {
            access_level: 0x01,
            order: default_algorithm_order(),
            lockout_backoff: Duration::from_secs(10),
        }
    }
}

/// Outcome of a successful unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unlock {
    /// The controller handed out a zero seed: write access was already open.
    AlreadyUnlocked,
    /// Unlocked with this algorithm; cache it for the session.
    With(SeedKeyAlgorithm),
}

/// Seed/key material never reaches the logs in full.
fn mask(word: u32) -> String {
    format!("{:02X}******", (word >> 24) as u8)
}

impl<T: CanTransport> DiagClient<T> {
    fn request_seed(&mut self, level: u8) -> Result<u32, DiagError> {
        let data = self.request(SID_SECURITY_ACCESS, &[level])?;
        // Positive reply echoes the level, then the 4-byte seed.
        if data.len() < 5 || data[0] != level {
            return Err(DiagError::UnexpectedReply {
                service: SID_SECURITY_ACCESS,
            });
        }
        Ok(u32::from_be_bytes([data[1], data[2], data[3], data[4]]))
    }

    fn send_key(&mut self, level: u8, key: u32) -> Result<(), DiagError> {
        let mut payload = [0u8; 5];
        payload[0] = level + 1;
        payload[1..5].copy_from_slice(&key.to_be_bytes());
        self.request(SID_SECURITY_ACCESS, &payload)?;
        Ok(())
    }

    /// Run the try-all seed/key unlock. On success the session state moves
    /// to `Unlocked` and the winning algorithm is returned for caching.
    pub fn security_unlock(&mut self, policy: &UnlockPolicy) -> Result<Unlock, DiagError> {
        let mut seed = self.request_seed(policy.access_level)?;
        if seed == 0 {
            info!("zero seed: controller already unlocked");
            self.set_state(SessionState::Unlocked);
            return Ok(Unlock::AlreadyUnlocked);
        }
        debug!(seed = %mask(seed), "seed received");

        let mut failures = 0u32;
        for &algorithm in &policy.order {
            let key = algorithm.compute(seed);
            debug!(%algorithm, key = %mask(key), "trying key");

            match self.send_key(policy.access_level, key) {
                Ok(()) => {
                    info!(%algorithm, "controller unlocked");
                    self.set_state(SessionState::Unlocked);
                    return Ok(Unlock::With(algorithm));
                }
                Err(DiagError::Negative { nrc, .. }) if nrc == Nrc::INVALID_KEY => {
                    failures += 1;
                    warn!(%algorithm, failures, "key rejected");
                    if failures.is_multiple_of(FAILURES_BEFORE_BACKOFF) {
                        debug!(backoff = ?policy.lockout_backoff, "honouring lockout timer");
                        thread::sleep(policy.lockout_backoff);
                    }
                    // A rejected key invalidates the seed; fetch a fresh one.
                    seed = self.request_seed(policy.access_level)?;
                    if seed == 0 {
                        self.set_state(SessionState::Unlocked);
                        return Ok(Unlock::AlreadyUnlocked);
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(DiagError::SecurityDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isotp::{IsoTpConfig, IsoTpSession};
    use crate::transport::MockTransport;
    use crate::uds::client::DiagTiming;

    fn client_with(
        handler: crate::transport::ServiceHandler,
    ) -> (MockTransport, DiagClient<MockTransport>) {
        let mock = MockTransport::new(0x613);
        mock.on_request(handler);
        let isotp = IsoTpSession::new(mock.clone(), IsoTpConfig::default());
        (mock, DiagClient::new(isotp, DiagTiming::default()))
    }

    #[test]
    fn algorithm_vectors() {
        // RFTX consumes the upper 16 bits: (0x1234 ^ 0x5A3C) + 0x7F1B.
        assert_eq!(SeedKeyAlgorithm::Rftx.compute(0x1234_0000), 0x0000_C723);
        assert_eq!(
            SeedKeyAlgorithm::LegacyA.compute(0x1122_3344),
            u32::from_be_bytes([0x11 ^ 0x48, 0x22 ^ 0x4D, 0x33 ^ 0x11, 0x44 ^ 0x22])
        );
        assert_eq!(
            SeedKeyAlgorithm::LegacyB.compute(0x1122_3344),
            u32::from_be_bytes([0x22 ^ 0x4D, 0x11 ^ 0x48, 0x44 ^ 0x4D, 0x33 ^ 0x48])
        );
        assert_eq!(
            SeedKeyAlgorithm::LegacyC.compute(0x1122_3344),
            u32::from_be_bytes([0x11 ^ 0x42, 0x22 ^ 0x4D, 0x33 ^ 0x42, 0x44 ^ 0x4D])
        );
    }

    #[test]
    fn second_algorithm_wins_after_invalid_key() {
        // Scenario: the controller rejects the first algorithm's key with
        // NRC 0x35 and accepts the second after one extra seed round trip.
        let seed: u32 = 0xA1B2_C3D4;
        let accepted = SeedKeyAlgorithm::LegacyA.compute(seed);
        let (mock, mut client) = client_with(Box::new(move |req| {
            match req {
                [0x27, 0x01] => vec![[0x67, 0x01].iter().copied().chain(seed.to_be_bytes()).collect()],
                [0x27, 0x02, k @ ..] => {
                    if k == accepted.to_be_bytes() {
                        vec![vec![0x67, 0x02]]
                    } else {
                        vec![vec![0x7F, 0x27, 0x35]]
                    }
                }
                _ => vec![vec![0x7F, req[0], 0x11]],
            }
        }));

        let policy = UnlockPolicy {
            order: vec![SeedKeyAlgorithm::Rftx, SeedKeyAlgorithm::LegacyA],
            lockout_backoff: Duration::from_millis(1),
            ..UnlockPolicy::default()
        };
        let unlock = client.security_unlock(&policy).unwrap();
        assert_eq!(unlock, Unlock::With(SeedKeyAlgorithm::LegacyA));
        assert_eq!(client.state(), SessionState::Unlocked);
        // seed, key (rejected), fresh seed, key (accepted)
        assert_eq!(mock.requests().len(), 4);
    }

    #[test]
    fn zero_seed_short_circuits() {
        let (mock, mut client) = client_with(Box::new(|req| {
            assert_eq!(req, &[0x27, 0x01]);
            vec![vec![0x67, 0x01, 0x00, 0x00, 0x00, 0x00]]
        }));
        let unlock = client.security_unlock(&UnlockPolicy::default()).unwrap();
        assert_eq!(unlock, Unlock::AlreadyUnlocked);
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn all_algorithms_rejected_is_denied() {
        let (_mock, mut client) = client_with(Box::new(|req| match req {
            [0x27, 0x01] => vec![vec![0x67, 0x01, 0xDE, 0xAD, 0xBE, 0xEF]],
            _ => vec![vec![0x7F, 0x27, 0x35]],
        }));
        let policy = UnlockPolicy {
            lockout_backoff: Duration::from_millis(1),
            ..UnlockPolicy::default()
        };
        let err = client.security_unlock(&policy).unwrap_err();
        assert!(matches!(err, DiagError::SecurityDenied));
    }

    #[test]
    fn masking_hides_key_material() {
        assert_eq!(mask(0xDEADBEEF), "DE******");
    }
}
