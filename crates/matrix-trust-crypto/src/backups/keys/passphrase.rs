// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Derivation of a recovery key from a user chosen passphrase.
//!
//! The key is derived with PBKDF2-HMAC-SHA512, the salt and iteration count
//! are published in the auth data of the backup version so other devices can
//! repeat the derivation.

use std::ops::ControlFlow;

use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sha2::Sha512;
use thiserror::Error;
use zeroize::Zeroize;

use super::RecoveryKey;

type HmacSha512 = Hmac<Sha512>;

/// The number of PBKDF2 rounds used when the caller doesn't pick one.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 500_000;

const SALT_LENGTH: usize = 32;
const OUTPUT_LENGTH: usize = 32;

/// The passphrase couldn't be used as a HMAC key.
#[derive(Debug, Error)]
#[error("the passphrase can't be used to derive a key")]
pub struct InvalidPassphrase;

/// Generate a random salt for the passphrase derivation.
///
/// The salt consists of 32 alphanumeric characters.
pub fn generate_salt() -> String {
    thread_rng().sample_iter(Alphanumeric).take(SALT_LENGTH).map(char::from).collect()
}

/// Run PBKDF2-HMAC-SHA512 producing a single 32 byte block.
///
/// `progress` is called with the number of completed rounds and the total
/// whenever the completed percentage changes, the last call reports
/// `(iterations, iterations)`. Returning [`ControlFlow::Break`] from it stops
/// the derivation and `None` is returned.
fn pbkdf2_sha512(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
    mut progress: impl FnMut(u32, u32) -> ControlFlow<()>,
) -> Result<Option<[u8; OUTPUT_LENGTH]>, InvalidPassphrase> {
    let iterations = iterations.max(1);
    let prf = HmacSha512::new_from_slice(passphrase).map_err(|_| InvalidPassphrase)?;

    let mut mac = prf.clone();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut block = mac.finalize().into_bytes();

    let mut result = [0u8; OUTPUT_LENGTH];
    result.copy_from_slice(&block[..OUTPUT_LENGTH]);

    let mut last_percent = 0;

    for round in 1..iterations {
        let mut mac = prf.clone();
        mac.update(&block);
        block = mac.finalize().into_bytes();

        for (out, byte) in result.iter_mut().zip(block.iter()) {
            *out ^= byte;
        }

        let percent = u64::from(round) * 100 / u64::from(iterations);

        if percent != last_percent {
            last_percent = percent;

            if progress(round, iterations).is_break() {
                block.as_mut_slice().zeroize();
                result.zeroize();

                return Ok(None);
            }
        }
    }

    block.as_mut_slice().zeroize();

    if progress(iterations, iterations).is_break() {
        result.zeroize();
        return Ok(None);
    }

    Ok(Some(result))
}

impl RecoveryKey {
    /// Derive a recovery key from a passphrase.
    ///
    /// # Arguments
    ///
    /// * `passphrase` - The passphrase the user picked.
    ///
    /// * `salt` - The salt, usually the one found in the auth data of the
    /// backup.
    ///
    /// * `iterations` - The number of PBKDF2 rounds.
    ///
    /// * `progress` - Called with `(done, total)` as the derivation advances.
    pub fn from_passphrase(
        passphrase: &str,
        salt: &str,
        iterations: u32,
        mut progress: impl FnMut(u32, u32),
    ) -> Result<Self, InvalidPassphrase> {
        let report = |done, total| {
            progress(done, total);
            ControlFlow::Continue(())
        };

        Self::from_passphrase_until(passphrase, salt, iterations, report)?.ok_or(InvalidPassphrase)
    }

    /// Derive a recovery key from a passphrase, the derivation can be stopped
    /// by returning [`ControlFlow::Break`] from `progress`.
    ///
    /// Returns `None` if the derivation was stopped.
    pub(crate) fn from_passphrase_until(
        passphrase: &str,
        salt: &str,
        iterations: u32,
        progress: impl FnMut(u32, u32) -> ControlFlow<()>,
    ) -> Result<Option<Self>, InvalidPassphrase> {
        let Some(mut key) =
            pbkdf2_sha512(passphrase.as_bytes(), salt.as_bytes(), iterations, progress)?
        else {
            return Ok(None);
        };

        let recovery_key = Self::from_bytes(&key);
        key.zeroize();

        Ok(Some(recovery_key))
    }

    /// Derive a recovery key from a passphrase using a freshly generated salt.
    ///
    /// Returns the key together with the salt and iteration count that need
    /// to be published alongside the backup.
    pub fn new_from_passphrase(
        passphrase: &str,
        iterations: u32,
        progress: impl FnMut(u32, u32),
    ) -> Result<(Self, String, u32), InvalidPassphrase> {
        let salt = generate_salt();
        let iterations = iterations.max(1);
        let key = Self::from_passphrase(passphrase, &salt, iterations, progress)?;

        Ok((key, salt, iterations))
    }
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;

    use hmac::Hmac;
    use sha2::Sha512;

    use super::{generate_salt, pbkdf2_sha512};
    use crate::backups::RecoveryKey;

    #[test]
    fn matches_the_reference_implementation() {
        for iterations in [1, 2, 1000] {
            let mut expected = [0u8; 32];
            pbkdf2::pbkdf2::<Hmac<Sha512>>(b"password", b"salt", iterations, &mut expected)
                .unwrap();

            let derived =
                pbkdf2_sha512(b"password", b"salt", iterations, |_, _| ControlFlow::Continue(()))
                    .unwrap();
            assert_eq!(derived, Some(expected));
        }
    }

    #[test]
    fn progress_is_reported() {
        let mut reports = Vec::new();
        pbkdf2_sha512(b"password", b"salt", 1000, |done, total| {
            reports.push((done, total));
            ControlFlow::Continue(())
        })
        .unwrap();

        assert_eq!(reports.last(), Some(&(1000, 1000)));
        assert!(reports.len() <= 101);
        assert!(reports.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn zero_iterations_are_clamped() {
        let zero = pbkdf2_sha512(b"password", b"salt", 0, |_, _| ControlFlow::Continue(()));
        let one = pbkdf2_sha512(b"password", b"salt", 1, |_, _| ControlFlow::Continue(()));

        assert_eq!(zero.unwrap(), one.unwrap());
    }

    #[test]
    fn derivation_can_be_stopped() {
        let mut reports = 0;
        let derived = pbkdf2_sha512(b"password", b"salt", 1000, |_, _| {
            reports += 1;

            if reports == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();

        assert_eq!(derived, None);
        assert_eq!(reports, 3);

        let stopped = RecoveryKey::from_passphrase_until("password", "salt", 1000, |_, _| {
            ControlFlow::Break(())
        })
        .unwrap();
        assert!(stopped.is_none());
    }

    #[test]
    fn salt_is_alphanumeric() {
        let salt = generate_salt();

        assert_eq!(salt.len(), 32);
        assert!(salt.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(salt, generate_salt());
    }

    #[test]
    fn same_passphrase_same_key() {
        let (key, salt, iterations) =
            RecoveryKey::new_from_passphrase("correct horse", 10, |_, _| ()).unwrap();
        let derived = RecoveryKey::from_passphrase("correct horse", &salt, iterations, |_, _| ())
            .unwrap();
        let other = RecoveryKey::from_passphrase("wrong horse", &salt, iterations, |_, _| ())
            .unwrap();

        assert_eq!(key.to_base58(), derived.to_base58());
        assert_ne!(key.to_base58(), other.to_base58());
    }
}
