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

use rand::{thread_rng, RngCore};
use thiserror::Error;
use vodozemac::{
    pk_encryption::{Message, PkDecryption},
    Curve25519SecretKey,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::MegolmV1BackupKey;
use crate::types::{BackedUpRoomKey, EncryptedSessionData};

/// Error type for the decoding of a [`RecoveryKey`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded recovery key has an invalid prefix.
    #[error("The decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte of the recovery key didn't match.
    #[error("The parity byte of the recovery key doesn't match, the XOR of all bytes is {0:#x}")]
    Parity(u8),
    /// The recovery key has an invalid length.
    #[error("The decoded recovery key has a invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The recovery key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
    /// The recovery key isn't valid base64.
    #[error("The recovery key isn't valid base64")]
    Base64,
}

/// Error type for the decryption of a backed up room key.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// The encrypted session data couldn't be decoded.
    #[error(transparent)]
    Decoding(#[from] vodozemac::pk_encryption::MessageDecodeError),
    /// The session data couldn't be decrypted, most likely the wrong key was
    /// used.
    #[error(transparent)]
    Decryption(#[from] vodozemac::pk_encryption::Error),
    /// The decrypted room key isn't valid JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The private part of a backup key, presented to users as a recovery key.
///
/// The textual form is the Base58 encoding of a two byte prefix, the 32 byte
/// Curve25519 private key and a parity byte.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey {
    key: Box<[u8; RecoveryKey::KEY_SIZE]>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryKey").finish_non_exhaustive()
    }
}

impl TryFrom<String> for RecoveryKey {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_base58(&value)
    }
}

impl std::fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = Zeroizing::new(self.to_base58());

        let string = Zeroizing::new(
            string
                .chars()
                .collect::<Vec<char>>()
                .chunks(Self::DISPLAY_CHUNK_SIZE)
                .map(|c| c.iter().collect::<String>())
                .collect::<Vec<_>>()
                .join(" "),
        );

        write!(f, "{}", string.as_str())
    }
}

impl RecoveryKey {
    const KEY_SIZE: usize = 32;
    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const ENCODED_SIZE: usize = Self::PREFIX.len() + Self::KEY_SIZE + 1;
    const DISPLAY_CHUNK_SIZE: usize = 4;

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }

    /// Create a new random recovery key.
    pub fn new() -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        thread_rng().fill_bytes(key.as_mut_slice());

        Self { key }
    }

    /// Create a recovery key from raw bytes.
    pub fn from_bytes(key: &[u8; Self::KEY_SIZE]) -> Self {
        Self { key: Box::new(*key) }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; Self::KEY_SIZE] {
        &self.key
    }

    /// Try to create a recovery key from a base64 export of the key.
    pub fn from_base64(key: &str) -> Result<Self, DecodeError> {
        let decoded =
            Zeroizing::new(vodozemac::base64_decode(key).map_err(|_| DecodeError::Base64)?);

        if decoded.len() != Self::KEY_SIZE {
            Err(DecodeError::Length(Self::KEY_SIZE, decoded.len()))
        } else {
            let mut key = Box::new([0u8; Self::KEY_SIZE]);
            key.copy_from_slice(&decoded);

            Ok(Self { key })
        }
    }

    /// Export the recovery key as unpadded base64.
    pub fn to_base64(&self) -> String {
        vodozemac::base64_encode(self.key.as_slice())
    }

    /// Try to decode the textual form of a recovery key.
    ///
    /// Whitespace is ignored. The decoded buffer must be exactly 35 bytes
    /// long, start with the recovery key prefix and the XOR of all its bytes
    /// must be zero.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        // Remove any whitespace we might have
        let value: String = value.chars().filter(|c| !c.is_whitespace()).collect();

        let decoded = Zeroizing::new(
            bs58::decode(value).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?,
        );

        if decoded.len() != Self::ENCODED_SIZE {
            return Err(DecodeError::Length(Self::ENCODED_SIZE, decoded.len()));
        }

        let prefix = [decoded[0], decoded[1]];
        let parity = decoded.iter().fold(0u8, |acc, x| acc ^ x);

        if prefix != Self::PREFIX {
            Err(DecodeError::Prefix(Self::PREFIX, prefix))
        } else if parity != 0 {
            Err(DecodeError::Parity(parity))
        } else {
            let mut key = Box::new([0u8; Self::KEY_SIZE]);
            key.copy_from_slice(&decoded[Self::PREFIX.len()..Self::PREFIX.len() + Self::KEY_SIZE]);

            Ok(Self { key })
        }
    }

    /// Encode the recovery key in its textual form.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_ref(),
                self.key.as_ref(),
                [Self::parity_byte(self.key.as_ref())].as_ref(),
            ]
            .concat(),
        );

        bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string()
    }

    /// Check if the given string is a valid recovery key.
    pub fn is_valid(value: &str) -> bool {
        Self::from_base58(value).is_ok()
    }

    fn get_pk_decryption(&self) -> PkDecryption {
        let secret_key: Box<Curve25519SecretKey> =
            Curve25519SecretKey::from_slice(&self.key).into();
        PkDecryption::from_key(*secret_key)
    }

    /// Extract the megolm.v1 public key from this recovery key.
    pub fn megolm_v1_public_key(&self) -> MegolmV1BackupKey {
        MegolmV1BackupKey::new(self.get_pk_decryption().public_key(), None)
    }

    /// Decrypt the session data of a backed up room key.
    pub fn decrypt_session_data(
        &self,
        session_data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, DecryptionError> {
        let message = Message::from_base64(
            &session_data.ciphertext.encode(),
            &session_data.mac.encode(),
            &session_data.ephemeral.encode(),
        )?;

        let decrypted = Zeroizing::new(self.get_pk_decryption().decrypt(&message)?);

        Ok(serde_json::from_slice(&decrypted)?)
    }
}

impl Default for RecoveryKey {
    fn default() -> Self {
        Self::new()
    }
}
