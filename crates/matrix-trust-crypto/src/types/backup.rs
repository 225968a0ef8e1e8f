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

use std::collections::BTreeMap;

use ruma::{serde::Base64, OwnedRoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;

use super::{deserialize_curve_key, serialize_curve_key, Signatures};

/// The name of the only backup algorithm we support.
pub const MEGOLM_BACKUP_V1: &str = "m.megolm_backup.v1.curve25519-aes-sha2";

/// Auth data for the `m.megolm_backup.v1.curve25519-aes-sha2` backup algorithm.
///
/// The salt and iteration count are only present if the backup key was
/// derived from a passphrase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1AuthData {
    /// The Curve25519 public key used to encrypt the backups.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub public_key: Curve25519PublicKey,
    /// The salt that was used to derive the backup key from a passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_salt: Option<String>,
    /// The number of PBKDF2 rounds that were used to derive the backup key
    /// from a passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_iterations: Option<u32>,
    /// *Optional.* Signatures of the auth_data, as Signed JSON.
    #[serde(default)]
    pub signatures: Signatures,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl MegolmV1AuthData {
    /// Create a new [`MegolmV1AuthData`] from a public Curve25519 key and a
    /// [`Signatures`] map.
    pub fn new(public_key: Curve25519PublicKey, signatures: Signatures) -> Self {
        Self {
            public_key,
            private_key_salt: None,
            private_key_iterations: None,
            signatures,
            extra: Default::default(),
        }
    }

    /// Attach the passphrase derivation parameters to the auth data.
    pub fn with_passphrase_info(mut self, salt: String, iterations: u32) -> Self {
        self.private_key_salt = Some(salt);
        self.private_key_iterations = Some(iterations);
        self
    }

    /// Get the salt and the iteration count, if the backup key was derived
    /// from a passphrase.
    pub fn passphrase_info(&self) -> Option<(&str, u32)> {
        Some((self.private_key_salt.as_deref()?, self.private_key_iterations?))
    }
}

/// Information pertaining to a room key backup.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "BackupInfoHelper")]
pub enum RoomKeyBackupInfo {
    /// The `m.megolm_backup.v1.curve25519-aes-sha2` variant of a backup.
    MegolmBackupV1Curve25519AesSha2(MegolmV1AuthData),
    /// Any other unknown backup variant.
    Other {
        /// The algorithm of the unknown backup variant.
        algorithm: String,
        /// The auth data of the unknown backup variant.
        auth_data: BTreeMap<String, Value>,
    },
}

impl RoomKeyBackupInfo {
    /// The name of the backup algorithm.
    pub fn algorithm(&self) -> &str {
        match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(_) => MEGOLM_BACKUP_V1,
            RoomKeyBackupInfo::Other { algorithm, .. } => algorithm,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BackupInfoHelper {
    algorithm: String,
    auth_data: Value,
}

impl TryFrom<BackupInfoHelper> for RoomKeyBackupInfo {
    type Error = serde_json::Error;

    fn try_from(value: BackupInfoHelper) -> Result<Self, Self::Error> {
        Ok(match value.algorithm.as_str() {
            MEGOLM_BACKUP_V1 => {
                let data: MegolmV1AuthData = serde_json::from_value(value.auth_data)?;
                RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data)
            }
            _ => RoomKeyBackupInfo::Other {
                algorithm: value.algorithm,
                auth_data: serde_json::from_value(value.auth_data)?,
            },
        })
    }
}

impl Serialize for RoomKeyBackupInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let helper = match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(d) => BackupInfoHelper {
                algorithm: MEGOLM_BACKUP_V1.to_owned(),
                auth_data: serde_json::to_value(d).map_err(serde::ser::Error::custom)?,
            },
            RoomKeyBackupInfo::Other { algorithm, auth_data } => BackupInfoHelper {
                algorithm: algorithm.to_owned(),
                auth_data: serde_json::to_value(auth_data).map_err(serde::ser::Error::custom)?,
            },
        };

        helper.serialize(serializer)
    }
}

/// A backup version as the server describes it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupVersion {
    /// The backup version identifier.
    pub version: String,
    /// The algorithm and auth data of the backup.
    #[serde(flatten)]
    pub info: RoomKeyBackupInfo,
    /// The number of keys stored in the backup.
    #[serde(default)]
    pub count: u64,
    /// An opaque string representing the stored keys in the backup.
    #[serde(default)]
    pub etag: String,
}

impl BackupVersion {
    /// Get the Megolm v1 auth data of this backup, if it uses that algorithm.
    pub fn megolm_v1_auth_data(&self) -> Option<&MegolmV1AuthData> {
        as_variant::as_variant!(&self.info, RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2)
    }
}

/// The encrypted algorithm-dependent data of a backed up room key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// Unpadded base64-encoded public half of the ephemeral key.
    pub ephemeral: Base64,
    /// Ciphertext, encrypted using AES-CBC-256 with PKCS#7 padding.
    pub ciphertext: Base64,
    /// First 8 bytes of MAC key, encoded in base64.
    pub mac: Base64,
}

/// A single backed up room key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The index of the first message in the session that the key can decrypt.
    pub first_message_index: u32,
    /// The number of times this key has been forwarded via key-sharing
    /// between devices.
    pub forwarded_count: u32,
    /// Whether the device backing up the key verified the device that the key
    /// is from.
    pub is_verified: bool,
    /// Encrypted data about the session.
    pub session_data: EncryptedSessionData,
}

/// The backed up keys of a single room, keyed by session id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyBackup {
    /// The backed up sessions.
    pub sessions: BTreeMap<String, KeyBackupData>,
}

/// Backed up room keys of many rooms, as uploaded to and downloaded from the
/// server.
pub type RoomKeyBackups = BTreeMap<OwnedRoomId, RoomKeyBackup>;
