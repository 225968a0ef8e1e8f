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

use ruma::serde::Base64;
use vodozemac::{pk_encryption::PkEncryption, Curve25519PublicKey};
use zeroize::Zeroizing;

use crate::{
    store::RoomKeyForBackup,
    types::{
        BackedUpRoomKey, EncryptedSessionData, KeyBackupData, MegolmV1AuthData,
        RoomKeyBackupInfo, Signatures, MEGOLM_BACKUP_V1,
    },
};

/// The public part of a backup key.
#[derive(Clone)]
pub struct MegolmV1BackupKey {
    key: Curve25519PublicKey,
    version: Option<String>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for MegolmV1BackupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MegolmV1BackupKey")
            .field("key", &self.to_base64())
            .field("version", &self.version)
            .finish()
    }
}

impl MegolmV1BackupKey {
    pub(crate) fn new(key: Curve25519PublicKey, version: Option<String>) -> Self {
        Self { key, version }
    }

    /// Create a backup key for the public key found in the auth data of a
    /// backup version.
    pub fn from_auth_data(auth_data: &MegolmV1AuthData, version: Option<String>) -> Self {
        Self::new(auth_data.public_key, version)
    }

    /// Get the full name of the backup algorithm this backup key supports.
    pub fn backup_algorithm(&self) -> &str {
        MEGOLM_BACKUP_V1
    }

    /// Get the public key as a base64 encoded string.
    pub fn to_base64(&self) -> String {
        self.key.to_base64()
    }

    /// The Curve25519 public key of the backup.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.key
    }

    /// The backup version this key is used with, if any.
    pub fn backup_version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Copy of this key that is bound to the given backup version.
    pub fn with_version(&self, version: String) -> Self {
        Self { key: self.key, version: Some(version) }
    }

    /// Unsigned backup info describing this key.
    pub fn backup_info(&self) -> RoomKeyBackupInfo {
        RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(MegolmV1AuthData::new(
            self.key,
            Signatures::new(),
        ))
    }

    /// Encrypt a room key so it can be uploaded to the backup.
    pub fn encrypt(&self, room_key: &RoomKeyForBackup) -> Result<KeyBackupData, serde_json::Error> {
        let key = BackedUpRoomKey::from(&room_key.room_key);
        let plaintext = Zeroizing::new(serde_json::to_vec(&key)?);

        let message = PkEncryption::from_key(self.key).encrypt(&plaintext);

        let session_data = EncryptedSessionData {
            ephemeral: Base64::new(message.ephemeral_key.to_vec()),
            ciphertext: Base64::new(message.ciphertext),
            mac: Base64::new(message.mac),
        };

        Ok(KeyBackupData {
            first_message_index: room_key.first_known_index,
            forwarded_count: room_key.forwarded_count,
            is_verified: room_key.is_verified,
            session_data,
        })
    }
}
