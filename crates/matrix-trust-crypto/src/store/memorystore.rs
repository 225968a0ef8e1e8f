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

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::sync::RwLock;

use super::{
    BackupKeys, BackupStore, CryptoStoreError, Result, RoomKeyCounts, RoomKeyForBackup,
    RoomKeyImportResult, TrustStore,
};
use crate::{
    backups::RecoveryKey,
    identities::{CrossSigningKeys, DeviceKeys, LocalTrust},
    types::ExportedRoomKey,
};

#[derive(Debug)]
struct StoredRoomKey {
    room_key: RoomKeyForBackup,
    backed_up: bool,
}

#[derive(Debug, Default)]
struct StoredBackupKeys {
    recovery_key: Option<RecoveryKey>,
    backup_version: Option<String>,
}

/// An in-memory only store that will forget all the E2EE keys once it's
/// dropped.
#[derive(Debug)]
pub struct MemoryStore {
    own_user_id: OwnedUserId,
    devices: RwLock<HashMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>>>,
    cross_signing_keys: RwLock<HashMap<OwnedUserId, CrossSigningKeys>>,
    room_keys: RwLock<BTreeMap<(OwnedRoomId, String), StoredRoomKey>>,
    backup_keys: RwLock<StoredBackupKeys>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore` for the given user.
    pub fn new(own_user_id: &UserId) -> Self {
        Self {
            own_user_id: own_user_id.to_owned(),
            devices: Default::default(),
            cross_signing_keys: Default::default(),
            room_keys: Default::default(),
            backup_keys: Default::default(),
        }
    }

    /// Add or replace a device.
    pub async fn save_device(&self, device: DeviceKeys) {
        self.devices
            .write()
            .await
            .entry(device.user_id.clone())
            .or_default()
            .insert(device.device_id.clone(), device);
    }

    /// Add or replace the cross-signing keys of a user.
    pub async fn save_cross_signing_keys(&self, keys: CrossSigningKeys) {
        self.cross_signing_keys.write().await.insert(keys.user_id.clone(), keys);
    }

    /// Add a room key that we received directly, it will need to be backed
    /// up.
    pub async fn save_room_key(&self, room_key: RoomKeyForBackup) {
        self.room_keys
            .write()
            .await
            .insert(room_key.session_ref(), StoredRoomKey { room_key, backed_up: false });
    }

    /// Get a room key we have stored.
    pub async fn get_room_key(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Option<ExportedRoomKey> {
        self.room_keys
            .read()
            .await
            .get(&(room_id.to_owned(), session_id.to_owned()))
            .map(|k| k.room_key.room_key.clone())
    }

    async fn update_cross_signing_keys(
        &self,
        user_id: &UserId,
        update: impl FnOnce(&mut CrossSigningKeys),
    ) -> Result<()> {
        let mut keys = self.cross_signing_keys.write().await;
        let keys = keys
            .get_mut(user_id)
            .ok_or_else(|| CryptoStoreError::UnknownIdentity(user_id.to_string()))?;

        update(keys);

        Ok(())
    }
}

#[async_trait]
impl TrustStore for MemoryStore {
    async fn get_cross_signing_keys(&self, user_id: &UserId) -> Result<Option<CrossSigningKeys>> {
        Ok(self.cross_signing_keys.read().await.get(user_id).cloned())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceKeys>> {
        Ok(self.devices.read().await.get(user_id).and_then(|d| d.get(device_id)).cloned())
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceKeys>> {
        Ok(self
            .devices
            .read()
            .await
            .get(user_id)
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn mark_device_verified(&self, user_id: &UserId, device_id: &DeviceId) -> Result<()> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(user_id)
            .and_then(|d| d.get_mut(device_id))
            .ok_or_else(|| CryptoStoreError::UnknownIdentity(format!("{user_id} {device_id}")))?;

        device.local_trust = LocalTrust::Verified;

        Ok(())
    }

    async fn mark_own_master_key_trusted(&self) -> Result<()> {
        let own_user_id = self.own_user_id.clone();
        self.update_cross_signing_keys(&own_user_id, |k| k.master_key_trusted = true).await
    }

    async fn mark_user_master_key_trusted(&self, user_id: &UserId) -> Result<()> {
        self.update_cross_signing_keys(user_id, |k| k.master_key_trusted = true).await
    }
}

#[async_trait]
impl BackupStore for MemoryStore {
    async fn load_backup_keys(&self) -> Result<BackupKeys> {
        let keys = self.backup_keys.read().await;

        Ok(BackupKeys {
            decryption_key: keys.recovery_key.clone(),
            backup_version: keys.backup_version.clone(),
        })
    }

    async fn save_backup_version(&self, version: Option<String>) -> Result<()> {
        self.backup_keys.write().await.backup_version = version;
        Ok(())
    }

    async fn save_recovery_key(&self, recovery_key: Option<RecoveryKey>) -> Result<()> {
        self.backup_keys.write().await.recovery_key = recovery_key;
        Ok(())
    }

    async fn room_keys_for_backup(&self, limit: usize) -> Result<Vec<RoomKeyForBackup>> {
        Ok(self
            .room_keys
            .read()
            .await
            .values()
            .filter(|k| !k.backed_up)
            .take(limit)
            .map(|k| k.room_key.clone())
            .collect())
    }

    async fn mark_as_backed_up(&self, sessions: &[(OwnedRoomId, String)]) -> Result<()> {
        let mut room_keys = self.room_keys.write().await;

        for session in sessions {
            if let Some(key) = room_keys.get_mut(session) {
                key.backed_up = true;
            }
        }

        Ok(())
    }

    async fn reset_backup_state(&self) -> Result<()> {
        for key in self.room_keys.write().await.values_mut() {
            key.backed_up = false;
        }

        Ok(())
    }

    async fn import_room_keys(
        &self,
        room_keys: Vec<ExportedRoomKey>,
        from_backup_version: Option<&str>,
    ) -> Result<RoomKeyImportResult> {
        let total_count = room_keys.len();
        let mut imported_count = 0;
        let mut stored = self.room_keys.write().await;

        for room_key in room_keys {
            let session_ref = (room_key.room_id.clone(), room_key.session_id.clone());

            if stored.contains_key(&session_ref) {
                continue;
            }

            let room_key = RoomKeyForBackup {
                room_key,
                first_known_index: 0,
                forwarded_count: 1,
                is_verified: false,
            };

            stored.insert(
                session_ref,
                StoredRoomKey { room_key, backed_up: from_backup_version.is_some() },
            );
            imported_count += 1;
        }

        Ok(RoomKeyImportResult { imported_count, total_count })
    }

    async fn room_key_counts(&self) -> Result<RoomKeyCounts> {
        let room_keys = self.room_keys.read().await;

        Ok(RoomKeyCounts {
            total: room_keys.len(),
            backed_up: room_keys.values().filter(|k| k.backed_up).count(),
        })
    }
}
