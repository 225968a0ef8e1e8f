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

use std::fmt::Debug;

use async_trait::async_trait;
use ruma::{DeviceId, OwnedRoomId, UserId};

use super::{BackupKeys, Result, RoomKeyCounts, RoomKeyForBackup, RoomKeyImportResult};
use crate::{
    backups::RecoveryKey,
    identities::{CrossSigningKeys, DeviceKeys},
    types::ExportedRoomKey,
};

/// Lookup and update of the keys we know about other devices and users.
///
/// This is the only way the verification and backup logic learns which keys
/// exist and records which keys became trusted.
#[async_trait]
pub trait TrustStore: Debug + Send + Sync {
    /// Get the cross-signing keys of the given user, if we know them.
    async fn get_cross_signing_keys(&self, user_id: &UserId) -> Result<Option<CrossSigningKeys>>;

    /// Get a single device of the given user.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user that the device belongs to.
    ///
    /// * `device_id` - The unique id of the device.
    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId)
        -> Result<Option<DeviceKeys>>;

    /// Get all the devices of the given user.
    async fn get_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceKeys>>;

    /// Mark the given device as verified.
    async fn mark_device_verified(&self, user_id: &UserId, device_id: &DeviceId) -> Result<()>;

    /// Mark our own master cross-signing key as trusted.
    async fn mark_own_master_key_trusted(&self) -> Result<()>;

    /// Mark the master cross-signing key of another user as trusted.
    async fn mark_user_master_key_trusted(&self, user_id: &UserId) -> Result<()>;
}

/// Persistence of the key backup state and of the room keys that take part in
/// the backup.
#[async_trait]
pub trait BackupStore: Debug + Send + Sync {
    /// Get the backup keys we have stored.
    async fn load_backup_keys(&self) -> Result<BackupKeys>;

    /// Store the backup version we are using, `None` forgets it.
    async fn save_backup_version(&self, version: Option<String>) -> Result<()>;

    /// Store the key that decrypts the backup, `None` forgets it.
    async fn save_recovery_key(&self, recovery_key: Option<RecoveryKey>) -> Result<()>;

    /// Get up to `limit` room keys that are not yet backed up.
    async fn room_keys_for_backup(&self, limit: usize) -> Result<Vec<RoomKeyForBackup>>;

    /// Mark the given `(room id, session id)` pairs as backed up.
    async fn mark_as_backed_up(&self, sessions: &[(OwnedRoomId, String)]) -> Result<()>;

    /// Mark every room key as not backed up, e.g. because the backup version
    /// changed.
    async fn reset_backup_state(&self) -> Result<()>;

    /// Import the given room keys.
    ///
    /// Importing a session we already have is a no-op, which makes imports
    /// incremental and safe to repeat. Keys coming from a backup version are
    /// marked as backed up.
    async fn import_room_keys(
        &self,
        room_keys: Vec<ExportedRoomKey>,
        from_backup_version: Option<&str>,
    ) -> Result<RoomKeyImportResult>;

    /// Get the number of room keys and how many of them are backed up.
    async fn room_key_counts(&self) -> Result<RoomKeyCounts>;
}
