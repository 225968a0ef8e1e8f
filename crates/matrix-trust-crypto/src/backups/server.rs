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

use async_trait::async_trait;
use ruma::RoomId;
use thiserror::Error;

use crate::types::{BackupVersion, RoomKeyBackupInfo, RoomKeyBackups};

/// Errors the homeserver side of the key backup can return.
#[derive(Debug, Error)]
pub enum BackupServerError {
    /// The backup version, or the requested keys, don't exist.
    #[error("the backup version or the room keys weren't found")]
    NotFound,

    /// The version we're uploading to isn't the current backup version.
    #[error("the backup version isn't the current one, the current version is {current_version}")]
    WrongVersion {
        /// The version the server considers current.
        current_version: String,
    },

    /// The request couldn't be sent or the response couldn't be parsed.
    #[error("the backup request failed: {0}")]
    Transport(Box<dyn std::error::Error + Send + Sync>),
}

impl BackupServerError {
    /// Wrap the error of a HTTP client.
    pub fn transport(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Transport(error.into())
    }
}

/// The response to an upload of room keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomKeysUploaded {
    /// The number of keys stored in the backup version.
    pub count: u64,
    /// The new etag of the backup version.
    pub etag: String,
}

/// The `/room_keys` API of the homeserver.
#[async_trait]
pub trait BackupServer: std::fmt::Debug + Send + Sync {
    /// Get the latest backup version, `None` if there is no backup.
    async fn get_latest_version(&self) -> Result<Option<BackupVersion>, BackupServerError>;

    /// Get a specific backup version.
    async fn get_version(&self, version: &str) -> Result<BackupVersion, BackupServerError>;

    /// Create a new backup version, returns the version string.
    async fn create_version(&self, info: RoomKeyBackupInfo) -> Result<String, BackupServerError>;

    /// Replace the auth data of an existing backup version.
    async fn update_version(
        &self,
        version: &str,
        info: RoomKeyBackupInfo,
    ) -> Result<(), BackupServerError>;

    /// Delete a backup version together with all of its keys.
    async fn delete_version(&self, version: &str) -> Result<(), BackupServerError>;

    /// Download room keys, optionally limited to a single room or session.
    async fn get_room_keys(
        &self,
        version: &str,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<RoomKeyBackups, BackupServerError>;

    /// Upload room keys to the given backup version.
    async fn put_room_keys(
        &self,
        version: &str,
        room_keys: RoomKeyBackups,
    ) -> Result<RoomKeysUploaded, BackupServerError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use ruma::RoomId;
    use tokio::sync::Mutex;

    use super::{BackupServer, BackupServerError, RoomKeysUploaded};
    use crate::types::{BackupVersion, RoomKeyBackup, RoomKeyBackupInfo, RoomKeyBackups};

    #[derive(Debug)]
    struct StoredVersion {
        info: RoomKeyBackupInfo,
        keys: RoomKeyBackups,
        etag: u64,
    }

    /// An in-memory homeserver backup.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryBackupServer {
        versions: Mutex<BTreeMap<u64, StoredVersion>>,
        next_version: Mutex<u64>,
        pub(crate) fail_requests: AtomicBool,
        pub(crate) uploads: AtomicUsize,
    }

    impl MemoryBackupServer {
        fn check_failure(&self) -> Result<(), BackupServerError> {
            if self.fail_requests.load(Ordering::SeqCst) {
                Err(BackupServerError::transport("the server is unreachable"))
            } else {
                Ok(())
            }
        }

        fn to_backup_version(version: u64, stored: &StoredVersion) -> BackupVersion {
            BackupVersion {
                version: version.to_string(),
                info: stored.info.clone(),
                count: stored.keys.values().map(|r| r.sessions.len() as u64).sum(),
                etag: stored.etag.to_string(),
            }
        }

        pub(crate) async fn session_count(&self, version: &str) -> usize {
            let Ok(version) = version.parse::<u64>() else { return 0 };

            self.versions
                .lock()
                .await
                .get(&version)
                .map(|v| v.keys.values().map(|r| r.sessions.len()).sum())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl BackupServer for MemoryBackupServer {
        async fn get_latest_version(&self) -> Result<Option<BackupVersion>, BackupServerError> {
            self.check_failure()?;

            Ok(self
                .versions
                .lock()
                .await
                .iter()
                .next_back()
                .map(|(version, stored)| Self::to_backup_version(*version, stored)))
        }

        async fn get_version(&self, version: &str) -> Result<BackupVersion, BackupServerError> {
            self.check_failure()?;
            let version = version.parse::<u64>().map_err(|_| BackupServerError::NotFound)?;

            self.versions
                .lock()
                .await
                .get(&version)
                .map(|stored| Self::to_backup_version(version, stored))
                .ok_or(BackupServerError::NotFound)
        }

        async fn create_version(
            &self,
            info: RoomKeyBackupInfo,
        ) -> Result<String, BackupServerError> {
            self.check_failure()?;

            let mut next_version = self.next_version.lock().await;
            *next_version += 1;

            self.versions
                .lock()
                .await
                .insert(*next_version, StoredVersion { info, keys: BTreeMap::new(), etag: 0 });

            Ok(next_version.to_string())
        }

        async fn update_version(
            &self,
            version: &str,
            info: RoomKeyBackupInfo,
        ) -> Result<(), BackupServerError> {
            self.check_failure()?;
            let version = version.parse::<u64>().map_err(|_| BackupServerError::NotFound)?;

            let mut versions = self.versions.lock().await;
            let stored = versions.get_mut(&version).ok_or(BackupServerError::NotFound)?;
            stored.info = info;

            Ok(())
        }

        async fn delete_version(&self, version: &str) -> Result<(), BackupServerError> {
            self.check_failure()?;
            let version = version.parse::<u64>().map_err(|_| BackupServerError::NotFound)?;

            self.versions
                .lock()
                .await
                .remove(&version)
                .map(|_| ())
                .ok_or(BackupServerError::NotFound)
        }

        async fn get_room_keys(
            &self,
            version: &str,
            room_id: Option<&RoomId>,
            session_id: Option<&str>,
        ) -> Result<RoomKeyBackups, BackupServerError> {
            self.check_failure()?;
            let version = version.parse::<u64>().map_err(|_| BackupServerError::NotFound)?;

            let versions = self.versions.lock().await;
            let stored = versions.get(&version).ok_or(BackupServerError::NotFound)?;

            Ok(stored
                .keys
                .iter()
                .filter(|(r, _)| room_id.map_or(true, |room_id| r.as_str() == room_id.as_str()))
                .map(|(r, backup)| {
                    let sessions = backup
                        .sessions
                        .iter()
                        .filter(|(s, _)| session_id.map_or(true, |session_id| *s == session_id))
                        .map(|(s, data)| (s.clone(), data.clone()))
                        .collect();

                    (r.clone(), RoomKeyBackup { sessions })
                })
                .filter(|(_, backup)| !backup.sessions.is_empty())
                .collect())
        }

        async fn put_room_keys(
            &self,
            version: &str,
            room_keys: RoomKeyBackups,
        ) -> Result<RoomKeysUploaded, BackupServerError> {
            self.check_failure()?;
            let parsed = version.parse::<u64>().map_err(|_| BackupServerError::NotFound)?;

            let mut versions = self.versions.lock().await;

            let current_version = versions.keys().next_back().copied();
            let Some(current_version) = current_version else {
                return Err(BackupServerError::NotFound);
            };

            if current_version != parsed {
                return Err(BackupServerError::WrongVersion {
                    current_version: current_version.to_string(),
                });
            }

            let stored = versions.get_mut(&parsed).ok_or(BackupServerError::NotFound)?;

            for (room_id, backup) in room_keys {
                stored.keys.entry(room_id).or_default().sessions.extend(backup.sessions);
            }

            stored.etag += 1;
            self.uploads.fetch_add(1, Ordering::SeqCst);

            Ok(RoomKeysUploaded {
                count: stored.keys.values().map(|r| r.sessions.len() as u64).sum(),
                etag: stored.etag.to_string(),
            })
        }
    }
}
