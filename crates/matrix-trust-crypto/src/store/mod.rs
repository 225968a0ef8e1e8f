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

//! Storage collaborators.
//!
//! The trust and backup logic never talks to a database directly, it goes
//! through the [`TrustStore`] and [`BackupStore`] traits. [`MemoryStore`] is
//! an in-memory implementation of both.

use ruma::OwnedRoomId;
use thiserror::Error;

use crate::{backups::RecoveryKey, types::ExportedRoomKey};

mod memorystore;
mod traits;

pub use memorystore::MemoryStore;
pub use traits::{BackupStore, TrustStore};

/// A `CryptoStore` specific result type.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// The crypto store's error type.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The store backend failed.
    #[error("the store backend failed: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// A value couldn't be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// The requested identity doesn't exist in the store.
    #[error("the identity of {0} is unknown")]
    UnknownIdentity(String),
}

impl CryptoStoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// Store the backup decryption key and the backup version we're using.
#[derive(Default, Debug)]
pub struct BackupKeys {
    /// The key used to decrypt backed up room keys.
    pub decryption_key: Option<RecoveryKey>,
    /// The version that we are using for backups.
    pub backup_version: Option<String>,
}

/// A struct containing the number of room keys and how many of them are
/// backed up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// The total number of room keys.
    pub total: usize,
    /// The number of backed up room keys.
    pub backed_up: usize,
}

/// The outcome of importing a batch of room keys.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// The number of room keys that were imported, keys we already had are not
    /// counted.
    pub imported_count: usize,
    /// The total number of room keys that were handed to the import.
    pub total_count: usize,
}

/// A room key that still needs to be uploaded to the backup.
#[derive(Debug, Clone)]
pub struct RoomKeyForBackup {
    /// The exported form of the room key.
    pub room_key: ExportedRoomKey,
    /// The first message index the session can decrypt.
    pub first_known_index: u32,
    /// How often the session was forwarded before we received it.
    pub forwarded_count: u32,
    /// Did we verify the device that sent us the session.
    pub is_verified: bool,
}

impl RoomKeyForBackup {
    /// The `(room id, session id)` pair identifying the session.
    pub fn session_ref(&self) -> (OwnedRoomId, String) {
        (self.room_key.room_id.clone(), self.room_key.session_id.clone())
    }
}
