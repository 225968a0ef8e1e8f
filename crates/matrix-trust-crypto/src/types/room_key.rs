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

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The exported form of a Megolm session key, the secret part of a room key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Wrap an exported session key.
    pub fn new(key: String) -> Self {
        Self(key)
    }

    /// Get the exported session key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionKey").field(&"*****").finish()
    }
}

/// A room key in the form that is used for key exports and imports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: String,
    /// The room where the session is used.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device which initiated the session originally.
    pub sender_key: String,
    /// The ID of the session that the key is for.
    pub session_id: String,
    /// The key for the session.
    pub session_key: SessionKey,
    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// Chain of Curve25519 keys through which this session was forwarded, via
    /// m.forwarded_room_key events.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl ExportedRoomKey {
    /// Re-attach the room and session ids to a key that was restored from a
    /// backup.
    pub fn from_backed_up_room_key(
        room_id: OwnedRoomId,
        session_id: String,
        room_key: BackedUpRoomKey,
    ) -> Self {
        Self {
            algorithm: room_key.algorithm,
            room_id,
            sender_key: room_key.sender_key,
            session_id,
            session_key: room_key.session_key,
            sender_claimed_keys: room_key.sender_claimed_keys,
            forwarding_curve25519_key_chain: room_key.forwarding_curve25519_key_chain,
        }
    }
}

/// A room key as it is stored, encrypted, inside of a key backup.
///
/// This is the same as an [`ExportedRoomKey`] minus the room and session id,
/// those are part of the backup layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedUpRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: String,
    /// The Curve25519 key of the device which initiated the session originally.
    pub sender_key: String,
    /// The key for the session.
    pub session_key: SessionKey,
    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// Chain of Curve25519 keys through which this session was forwarded.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl From<&ExportedRoomKey> for BackedUpRoomKey {
    fn from(key: &ExportedRoomKey) -> Self {
        Self {
            algorithm: key.algorithm.clone(),
            sender_key: key.sender_key.clone(),
            session_key: key.session_key.clone(),
            sender_claimed_keys: key.sender_claimed_keys.clone(),
            forwarding_curve25519_key_chain: key.forwarding_curve25519_key_chain.clone(),
        }
    }
}
