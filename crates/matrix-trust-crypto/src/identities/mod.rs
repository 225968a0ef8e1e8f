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

//! The public identities of devices and users as far as trust decisions are
//! concerned.
//!
//! Devices are identified by their Ed25519 signing key, users by their
//! cross-signing keys. Both are looked up through the
//! [`TrustStore`](crate::store::TrustStore).

use ruma::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId, UserId,
};
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

/// The local trust state of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified = 0,
    /// The device been blacklisted from communicating.
    BlackListed = 1,
    /// The trust state of the device is being ignored.
    Ignored = 2,
    /// The trust state is unset.
    #[default]
    Unset = 3,
}

impl From<i64> for LocalTrust {
    fn from(state: i64) -> Self {
        match state {
            0 => LocalTrust::Verified,
            1 => LocalTrust::BlackListed,
            2 => LocalTrust::Ignored,
            _ => LocalTrust::Unset,
        }
    }
}

/// The keys of a single device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceKeys {
    /// The owner of the device.
    pub user_id: OwnedUserId,
    /// The unique id of the device.
    pub device_id: OwnedDeviceId,
    /// The Ed25519 signing key of the device.
    pub ed25519_key: Ed25519PublicKey,
    /// The Curve25519 identity key of the device, if known.
    pub curve25519_key: Option<Curve25519PublicKey>,
    /// The locally assigned trust of the device.
    pub local_trust: LocalTrust,
    /// Has the owner of the device signed it with their self-signing key, and
    /// do we trust that key.
    pub cross_signing_trusted: bool,
}

impl DeviceKeys {
    /// Create a new, unverified, device.
    pub fn new(user_id: &UserId, device_id: &DeviceId, ed25519_key: Ed25519PublicKey) -> Self {
        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            ed25519_key,
            curve25519_key: None,
            local_trust: LocalTrust::Unset,
            cross_signing_trusted: false,
        }
    }

    /// The key id the device uses for its signatures, `ed25519:<device id>`.
    pub fn key_id(&self) -> OwnedDeviceKeyId {
        DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id)
    }

    /// The fingerprint of the device, the unpadded base64 form of its Ed25519
    /// key.
    pub fn fingerprint(&self) -> String {
        self.ed25519_key.to_base64()
    }

    /// Is the device trusted, either locally or through cross-signing.
    pub fn is_verified(&self) -> bool {
        self.local_trust == LocalTrust::Verified || self.cross_signing_trusted
    }

    /// Is the device blacklisted.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust == LocalTrust::BlackListed
    }
}

/// The role of a cross-signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossSigningKeyUsage {
    /// The master key, the root of a user's identity.
    Master,
    /// The key that signs the user's own devices.
    SelfSigning,
    /// The key that signs other users' master keys.
    UserSigning,
}

/// The public cross-signing keys of a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrossSigningKeys {
    /// The owner of the keys.
    pub user_id: OwnedUserId,
    /// The master key.
    pub master_key: Ed25519PublicKey,
    /// The self-signing key, if published.
    pub self_signing_key: Option<Ed25519PublicKey>,
    /// The user-signing key, if published.
    pub user_signing_key: Option<Ed25519PublicKey>,
    /// Do we trust the master key, i.e. was it verified by us.
    pub master_key_trusted: bool,
}

impl CrossSigningKeys {
    /// Create a new, untrusted, set of cross-signing keys with just a master
    /// key.
    pub fn new(user_id: &UserId, master_key: Ed25519PublicKey) -> Self {
        Self {
            user_id: user_id.to_owned(),
            master_key,
            self_signing_key: None,
            user_signing_key: None,
            master_key_trusted: false,
        }
    }

    /// The key id a cross-signing key uses for its signatures,
    /// `ed25519:<unpadded base64 key>`.
    pub fn key_id(key: Ed25519PublicKey) -> OwnedDeviceKeyId {
        DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, key.to_base64().as_str().into())
    }

    /// Find the cross-signing key that uses the given key name, the part of
    /// the key id after the algorithm.
    pub fn key_for_name(&self, key_name: &str) -> Option<(CrossSigningKeyUsage, Ed25519PublicKey)> {
        [
            (CrossSigningKeyUsage::Master, Some(self.master_key)),
            (CrossSigningKeyUsage::SelfSigning, self.self_signing_key),
            (CrossSigningKeyUsage::UserSigning, self.user_signing_key),
        ]
        .into_iter()
        .find_map(|(usage, key)| key.filter(|k| k.to_base64() == key_name).map(|k| (usage, k)))
    }
}
