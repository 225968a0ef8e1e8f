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

use ruma::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId, UserId,
};
use serde_json::Value;
use vodozemac::{Ed25519Keypair, Ed25519PublicKey, Ed25519Signature};

use super::to_signable_json;
use crate::{
    error::SignatureError,
    identities::{DeviceKeys, LocalTrust},
};

/// The public, immutable, part of our own device.
#[derive(Clone, Debug)]
pub struct StaticAccountData {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The id of our own device.
    pub device_id: OwnedDeviceId,
    /// The Ed25519 signing key of our own device.
    pub ed25519_key: Ed25519PublicKey,
}

impl StaticAccountData {
    /// Get the user id of the owner of the account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Get the device id that owns this account.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The key id our device uses for signatures.
    pub fn signing_key_id(&self) -> OwnedDeviceKeyId {
        DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id)
    }

    /// Our own device in the form other devices are represented, our own
    /// device is always trusted.
    pub fn own_device(&self) -> DeviceKeys {
        DeviceKeys {
            local_trust: LocalTrust::Verified,
            ..DeviceKeys::new(&self.user_id, &self.device_id, self.ed25519_key)
        }
    }
}

/// Our own device and its private signing key.
pub struct Account {
    static_data: StaticAccountData,
    signing_key: Ed25519Keypair,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.static_data.user_id)
            .field("device_id", &self.static_data.device_id)
            .field("ed25519_key", &self.static_data.ed25519_key.to_base64())
            .finish()
    }
}

impl Account {
    /// Create a new account with a freshly generated signing key.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self::from_signing_key(user_id, device_id, Ed25519Keypair::new())
    }

    /// Create an account for an existing signing key.
    pub fn from_signing_key(
        user_id: &UserId,
        device_id: &DeviceId,
        signing_key: Ed25519Keypair,
    ) -> Self {
        let static_data = StaticAccountData {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            ed25519_key: signing_key.public_key(),
        };

        Self { static_data, signing_key }
    }

    /// Get the public parts of the account.
    pub fn static_data(&self) -> &StaticAccountData {
        &self.static_data
    }

    /// Sign the given string with our device key.
    pub fn sign(&self, message: &str) -> Ed25519Signature {
        self.signing_key.sign(message.as_bytes())
    }

    /// Sign the canonical form of the given JSON object.
    pub fn sign_json(&self, json: Value) -> Result<Ed25519Signature, SignatureError> {
        let canonical_json = to_signable_json(json)?;
        Ok(self.sign(&canonical_json))
    }
}
