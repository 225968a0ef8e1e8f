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

//! Evaluation of the signatures on a backup version.
//!
//! A backup is only considered usable if its auth data carries a valid
//! signature of our own device, of one of our verified devices or of one of
//! our trusted cross-signing keys. Every signature is reported back, including
//! the ones we can't check, so the caller can tell an unknown signer apart
//! from a missing signature.

use ruma::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId,
    UserId,
};
use tracing::{debug, warn};
use vodozemac::Ed25519PublicKey;

use crate::{
    error::SignatureError,
    identities::{CrossSigningKeyUsage, CrossSigningKeys, DeviceKeys},
    olm::{to_signable_json, verify_signature},
    types::{MegolmV1AuthData, Signature},
};

/// A single signature found on the auth data of a backup version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignatureInfo {
    /// A signature from a device, or from a key we don't know about.
    Device {
        /// The user that created the signature.
        user_id: OwnedUserId,
        /// The device id found in the key id of the signature.
        device_id: OwnedDeviceId,
        /// The device, `None` if we don't know the signing key.
        device: Option<DeviceKeys>,
        /// Did the signature check out.
        valid: bool,
    },
    /// A signature from one of our cross-signing keys.
    User {
        /// The user that created the signature.
        user_id: OwnedUserId,
        /// The key id of the signature.
        key_id: OwnedDeviceKeyId,
        /// The role and public key of the cross-signing key.
        cross_signing_key: Option<(CrossSigningKeyUsage, Ed25519PublicKey)>,
        /// Did the signature check out.
        valid: bool,
    },
}

impl SignatureInfo {
    /// Did the signature check out.
    pub fn is_valid(&self) -> bool {
        match self {
            SignatureInfo::Device { valid, .. } | SignatureInfo::User { valid, .. } => *valid,
        }
    }
}

/// The verdict on a backup version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeysBackupVersionTrust {
    /// Can we use the backup, i.e. is it signed by someone we trust.
    pub usable: bool,
    /// All the signatures that were found, in the order of the signatures map.
    pub signatures: Vec<SignatureInfo>,
}

/// Checks the signatures of a backup version against the keys we know.
///
/// The evaluator doesn't do any I/O, the caller collects the devices and
/// cross-signing keys beforehand.
#[derive(Debug)]
pub struct BackupTrustEvaluator<'a> {
    /// Our own user id.
    pub user_id: &'a UserId,
    /// The id of our own device.
    pub device_id: &'a DeviceId,
    /// The devices we know about, our own device included.
    pub devices: &'a [DeviceKeys],
    /// Our own cross-signing keys, if we have any.
    pub cross_signing_keys: Option<&'a CrossSigningKeys>,
}

impl BackupTrustEvaluator<'_> {
    fn find_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<&DeviceKeys> {
        self.devices.iter().find(|d| *d.user_id == *user_id && *d.device_id == *device_id)
    }

    fn check(canonical_json: Option<&str>, key: Ed25519PublicKey, signature: &Signature) -> bool {
        let (Some(canonical_json), Some(signature)) = (canonical_json, signature.ed25519()) else {
            return false;
        };

        verify_signature(key, canonical_json, &signature).is_ok()
    }

    fn is_trusted(&self, info: &SignatureInfo) -> bool {
        match info {
            SignatureInfo::Device { user_id, device_id, device: Some(device), valid: true } => {
                &**user_id == self.user_id
                    && (&**device_id == self.device_id || device.is_verified())
            }
            SignatureInfo::User {
                user_id,
                cross_signing_key: Some((usage, _)),
                valid: true,
                ..
            } => {
                let master_trusted =
                    self.cross_signing_keys.is_some_and(|keys| keys.master_key_trusted);

                let usage_trusted = matches!(
                    usage,
                    CrossSigningKeyUsage::Master | CrossSigningKeyUsage::SelfSigning
                );

                &**user_id == self.user_id && master_trusted && usage_trusted
            }
            _ => false,
        }
    }

    fn signature_info(
        &self,
        canonical_json: Option<&str>,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        signature: &Signature,
    ) -> SignatureInfo {
        let key_name = key_id.key_name();
        let unknown = || SignatureInfo::Device {
            user_id: user_id.to_owned(),
            device_id: key_name.to_owned(),
            device: None,
            valid: false,
        };

        if key_id.algorithm() != DeviceKeyAlgorithm::Ed25519 {
            return unknown();
        }

        if let Some(device) = self.find_device(user_id, key_name) {
            SignatureInfo::Device {
                user_id: user_id.to_owned(),
                device_id: device.device_id.clone(),
                device: Some(device.clone()),
                valid: Self::check(canonical_json, device.ed25519_key, signature),
            }
        } else if let Some((usage, key)) = self
            .cross_signing_keys
            .filter(|keys| *keys.user_id == *user_id)
            .and_then(|keys| keys.key_for_name(key_name.as_str()))
        {
            SignatureInfo::User {
                user_id: user_id.to_owned(),
                key_id: key_id.to_owned(),
                cross_signing_key: Some((usage, key)),
                valid: Self::check(canonical_json, key, signature),
            }
        } else {
            warn!(%user_id, %key_id, "The backup is signed by an unknown key");
            unknown()
        }
    }

    /// Check every signature of the given auth data.
    pub fn evaluate(&self, auth_data: &MegolmV1AuthData) -> KeysBackupVersionTrust {
        let canonical_json = serde_json::to_value(auth_data)
            .map_err(SignatureError::from)
            .and_then(to_signable_json)
            .map_err(|e| warn!(error = ?e, "Couldn't canonicalize the backup auth data"))
            .ok();

        let signatures: Vec<_> = auth_data
            .signatures
            .iter()
            .map(|(user_id, key_id, signature)| {
                self.signature_info(canonical_json.as_deref(), user_id, key_id, signature)
            })
            .collect();

        let usable = signatures.iter().any(|s| self.is_trusted(s));

        debug!(
            usable,
            signature_count = signatures.len(),
            valid_count = signatures.iter().filter(|s| s.is_valid()).count(),
            "Evaluated the trust of a backup version"
        );

        KeysBackupVersionTrust { usable, signatures }
    }
}
