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

//! The payload of a verification QR code.
//!
//! Every payload carries the id of the verification flow it belongs to, two
//! Ed25519 keys and a shared secret. What the two keys mean depends on the
//! mode byte, see [`QrVerificationData`].

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use qrcode::QrCode;
use ruma::serde::Base64;
use vodozemac::Ed25519PublicKey;

use crate::{
    error::{DecodingError, EncodingError},
    utils::{
        from_latin1, latin1_text_to_bytes, to_bytes, to_qr_code, FIXED_LEN, HEADER, MAX_MODE,
        MIN_LEN, MIN_SECRET_LEN, VERSION,
    },
};

/// A decoded verification QR code, one variant per mode.
///
/// Every consumer matches on this exhaustively, a new mode is a compile time
/// change at every call site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QrVerificationData {
    /// Mode `0x00`, two different users verify each other.
    ///
    /// The first key is the master key of the user showing the code, the
    /// second one is the master key the displaying side has on record for the
    /// scanning user.
    VerifyingAnotherUser(VerificationData),

    /// Mode `0x01`, two devices of the same user, the displaying device
    /// already trusts the master key.
    ///
    /// Usually shown by an existing device to a freshly logged in one. The
    /// first key is the master key, the second one is the device key the
    /// displaying device expects the scanner to have.
    SelfVerifyingMasterKeyTrusted(SelfVerificationData),

    /// Mode `0x02`, two devices of the same user, the displaying device
    /// doesn't trust the master key yet.
    ///
    /// Usually shown by a freshly logged in device. The first key is the
    /// device key of the displaying device, the second one is the master key
    /// it was told about.
    SelfVerifyingMasterKeyNotTrusted(SelfVerificationNoMasterKey),
}

impl TryFrom<&[u8]> for QrVerificationData {
    type Error = DecodingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(value)
    }
}

impl TryFrom<Vec<u8>> for QrVerificationData {
    type Error = DecodingError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::from_bytes(value)
    }
}

impl QrVerificationData {
    /// Decode the binary payload of a scanned QR code.
    ///
    /// Use this if the QR scanner hands out raw bytes, for scanners that
    /// produce text see [`QrVerificationData::from_encoded_str()`].
    ///
    /// # Examples
    /// ```
    /// # use matrix_trust_qrcode::{QrVerificationData, VerificationData};
    /// # use ruma::serde::Base64;
    /// # use vodozemac::Ed25519Keypair;
    /// let key = Ed25519Keypair::new().public_key();
    /// let secret = Base64::new(b"a long enough secret".to_vec());
    /// let data: QrVerificationData =
    ///     VerificationData::new("flow".to_owned(), key, key, secret).into();
    ///
    /// let bytes = data.to_bytes()?;
    /// assert!(bytes.starts_with(b"MATRIX\x02\x00"));
    ///
    /// let decoded = QrVerificationData::from_bytes(&bytes)?;
    /// assert_eq!(decoded, data);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, DecodingError> {
        Self::decode_bytes(bytes.as_ref())
    }

    /// Decode a payload that went through a text-only channel.
    ///
    /// Every character has to be a single ISO-8859-1 byte, which is what
    /// [`QrVerificationData::to_encoded_string()`] produces.
    pub fn from_encoded_str(text: &str) -> Result<Self, DecodingError> {
        let bytes = latin1_text_to_bytes(text)?;
        Self::decode_bytes(&bytes)
    }

    /// Render the payload as a [`QrCode`] that can be shown to the other
    /// side.
    ///
    /// Fails if the transaction id isn't ISO-8859-1 or the payload is too
    /// large for a QR code.
    pub fn to_qr_code(&self) -> Result<QrCode, EncodingError> {
        let (transaction_id, first_key, second_key, secret) = self.parts();
        to_qr_code(self.mode(), transaction_id, first_key, second_key, secret)
    }

    /// Serialize the payload into the bytes a QR code would carry.
    ///
    /// The result is 74 bytes plus the length of the transaction id and of
    /// the secret.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let (transaction_id, first_key, second_key, secret) = self.parts();
        to_bytes(self.mode(), transaction_id, first_key, second_key, secret)
    }

    /// Serialize the payload as text, every byte becomes the ISO-8859-1
    /// character with the same value.
    pub fn to_encoded_string(&self) -> Result<String, EncodingError> {
        Ok(from_latin1(&self.to_bytes()?))
    }

    /// Parse the wire layout of a payload:
    ///
    /// | bytes      | content                                      |
    /// |------------|----------------------------------------------|
    /// | 6          | `MATRIX` in ASCII                            |
    /// | 1          | the version, always `0x02`                   |
    /// | 1          | the mode, `0x00` to `0x02`                   |
    /// | 2          | big-endian length of the transaction id      |
    /// | n          | the transaction id, ISO-8859-1               |
    /// | 32         | the first key                                |
    /// | 32         | the second key                               |
    /// | the rest   | the shared secret, at least 8 bytes          |
    ///
    /// The secret has no length prefix, it's whatever follows the keys.
    fn decode_bytes(bytes: &[u8]) -> Result<Self, DecodingError> {
        if bytes.len() < MIN_LEN {
            return Err(DecodingError::TooShort(bytes.len()));
        }

        let mut reader = Cursor::new(bytes);

        let mut header = [0u8; 6];
        reader.read_exact(&mut header)?;

        if header != HEADER {
            return Err(DecodingError::Header);
        }

        let version = reader.read_u8()?;

        if version != VERSION {
            return Err(DecodingError::Version(version));
        }

        let mode = reader.read_u8()?;

        if mode > MAX_MODE {
            return Err(DecodingError::Mode(mode));
        }

        let transaction_id_len = usize::from(reader.read_u16::<BigEndian>()?);
        let secret_len = bytes.len().saturating_sub(FIXED_LEN + transaction_id_len);

        if secret_len < MIN_SECRET_LEN {
            return Err(DecodingError::SharedSecret(secret_len));
        }

        let mut transaction_id = vec![0u8; transaction_id_len];
        let mut keys = [[0u8; 32]; 2];

        reader.read_exact(&mut transaction_id)?;

        for key in &mut keys {
            reader.read_exact(key)?;
        }

        let mut secret = Vec::with_capacity(secret_len);
        reader.read_to_end(&mut secret)?;

        let [first_key, second_key] = keys;

        Self::from_parts(
            mode,
            from_latin1(&transaction_id),
            Ed25519PublicKey::from_slice(&first_key)?,
            Ed25519PublicKey::from_slice(&second_key)?,
            Base64::new(secret),
        )
    }

    fn from_parts(
        mode: u8,
        transaction_id: String,
        first_key: Ed25519PublicKey,
        second_key: Ed25519PublicKey,
        secret: Base64,
    ) -> Result<Self, DecodingError> {
        Ok(match mode {
            VerificationData::QR_MODE => {
                VerificationData::new(transaction_id, first_key, second_key, secret).into()
            }
            SelfVerificationData::QR_MODE => {
                SelfVerificationData::new(transaction_id, first_key, second_key, secret).into()
            }
            SelfVerificationNoMasterKey::QR_MODE => {
                SelfVerificationNoMasterKey::new(transaction_id, first_key, second_key, secret)
                    .into()
            }
            mode => return Err(DecodingError::Mode(mode)),
        })
    }

    /// The transaction id, the two keys and the secret in wire order.
    fn parts(&self) -> (&str, Ed25519PublicKey, Ed25519PublicKey, &Base64) {
        match self {
            Self::VerifyingAnotherUser(v) => {
                (&v.transaction_id, v.own_master_key, v.other_master_key, &v.shared_secret)
            }
            Self::SelfVerifyingMasterKeyTrusted(v) => {
                (&v.transaction_id, v.master_key, v.device_key, &v.shared_secret)
            }
            Self::SelfVerifyingMasterKeyNotTrusted(v) => {
                (&v.transaction_id, v.device_key, v.master_key, &v.shared_secret)
            }
        }
    }

    /// The mode byte, `0x00`, `0x01` or `0x02`.
    pub fn mode(&self) -> u8 {
        match self {
            Self::VerifyingAnotherUser(_) => VerificationData::QR_MODE,
            Self::SelfVerifyingMasterKeyTrusted(_) => SelfVerificationData::QR_MODE,
            Self::SelfVerifyingMasterKeyNotTrusted(_) => SelfVerificationNoMasterKey::QR_MODE,
        }
    }

    /// The id of the verification flow the code was generated for.
    pub fn transaction_id(&self) -> &str {
        self.parts().0
    }

    /// The first key in the payload, its meaning depends on the mode.
    pub fn first_key(&self) -> Ed25519PublicKey {
        self.parts().1
    }

    /// The second key in the payload, its meaning depends on the mode.
    pub fn second_key(&self) -> Ed25519PublicKey {
        self.parts().2
    }

    /// The secret the scanning side echoes back in its `start` message.
    pub fn secret(&self) -> &Base64 {
        self.parts().3
    }
}

/// The serialization and the conversion into [`QrVerificationData`] that
/// every payload type shares, `$first` and `$second` are the key fields in
/// wire order.
macro_rules! payload_impls {
    ($payload:ident, $variant:ident, $mode:literal, $first:ident, $second:ident) => {
        impl $payload {
            const QR_MODE: u8 = $mode;

            /// Serialize into the bytes a QR code would carry.
            pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
                to_bytes(
                    Self::QR_MODE,
                    &self.transaction_id,
                    self.$first,
                    self.$second,
                    &self.shared_secret,
                )
            }

            /// Render as a [`QrCode`].
            pub fn to_qr_code(&self) -> Result<QrCode, EncodingError> {
                QrVerificationData::from(self.clone()).to_qr_code()
            }
        }

        impl From<$payload> for QrVerificationData {
            fn from(payload: $payload) -> Self {
                Self::$variant(payload)
            }
        }
    };
}

/// Payload of a mode `0x00` code, used between two different users.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationData {
    transaction_id: String,
    own_master_key: Ed25519PublicKey,
    other_master_key: Ed25519PublicKey,
    shared_secret: Base64,
}

payload_impls!(VerificationData, VerifyingAnotherUser, 0x00, own_master_key, other_master_key);

impl VerificationData {
    /// Assemble the payload of a mode `0x00` code.
    ///
    /// # Arguments
    ///
    /// * `transaction_id` - The flow the code belongs to.
    ///
    /// * `own_master_key` - The master key of the user showing the code.
    ///
    /// * `other_master_key` - The master key we have for the scanning user.
    ///
    /// * `shared_secret` - Random bytes, at least 8 of them.
    pub fn new(
        transaction_id: String,
        own_master_key: Ed25519PublicKey,
        other_master_key: Ed25519PublicKey,
        shared_secret: Base64,
    ) -> Self {
        Self { transaction_id, own_master_key, other_master_key, shared_secret }
    }
}

/// Payload of a mode `0x01` code, shown by a device that trusts our master
/// key to another one of our devices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfVerificationData {
    transaction_id: String,
    master_key: Ed25519PublicKey,
    device_key: Ed25519PublicKey,
    shared_secret: Base64,
}

payload_impls!(SelfVerificationData, SelfVerifyingMasterKeyTrusted, 0x01, master_key, device_key);

impl SelfVerificationData {
    /// Assemble the payload of a mode `0x01` code.
    ///
    /// # Arguments
    ///
    /// * `transaction_id` - The flow the code belongs to.
    ///
    /// * `master_key` - Our master key, trusted by the displaying device.
    ///
    /// * `device_key` - The Ed25519 key we expect the scanning device to have.
    ///
    /// * `shared_secret` - Random bytes, at least 8 of them.
    pub fn new(
        transaction_id: String,
        master_key: Ed25519PublicKey,
        device_key: Ed25519PublicKey,
        shared_secret: Base64,
    ) -> Self {
        Self { transaction_id, master_key, device_key, shared_secret }
    }
}

/// Payload of a mode `0x02` code, shown by a device that doesn't trust our
/// master key yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfVerificationNoMasterKey {
    transaction_id: String,
    device_key: Ed25519PublicKey,
    master_key: Ed25519PublicKey,
    shared_secret: Base64,
}

payload_impls!(
    SelfVerificationNoMasterKey,
    SelfVerifyingMasterKeyNotTrusted,
    0x02,
    device_key,
    master_key
);

impl SelfVerificationNoMasterKey {
    /// Assemble the payload of a mode `0x02` code.
    ///
    /// # Arguments
    ///
    /// * `transaction_id` - The flow the code belongs to.
    ///
    /// * `device_key` - The Ed25519 key of the displaying device.
    ///
    /// * `master_key` - The master key the displaying device was told about.
    ///
    /// * `shared_secret` - Random bytes, at least 8 of them.
    pub fn new(
        transaction_id: String,
        device_key: Ed25519PublicKey,
        master_key: Ed25519PublicKey,
        shared_secret: Base64,
    ) -> Self {
        Self { transaction_id, device_key, master_key, shared_secret }
    }
}
