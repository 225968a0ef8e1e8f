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

use qrcode::QrCode;
use ruma::serde::Base64;
use vodozemac::Ed25519PublicKey;

use crate::error::{DecodingError, EncodingError};

pub(crate) const HEADER: &[u8] = b"MATRIX";
pub(crate) const VERSION: u8 = 0x2;
pub(crate) const MAX_MODE: u8 = 0x2;
pub(crate) const MIN_SECRET_LEN: usize = 8;

/// Header, version, mode, the transaction id length and both keys.
pub(crate) const FIXED_LEN: usize = 74;

/// Header, version, mode and the transaction id length.
pub(crate) const MIN_LEN: usize = 10;

/// Encode a string as ISO-8859-1, every character becomes exactly one byte.
pub(crate) fn to_latin1(value: &str) -> Result<Vec<u8>, EncodingError> {
    value
        .chars()
        .map(|c| u8::try_from(c).map_err(|_| EncodingError::NonLatin1Character(c)))
        .collect()
}

/// Decode ISO-8859-1 bytes, this never fails since every byte maps to a
/// character.
pub(crate) fn from_latin1(bytes: &[u8]) -> String {
    bytes.iter().copied().map(char::from).collect()
}

/// The inverse of [`from_latin1`] for text that went through a text-only
/// channel.
pub(crate) fn latin1_text_to_bytes(value: &str) -> Result<Vec<u8>, DecodingError> {
    value
        .chars()
        .map(|c| u8::try_from(c).map_err(|_| DecodingError::NonLatin1Character(c)))
        .collect()
}

pub(crate) fn to_bytes(
    mode: u8,
    transaction_id: &str,
    first_key: Ed25519PublicKey,
    second_key: Ed25519PublicKey,
    shared_secret: &Base64,
) -> Result<Vec<u8>, EncodingError> {
    let transaction_id = to_latin1(transaction_id)?;
    let transaction_id_len = u16::try_from(transaction_id.len())?;
    let shared_secret = shared_secret.as_bytes();

    let mut data = Vec::with_capacity(FIXED_LEN + transaction_id.len() + shared_secret.len());

    data.extend_from_slice(HEADER);
    data.push(VERSION);
    data.push(mode);
    data.extend_from_slice(&transaction_id_len.to_be_bytes());
    data.extend_from_slice(&transaction_id);
    data.extend_from_slice(first_key.as_bytes());
    data.extend_from_slice(second_key.as_bytes());
    data.extend_from_slice(shared_secret);

    Ok(data)
}

pub(crate) fn to_qr_code(
    mode: u8,
    transaction_id: &str,
    first_key: Ed25519PublicKey,
    second_key: Ed25519PublicKey,
    shared_secret: &Base64,
) -> Result<QrCode, EncodingError> {
    let data = to_bytes(mode, transaction_id, first_key, second_key, shared_secret)?;

    Ok(QrCode::new(data)?)
}

#[cfg(test)]
mod tests {
    use super::{from_latin1, latin1_text_to_bytes, to_latin1};

    #[test]
    fn latin1_preserves_every_byte() {
        let bytes: Vec<u8> = (0..=u8::MAX).collect();
        let text = from_latin1(&bytes);

        assert_eq!(text.chars().count(), 256);
        assert_eq!(latin1_text_to_bytes(&text).unwrap(), bytes);
        assert_eq!(to_latin1(&text).unwrap(), bytes);
    }

    #[test]
    fn latin1_rejects_wide_characters() {
        assert!(to_latin1("caf\u{e9}").is_ok());
        assert!(to_latin1("\u{20ac}uro").is_err());
        assert!(latin1_text_to_bytes("\u{1F510}").is_err());
    }
}
