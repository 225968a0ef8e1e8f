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

use thiserror::Error;

/// Error type describing errors that happen while QR data is being decoded.
#[derive(Error, Debug)]
pub enum DecodingError {
    /// The QR code data is too short to contain even the fixed header.
    #[error("the decoded QR code is too short to be valid: {0} bytes")]
    TooShort(usize),

    /// The QR code data is missing the mandatory Matrix header.
    #[error("the decoded QR code is missing the Matrix header")]
    Header,

    /// The QR code text contains a character that is not a single ISO-8859-1
    /// byte.
    #[error("the QR code contains a character outside of ISO-8859-1: {0:?}")]
    NonLatin1Character(char),

    /// The QR code data is using an unsupported or invalid verification mode.
    #[error("the QR code contains an invalid verification mode: {0}")]
    Mode(u8),

    /// The QR code data doesn't contain valid Ed25519 keys.
    #[error(transparent)]
    Keys(#[from] vodozemac::KeyError),

    /// The QR code data is missing some fields.
    #[error(transparent)]
    Read(#[from] std::io::Error),

    /// The QR code data uses an invalid shared secret.
    #[error("the QR code contains a too short shared secret, length: {0}")]
    SharedSecret(usize),

    /// The QR code data uses an invalid or unsupported version.
    #[error("the QR code contains an invalid or unsupported version: {0}")]
    Version(u8),
}

/// Error type describing errors that happen while QR data is being encoded.
#[derive(Error, Debug)]
pub enum EncodingError {
    /// Error generating a QR code from the data, likely because the data
    /// doesn't fit into a QR code.
    #[error(transparent)]
    Qr(#[from] qrcode::types::QrError),

    /// Error encoding the given transaction id, the length of the id doesn't
    /// fit into an u16 integer.
    #[error("the verification transaction id length can't be converted into a u16: {0}")]
    TransactionIdTooLong(#[from] std::num::TryFromIntError),

    /// The transaction id contains a character that can't be represented as a
    /// single ISO-8859-1 byte.
    #[error("the verification transaction id contains a character outside of ISO-8859-1: {0:?}")]
    NonLatin1Character(char),
}
