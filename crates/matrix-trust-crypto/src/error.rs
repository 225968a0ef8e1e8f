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

use ruma::CanonicalJsonError;
use thiserror::Error;

use super::store::CryptoStoreError;
use crate::verification::VerificationTxState;

/// Error type describing different errors that can happen when we create or
/// check signatures of signed JSON objects.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signature was made using an unsupported algorithm.
    #[error("the signature used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The signing key that should create or check a signature is missing.
    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    /// The provided JSON value that was signed and the signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The provided JSON object doesn't contain a signature from the
    /// expected signer.
    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    /// The signature couldn't be verified.
    #[error(transparent)]
    VerificationError(#[from] vodozemac::SignatureError),

    /// The public key isn't a valid ed25519 key.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The signature could not be decoded.
    #[error("the given signature is not valid and can't be decoded")]
    InvalidSignature,

    /// The signed object couldn't be converted into canonical JSON.
    #[error(transparent)]
    JsonError(#[from] CanonicalJsonError),

    /// The signed object couldn't be serialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// An error the transport collaborator returned while sending a verification
/// message.
#[derive(Error, Debug)]
#[error("the verification message couldn't be sent: {0}")]
pub struct TransportError(#[source] Box<dyn std::error::Error + Send + Sync>);

impl TransportError {
    /// Wrap the error of a transport implementation.
    pub fn new(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

/// Errors that a caller of the verification API can run into.
///
/// Protocol failures, e.g. a mismatched key, never show up here, those move
/// the verification into the cancelled state instead.
#[derive(Error, Debug)]
pub enum VerificationError {
    /// The operation isn't allowed in the current state of the verification.
    #[error("the verification can't {action} while it's in the {found:?} state")]
    InvalidState {
        /// The operation that was attempted.
        action: &'static str,
        /// The state the verification was in.
        found: VerificationTxState,
    },

    /// A verification with the same flow id is already tracked.
    #[error("a verification with the flow id {0} already exists")]
    AlreadyExists(String),

    /// The verification machine was stopped or never started.
    #[error("the verification machine isn't running")]
    NotRunning,

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// A verification message couldn't be sent, the message is queued and can
    /// be retried.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Our own QR code couldn't be encoded.
    #[error(transparent)]
    Encoding(#[from] matrix_trust_qrcode::EncodingError),
}
