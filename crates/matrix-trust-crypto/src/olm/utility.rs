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

use ruma::CanonicalJsonValue;
use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::error::SignatureError;

/// Turn a JSON object into the canonical string form that gets signed.
///
/// The `signatures` and `unsigned` fields never take part in a signature.
pub(crate) fn to_signable_json(mut value: Value) -> Result<String, SignatureError> {
    let json_object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    let _ = json_object.remove("signatures");
    let _ = json_object.remove("unsigned");

    let canonical_json: CanonicalJsonValue = value.try_into()?;

    Ok(canonical_json.to_string())
}

/// Check an Ed25519 signature over the given canonical JSON string.
pub(crate) fn verify_signature(
    key: Ed25519PublicKey,
    canonical_json: &str,
    signature: &Ed25519Signature,
) -> Result<(), SignatureError> {
    Ok(key.verify(canonical_json.as_bytes(), signature)?)
}
