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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_debug_implementations, missing_docs)]

mod error;
mod types;
mod utils;

pub use error::{DecodingError, EncodingError};
pub use qrcode;
pub use types::{
    QrVerificationData, SelfVerificationData, SelfVerificationNoMasterKey, VerificationData,
};

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use proptest::prelude::*;
    use ruma::serde::Base64;
    use vodozemac::{Ed25519Keypair, Ed25519PublicKey, Ed25519SecretKey};

    use crate::{
        DecodingError, QrVerificationData, SelfVerificationData, SelfVerificationNoMasterKey,
        VerificationData,
    };

    fn key_from_seed(seed: [u8; 32]) -> Ed25519PublicKey {
        Ed25519SecretKey::from_slice(&seed).public_key()
    }

    fn latin1(bytes: &[u8]) -> String {
        bytes.iter().copied().map(char::from).collect()
    }

    fn qr_data() -> impl Strategy<Value = QrVerificationData> {
        (
            0u8..3,
            proptest::collection::vec(any::<u8>(), 0..64),
            any::<[u8; 32]>(),
            any::<[u8; 32]>(),
            proptest::collection::vec(any::<u8>(), 8..64),
        )
            .prop_map(|(mode, transaction_id, first, second, secret)| {
                let transaction_id = latin1(&transaction_id);
                let first = key_from_seed(first);
                let second = key_from_seed(second);
                let secret = Base64::new(secret);

                match mode {
                    0 => VerificationData::new(transaction_id, first, second, secret).into(),
                    1 => SelfVerificationData::new(transaction_id, first, second, secret).into(),
                    _ => {
                        SelfVerificationNoMasterKey::new(transaction_id, first, second, secret)
                            .into()
                    }
                }
            })
    }

    proptest! {
        #[test]
        fn encoding_round_trips(data in qr_data()) {
            let bytes = data.to_bytes().unwrap();
            prop_assert_eq!(
                bytes.len(),
                74 + data.transaction_id().chars().count() + data.secret().as_bytes().len()
            );

            let decoded = QrVerificationData::from_bytes(&bytes).unwrap();
            prop_assert_eq!(&decoded, &data);

            let text = data.to_encoded_string().unwrap();
            let decoded = QrVerificationData::from_encoded_str(&text).unwrap();
            prop_assert_eq!(decoded, data);
        }

        #[test]
        fn decoding_arbitrary_bytes_never_panics(
            bytes in proptest::collection::vec(any::<u8>(), 0..200)
        ) {
            let _ = QrVerificationData::from_bytes(bytes);
        }

        #[test]
        fn truncated_secrets_are_rejected(data in qr_data(), cut in 1usize..8) {
            let bytes = data.to_bytes().unwrap();
            let secret_len = data.secret().as_bytes().len();
            let truncated = &bytes[..bytes.len() - (secret_len - 8) - cut];

            assert_matches!(
                QrVerificationData::from_bytes(truncated),
                Err(DecodingError::SharedSecret(len))
            );
            prop_assert_eq!(len, 8 - cut);
        }
    }

    #[test]
    fn payloads_shorter_than_the_prefix_are_rejected() {
        let data = b"MATRIX\x02\x02";
        let result = QrVerificationData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::TooShort(8)));
    }

    #[test]
    fn foreign_headers_are_rejected() {
        let data = b"NonMatrixCode";
        let result = QrVerificationData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::Header));
    }

    #[test]
    fn unknown_modes_are_rejected() {
        let data = b"MATRIX\x02\x03\x00\x00";
        let result = QrVerificationData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::Mode(3)));
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let data = b"MATRIX\x01\x03\x00\x00";
        let result = QrVerificationData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::Version(1)));
    }

    #[test]
    fn payloads_without_keys_are_rejected() {
        let data = b"MATRIX\x02\x02\x00\x07FLOW_ID";
        let result = QrVerificationData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::SharedSecret(0)));
    }

    #[test]
    fn short_secrets_are_rejected() {
        let data = b"MATRIX\
                   \x02\x02\x00\x07\
                   FLOW_ID\
                   AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\
                   BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB\
                   SECRET";

        let result = QrVerificationData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::SharedSecret(6)));
    }

    #[test]
    fn invalid_keys_are_rejected() {
        let data = b"MATRIX\
                   \x02\x00\x00\x0f\
                   !test:localhost\
                   AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\
                   BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB\
                   SECRETISLONGENOUGH";
        let result = QrVerificationData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::Keys(_)));
    }

    #[test]
    fn text_outside_latin1_is_rejected() {
        let result = QrVerificationData::from_encoded_str("MATRIX\u{2}\u{0}\u{20ac}");
        assert_matches!(result, Err(DecodingError::NonLatin1Character('\u{20ac}')));
    }

    #[test]
    fn verifying_another_user_scenario() {
        let first_key = Ed25519Keypair::new().public_key();
        let second_key = Ed25519Keypair::new().public_key();
        let secret = Base64::new(b"SUPER_SECRET_VALUE".to_vec());

        let data: QrVerificationData =
            VerificationData::new("tx1".to_owned(), first_key, second_key, secret.clone()).into();

        let text = data.to_encoded_string().unwrap();
        assert_eq!(text.chars().count(), 74 + 3 + 18);

        let decoded = QrVerificationData::from_encoded_str(&text).unwrap();

        assert_matches!(&decoded, QrVerificationData::VerifyingAnotherUser(_));
        assert_eq!(decoded.transaction_id(), "tx1");
        assert_eq!(decoded.first_key(), first_key);
        assert_eq!(decoded.second_key(), second_key);
        assert_eq!(decoded.secret(), &secret);
        assert_eq!(decoded, data);
    }

    #[test]
    fn latin1_transaction_ids() {
        let key = Ed25519Keypair::new().public_key();
        let data: QrVerificationData = SelfVerificationNoMasterKey::new(
            "\u{e9}t\u{e9}".to_owned(),
            key,
            key,
            Base64::new(vec![7; 16]),
        )
        .into();

        let bytes = data.to_bytes().unwrap();
        assert_eq!(&bytes[8..10], &[0x00, 0x03]);
        assert_eq!(&bytes[10..13], &[0xe9, b't', 0xe9]);

        let decoded = QrVerificationData::from_bytes(bytes).unwrap();
        assert_eq!(decoded.transaction_id(), "\u{e9}t\u{e9}");
        assert_eq!(decoded.mode(), 2);
    }

    #[test]
    fn non_latin1_transaction_ids_are_rejected() {
        let key = Ed25519Keypair::new().public_key();
        let data: QrVerificationData =
            SelfVerificationData::new("\u{1F600}".to_owned(), key, key, Base64::new(vec![1; 8]))
                .into();

        assert!(data.to_bytes().is_err());
        assert!(data.to_qr_code().is_err());
    }

    #[test]
    fn qr_code_rendering() {
        let key = Ed25519Keypair::new().public_key();
        let data: QrVerificationData =
            VerificationData::new("tx1".to_owned(), key, key, Base64::new(vec![0; 16])).into();

        let code = data.to_qr_code().unwrap();
        assert!(code.width() > 0);
    }
}
