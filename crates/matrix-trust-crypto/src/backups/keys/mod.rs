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

//! The keys used for the server-side room key backup.
//!
//! The private half of a backup key is shown to users as a [`RecoveryKey`],
//! the public half is a [`MegolmV1BackupKey`] and is used to encrypt room keys
//! before they are uploaded.

mod backup;
mod passphrase;
mod recovery;

pub use backup::MegolmV1BackupKey;
pub use passphrase::{generate_salt, InvalidPassphrase, DEFAULT_PBKDF2_ITERATIONS};
pub use recovery::{DecodeError, DecryptionError, RecoveryKey};
