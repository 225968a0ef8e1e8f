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

//! Server-side backup support for room keys
//!
//! This module implements support for server-side backups using the
//! `m.megolm_backup.v1.curve25519-aes-sha2` backup algorithm. The
//! [`BackupMachine`] negotiates the backup version with the homeserver,
//! uploads room keys as they arrive and restores them from a recovery key or
//! a passphrase.
//!
//! [spec]: https://spec.matrix.org/unstable/client-server-api/#server-side-key-backups

use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use eyeball::{SharedObservable, Subscriber};
use rand::{thread_rng, Rng};
use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};
use zeroize::Zeroizing;

use crate::{
    error::SignatureError,
    olm::Account,
    store::{BackupStore, CryptoStoreError, RoomKeyCounts, RoomKeyImportResult, TrustStore},
    types::{
        BackupVersion, ExportedRoomKey, MegolmV1AuthData, RoomKeyBackup, RoomKeyBackupInfo,
        RoomKeyBackups, Signatures,
    },
};

mod keys;
mod server;
mod trust;

pub use keys::{
    generate_salt, DecodeError, DecryptionError, InvalidPassphrase, MegolmV1BackupKey,
    RecoveryKey, DEFAULT_PBKDF2_ITERATIONS,
};
pub use server::{BackupServer, BackupServerError, RoomKeysUploaded};
pub use trust::{BackupTrustEvaluator, KeysBackupVersionTrust, SignatureInfo};

/// The state of the key backup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackupState {
    /// We don't know yet if there is a backup on the homeserver.
    #[default]
    Unknown,
    /// We're fetching the latest backup version from the homeserver.
    CheckingBackUpOnHomeserver,
    /// There is no backup, or we aren't using it.
    Disabled,
    /// The backup on the homeserver isn't signed by anything we trust.
    NotTrusted,
    /// The homeserver has a different backup version than the one we were
    /// using.
    WrongBackUpVersion,
    /// A new backup version is being created.
    Enabling,
    /// The backup is enabled and all room keys are uploaded.
    ReadyToBackUp,
    /// Room keys need to be uploaded and an upload is scheduled.
    WillBackUp,
    /// Room keys are being uploaded.
    BackingUp,
}

impl BackupState {
    /// Is a backup version in use.
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::ReadyToBackUp | Self::WillBackUp | Self::BackingUp)
    }
}

/// Tunables of the [`BackupMachine`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// How many room keys are uploaded in a single request.
    pub batch_size: usize,
    /// The upper bound of the random delay before an automatic backup.
    pub max_backup_delay: Duration,
    /// The number of PBKDF2 rounds for passphrase based backups.
    pub pbkdf2_iterations: u32,
    /// How many room keys are imported between two progress reports, and
    /// cancellation checks, while restoring.
    pub import_chunk_size: usize,
}

impl BackupSettings {
    /// The default number of room keys per upload.
    pub const DEFAULT_BATCH_SIZE: usize = 100;
    /// The default upper bound of the random backup delay.
    pub const DEFAULT_MAX_BACKUP_DELAY: Duration = Duration::from_secs(10);
    /// The default number of room keys imported per chunk.
    pub const DEFAULT_IMPORT_CHUNK_SIZE: usize = 50;
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            batch_size: Self::DEFAULT_BATCH_SIZE,
            max_backup_delay: Self::DEFAULT_MAX_BACKUP_DELAY,
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            import_chunk_size: Self::DEFAULT_IMPORT_CHUNK_SIZE,
        }
    }
}

/// The steps of a restore.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RestoreProgress {
    /// No restore is running.
    #[default]
    Idle,
    /// The key is being derived from the passphrase.
    ComputingKey {
        /// The number of PBKDF2 rounds that are done.
        progress: u32,
        /// The total number of PBKDF2 rounds.
        total: u32,
    },
    /// The encrypted room keys are being downloaded.
    DownloadingKey,
    /// The decrypted room keys are being imported.
    ImportingKey {
        /// The number of room keys handed to the store so far.
        progress: usize,
        /// The number of room keys that will be imported.
        total: usize,
    },
    /// The restore finished.
    Done,
}

/// A handle to cancel a running restore.
///
/// Cancelling stops the import before the next chunk, room keys that were
/// already imported stay.
#[derive(Clone, Debug, Default)]
pub struct RestoreCancellation(Arc<AtomicBool>);

impl RestoreCancellation {
    /// Create a new handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the restore to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Was the restore cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for a restore.
#[derive(Clone, Debug, Default)]
pub struct RestoreOptions {
    /// Restore even if the backup isn't signed by anything we trust.
    ///
    /// This is an explicit user override, a server controlled backup could
    /// inject room keys otherwise.
    pub allow_untrusted: bool,
    /// Only restore the keys of this room.
    pub room_id: Option<OwnedRoomId>,
    /// Only restore this session, requires `room_id`.
    pub session_id: Option<String>,
    /// Handle to cancel the restore.
    pub cancellation: RestoreCancellation,
}

/// The material of a backup version that wasn't uploaded yet.
#[derive(Debug)]
pub struct MegolmBackupCreationInfo {
    /// The signed auth data that will be uploaded.
    pub auth_data: MegolmV1AuthData,
    /// The recovery key, needs to be shown to the user.
    pub recovery_key: RecoveryKey,
}

/// The whole milliseconds of a duration, saturating at `u64::MAX`.
fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Error type for the key backup.
#[derive(Debug, Error)]
pub enum KeyBackupError {
    /// The recovery key couldn't be decoded.
    #[error("the recovery key is invalid: {0}")]
    InvalidRecoveryKey(#[from] DecodeError),

    /// The recovery key doesn't belong to the backup version.
    #[error("the recovery key doesn't match the public key of the backup")]
    RecoveryKeyMismatch,

    /// The backup isn't signed by anything we trust.
    #[error("the backup isn't trusted")]
    UntrustedBackup,

    /// A passphrase was given but the backup wasn't created from one.
    #[error("the backup wasn't created from a passphrase")]
    MissingPassphraseInfo,

    /// The backup uses an algorithm we don't support.
    #[error("the backup algorithm {0} isn't supported")]
    UnsupportedAlgorithm(String),

    /// The passphrase can't be used to derive a key.
    #[error(transparent)]
    InvalidPassphrase(#[from] InvalidPassphrase),

    /// None of the backed up room keys could be decrypted.
    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    /// A room key couldn't be serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The auth data couldn't be signed.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The homeserver returned an error.
    #[error(transparent)]
    Server(#[from] BackupServerError),

    /// The store returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The restore was cancelled.
    #[error("the restore was cancelled")]
    Cancelled,

    /// The task deriving the recovery key from a passphrase panicked.
    #[error("the key derivation task failed: {0}")]
    KeyDerivation(#[from] tokio::task::JoinError),

    /// The operation isn't allowed in the current backup state.
    #[error("can't {action} while the backup is in the {found:?} state")]
    InvalidState {
        /// The operation that was attempted.
        action: &'static str,
        /// The state the backup was in.
        found: BackupState,
    },

    /// We aren't using a backup version.
    #[error("no backup version is in use")]
    NoBackup,
}

/// A state machine that handles backing up room keys.
///
/// The machine starts in the [`BackupState::Unknown`] state, calling
/// [`BackupMachine::check_and_start`] looks for a trusted backup on the
/// homeserver. Once a backup is in use new room keys are uploaded with
/// [`BackupMachine::maybe_backup_keys`].
#[derive(Debug, Clone)]
pub struct BackupMachine {
    account: Arc<Account>,
    trust_store: Arc<dyn TrustStore>,
    store: Arc<dyn BackupStore>,
    server: Arc<dyn BackupServer>,
    settings: BackupSettings,
    state: SharedObservable<BackupState>,
    restore_progress: SharedObservable<RestoreProgress>,
    backup_key: Arc<RwLock<Option<MegolmV1BackupKey>>>,
    backup_lock: Arc<Mutex<()>>,
}

impl BackupMachine {
    /// Create a new backup machine.
    pub fn new(
        account: Arc<Account>,
        trust_store: Arc<dyn TrustStore>,
        store: Arc<dyn BackupStore>,
        server: Arc<dyn BackupServer>,
        settings: BackupSettings,
    ) -> Self {
        Self {
            account,
            trust_store,
            store,
            server,
            settings,
            state: SharedObservable::new(BackupState::Unknown),
            restore_progress: SharedObservable::new(RestoreProgress::Idle),
            backup_key: RwLock::new(None).into(),
            backup_lock: Mutex::new(()).into(),
        }
    }

    /// The current backup state.
    pub fn state(&self) -> BackupState {
        self.state.get()
    }

    /// Subscribe to updates of the backup state.
    pub fn state_stream(&self) -> Subscriber<BackupState> {
        self.state.subscribe()
    }

    /// The progress of the current, or last, restore.
    pub fn restore_progress(&self) -> RestoreProgress {
        self.restore_progress.get()
    }

    /// Subscribe to the progress of restores.
    pub fn restore_progress_stream(&self) -> Subscriber<RestoreProgress> {
        self.restore_progress.subscribe()
    }

    /// The backup version we're uploading room keys to, if any.
    pub async fn backup_version(&self) -> Option<String> {
        let backup_key = self.backup_key.read().await;
        backup_key.as_ref().and_then(|k| k.backup_version().map(ToOwned::to_owned))
    }

    /// Get the number of backed up room keys and the total number of room keys.
    pub async fn room_key_counts(&self) -> Result<RoomKeyCounts, KeyBackupError> {
        Ok(self.store.room_key_counts().await?)
    }

    fn set_state(&self, state: BackupState) {
        let old = self.state.set(state);

        if old != state {
            debug!(?old, new = ?state, "Backup state changed");
        }
    }

    /// Create the material for a new backup version.
    ///
    /// A fresh recovery key is generated, unless a passphrase is given in which
    /// case the key is derived from it. The auth data is signed with our
    /// device key.
    #[instrument(skip_all, fields(with_passphrase = passphrase.is_some()))]
    pub fn prepare_version(
        &self,
        passphrase: Option<&str>,
    ) -> Result<MegolmBackupCreationInfo, KeyBackupError> {
        let (recovery_key, passphrase_info) = match passphrase {
            Some(passphrase) => {
                let (key, salt, iterations) = RecoveryKey::new_from_passphrase(
                    passphrase,
                    self.settings.pbkdf2_iterations,
                    |progress, total| trace!(progress, total, "Deriving the backup key"),
                )?;

                (key, Some((salt, iterations)))
            }
            None => (RecoveryKey::new(), None),
        };

        let public_key = recovery_key.megolm_v1_public_key().public_key();
        let mut auth_data = MegolmV1AuthData::new(public_key, Signatures::new());

        if let Some((salt, iterations)) = passphrase_info {
            auth_data = auth_data.with_passphrase_info(salt, iterations);
        }

        let signature = self.account.sign_json(serde_json::to_value(&auth_data)?)?;
        auth_data.signatures.add_signature(
            self.account.static_data().user_id.clone(),
            self.account.static_data().signing_key_id(),
            signature,
        );

        Ok(MegolmBackupCreationInfo { auth_data, recovery_key })
    }

    async fn activate(&self, key: MegolmV1BackupKey) -> Result<(), KeyBackupError> {
        let version = key.backup_version().map(ToOwned::to_owned);
        let stored_version = self.store.load_backup_keys().await?.backup_version;

        if stored_version != version {
            debug!(?stored_version, ?version, "Switching backup versions, resetting the room keys");
            self.store.reset_backup_state().await?;
            self.store.save_backup_version(version).await?;
        }

        info!(backup_key = ?key, "Activated a backup");
        *self.backup_key.write().await = Some(key);

        Ok(())
    }

    async fn reset_local_backup(&self) -> Result<(), KeyBackupError> {
        self.backup_key.write().await.take();
        self.store.save_backup_version(None).await?;
        self.store.save_recovery_key(None).await?;
        self.store.reset_backup_state().await?;

        Ok(())
    }

    /// Upload a new backup version and start using it.
    #[instrument(skip_all)]
    pub async fn create_version(
        &self,
        info: MegolmBackupCreationInfo,
    ) -> Result<String, KeyBackupError> {
        let state = self.state();

        if matches!(state, BackupState::Enabling | BackupState::BackingUp) {
            return Err(KeyBackupError::InvalidState { action: "create a backup", found: state });
        }

        self.set_state(BackupState::Enabling);

        let MegolmBackupCreationInfo { auth_data, recovery_key } = info;
        let backup_info = RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data);

        let version = match self.server.create_version(backup_info).await {
            Ok(version) => version,
            Err(e) => {
                warn!(error = ?e, "Couldn't create a new backup version");
                self.set_state(BackupState::Disabled);
                return Err(e.into());
            }
        };

        let key = recovery_key.megolm_v1_public_key().with_version(version.clone());

        self.store.reset_backup_state().await?;
        self.store.save_backup_version(Some(version.clone())).await?;
        self.store.save_recovery_key(Some(recovery_key)).await?;
        *self.backup_key.write().await = Some(key);

        info!(%version, "Created a new backup version");
        self.set_state(BackupState::ReadyToBackUp);

        Ok(version)
    }

    /// Delete a backup version from the homeserver.
    ///
    /// If it's the version we're using the local backup state is reset and we
    /// look for another backup.
    #[instrument(skip(self))]
    pub async fn delete_version(&self, version: &str) -> Result<(), KeyBackupError> {
        match self.server.delete_version(version).await {
            Ok(()) | Err(BackupServerError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        if self.backup_version().await.as_deref() == Some(version) {
            info!("Deleted the backup version we were using");

            self.reset_local_backup().await?;
            self.set_state(BackupState::Unknown);
            self.check_and_start().await?;
        }

        Ok(())
    }

    /// Check the homeserver for a backup and start using it if it's trusted.
    ///
    /// Does nothing unless we're in the [`BackupState::Unknown`],
    /// [`BackupState::Disabled`], [`BackupState::WrongBackUpVersion`] or
    /// [`BackupState::NotTrusted`] state.
    #[instrument(skip_all)]
    pub async fn check_and_start(&self) -> Result<(), KeyBackupError> {
        let state = self.state();

        if !matches!(
            state,
            BackupState::Unknown
                | BackupState::Disabled
                | BackupState::WrongBackUpVersion
                | BackupState::NotTrusted
        ) {
            debug!(?state, "Not checking the backup, it's already being set up or used");
            return Ok(());
        }

        self.set_state(BackupState::CheckingBackUpOnHomeserver);

        let latest = match self.server.get_latest_version().await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(error = ?e, "Couldn't fetch the latest backup version");
                self.set_state(BackupState::Unknown);
                return Err(e.into());
            }
        };

        let Some(latest) = latest else {
            info!("There is no backup on the homeserver");
            self.reset_local_backup().await?;
            self.set_state(BackupState::Disabled);
            return Ok(());
        };

        let Some(auth_data) = latest.megolm_v1_auth_data() else {
            warn!(algorithm = latest.info.algorithm(), "The backup uses an unsupported algorithm");
            self.backup_key.write().await.take();
            self.set_state(BackupState::Disabled);
            return Ok(());
        };

        let trust = self.get_version_trust(&latest).await?;

        if trust.usable {
            let key = MegolmV1BackupKey::from_auth_data(auth_data, Some(latest.version.clone()));
            self.activate(key).await?;
            self.set_state(BackupState::ReadyToBackUp);
        } else {
            info!(version = %latest.version, "The backup on the homeserver isn't trusted");
            self.backup_key.write().await.take();
            self.set_state(BackupState::NotTrusted);
        }

        Ok(())
    }

    /// Make sure we're using the latest backup version of the homeserver.
    ///
    /// Returns `true` if we were already using it, otherwise the old version is
    /// dropped and the latest one is checked.
    #[instrument(skip_all)]
    pub async fn force_using_last_version(&self) -> Result<bool, KeyBackupError> {
        let latest = self.server.get_latest_version().await?;
        let local = self.backup_version().await;

        match (latest, local) {
            (Some(latest), Some(local)) if latest.version == local => Ok(true),
            (_, local) => {
                if let Some(local) = local {
                    info!(%local, "Dropping our backup version, it isn't the latest one");

                    match self.server.delete_version(&local).await {
                        Ok(()) | Err(BackupServerError::NotFound) => {}
                        Err(e) => return Err(e.into()),
                    }

                    self.reset_local_backup().await?;
                }

                self.set_state(BackupState::Unknown);
                self.check_and_start().await?;

                Ok(false)
            }
        }
    }

    /// Check the signatures of a backup version.
    pub async fn get_version_trust(
        &self,
        version: &BackupVersion,
    ) -> Result<KeysBackupVersionTrust, KeyBackupError> {
        let Some(auth_data) = version.megolm_v1_auth_data() else {
            return Ok(KeysBackupVersionTrust::default());
        };

        let account = self.account.static_data();
        let mut devices = self.trust_store.get_user_devices(account.user_id()).await?;

        if !devices.iter().any(|d| d.device_id == account.device_id) {
            devices.push(account.own_device());
        }

        let cross_signing_keys =
            self.trust_store.get_cross_signing_keys(account.user_id()).await?;

        let evaluator = BackupTrustEvaluator {
            user_id: account.user_id(),
            device_id: account.device_id(),
            devices: &devices,
            cross_signing_keys: cross_signing_keys.as_ref(),
        };

        Ok(evaluator.evaluate(auth_data))
    }

    /// Sign the auth data of a backup version with our device key and upload
    /// the new signature.
    ///
    /// This is done after the user confirmed the backup, e.g. by entering the
    /// recovery key. The backup is checked again afterwards.
    #[instrument(skip_all, fields(version = %version.version))]
    pub async fn trust_version_with_signature(
        &self,
        version: &BackupVersion,
    ) -> Result<(), KeyBackupError> {
        let Some(auth_data) = version.megolm_v1_auth_data() else {
            return Err(KeyBackupError::UnsupportedAlgorithm(version.info.algorithm().to_owned()));
        };

        let mut auth_data = auth_data.clone();
        let signature = self.account.sign_json(serde_json::to_value(&auth_data)?)?;
        auth_data.signatures.add_signature(
            self.account.static_data().user_id.clone(),
            self.account.static_data().signing_key_id(),
            signature,
        );

        self.server
            .update_version(
                &version.version,
                RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data),
            )
            .await?;

        info!("Signed the backup version");

        self.check_and_start().await
    }

    /// Does the recovery key belong to the given backup version.
    pub fn is_valid_recovery_key_for_version(
        &self,
        version: &BackupVersion,
        recovery_key: &RecoveryKey,
    ) -> bool {
        version.megolm_v1_auth_data().is_some_and(|auth_data| {
            recovery_key.megolm_v1_public_key().public_key() == auth_data.public_key
        })
    }

    async fn ensure_trusted(
        &self,
        version: &BackupVersion,
        options: &RestoreOptions,
    ) -> Result<(), KeyBackupError> {
        if version.megolm_v1_auth_data().is_none() {
            return Err(KeyBackupError::UnsupportedAlgorithm(version.info.algorithm().to_owned()));
        }

        if self.get_version_trust(version).await?.usable {
            Ok(())
        } else if options.allow_untrusted {
            warn!(
                version = %version.version,
                "Restoring from an untrusted backup, allowed by the user"
            );
            Ok(())
        } else {
            Err(KeyBackupError::UntrustedBackup)
        }
    }

    /// Restore room keys using the textual form of a recovery key.
    #[instrument(skip_all, fields(version = %version.version))]
    pub async fn restore_with_recovery_key(
        &self,
        version: &BackupVersion,
        recovery_key: &str,
        options: RestoreOptions,
    ) -> Result<RoomKeyImportResult, KeyBackupError> {
        self.restore_progress.set(RestoreProgress::Idle);
        self.ensure_trusted(version, &options).await?;

        let recovery_key = RecoveryKey::from_base58(recovery_key)?;

        self.restore_with_key(version, recovery_key, &options).await
    }

    /// Restore room keys using the passphrase the backup was created from.
    #[instrument(skip_all, fields(version = %version.version))]
    pub async fn restore_with_passphrase(
        &self,
        version: &BackupVersion,
        passphrase: &str,
        options: RestoreOptions,
    ) -> Result<RoomKeyImportResult, KeyBackupError> {
        self.restore_progress.set(RestoreProgress::Idle);
        self.ensure_trusted(version, &options).await?;

        let (salt, iterations) = version
            .megolm_v1_auth_data()
            .and_then(|a| a.passphrase_info())
            .ok_or(KeyBackupError::MissingPassphraseInfo)?;

        if options.cancellation.is_cancelled() {
            return Err(KeyBackupError::Cancelled);
        }

        let passphrase = Zeroizing::new(passphrase.to_owned());
        let salt = salt.to_owned();
        let restore_progress = self.restore_progress.clone();
        let cancellation = options.cancellation.clone();

        let derive = move || {
            let report = |progress, total| {
                if cancellation.is_cancelled() {
                    return ControlFlow::Break(());
                }

                restore_progress.set(RestoreProgress::ComputingKey { progress, total });
                ControlFlow::Continue(())
            };

            RecoveryKey::from_passphrase_until(&passphrase, &salt, iterations, report)
        };

        let Some(recovery_key) = tokio::task::spawn_blocking(derive).await?? else {
            info!("The restore was cancelled while deriving the recovery key");
            return Err(KeyBackupError::Cancelled);
        };

        self.restore_with_key(version, recovery_key, &options).await
    }

    fn decrypt_room_keys(
        recovery_key: &RecoveryKey,
        backups: RoomKeyBackups,
    ) -> Result<Vec<ExportedRoomKey>, KeyBackupError> {
        let mut room_keys = Vec::new();
        let mut first_error = None;

        for (room_id, backup) in backups {
            for (session_id, data) in backup.sessions {
                match recovery_key.decrypt_session_data(&data.session_data) {
                    Ok(key) => room_keys.push(ExportedRoomKey::from_backed_up_room_key(
                        room_id.clone(),
                        session_id,
                        key,
                    )),
                    Err(e) => {
                        warn!(%room_id, %session_id, error = ?e, "Couldn't decrypt a room key");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
        }

        match first_error {
            Some(e) if room_keys.is_empty() => Err(e.into()),
            _ => Ok(room_keys),
        }
    }

    async fn restore_with_key(
        &self,
        version: &BackupVersion,
        recovery_key: RecoveryKey,
        options: &RestoreOptions,
    ) -> Result<RoomKeyImportResult, KeyBackupError> {
        if !self.is_valid_recovery_key_for_version(version, &recovery_key) {
            return Err(KeyBackupError::RecoveryKeyMismatch);
        }

        if options.cancellation.is_cancelled() {
            return Err(KeyBackupError::Cancelled);
        }

        let is_current_version =
            self.backup_version().await.is_some_and(|v| v == version.version);

        if is_current_version {
            self.store.save_recovery_key(Some(recovery_key.clone())).await?;
        }

        self.restore_progress.set(RestoreProgress::DownloadingKey);

        let backups = self
            .server
            .get_room_keys(
                &version.version,
                options.room_id.as_deref(),
                options.session_id.as_deref(),
            )
            .await?;

        let room_keys = Self::decrypt_room_keys(&recovery_key, backups)?;
        let total = room_keys.len();
        let from_backup_version = is_current_version.then_some(version.version.as_str());
        let mut result = RoomKeyImportResult { imported_count: 0, total_count: total };

        self.restore_progress.set(RestoreProgress::ImportingKey { progress: 0, total });

        let chunk_size = self.settings.import_chunk_size.max(1);
        let mut progress = 0;

        for chunk in room_keys.chunks(chunk_size) {
            if options.cancellation.is_cancelled() {
                info!(progress, total, "The restore was cancelled");
                return Err(KeyBackupError::Cancelled);
            }

            let chunk_result =
                self.store.import_room_keys(chunk.to_vec(), from_backup_version).await?;

            result.imported_count += chunk_result.imported_count;
            progress += chunk.len();

            self.restore_progress.set(RestoreProgress::ImportingKey { progress, total });
        }

        info!(
            imported_count = result.imported_count,
            total_count = result.total_count,
            "Restored room keys from the backup"
        );

        self.restore_progress.set(RestoreProgress::Done);

        Ok(result)
    }

    /// Schedule an upload of new room keys.
    ///
    /// If a backup is in use the upload starts after a random delay, so that
    /// several new room keys end up in a single request. An unknown backup
    /// state triggers a check of the homeserver instead.
    pub async fn maybe_backup_keys(&self) -> Result<(), KeyBackupError> {
        match self.state() {
            BackupState::Unknown => self.check_and_start().await,
            BackupState::ReadyToBackUp => {
                self.set_state(BackupState::WillBackUp);

                let max_delay = saturating_millis(self.settings.max_backup_delay);
                let delay = Duration::from_millis(thread_rng().gen_range(0..=max_delay));

                trace!(?delay, "Scheduling a room key backup");
                tokio::time::sleep(delay).await;

                self.backup_room_keys().await
            }
            state => {
                trace!(?state, "Not backing up room keys");
                Ok(())
            }
        }
    }

    /// Upload all the room keys that aren't backed up yet.
    #[instrument(skip_all)]
    pub async fn backup_room_keys(&self) -> Result<(), KeyBackupError> {
        let _guard = self.backup_lock.lock().await;

        let state = self.state();

        if !matches!(state, BackupState::ReadyToBackUp | BackupState::WillBackUp) {
            return Err(KeyBackupError::InvalidState { action: "back up room keys", found: state });
        }

        let Some(backup_key) = self.backup_key.read().await.clone() else {
            warn!("Trying to backup room keys but no backup key was found");
            return Err(KeyBackupError::NoBackup);
        };

        let Some(version) = backup_key.backup_version().map(ToOwned::to_owned) else {
            warn!("Trying to backup room keys but the backup key wasn't uploaded");
            return Err(KeyBackupError::NoBackup);
        };

        self.set_state(BackupState::BackingUp);

        loop {
            let room_keys = match self.store.room_keys_for_backup(self.settings.batch_size).await
            {
                Ok(k) => k,
                Err(e) => {
                    self.set_state(BackupState::ReadyToBackUp);
                    return Err(e.into());
                }
            };

            if room_keys.is_empty() {
                trace!("No room keys need to be backed up");
                self.set_state(BackupState::ReadyToBackUp);
                return Ok(());
            }

            let mut backups = RoomKeyBackups::new();
            let mut sessions = Vec::with_capacity(room_keys.len());

            for room_key in &room_keys {
                let data = match backup_key.encrypt(room_key) {
                    Ok(d) => d,
                    Err(e) => {
                        self.set_state(BackupState::ReadyToBackUp);
                        return Err(e.into());
                    }
                };

                let (room_id, session_id) = room_key.session_ref();
                backups
                    .entry(room_id.clone())
                    .or_insert_with(RoomKeyBackup::default)
                    .sessions
                    .insert(session_id.clone(), data);
                sessions.push((room_id, session_id));
            }

            match self.server.put_room_keys(&version, backups).await {
                Ok(uploaded) => {
                    debug!(
                        key_count = sessions.len(),
                        count = uploaded.count,
                        etag = %uploaded.etag,
                        "Uploaded a batch of room keys"
                    );

                    if let Err(e) = self.store.mark_as_backed_up(&sessions).await {
                        warn!(error = ?e, "Couldn't mark the uploaded room keys as backed up");
                        self.set_state(BackupState::ReadyToBackUp);
                        return Err(e.into());
                    }
                }
                Err(e @ (BackupServerError::NotFound | BackupServerError::WrongVersion { .. })) => {
                    warn!(error = ?e, "The backup version changed on the homeserver");

                    self.set_state(BackupState::WrongBackUpVersion);
                    self.reset_local_backup().await?;

                    if let Err(check_error) = self.check_and_start().await {
                        warn!(error = ?check_error, "Couldn't check the new backup version");
                    }

                    return Err(e.into());
                }
                Err(e) => {
                    warn!(error = ?e, "Couldn't upload room keys");
                    self.set_state(BackupState::ReadyToBackUp);
                    return Err(e.into());
                }
            }
        }
    }

    /// Stop using the backup and forget the local backup state.
    #[instrument(skip_all)]
    pub async fn disable(&self) -> Result<(), KeyBackupError> {
        debug!("Disabling key backup and resetting backup state for room keys");

        let _guard = self.backup_lock.lock().await;
        self.reset_local_backup().await?;
        self.set_state(BackupState::Disabled);

        Ok(())
    }
}
