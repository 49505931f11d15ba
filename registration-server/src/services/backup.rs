use crate::clock::Clock;
use crate::models::participant::Participant;
use crate::remote::{mask_token, FolderStatus, RemoteError, RemoteStorage};
use crate::services::participants::ParticipantRepository;
use crate::services::settings_store::SettingsStore;
use crate::storage::StorageError;
use bytes::Bytes;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Name stamp of snapshot files, e.g. `participants_20240101_030000.csv`.
const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const EXPORT_HEADERS: [&str; 9] = [
    "№",
    "Ticket number",
    "Full name",
    "Phone",
    "Age",
    "Gender",
    "City",
    "Registration date",
    "IP address",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStep {
    LoadParticipants,
    RepairEncoding,
    Serialize,
    PrepareFolder,
    UploadExport,
    UploadDocument,
}

impl fmt::Display for BackupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupStep::LoadParticipants => "loading participants",
            BackupStep::RepairEncoding => "repairing text encoding",
            BackupStep::Serialize => "serializing snapshot",
            BackupStep::PrepareFolder => "preparing backup folder",
            BackupStep::UploadExport => "uploading table export",
            BackupStep::UploadDocument => "uploading JSON document",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("A backup is already running")]
    InProgress,

    #[error("No remote storage token configured")]
    NoCredential,

    #[error("No participants to back up")]
    NothingToBackUp,

    #[error("Backup failed while {step}: {source}")]
    Remote {
        step: BackupStep,
        #[source]
        source: RemoteError,
    },

    #[error("Backup failed while serializing snapshot: {0}")]
    Export(String),

    #[error("Backup uploaded but its time could not be recorded: {0}")]
    Record(#[source] StorageError),
}

fn at_step(step: BackupStep) -> impl FnOnce(RemoteError) -> BackupError {
    move |source| BackupError::Remote { step, source }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotReport {
    pub participants: usize,
    pub export_path: String,
    pub document_path: String,
    /// Start of the snapshot; names the uploaded files and becomes
    /// `last_backup`.
    pub started_at: NaiveDateTime,
    pub completed_at: NaiveDateTime,
}

/// Snapshot creation shared by the scheduler, the admin trigger and the
/// post-registration backup.
///
/// `in_progress` is held for the whole snapshot, so snapshots never
/// interleave. Scheduled and one-off snapshots queue on it; the manual
/// trigger is rejected instead.
pub struct BackupService {
    participants: Arc<ParticipantRepository>,
    settings: Arc<SettingsStore>,
    remote: Arc<dyn RemoteStorage>,
    clock: Arc<dyn Clock>,
    folder: String,
    in_progress: tokio::sync::Mutex<()>,
}

impl BackupService {
    pub fn new(
        participants: Arc<ParticipantRepository>,
        settings: Arc<SettingsStore>,
        remote: Arc<dyn RemoteStorage>,
        clock: Arc<dyn Clock>,
        folder: impl Into<String>,
    ) -> Self {
        let folder = folder.into();
        let folder = match folder.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };
        Self {
            participants,
            settings,
            remote,
            clock,
            folder,
            in_progress: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.try_lock().is_err()
    }

    /// Waits for any running snapshot, then takes one and records its time.
    pub async fn run_scheduled(&self) -> Result<SnapshotReport, BackupError> {
        let _guard = self.in_progress.lock().await;
        self.snapshot_and_record().await
    }

    /// Admin-initiated snapshot. Fails with [`BackupError::InProgress`]
    /// instead of queueing.
    pub async fn trigger_manual(&self) -> Result<SnapshotReport, BackupError> {
        let _guard = self
            .in_progress
            .try_lock()
            .map_err(|_| BackupError::InProgress)?;
        tracing::info!("Manual backup requested");
        self.snapshot_and_record().await
    }

    /// Background snapshot after a registration. Does not move `last_backup`.
    pub fn spawn_one_off(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = service.in_progress.lock().await;
            match service.create_snapshot().await {
                Ok(report) => tracing::info!(
                    participants = report.participants,
                    path = %report.document_path,
                    "Post-registration backup completed"
                ),
                Err(e) => tracing::warn!(error = %e, "Post-registration backup failed"),
            }
        })
    }

    /// Creates the application folder layout in remote storage: the app
    /// root, the participant file when none exists (seeded from the local
    /// list), and the backup folder.
    pub async fn prepare_remote_layout(&self) -> Result<(), RemoteError> {
        let policy = self.settings.load().await.backup_settings;
        let Some(token) = policy.credential() else {
            tracing::info!("No remote storage token, skipping remote layout");
            return Ok(());
        };
        tracing::info!(token = %mask_token(token), "Preparing remote storage layout");

        self.remote.create_folder(token, "app:/").await?;
        let participants_path = self.participants.remote_path();
        if !self.remote.exists(token, participants_path).await? {
            let seed = self.participants.list(true).await;
            let body = serde_json::to_vec_pretty(&seed)
                .map_err(|e| RemoteError::Protocol(format!("participant file: {e}")))?;
            self.remote
                .upload(token, participants_path, Bytes::from(body))
                .await?;
            tracing::info!(path = %participants_path, count = seed.len(), "Created participant file");
        }
        self.remote.create_folder(token, &self.folder).await?;
        Ok(())
    }

    async fn snapshot_and_record(&self) -> Result<SnapshotReport, BackupError> {
        let report = self.create_snapshot().await?;
        self.settings
            .record_backup(report.started_at)
            .await
            .map_err(BackupError::Record)?;
        Ok(report)
    }

    /// Caller holds `in_progress`.
    async fn create_snapshot(&self) -> Result<SnapshotReport, BackupError> {
        let started_at = self.clock.now();
        tracing::debug!(step = %BackupStep::LoadParticipants, "Snapshot step");
        let policy = self.settings.load().await.backup_settings;
        let token = policy.credential().ok_or(BackupError::NoCredential)?;
        let mut participants = self.participants.list(true).await;
        if participants.is_empty() {
            return Err(BackupError::NothingToBackUp);
        }

        tracing::debug!(step = %BackupStep::RepairEncoding, "Snapshot step");
        for p in &mut participants {
            p.repair_encoding();
        }

        tracing::debug!(step = %BackupStep::Serialize, "Snapshot step");
        let stamp = started_at.format(FILE_STAMP_FORMAT).to_string();
        let export = render_export(&participants).map_err(BackupError::Export)?;
        let document = serde_json::to_vec_pretty(&participants)
            .map_err(|e| BackupError::Export(e.to_string()))?;

        tracing::debug!(step = %BackupStep::PrepareFolder, "Snapshot step");
        match self
            .remote
            .create_folder(token, &self.folder)
            .await
            .map_err(at_step(BackupStep::PrepareFolder))?
        {
            FolderStatus::Created => tracing::info!(folder = %self.folder, "Created backup folder"),
            FolderStatus::AlreadyExists => {}
        }

        let export_path = self.file_path(&stamp, "csv");
        tracing::debug!(step = %BackupStep::UploadExport, path = %export_path, "Snapshot step");
        self.remote
            .upload(token, &export_path, Bytes::from(export))
            .await
            .map_err(at_step(BackupStep::UploadExport))?;

        let document_path = self.file_path(&stamp, "json");
        tracing::debug!(step = %BackupStep::UploadDocument, path = %document_path, "Snapshot step");
        self.remote
            .upload(token, &document_path, Bytes::from(document))
            .await
            .map_err(at_step(BackupStep::UploadDocument))?;

        tracing::info!(
            participants = participants.len(),
            export = %export_path,
            document = %document_path,
            "Backup uploaded"
        );
        Ok(SnapshotReport {
            participants: participants.len(),
            export_path,
            document_path,
            started_at,
            completed_at: self.clock.now(),
        })
    }

    fn file_path(&self, stamp: &str, extension: &str) -> String {
        let sep = if self.folder.ends_with('/') { "" } else { "/" };
        format!("{}{sep}participants_{stamp}.{extension}", self.folder)
    }
}

/// Tabular export, UTF-8 with a byte-order mark so spreadsheet tools pick
/// the right encoding.
pub fn render_export(participants: &[Participant]) -> Result<Vec<u8>, String> {
    let mut out = "\u{FEFF}".as_bytes().to_vec();
    {
        let mut writer = csv::Writer::from_writer(&mut out);
        writer.write_record(EXPORT_HEADERS).map_err(|e| e.to_string())?;
        for (row, p) in participants.iter().enumerate() {
            writer
                .write_record([
                    (row + 1).to_string(),
                    p.ticket_number.to_string(),
                    p.full_name.clone(),
                    p.phone.clone(),
                    p.age.to_string(),
                    gender_label(&p.gender).to_string(),
                    p.city().unwrap_or("").to_string(),
                    p.registration_time.clone(),
                    p.ip_address.clone().unwrap_or_default(),
                ])
                .map_err(|e| e.to_string())?;
        }
        writer.flush().map_err(|e| e.to_string())?;
    }
    Ok(out)
}

fn gender_label(gender: &str) -> &str {
    match gender {
        "male" => "Male",
        "female" => "Female",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::settings::BackupPolicy;
    use crate::testing::{at, new_participant, participant, Harness, START};
    use chrono::TimeDelta;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn test_render_export() {
        let mut p = participant(3, "79261234567");
        p.ip_address = Some("10.0.0.1".into());
        p.coordinates = Some(crate::models::participant::GeoInfo {
            city: Some("Вологда".into()),
            ..Default::default()
        });

        let bytes = render_export(&[p]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.trim_start_matches('\u{FEFF}').lines();
        assert_eq!(
            lines.next(),
            Some("№,Ticket number,Full name,Phone,Age,Gender,City,Registration date,IP address")
        );
        assert_eq!(
            lines.next(),
            Some("1,3,Иван Петров,79261234567,30,Male,Вологда,2024-01-01 10:00:00,10.0.0.1")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_step_names_in_errors() {
        let err = BackupError::Remote {
            step: BackupStep::UploadExport,
            source: RemoteError::Timeout,
        };
        assert!(err.to_string().contains("uploading table export"));
    }

    #[tokio::test]
    async fn test_snapshot_requires_credential() {
        let h = Harness::new(false);
        h.local.set(vec![participant(1, "79261234567")]);
        assert!(matches!(h.backup.trigger_manual().await, Err(BackupError::NoCredential)));
    }

    #[tokio::test]
    async fn test_empty_collection_is_not_backed_up() {
        let h = Harness::new(true);
        assert!(matches!(h.backup.trigger_manual().await, Err(BackupError::NothingToBackUp)));
        assert!(h.remote.uploaded_paths().is_empty());
    }

    #[tokio::test]
    async fn test_manual_backup_uploads_and_records() {
        let h = Harness::new(true);
        h.local.set(vec![participant(1, "79261234567"), participant(2, "79261234568")]);

        let report = h.backup.trigger_manual().await.unwrap();
        assert_eq!(report.participants, 2);
        assert_eq!(
            h.remote.uploaded_paths(),
            vec![
                "/registration_backup/participants_20240101_040000.csv".to_string(),
                "/registration_backup/participants_20240101_040000.json".to_string(),
            ]
        );
        let document: Vec<Participant> = h.remote.get_json(&report.document_path).unwrap();
        assert_eq!(document.len(), 2);

        let recorded = h.settings.load().await.backup_settings.last_backup;
        assert_eq!(recorded.as_deref(), Some("2024-01-01 04:00:00"));
    }

    #[tokio::test]
    async fn test_last_backup_is_snapshot_start() {
        let h = Harness::new(true);
        h.local.set(vec![participant(1, "79261234567")]);
        h.remote.set_upload_delay(Duration::from_millis(100));

        let manual = {
            let backup = h.backup.clone();
            tokio::spawn(async move { backup.trigger_manual().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.clock.advance(TimeDelta::seconds(30));

        let report = manual.await.unwrap().unwrap();
        assert_eq!(report.started_at, at(START));
        assert_eq!(report.completed_at, at("2024-01-01 04:00:30"));
        let recorded = h.settings.load().await.backup_settings.last_backup;
        assert_eq!(recorded.as_deref(), Some(START));
    }

    #[tokio::test]
    async fn test_existing_folder_is_tolerated() {
        let h = Harness::new(true);
        h.local.set(vec![participant(1, "79261234567")]);
        h.remote.folders.lock().unwrap().insert("/registration_backup".into());
        h.backup.trigger_manual().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_upload_names_step_and_keeps_last_backup() {
        let h = Harness::new(true);
        h.local.set(vec![participant(1, "79261234567")]);
        h.remote.fail_uploads.store(true, Ordering::SeqCst);

        let err = h.backup.trigger_manual().await.unwrap_err();
        assert!(matches!(err, BackupError::Remote { step: BackupStep::UploadExport, .. }));
        assert!(h.settings.load().await.backup_settings.last_backup.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_manual_triggers_run_once() {
        let h = Harness::new(true);
        h.local.set(vec![participant(1, "79261234567")]);
        h.remote.set_upload_delay(Duration::from_millis(200));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let backup = h.backup.clone();
            tasks.push(tokio::spawn(async move { backup.trigger_manual().await }));
        }

        let mut ok = 0;
        let mut busy = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => ok += 1,
                Err(BackupError::InProgress) => busy += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((ok, busy), (1, 4));
        assert_eq!(h.remote.uploaded_paths().len(), 2);
    }

    #[tokio::test]
    async fn test_scheduled_run_waits_for_running_snapshot() {
        let h = Harness::new(true);
        h.local.set(vec![participant(1, "79261234567")]);
        h.remote.set_upload_delay(Duration::from_millis(100));

        let manual = {
            let backup = h.backup.clone();
            tokio::spawn(async move { backup.trigger_manual().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.backup.is_running());

        h.backup.run_scheduled().await.unwrap();
        manual.await.unwrap().unwrap();
        assert_eq!(h.remote.uploaded_paths().len(), 4);
    }

    #[tokio::test]
    async fn test_one_off_does_not_record() {
        let h = Harness::with_policy(BackupPolicy {
            enabled: true,
            yandex_token: "test-token".into(),
            ..Default::default()
        });
        h.local.set(vec![participant(1, "79261234567")]);

        h.backup.spawn_one_off().await.unwrap();
        assert_eq!(h.remote.uploaded_paths().len(), 2);
        assert!(h.settings.load().await.backup_settings.last_backup.is_none());
    }

    #[tokio::test]
    async fn test_prepare_remote_layout() {
        let h = Harness::new(true);
        h.backup.prepare_remote_layout().await.unwrap();

        let folders = h.remote.folders.lock().unwrap().clone();
        assert!(folders.contains("app:/"));
        assert!(folders.contains("/registration_backup"));
        let list: Vec<Participant> = h.remote.get_json("app:/participants.json").unwrap();
        assert!(list.is_empty());

        // An existing participant file is left alone.
        h.remote.put_json("app:/participants.json", &vec![participant(1, "79261234567")]);
        h.backup.prepare_remote_layout().await.unwrap();
        let list: Vec<Participant> = h.remote.get_json("app:/participants.json").unwrap();
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn test_startup_keeps_local_participants() {
        let h = Harness::new(true);
        h.local.set(vec![participant(1, "79261234567"), participant(2, "79261234568")]);

        h.backup.prepare_remote_layout().await.unwrap();
        let seeded: Vec<Participant> = h.remote.get_json("app:/participants.json").unwrap();
        assert_eq!(seeded.len(), 2);

        assert_eq!(h.participants.list(true).await.len(), 2);
        let added = h
            .participants
            .append(new_participant("Анна", "79267654321"))
            .await
            .unwrap();
        assert_eq!(added.ticket_number, 3);
        assert_eq!(h.local.current().unwrap().len(), 3);
    }
}
