use crate::clock::Clock;
use crate::encoding::repair_text;
use crate::models::participant::{
    canonical_phone, normalize_phone, same_subscriber, GeoInfo, NewParticipant, Participant,
    TicketLookup,
};
use crate::models::settings::TIMESTAMP_FORMAT;
use crate::remote::{RemoteError, RemoteStorage};
use crate::services::settings_store::SettingsStore;
use crate::storage::{DocumentStore, StorageError};
use bytes::Bytes;
use std::sync::{Arc, RwLock};

#[derive(thiserror::Error, Debug)]
pub enum ParticipantError {
    #[error("{0}")]
    Validation(String),

    #[error("Phone number {0} is already registered")]
    DuplicateEntry(String),

    #[error("Participant #{0} not found")]
    NotFound(usize),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Remote,
    Local,
    Empty,
}

/// In-memory participant list backed by the local JSON file and the shared
/// remote copy.
///
/// `lock` serializes reloads and every read-modify-write of the list.
/// Readers of an already populated cache never wait on it.
pub struct ParticipantRepository {
    local: Arc<dyn DocumentStore<Vec<Participant>>>,
    remote: Arc<dyn RemoteStorage>,
    settings: Arc<SettingsStore>,
    remote_path: String,
    clock: Arc<dyn Clock>,
    cache: RwLock<Option<Vec<Participant>>>,
    lock: tokio::sync::Mutex<()>,
}

impl ParticipantRepository {
    pub fn new(
        local: Arc<dyn DocumentStore<Vec<Participant>>>,
        remote: Arc<dyn RemoteStorage>,
        settings: Arc<SettingsStore>,
        remote_path: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local,
            remote,
            settings,
            remote_path: remote_path.into(),
            clock,
            cache: RwLock::new(None),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    /// Cached list, or a fresh load when `force_reload` is set or nothing is
    /// cached yet. Never fails: sources that cannot be read are skipped.
    pub async fn list(&self, force_reload: bool) -> Vec<Participant> {
        if !force_reload {
            if let Some(p) = self.cached() {
                return p;
            }
        }
        let _guard = self.lock.lock().await;
        if !force_reload {
            if let Some(p) = self.cached() {
                return p;
            }
        }
        self.reload_locked().await
    }

    pub async fn append(&self, new: NewParticipant) -> Result<Participant, ParticipantError> {
        let phone = normalize_phone(&new.phone).ok_or_else(|| {
            ParticipantError::Validation("Please enter a complete phone number".into())
        })?;
        let full_name = repair_text(new.full_name.trim()).into_owned();
        if full_name.is_empty() {
            return Err(ParticipantError::Validation("Full name is required".into()));
        }

        let _guard = self.lock.lock().await;
        let previous = self.current_locked().await;
        if previous.iter().any(|p| p.canonical_phone() == phone) {
            return Err(ParticipantError::DuplicateEntry(phone));
        }

        let coordinates = match (new.latitude, new.longitude) {
            (Some(lat), Some(lng)) => Some(GeoInfo {
                lat: Some(lat),
                lng: Some(lng),
                ..new.place.unwrap_or_default()
            }),
            _ => None,
        };
        let participant = Participant {
            ticket_number: next_ticket_number(&previous),
            full_name,
            phone,
            age: new.age,
            gender: new.gender,
            registration_time: self.clock.now().format(TIMESTAMP_FORMAT).to_string(),
            ip_address: new.ip_address,
            location: new.location,
            coordinates,
            extra: Default::default(),
        };

        let mut updated = previous.clone();
        updated.push(participant.clone());
        self.commit_locked(updated, previous).await?;

        tracing::info!(ticket = participant.ticket_number, "Participant registered");
        Ok(participant)
    }

    /// Removes the participant at `index` (registration order) and rewrites
    /// the whole list.
    pub async fn remove(&self, index: usize) -> Result<Participant, ParticipantError> {
        let _guard = self.lock.lock().await;
        let previous = self.current_locked().await;
        if index >= previous.len() {
            return Err(ParticipantError::NotFound(index));
        }

        let mut updated = previous.clone();
        let removed = updated.remove(index);
        self.commit_locked(updated, previous).await?;

        tracing::info!(ticket = removed.ticket_number, "Participant removed");
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<usize, ParticipantError> {
        let _guard = self.lock.lock().await;
        let previous = self.current_locked().await;
        let count = previous.len();
        self.commit_locked(Vec::new(), previous).await?;
        tracing::info!(count, "All participants removed");
        Ok(count)
    }

    /// Exact match on the canonical phone first, then on the last ten digits.
    pub async fn find_by_phone(&self, phone: &str) -> Option<TicketLookup> {
        let wanted = canonical_phone(phone);
        let participants = self.list(false).await;
        let by_phone = participants
            .iter()
            .map(|p| (p, p.canonical_phone()))
            .collect::<Vec<_>>();

        by_phone
            .iter()
            .find(|(_, canonical)| *canonical == wanted)
            .or_else(|| {
                by_phone
                    .iter()
                    .find(|(_, canonical)| same_subscriber(canonical, &wanted))
            })
            .map(|(p, _)| TicketLookup {
                ticket_number: p.ticket_number,
                full_name: p.full_name.clone(),
            })
    }

    async fn current_locked(&self) -> Vec<Participant> {
        match self.cached() {
            Some(p) => p,
            None => self.reload_locked().await,
        }
    }

    async fn reload_locked(&self) -> Vec<Participant> {
        let (mut participants, source) = self.fetch().await;
        for p in &mut participants {
            p.repair_encoding();
        }
        tracing::info!(count = participants.len(), source = ?source, "Loaded participants");
        self.set_cache(Some(participants.clone()));
        participants
    }

    /// A non-empty remote list wins. An empty remote file (fresh remote
    /// layout) never hides a non-empty local file.
    async fn fetch(&self) -> (Vec<Participant>, LoadSource) {
        let policy = self.settings.load().await.backup_settings;
        let mut remote_empty = false;
        if let Some(token) = policy.credential() {
            match self.fetch_remote(token).await {
                Ok(Some(list)) if !list.is_empty() => return (list, LoadSource::Remote),
                Ok(Some(_)) => {
                    tracing::info!(path = %self.remote_path, "Remote participant file is empty, checking local copy");
                    remote_empty = true;
                }
                Ok(None) => tracing::info!(path = %self.remote_path, "No participant file in remote storage"),
                Err(e) => tracing::warn!(error = %e, "Failed to load participants from remote storage"),
            }
        }

        let fallback = if remote_empty { LoadSource::Remote } else { LoadSource::Empty };
        match self.local.read().await {
            Ok(Some(list)) if !list.is_empty() => (list, LoadSource::Local),
            Ok(Some(list)) => (list, fallback),
            Ok(None) => (Vec::new(), fallback),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load participants from local storage");
                (Vec::new(), fallback)
            }
        }
    }

    async fn fetch_remote(&self, token: &str) -> Result<Option<Vec<Participant>>, RemoteError> {
        if !self.remote.exists(token, &self.remote_path).await? {
            return Ok(None);
        }
        let body = self.remote.download(token, &self.remote_path).await?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| RemoteError::Protocol(format!("participant file: {e}")))
    }

    /// Publishes `updated` to readers, persists it locally and then pushes it
    /// to remote storage. A local write failure restores `previous`; remote
    /// failures are only logged.
    async fn commit_locked(
        &self,
        updated: Vec<Participant>,
        previous: Vec<Participant>,
    ) -> Result<(), StorageError> {
        self.set_cache(Some(updated.clone()));

        if let Err(e) = self.local.write(&updated).await {
            self.set_cache(Some(previous));
            return Err(e);
        }

        self.push_remote(&updated).await;
        Ok(())
    }

    async fn push_remote(&self, participants: &[Participant]) {
        let policy = self.settings.load().await.backup_settings;
        let Some(token) = policy.credential() else {
            return;
        };
        let body = match serde_json::to_vec_pretty(participants) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode participants for remote storage");
                return;
            }
        };
        match self.remote.upload(token, &self.remote_path, body).await {
            Ok(()) => tracing::info!(count = participants.len(), "Participants saved to remote storage"),
            Err(e) => tracing::error!(error = %e, "Failed to save participants to remote storage"),
        }
    }

    fn cached(&self) -> Option<Vec<Participant>> {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_cache(&self, value: Option<Vec<Participant>>) {
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

pub fn next_ticket_number(participants: &[Participant]) -> u64 {
    participants.iter().map(|p| p.ticket_number).max().unwrap_or(0) + 1
}
