//! In-memory collaborators and fixtures shared by the unit tests.

use crate::clock::Clock;
use crate::geo::{GeoError, GeoLocator, GeoService, DEFAULT_IP_CACHE_TTL};
use crate::models::participant::{GeoInfo, NewParticipant, Participant};
use crate::models::settings::{BackupPolicy, Settings, TIMESTAMP_FORMAT};
use crate::remote::{FolderStatus, RemoteError, RemoteStorage};
use crate::services::backup::BackupService;
use crate::services::participants::ParticipantRepository;
use crate::services::settings_store::{SettingsStore, DEFAULT_TTL};
use crate::services::signal::ReconfigureSignal;
use crate::storage::{DocumentStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{NaiveDateTime, TimeDelta};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const START: &str = "2024-01-01 04:00:00";
pub const TOKEN: &str = "test-token";

pub fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
}

// ── Clock ──

pub struct ManualClock(Mutex<NaiveDateTime>);

impl ManualClock {
    pub fn new(s: &str) -> Self {
        Self(Mutex::new(at(s)))
    }

    pub fn advance(&self, by: TimeDelta) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.0.lock().unwrap()
    }
}

// ── Document store ──

pub struct MemoryStore<T> {
    doc: Mutex<Option<T>>,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub fail_writes: AtomicBool,
    pub corrupt: AtomicBool,
}

impl<T: Clone> MemoryStore<T> {
    pub fn new(doc: Option<T>) -> Self {
        Self {
            doc: Mutex::new(doc),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            corrupt: AtomicBool::new(false),
        }
    }

    pub fn set(&self, doc: T) {
        *self.doc.lock().unwrap() = Some(doc);
    }

    pub fn current(&self) -> Option<T> {
        self.doc.lock().unwrap().clone()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> DocumentStore<T> for MemoryStore<T> {
    async fn read(&self) -> Result<Option<T>, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.corrupt.load(Ordering::SeqCst) {
            let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
            return Err(StorageError::Corrupt {
                path: PathBuf::from("memory"),
                source,
            });
        }
        Ok(self.current())
    }

    async fn write(&self, doc: &T) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io {
                path: PathBuf::from("memory"),
                source: std::io::Error::other("disk full"),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.doc.lock().unwrap() = Some(doc.clone());
        Ok(())
    }
}

// ── Remote storage ──

/// Remote storage kept in maps. Upload and download handles are
/// `mem://<path>`.
#[derive(Default)]
pub struct MemoryRemote {
    pub files: Mutex<HashMap<String, Bytes>>,
    pub folders: Mutex<HashSet<String>>,
    uploads: Mutex<Vec<String>>,
    upload_delay: Mutex<Duration>,
    /// Every call fails as if the service were unreachable.
    pub fail_all: AtomicBool,
    /// Only upload handles fail.
    pub fail_uploads: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = delay;
    }

    /// Paths of completed uploads, in order.
    pub fn uploaded_paths(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn put_json<T: Serialize>(&self, path: &str, value: &T) {
        let body = serde_json::to_vec(value).unwrap();
        self.files.lock().unwrap().insert(path.into(), Bytes::from(body));
    }

    pub fn get_json<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        let files = self.files.lock().unwrap();
        files.get(path).map(|b| serde_json::from_slice(b).unwrap())
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

fn handle_path(url: &str) -> Result<&str, RemoteError> {
    url.strip_prefix("mem://")
        .ok_or_else(|| RemoteError::Protocol(format!("unknown handle {url}")))
}

#[async_trait]
impl RemoteStorage for MemoryRemote {
    async fn exists(&self, _token: &str, path: &str) -> Result<bool, RemoteError> {
        self.check()?;
        Ok(self.files.lock().unwrap().contains_key(path)
            || self.folders.lock().unwrap().contains(path))
    }

    async fn create_folder(&self, _token: &str, path: &str) -> Result<FolderStatus, RemoteError> {
        self.check()?;
        if self.folders.lock().unwrap().insert(path.to_string()) {
            Ok(FolderStatus::Created)
        } else {
            Ok(FolderStatus::AlreadyExists)
        }
    }

    async fn upload_handle(
        &self,
        _token: &str,
        path: &str,
        _overwrite: bool,
    ) -> Result<String, RemoteError> {
        self.check()?;
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(RemoteError::Status {
                status: 507,
                message: "insufficient storage".into(),
            });
        }
        Ok(format!("mem://{path}"))
    }

    async fn put_bytes(&self, url: &str, body: Bytes) -> Result<(), RemoteError> {
        self.check()?;
        let path = handle_path(url)?.to_string();
        let delay = *self.upload_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.files.lock().unwrap().insert(path.clone(), body);
        self.uploads.lock().unwrap().push(path);
        Ok(())
    }

    async fn download_handle(&self, _token: &str, path: &str) -> Result<String, RemoteError> {
        self.check()?;
        if !self.files.lock().unwrap().contains_key(path) {
            return Err(RemoteError::Status {
                status: 404,
                message: "not found".into(),
            });
        }
        Ok(format!("mem://{path}"))
    }

    async fn get_bytes(&self, url: &str) -> Result<Bytes, RemoteError> {
        self.check()?;
        let path = handle_path(url)?;
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::Status {
                status: 404,
                message: "not found".into(),
            })
    }
}

// ── Geolocation ──

/// `203.0.113.7` is in Makhachkala, other addresses fail. Points south of
/// 45°N are in Kaspiysk, the rest in Moscow.
pub struct FixedLocator;

#[async_trait]
impl GeoLocator for FixedLocator {
    async fn locate_ip(&self, ip: &str) -> Result<Option<GeoInfo>, GeoError> {
        match ip {
            "203.0.113.7" => Ok(Some(GeoInfo {
                city: Some("Махачкала".into()),
                region: Some("Дагестан".into()),
                country: Some("Россия".into()),
                ..Default::default()
            })),
            _ => Err(GeoError::Transport("connection refused".into())),
        }
    }

    async fn reverse(&self, lat: f64, _lng: f64) -> Result<Option<GeoInfo>, GeoError> {
        let city = if lat < 45.0 { "Каспийск" } else { "Москва" };
        Ok(Some(GeoInfo {
            city: Some(city.into()),
            ..Default::default()
        }))
    }
}

pub fn geo_service() -> GeoService {
    GeoService::new(Arc::new(FixedLocator), false, DEFAULT_IP_CACHE_TTL)
}

// ── Fixtures ──

pub fn participant(ticket: u64, phone: &str) -> Participant {
    Participant {
        ticket_number: ticket,
        full_name: "Иван Петров".into(),
        phone: phone.into(),
        age: 30,
        gender: "male".into(),
        registration_time: "2024-01-01 10:00:00".into(),
        ip_address: None,
        location: None,
        coordinates: None,
        extra: Default::default(),
    }
}

pub fn new_participant(name: &str, phone: &str) -> NewParticipant {
    NewParticipant {
        full_name: name.into(),
        phone: phone.into(),
        age: 25,
        gender: "female".into(),
        latitude: None,
        longitude: None,
        ip_address: Some("127.0.0.1".into()),
        location: None,
        place: None,
    }
}

/// Fully wired services over in-memory collaborators, clock at [`START`].
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub local: Arc<MemoryStore<Vec<Participant>>>,
    pub remote: Arc<MemoryRemote>,
    pub signal: Arc<ReconfigureSignal>,
    pub settings: Arc<SettingsStore>,
    pub participants: Arc<ParticipantRepository>,
    pub backup: Arc<BackupService>,
    pub geo: GeoService,
}

impl Harness {
    /// Backups enabled with a token when `with_token`, otherwise defaults.
    pub fn new(with_token: bool) -> Self {
        let policy = if with_token {
            BackupPolicy {
                enabled: true,
                yandex_token: TOKEN.into(),
                ..Default::default()
            }
        } else {
            BackupPolicy::default()
        };
        Self::with_policy(policy)
    }

    pub fn with_policy(policy: BackupPolicy) -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let settings_doc = Arc::new(MemoryStore::new(Some(Settings {
            backup_settings: policy,
            ..Default::default()
        })));
        let local: Arc<MemoryStore<Vec<Participant>>> = Arc::new(MemoryStore::new(None));
        let remote = Arc::new(MemoryRemote::new());
        let signal = Arc::new(ReconfigureSignal::new());

        let settings = Arc::new(SettingsStore::new(
            settings_doc,
            DEFAULT_TTL,
            signal.clone(),
        ));
        let participants = Arc::new(ParticipantRepository::new(
            local.clone(),
            remote.clone(),
            settings.clone(),
            "app:/participants.json",
            clock.clone(),
        ));
        let backup = Arc::new(BackupService::new(
            participants.clone(),
            settings.clone(),
            remote.clone(),
            clock.clone(),
            "/registration_backup",
        ));

        Self {
            clock,
            local,
            remote,
            signal,
            settings,
            participants,
            backup,
            geo: geo_service(),
        }
    }
}
