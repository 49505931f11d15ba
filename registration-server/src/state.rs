use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::geo::{GeoLocator, GeoService, HttpGeoLocator};
use crate::models::participant::Participant;
use crate::models::settings::Settings;
use crate::remote::{RemoteStorage, YandexDisk};
use crate::services::backup::BackupService;
use crate::services::backup_scheduler::BackupScheduler;
use crate::services::participants::ParticipantRepository;
use crate::services::settings_store::SettingsStore;
use crate::services::signal::ReconfigureSignal;
use crate::storage::{DocumentStore, JsonFileStore};
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub settings: Arc<SettingsStore>,
    pub participants: Arc<ParticipantRepository>,
    pub backup: Arc<BackupService>,
    pub scheduler: Arc<BackupScheduler>,
    pub geo: Arc<GeoService>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// JSON files under the configured paths, the Yandex.Disk and
    /// geolocation clients and the system clock.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let remote = YandexDisk::new(config.remote_api_url.clone(), config.remote_timeout)?;
        let locator = HttpGeoLocator::new(
            config.geo_ip_api_url.clone(),
            config.geo_reverse_url.clone(),
            config.geo_timeout,
        )?;
        let settings_store = Arc::new(JsonFileStore::<Settings>::new(&config.settings_file));
        let participant_store =
            Arc::new(JsonFileStore::<Vec<Participant>>::new(&config.participants_file));
        Ok(Self::with_collaborators(
            config,
            settings_store,
            participant_store,
            Arc::new(remote),
            Arc::new(locator),
            Arc::new(SystemClock),
        ))
    }

    pub fn with_collaborators(
        config: AppConfig,
        settings_store: Arc<dyn DocumentStore<Settings>>,
        participant_store: Arc<dyn DocumentStore<Vec<Participant>>>,
        remote: Arc<dyn RemoteStorage>,
        locator: Arc<dyn GeoLocator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let signal = Arc::new(ReconfigureSignal::new());
        let settings = Arc::new(SettingsStore::new(
            settings_store,
            config.settings_cache_ttl,
            signal.clone(),
        ));
        let participants = Arc::new(ParticipantRepository::new(
            participant_store,
            remote.clone(),
            settings.clone(),
            config.remote_participants_path.clone(),
            clock.clone(),
        ));
        let backup = Arc::new(BackupService::new(
            participants.clone(),
            settings.clone(),
            remote,
            clock.clone(),
            config.backup_folder.clone(),
        ));
        let scheduler = Arc::new(BackupScheduler::new(
            backup.clone(),
            settings.clone(),
            signal,
            clock.clone(),
        ));
        let geo = Arc::new(GeoService::new(
            locator,
            config.allow_all_locations,
            config.geo_ip_cache_ttl,
        ));

        Self {
            config,
            settings,
            participants,
            backup,
            scheduler,
            geo,
            clock,
        }
    }
}
