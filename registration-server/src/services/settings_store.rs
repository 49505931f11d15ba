use crate::models::settings::{PolicyUpdate, Settings, TIMESTAMP_FORMAT};
use crate::services::signal::ReconfigureSignal;
use crate::storage::{DocumentStore, StorageError};
use chrono::NaiveDateTime;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

struct CachedSettings {
    value: Settings,
    loaded_at: Instant,
}

/// Settings document with a TTL read cache and write-through updates.
///
/// Every storage access goes through `lock`; the cache itself sits behind a
/// plain mutex that is never held across an await.
pub struct SettingsStore {
    store: Arc<dyn DocumentStore<Settings>>,
    cache: Mutex<Option<CachedSettings>>,
    lock: tokio::sync::Mutex<()>,
    ttl: Duration,
    signal: Arc<ReconfigureSignal>,
}

impl SettingsStore {
    pub fn new(
        store: Arc<dyn DocumentStore<Settings>>,
        ttl: Duration,
        signal: Arc<ReconfigureSignal>,
    ) -> Self {
        Self {
            store,
            cache: Mutex::new(None),
            lock: tokio::sync::Mutex::new(()),
            ttl,
            signal,
        }
    }

    /// Current settings. Never fails: unreadable storage yields defaults.
    pub async fn load(&self) -> Settings {
        if let Some(s) = self.cached() {
            return s;
        }
        let _guard = self.lock.lock().await;
        if let Some(s) = self.cached() {
            return s;
        }
        self.refresh_locked().await
    }

    /// Persists `settings`; the cache is only replaced once the write succeeded.
    pub async fn save(&self, settings: Settings) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        self.store.write(&settings).await?;
        self.put_cache(settings);
        Ok(())
    }

    /// Writes the default document when storage holds none. Returns whether
    /// it did.
    pub async fn ensure_initialized(&self) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        match self.store.read().await {
            Ok(Some(settings)) => {
                self.put_cache(settings);
                Ok(false)
            }
            Ok(None) => {
                let settings = Settings::default();
                self.store.write(&settings).await?;
                self.put_cache(settings);
                tracing::info!("Created default settings");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Settings unreadable at startup, leaving file untouched");
                Ok(false)
            }
        }
    }

    pub async fn update_policy(&self, update: PolicyUpdate) -> Result<Settings, PolicyError> {
        let custom_value = update.validate().map_err(PolicyError::Validation)?;

        let (settings, changed) = self
            .modify(|s| {
                let policy = &mut s.backup_settings;
                let before = policy.clone();
                policy.enabled = update.enabled;
                policy.yandex_token = update.yandex_token.trim().to_string();
                policy.interval = update.interval;
                policy.custom_value = custom_value;
                policy.custom_unit = update.custom_unit;
                before.schedule_differs(policy)
            })
            .await?;

        let policy = &settings.backup_settings;
        tracing::info!(
            enabled = policy.enabled,
            interval = ?policy.interval,
            custom_value = policy.custom_value,
            custom_unit = policy.custom_unit.label(),
            "Backup policy updated"
        );
        if changed {
            self.signal.raise();
        }
        Ok(settings)
    }

    pub async fn record_backup(&self, at: NaiveDateTime) -> Result<(), StorageError> {
        let stamp = at.format(TIMESTAMP_FORMAT).to_string();
        self.modify(|s| s.backup_settings.last_backup = Some(stamp.clone()))
            .await?;
        tracing::info!(last_backup = %stamp, "Recorded backup time");
        Ok(())
    }

    pub async fn update_whatsapp_link(&self, link: &str) -> Result<Settings, PolicyError> {
        let link = link.trim();
        if link.is_empty() {
            return Err(PolicyError::Validation("Link must not be empty".into()));
        }
        let (settings, _) = self.modify(|s| s.whatsapp_link = link.to_string()).await?;
        Ok(settings)
    }

    /// Read-modify-write under the settings lock.
    async fn modify<R>(
        &self,
        f: impl FnOnce(&mut Settings) -> R,
    ) -> Result<(Settings, R), StorageError> {
        let _guard = self.lock.lock().await;
        let mut settings = match self.cached() {
            Some(s) => s,
            None => self.refresh_locked().await,
        };
        let out = f(&mut settings);
        self.store.write(&settings).await?;
        self.put_cache(settings.clone());
        Ok((settings, out))
    }

    async fn refresh_locked(&self) -> Settings {
        let settings = match self.store.read().await {
            Ok(Some(s)) => s,
            Ok(None) => Settings::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Settings unreadable, using defaults");
                Settings::default()
            }
        };
        self.put_cache(settings.clone());
        settings
    }

    fn cached(&self) -> Option<Settings> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .as_ref()
            .filter(|c| c.loaded_at.elapsed() < self.ttl)
            .map(|c| c.value.clone())
    }

    fn put_cache(&self, value: Settings) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CachedSettings {
            value,
            loaded_at: Instant::now(),
        });
    }
}
