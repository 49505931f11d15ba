use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub settings_file: PathBuf,
    pub participants_file: PathBuf,
    pub admin_token: Option<String>,
    pub log_level: String,
    pub remote_api_url: String,
    pub remote_timeout: Duration,
    pub remote_participants_path: String,
    pub backup_folder: String,
    pub backup_on_startup: bool,
    pub settings_cache_ttl: Duration,
    pub allow_all_locations: bool,
    pub geo_ip_api_url: String,
    pub geo_reverse_url: String,
    pub geo_timeout: Duration,
    pub geo_ip_cache_ttl: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".into()));

        Self {
            port: env_parse("PORT").unwrap_or(5000),
            settings_file: std::env::var("SETTINGS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("settings.json")),
            participants_file: std::env::var("PARTICIPANTS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("participants.json")),
            data_dir,
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            remote_api_url: std::env::var("REMOTE_API_URL")
                .unwrap_or_else(|_| "https://cloud-api.yandex.net/v1/disk".into()),
            remote_timeout: Duration::from_secs(env_parse("REMOTE_TIMEOUT_SECS").unwrap_or(30)),
            remote_participants_path: std::env::var("REMOTE_PARTICIPANTS_PATH")
                .unwrap_or_else(|_| "app:/participants.json".into()),
            backup_folder: std::env::var("BACKUP_FOLDER")
                .unwrap_or_else(|_| "/registration_backup".into()),
            backup_on_startup: env_parse("BACKUP_ON_STARTUP").unwrap_or(true),
            settings_cache_ttl: Duration::from_secs(
                env_parse("SETTINGS_CACHE_TTL_SECS").unwrap_or(60),
            ),
            allow_all_locations: env_parse("ALLOW_ALL_LOCATIONS").unwrap_or(false),
            geo_ip_api_url: std::env::var("GEO_IP_API_URL")
                .unwrap_or_else(|_| "http://ip-api.com/json".into()),
            geo_reverse_url: std::env::var("GEO_REVERSE_URL")
                .unwrap_or_else(|_| "https://nominatim.openstreetmap.org/reverse".into()),
            geo_timeout: Duration::from_secs(env_parse("GEO_TIMEOUT_SECS").unwrap_or(3)),
            geo_ip_cache_ttl: Duration::from_secs(
                env_parse("GEO_IP_CACHE_TTL_SECS").unwrap_or(3600),
            ),
        }
    }

    /// Configuration rooted in `data_dir`, with no admin token and no startup backup.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            port: 5000,
            settings_file: data_dir.join("settings.json"),
            participants_file: data_dir.join("participants.json"),
            data_dir,
            admin_token: None,
            log_level: "info".into(),
            remote_api_url: "https://cloud-api.yandex.net/v1/disk".into(),
            remote_timeout: Duration::from_secs(30),
            remote_participants_path: "app:/participants.json".into(),
            backup_folder: "/registration_backup".into(),
            backup_on_startup: false,
            settings_cache_ttl: Duration::from_secs(60),
            allow_all_locations: false,
            geo_ip_api_url: "http://ip-api.com/json".into(),
            geo_reverse_url: "https://nominatim.openstreetmap.org/reverse".into(),
            geo_timeout: Duration::from_secs(3),
            geo_ip_cache_ttl: Duration::from_secs(3600),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
