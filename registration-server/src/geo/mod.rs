//! Where a registrant is: IP geolocation, reverse geocoding of browser
//! coordinates, and the whitelist of cities the raffle is open to.

pub mod http;

use crate::encoding::repair_text;
use crate::models::participant::GeoInfo;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub use http::HttpGeoLocator;

pub const DEFAULT_IP_CACHE_TTL: Duration = Duration::from_secs(3600);

/// City names as the lookup services report them, lower-cased.
pub const ALLOWED_CITIES: &[&str] = &[
    // Cities
    "махачкала",
    "каспийск",
    // City districts
    "кировский район",
    "ленинский район",
    "советский район",
    // Kirovsky district settlements
    "ленинкент",
    "семендер",
    "сулак",
    "шамхал",
    "богатырёвка",
    "красноармейское",
    "остров чечень",
    "шамхал-термен",
    // Leninsky district settlements
    "новый кяхулай",
    "новый хушет",
    "талги",
    // Sovetsky district settlements
    "альбурикент",
    "кяхулай",
    "тарки",
    // Neighbourhoods
    "5-й посёлок",
    "5 посёлок",
    "каменный карьер",
    "афган-городок",
    "кемпинг",
    "кирпичный",
    "ккоз",
    "тау",
    "центральный",
    "южный",
    "рекреационная зона",
    "финский квартал",
    "турали",
];

#[derive(thiserror::Error, Debug)]
pub enum GeoError {
    #[error("geolocation service returned {0}")]
    Status(u16),

    #[error("geolocation request timed out")]
    Timeout,

    #[error("geolocation request failed: {0}")]
    Transport(String),

    #[error("unexpected geolocation response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for GeoError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GeoError::Timeout
        } else {
            GeoError::Transport(e.to_string())
        }
    }
}

/// External lookups. `Ok(None)` means the service answered but could not
/// place the address or point.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn locate_ip(&self, ip: &str) -> Result<Option<GeoInfo>, GeoError>;

    async fn reverse(&self, lat: f64, lng: f64) -> Result<Option<GeoInfo>, GeoError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationCheck {
    pub allowed: bool,
    pub city: String,
}

/// Lookups with city normalization, a TTL cache for IP results and the
/// whitelist decision. Lookup failures are logged and read as "unknown".
pub struct GeoService {
    locator: Arc<dyn GeoLocator>,
    allow_all: bool,
    ttl: Duration,
    ip_cache: Mutex<HashMap<String, (Instant, GeoInfo)>>,
}

impl GeoService {
    pub fn new(locator: Arc<dyn GeoLocator>, allow_all: bool, ttl: Duration) -> Self {
        Self {
            locator,
            allow_all,
            ttl,
            ip_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_allowed(&self, city: &str) -> bool {
        self.allow_all || ALLOWED_CITIES.contains(&city.trim().to_lowercase().as_str())
    }

    /// Location for a client address. Loopback addresses are never looked up.
    pub async fn ip_location(&self, ip: &str) -> Option<GeoInfo> {
        if is_loopback(ip) {
            return None;
        }
        if let Some(hit) = self.cached(ip) {
            return Some(hit);
        }

        match self.locator.locate_ip(ip).await {
            Ok(Some(mut geo)) => {
                normalize_city(&mut geo);
                self.store(ip, geo.clone());
                Some(geo)
            }
            Ok(None) => {
                tracing::debug!(ip, "IP address could not be located");
                None
            }
            Err(e) => {
                tracing::warn!(ip, error = %e, "IP geolocation failed");
                None
            }
        }
    }

    /// Reverse-geocoded place for browser coordinates, carrying the
    /// coordinates themselves.
    pub async fn coordinates_location(&self, lat: f64, lng: f64) -> Option<GeoInfo> {
        match self.locator.reverse(lat, lng).await {
            Ok(Some(mut geo)) => {
                normalize_city(&mut geo);
                geo.lat = Some(lat);
                geo.lng = Some(lng);
                Some(geo)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(lat, lng, error = %e, "Reverse geocoding failed");
                None
            }
        }
    }

    /// Loopback clients are always allowed so the form works locally.
    pub async fn check_ip(&self, ip: &str) -> Option<LocationCheck> {
        if is_loopback(ip) {
            return Some(LocationCheck {
                allowed: true,
                city: "localhost".into(),
            });
        }
        let geo = self.ip_location(ip).await?;
        Some(self.check(geo))
    }

    pub async fn check_coordinates(&self, lat: f64, lng: f64) -> Option<LocationCheck> {
        let geo = self.coordinates_location(lat, lng).await?;
        Some(self.check(geo))
    }

    fn check(&self, geo: GeoInfo) -> LocationCheck {
        let city = geo.city.unwrap_or_default();
        LocationCheck {
            allowed: self.is_allowed(&city),
            city,
        }
    }

    fn cached(&self, ip: &str) -> Option<GeoInfo> {
        let cache = self.ip_cache.lock().ok()?;
        cache
            .get(ip)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, geo)| geo.clone())
    }

    fn store(&self, ip: &str, geo: GeoInfo) {
        if let Ok(mut cache) = self.ip_cache.lock() {
            let ttl = self.ttl;
            cache.retain(|_, (at, _)| at.elapsed() < ttl);
            cache.insert(ip.to_string(), (Instant::now(), geo));
        }
    }
}

fn is_loopback(ip: &str) -> bool {
    ip.parse::<IpAddr>().is_ok_and(|a| a.is_loopback())
}

fn normalize_city(geo: &mut GeoInfo) {
    geo.city = geo
        .city
        .take()
        .map(|c| repair_text(c.trim()).to_lowercase())
        .filter(|c| !c.is_empty());
}
