use crate::encoding::repair_text;
use serde::{Deserialize, Serialize};

/// Minimum digit count for a complete national number.
pub const MIN_PHONE_DIGITS: usize = 11;

// ── Participant ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub ticket_number: u64,
    pub full_name: String,
    pub phone: String,
    #[serde(default)]
    pub age: u32,
    #[serde(default = "default_gender")]
    pub gender: String,
    #[serde(default)]
    pub registration_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<GeoInfo>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_gender() -> String {
    "male".to_string()
}

impl Participant {
    /// City from the browser coordinates, falling back to the IP lookup.
    pub fn city(&self) -> Option<&str> {
        [&self.coordinates, &self.location]
            .into_iter()
            .flatten()
            .filter_map(|geo| geo.city.as_deref())
            .find(|c| !c.is_empty())
    }

    pub fn canonical_phone(&self) -> String {
        canonical_phone(&self.phone)
    }

    /// Runs every text field through [`repair_text`].
    pub fn repair_encoding(&mut self) {
        repair_in_place(&mut self.full_name);
        repair_in_place(&mut self.phone);
        repair_in_place(&mut self.gender);
        repair_in_place(&mut self.registration_time);
        if let Some(ip) = self.ip_address.as_mut() {
            repair_in_place(ip);
        }
        for geo in [self.location.as_mut(), self.coordinates.as_mut()].into_iter().flatten() {
            geo.repair_encoding();
        }
        repair_json_map(&mut self.extra);
    }
}

impl GeoInfo {
    fn repair_encoding(&mut self) {
        for field in [&mut self.city, &mut self.region, &mut self.country].into_iter().flatten() {
            repair_in_place(field);
        }
        repair_json_map(&mut self.extra);
    }
}

fn repair_in_place(text: &mut String) {
    if let std::borrow::Cow::Owned(fixed) = repair_text(text) {
        *text = fixed;
    }
}

fn repair_json_map(map: &mut serde_json::Map<String, serde_json::Value>) {
    for value in map.values_mut() {
        match value {
            serde_json::Value::String(s) => repair_in_place(s),
            serde_json::Value::Object(nested) => repair_json_map(nested),
            _ => {}
        }
    }
}

// ── Registration input ──

#[derive(Debug, Clone, Deserialize)]
pub struct NewParticipant {
    pub full_name: String,
    pub phone: String,
    #[serde(default)]
    pub age: u32,
    #[serde(default = "default_gender")]
    pub gender: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(skip)]
    pub ip_address: Option<String>,
    /// Resolved from `ip_address` before the participant is stored.
    #[serde(skip)]
    pub location: Option<GeoInfo>,
    /// Reverse-geocoded place for `latitude`/`longitude`.
    #[serde(skip)]
    pub place: Option<GeoInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TicketLookup {
    pub ticket_number: u64,
    pub full_name: String,
}

// ── Phone numbers ──

pub fn digits_only(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

/// Digits only, with an 11-digit leading `8` rewritten to the `7` country code.
pub fn canonical_phone(phone: &str) -> String {
    let digits = digits_only(phone);
    if digits.len() == MIN_PHONE_DIGITS && digits.starts_with('8') {
        format!("7{}", &digits[1..])
    } else {
        digits
    }
}

/// Canonical form of a phone entered at registration, `None` if incomplete.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let canonical = canonical_phone(phone);
    (canonical.len() >= MIN_PHONE_DIGITS).then_some(canonical)
}

/// Same subscriber written with different national prefixes.
pub fn same_subscriber(a: &str, b: &str) -> bool {
    a.len() >= 10 && b.len() >= 10 && a[a.len() - 10..] == b[b.len() - 10..]
}
