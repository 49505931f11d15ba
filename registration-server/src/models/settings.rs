use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

/// Wall-clock format used for `last_backup` and registration times.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const DEFAULT_WHATSAPP_LINK: &str = "https://chat.whatsapp.com/EIa4wkifsVQDttzjOKlOY3";

// ── Settings document ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_whatsapp_link")]
    pub whatsapp_link: String,
    #[serde(default)]
    pub backup_settings: BackupPolicy,
    /// Keys written by other tools are carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_whatsapp_link() -> String {
    DEFAULT_WHATSAPP_LINK.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            whatsapp_link: default_whatsapp_link(),
            backup_settings: BackupPolicy::default(),
            extra: serde_json::Map::new(),
        }
    }
}

// ── Backup policy ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalKind {
    #[default]
    Daily,
    Hourly,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomUnit {
    Seconds,
    Minutes,
    #[default]
    Hours,
    Days,
    Weeks,
}

impl CustomUnit {
    pub fn seconds(self) -> i64 {
        match self {
            CustomUnit::Seconds => 1,
            CustomUnit::Minutes => 60,
            CustomUnit::Hours => 3_600,
            CustomUnit::Days => 86_400,
            CustomUnit::Weeks => 604_800,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CustomUnit::Seconds => "seconds",
            CustomUnit::Minutes => "minutes",
            CustomUnit::Hours => "hours",
            CustomUnit::Days => "days",
            CustomUnit::Weeks => "weeks",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupPolicy {
    pub enabled: bool,
    pub yandex_token: String,
    pub interval: IntervalKind,
    pub custom_value: u32,
    pub custom_unit: CustomUnit,
    pub last_backup: Option<String>,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            yandex_token: String::new(),
            interval: IntervalKind::Daily,
            custom_value: 24,
            custom_unit: CustomUnit::Hours,
            last_backup: None,
        }
    }
}

impl BackupPolicy {
    pub fn credential(&self) -> Option<&str> {
        let token = self.yandex_token.trim();
        (!token.is_empty()).then_some(token)
    }

    /// `None` when no backup was recorded or the stored value does not parse.
    pub fn last_backup_time(&self) -> Option<NaiveDateTime> {
        self.last_backup
            .as_deref()
            .and_then(|s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok())
    }

    /// Saturates at [`TimeDelta::MAX`] for values past chrono's range.
    pub fn custom_interval(&self) -> TimeDelta {
        TimeDelta::try_seconds(i64::from(self.custom_value) * self.custom_unit.seconds())
            .unwrap_or(TimeDelta::MAX)
    }

    /// True when `other` schedules backups differently from `self`.
    pub fn schedule_differs(&self, other: &BackupPolicy) -> bool {
        self.enabled != other.enabled
            || self.interval != other.interval
            || self.custom_value != other.custom_value
            || self.custom_unit != other.custom_unit
    }
}

// ── Requests ──

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyUpdate {
    pub enabled: bool,
    #[serde(default)]
    pub yandex_token: String,
    #[serde(default)]
    pub interval: IntervalKind,
    #[serde(default = "default_custom_value")]
    pub custom_value: i64,
    #[serde(default)]
    pub custom_unit: CustomUnit,
}

fn default_custom_value() -> i64 {
    24
}

impl PolicyUpdate {
    /// Returns the validated custom value.
    pub fn validate(&self) -> Result<u32, String> {
        if self.custom_value <= 0 {
            return Err("Interval must be a positive number".into());
        }
        let value = u32::try_from(self.custom_value)
            .map_err(|_| "Interval is too large".to_string())?;
        if self.enabled && self.yandex_token.trim().is_empty() {
            return Err("A remote storage token is required to enable backups".into());
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"whatsapp_link": "https://example.org/chat"}"#).unwrap();
        assert_eq!(settings.whatsapp_link, "https://example.org/chat");
        assert_eq!(settings.backup_settings, BackupPolicy::default());

        let settings: Settings = serde_json::from_str(
            r#"{"backup_settings": {"enabled": true, "interval": "custom", "custom_unit": "minutes"}}"#,
        )
        .unwrap();
        assert!(settings.backup_settings.enabled);
        assert_eq!(settings.backup_settings.interval, IntervalKind::Custom);
        assert_eq!(settings.backup_settings.custom_value, 24);
        assert_eq!(settings.whatsapp_link, DEFAULT_WHATSAPP_LINK);
    }

    #[test]
    fn test_unknown_keys_survive_round_trip() {
        let settings: Settings =
            serde_json::from_str(r#"{"theme": "dark", "backup_settings": {}}"#).unwrap();
        let out = serde_json::to_value(&settings).unwrap();
        assert_eq!(out["theme"], "dark");
    }

    #[test]
    fn test_last_backup_time_parsing() {
        let mut policy = BackupPolicy {
            last_backup: Some("2024-01-01 10:00:00".into()),
            ..Default::default()
        };
        assert!(policy.last_backup_time().is_some());

        policy.last_backup = Some("yesterday".into());
        assert!(policy.last_backup_time().is_none());
    }

    #[test]
    fn test_custom_interval() {
        let policy = BackupPolicy {
            custom_value: 2,
            custom_unit: CustomUnit::Weeks,
            ..Default::default()
        };
        assert_eq!(policy.custom_interval(), TimeDelta::days(14));
    }

    #[test]
    fn test_policy_update_validation() {
        let mut update = PolicyUpdate {
            enabled: true,
            yandex_token: "token".into(),
            interval: IntervalKind::Custom,
            custom_value: 30,
            custom_unit: CustomUnit::Minutes,
        };
        assert_eq!(update.validate(), Ok(30));

        update.custom_value = 0;
        assert!(update.validate().is_err());

        update.custom_value = 5;
        update.yandex_token = "  ".into();
        assert!(update.validate().is_err());

        update.enabled = false;
        assert_eq!(update.validate(), Ok(5));
    }

    #[test]
    fn test_schedule_differs_ignores_last_backup() {
        let a = BackupPolicy::default();
        let b = BackupPolicy {
            last_backup: Some("2024-01-01 10:00:00".into()),
            ..Default::default()
        };
        assert!(!a.schedule_differs(&b));

        let c = BackupPolicy {
            interval: IntervalKind::Hourly,
            ..Default::default()
        };
        assert!(a.schedule_differs(&c));
    }
}
