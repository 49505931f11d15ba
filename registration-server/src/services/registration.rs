use crate::geo::GeoService;
use crate::models::participant::{NewParticipant, Participant};
use crate::services::backup::BackupService;
use crate::services::participants::{ParticipantError, ParticipantRepository};
use crate::services::settings_store::SettingsStore;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct Registration {
    pub participant: Participant,
    /// Post-registration snapshot, when automatic backups are on.
    pub backup: Option<JoinHandle<()>>,
}

/// Locates the registrant, appends them and, with automatic backups
/// enabled, starts a background snapshot without waiting for it.
///
/// Lookups run before the participant list is locked; a failed lookup only
/// leaves the location empty.
pub async fn register(
    participants: &ParticipantRepository,
    settings: &SettingsStore,
    backup: &Arc<BackupService>,
    geo: &GeoService,
    mut new: NewParticipant,
) -> Result<Registration, ParticipantError> {
    if let Some(ip) = new.ip_address.as_deref() {
        new.location = geo.ip_location(ip).await;
    }
    if let (Some(lat), Some(lng)) = (new.latitude, new.longitude) {
        new.place = geo.coordinates_location(lat, lng).await;
    }

    let participant = participants.append(new).await?;

    let policy = settings.load().await.backup_settings;
    let backup = (policy.enabled && policy.credential().is_some()).then(|| {
        tracing::debug!(ticket = participant.ticket_number, "Starting post-registration backup");
        backup.spawn_one_off()
    });

    Ok(Registration {
        participant,
        backup,
    })
}
