use crate::clock::Clock;
use crate::models::settings::{BackupPolicy, CustomUnit, IntervalKind};
use crate::services::backup::BackupService;
use crate::services::settings_store::SettingsStore;
use crate::services::signal::ReconfigureSignal;
use chrono::{DurationRound, NaiveDateTime, NaiveTime, TimeDelta};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Local hour of the daily backup.
pub const DAILY_BACKUP_HOUR: u32 = 3;

const RETRY_AFTER_MINUTES: i64 = 1;
const IDLE_POLL: Duration = Duration::from_secs(60);
const MAX_SLICE: Duration = Duration::from_secs(60);
const MIN_SLICE: Duration = Duration::from_secs(1);

// ── Schedule computation ──

fn daily_time() -> NaiveTime {
    NaiveTime::from_hms_opt(DAILY_BACKUP_HOUR, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn add(at: NaiveDateTime, delta: TimeDelta) -> NaiveDateTime {
    at.checked_add_signed(delta).unwrap_or(NaiveDateTime::MAX)
}

/// When the next backup is due under `policy`.
///
/// Daily and hourly results are strictly after `now`. A custom interval is
/// due `last_backup + interval`, which may already be in the past; without
/// a usable `last_backup` it is due `now`.
pub fn compute_next_due(policy: &BackupPolicy, now: NaiveDateTime) -> NaiveDateTime {
    match policy.interval {
        IntervalKind::Daily => {
            let today = now.date().and_time(daily_time());
            if now < today {
                today
            } else {
                add(today, TimeDelta::days(1))
            }
        }
        IntervalKind::Hourly => {
            let hour = now.duration_trunc(TimeDelta::hours(1)).unwrap_or(now);
            add(hour, TimeDelta::hours(1))
        }
        IntervalKind::Custom => match policy.last_backup_time() {
            Some(last) => add(last, policy.custom_interval()),
            None => now,
        },
    }
}

/// Sub-hour custom intervals run right away when the policy changes.
pub fn fires_on_reconfigure(policy: &BackupPolicy) -> bool {
    policy.interval == IntervalKind::Custom
        && matches!(policy.custom_unit, CustomUnit::Seconds | CustomUnit::Minutes)
}

/// How long one wait may last before the loop looks at the clock again.
pub fn wait_slice(policy: &BackupPolicy, remaining: Duration) -> Duration {
    match (policy.interval, policy.custom_unit) {
        (IntervalKind::Custom, CustomUnit::Seconds) => Duration::from_secs(1),
        (IntervalKind::Custom, CustomUnit::Minutes) => Duration::from_secs(5),
        _ => remaining.clamp(MIN_SLICE, MAX_SLICE),
    }
}

/// Human-readable estimate of the next backup for the admin panel.
pub fn describe_next_backup(policy: &BackupPolicy, now: NaiveDateTime) -> String {
    if !policy.enabled {
        return "Backups are disabled".into();
    }

    match policy.interval {
        IntervalKind::Daily => {
            let due = compute_next_due(policy, now);
            format!("At 03:00 on {}", due.format("%d.%m.%Y"))
        }
        IntervalKind::Hourly => {
            let due = compute_next_due(policy, now);
            format!("At {} on {}", due.format("%H:00"), due.format("%d.%m.%Y"))
        }
        IntervalKind::Custom => {
            if policy.last_backup.is_none() {
                return "On the next scheduler cycle".into();
            }
            let Some(last) = policy.last_backup_time() else {
                return "Unknown".into();
            };
            let due = add(last, policy.custom_interval());
            if due <= now {
                return "Soon".into();
            }

            let left = due - now;
            let (days, hours, minutes) = (
                left.num_days(),
                left.num_hours() % 24,
                left.num_minutes() % 60,
            );
            let when = due.format("%d.%m.%Y %H:%M");
            if days > 0 {
                format!("In {days} d. {hours} h. ({when})")
            } else if hours > 0 {
                format!("In {hours} h. {minutes} min. ({when})")
            } else {
                format!("In {minutes} min. ({when})")
            }
        }
    }
}

// ── Scheduler ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SchedulerPhase {
    Idle,
    Waiting { next_due: NaiveDateTime },
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub last_backup: Option<String>,
    pub next_backup: String,
    pub interval: IntervalKind,
    pub custom_value: u32,
    pub custom_unit: CustomUnit,
    pub phase: SchedulerPhase,
}

pub struct BackupScheduler {
    backup: Arc<BackupService>,
    settings: Arc<SettingsStore>,
    signal: Arc<ReconfigureSignal>,
    clock: Arc<dyn Clock>,
    phase: Mutex<SchedulerPhase>,
}

impl BackupScheduler {
    pub fn new(
        backup: Arc<BackupService>,
        settings: Arc<SettingsStore>,
        signal: Arc<ReconfigureSignal>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backup,
            settings,
            signal,
            clock,
            phase: Mutex::new(SchedulerPhase::Idle),
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    pub async fn status(&self) -> SchedulerStatus {
        let policy = self.settings.load().await.backup_settings;
        SchedulerStatus {
            enabled: policy.enabled,
            next_backup: describe_next_backup(&policy, self.clock.now()),
            last_backup: policy.last_backup,
            interval: policy.interval,
            custom_value: policy.custom_value,
            custom_unit: policy.custom_unit,
            phase: self.phase(),
        }
    }

    pub fn start(self: Arc<Self>, run_on_startup: bool, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if run_on_startup {
                self.startup_probe().await;
            }
            self.run(cancel).await;
        })
    }

    async fn startup_probe(&self) {
        let policy = self.settings.load().await.backup_settings;
        if !policy.enabled {
            return;
        }
        tracing::info!("Running startup backup");
        self.set_phase(SchedulerPhase::Running);
        if let Err(e) = self.backup.run_scheduled().await {
            tracing::warn!(error = %e, "Startup backup failed");
        }
        self.set_phase(SchedulerPhase::Idle);
    }

    /// Scheduling loop. Returns once `cancel` fires; snapshot failures only
    /// move the next attempt.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Backup scheduler started");
        let mut next_due: Option<NaiveDateTime> = None;

        while !cancel.is_cancelled() {
            let reconfigured = self.signal.take();
            let policy = self.settings.load().await.backup_settings;

            if !policy.enabled {
                next_due = None;
                self.set_phase(SchedulerPhase::Idle);
                if !self.pause(IDLE_POLL, &cancel).await {
                    break;
                }
                continue;
            }

            let now = self.clock.now();
            if reconfigured {
                tracing::info!(
                    interval = ?policy.interval,
                    custom_value = policy.custom_value,
                    custom_unit = policy.custom_unit.label(),
                    "Backup schedule changed"
                );
                next_due = fires_on_reconfigure(&policy).then_some(now);
            }
            let due = *next_due.get_or_insert_with(|| compute_next_due(&policy, now));

            if now >= due {
                next_due = self.run_due().await;
                continue;
            }

            self.set_phase(SchedulerPhase::Waiting { next_due: due });
            let remaining = (due - now).to_std().unwrap_or_default();
            if !self.pause(wait_slice(&policy, remaining), &cancel).await {
                break;
            }
        }

        self.set_phase(SchedulerPhase::Idle);
        tracing::info!("Backup scheduler stopped");
    }

    /// Returns the retry time on failure, `None` to recompute on success.
    async fn run_due(&self) -> Option<NaiveDateTime> {
        self.set_phase(SchedulerPhase::Running);
        tracing::info!("Starting scheduled backup");
        match self.backup.run_scheduled().await {
            Ok(report) => {
                tracing::info!(participants = report.participants, "Scheduled backup completed");
                None
            }
            Err(e) => {
                let retry = add(self.clock.now(), TimeDelta::minutes(RETRY_AFTER_MINUTES));
                tracing::error!(error = %e, retry_at = %retry, "Scheduled backup failed");
                Some(retry)
            }
        }
    }

    /// Sleeps up to `slice`, waking early on reconfiguration. `false` once
    /// cancelled.
    async fn pause(&self, slice: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = self.signal.wait(slice) => true,
        }
    }
}
