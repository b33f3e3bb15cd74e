//! Backup schedule model
//!
//! A schedule is a recurring policy for one (project, kind) pair. The next
//! run is always derived from the frequency rules below relative to a given
//! instant, so a scheduler that was down for a week fires once, not seven
//! times.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::backup::{BackupKind, StorageDisk};
use super::ids::{ProjectId, ScheduleId};
use crate::error::{VaultError, VaultResult};

/// How often a schedule fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// Every hour at minute 0
    Hourly,
    /// Every day at `time_of_day`
    Daily,
    /// Once a week on `day_of_week` at `time_of_day`
    Weekly,
    /// Once a month on `day_of_month` at `time_of_day`
    Monthly,
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hourly => write!(f, "hourly"),
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

impl FromStr for Frequency {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(VaultError::ScheduleMisconfigured(format!(
                "unknown frequency '{}'",
                other
            ))),
        }
    }
}

const WEEKDAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// Recurring backup policy for one project and kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSchedule {
    pub id: ScheduleId,

    pub project_id: ProjectId,

    pub kind: BackupKind,

    pub frequency: Frequency,

    /// Wall-clock time in the configured schedule offset, `HH:MM`
    #[serde(with = "hhmm")]
    pub time_of_day: NaiveTime,

    /// 0 = Sunday .. 6 = Saturday (weekly only, defaults to Monday)
    #[serde(default)]
    pub day_of_week: Option<u8>,

    /// 1..=31, clamped to the month length (monthly only, defaults to 1)
    #[serde(default)]
    pub day_of_month: Option<u8>,

    pub retention_days: u32,

    #[serde(default)]
    pub storage_disk: StorageDisk,

    pub is_active: bool,

    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl BackupSchedule {
    /// Create an active schedule; `next_run_at` is filled in on registration
    pub fn new(
        project_id: ProjectId,
        kind: BackupKind,
        frequency: Frequency,
        time_of_day: NaiveTime,
        retention_days: u32,
        storage_disk: StorageDisk,
    ) -> Self {
        Self {
            id: ScheduleId::new(),
            project_id,
            kind,
            frequency,
            time_of_day,
            day_of_week: None,
            day_of_month: None,
            retention_days,
            storage_disk,
            is_active: true,
            next_run_at: None,
            last_run_at: None,
            created_at: Utc::now(),
        }
    }

    /// Parse an `HH:MM` time of day
    pub fn parse_time(value: &str) -> VaultResult<NaiveTime> {
        NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| {
            VaultError::ScheduleMisconfigured(format!("invalid time of day '{}', expected HH:MM", value))
        })
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.retention_days < 1 {
            return Err(VaultError::ScheduleMisconfigured(
                "retention_days must be at least 1".into(),
            ));
        }

        if let Some(day) = self.day_of_week {
            if day > 6 {
                return Err(VaultError::ScheduleMisconfigured(format!(
                    "day_of_week must be 0-6, got {}",
                    day
                )));
            }
            if self.frequency != Frequency::Weekly {
                return Err(VaultError::ScheduleMisconfigured(format!(
                    "day_of_week only applies to weekly schedules, not {}",
                    self.frequency
                )));
            }
        }

        if let Some(day) = self.day_of_month {
            if !(1..=31).contains(&day) {
                return Err(VaultError::ScheduleMisconfigured(format!(
                    "day_of_month must be 1-31, got {}",
                    day
                )));
            }
            if self.frequency != Frequency::Monthly {
                return Err(VaultError::ScheduleMisconfigured(format!(
                    "day_of_month only applies to monthly schedules, not {}",
                    self.frequency
                )));
            }
        }

        Ok(())
    }

    /// Whether the schedule should fire at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run_at.map_or(false, |next| next <= now)
    }

    /// First slot strictly after `now`
    pub fn next_run_after(
        &self,
        now: DateTime<Utc>,
        offset: FixedOffset,
    ) -> VaultResult<DateTime<Utc>> {
        self.validate()?;

        let local = now.with_timezone(&offset).naive_local();
        let slot = match self.frequency {
            Frequency::Hourly => {
                let hour_start = local
                    .date()
                    .and_hms_opt(local.hour(), 0, 0)
                    .ok_or_else(|| misconfigured("hour out of range"))?;
                hour_start + Duration::hours(1)
            }
            Frequency::Daily => {
                let today = local.date().and_time(self.time_of_day);
                if today > local {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
            Frequency::Weekly => {
                let target = u32::from(self.day_of_week.unwrap_or(1));
                let current = local.weekday().num_days_from_sunday();
                let days_ahead = (target + 7 - current) % 7;
                let slot = (local.date() + Duration::days(i64::from(days_ahead)))
                    .and_time(self.time_of_day);
                if slot > local {
                    slot
                } else {
                    slot + Duration::days(7)
                }
            }
            Frequency::Monthly => {
                let day = u32::from(self.day_of_month.unwrap_or(1));
                let this_month = month_slot(local.year(), local.month(), day, self.time_of_day)?;
                if this_month > local {
                    this_month
                } else {
                    let (year, month) = if local.month() == 12 {
                        (local.year() + 1, 1)
                    } else {
                        (local.year(), local.month() + 1)
                    };
                    month_slot(year, month, day, self.time_of_day)?
                }
            }
        };

        offset
            .from_local_datetime(&slot)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| misconfigured("next run is not representable in the schedule offset"))
    }

    /// Human-readable frequency, e.g. "Daily at 14:00"
    pub fn frequency_label(&self) -> String {
        let time = self.time_of_day.format("%H:%M");
        match self.frequency {
            Frequency::Hourly => "Every Hour".to_string(),
            Frequency::Daily => format!("Daily at {}", time),
            Frequency::Weekly => {
                let day = usize::from(self.day_of_week.unwrap_or(1).min(6));
                format!("Weekly on {} at {}", WEEKDAY_NAMES[day], time)
            }
            Frequency::Monthly => format!(
                "Monthly on day {} at {}",
                self.day_of_month.unwrap_or(1),
                time
            ),
        }
    }
}

fn misconfigured(reason: &str) -> VaultError {
    VaultError::ScheduleMisconfigured(reason.to_string())
}

/// `day` in the given month, clamped to the month's last day
fn month_slot(year: i32, month: u32, day: u32, time: NaiveTime) -> VaultResult<NaiveDateTime> {
    let last_day = days_in_month(year, month)?;
    NaiveDate::from_ymd_opt(year, month, day.min(last_day))
        .map(|date| date.and_time(time))
        .ok_or_else(|| misconfigured("invalid monthly slot"))
}

fn days_in_month(year: i32, month: u32) -> VaultResult<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| misconfigured("invalid month"))?;
    let next_first = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| misconfigured("invalid month"))?;
    Ok((next_first - first).num_days() as u32)
}

/// Serde adapter storing `NaiveTime` as `HH:MM`
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}
