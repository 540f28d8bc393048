use std::fmt;

use chrono::{DateTime, Datelike, Days, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

pub const ALL_DAYS_OF_WEEK: u32 = 0x7F;
pub const ALL_DAYS_OF_MONTH: u32 = 0x7FFF_FFFF;

// Long enough for any non-empty day-of-month mask (31st only: two months).
const SEARCH_HORIZON_DAYS: u64 = 400;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Execute,
    Once,
    Daily,
    Weekly,
    Monthly,
}

impl JobType {
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Execute),
            1 => Some(Self::Once),
            2 => Some(Self::Daily),
            3 => Some(Self::Weekly),
            4 => Some(Self::Monthly),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u32 {
        match self {
            Self::Execute => 0,
            Self::Once => 1,
            Self::Daily => 2,
            Self::Weekly => 3,
            Self::Monthly => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Once => "once",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TriggerError {
    ImmediateNotSchedulable,
    MissingStartTime { job_type: JobType },
    InvalidDaysOfWeek { mask: u32 },
    InvalidDaysOfMonth { mask: u32 },
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImmediateNotSchedulable => {
                write!(f, "immediate executions are not persisted as schedules")
            }
            Self::MissingStartTime { job_type } => {
                write!(f, "{} schedules require a start time", job_type.as_str())
            }
            Self::InvalidDaysOfWeek { mask } => write!(
                f,
                "day-of-week mask {mask:#x} must select at least one of bits 0 (Monday) to 6 (Sunday)"
            ),
            Self::InvalidDaysOfMonth { mask } => write!(
                f,
                "day-of-month mask {mask:#x} must select at least one of bits 0 (1st) to 30 (31st)"
            ),
        }
    }
}

impl std::error::Error for TriggerError {}

/// When a persisted job fires. Recurring variants take only the time of day
/// from `start_time`; its date is the first day a firing may fall on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Once {
        at: DateTime<Utc>,
    },
    Daily {
        start_time: DateTime<Utc>,
    },
    Weekly {
        start_time: DateTime<Utc>,
        days_of_week: u32,
    },
    Monthly {
        start_time: DateTime<Utc>,
        days_of_month: u32,
    },
}

impl Trigger {
    pub fn from_parts(
        job_type: JobType,
        start_time: Option<DateTime<Utc>>,
        days_of_week: u32,
        days_of_month: u32,
    ) -> Result<Self, TriggerError> {
        if job_type == JobType::Execute {
            return Err(TriggerError::ImmediateNotSchedulable);
        }
        let start_time = start_time.ok_or(TriggerError::MissingStartTime { job_type })?;

        match job_type {
            JobType::Execute => Err(TriggerError::ImmediateNotSchedulable),
            JobType::Once => Ok(Self::Once { at: start_time }),
            JobType::Daily => Ok(Self::Daily { start_time }),
            JobType::Weekly => {
                if days_of_week == 0 || days_of_week & !ALL_DAYS_OF_WEEK != 0 {
                    return Err(TriggerError::InvalidDaysOfWeek { mask: days_of_week });
                }
                Ok(Self::Weekly {
                    start_time,
                    days_of_week,
                })
            }
            JobType::Monthly => {
                if days_of_month == 0 || days_of_month & !ALL_DAYS_OF_MONTH != 0 {
                    return Err(TriggerError::InvalidDaysOfMonth {
                        mask: days_of_month,
                    });
                }
                Ok(Self::Monthly {
                    start_time,
                    days_of_month,
                })
            }
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Self::Once { .. } => JobType::Once,
            Self::Daily { .. } => JobType::Daily,
            Self::Weekly { .. } => JobType::Weekly,
            Self::Monthly { .. } => JobType::Monthly,
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        match self {
            Self::Once { at } => *at,
            Self::Daily { start_time }
            | Self::Weekly { start_time, .. }
            | Self::Monthly { start_time, .. } => *start_time,
        }
    }

    pub fn days_of_week(&self) -> u32 {
        match self {
            Self::Weekly { days_of_week, .. } => *days_of_week,
            _ => 0,
        }
    }

    pub fn days_of_month(&self) -> u32 {
        match self {
            Self::Monthly { days_of_month, .. } => *days_of_month,
            _ => 0,
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once { .. })
    }

    /// First firing strictly after `after`, with days and time of day
    /// interpreted at `offset`. A one-shot trigger always reports its
    /// timestamp, even when it is already past, so a missed run still fires.
    pub fn next_due(&self, after: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<Utc>> {
        if let Self::Once { at } = self {
            return Some(*at);
        }

        let anchor = self.start_time().with_timezone(&offset);
        let time_of_day = anchor.time();
        let local_after = after.with_timezone(&offset);
        let first_day = local_after.date_naive().max(anchor.date_naive());

        (0..SEARCH_HORIZON_DAYS)
            .filter_map(|offset_days| first_day.checked_add_days(Days::new(offset_days)))
            .filter(|day| self.fires_on(day.weekday().num_days_from_monday(), day.day()))
            .filter_map(|day| {
                day.and_time(time_of_day)
                    .and_local_timezone(offset)
                    .single()
                    .map(|local| local.with_timezone(&Utc))
            })
            .find(|candidate| *candidate > after)
    }

    fn fires_on(&self, weekday_from_monday: u32, day_of_month: u32) -> bool {
        match self {
            Self::Once { .. } | Self::Daily { .. } => true,
            Self::Weekly { days_of_week, .. } => days_of_week & (1 << weekday_from_monday) != 0,
            Self::Monthly { days_of_month, .. } => days_of_month & (1 << (day_of_month - 1)) != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, FixedOffset, TimeZone, Utc};

    use super::{JobType, Trigger, TriggerError};

    const MONDAY: u32 = 1 << 0;
    const WEDNESDAY: u32 = 1 << 2;
    const FRIDAY: u32 = 1 << 4;

    fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .expect("timestamp should be valid")
    }

    fn utc_offset() -> FixedOffset {
        FixedOffset::east_opt(0).expect("zero offset should be valid")
    }

    // 2024-01-01 is a Monday.
    fn mon_wed_fri_at_nine() -> Trigger {
        Trigger::from_parts(
            JobType::Weekly,
            Some(utc(2024, 1, 1, 9, 0)),
            MONDAY | WEDNESDAY | FRIDAY,
            0,
        )
        .expect("weekly trigger should be valid")
    }

    #[test]
    fn weekly_from_tuesday_morning_is_wednesday_nine() {
        let next = mon_wed_fri_at_nine().next_due(utc(2024, 1, 9, 10, 0), utc_offset());
        assert_eq!(next, Some(utc(2024, 1, 10, 9, 0)));
    }

    #[test]
    fn weekly_from_friday_early_is_same_friday_nine() {
        let next = mon_wed_fri_at_nine().next_due(utc(2024, 1, 12, 8, 0), utc_offset());
        assert_eq!(next, Some(utc(2024, 1, 12, 9, 0)));
    }

    #[test]
    fn weekly_exactly_at_firing_moves_to_next_selected_day() {
        let next = mon_wed_fri_at_nine().next_due(utc(2024, 1, 12, 9, 0), utc_offset());
        assert_eq!(next, Some(utc(2024, 1, 15, 9, 0)));
    }

    #[test]
    fn start_date_is_the_earliest_firing_day() {
        let trigger = Trigger::from_parts(JobType::Daily, Some(utc(2024, 6, 1, 6, 30)), 0, 0)
            .expect("daily trigger should be valid");
        assert_eq!(
            trigger.next_due(utc(2024, 1, 1, 0, 0), utc_offset()),
            Some(utc(2024, 6, 1, 6, 30))
        );
        assert_eq!(
            trigger.next_due(utc(2024, 6, 1, 7, 0), utc_offset()),
            Some(utc(2024, 6, 2, 6, 30))
        );
    }

    #[test]
    fn monthly_skips_months_without_the_selected_day() {
        let trigger = Trigger::from_parts(
            JobType::Monthly,
            Some(utc(2024, 1, 1, 0, 15)),
            0,
            1 << 30,
        )
        .expect("monthly trigger should be valid");

        assert_eq!(
            trigger.next_due(utc(2024, 1, 31, 1, 0), utc_offset()),
            Some(utc(2024, 3, 31, 0, 15))
        );
    }

    #[test]
    fn time_of_day_follows_configured_offset() {
        let offset = FixedOffset::east_opt(2 * 3600).expect("offset should be valid");
        // 09:00 at +02:00 is 07:00 UTC.
        let trigger = Trigger::from_parts(JobType::Daily, Some(utc(2024, 1, 1, 7, 0)), 0, 0)
            .expect("daily trigger should be valid");

        assert_eq!(
            trigger.next_due(utc(2024, 1, 3, 23, 30), offset),
            Some(utc(2024, 1, 4, 7, 0))
        );
    }

    #[test]
    fn one_shot_always_reports_its_timestamp() {
        let trigger = Trigger::from_parts(JobType::Once, Some(utc(2024, 1, 1, 9, 0)), 0, 0)
            .expect("once trigger should be valid");
        assert!(!trigger.is_recurring());
        assert_eq!(
            trigger.next_due(utc(2030, 1, 1, 0, 0), utc_offset()),
            Some(utc(2024, 1, 1, 9, 0))
        );
    }

    #[test]
    fn rejects_invalid_parts() {
        assert_eq!(
            Trigger::from_parts(JobType::Execute, Some(utc(2024, 1, 1, 0, 0)), 0, 0),
            Err(TriggerError::ImmediateNotSchedulable)
        );
        assert_eq!(
            Trigger::from_parts(JobType::Daily, None, 0, 0),
            Err(TriggerError::MissingStartTime {
                job_type: JobType::Daily
            })
        );
        assert_eq!(
            Trigger::from_parts(JobType::Weekly, Some(utc(2024, 1, 1, 0, 0)), 0x80, 0),
            Err(TriggerError::InvalidDaysOfWeek { mask: 0x80 })
        );
        assert_eq!(
            Trigger::from_parts(JobType::Monthly, Some(utc(2024, 1, 1, 0, 0)), 0, 0),
            Err(TriggerError::InvalidDaysOfMonth { mask: 0 })
        );
    }

    #[test]
    fn trigger_survives_json_round_trip() {
        let trigger = mon_wed_fri_at_nine();
        let raw = serde_json::to_string(&trigger).expect("trigger should serialize");
        assert!(raw.contains("\"type\":\"weekly\""));
        let restored: Trigger = serde_json::from_str(&raw).expect("trigger should deserialize");
        assert_eq!(restored, trigger);
    }
}
