//! Day-aligned restart windows
//!
//! Long tracking runs restart once a day at a fixed wall-clock time (UTC).
//! A restarted run reprocesses an overlap period before the restart time so
//! tracks alive across the boundary are picked up again.

use chrono::{Duration, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::types::{Result, Timestamp, TrackError};

/// Daily restart configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartSchedule {
    /// Restart hour (UTC)
    pub hour: u32,
    /// Restart minute
    #[serde(default)]
    pub minute: u32,
    /// Period reprocessed before the restart time (seconds)
    #[serde(default = "default_overlap_secs")]
    pub overlap_secs: i64,
}

fn default_overlap_secs() -> i64 {
    7200
}

impl RestartSchedule {
    pub fn new(hour: u32, minute: u32, overlap: Duration) -> Self {
        Self {
            hour,
            minute,
            overlap_secs: overlap.num_seconds(),
        }
    }

    /// Overlap as a duration; fails if `overlap_secs` is out of range
    pub fn overlap(&self) -> Result<Duration> {
        Duration::try_seconds(self.overlap_secs).ok_or_else(|| {
            TrackError::Config(format!(
                "restart overlap of {} s is out of range",
                self.overlap_secs
            ))
        })
    }

    /// Check the time of day and overlap
    pub fn validate(&self) -> Result<()> {
        compute_restart(Timestamp::default(), self.hour, self.minute, self.overlap()?).map(|_| ())
    }

    /// Window for a run triggered at `trigger`
    pub fn window(&self, trigger: Timestamp) -> Result<RestartWindow> {
        compute_restart(trigger, self.hour, self.minute, self.overlap()?)
    }
}

/// Times bounding one restarted run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestartWindow {
    /// Most recent restart time at or before the trigger
    pub reference: Timestamp,
    /// Start of the reprocessed data, `reference - overlap`
    pub start: Timestamp,
    /// Next scheduled restart, `reference + 24h`
    pub next_restart: Timestamp,
}

impl RestartWindow {
    /// True once `time` has reached the next restart
    pub fn is_due(&self, time: Timestamp) -> bool {
        time >= self.next_restart
    }
}

/// Compute the restart window for a trigger time.
///
/// The reference is `hour:minute` on the trigger's day, or on the day
/// before if that would be after the trigger.
pub fn compute_restart(
    trigger: Timestamp,
    hour: u32,
    minute: u32,
    overlap: Duration,
) -> Result<RestartWindow> {
    let time_of_day = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
        TrackError::Config(format!("invalid restart time {:02}:{:02}", hour, minute))
    })?;
    if overlap < Duration::zero() {
        return Err(TrackError::Config(format!(
            "restart overlap must not be negative, got {} s",
            overlap.num_seconds()
        )));
    }

    let out_of_range = || {
        TrackError::Config(format!(
            "restart window for {} with {} s overlap is out of range",
            trigger,
            overlap.num_seconds()
        ))
    };

    let mut reference = trigger.date_naive().and_time(time_of_day).and_utc();
    if reference > trigger {
        reference = reference
            .checked_sub_signed(Duration::days(1))
            .ok_or_else(out_of_range)?;
    }

    Ok(RestartWindow {
        reference,
        start: reference.checked_sub_signed(overlap).ok_or_else(out_of_range)?,
        next_restart: reference
            .checked_add_signed(Duration::days(1))
            .ok_or_else(out_of_range)?,
    })
}
