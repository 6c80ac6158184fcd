//! Tick scheduling for the backup job
//!
//! The scheduler only decides *when to ask*; whether a backup is actually
//! due is the orchestrator's call. Outside development mode the check runs
//! once a day at a fixed wall-clock time, in development mode it runs on a
//! short fixed cadence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone};
use tracing::{error, info, warn};

use crate::backup::orchestrator::{BackupOrchestrator, RunOutcome};
use crate::backup::Result;
use crate::config::BackupConfig;

/// When the due check fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSchedule {
    /// Once a day at the given local time
    DailyAt(NaiveTime),
    /// At a fixed interval
    Every(Duration),
}

impl TickSchedule {
    pub fn from_config(config: &BackupConfig) -> Self {
        if config.development_mode {
            TickSchedule::Every(config.check_interval)
        } else {
            TickSchedule::DailyAt(config.effective_backup_time())
        }
    }

    /// The first tick strictly after `now` (local wall-clock time)
    pub fn next_tick(&self, now: NaiveDateTime) -> NaiveDateTime {
        match *self {
            TickSchedule::DailyAt(time) => {
                let today = now.date().and_time(time);
                if today > now {
                    today
                } else {
                    today + chrono::Duration::days(1)
                }
            }
            TickSchedule::Every(interval) => {
                now + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::seconds(60))
            }
        }
    }
}

/// The first tick strictly after `now`, as a real instant in `now`'s time zone
///
/// Daily ticks keep their wall-clock time across daylight saving changes. A
/// tick that falls into a skipped hour moves to the first wall-clock time
/// that exists after it.
pub fn next_instant<Tz: TimeZone>(schedule: &TickSchedule, now: &DateTime<Tz>) -> DateTime<Tz> {
    let fallback = now.clone() + chrono::Duration::hours(1);
    match schedule {
        TickSchedule::Every(interval) => {
            now.clone() + chrono::Duration::from_std(*interval).unwrap_or(chrono::Duration::seconds(60))
        }
        TickSchedule::DailyAt(_) => {
            let tz = now.timezone();
            let mut wall = schedule.next_tick(now.naive_local());
            for _ in 0..GAP_STEPS {
                if let Some(instant) = earliest(tz.from_local_datetime(&wall)) {
                    if instant > *now {
                        return instant;
                    }
                }
                wall += chrono::Duration::minutes(GAP_STEP_MINUTES);
            }
            fallback
        }
    }
}

/// Steps tried when a daily tick lands in a skipped hour
const GAP_STEPS: usize = 8;
const GAP_STEP_MINUTES: i64 = 15;

/// The earlier instant of an ambiguous wall-clock time, `None` inside a gap
fn earliest<Tz: TimeZone>(local: LocalResult<DateTime<Tz>>) -> Option<DateTime<Tz>> {
    match local {
        LocalResult::Single(instant) => Some(instant),
        LocalResult::Ambiguous(first, second) => Some(if first <= second { first } else { second }),
        LocalResult::None => None,
    }
}

/// Run the due check on `schedule` until Ctrl-C is received
pub async fn run(orchestrator: Arc<BackupOrchestrator>, schedule: TickSchedule) -> Result<()> {
    match schedule {
        TickSchedule::DailyAt(time) => {
            info!("Backup schedule started; checking daily at {}", time.format("%H:%M:%S"))
        }
        TickSchedule::Every(interval) => info!(
            "Backup schedule started in development mode; checking every {} seconds",
            interval.as_secs()
        ),
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let now = Local::now();
        let next = next_instant(&schedule, &now);
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!("Next check at {}", next.format("%Y-%m-%d %H:%M:%S %:z"));

        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                // Awaited in place, so ticks never overlap a running backup
                log_outcome(&orchestrator.evaluate_and_run().await);
            }
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Received shutdown signal, stopping scheduler");
                break;
            }
        }
    }

    Ok(())
}

fn log_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Skipped { next_due, .. } => info!("No backup needed until {}", next_due),
        RunOutcome::Succeeded(record) => info!("Backup {} recorded as success", record.backup_name),
        RunOutcome::Failed(record) => warn!(
            "Backup {} recorded as failure: {}",
            record.backup_name, record.message
        ),
        RunOutcome::CheckFailed { reason } => warn!("Due check failed: {}", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate};

    fn local(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_daily_tick_later_today() {
        let schedule = TickSchedule::DailyAt(NaiveTime::from_hms_opt(13, 0, 0).unwrap());
        assert_eq!(schedule.next_tick(local(1, 9, 30)), local(1, 13, 0));
    }

    #[test]
    fn test_daily_tick_already_passed() {
        let schedule = TickSchedule::DailyAt(NaiveTime::from_hms_opt(13, 0, 0).unwrap());
        assert_eq!(schedule.next_tick(local(1, 13, 0)), local(2, 13, 0));
        assert_eq!(schedule.next_tick(local(30, 18, 0)), local(1, 13, 0) + chrono::Duration::days(30));
    }

    #[test]
    fn test_fixed_cadence() {
        let schedule = TickSchedule::Every(Duration::from_secs(60));
        assert_eq!(schedule.next_tick(local(1, 9, 30)), local(1, 9, 31));
    }

    #[test]
    fn test_next_instant_keeps_offset() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap();

        let daily = TickSchedule::DailyAt(NaiveTime::from_hms_opt(13, 0, 0).unwrap());
        assert_eq!(
            next_instant(&daily, &now),
            tz.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap()
        );

        let cadence = TickSchedule::Every(Duration::from_secs(90));
        assert_eq!(
            next_instant(&cadence, &now),
            tz.with_ymd_and_hms(2025, 6, 1, 9, 31, 30).unwrap()
        );
    }

    #[test]
    fn test_earliest_resolves_repeated_and_skipped_hours() {
        let summer = FixedOffset::east_opt(2 * 3600).unwrap();
        let winter = FixedOffset::east_opt(3600).unwrap();
        // 02:30 happens twice when clocks go back
        let first = summer.with_ymd_and_hms(2025, 10, 26, 2, 30, 0).unwrap();
        let second = winter.with_ymd_and_hms(2025, 10, 26, 2, 30, 0).unwrap();

        assert_eq!(earliest(LocalResult::Ambiguous(second, first)), Some(first));
        assert_eq!(earliest(LocalResult::Single(first)), Some(first));
        assert_eq!(earliest::<FixedOffset>(LocalResult::None), None);
    }

    #[test]
    fn test_schedule_from_config() {
        let mut config = BackupConfig {
            test_backup_time: NaiveTime::from_hms_opt(8, 15, 0),
            ..BackupConfig::default()
        };
        assert_eq!(
            TickSchedule::from_config(&config),
            TickSchedule::DailyAt(NaiveTime::from_hms_opt(8, 15, 0).unwrap())
        );

        config.development_mode = true;
        assert_eq!(
            TickSchedule::from_config(&config),
            TickSchedule::Every(Duration::from_secs(60))
        );
    }
}
