use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::config::{CompensationConfig, RoomConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreheatMarker {
    pub start: DateTime<Utc>,
    pub target_temp: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PreheatPlan {
    StartNow { preheat_minutes: u32 },
    Scheduled { start: DateTime<Utc>, preheat_minutes: u32 },
}

/// Lead time in minutes needed to heat from `current_temp` to `target_temp`.
pub fn preheat_minutes(
    target_temp: f32,
    current_temp: f32,
    heating_rate: f32,
    room: &RoomConfig,
    limits: &CompensationConfig,
) -> u32 {
    if current_temp >= target_temp {
        return 0;
    }
    if !(heating_rate > 0.0) {
        return limits.fallback_preheat_minutes;
    }

    let minutes = f64::from(target_temp - current_temp) / f64::from(heating_rate) * 60.0;
    let buffered = minutes * (1.0 + f64::from(room.learning_buffer_pct) / 100.0);
    let min = f64::from(room.min_preheat_minutes);
    let max = f64::from(room.max_preheat_minutes.max(room.min_preheat_minutes));

    buffered.round().clamp(min, max) as u32
}

/// Next occurrence of `time` on the local clock of `now`: today if it is
/// still ahead, tomorrow otherwise. Each day is resolved in its own UTC
/// offset. A time skipped by a DST change resolves to the hour after it.
pub fn next_occurrence<Tz: TimeZone>(now: &DateTime<Tz>, time: NaiveTime) -> Option<DateTime<Tz>> {
    let today = now.date_naive();
    let candidate = resolve_local(&now.timezone(), today, time)?;
    if candidate > *now {
        return Some(candidate);
    }
    resolve_local(&now.timezone(), today.succ_opt()?, time)
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
    let local = date.and_time(time);
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
}

pub fn plan(now: DateTime<Utc>, target_time: DateTime<Utc>, preheat_minutes: u32) -> PreheatPlan {
    let lead = Duration::minutes(i64::from(preheat_minutes));
    if now + lead >= target_time {
        PreheatPlan::StartNow { preheat_minutes }
    } else {
        PreheatPlan::Scheduled {
            start: target_time - lead,
            preheat_minutes,
        }
    }
}

/// Accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;
    use chrono_tz::Europe::Berlin;

    use super::*;
    use crate::config::{RoomOptions, RoomSettings};

    fn room() -> RoomConfig {
        let mut settings = RoomSettings::new("Living Room");
        settings.learning_buffer_pct = 10;
        settings.min_preheat_minutes = 15;
        settings.max_preheat_minutes = 120;
        settings.resolve(&RoomOptions::default())
    }

    fn local(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn buffered_lead_time_from_learned_rate() {
        let minutes = preheat_minutes(21.0, 19.0, 2.0, &room(), &CompensationConfig::default());
        assert_eq!(minutes, 66);
    }

    #[test]
    fn no_lead_time_when_already_warm() {
        let limits = CompensationConfig::default();
        assert_eq!(preheat_minutes(21.0, 21.0, 2.0, &room(), &limits), 0);
        assert_eq!(preheat_minutes(21.0, 22.5, 2.0, &room(), &limits), 0);
    }

    #[test]
    fn lead_time_is_clamped() {
        let limits = CompensationConfig::default();
        assert_eq!(preheat_minutes(21.0, 20.9, 5.0, &room(), &limits), 15);
        assert_eq!(preheat_minutes(24.0, 16.0, 0.5, &room(), &limits), 120);
        assert_eq!(
            preheat_minutes(21.0, 19.0, 0.0, &room(), &limits),
            limits.fallback_preheat_minutes
        );
    }

    #[test]
    fn target_time_rolls_over_to_tomorrow() {
        let now = local(10, 7, 30);
        let time = NaiveTime::from_hms_opt(7, 0, 0).unwrap();

        assert_eq!(next_occurrence(&now, time), Some(local(11, 7, 0)));

        let later = NaiveTime::from_hms_opt(8, 0, 0).unwrap();
        assert_eq!(next_occurrence(&now, later), Some(local(10, 8, 0)));

        let exact = NaiveTime::from_hms_opt(7, 30, 0).unwrap();
        assert_eq!(next_occurrence(&now, exact), Some(local(11, 7, 30)));
    }

    #[test]
    fn tomorrow_uses_its_own_offset_across_dst() {
        // Berlin moves from CET to CEST at 02:00 on 2026-03-29.
        let now = Berlin.with_ymd_and_hms(2026, 3, 28, 23, 0, 0).unwrap();
        let time = NaiveTime::from_hms_opt(7, 0, 0).unwrap();

        let target = next_occurrence(&now, time).unwrap();

        let expected = NaiveDate::from_ymd_opt(2026, 3, 29).unwrap().and_time(time);
        assert_eq!(target.naive_local(), expected);
        assert_eq!(
            target.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2026, 3, 29, 5, 0, 0).unwrap()
        );
    }

    #[test]
    fn skipped_local_time_moves_past_the_gap() {
        let now = Berlin.with_ymd_and_hms(2026, 3, 28, 23, 0, 0).unwrap();
        let time = NaiveTime::from_hms_opt(2, 30, 0).unwrap();

        let target = next_occurrence(&now, time).unwrap();

        assert_eq!(
            target.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2026, 3, 29, 1, 30, 0).unwrap()
        );
    }

    #[test]
    fn starts_now_when_lead_exceeds_remaining_time() {
        let now = local(10, 6, 0).with_timezone(&Utc);
        let target = now + Duration::minutes(63);

        assert_eq!(
            plan(now, target, 66),
            PreheatPlan::StartNow {
                preheat_minutes: 66
            }
        );
    }

    #[test]
    fn schedules_start_marker_ahead_of_target() {
        let now = local(10, 6, 0).with_timezone(&Utc);
        let target = now + Duration::minutes(90);

        assert_eq!(
            plan(now, target, 66),
            PreheatPlan::Scheduled {
                start: now + Duration::minutes(24),
                preheat_minutes: 66
            }
        );
    }

    #[test]
    fn parses_time_of_day() {
        assert_eq!(
            parse_time_of_day("06:30"),
            NaiveTime::from_hms_opt(6, 30, 0)
        );
        assert_eq!(
            parse_time_of_day("06:30:15"),
            NaiveTime::from_hms_opt(6, 30, 15)
        );
        assert_eq!(parse_time_of_day("6.30"), None);
    }
}
