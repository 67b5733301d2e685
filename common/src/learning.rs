use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::{config::CompensationConfig, types::HvacAction};

#[derive(Debug, Clone, Copy, PartialEq)]
struct HeatingCycle {
    start: DateTime<Utc>,
    start_temp: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LearningEvent {
    CycleStarted { start_temp: f32 },
    CycleEnded,
    SampleAccepted { rate: f32, mean: f32 },
    SampleRejected { rate: f32 },
    Suppressed,
}

/// Learns how fast a room heats up, in °C per hour, from the external sensor.
///
/// Each accepted sample is the average rise since the current heating cycle
/// started. The published rate is the arithmetic mean of the bounded history.
#[derive(Debug, Clone)]
pub struct HeatingRateLearner {
    history: VecDeque<f32>,
    capacity: usize,
    default_rate: f32,
    rate: f32,
    cycle: Option<HeatingCycle>,
}

impl HeatingRateLearner {
    pub fn new(limits: &CompensationConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(limits.max_heating_cycles),
            capacity: limits.max_heating_cycles.max(1),
            default_rate: limits.default_heating_rate,
            rate: limits.default_heating_rate,
            cycle: None,
        }
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn history(&self) -> Vec<f32> {
        self.history.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Replaces the history with persisted samples, keeping the newest ones.
    pub fn restore(&mut self, samples: &[f32]) {
        let valid: Vec<f32> = samples.iter().copied().filter(|v| v.is_finite()).collect();
        let skip = valid.len().saturating_sub(self.capacity);
        self.history = valid.into_iter().skip(skip).collect();
        self.recompute();
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.cycle = None;
        self.recompute();
    }

    /// Feeds one control cycle. Returns an event when something noteworthy
    /// happened; [`LearningEvent::SampleAccepted`] means the history changed.
    pub fn observe(
        &mut self,
        action: HvacAction,
        external_temp: f32,
        locked: bool,
        limits: &CompensationConfig,
        now: DateTime<Utc>,
    ) -> Option<LearningEvent> {
        if action != HvacAction::Heating {
            return self.cycle.take().map(|_| LearningEvent::CycleEnded);
        }

        let Some(cycle) = self.cycle else {
            self.cycle = Some(HeatingCycle {
                start: now,
                start_temp: external_temp,
            });
            return Some(LearningEvent::CycleStarted {
                start_temp: external_temp,
            });
        };

        let elapsed_ms = (now - cycle.start).num_milliseconds();
        let min_ms = i64::from(limits.learning_min_duration_minutes) * 60_000;
        let rise = external_temp - cycle.start_temp;
        if elapsed_ms < min_ms || elapsed_ms <= 0 || rise < limits.learning_min_rise {
            return None;
        }

        if locked {
            return Some(LearningEvent::Suppressed);
        }

        let hours = elapsed_ms as f32 / 3_600_000.0;
        let rate = rise / hours;
        if !(limits.min_heating_rate..=limits.max_heating_rate).contains(&rate) {
            return Some(LearningEvent::SampleRejected { rate });
        }

        if self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(rate);
        self.recompute();

        Some(LearningEvent::SampleAccepted {
            rate,
            mean: self.rate,
        })
    }

    fn recompute(&mut self) {
        self.rate = if self.history.is_empty() {
            self.default_rate
        } else {
            self.history.iter().sum::<f32>() / self.history.len() as f32
        };
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 6, 0, 0).unwrap()
    }

    #[test]
    fn starts_and_ends_cycle_with_heating_action() {
        let limits = CompensationConfig::default();
        let mut learner = HeatingRateLearner::new(&limits);

        let started = learner.observe(HvacAction::Heating, 18.0, false, &limits, base_time());
        assert_eq!(started, Some(LearningEvent::CycleStarted { start_temp: 18.0 }));
        assert_eq!(
            learner.cycle,
            Some(HeatingCycle {
                start: base_time(),
                start_temp: 18.0
            })
        );

        let ended = learner.observe(HvacAction::Idle, 19.0, false, &limits, base_time());
        assert_eq!(ended, Some(LearningEvent::CycleEnded));
        assert_eq!(learner.cycle, None);

        assert_eq!(
            learner.observe(HvacAction::Off, 19.0, false, &limits, base_time()),
            None
        );
    }

    #[test]
    fn accepts_sample_after_minimum_duration() {
        let limits = CompensationConfig::default();
        let mut learner = HeatingRateLearner::new(&limits);
        learner.observe(HvacAction::Heating, 18.0, false, &limits, base_time());

        let event = learner.observe(
            HvacAction::Heating,
            19.0,
            false,
            &limits,
            base_time() + Duration::minutes(30),
        );

        assert_eq!(
            event,
            Some(LearningEvent::SampleAccepted {
                rate: 2.0,
                mean: 2.0
            })
        );
        assert_eq!(learner.history(), vec![2.0]);
        assert_eq!(learner.rate(), 2.0);
    }

    #[test]
    fn ignores_short_cycles_and_small_rises() {
        let limits = CompensationConfig::default();
        let mut learner = HeatingRateLearner::new(&limits);
        learner.observe(HvacAction::Heating, 18.0, false, &limits, base_time());

        let too_short = learner.observe(
            HvacAction::Heating,
            19.0,
            false,
            &limits,
            base_time() + Duration::minutes(19),
        );
        let too_flat = learner.observe(
            HvacAction::Heating,
            18.05,
            false,
            &limits,
            base_time() + Duration::minutes(40),
        );

        assert_eq!(too_short, None);
        assert_eq!(too_flat, None);
        assert!(learner.is_empty());
        assert_eq!(learner.rate(), limits.default_heating_rate);
    }

    #[test]
    fn window_lockout_suppresses_learning() {
        let limits = CompensationConfig::default();
        let mut learner = HeatingRateLearner::new(&limits);
        learner.observe(HvacAction::Heating, 18.0, false, &limits, base_time());

        let event = learner.observe(
            HvacAction::Heating,
            19.0,
            true,
            &limits,
            base_time() + Duration::minutes(30),
        );

        assert_eq!(event, Some(LearningEvent::Suppressed));
        assert!(learner.is_empty());
    }

    #[test]
    fn out_of_range_rate_is_discarded() {
        let limits = CompensationConfig::default();
        let mut learner = HeatingRateLearner::new(&limits);
        learner.observe(HvacAction::Heating, 10.0, false, &limits, base_time());

        let event = learner.observe(
            HvacAction::Heating,
            16.0,
            false,
            &limits,
            base_time() + Duration::minutes(30),
        );

        assert_eq!(event, Some(LearningEvent::SampleRejected { rate: 12.0 }));
        assert!(learner.is_empty());
    }

    #[test]
    fn history_is_bounded_and_rate_is_mean() {
        let limits = CompensationConfig {
            max_heating_cycles: 3,
            ..CompensationConfig::default()
        };
        let mut learner = HeatingRateLearner::new(&limits);
        learner.observe(HvacAction::Heating, 18.0, false, &limits, base_time());

        // Rises of 0.5, 1.0, 1.5, 2.0 after one hour each give 0.5..2.0 °C/h.
        for (step, rise) in [0.5, 1.0, 1.5, 2.0].into_iter().enumerate() {
            learner.cycle = Some(HeatingCycle {
                start: base_time(),
                start_temp: 18.0,
            });
            let now = base_time() + Duration::hours(1);
            learner.observe(HvacAction::Heating, 18.0 + rise, false, &limits, now);
            assert!(learner.len() <= 3, "step {step}");
        }

        assert_eq!(learner.history(), vec![1.0, 1.5, 2.0]);
        assert_eq!(learner.rate(), 1.5);
    }

    #[test]
    fn restore_keeps_newest_samples_and_reset_clears() {
        let limits = CompensationConfig {
            max_heating_cycles: 2,
            ..CompensationConfig::default()
        };
        let mut learner = HeatingRateLearner::new(&limits);

        learner.restore(&[1.0, f32::NAN, 2.0, 3.0]);
        assert_eq!(learner.history(), vec![2.0, 3.0]);
        assert_eq!(learner.rate(), 2.5);

        learner.reset();
        assert!(learner.is_empty());
        assert_eq!(learner.rate(), limits.default_heating_rate);
    }
}
