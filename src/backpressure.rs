//! Backpressure controller (spec.md §4.G): a composite load score derived
//! from several normalized inputs, debounced level transitions, and a
//! coupled degradation manager.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadInputs {
    pub queue_utilization: f64,
    pub memory_pressure: f64,
    pub cpu_pressure: f64,
    pub io_pressure: f64,
    pub error_rate: f64,
}

impl LoadInputs {
    /// Weighted mean of all five normalized (0.0-1.0) inputs, weighted
    /// equally by default.
    pub fn composite_score(&self) -> f64 {
        let values = [
            self.queue_utilization,
            self.memory_pressure,
            self.cpu_pressure,
            self.io_pressure,
            self.error_rate,
        ];
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[derive(Debug, Clone)]
pub struct BackpressureThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
    pub stabilize_time: Duration,
    pub cooldown_time: Duration,
}

impl Default for BackpressureThresholds {
    fn default() -> Self {
        Self {
            low: 0.25,
            medium: 0.5,
            high: 0.75,
            critical: 0.9,
            stabilize_time: Duration::from_secs(5),
            cooldown_time: Duration::from_secs(10),
        }
    }
}

fn level_for_score(score: f64, t: &BackpressureThresholds) -> BackpressureLevel {
    if score >= t.critical {
        BackpressureLevel::Critical
    } else if score >= t.high {
        BackpressureLevel::High
    } else if score >= t.medium {
        BackpressureLevel::Medium
    } else if score >= t.low {
        BackpressureLevel::Low
    } else {
        BackpressureLevel::None
    }
}

/// A feature that can be disabled at a given backpressure level, per the
/// degradation manager's config in spec.md §4.G.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Feature {
    Deduplication,
    ComplexProcessing,
    HeavyCompression,
}

pub struct DegradationManager {
    /// Features disabled at or above a given level.
    disables: Vec<(BackpressureLevel, Feature)>,
    restore_delay: Duration,
    min_degraded_time: Duration,
    degraded_since: Option<Instant>,
    currently_disabled: BTreeSet<Feature>,
}

impl DegradationManager {
    pub fn new(
        disables: Vec<(BackpressureLevel, Feature)>,
        restore_delay: Duration,
        min_degraded_time: Duration,
    ) -> Self {
        Self {
            disables,
            restore_delay,
            min_degraded_time,
            degraded_since: None,
            currently_disabled: BTreeSet::new(),
        }
    }

    pub fn is_disabled(&self, feature: Feature) -> bool {
        self.currently_disabled.contains(&feature)
    }

    /// Applies degradation for `level` immediately, but only restores
    /// features after both `restore_delay` has elapsed since the level
    /// improved AND at least `min_degraded_time` has passed since
    /// degradation began, preventing flapping.
    pub fn apply(&mut self, level: BackpressureLevel, now: Instant) {
        let should_disable: BTreeSet<Feature> = self
            .disables
            .iter()
            .filter(|(threshold, _)| level >= *threshold)
            .map(|(_, f)| *f)
            .collect();

        if !should_disable.is_empty() && self.degraded_since.is_none() {
            self.degraded_since = Some(now);
        }

        if should_disable.is_superset(&self.currently_disabled) {
            self.currently_disabled = should_disable;
            return;
        }

        // Some features would be restored; only allow it once both timers
        // have elapsed.
        if let Some(since) = self.degraded_since {
            let degraded_long_enough = now.duration_since(since) >= self.min_degraded_time;
            let cooled_down = now.duration_since(since) >= self.restore_delay;
            if degraded_long_enough && cooled_down {
                self.currently_disabled = should_disable;
                if self.currently_disabled.is_empty() {
                    self.degraded_since = None;
                }
            }
        } else {
            self.currently_disabled = should_disable;
        }
    }
}

/// The controller: tracks the current debounced level and exposes the
/// producer-facing decisions (`should_throttle`, `should_reject`,
/// `reduction`).
pub struct BackpressureController {
    thresholds: BackpressureThresholds,
    current_level: BackpressureLevel,
    pending_level: Option<(BackpressureLevel, Instant)>,
    last_change: Option<Instant>,
}

impl BackpressureController {
    pub fn new(thresholds: BackpressureThresholds) -> Self {
        Self {
            thresholds,
            current_level: BackpressureLevel::None,
            pending_level: None,
            last_change: None,
        }
    }

    pub fn level(&self) -> BackpressureLevel {
        self.current_level
    }

    /// Feeds a fresh observation in; returns the (possibly unchanged)
    /// current level. A level change is debounced: the new level must
    /// persist for `stabilize_time` and `cooldown_time` must have passed
    /// since the prior change.
    pub fn observe(&mut self, inputs: LoadInputs, now: Instant) -> BackpressureLevel {
        let observed = level_for_score(inputs.composite_score(), &self.thresholds);

        if observed == self.current_level {
            self.pending_level = None;
            return self.current_level;
        }

        match self.pending_level {
            Some((pending, since)) if pending == observed => {
                let stable_long_enough = now.duration_since(since) >= self.thresholds.stabilize_time;
                let cooled_down = self
                    .last_change
                    .map(|t| now.duration_since(t) >= self.thresholds.cooldown_time)
                    .unwrap_or(true);
                if stable_long_enough && cooled_down {
                    info!(from = ?self.current_level, to = ?observed, "backpressure level changed");
                    self.current_level = observed;
                    self.last_change = Some(now);
                    self.pending_level = None;
                }
            }
            _ => {
                self.pending_level = Some((observed, now));
            }
        }

        self.current_level
    }

    pub fn should_throttle(&self) -> bool {
        self.current_level >= BackpressureLevel::Medium
    }

    pub fn should_reject(&self) -> bool {
        self.current_level == BackpressureLevel::Critical
    }

    /// A factor in `[0.0, 1.0]` that producers use to probabilistically
    /// drop or slow, scaling with level.
    pub fn reduction(&self) -> f64 {
        match self.current_level {
            BackpressureLevel::None => 0.0,
            BackpressureLevel::Low => 0.1,
            BackpressureLevel::Medium => 0.3,
            BackpressureLevel::High => 0.6,
            BackpressureLevel::Critical => 1.0,
        }
    }
}
