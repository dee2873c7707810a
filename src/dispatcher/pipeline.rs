//! The per-entry gating pipeline a freshly-ingested `LogEntry` runs
//! through before it is batched for a sink (spec.md §4.L step 1: "Handle
//! (entry): self-guard, rate-limit, backpressure gate, timestamp
//! validation, dedup, processing, enqueue").

use std::path::Path;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use logbeam_core::time::{validate_timestamp, InvalidTimestampAction, TimestampVerdict};
use logbeam_core::LogEntry;
use logbeam_file_source::RateLimiter;
use parking_lot::Mutex;
use tracing::warn;

use crate::backpressure::{BackpressureController, DegradationManager, Feature};
use crate::config::{InvalidTimestampActionConfig, RateLimitConfig, SelfGuardConfig, TimestampValidationConfig};
use crate::dedup::Deduplicator;
use crate::processing::ProcessingRegistry;
use crate::selfguard::{self, Verdict as SelfGuardVerdict};

pub enum GateOutcome {
    Pass(LogEntry),
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SelfLog,
    RateLimited,
    BackpressureRejected,
    TimestampRejected,
    Duplicate,
    ProcessingDropped,
}

fn map_invalid_action(action: InvalidTimestampActionConfig) -> InvalidTimestampAction {
    match action {
        InvalidTimestampActionConfig::Clamp => InvalidTimestampAction::Clamp,
        InvalidTimestampActionConfig::Reject => InvalidTimestampAction::Reject,
        InvalidTimestampActionConfig::Warn => InvalidTimestampAction::Warn,
    }
}

pub struct Pipeline {
    pub selfguard: SelfGuardConfig,
    pub rate_limit: RateLimitConfig,
    pub timestamp_validation: TimestampValidationConfig,
    pub backpressure: Mutex<BackpressureController>,
    pub dedup: Mutex<Deduplicator>,
    pub degradation: Mutex<DegradationManager>,
    pub processing: ProcessingRegistry,
    rate_limiters: DashMap<String, RateLimiter>,
}

impl Pipeline {
    pub fn new(
        selfguard: SelfGuardConfig,
        rate_limit: RateLimitConfig,
        timestamp_validation: TimestampValidationConfig,
        backpressure: BackpressureController,
        dedup: Deduplicator,
        degradation: DegradationManager,
        processing: ProcessingRegistry,
    ) -> Self {
        Self {
            selfguard,
            rate_limit,
            timestamp_validation,
            backpressure: Mutex::new(backpressure),
            dedup: Mutex::new(dedup),
            degradation: Mutex::new(degradation),
            processing,
            rate_limiters: DashMap::new(),
        }
    }

    fn check_rate_limit(&self, entry: &LogEntry) -> bool {
        if self.rate_limit.max_lines_per_second == 0 {
            return true;
        }
        let mut limiter = self
            .rate_limiters
            .entry(entry.source_id.clone())
            .or_insert_with(|| RateLimiter::new(self.rate_limit.max_lines_per_second, self.rate_limit.quiet_period));
        limiter.allow(Path::new(&entry.source_id))
    }

    pub fn handle(&self, entry: LogEntry) -> GateOutcome {
        let entry = match selfguard::check(&self.selfguard, entry) {
            SelfGuardVerdict::Drop => return GateOutcome::Dropped(DropReason::SelfLog),
            SelfGuardVerdict::Pass(entry) => entry,
            SelfGuardVerdict::Tagged(entry) => entry,
        };

        if !self.check_rate_limit(&entry) {
            return GateOutcome::Dropped(DropReason::RateLimited);
        }

        if self.backpressure.lock().should_reject() {
            return GateOutcome::Dropped(DropReason::BackpressureRejected);
        }

        let mut entry = entry;
        if self.timestamp_validation.enabled {
            let (ts, verdict) = validate_timestamp(
                entry.event_timestamp,
                Utc::now(),
                ChronoDuration::seconds(self.timestamp_validation.max_past_age_seconds),
                ChronoDuration::seconds(self.timestamp_validation.max_future_age_seconds),
                map_invalid_action(self.timestamp_validation.invalid_action),
            );
            match verdict {
                TimestampVerdict::Rejected => return GateOutcome::Dropped(DropReason::TimestampRejected),
                TimestampVerdict::Clamped => entry.event_timestamp = ts,
                TimestampVerdict::Warned => {
                    warn!(source_id = %entry.source_id, "entry timestamp outside validation window");
                }
                TimestampVerdict::Ok => {}
            }
        }

        let dedup_disabled = self.degradation.lock().is_disabled(Feature::Deduplication);
        if !dedup_disabled && self.dedup.lock().is_duplicate(&entry) {
            return GateOutcome::Dropped(DropReason::Duplicate);
        }

        if self.degradation.lock().is_disabled(Feature::ComplexProcessing) {
            return GateOutcome::Pass(entry);
        }

        match self.processing.process(entry) {
            Some(entry) => GateOutcome::Pass(entry),
            None => GateOutcome::Dropped(DropReason::ProcessingDropped),
        }
    }
}
