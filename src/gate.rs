//! Trigger gate and cooldown state.
//!
//! `should_trigger` is pure: it reads the cooldown state but never updates it.
//! The detection loop records the trigger instant itself, at detection time,
//! before the capture is attempted. A failed capture therefore still starts a
//! full cooldown window.

use std::time::{Duration, Instant};

use crate::detect::Detection;

/// Instant of the last acted-upon trigger.
///
/// Single writer (the detection loop). The recorded instant never moves
/// backwards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CooldownState {
    last_trigger: Option<Instant>,
}

impl CooldownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_trigger(&self) -> Option<Instant> {
        self.last_trigger
    }

    /// True while `now` is inside the cooldown window that follows the last trigger.
    pub fn is_cooling_down(&self, now: Instant, period: Duration) -> bool {
        match self.last_trigger {
            Some(last) => now.saturating_duration_since(last) < period,
            None => false,
        }
    }

    /// Record a trigger at `at`. Earlier instants than the current one are ignored.
    pub fn record_trigger(&mut self, at: Instant) {
        match self.last_trigger {
            Some(last) if at < last => {
                log::debug!("ignoring out-of-order trigger instant");
            }
            _ => self.last_trigger = Some(at),
        }
    }
}

/// Static trigger policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GatePolicy {
    pub target_class: u32,
    pub confidence_threshold: f32,
    pub cooldown_period: Duration,
}

/// First detection that satisfies the policy's class and threshold, ignoring cooldown.
pub fn qualifying_detection<'a>(
    detections: &'a [Detection],
    policy: &GatePolicy,
) -> Option<&'a Detection> {
    detections
        .iter()
        .find(|det| det.qualifies(policy.target_class, policy.confidence_threshold))
}

/// Decide whether a sampled frame's detections should fire a recording.
///
/// False while cooling down, regardless of detections. Otherwise true iff at
/// least one detection matches the target class at or above the threshold.
pub fn should_trigger(
    detections: &[Detection],
    now: Instant,
    cooldown: &CooldownState,
    policy: &GatePolicy,
) -> bool {
    if cooldown.is_cooling_down(now, policy.cooldown_period) {
        return false;
    }
    qualifying_detection(detections, policy).is_some()
}
