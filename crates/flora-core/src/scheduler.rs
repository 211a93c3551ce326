//! Active poll decisions.
//!
//! A poll is a connection-based read that costs the device battery and takes
//! seconds. It is only attempted when the decoded advertisement asks for one,
//! and never more often than the device's poll interval. Spacing counts from
//! the last attempt, so a device that keeps failing is not retried on every
//! advertisement.

use time::OffsetDateTime;

use flora_types::SensorUpdate;

use crate::registry::DeviceState;

/// Outcome of a scheduling decision, kept for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// Passive data was sufficient.
    NotNeeded,
    /// A poll for this device is already outstanding.
    InFlight,
    /// No poll has been attempted yet.
    FirstPoll,
    /// The poll interval has elapsed.
    Due,
    /// Polled too recently.
    RateLimited {
        /// Time until the next poll is allowed.
        remaining: time::Duration,
    },
}

impl PollDecision {
    /// Evaluate the poll policy for one processing step.
    pub fn evaluate(state: &DeviceState, update: &SensorUpdate, now: OffsetDateTime) -> Self {
        if !update.needs_poll {
            return Self::NotNeeded;
        }
        if state.is_polling() {
            return Self::InFlight;
        }
        let Some(last) = state.last_attempt_at.or(state.last_polled_at) else {
            return Self::FirstPoll;
        };
        let elapsed = now - last;
        let interval =
            time::Duration::try_from(state.poll_interval).unwrap_or(time::Duration::MAX);
        if elapsed >= interval {
            Self::Due
        } else {
            Self::RateLimited {
                remaining: interval - elapsed,
            }
        }
    }

    pub fn should_poll(&self) -> bool {
        matches!(self, Self::FirstPoll | Self::Due)
    }
}

/// Whether an active poll should start now.
///
/// - `false` when the update carries no poll hint
/// - `false` while a poll for the device is outstanding
/// - `true` when no poll has been attempted yet
/// - otherwise `true` only once `now - last_attempt_at >= poll_interval`
pub fn should_poll(state: &DeviceState, update: &SensorUpdate, now: OffsetDateTime) -> bool {
    PollDecision::evaluate(state, update, now).should_poll()
}
