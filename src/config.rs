//! Runtime configuration (§10.4).
//!
//! Groups the tunables that the original implementation wired in as literal
//! constants so they can be overridden by a host that wants different
//! backoff behavior without forking the crate.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Tunable parameters for [`crate::attempt::AttemptController`].
///
/// Constructed via [`PayloadStateConfig::builder`], or used directly via
/// [`Default`] for the documented spec defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadStateConfig {
	/// Ceiling on the exponential backoff, in days.
	pub max_backoff_days: u32,
	/// Tolerance for clock-skew defenses applied in `initialize()` (§4.5,
	/// invariant 5): how far a persisted instant may lead or lag the
	/// expected value before it is treated as corrupt and reset.
	pub clock_skew_slack: Duration,
	/// Width, in minutes, of the uniform fuzz window added around the base
	/// backoff (§4.5.2): `uniform(0, fuzz_window_minutes)`.
	pub fuzz_window_minutes: i64,
	/// Cap on the left-shift exponent used to compute the backoff, so that
	/// an unbounded `payload_attempt_number` can never overflow the shift.
	pub max_backoff_shift: u32,
}
impl Default for PayloadStateConfig {
	fn default() -> Self {
		Self {
			max_backoff_days: 16,
			clock_skew_slack: Duration::from_secs(10 * 60),
			fuzz_window_minutes: 720,
			max_backoff_shift: 30,
		}
	}
}
impl PayloadStateConfig {
	/// Start building a config from the documented defaults.
	pub fn builder() -> PayloadStateConfigBuilder {
		PayloadStateConfigBuilder { config: Self::default() }
	}

	/// Reject configurations that would make the backoff math meaningless.
	pub fn validate(&self) -> Result<()> {
		if self.max_backoff_days == 0 {
			return Err(Error::Validation {
				field: "max_backoff_days",
				reason: "Must be at least 1 day.".into(),
			});
		}
		if self.fuzz_window_minutes < 0 {
			return Err(Error::Validation {
				field: "fuzz_window_minutes",
				reason: "Must be non-negative.".into(),
			});
		}

		Ok(())
	}
}

/// Builder over [`PayloadStateConfig`], in the teacher's `RegistryBuilder`
/// style.
#[derive(Debug)]
pub struct PayloadStateConfigBuilder {
	config: PayloadStateConfig,
}
impl PayloadStateConfigBuilder {
	/// Override the backoff ceiling.
	pub fn max_backoff_days(mut self, days: u32) -> Self {
		self.config.max_backoff_days = days;
		self
	}

	/// Override the clock-skew slack.
	pub fn clock_skew_slack(mut self, slack: Duration) -> Self {
		self.config.clock_skew_slack = slack;
		self
	}

	/// Override the backoff fuzz window.
	pub fn fuzz_window_minutes(mut self, minutes: i64) -> Self {
		self.config.fuzz_window_minutes = minutes;
		self
	}

	/// Finish building, validating the result.
	pub fn build(self) -> Result<PayloadStateConfig> {
		self.config.validate()?;

		Ok(self.config)
	}
}
