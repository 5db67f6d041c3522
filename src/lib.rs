//! Crash-safe payload retry state machine for an over-the-air update agent —
//! URL rotation, exponential backoff, and download telemetry.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

// self
#[cfg(test)]
use payload_state as _;

// std
use std::sync::{Arc, Mutex};
// self
use crate::{
	attempt::{AttemptController, AttemptState, ErrorCode},
	clock::{Clock, SystemClock},
	config::PayloadStateConfig,
	fingerprint::UpdateResponse,
	store::PersistentStore,
};

pub mod accounting;
pub mod attempt;
pub mod clock;
pub mod config;
pub mod fingerprint;
#[cfg(feature = "metrics")] pub mod metrics_reporter;
pub mod store;

mod error;
mod _prelude {
	pub use std::time::{Duration, SystemTime};

	pub use chrono::{DateTime, Utc};

	pub use crate::{
		clock::{Clock, WallInstant},
		Error, Result,
	};
}
#[cfg(feature = "metrics")]
pub use crate::metrics_reporter::{MetricsReporter, MetricsSink, UmaMetricsSink};
#[cfg(feature = "prometheus")]
pub use crate::metrics_reporter::install_default_exporter;
pub use crate::{
	accounting::DownloadSource,
	attempt::FaultClass,
	error::{Error, Result},
};

/// Whether backoff applies at all on this build (§6 `BuildKind`).
///
/// Non-official builds (developer, test-image) skip backoff entirely so
/// engineers iterating on a device are never throttled by production retry
/// policy.
pub trait BuildKind: std::fmt::Debug + Send + Sync {
	/// Whether this is an official, production build.
	fn is_official_build(&self) -> bool;
}

/// Single-shot reboot signal (§6 `RebootDetector`).
///
/// Implementations are expected to answer "yes" at most once per boot; the
/// state machine relies on that for `update_resumed`'s idempotence.
pub trait RebootDetector: std::fmt::Debug + Send + Sync {
	/// Whether the system was just rebooted, since this was last asked.
	fn system_just_rebooted(&self) -> bool;
}

/// Source of randomness for backoff fuzz (§6 `RandomSource`).
pub trait RandomSource: std::fmt::Debug + Send + Sync {
	/// A uniformly distributed integer in `[lo, hi)`.
	fn uniform(&self, lo: i64, hi: i64) -> i64;
}

/// [`RandomSource`] backed by the `rand` crate's thread-local generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;
impl RandomSource for ThreadRandom {
	fn uniform(&self, lo: i64, hi: i64) -> i64 {
		if lo >= hi {
			return lo;
		}

		rand::Rng::random_range(&mut rand::rng(), lo..hi)
	}
}

/// Top-level facade composing the state machine over its injected
/// collaborators (§9 design notes: explicit ownership, no global state).
#[derive(Debug)]
pub struct PayloadState {
	controller: AttemptController,
}
impl PayloadState {
	/// Construct a state machine over the given collaborators and load its
	/// persisted fields.
	pub fn new(
		store: Box<dyn PersistentStore>,
		clock: Box<dyn Clock>,
		random: Box<dyn RandomSource>,
		build_kind: Box<dyn BuildKind>,
		reboot_detector: Box<dyn RebootDetector>,
		config: PayloadStateConfig,
	) -> Self {
		let mut controller =
			AttemptController::new(store, clock, random, build_kind, reboot_detector, config);

		controller.initialize();

		Self { controller }
	}

	/// Construct a state machine with the production [`SystemClock`] and
	/// [`ThreadRandom`] collaborators, over the given store, build-kind and
	/// reboot detector.
	pub fn with_system_collaborators(
		store: Box<dyn PersistentStore>,
		build_kind: Box<dyn BuildKind>,
		reboot_detector: Box<dyn RebootDetector>,
	) -> Self {
		Self::new(
			store,
			Box::new(SystemClock),
			Box::new(ThreadRandom),
			build_kind,
			reboot_detector,
			PayloadStateConfig::default(),
		)
	}

	/// Wrap this state machine in a [`PayloadStateHandle`] for sharing across
	/// threads (§5 "Thread-safety wrapper").
	pub fn into_handle(self) -> PayloadStateHandle {
		PayloadStateHandle(Arc::new(Mutex::new(self)))
	}

	/// Read-only snapshot of the persisted attempt state, for inspection.
	pub fn snapshot(&self) -> AttemptState {
		self.controller.snapshot()
	}

	/// Observe a (possibly new) update response.
	pub fn set_response(&mut self, response: UpdateResponse) -> Result<()> {
		self.controller.set_response(response)
	}

	/// Record `n` freshly downloaded bytes.
	pub fn download_progress(&mut self, n: u64) {
		self.controller.download_progress(n);
	}

	/// One payload download attempt finished.
	pub fn download_complete(&mut self) {
		self.controller.download_complete();
	}

	/// The agent resumed after a possible reboot.
	pub fn update_resumed(&mut self) {
		self.controller.update_resumed();
	}

	/// The agent restarted mid-update.
	pub fn update_restarted(&mut self) {
		self.controller.update_restarted();
	}

	/// The update completed successfully; emit metrics through `sink` and
	/// drain accounting state (§4.5 `update_succeeded`, §4.6).
	#[cfg(feature = "metrics")]
	pub fn update_succeeded(&mut self, sink: &dyn MetricsSink) {
		let summary = self.controller.update_succeeded();

		MetricsReporter::new(sink).emit_terminal(&summary);
	}

	/// The update completed successfully, without a configured metrics sink.
	/// State is still finalized and drained; no samples are emitted.
	#[cfg(not(feature = "metrics"))]
	pub fn update_succeeded(&mut self) {
		self.controller.update_succeeded();
	}

	/// A download or install step failed; classify and dispatch.
	pub fn update_failed(&mut self, error: ErrorCode) {
		self.controller.update_failed(error);
	}

	/// Whether the agent should currently defer downloading.
	pub fn should_backoff_download(&self) -> bool {
		self.controller.should_backoff_download()
	}
}

/// Thread-safe handle over a [`PayloadState`] (§5 "Thread-safety wrapper"),
/// for a host process with more than one caller (a D-Bus service loop plus a
/// timer thread driving periodic checks, say).
#[derive(Clone, Debug)]
pub struct PayloadStateHandle(Arc<Mutex<PayloadState>>);
impl PayloadStateHandle {
	/// Run `f` against the underlying state machine under the lock.
	pub fn with<R>(&self, f: impl FnOnce(&mut PayloadState) -> R) -> R {
		let mut guard = self.0.lock().expect("payload state lock poisoned");

		f(&mut guard)
	}
}

/// Test-only fakes for the collaborator traits, shared by this crate's own
/// unit tests and available to downstream crates that want the same fakes
/// for their own tests.
#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
	// self
	use super::*;

	/// [`RandomSource`] that always returns a fixed value, clamped into range.
	#[derive(Clone, Copy, Debug)]
	pub struct FixedRandom(pub i64);
	impl RandomSource for FixedRandom {
		fn uniform(&self, lo: i64, hi: i64) -> i64 {
			self.0.clamp(lo, (hi - 1).max(lo))
		}
	}

	/// [`BuildKind`] that always reports an official build.
	#[derive(Clone, Copy, Debug, Default)]
	pub struct OfficialBuild;
	impl BuildKind for OfficialBuild {
		fn is_official_build(&self) -> bool {
			true
		}
	}

	/// [`BuildKind`] that always reports a non-official build.
	#[derive(Clone, Copy, Debug, Default)]
	pub struct DeveloperBuild;
	impl BuildKind for DeveloperBuild {
		fn is_official_build(&self) -> bool {
			false
		}
	}

	/// [`RebootDetector`] that never signals a reboot.
	#[derive(Clone, Copy, Debug, Default)]
	pub struct NeverRebooted;
	impl RebootDetector for NeverRebooted {
		fn system_just_rebooted(&self) -> bool {
			false
		}
	}

	/// [`RebootDetector`] that signals a reboot exactly once.
	#[derive(Debug, Default)]
	pub struct RebootedOnce(std::sync::atomic::AtomicBool);
	impl RebootedOnce {
		/// Construct a detector that has not yet fired.
		pub fn new() -> Self {
			Self(std::sync::atomic::AtomicBool::new(true))
		}
	}
	impl RebootDetector for RebootedOnce {
		fn system_just_rebooted(&self) -> bool {
			self.0.swap(false, std::sync::atomic::Ordering::SeqCst)
		}
	}
}


// `clap` and `tracing-subscriber` are only ever used by `bin/payload_state_inspect.rs`,
// never by this library target itself; without this, enabling `cli` to build
// the binary trips `unused_crate_dependencies` on the library compilation.
#[cfg(feature = "cli")]
mod _cli_deps {
	use clap as _;
	use tracing_subscriber as _;
}
