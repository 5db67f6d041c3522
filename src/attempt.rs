//! The payload attempt state machine (§3, §4.5).
//!
//! [`AttemptController`] is the core of the crate: it owns the persisted
//! [`AttemptState`] fields, classifies every reported fault into exactly one
//! recovery action, and derives the URL-advancement, failure-counting and
//! backoff decisions the surrounding update agent acts on.

// std
use std::collections::HashMap;
// self
use crate::{
	_prelude::*,
	accounting::{DownloadAccounting, DownloadSource},
	clock::MonoInstant,
	config::PayloadStateConfig,
	fingerprint::{ResponseFingerprint, UpdateResponse},
	store::PersistentStore,
	BuildKind, RandomSource, RebootDetector,
};

const KEY_RESPONSE_SIGNATURE: &str = "current-response-signature";
const KEY_ATTEMPT_NUMBER: &str = "payload-attempt-number";
const KEY_URL_INDEX: &str = "current-url-index";
const KEY_URL_FAILURE_COUNT: &str = "current-url-failure-count";
const KEY_URL_SWITCH_COUNT: &str = "url-switch-count";
const KEY_BACKOFF_EXPIRY: &str = "backoff-expiry-time";
const KEY_TIMESTAMP_START: &str = "update-timestamp-start";
const KEY_DURATION_UPTIME: &str = "update-duration-uptime";
const KEY_NUM_REBOOTS: &str = "num-reboots";

/// Error codes a lower layer may report to [`AttemptController::update_failed`].
///
/// Every variant the downloader, Omaha client or payload applier can raise
/// must appear here, grouped by the fault class from §4.5.1. Adding a new
/// fault means adding a variant and extending [`ErrorCode::fault_class`] —
/// the match has no wildcard arm, so the build breaks until it's classified.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
	/// Downloaded payload's hash did not match the manifest.
	PayloadHashMismatch,
	/// Downloaded payload's size did not match the manifest.
	PayloadSizeMismatch,
	/// Post-download verification step failed.
	VerificationFailed,
	/// A signed delta payload's signature did not match its source image.
	SignedDeltaMismatch,
	/// Payload metadata was malformed.
	MalformedMetadata,
	/// The payload itself failed to parse.
	PayloadParseError,
	/// An update_engine operation failed its own internal verification.
	OperationVerificationError,
	/// An update_engine operation failed during execution.
	OperationExecutionError,
	/// The payload was missing a required signature.
	MissingSignature,

	/// An unclassified transfer-layer error.
	GenericError,
	/// The transfer itself failed (connection reset, timeout, truncation).
	TransferError,
	/// Writing the downloaded bytes to local storage failed.
	WriteError,
	/// The downloader failed to initialize its internal state.
	StateInitializationError,
	/// The HTTP layer reported a non-2xx status or transport error.
	HttpError,

	/// The Omaha request could not be constructed or sent.
	OmahaRequestError,
	/// The Omaha response could not be parsed or was semantically invalid.
	OmahaResponseError,
	/// A post-install hook failed.
	PostInstallError,
	/// Copying the payload into the target filesystem failed.
	FilesystemCopierError,
	/// Opening the target device node failed.
	DeviceOpenError,
	/// Activating the new partition failed.
	NewPartitionError,
	/// Device policy deferred this update.
	PolicyDeferred,
	/// The user changed channels mid-update, cancelling it.
	ChannelChangeCancelled,

	/// Success code routed through the failure path by mistake.
	Success,
	/// A reserved flag bit with no independent meaning.
	UnusedFlag,
	/// An aggregate/umbrella marker that never denotes a specific fault.
	AggregateMarker,
}
impl ErrorCode {
	/// Classify this code into exactly one recovery action (§4.5.1).
	pub fn fault_class(self) -> FaultClass {
		match self {
			ErrorCode::PayloadHashMismatch
			| ErrorCode::PayloadSizeMismatch
			| ErrorCode::VerificationFailed
			| ErrorCode::SignedDeltaMismatch
			| ErrorCode::MalformedMetadata
			| ErrorCode::PayloadParseError
			| ErrorCode::OperationVerificationError
			| ErrorCode::OperationExecutionError
			| ErrorCode::MissingSignature => FaultClass::PayloadCorruption,

			ErrorCode::GenericError
			| ErrorCode::TransferError
			| ErrorCode::WriteError
			| ErrorCode::StateInitializationError
			| ErrorCode::HttpError => FaultClass::TransientNetwork,

			ErrorCode::OmahaRequestError
			| ErrorCode::OmahaResponseError
			| ErrorCode::PostInstallError
			| ErrorCode::FilesystemCopierError
			| ErrorCode::DeviceOpenError
			| ErrorCode::NewPartitionError
			| ErrorCode::PolicyDeferred
			| ErrorCode::ChannelChangeCancelled => FaultClass::NonUrlFault,

			ErrorCode::Success | ErrorCode::UnusedFlag | ErrorCode::AggregateMarker => {
				FaultClass::NotAnError
			},
		}
	}
}

/// The recovery action a classified fault triggers (§4.5.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultClass {
	/// The URL/proxy/protocol entity is suspect; rotate to the next URL.
	PayloadCorruption,
	/// The URL itself may still be best; retry it with a failure-count penalty.
	TransientNetwork,
	/// Not attributable to the URL; neither count nor index changes.
	NonUrlFault,
	/// Shouldn't reach this path; logged and ignored.
	NotAnError,
}

/// A read-only snapshot of the persisted fields, for inspection (§10.6) and
/// tests.
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptState {
	/// Fingerprint of the response this state belongs to.
	pub response_fingerprint: ResponseFingerprint,
	/// Completed payload download attempts, for backoff computation.
	pub payload_attempt_number: u64,
	/// Index into the response's URL sequence.
	pub url_index: u64,
	/// Consecutive failures against the current URL.
	pub url_failure_count: u64,
	/// Cumulative URL transitions within this update.
	pub url_switch_count: u64,
	/// Null instant means "no backoff."
	pub backoff_expiry: WallInstant,
	/// When this update began.
	pub update_timestamp_start: WallInstant,
	/// Accumulated monotonic uptime spent on this update.
	pub update_duration_uptime: Duration,
	/// Reboots observed during this update.
	pub num_reboots: u64,
}

/// Everything [`crate::metrics_reporter::MetricsReporter`] needs to emit the
/// terminal metric set of §4.6, produced by [`AttemptController::update_succeeded`].
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptSummary {
	/// `(current_bytes, total_bytes)` per source, in the order of
	/// [`DownloadSource::ALL`].
	pub bytes_by_source: Vec<(DownloadSource, u64, u64)>,
	/// Cumulative URL transitions within this update.
	pub url_switch_count: u64,
	/// Reboots observed during this update.
	pub num_reboots: u64,
	/// Wall-clock duration of the update, start to success.
	pub wall_duration: Duration,
	/// Monotonic uptime duration of the update.
	pub uptime_duration: Duration,
}

/// Owns the persisted attempt state and all the transition logic in §4.5.
///
/// Single-threaded by design (§5); the crate's `PayloadStateHandle` adds the
/// `Arc<Mutex<..>>` wrapper a multi-threaded host needs.
#[derive(Debug)]
pub struct AttemptController {
	store: Box<dyn PersistentStore>,
	clock: Box<dyn Clock>,
	random: Box<dyn RandomSource>,
	build_kind: Box<dyn BuildKind>,
	reboot_detector: Box<dyn RebootDetector>,
	config: PayloadStateConfig,
	response: Option<UpdateResponse>,
	uptime_anchor: MonoInstant,
}
impl AttemptController {
	/// Construct a controller over the given collaborators. Does not load
	/// any persisted state; call [`AttemptController::initialize`] first.
	pub fn new(
		store: Box<dyn PersistentStore>,
		clock: Box<dyn Clock>,
		random: Box<dyn RandomSource>,
		build_kind: Box<dyn BuildKind>,
		reboot_detector: Box<dyn RebootDetector>,
		config: PayloadStateConfig,
	) -> Self {
		Self {
			store,
			clock,
			random,
			build_kind,
			reboot_detector,
			config,
			response: None,
			uptime_anchor: MonoInstant::default(),
		}
	}

	fn accounting(&self) -> DownloadAccounting<'_> {
		let mut accounting = DownloadAccounting::new(self.store.as_ref());
		accounting.set_current_url(self.current_url());

		accounting
	}

	fn current_url(&self) -> Option<&url::Url> {
		let response = self.response.as_ref()?;
		let index = self.get_clamped(KEY_URL_INDEX) as usize;

		response.urls.get(index)
	}

	// --- persisted field access, clamping negatives per invariant 6 -----

	fn get_clamped(&self, key: &str) -> u64 {
		match self.store.get_i64(key) {
			Some(v) if v >= 0 => v as u64,
			Some(v) => {
				tracing::error!(key, value = v, "persisted field was negative, clamping to 0");

				0
			},
			None => 0,
		}
	}

	fn set_u64(&self, key: &str, value: u64) {
		if let Err(err) = self.store.set_i64(key, value as i64) {
			tracing::error!(key, error = %err, "failed to persist field");
		}
	}

	fn get_wall_instant(&self, key: &str) -> WallInstant {
		WallInstant::from_secs(self.get_clamped(key) as i64)
	}

	fn set_wall_instant(&self, key: &str, instant: WallInstant) {
		self.set_u64(key, instant.as_secs().max(0) as u64);
	}

	/// Read the full persisted state without mutating anything.
	pub fn snapshot(&self) -> AttemptState {
		AttemptState {
			response_fingerprint: self
				.store
				.get_string(KEY_RESPONSE_SIGNATURE)
				.map(ResponseFingerprint::from_persisted)
				.unwrap_or_default(),
			payload_attempt_number: self.get_clamped(KEY_ATTEMPT_NUMBER),
			url_index: self.get_clamped(KEY_URL_INDEX),
			url_failure_count: self.get_clamped(KEY_URL_FAILURE_COUNT),
			url_switch_count: self.get_clamped(KEY_URL_SWITCH_COUNT),
			backoff_expiry: self.get_wall_instant(KEY_BACKOFF_EXPIRY),
			update_timestamp_start: self.get_wall_instant(KEY_TIMESTAMP_START),
			update_duration_uptime: Duration::from_secs(self.get_clamped(KEY_DURATION_UPTIME)),
			num_reboots: self.get_clamped(KEY_NUM_REBOOTS),
		}
	}

	/// The download source classified from the current URL, if any.
	pub fn current_source(&self) -> Option<DownloadSource> {
		self.accounting().current_source()
	}

	// --- public operations (§4.5) ---------------------------------------

	/// Load persisted fields, defend against corrupted or stale values, and
	/// anchor the uptime accumulator. Must be called once before any other
	/// operation after construction or a process restart.
	pub fn initialize(&mut self) {
		let now = self.clock.wallclock_now();
		let slack = self.config.clock_skew_slack;

		let max_future_backoff =
			now.saturating_add(Duration::from_secs(self.config.max_backoff_days as u64 * 86_400));
		let backoff_expiry = self.get_wall_instant(KEY_BACKOFF_EXPIRY);
		if !backoff_expiry.is_zero() && backoff_expiry > max_future_backoff {
			let err = Error::InvalidPersistedValue {
				field: KEY_BACKOFF_EXPIRY,
				reason: format!("{backoff_expiry:?} is beyond the configured max backoff horizon"),
			};

			tracing::error!(error = %err, "resetting");
			self.set_wall_instant(KEY_BACKOFF_EXPIRY, WallInstant::ZERO);
		}

		let start = self.get_wall_instant(KEY_TIMESTAMP_START);
		let max_future_start = now.saturating_add(slack);
		if start > max_future_start {
			let err = Error::InvalidPersistedValue {
				field: KEY_TIMESTAMP_START,
				reason: format!("{start:?} is in the future beyond clock-skew slack"),
			};

			tracing::error!(error = %err, "resetting to now");
			self.set_wall_instant(KEY_TIMESTAMP_START, now);
		}

		let start = self.get_wall_instant(KEY_TIMESTAMP_START);
		let wallclock_duration = now.saturating_duration_since(start);
		let uptime_duration = Duration::from_secs(self.get_clamped(KEY_DURATION_UPTIME));
		if uptime_duration > wallclock_duration.saturating_add(slack) {
			let err = Error::InvalidPersistedValue {
				field: KEY_DURATION_UPTIME,
				reason: format!("{uptime_duration:?} exceeds wall-clock duration {wallclock_duration:?}"),
			};

			tracing::error!(error = %err, "resetting");
			self.set_u64(KEY_DURATION_UPTIME, wallclock_duration.as_secs());
		}

		self.uptime_anchor = self.clock.monotonic_now();
	}

	/// Observe a (possibly new) update response (§4.5 `set_response`).
	pub fn set_response(&mut self, response: UpdateResponse) -> Result<()> {
		response.validate()?;

		let fresh_fingerprint = response.fingerprint();
		let stored_fingerprint = self
			.store
			.get_string(KEY_RESPONSE_SIGNATURE)
			.map(ResponseFingerprint::from_persisted)
			.unwrap_or_default();

		if fresh_fingerprint != stored_fingerprint {
			tracing::info!("response fingerprint changed, resetting attempt state");
			self.reset_persistent_state();
			if let Err(err) =
				self.store.set_string(KEY_RESPONSE_SIGNATURE, fresh_fingerprint.as_str())
			{
				tracing::error!(error = %err, "failed to persist response fingerprint");
			}
			self.response = Some(response);

			return Ok(());
		}

		let url_index = self.get_clamped(KEY_URL_INDEX);
		if url_index as usize >= response.urls.len() {
			let err = Error::InvalidPersistedValue {
				field: KEY_URL_INDEX,
				reason: format!("index {url_index} is out of range for {} urls", response.urls.len()),
			};

			tracing::error!(error = %err, "tampered persisted state, resetting");
			self.reset_persistent_state();
			self.response = Some(response);

			return Ok(());
		}

		self.response = Some(response);

		Ok(())
	}

	/// Record `n` freshly downloaded bytes (§4.5 `download_progress`).
	pub fn download_progress(&mut self, n: u64) {
		if n == 0 {
			return;
		}

		self.accrue_uptime();
		self.accounting().on_bytes(n);

		#[cfg(feature = "metrics")]
		crate::metrics_reporter::record_progress_bytes(n);

		if self.get_clamped(KEY_URL_FAILURE_COUNT) > 0 {
			self.set_u64(KEY_URL_FAILURE_COUNT, 0);
		}
	}

	/// One payload download attempt finished (§4.5 `download_complete`).
	pub fn download_complete(&mut self) {
		self.increment_payload_attempt_number();
	}

	/// The agent resumed after a possible reboot (§4.5.4).
	pub fn update_resumed(&mut self) {
		if self.reboot_detector.system_just_rebooted() {
			let num_reboots = self.get_clamped(KEY_NUM_REBOOTS) + 1;

			tracing::info!(num_reboots, "reboot observed during update");
			self.set_u64(KEY_NUM_REBOOTS, num_reboots);
		}
	}

	/// The agent restarted mid-update (not necessarily a reboot).
	pub fn update_restarted(&mut self) {
		self.accounting().reset_current_on_new_update();
		self.set_u64(KEY_NUM_REBOOTS, 0);
	}

	/// The update completed successfully (§4.5 `update_succeeded`, §4.6).
	///
	/// Returns the data the metrics reporter needs; it does not emit metrics
	/// itself so that a caller without a configured sink can still drain
	/// state correctly.
	pub fn update_succeeded(&mut self) -> AttemptSummary {
		self.accrue_uptime();

		let now = self.clock.wallclock_now();
		let start = self.get_wall_instant(KEY_TIMESTAMP_START);
		let wall_duration = now.saturating_duration_since(start);
		let uptime_duration = Duration::from_secs(self.get_clamped(KEY_DURATION_UPTIME));

		let accounting = self.accounting();
		let bytes_by_source = DownloadSource::ALL
			.into_iter()
			.map(|source| (source, accounting.current_bytes(source), accounting.total_bytes(source)))
			.collect();
		let summary = AttemptSummary {
			bytes_by_source,
			url_switch_count: self.get_clamped(KEY_URL_SWITCH_COUNT),
			num_reboots: self.get_clamped(KEY_NUM_REBOOTS),
			wall_duration,
			uptime_duration,
		};

		self.accounting().drain_on_success();
		self.set_wall_instant(KEY_TIMESTAMP_START, now);
		self.set_u64(KEY_DURATION_UPTIME, 0);
		self.uptime_anchor = self.clock.monotonic_now();

		tracing::info!(?summary, "update succeeded");

		summary
	}

	/// A download or install step failed; classify and dispatch (§4.5.1).
	pub fn update_failed(&mut self, error: ErrorCode) {
		let has_urls = self.response.as_ref().is_some_and(|r| !r.urls.is_empty());
		if !has_urls {
			return;
		}

		let class = error.fault_class();

		#[cfg(feature = "metrics")]
		crate::metrics_reporter::record_fault(class);

		match class {
			FaultClass::PayloadCorruption => {
				tracing::info!(?error, "payload corruption, advancing url");
				self.increment_url_index();
			},
			FaultClass::TransientNetwork => {
				tracing::debug!(?error, "transient network fault, counting failure");
				self.increment_failure_count();
			},
			FaultClass::NonUrlFault => {
				tracing::debug!(?error, "non-url fault, no state change");
			},
			FaultClass::NotAnError => {
				tracing::warn!(?error, "non-error code reached update_failed");
			},
		}
	}

	/// Whether the agent should currently defer downloading (§4.5 `should_backoff_download`).
	pub fn should_backoff_download(&self) -> bool {
		let Some(response) = &self.response else { return false };

		if response.disable_backoff || response.is_delta {
			return false;
		}
		if !self.build_kind.is_official_build() {
			return false;
		}

		let expiry = self.get_wall_instant(KEY_BACKOFF_EXPIRY);
		if expiry.is_zero() {
			return false;
		}

		expiry > self.clock.wallclock_now()
	}

	// --- internal transition helpers (§4.5.2) ---------------------------

	fn increment_failure_count(&mut self) {
		let Some(response) = &self.response else { return };
		let max_failures = response.max_failures_per_url as u64;
		let next_count = self.get_clamped(KEY_URL_FAILURE_COUNT) + 1;

		if next_count >= max_failures {
			self.increment_url_index();
		} else {
			self.set_u64(KEY_URL_FAILURE_COUNT, next_count);
		}
	}

	fn increment_url_index(&mut self) {
		let Some(response) = &self.response else { return };
		let num_urls = response.urls.len() as u64;
		if num_urls == 0 {
			return;
		}

		let current_index = self.get_clamped(KEY_URL_INDEX);
		let next_index = current_index + 1;

		if next_index < num_urls {
			self.set_u64(KEY_URL_INDEX, next_index);
		} else {
			self.set_u64(KEY_URL_INDEX, 0);
			self.increment_payload_attempt_number();
		}

		if num_urls > 1 {
			let switches = self.get_clamped(KEY_URL_SWITCH_COUNT) + 1;
			self.set_u64(KEY_URL_SWITCH_COUNT, switches);
		}

		self.set_u64(KEY_URL_FAILURE_COUNT, 0);
	}

	fn increment_payload_attempt_number(&mut self) {
		let Some(response) = &self.response else { return };
		if response.is_delta {
			return;
		}

		let next = self.get_clamped(KEY_ATTEMPT_NUMBER) + 1;
		self.set_u64(KEY_ATTEMPT_NUMBER, next);
		self.update_backoff_expiry();
	}

	fn update_backoff_expiry(&mut self) {
		let Some(response) = &self.response else { return };

		if response.disable_backoff {
			self.set_wall_instant(KEY_BACKOFF_EXPIRY, WallInstant::ZERO);
			return;
		}

		let attempt_number = self.get_clamped(KEY_ATTEMPT_NUMBER);
		if attempt_number == 0 {
			self.set_wall_instant(KEY_BACKOFF_EXPIRY, WallInstant::ZERO);
			return;
		}

		let shift = (attempt_number - 1).min(self.config.max_backoff_shift as u64) as u32;
		let days = (1u64 << shift).min(self.config.max_backoff_days as u64);
		let fuzz_minutes =
			self.random.uniform(0, self.config.fuzz_window_minutes).max(0) as u64;
		let backoff_secs = days * 86_400 + fuzz_minutes * 60;
		let expiry = self.clock.wallclock_now().saturating_add(Duration::from_secs(backoff_secs));

		tracing::debug!(attempt_number, days, fuzz_minutes, "recomputed backoff expiry");
		self.set_wall_instant(KEY_BACKOFF_EXPIRY, expiry);
	}

	/// Reset all attempt-local counters for a genuinely new update (§4.5.5).
	fn reset_persistent_state(&mut self) {
		self.set_u64(KEY_ATTEMPT_NUMBER, 0);
		self.set_u64(KEY_URL_INDEX, 0);
		self.set_u64(KEY_URL_FAILURE_COUNT, 0);
		self.set_u64(KEY_URL_SWITCH_COUNT, 0);
		self.set_wall_instant(KEY_BACKOFF_EXPIRY, WallInstant::ZERO);
		self.set_wall_instant(KEY_TIMESTAMP_START, self.clock.wallclock_now());
		self.set_u64(KEY_DURATION_UPTIME, 0);
		self.accounting().reset_current_on_new_update();
		self.uptime_anchor = self.clock.monotonic_now();
	}

	fn accrue_uptime(&mut self) {
		let now = self.clock.monotonic_now();
		let delta = now.saturating_duration_since(self.uptime_anchor);
		let updated = Duration::from_secs(self.get_clamped(KEY_DURATION_UPTIME)).saturating_add(delta);

		self.set_u64(KEY_DURATION_UPTIME, updated.as_secs());
		self.uptime_anchor = now;
	}
}

/// Index error codes by fault class, for tests that want to exercise one
/// representative of each class without enumerating every variant.
pub fn representatives() -> HashMap<FaultClass, ErrorCode> {
	let mut map = HashMap::new();

	map.insert(FaultClass::PayloadCorruption, ErrorCode::PayloadHashMismatch);
	map.insert(FaultClass::TransientNetwork, ErrorCode::TransferError);
	map.insert(FaultClass::NonUrlFault, ErrorCode::PostInstallError);
	map.insert(FaultClass::NotAnError, ErrorCode::Success);

	map
}
