//! Quantified invariants and round-trip properties (spec §8 INV-*/RT-*),
//! exercised as deterministic operation sequences against the controller
//! directly so each assertion can inspect persisted fields precisely.

// crates.io
use payload_state::{
	attempt::{AttemptController, ErrorCode},
	clock::{FakeClock, WallInstant},
	config::PayloadStateConfig,
	fingerprint::UpdateResponse,
	store::MemoryStore,
	test_support::{FixedRandom, NeverRebooted, OfficialBuild},
};
use url::Url;

fn response(urls: &[&str], max_failures: u32) -> UpdateResponse {
	UpdateResponse {
		urls: urls.iter().map(|u| Url::parse(u).unwrap()).collect(),
		payload_size: 4096,
		payload_hash: "hash".into(),
		metadata_size: 128,
		metadata_signature: "sig".into(),
		is_delta: false,
		max_failures_per_url: max_failures,
		disable_backoff: false,
	}
}

fn controller() -> AttemptController {
	let mut controller = AttemptController::new(
		Box::new(MemoryStore::new()),
		Box::new(FakeClock::new(WallInstant::from_secs(50_000))),
		Box::new(FixedRandom(0)),
		Box::new(OfficialBuild),
		Box::new(NeverRebooted),
		PayloadStateConfig::default(),
	);

	controller.initialize();

	controller
}

/// (INV-1) `0 <= url_index < len(urls)` after any sequence, whenever
/// `len(urls) > 0`.
#[test]
fn inv1_url_index_always_stays_in_range() {
	let _ = tracing_subscriber::fmt::try_init();

	let mut controller = controller();
	let urls = ["https://a.example/p", "http://b.example/p", "https://c.example/p"];

	controller.set_response(response(&urls, 2)).unwrap();

	for _ in 0..20 {
		controller.update_failed(ErrorCode::TransferError);
		assert!((controller.snapshot().url_index as usize) < urls.len());
	}
}

/// (INV-2) A genuinely new fingerprint resets every other field to its
/// initial value.
#[test]
fn inv2_fingerprint_change_resets_all_other_fields() {
	let mut controller = controller();

	controller.set_response(response(&["https://a.example/p"], 1)).unwrap();
	controller.update_failed(ErrorCode::TransferError);
	controller.download_progress(10);
	assert!(controller.snapshot().payload_attempt_number > 0);

	controller.set_response(response(&["https://b.example/p", "https://c.example/p"], 5)).unwrap();

	let snapshot = controller.snapshot();
	assert_eq!(snapshot.payload_attempt_number, 0);
	assert_eq!(snapshot.url_index, 0);
	assert_eq!(snapshot.url_failure_count, 0);
	assert_eq!(snapshot.url_switch_count, 0);
	assert!(snapshot.backoff_expiry.is_zero());
}

/// (INV-3) `backoff_expiry` is null exactly when `payload_attempt_number == 0`.
#[test]
fn inv3_backoff_expiry_is_null_until_first_attempt_completes() {
	let mut controller = controller();

	controller.set_response(response(&["https://a.example/p"], 1)).unwrap();
	assert_eq!(controller.snapshot().payload_attempt_number, 0);
	assert!(controller.snapshot().backoff_expiry.is_zero());

	controller.update_failed(ErrorCode::TransferError);

	assert!(controller.snapshot().payload_attempt_number > 0);
	assert!(!controller.snapshot().backoff_expiry.is_zero());
}

/// (INV-4) `payload_attempt_number` never decreases until a success or a
/// fingerprint change.
#[test]
fn inv4_payload_attempt_number_is_monotonic_until_success() {
	let mut controller = controller();

	controller.set_response(response(&["https://a.example/p"], 1)).unwrap();

	let mut last = 0;
	for _ in 0..10 {
		controller.update_failed(ErrorCode::TransferError);
		let current = controller.snapshot().payload_attempt_number;
		assert!(current >= last);
		last = current;
	}
}

/// (INV-5) Any positive `download_progress` clears the failure count.
#[test]
fn inv5_progress_always_clears_failure_count() {
	let mut controller = controller();

	controller.set_response(response(&["https://a.example/p"], 10)).unwrap();
	controller.update_failed(ErrorCode::TransferError);
	controller.update_failed(ErrorCode::TransferError);
	assert!(controller.snapshot().url_failure_count > 0);

	controller.download_progress(1);

	assert_eq!(controller.snapshot().url_failure_count, 0);
}

/// (INV-6) Persisted uptime never exceeds wall-clock duration plus the
/// clock-skew slack.
#[test]
fn inv6_uptime_never_exceeds_wallclock_plus_slack() {
	let clock = std::sync::Arc::new(FakeClock::new(WallInstant::from_secs(50_000)));
	let mut controller = AttemptController::new(
		Box::new(MemoryStore::new()),
		Box::new(FakeClockHandle(clock.clone())),
		Box::new(FixedRandom(0)),
		Box::new(OfficialBuild),
		Box::new(NeverRebooted),
		PayloadStateConfig::default(),
	);

	controller.initialize();
	controller.set_response(response(&["https://a.example/p"], 10)).unwrap();

	clock.advance(std::time::Duration::from_secs(120));
	controller.download_progress(10);

	let snapshot = controller.snapshot();
	assert!(
		snapshot.update_duration_uptime
			<= std::time::Duration::from_secs(120).saturating_add(std::time::Duration::from_secs(600))
	);
}

/// (RT-2) Calling `reset_persistent_state` twice (via two fingerprint
/// changes in a row) is equivalent to calling it once.
#[test]
fn rt2_double_reset_equals_single_reset() {
	let mut controller = controller();

	controller.set_response(response(&["https://a.example/p"], 1)).unwrap();
	controller.update_failed(ErrorCode::TransferError);

	controller.set_response(response(&["https://b.example/p"], 7)).unwrap();
	let once = controller.snapshot();

	// A second, different fingerprint resets again; fields still land on the
	// same initial values, not some compounded state.
	controller.set_response(response(&["https://c.example/p", "https://d.example/p"], 9)).unwrap();
	let twice = controller.snapshot();

	assert_eq!(once.payload_attempt_number, twice.payload_attempt_number);
	assert_eq!(once.url_index, twice.url_index);
	assert_eq!(once.url_failure_count, twice.url_failure_count);
	assert_eq!(once.url_switch_count, twice.url_switch_count);
}

/// (RT-3) The same response always hashes to the same fingerprint.
#[test]
fn rt3_fingerprint_is_stable_across_independent_computations() {
	let a = response(&["https://a.example/p", "https://b.example/p"], 4);
	let b = response(&["https://a.example/p", "https://b.example/p"], 4);

	assert_eq!(a.fingerprint(), b.fingerprint());
}

/// A thin [`payload_state::clock::Clock`] adapter over a shared `FakeClock`,
/// so the test can advance time after construction while the controller
/// still owns its own boxed clock.
#[derive(Debug)]
struct FakeClockHandle(std::sync::Arc<FakeClock>);
impl payload_state::clock::Clock for FakeClockHandle {
	fn wallclock_now(&self) -> WallInstant {
		self.0.wallclock_now()
	}

	fn monotonic_now(&self) -> payload_state::clock::MonoInstant {
		self.0.monotonic_now()
	}
}
