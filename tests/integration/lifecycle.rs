//! End-to-end flows through the [`PayloadState`] facade, exercising
//! collaborators together rather than the controller in isolation.

// std
use std::sync::Mutex;
// crates.io
use payload_state::{
	attempt::ErrorCode,
	clock::{FakeClock, WallInstant},
	fingerprint::UpdateResponse,
	store::MemoryStore,
	test_support::{DeveloperBuild, NeverRebooted, OfficialBuild, RebootedOnce},
	MetricsSink, PayloadState, RandomSource,
};
use url::Url;

#[derive(Debug, Default)]
struct RecordingSink {
	samples: Mutex<Vec<(String, i64)>>,
}
impl MetricsSink for RecordingSink {
	fn send_to_uma(&self, name: &str, sample: i64, _min: i64, _max: i64, _buckets: u32) {
		self.samples.lock().unwrap().push((name.to_owned(), sample));
	}
}

#[derive(Debug, Clone, Copy)]
struct ZeroRandom;
impl RandomSource for ZeroRandom {
	fn uniform(&self, lo: i64, _hi: i64) -> i64 {
		lo
	}
}

fn response(urls: &[&str], max_failures: u32, is_delta: bool) -> UpdateResponse {
	UpdateResponse {
		urls: urls.iter().map(|u| Url::parse(u).unwrap()).collect(),
		payload_size: 1_048_576,
		payload_hash: "abc123".into(),
		metadata_size: 256,
		metadata_signature: "sig".into(),
		is_delta,
		max_failures_per_url: max_failures,
		disable_backoff: false,
	}
}

fn state() -> PayloadState {
	PayloadState::new(
		Box::new(MemoryStore::new()),
		Box::new(FakeClock::new(WallInstant::from_secs(10_000))),
		Box::new(ZeroRandom),
		Box::new(OfficialBuild),
		Box::new(NeverRebooted),
		Default::default(),
	)
}

#[test]
fn happy_path_emits_metrics_through_the_facade() {
	let _ = tracing_subscriber::fmt::try_init();

	let mut state = state();
	let sink = RecordingSink::default();

	state.set_response(response(&["https://a.example/payload.bin"], 10, false)).unwrap();
	state.download_progress(1_048_576);
	state.download_complete();
	state.update_succeeded(&sink);

	let samples = sink.samples.lock().unwrap();
	assert!(samples
		.iter()
		.any(|(name, sample)| name == "SuccessfulMBsDownloadedFromHttpsServer" && *sample == 1));
	assert!(samples.iter().any(|(name, sample)| name == "UpdateURLSwitches" && *sample == 0));

	let snapshot = state.snapshot();
	assert_eq!(snapshot.payload_attempt_number, 1);
}

#[test]
fn corruption_rotates_url_and_clears_backoff_gate_for_developer_builds() {
	let mut state = PayloadState::new(
		Box::new(MemoryStore::new()),
		Box::new(FakeClock::new(WallInstant::from_secs(10_000))),
		Box::new(ZeroRandom),
		Box::new(DeveloperBuild),
		Box::new(NeverRebooted),
		Default::default(),
	);

	state
		.set_response(response(&["https://a.example/payload.bin", "http://b.example/payload.bin"], 3, false))
		.unwrap();
	state.update_failed(ErrorCode::PayloadHashMismatch);

	let snapshot = state.snapshot();
	assert_eq!(snapshot.url_index, 1);
	assert_eq!(snapshot.url_switch_count, 1);
	// A developer build never backs off regardless of persisted expiry.
	assert!(!state.should_backoff_download());
}

#[test]
fn reboot_mid_update_is_counted_once_then_restart_clears_it() {
	let mut state = PayloadState::new(
		Box::new(MemoryStore::new()),
		Box::new(FakeClock::new(WallInstant::from_secs(10_000))),
		Box::new(ZeroRandom),
		Box::new(OfficialBuild),
		Box::new(RebootedOnce::new()),
		Default::default(),
	);

	state.set_response(response(&["https://a.example/payload.bin"], 3, false)).unwrap();
	state.update_resumed();
	state.update_resumed();
	assert_eq!(state.snapshot().num_reboots, 1);

	state.update_restarted();
	assert_eq!(state.snapshot().num_reboots, 0);
}

#[test]
fn delta_payload_never_arms_backoff_across_repeated_failures() {
	let mut state = state();

	state.set_response(response(&["https://a.example/payload.bin"], 1, true)).unwrap();
	state.update_failed(ErrorCode::TransferError);
	state.update_failed(ErrorCode::TransferError);
	state.download_complete();

	let snapshot = state.snapshot();
	assert_eq!(snapshot.payload_attempt_number, 0);
	assert!(snapshot.backoff_expiry.is_zero());
	assert!(!state.should_backoff_download());
}

