//! Crash-safety and restart behavior against the real [`FileStore`] backend,
//! covering RT-1 (restart idempotence) and the tamper-detection scenario at
//! the facade level, as opposed to the in-memory unit coverage in
//! `attempt.rs`.

// crates.io
use payload_state::{
	attempt::{AttemptController, ErrorCode},
	clock::{FakeClock, WallInstant},
	config::PayloadStateConfig,
	fingerprint::UpdateResponse,
	store::{FileStore, PersistentStore},
	test_support::{FixedRandom, NeverRebooted, OfficialBuild},
};
use url::Url;

fn response(urls: &[&str], max_failures: u32) -> UpdateResponse {
	UpdateResponse {
		urls: urls.iter().map(|u| Url::parse(u).unwrap()).collect(),
		payload_size: 2048,
		payload_hash: "hash".into(),
		metadata_size: 64,
		metadata_signature: "sig".into(),
		is_delta: false,
		max_failures_per_url: max_failures,
		disable_backoff: false,
	}
}

fn controller_over(store: FileStore) -> AttemptController {
	let mut controller = AttemptController::new(
		Box::new(store),
		Box::new(FakeClock::new(WallInstant::from_secs(100_000))),
		Box::new(FixedRandom(0)),
		Box::new(OfficialBuild),
		Box::new(NeverRebooted),
		PayloadStateConfig::default(),
	);

	controller.initialize();

	controller
}

/// (RT-1) Reopening the store and calling `initialize()` again observes the
/// same state as just before the restart.
#[test]
fn restart_across_file_store_reopen_is_idempotent() {
	let _ = tracing_subscriber::fmt::try_init();

	let tmp = tempfile::tempdir().expect("tempdir");

	let before = {
		let mut controller = controller_over(FileStore::open(tmp.path()).expect("open"));

		controller.set_response(response(&["https://a.example/p", "http://b.example/p"], 2)).unwrap();
		controller.update_failed(ErrorCode::TransferError);
		controller.download_progress(4096);

		controller.snapshot()
	};

	let after = controller_over(FileStore::open(tmp.path()).expect("reopen")).snapshot();

	assert_eq!(before, after);
}

/// Tampering with the persisted URL index so it falls outside the current
/// response's URL count is detected and resets all state, through the real
/// file-backed store rather than the in-memory one.
#[test]
fn tampered_url_index_is_detected_through_file_store() {
	let tmp = tempfile::tempdir().expect("tempdir");

	{
		let store = FileStore::open(tmp.path()).expect("open");

		store.set_i64("current-url-index", 5).unwrap();
	}

	let mut controller = controller_over(FileStore::open(tmp.path()).expect("reopen"));

	controller.set_response(response(&["https://a.example/p", "http://b.example/p"], 3)).unwrap();

	let snapshot = controller.snapshot();
	assert_eq!(snapshot.url_index, 0);
	assert_eq!(snapshot.payload_attempt_number, 0);
}

