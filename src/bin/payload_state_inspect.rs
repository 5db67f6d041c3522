//! Read-only inspection CLI over a [`FileStore`] directory (§10.6).

// std
use std::{path::PathBuf, process::ExitCode};
// crates.io
use clap::Parser;
// self
use payload_state::{
	attempt::AttemptController,
	clock::{Clock, SystemClock},
	config::PayloadStateConfig,
	store::FileStore,
	ThreadRandom,
};

/// Print the persisted payload attempt state from a store directory, without
/// mutating it.
#[derive(Debug, Parser)]
#[command(name = "payload-state-inspect", version, about)]
struct Args {
	/// Directory holding the store's persisted key files.
	store_dir: PathBuf,

	/// Emit the snapshot as JSON instead of plain text.
	#[arg(long)]
	json: bool,
}

fn main() -> ExitCode {
	tracing_subscriber::fmt::init();

	let args = Args::parse();

	match run(&args) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			eprintln!("error: {err}");

			ExitCode::FAILURE
		},
	}
}

fn run(args: &Args) -> payload_state::Result<()> {
	let store = FileStore::open(&args.store_dir)?;
	let clock = SystemClock;
	// No response has been loaded, so `should_backoff_download`'s
	// response-dependent gates (disable_backoff, is_delta) can't be
	// evaluated here; `would_backoff` below reports just the wall-clock gate
	// that's visible from persisted state alone: is `backoff_expiry` set and
	// still in the future.
	let controller = AttemptController::new(
		Box::new(store),
		Box::new(SystemClock),
		Box::new(ThreadRandom),
		Box::new(InspectBuildKind),
		Box::new(InspectRebootDetector),
		PayloadStateConfig::default(),
	);
	let snapshot = controller.snapshot();
	let would_backoff =
		!snapshot.backoff_expiry.is_zero() && snapshot.backoff_expiry > clock.wallclock_now();

	if args.json {
		println!("{}", serde_json::to_string_pretty(&InspectView::from((&snapshot, would_backoff)))?);
	} else {
		print_plain(&snapshot, would_backoff);
	}

	Ok(())
}

fn print_plain(snapshot: &payload_state::attempt::AttemptState, would_backoff: bool) {
	println!("response_fingerprint   : {}", snapshot.response_fingerprint);
	println!("payload_attempt_number : {}", snapshot.payload_attempt_number);
	println!("url_index              : {}", snapshot.url_index);
	println!("url_failure_count      : {}", snapshot.url_failure_count);
	println!("url_switch_count       : {}", snapshot.url_switch_count);
	println!(
		"backoff_expiry         : {}",
		snapshot
			.backoff_expiry
			.to_datetime()
			.map(|dt| dt.to_rfc3339())
			.unwrap_or_else(|| "none".to_owned())
	);
	println!(
		"update_timestamp_start : {}",
		snapshot
			.update_timestamp_start
			.to_datetime()
			.map(|dt| dt.to_rfc3339())
			.unwrap_or_else(|| "none".to_owned())
	);
	println!("update_duration_uptime : {:?}", snapshot.update_duration_uptime);
	println!("num_reboots            : {}", snapshot.num_reboots);
	println!("would_backoff          : {would_backoff}");
}

#[derive(Debug, serde::Serialize)]
struct InspectView {
	response_fingerprint: String,
	payload_attempt_number: u64,
	url_index: u64,
	url_failure_count: u64,
	url_switch_count: u64,
	backoff_expiry_secs: i64,
	update_timestamp_start_secs: i64,
	update_duration_uptime_secs: u64,
	num_reboots: u64,
	would_backoff: bool,
}
impl From<(&payload_state::attempt::AttemptState, bool)> for InspectView {
	fn from((s, would_backoff): (&payload_state::attempt::AttemptState, bool)) -> Self {
		Self {
			response_fingerprint: s.response_fingerprint.to_string(),
			payload_attempt_number: s.payload_attempt_number,
			url_index: s.url_index,
			url_failure_count: s.url_failure_count,
			url_switch_count: s.url_switch_count,
			backoff_expiry_secs: s.backoff_expiry.as_secs(),
			update_timestamp_start_secs: s.update_timestamp_start.as_secs(),
			update_duration_uptime_secs: s.update_duration_uptime.as_secs(),
			num_reboots: s.num_reboots,
			would_backoff,
		}
	}
}

/// Inspection never has a live build signal; it reports whatever backoff is
/// persisted as if running on an official build, since that's the build kind
/// backoff actually matters for.
#[derive(Debug, Default)]
struct InspectBuildKind;
impl payload_state::BuildKind for InspectBuildKind {
	fn is_official_build(&self) -> bool {
		true
	}
}

/// Inspection never consumes the reboot signal, so it always reports "no".
#[derive(Debug, Default)]
struct InspectRebootDetector;
impl payload_state::RebootDetector for InspectRebootDetector {
	fn system_just_rebooted(&self) -> bool {
		false
	}
}
