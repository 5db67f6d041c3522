//! Terminal metric emission and transient telemetry (§4.6, §10.3).

// self
use crate::{
	_prelude::*,
	accounting::DownloadSource,
	attempt::{AttemptSummary, FaultClass},
};

/// Fire-and-forget sample sink (§6 `MetricsSink`). Failures are ignored by
/// every caller in this crate: metrics are best-effort observability, never
/// a dependency of the state machine's correctness.
pub trait MetricsSink: std::fmt::Debug + Send + Sync {
	/// Record one UMA-style bucketed sample.
	fn send_to_uma(&self, name: &str, sample: i64, min: i64, max: i64, buckets: u32);
}

/// A [`MetricsSink`] that records through the `metrics` facade crate, for
/// hosts that don't already have an Omaha-specific UMA client. Gated behind
/// the crate's `metrics` feature.
#[derive(Clone, Copy, Debug, Default)]
pub struct UmaMetricsSink;
impl MetricsSink for UmaMetricsSink {
	fn send_to_uma(&self, name: &str, sample: i64, min: i64, max: i64, buckets: u32) {
		tracing::debug!(name, sample, min, max, buckets, "recording uma-style sample");
		metrics::histogram!(name.to_owned()).record(sample as f64);
	}
}

/// Install a process-wide Prometheus exporter and return a handle to its
/// rendered text output, in the teacher's `install_default_exporter` /
/// `prometheus_handle` style. Gated behind the crate's `prometheus` feature.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
	let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;

	Ok(handle)
}

/// Computes and emits the §4.6 terminal metric set, plus the transient
/// counters noted in §4.6's final paragraph.
#[derive(Debug)]
pub struct MetricsReporter<'a> {
	sink: &'a dyn MetricsSink,
}
impl<'a> MetricsReporter<'a> {
	/// Construct a reporter over the given sink.
	pub fn new(sink: &'a dyn MetricsSink) -> Self {
		Self { sink }
	}

	/// Emit the full terminal metric set for a successful update (§4.6).
	pub fn emit_terminal(&self, summary: &AttemptSummary) {
		let mut total_successful = 0u64;
		let mut total_transferred = 0u64;
		let mut sources_used_mask = 0u32;
		#[cfg(feature = "metrics")]
		let mut emitted: smallvec::SmallVec<[&'static str; 8]> = smallvec::SmallVec::new();

		for (source, current_bytes, total_bytes) in &summary.bytes_by_source {
			let successful_mib = current_bytes / (1 << 20);
			let total_mib = total_bytes / (1 << 20);

			self.sink.send_to_uma(
				&format!("SuccessfulMBsDownloadedFrom{}", source_label(*source)),
				successful_mib as i64,
				0,
				10_240,
				50,
			);
			self.sink.send_to_uma(
				&format!("TotalMBsDownloadedFrom{}", source_label(*source)),
				total_mib as i64,
				0,
				10_240,
				50,
			);

			if successful_mib > 0 {
				sources_used_mask |= 1 << source.bit();
			}
			total_successful += current_bytes;
			total_transferred += total_bytes;
			#[cfg(feature = "metrics")]
			emitted.push(source_label(*source));
		}

		self.sink.send_to_uma(
			"DownloadSourcesUsed",
			sources_used_mask as i64,
			0,
			1 << DownloadSource::ALL.len(),
			1 << DownloadSource::ALL.len(),
		);

		if total_successful > 0 {
			let overhead_percentage =
				((total_transferred.saturating_sub(total_successful)) * 100) / total_successful;

			self.sink.send_to_uma(
				"DownloadOverheadPercentage",
				overhead_percentage as i64,
				0,
				1_000,
				100,
			);
		}

		self.sink.send_to_uma("UpdateURLSwitches", summary.url_switch_count as i64, 0, 100, 50);
		self.sink.send_to_uma("UpdateNumReboots", summary.num_reboots as i64, 0, 50, 25);
		self.sink.send_to_uma(
			"UpdateDurationMinutes",
			(summary.wall_duration.as_secs() / 60) as i64,
			1,
			525_600,
			50,
		);
		self.sink.send_to_uma(
			"UpdateDurationUptimeMinutes",
			(summary.uptime_duration.as_secs() / 60) as i64,
			1,
			43_200,
			50,
		);

		#[cfg(feature = "metrics")]
		tracing::trace!(sources = ?emitted.as_slice(), "sources emitted in this terminal batch");

		tracing::info!(
			sources_used_mask,
			total_successful,
			total_transferred,
			"emitted terminal update metrics"
		);
	}
}

/// Bump the transient per-fault-class counter (§4.6, non-terminal). Recorded
/// through the global `metrics` facade rather than a [`MetricsSink`], so it
/// fires from `update_failed` regardless of whether a sink is configured for
/// the eventual terminal batch.
#[cfg(feature = "metrics")]
pub fn record_fault(class: FaultClass) {
	metrics::counter!("payload_state_faults_total", "class" => fault_class_label(class)).increment(1);
}

/// Bump the transient bytes-transferred counter (§4.6, non-terminal).
#[cfg(feature = "metrics")]
pub fn record_progress_bytes(n: u64) {
	metrics::counter!("payload_state_bytes_transferred_total").increment(n);
}

fn source_label(source: DownloadSource) -> &'static str {
	match source {
		DownloadSource::HttpServer => "HttpServer",
		DownloadSource::HttpsServer => "HttpsServer",
	}
}

#[cfg(feature = "metrics")]
fn fault_class_label(class: FaultClass) -> &'static str {
	match class {
		FaultClass::PayloadCorruption => "payload_corruption",
		FaultClass::TransientNetwork => "transient_network",
		FaultClass::NonUrlFault => "non_url_fault",
		FaultClass::NotAnError => "not_an_error",
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::Mutex;
	// self
	use super::*;

	#[derive(Debug, Default)]
	struct RecordingSink {
		samples: Mutex<Vec<(String, i64)>>,
	}
	impl MetricsSink for RecordingSink {
		fn send_to_uma(&self, name: &str, sample: i64, _min: i64, _max: i64, _buckets: u32) {
			self.samples.lock().unwrap().push((name.to_owned(), sample));
		}
	}

	fn sample_summary() -> AttemptSummary {
		AttemptSummary {
			bytes_by_source: vec![
				(DownloadSource::HttpServer, 0, 0),
				(DownloadSource::HttpsServer, 1 << 20, 2 * (1 << 20)),
			],
			url_switch_count: 2,
			num_reboots: 1,
			wall_duration: Duration::from_secs(600),
			uptime_duration: Duration::from_secs(300),
		}
	}

	#[test]
	fn emits_expected_sample_names() {
		let sink = RecordingSink::default();
		let reporter = MetricsReporter::new(&sink);

		reporter.emit_terminal(&sample_summary());

		let names: Vec<_> = sink.samples.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();

		assert!(names.contains(&"SuccessfulMBsDownloadedFromHttpsServer".to_owned()));
		assert!(names.contains(&"DownloadSourcesUsed".to_owned()));
		assert!(names.contains(&"DownloadOverheadPercentage".to_owned()));
		assert!(names.contains(&"UpdateURLSwitches".to_owned()));
	}

	#[test]
	fn sources_used_mask_only_counts_successful_mib() {
		let sink = RecordingSink::default();
		let reporter = MetricsReporter::new(&sink);

		reporter.emit_terminal(&sample_summary());

		let samples = sink.samples.lock().unwrap();
		let mask = samples.iter().find(|(n, _)| n == "DownloadSourcesUsed").unwrap().1;

		assert_eq!(mask, 1 << DownloadSource::HttpsServer.bit());
	}

	#[test]
	fn overhead_percentage_omitted_when_nothing_succeeded() {
		let sink = RecordingSink::default();
		let reporter = MetricsReporter::new(&sink);
		let mut summary = sample_summary();
		summary.bytes_by_source =
			vec![(DownloadSource::HttpServer, 0, 0), (DownloadSource::HttpsServer, 0, 0)];

		reporter.emit_terminal(&summary);

		let samples = sink.samples.lock().unwrap();
		assert!(!samples.iter().any(|(n, _)| n == "DownloadOverheadPercentage"));
	}

	fn capture_metrics<F: FnOnce()>(f: F) -> Vec<(metrics_util::CompositeKey, metrics_util::debugging::DebugValue)> {
		let recorder = metrics_util::debugging::DebuggingRecorder::new();
		let snapshotter = recorder.snapshotter();

		metrics::with_local_recorder(&recorder, f);

		snapshotter.snapshot().into_vec().into_iter().map(|(key, _, _, value)| (key, value)).collect()
	}

	/// Sums the counter across every label combination sharing `name`, since a
	/// labeled counter like `payload_state_faults_total` splits into one
	/// snapshot entry per distinct label value.
	fn counter_value(
		snapshot: &[(metrics_util::CompositeKey, metrics_util::debugging::DebugValue)],
		name: &str,
	) -> u64 {
		use std::borrow::Borrow;

		snapshot
			.iter()
			.filter(|(key, _)| {
				key.kind() == metrics_util::MetricKind::Counter
					&& Borrow::<str>::borrow(key.key().name()) == name
			})
			.map(|(_, value)| match value {
				metrics_util::debugging::DebugValue::Counter(value) => *value,
				_ => 0,
			})
			.sum()
	}

	#[test]
	fn record_fault_and_record_progress_bytes_increment_transient_counters() {
		let snapshot = capture_metrics(|| {
			record_fault(FaultClass::PayloadCorruption);
			record_fault(FaultClass::PayloadCorruption);
			record_fault(FaultClass::TransientNetwork);
			record_progress_bytes(1_024);
			record_progress_bytes(512);
		});

		assert_eq!(counter_value(&snapshot, "payload_state_faults_total"), 3);
		assert_eq!(counter_value(&snapshot, "payload_state_bytes_transferred_total"), 1_536);
	}
}
