//! Download-source classification and byte accounting (§4.4).

// crates.io
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::{_prelude::*, store::PersistentStore};

/// A transport category derived from the current URL's scheme, used to
/// bucket telemetry. A fixed small set; `Unknown` is distinct from the
/// valid members and attributes no bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadSource {
	/// Plain HTTP.
	HttpServer,
	/// TLS-protected HTTP.
	HttpsServer,
}
impl DownloadSource {
	/// All sources in a stable, bitmask-significant order (§4.6
	/// `DownloadSourcesUsed`: bit 0 is `HttpServer`, bit 1 is `HttpsServer`).
	pub const ALL: [DownloadSource; 2] = [DownloadSource::HttpServer, DownloadSource::HttpsServer];

	/// Classify a URL's scheme. Returns `None` for anything other than
	/// `http://` or `https://` (case-insensitive) — the "unknown / none"
	/// sentinel of §3, which attributes no bytes.
	pub fn classify(url: &Url) -> Option<Self> {
		match url.scheme().to_ascii_lowercase().as_str() {
			"https" => Some(DownloadSource::HttpsServer),
			"http" => Some(DownloadSource::HttpServer),
			_ => None,
		}
	}

	/// Stable key suffix used to build the persisted key name (§6).
	pub fn key_suffix(self) -> &'static str {
		match self {
			DownloadSource::HttpServer => "http",
			DownloadSource::HttpsServer => "https",
		}
	}

	/// Bit position within the `DownloadSourcesUsed` bitmask (§4.6).
	pub fn bit(self) -> u32 {
		match self {
			DownloadSource::HttpServer => 0,
			DownloadSource::HttpsServer => 1,
		}
	}
}

/// Per-source byte counters for the in-progress update.
///
/// `current_bytes_downloaded[s]` tracks bytes used successfully toward the
/// current applied payload; `total_bytes_downloaded[s]` tracks all bytes
/// transferred, including wasted ones from aborted attempts. Both are
/// persisted on every update and survive process restarts.
#[derive(Debug)]
pub struct DownloadAccounting<'a> {
	store: &'a dyn PersistentStore,
	current_source: Option<DownloadSource>,
}
impl<'a> DownloadAccounting<'a> {
	/// Construct an accountant bound to the given store, with no current
	/// source selected yet.
	pub fn new(store: &'a dyn PersistentStore) -> Self {
		Self { store, current_source: None }
	}

	/// Update the current source from the active URL, per §4.4.
	pub fn set_current_url(&mut self, url: Option<&Url>) {
		self.current_source = url.and_then(DownloadSource::classify);
	}

	/// The currently classified source, if any.
	pub fn current_source(&self) -> Option<DownloadSource> {
		self.current_source
	}

	fn key(prefix: &str, source: DownloadSource) -> String {
		format!("{prefix}-{}", source.key_suffix())
	}

	/// Bytes attributed to `source` toward the current applied payload.
	pub fn current_bytes(&self, source: DownloadSource) -> u64 {
		clamp_non_negative(
			self.store.get_i64(&Self::key("current-bytes-downloaded-from", source)),
		)
	}

	/// Bytes transferred in total for `source`, including wasted bytes.
	pub fn total_bytes(&self, source: DownloadSource) -> u64 {
		clamp_non_negative(self.store.get_i64(&Self::key("total-bytes-downloaded-from", source)))
	}

	/// Attribute `n` freshly transferred bytes to the current source,
	/// persisting both counters. A no-op if no source is classified.
	pub fn on_bytes(&mut self, n: u64) {
		let Some(source) = self.current_source else { return };
		let current = self.current_bytes(source).saturating_add(n);
		let total = self.total_bytes(source).saturating_add(n);

		if let Err(err) =
			self.store.set_i64(&Self::key("current-bytes-downloaded-from", source), current as i64)
		{
			tracing::error!(error = %err, "failed to persist current byte counter");
		}
		if let Err(err) =
			self.store.set_i64(&Self::key("total-bytes-downloaded-from", source), total as i64)
		{
			tracing::error!(error = %err, "failed to persist total byte counter");
		}
	}

	/// Zero the current-attempt counters for every source, keeping totals.
	/// Called when a new update starts (§4.5.5 `reset_persistent_state`).
	pub fn reset_current_on_new_update(&mut self) {
		for source in DownloadSource::ALL {
			if let Err(err) = self.store.set_i64(&Self::key("current-bytes-downloaded-from", source), 0)
			{
				tracing::error!(error = %err, "failed to reset current byte counter");
			}
		}
	}

	/// Zero both current and total counters for every source, after metrics
	/// emission on update success (§4.5 `update_succeeded`, §4.6).
	pub fn drain_on_success(&mut self) {
		for source in DownloadSource::ALL {
			if let Err(err) = self.store.set_i64(&Self::key("current-bytes-downloaded-from", source), 0)
			{
				tracing::error!(error = %err, "failed to drain current byte counter");
			}
			if let Err(err) = self.store.set_i64(&Self::key("total-bytes-downloaded-from", source), 0)
			{
				tracing::error!(error = %err, "failed to drain total byte counter");
			}
		}
	}
}

fn clamp_non_negative(value: Option<i64>) -> u64 {
	match value {
		Some(v) if v >= 0 => v as u64,
		Some(v) => {
			tracing::error!(value = v, "persisted byte counter was negative, clamping to 0");

			0
		},
		None => 0,
	}
}
