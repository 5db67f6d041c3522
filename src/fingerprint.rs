//! Update response model and canonical response fingerprinting (§3, §4.3).

// crates.io
use url::Url;
// self
use crate::_prelude::*;

/// An update response as reported by the Omaha client (out of scope of this
/// crate; see §1). Only the fields that materially change retry behavior
/// are represented here.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateResponse {
	/// Ordered sequence of payload URLs. Order is significant: it determines
	/// `url_index` iteration order and participates in the fingerprint.
	pub urls: Vec<Url>,
	/// Payload size in bytes.
	pub payload_size: u64,
	/// Opaque payload content hash, e.g. a base64-encoded SHA-256 digest.
	pub payload_hash: String,
	/// Metadata size in bytes.
	pub metadata_size: u64,
	/// Metadata signature, opaque to this crate.
	pub metadata_signature: String,
	/// Whether this payload is a delta (as opposed to a full) update.
	pub is_delta: bool,
	/// Maximum consecutive failures tolerated against a single URL before
	/// advancing to the next one. Must be positive; see
	/// [`UpdateResponse::validate`].
	pub max_failures_per_url: u32,
	/// Whether backoff is disabled for this response.
	pub disable_backoff: bool,
}
impl UpdateResponse {
	/// Validate the invariants the state machine relies on.
	pub fn validate(&self) -> Result<()> {
		if self.max_failures_per_url == 0 {
			return Err(Error::Validation {
				field: "max_failures_per_url",
				reason: "Must be a positive integer.".into(),
			});
		}

		Ok(())
	}

	/// Compute the canonical [`ResponseFingerprint`] for this response (§4.3).
	pub fn fingerprint(&self) -> ResponseFingerprint {
		let mut canonical = String::new();

		canonical.push_str(&format!("NumURLs = {}\n", self.urls.len()));
		for (index, url) in self.urls.iter().enumerate() {
			canonical.push_str(&format!("Url{index} = {url}\n"));
		}
		canonical.push_str(&format!("Payload Size = {}\n", self.payload_size));
		canonical.push_str(&format!("Payload Sha256 Hash = {}\n", self.payload_hash));
		canonical.push_str(&format!("Metadata Size = {}\n", self.metadata_size));
		canonical.push_str(&format!("Metadata Signature = {}\n", self.metadata_signature));
		canonical
			.push_str(&format!("Is Delta Payload = {}\n", if self.is_delta { 1 } else { 0 }));
		canonical
			.push_str(&format!("Max Failure Count Per Url = {}\n", self.max_failures_per_url));
		canonical.push_str(&format!(
			"Disable Payload Backoff = {}\n",
			if self.disable_backoff { 1 } else { 0 }
		));

		ResponseFingerprint(canonical)
	}
}

/// Canonical digest of the response fields relevant to retry decisions.
///
/// Equality implies "same update": a client may legitimately continue an
/// in-progress attempt against a response carrying the same fingerprint.
/// No additional fields beyond §4.3 ever participate, and URL order is
/// significant — this type exists precisely to make that comparison
/// unambiguous and to pin the byte-for-byte serialization so stored
/// fingerprints remain valid across releases.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ResponseFingerprint(String);
impl ResponseFingerprint {
	/// Access the canonical string form, e.g. for persistence.
	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Wrap an already-canonical string, e.g. one just loaded from storage.
	/// Does not re-derive or validate the canonical form; comparison against
	/// a freshly computed fingerprint is what actually matters (§4.5
	/// `set_response`).
	pub fn from_persisted(value: String) -> Self {
		Self(value)
	}
}
impl std::fmt::Display for ResponseFingerprint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}
