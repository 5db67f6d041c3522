//! Wall-clock and monotonic time sources.

// self
use crate::_prelude::*;

/// Absolute wall-clock instant, seconds since the Unix epoch.
///
/// Stored as a plain `i64` (matching the persisted representation in §6 of
/// the payload state machine's external interface) rather than
/// `DateTime<Utc>` directly, so arithmetic against persisted values never
/// needs a fallible conversion. `WallInstant::ZERO` is the sentinel for "no
/// instant" (e.g. a null `backoff_expiry`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WallInstant(i64);
impl WallInstant {
	/// The null instant, used as the "unset" sentinel throughout the crate.
	pub const ZERO: Self = Self(0);

	/// Construct an instant from seconds-since-epoch.
	pub fn from_secs(secs: i64) -> Self {
		Self(secs)
	}

	/// Seconds since the Unix epoch.
	pub fn as_secs(self) -> i64 {
		self.0
	}

	/// Whether this instant is the null sentinel.
	pub fn is_zero(self) -> bool {
		self.0 == 0
	}

	/// Add a duration, saturating rather than overflowing.
	pub fn saturating_add(self, delta: Duration) -> Self {
		Self(self.0.saturating_add(delta.as_secs() as i64))
	}

	/// Duration since an earlier instant, or `Duration::ZERO` if `self` precedes `earlier`.
	pub fn saturating_duration_since(self, earlier: Self) -> Duration {
		if self.0 <= earlier.0 {
			Duration::ZERO
		} else {
			Duration::from_secs((self.0 - earlier.0) as u64)
		}
	}

	/// Convert to a UTC timestamp for logging and display.
	pub fn to_datetime(self) -> Option<DateTime<Utc>> {
		DateTime::from_timestamp(self.0, 0)
	}
}

/// Strictly monotonic instant, unaffected by wall-clock jumps.
///
/// Represented as nanoseconds since an arbitrary, process-local origin.
/// Never persisted directly; only durations derived from it are persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonoInstant(u128);
impl MonoInstant {
	/// Duration elapsed since an earlier monotonic instant.
	///
	/// Saturates to zero if `earlier` is somehow later (can't happen with a
	/// well-behaved monotonic source, but the spec asks for no-panic defenses
	/// against clock anomalies throughout §4.5.3).
	pub fn saturating_duration_since(self, earlier: Self) -> Duration {
		if self.0 <= earlier.0 {
			Duration::ZERO
		} else {
			Duration::from_nanos((self.0 - earlier.0).min(u64::MAX as u128) as u64)
		}
	}
}

/// Provides both clocks the state machine depends on.
///
/// Two logically independent clocks per §4.2: a wall-clock that is monotone
/// only "in expectation" (it can jump on time-sync), and a strictly
/// monotonic uptime clock that does not advance during deep suspend.
pub trait Clock: std::fmt::Debug + Send + Sync {
	/// Current wall-clock instant.
	fn wallclock_now(&self) -> WallInstant;

	/// Current monotonic instant.
	fn monotonic_now(&self) -> MonoInstant;
}

/// Clock backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
	fn wallclock_now(&self) -> WallInstant {
		let secs = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.map(|d| d.as_secs() as i64)
			.unwrap_or(0);

		WallInstant::from_secs(secs)
	}

	fn monotonic_now(&self) -> MonoInstant {
		MonoInstant(Self::origin_instant().elapsed().as_nanos())
	}
}

/// A `SystemClock` needs a fixed origin to turn `Instant::elapsed` into a
/// comparable `MonoInstant`; this wrapper owns that origin lazily.
impl SystemClock {
	fn origin_instant() -> &'static std::time::Instant {
		static ORIGIN: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
		ORIGIN.get_or_init(std::time::Instant::now)
	}
}

#[cfg(any(test, feature = "test-util"))]
mod fake {
	// std
	use std::sync::Mutex;
	// self
	use super::*;

	/// Deterministic clock for tests: both clocks are explicit counters
	/// advanced only by test code, matching the teacher's pattern of
	/// injecting fakes rather than sleeping in tests.
	#[derive(Debug)]
	pub struct FakeClock {
		wallclock: Mutex<WallInstant>,
		monotonic: Mutex<u128>,
	}
	impl FakeClock {
		/// Construct a fake clock starting at the given wall-clock instant.
		pub fn new(start: WallInstant) -> Self {
			Self { wallclock: Mutex::new(start), monotonic: Mutex::new(0) }
		}

		/// Advance both clocks by the same duration (the common case: real
		/// time passing with both clocks agreeing).
		pub fn advance(&self, delta: Duration) {
			self.advance_wallclock(delta);
			self.advance_monotonic(delta);
		}

		/// Advance only the wall-clock (models a time-sync jump).
		pub fn advance_wallclock(&self, delta: Duration) {
			let mut wallclock = self.wallclock.lock().expect("fake clock lock poisoned");

			*wallclock = wallclock.saturating_add(delta);
		}

		/// Advance only the monotonic clock (models uptime passing while the
		/// wall-clock is corrected backwards, or vice versa).
		pub fn advance_monotonic(&self, delta: Duration) {
			let mut monotonic = self.monotonic.lock().expect("fake clock lock poisoned");

			*monotonic += delta.as_nanos();
		}

		/// Force the wall-clock to an exact instant (models a rewind).
		pub fn set_wallclock(&self, instant: WallInstant) {
			*self.wallclock.lock().expect("fake clock lock poisoned") = instant;
		}
	}
	impl Clock for FakeClock {
		fn wallclock_now(&self) -> WallInstant {
			*self.wallclock.lock().expect("fake clock lock poisoned")
		}

		fn monotonic_now(&self) -> MonoInstant {
			MonoInstant(*self.monotonic.lock().expect("fake clock lock poisoned"))
		}
	}
}
#[cfg(any(test, feature = "test-util"))]
pub use fake::FakeClock;
