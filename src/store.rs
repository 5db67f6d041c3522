//! Typed key/value persistence for the payload state machine (§4.1).
//!
//! The state machine itself only ever depends on the [`PersistentStore`]
//! trait. Two implementations are provided: [`FileStore`], a crash-safe,
//! single-writer, file-per-key store suitable for production use on a real
//! device, and [`MemoryStore`], an in-memory store for tests and for hosts
//! that already have their own durability layer.

// std
use std::{
	collections::HashMap,
	fs, io,
	path::{Path, PathBuf},
	sync::Mutex,
};
// crates.io
use fs4::fs_std::FileExt;
// self
use crate::_prelude::*;

/// Typed key/value access to a crash-safe store.
///
/// Implementors must make `set_*` atomic and durable before returning: the
/// value either fully replaces the prior one or the prior one is left
/// completely intact. There is no partial-write state a reader can observe.
pub trait PersistentStore: std::fmt::Debug + Send + Sync {
	/// Whether a value is present for `key`.
	fn exists(&self, key: &str) -> bool;

	/// Read an integer value, returning `None` if absent or unparseable.
	fn get_i64(&self, key: &str) -> Option<i64>;

	/// Read a string value, returning `None` if absent.
	fn get_string(&self, key: &str) -> Option<String>;

	/// Durably write an integer value.
	fn set_i64(&self, key: &str, value: i64) -> Result<()>;

	/// Durably write a string value.
	fn set_string(&self, key: &str, value: &str) -> Result<()>;

	/// Remove a value, if present. Removing an absent key is not an error.
	fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory [`PersistentStore`], backed by a mutex-guarded map.
///
/// Nothing survives a process restart; this is for unit tests and for hosts
/// that implement their own durability elsewhere (an existing Omaha prefs
/// store, for instance) and just need something that satisfies the trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
	values: Mutex<HashMap<String, String>>,
}
impl MemoryStore {
	/// Construct an empty store.
	pub fn new() -> Self {
		Self::default()
	}
}
impl PersistentStore for MemoryStore {
	fn exists(&self, key: &str) -> bool {
		self.values.lock().expect("memory store lock poisoned").contains_key(key)
	}

	fn get_i64(&self, key: &str) -> Option<i64> {
		self.values.lock().expect("memory store lock poisoned").get(key)?.parse().ok()
	}

	fn get_string(&self, key: &str) -> Option<String> {
		self.values.lock().expect("memory store lock poisoned").get(key).cloned()
	}

	fn set_i64(&self, key: &str, value: i64) -> Result<()> {
		self.values
			.lock()
			.expect("memory store lock poisoned")
			.insert(key.to_owned(), value.to_string());

		Ok(())
	}

	fn set_string(&self, key: &str, value: &str) -> Result<()> {
		self.values
			.lock()
			.expect("memory store lock poisoned")
			.insert(key.to_owned(), value.to_owned());

		Ok(())
	}

	fn delete(&self, key: &str) -> Result<()> {
		self.values.lock().expect("memory store lock poisoned").remove(key);

		Ok(())
	}
}

/// File-backed [`PersistentStore`]: one file per key inside a root
/// directory, written via write-to-temp-then-rename so a crash never
/// observes a torn value, guarded by an exclusive advisory lock on the
/// directory for the lifetime of the store (single-writer by construction,
/// per §4.1 and §5).
#[derive(Debug)]
pub struct FileStore {
	dir: PathBuf,
	// Held for the lifetime of the store; dropping it releases the lock.
	_lock: fs::File,
}
impl FileStore {
	/// Open (creating if necessary) a file-backed store rooted at `dir`.
	///
	/// Fails if another process already holds the writer lock.
	pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
		let dir = dir.as_ref().to_path_buf();

		fs::create_dir_all(&dir).map_err(|err| Error::Storage {
			key: dir.display().to_string(),
			reason: format!("failed to create store directory: {err}"),
		})?;

		let lock_path = dir.join(".lock");
		let lock = fs::OpenOptions::new()
			.create(true)
			.truncate(false)
			.write(true)
			.open(&lock_path)
			.map_err(|err| Error::Storage {
				key: lock_path.display().to_string(),
				reason: format!("failed to open lock file: {err}"),
			})?;

		lock.try_lock_exclusive().map_err(|err| Error::Storage {
			key: lock_path.display().to_string(),
			reason: format!("store already locked by another writer: {err}"),
		})?;

		Ok(Self { dir, _lock: lock })
	}

	fn path_for(&self, key: &str) -> PathBuf {
		self.dir.join(sanitize_key(key))
	}

	fn read_raw(&self, key: &str) -> Option<String> {
		match fs::read_to_string(self.path_for(key)) {
			Ok(contents) => Some(contents),
			Err(err) if err.kind() == io::ErrorKind::NotFound => None,
			Err(err) => {
				tracing::error!(key, error = %err, "failed to read persisted value");

				None
			},
		}
	}

	fn write_raw(&self, key: &str, value: &str) -> Result<()> {
		let target = self.path_for(key);
		let tmp = self.dir.join(format!(".{}.tmp", sanitize_key(key)));

		fs::write(&tmp, value).map_err(|err| Error::Storage {
			key: key.to_owned(),
			reason: format!("failed to write temp file: {err}"),
		})?;
		fs::rename(&tmp, &target).map_err(|err| Error::Storage {
			key: key.to_owned(),
			reason: format!("failed to commit value via rename: {err}"),
		})?;

		Ok(())
	}
}
impl PersistentStore for FileStore {
	fn exists(&self, key: &str) -> bool {
		self.path_for(key).exists()
	}

	fn get_i64(&self, key: &str) -> Option<i64> {
		self.read_raw(key)?.trim().parse().ok()
	}

	fn get_string(&self, key: &str) -> Option<String> {
		self.read_raw(key)
	}

	fn set_i64(&self, key: &str, value: i64) -> Result<()> {
		self.write_raw(key, &value.to_string())
	}

	fn set_string(&self, key: &str, value: &str) -> Result<()> {
		self.write_raw(key, value)
	}

	fn delete(&self, key: &str) -> Result<()> {
		match fs::remove_file(self.path_for(key)) {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(Error::Storage {
				key: key.to_owned(),
				reason: format!("failed to delete value: {err}"),
			}),
		}
	}
}

/// Keys are fixed strings defined in §6; this only guards against a caller
/// accidentally passing something filesystem-unsafe.
fn sanitize_key(key: &str) -> String {
	key.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
		.collect()
}
