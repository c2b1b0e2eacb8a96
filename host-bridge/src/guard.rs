//! Host-wide mutual exclusion between plugin invocations.
//!
//! Locks are `flock(2)` locks on files under the data directory, so the kernel
//! drops them when a holder exits for any reason. A holder writes its pid and
//! acquisition time into the file; that's only read back to explain timeouts.

use std::{
	fmt,
	fs::{self, File, OpenOptions},
	future::Future,
	io::{self, Seek, SeekFrom, Write},
	path::{Path, PathBuf},
	process,
	time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_std::task::sleep;
use fs2::FileExt;
use log::{debug, warn};
use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::owner::OwnerId;

const MIN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LockError {
	#[error("lock {scope} still held after {waited:?}{}", describe(.holder))]
	Timeout {
		scope: String,
		waited: Duration,
		holder: Option<Holder>,
	},

	#[error("lock file {}: {err}", .path.display())]
	Io {
		path: PathBuf,
		#[source]
		err: io::Error,
	},
}

fn describe(holder: &Option<Holder>) -> String {
	match holder {
		Some(h) if h.alive => format!(" by pid {} since {}", h.pid, h.since),
		Some(h) => format!(
			" (last recorded holder pid {} is gone, an inherited descriptor may keep it)",
			h.pid
		),
		None => String::new(),
	}
}

/// Who last recorded holding a lock.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Holder {
	pub pid: u32,
	/// Seconds since the epoch.
	pub since: u64,
	#[serde(skip)]
	pub alive: bool,
}

impl Holder {
	fn current() -> Self {
		Self {
			pid: process::id(),
			since: SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.map(|d| d.as_secs())
				.unwrap_or_default(),
			alive: true,
		}
	}

	fn read(path: &Path) -> Option<Self> {
		let bytes = fs::read(path).ok()?;
		let mut holder: Self = serde_json::from_slice(&bytes).ok()?;
		holder.alive = match kill(Pid::from_raw(holder.pid as i32), None) {
			Ok(()) | Err(Errno::EPERM) => true,
			Err(_) => false,
		};
		Some(holder)
	}
}

/// What a lock protects.
#[derive(Clone, Copy, Debug)]
pub enum Scope<'a> {
	/// The address ledger of the pool.
	Pool,
	/// Every command for one attachment.
	Owner(&'a OwnerId),
	/// Creation and configuration of one bridge device.
	Bridge(&'a str),
}

impl fmt::Display for Scope<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Pool => write!(f, "pool"),
			Self::Owner(owner) => write!(f, "{}", owner.lock_scope()),
			Self::Bridge(name) => write!(f, "bridge-{}", name),
		}
	}
}

/// Acquires scoped locks for one pool.
///
/// Nesting order is owner, then pool or bridge; pool and bridge are never
/// held together.
#[derive(Clone, Debug)]
pub struct Guard {
	pool_dir: PathBuf,
	locks_dir: PathBuf,
	timeout: Duration,
}

impl Guard {
	pub fn new(data_dir: &Path, network: &str, timeout: Duration) -> Self {
		Self {
			pool_dir: data_dir.join(network),
			locks_dir: data_dir.join("locks"),
			timeout,
		}
	}

	pub fn path(&self, scope: Scope<'_>) -> PathBuf {
		match scope {
			Scope::Pool => self.pool_dir.join(".lock"),
			scope => self.locks_dir.join(format!("{}.lock", scope)),
		}
	}

	/// Wait for exclusive ownership of `scope`, up to the timeout.
	pub async fn acquire(&self, scope: Scope<'_>) -> Result<LockGuard, LockError> {
		let path = self.path(scope);
		let io_err = |err| LockError::Io {
			path: path.clone(),
			err,
		};

		if let Some(dir) = path.parent() {
			fs::create_dir_all(dir).map_err(io_err)?;
		}

		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(&path)
			.map_err(io_err)?;

		let started = Instant::now();
		let mut backoff = MIN_BACKOFF;
		loop {
			match file.try_lock_exclusive() {
				Ok(()) => break,
				Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
					let waited = started.elapsed();
					if waited >= self.timeout {
						let holder = Holder::read(&path);
						warn!("gave up on lock {} after {:?}, holder={:?}", scope, waited, holder);
						return Err(LockError::Timeout {
							scope: scope.to_string(),
							waited,
							holder,
						});
					}

					sleep(backoff.min(self.timeout - waited)).await;
					backoff = (backoff * 2).min(MAX_BACKOFF);
				}
				Err(err) => return Err(io_err(err)),
			}
		}

		debug!("acquired lock {} after {:?}", scope, started.elapsed());
		let mut guard = LockGuard {
			file,
			scope: scope.to_string(),
			acquired: Instant::now(),
		};
		if let Err(err) = guard.record(Holder::current()) {
			debug!("could not record holder of {}: {}", scope, err);
		}

		Ok(guard)
	}

	/// Run `op` while holding `scope`. The lock is released however `op` ends.
	pub async fn with_lock<T, E, F>(&self, scope: Scope<'_>, op: F) -> Result<T, E>
	where
		F: Future<Output = Result<T, E>>,
		E: From<LockError>,
	{
		let _lock = self.acquire(scope).await?;
		op.await
	}
}

/// A held lock, released on drop.
#[derive(Debug)]
pub struct LockGuard {
	file: File,
	scope: String,
	acquired: Instant,
}

impl LockGuard {
	fn record(&mut self, holder: Holder) -> io::Result<()> {
		let bytes = serde_json::to_vec(&holder)?;
		self.file.set_len(0)?;
		self.file.seek(SeekFrom::Start(0))?;
		self.file.write_all(&bytes)
	}
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		if let Err(err) = self.file.set_len(0) {
			debug!("could not clear holder of {}: {}", self.scope, err);
		}

		match FileExt::unlock(&self.file) {
			Ok(()) => debug!("released lock {} after {:?}", self.scope, self.acquired.elapsed()),
			// closing the file below releases it anyway
			Err(err) => warn!("unlocking {}: {}", self.scope, err),
		}
	}
}
