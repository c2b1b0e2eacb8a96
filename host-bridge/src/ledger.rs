//! Durable record of which addresses and attachments belong to whom.
//!
//! One directory per pool. Each allocated address is a small JSON file named
//! after the address; each completed attachment is a JSON file under
//! `attachments/`. Address files are only ever created by hard-linking a
//! fully written and synced temporary file into place, which fails if the
//! name is taken: two processes racing for one address cannot both win, lock
//! or no lock, and a crash never leaves a half-written record behind.
//!
//! `owners/` maps each owner's digest to the address it holds, so finding an
//! owner's address reads two files whatever the size of the pool. The index
//! entry is written before the address file is linked and removed after it
//! is unlinked; an entry whose address file is missing or names someone else
//! is stale and ignored.

use std::{
	fs::{self, File, OpenOptions},
	io::{self, ErrorKind, Write},
	net::IpAddr,
	path::{Path, PathBuf},
	process,
	sync::atomic::{AtomicUsize, Ordering},
	time::{SystemTime, UNIX_EPOCH},
};

use cni_plugin::macaddr::MacAddr;
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::owner::OwnerId;

const ATTACHMENTS_DIR: &str = "attachments";
const OWNERS_DIR: &str = "owners";

static TEMP_SEQ: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Error)]
pub enum LedgerError {
	#[error("{address} is already allocated to {owner}")]
	AlreadyAllocated { address: IpAddr, owner: String },

	#[error("{owner} already holds {held}, refusing to also reserve {address}")]
	OwnerConflict {
		owner: String,
		held: IpAddr,
		address: IpAddr,
	},

	#[error("ledger storage at {}: {err}", .path.display())]
	Storage {
		path: PathBuf,
		#[source]
		err: io::Error,
	},

	#[error("corrupt ledger entry at {}: {err}", .path.display())]
	Corrupt {
		path: PathBuf,
		#[source]
		err: serde_json::Error,
	},
}

fn storage(path: &Path) -> impl FnOnce(io::Error) -> LedgerError + '_ {
	move |err| LedgerError::Storage {
		path: path.to_owned(),
		err,
	}
}

/// One allocated address.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
	pub address: IpAddr,
	pub owner: String,
	/// Seconds since the epoch.
	pub allocated_at: u64,
}

/// One completed attachment; written only once every kernel object exists.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRecord {
	pub owner: String,
	pub netns: PathBuf,
	pub sandbox_ifname: String,
	pub sandbox_mac: MacAddr,
	pub host_ifname: String,
	pub host_mac: MacAddr,
	pub bridge: String,
	pub bridge_mac: MacAddr,
	pub address: IpNetwork,
	pub gateway: IpAddr,
	/// Pool subnet at attach time; the NAT rule is keyed on it.
	pub subnet: IpNetwork,
	pub masquerade: bool,
}

/// Ledger for one pool.
#[derive(Clone, Debug)]
pub struct Ledger {
	dir: PathBuf,
}

impl Ledger {
	/// Open (creating if needed) the ledger directory for `network` under
	/// `data_dir`.
	pub fn open(data_dir: &Path, network: &str) -> Result<Self, LedgerError> {
		let dir = data_dir.join(network);
		for sub in &[ATTACHMENTS_DIR, OWNERS_DIR] {
			let sub = dir.join(sub);
			fs::create_dir_all(&sub).map_err(storage(&sub))?;
		}
		debug!("ledger at {}", dir.display());
		Ok(Self { dir })
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	/// Reserve `address` for `owner`.
	///
	/// Re-reserving an address the owner already holds succeeds without doing
	/// anything. Fails if another owner holds the address, or if the owner
	/// holds a different address in this pool.
	pub fn reserve(&self, address: IpAddr, owner: &OwnerId) -> Result<(), LedgerError> {
		let name = owner.to_string();
		if let Some(existing) = self.record(address)? {
			return same_owner(existing, &name);
		}

		if let Some(held) = self.lookup(owner)? {
			return Err(LedgerError::OwnerConflict {
				owner: name,
				held,
				address,
			});
		}

		self.write_owner_entry(owner, address)?;

		let path = self.address_path(address);
		let record = AddressRecord {
			address,
			owner: name.clone(),
			allocated_at: now(),
		};
		let temp = self.write_temp(&address.to_string(), &record)?;

		let linked = fs::hard_link(&temp, &path);
		if let Err(err) = fs::remove_file(&temp) {
			warn!("could not remove ledger temp file {}: {}", temp.display(), err);
		}

		let res = match linked {
			Ok(()) => {
				self.sync_dir()?;
				info!("reserved {} for {}", address, name);
				return Ok(());
			}
			Err(err) if err.kind() == ErrorKind::AlreadyExists => {
				debug!("lost the race for {}, checking who won", address);
				match self.record(address)? {
					Some(existing) => same_owner(existing, &name),
					// released between our link attempt and this read
					None => Err(LedgerError::AlreadyAllocated {
						address,
						owner: String::new(),
					}),
				}
			}
			Err(err) => Err(storage(&path)(err)),
		};

		if res.is_err() {
			self.drop_owner_entry(owner, Some(address))?;
		}
		res
	}

	/// Release whatever `owner` holds. Returns the released address, if any.
	pub fn release(&self, owner: &OwnerId) -> Result<Option<IpAddr>, LedgerError> {
		let address = match self.lookup(owner)? {
			Some(address) => address,
			None => {
				self.drop_owner_entry(owner, None)?;
				debug!("{} held no address", owner);
				return Ok(None);
			}
		};

		let path = self.address_path(address);
		match fs::remove_file(&path) {
			Ok(()) => self.sync_dir()?,
			Err(err) if err.kind() == ErrorKind::NotFound => {}
			Err(err) => return Err(storage(&path)(err)),
		}
		self.drop_owner_entry(owner, None)?;

		info!("released {} from {}", address, owner);
		Ok(Some(address))
	}

	/// The address `owner` holds, if any.
	pub fn lookup(&self, owner: &OwnerId) -> Result<Option<IpAddr>, LedgerError> {
		let address = match read_json::<IpAddr>(&self.owner_path(owner))? {
			Some(address) => address,
			None => return Ok(None),
		};

		match self.record(address)? {
			Some(record) if record.owner == owner.to_string() => Ok(Some(address)),
			_ => {
				debug!("stale owner entry for {} points at {}", owner, address);
				Ok(None)
			}
		}
	}

	/// Lazily walk the current allocations.
	///
	/// Each call starts a fresh pass over the directory. Records released
	/// while the walk is in progress are skipped.
	pub fn list_allocated(&self) -> Result<Records, LedgerError> {
		let entries = fs::read_dir(&self.dir).map_err(storage(&self.dir))?;
		Ok(Records {
			dir: self.dir.clone(),
			entries,
		})
	}

	/// The record for one address, if allocated.
	pub fn record(&self, address: IpAddr) -> Result<Option<AddressRecord>, LedgerError> {
		read_json(&self.address_path(address))
	}

	/// Persist a completed attachment, replacing any previous one.
	pub fn record_attachment(&self, record: &AttachmentRecord) -> Result<(), LedgerError> {
		let owner = OwnerId::parse(&record.owner).ok_or_else(|| LedgerError::Storage {
			path: self.dir.join(ATTACHMENTS_DIR),
			err: io::Error::new(ErrorKind::InvalidInput, "malformed owner"),
		})?;

		let path = self.attachment_path(&owner);
		let temp = self.write_temp(&owner.digest(), record)?;
		fs::rename(&temp, &path).map_err(storage(&path))?;
		sync_dir(&self.dir.join(ATTACHMENTS_DIR))?;
		debug!("recorded attachment of {}", record.owner);
		Ok(())
	}

	/// The attachment recorded for `owner`, if any.
	pub fn attachment(&self, owner: &OwnerId) -> Result<Option<AttachmentRecord>, LedgerError> {
		read_json(&self.attachment_path(owner))
	}

	/// Remove the attachment recorded for `owner`. Returns whether one existed.
	pub fn forget_attachment(&self, owner: &OwnerId) -> Result<bool, LedgerError> {
		let path = self.attachment_path(owner);
		match fs::remove_file(&path) {
			Ok(()) => {
				sync_dir(&self.dir.join(ATTACHMENTS_DIR))?;
				debug!("forgot attachment of {}", owner);
				Ok(true)
			}
			Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
			Err(err) => Err(storage(&path)(err)),
		}
	}

	fn write_owner_entry(&self, owner: &OwnerId, address: IpAddr) -> Result<(), LedgerError> {
		let path = self.owner_path(owner);
		let temp = self.write_temp(&owner.digest(), &address)?;
		fs::rename(&temp, &path).map_err(storage(&path))?;
		sync_dir(&self.dir.join(OWNERS_DIR))
	}

	/// Remove the owner's index entry; with `only`, just if it points there.
	fn drop_owner_entry(&self, owner: &OwnerId, only: Option<IpAddr>) -> Result<(), LedgerError> {
		let path = self.owner_path(owner);
		if let Some(address) = only {
			if read_json::<IpAddr>(&path)? != Some(address) {
				return Ok(());
			}
		}

		match fs::remove_file(&path) {
			Ok(()) => sync_dir(&self.dir.join(OWNERS_DIR)),
			Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
			Err(err) => Err(storage(&path)(err)),
		}
	}

	fn owner_path(&self, owner: &OwnerId) -> PathBuf {
		self.dir.join(OWNERS_DIR).join(owner.digest())
	}

	fn address_path(&self, address: IpAddr) -> PathBuf {
		self.dir.join(address.to_string())
	}

	fn attachment_path(&self, owner: &OwnerId) -> PathBuf {
		self.dir
			.join(ATTACHMENTS_DIR)
			.join(format!("{}.json", owner.digest()))
	}

	fn write_temp<T: Serialize>(&self, stem: &str, value: &T) -> Result<PathBuf, LedgerError> {
		let temp = self.dir.join(format!(
			".tmp-{}-{}-{}",
			process::id(),
			TEMP_SEQ.fetch_add(1, Ordering::Relaxed),
			stem
		));

		let bytes = serde_json::to_vec(value).map_err(|err| LedgerError::Corrupt {
			path: temp.clone(),
			err,
		})?;

		let mut file = OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(&temp)
			.map_err(storage(&temp))?;
		file.write_all(&bytes)
			.and_then(|_| file.sync_all())
			.map_err(storage(&temp))?;

		Ok(temp)
	}

	fn sync_dir(&self) -> Result<(), LedgerError> {
		sync_dir(&self.dir)
	}
}

fn same_owner(existing: AddressRecord, owner: &str) -> Result<(), LedgerError> {
	if existing.owner == owner {
		debug!("{} already reserved for {}", existing.address, owner);
		Ok(())
	} else {
		Err(LedgerError::AlreadyAllocated {
			address: existing.address,
			owner: existing.owner,
		})
	}
}

fn sync_dir(dir: &Path) -> Result<(), LedgerError> {
	File::open(dir)
		.and_then(|d| d.sync_all())
		.map_err(storage(dir))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, LedgerError> {
	match fs::read(path) {
		Ok(bytes) => serde_json::from_slice(&bytes)
			.map(Some)
			.map_err(|err| LedgerError::Corrupt {
				path: path.to_owned(),
				err,
			}),
		Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
		Err(err) => Err(storage(path)(err)),
	}
}

fn now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or_default()
}

/// Iterator over allocations, from [`Ledger::list_allocated`].
pub struct Records {
	dir: PathBuf,
	entries: fs::ReadDir,
}

impl Iterator for Records {
	type Item = Result<AddressRecord, LedgerError>;

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			let entry = match self.entries.next()? {
				Ok(entry) => entry,
				Err(err) => return Some(Err(storage(&self.dir)(err))),
			};

			let name = entry.file_name();
			let address: IpAddr = match name.to_str().and_then(|n| n.parse().ok()) {
				Some(address) => address,
				// temp files, the lock file, the subdirectories
				None => continue,
			};

			match read_json::<AddressRecord>(&entry.path()) {
				Ok(Some(record)) if record.address == address => return Some(Ok(record)),
				Ok(Some(record)) => {
					warn!(
						"ledger file {} names {} but holds {}, skipping",
						entry.path().display(),
						address,
						record.address
					);
				}
				Ok(None) => {}
				Err(err) => return Some(Err(err)),
			}
		}
	}
}
