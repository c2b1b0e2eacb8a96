use cni_plugin::{error::CniError, reply::ErrorReply};
use ipnetwork::IpNetwork;
use semver::Version;
use thiserror::Error;

use crate::{guard::LockError, ledger::LedgerError, netlink::NetError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
	#[error(transparent)]
	Cni(#[from] CniError),

	#[error(transparent)]
	Ledger(#[from] LedgerError),

	#[error(transparent)]
	Lock(#[from] LockError),

	#[error("no free address left in {subnet} ({size} allocatable)")]
	OutOfAddresses { subnet: IpNetwork, size: u128 },

	#[error("attach {owner}: {step}: {err}")]
	Attach {
		owner: String,
		step: &'static str,
		#[source]
		err: NetError,
	},

	#[error("detach {owner}: {step}: {err}")]
	Detach {
		owner: String,
		step: &'static str,
		#[source]
		err: NetError,
	},

	#[error("{owner}: {what}")]
	Mismatch { owner: String, what: String },

	#[error("pool {subnet} cannot take new attachments: {reason}")]
	Unavailable { subnet: IpNetwork, reason: String },
}

impl AppError {
	pub fn into_reply(self, cni_version: Version) -> ErrorReply<'static> {
		match self {
			Self::Cni(e) => e.into_reply(cni_version),
			Self::Ledger(e) => match e {
				e @ LedgerError::AlreadyAllocated { .. } | e @ LedgerError::OwnerConflict { .. } => {
					ErrorReply {
						cni_version,
						code: 111,
						msg: "Address already allocated",
						details: e.to_string(),
					}
				}
				e => ErrorReply {
					cni_version,
					code: 112,
					msg: "Address ledger storage failure",
					details: e.to_string(),
				},
			},
			Self::Lock(e) => match e {
				e @ LockError::Timeout { .. } => ErrorReply {
					cni_version,
					code: 11,
					msg: "Timed out waiting for lock, try again later",
					details: e.to_string(),
				},
				e => ErrorReply {
					cni_version,
					code: 112,
					msg: "Lock storage failure",
					details: e.to_string(),
				},
			},
			e @ Self::OutOfAddresses { .. } => ErrorReply {
				cni_version,
				code: 110,
				msg: "Address pool exhausted",
				details: e.to_string(),
			},
			e @ Self::Attach { .. } => ErrorReply {
				cni_version,
				code: 113,
				msg: "Failed to attach container",
				details: e.to_string(),
			},
			e @ Self::Detach { .. } => ErrorReply {
				cni_version,
				code: 114,
				msg: "Failed to detach container",
				details: e.to_string(),
			},
			e @ Self::Mismatch { .. } => ErrorReply {
				cni_version,
				code: 115,
				msg: "Attachment does not match recorded state",
				details: e.to_string(),
			},
			e @ Self::Unavailable { .. } => ErrorReply {
				cni_version,
				code: 50,
				msg: "Plugin not available",
				details: e.to_string(),
			},
		}
	}

	pub(crate) fn mismatch(owner: impl ToString, what: impl Into<String>) -> Self {
		Self::Mismatch {
			owner: owner.to_string(),
			what: what.into(),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{io, path::PathBuf, time::Duration};

	use super::*;

	fn code(err: AppError) -> i32 {
		err.into_reply(Version::new(1, 0, 0)).code
	}

	#[test]
	fn codes() {
		let subnet: IpNetwork = "10.0.0.0/30".parse().unwrap();
		assert_eq!(code(AppError::OutOfAddresses { subnet, size: 1 }), 110);
		assert_eq!(
			code(AppError::Ledger(LedgerError::AlreadyAllocated {
				address: "10.0.0.2".parse().unwrap(),
				owner: "podA/eth0".into(),
			})),
			111
		);
		assert_eq!(
			code(AppError::Ledger(LedgerError::Storage {
				path: PathBuf::from("/x"),
				err: io::Error::new(io::ErrorKind::Other, "disk on fire"),
			})),
			112
		);
		assert_eq!(
			code(AppError::Lock(LockError::Timeout {
				scope: "pool".into(),
				waited: Duration::from_secs(30),
				holder: None,
			})),
			11
		);
		assert_eq!(code(AppError::mismatch("podA/eth0", "gone")), 115);
		assert_eq!(
			code(AppError::Unavailable {
				subnet,
				reason: "full".into()
			}),
			50
		);
		assert_eq!(code(AppError::Cni(CniError::MissingField("ipam.subnet"))), 7);
	}

	#[test]
	fn attach_details_name_the_step() {
		let reply = AppError::Attach {
			owner: "podA/eth0".into(),
			step: "enslave",
			err: NetError::NoSuchLink("cni0".into()),
		}
		.into_reply(Version::new(1, 0, 0));
		assert_eq!(reply.code, 113);
		assert!(reply.details.contains("enslave"));
		assert!(reply.details.contains("podA/eth0"));
	}
}
