use std::{fmt, str::FromStr};

use crate::error::InvalidCommandError;

/// The operation requested by the runtime through `CNI_COMMAND`.
///
/// See the [`Cni`][crate::Cni] enum for what each command carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
	/// Attach a container to the network.
	Add,

	/// Detach a container from the network. Must be idempotent.
	Del,

	/// Verify an existing attachment without changing it.
	Check,

	/// Release everything not listed as a valid attachment.
	///
	/// Introduced in spec version 1.1.0.
	Gc,

	/// Report whether the plugin can service ADD requests.
	///
	/// Introduced in spec version 1.1.0.
	Status,

	/// Report the supported spec versions.
	Version,
}

impl FromStr for Command {
	type Err = InvalidCommandError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ADD" => Ok(Self::Add),
			"DEL" => Ok(Self::Del),
			"CHECK" => Ok(Self::Check),
			"GC" => Ok(Self::Gc),
			"STATUS" => Ok(Self::Status),
			"VERSION" => Ok(Self::Version),
			_ => Err(InvalidCommandError),
		}
	}
}

impl AsRef<str> for Command {
	fn as_ref(&self) -> &'static str {
		match self {
			Command::Add => "ADD",
			Command::Del => "DEL",
			Command::Check => "CHECK",
			Command::Gc => "GC",
			Command::Status => "STATUS",
			Command::Version => "VERSION",
		}
	}
}

impl fmt::Display for Command {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_ref())
	}
}
