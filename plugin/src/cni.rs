use std::{
	env,
	io::{stdin, Read},
	path::PathBuf,
	str::FromStr,
};

use log::{debug, error};
use regex::Regex;
use semver::Version;

use crate::{
	command::Command,
	config::NetworkConfig,
	error::{CniError, EmptyValueError, InterfaceNameError, RegexValueError},
	reply::reply,
	version::{self, VersionPayload},
};

/// One plugin invocation, read from the environment and STDIN.
#[derive(Clone, Debug)]
pub enum Cni {
	/// Attach `container_id` to the network as `ifname` inside `netns`.
	Add {
		/// Runtime's container (sandbox) id.
		container_id: String,
		/// Interface name to create inside the namespace.
		ifname: String,
		/// Path to the network namespace.
		netns: PathBuf,
		/// Network configuration.
		config: NetworkConfig,
	},

	/// Detach; the namespace may already be gone.
	Del {
		/// Runtime's container (sandbox) id.
		container_id: String,
		/// Interface name inside the namespace.
		ifname: String,
		/// Path to the network namespace, if it still exists.
		netns: Option<PathBuf>,
		/// Network configuration.
		config: NetworkConfig,
	},

	/// Verify a previous ADD.
	Check {
		/// Runtime's container (sandbox) id.
		container_id: String,
		/// Interface name inside the namespace.
		ifname: String,
		/// Path to the network namespace.
		netns: PathBuf,
		/// Network configuration.
		config: NetworkConfig,
	},

	/// Garbage-collect attachments not listed in the config.
	Gc {
		/// Network configuration, including `cni.dev/valid-attachments`.
		config: NetworkConfig,
	},

	/// Report readiness.
	Status {
		/// Network configuration.
		config: NetworkConfig,
	},

	/// Report supported versions; carries the version asked about.
	Version(Version),
}

impl Cni {
	/// Read the invocation, without replying on failure.
	pub fn from_env() -> Result<Self, CniError> {
		let command: Command = require_env("CNI_COMMAND")?;
		debug!("command={}", command);

		let mut payload = Vec::with_capacity(1024);
		debug!("reading stdin til EOF...");
		stdin().read_to_end(&mut payload)?;
		debug!("read payload bytes={}", payload.len());

		Self::from_parts(command, &payload)
	}

	pub(crate) fn from_parts(command: Command, payload: &[u8]) -> Result<Self, CniError> {
		if payload.is_empty() {
			return Err(CniError::MissingInput);
		}

		if let Command::Version = command {
			let config: VersionPayload = serde_json::from_slice(payload)?;
			return Ok(Self::Version(config.cni_version));
		}

		let config: NetworkConfig = serde_json::from_slice(payload)?;
		version::check(&config.cni_version)?;

		match command {
			Command::Add => Ok(Self::Add {
				container_id: container_id()?,
				ifname: ifname()?,
				netns: require_env("CNI_NETNS")?,
				config,
			}),
			Command::Del => Ok(Self::Del {
				container_id: container_id()?,
				ifname: ifname()?,
				netns: load_env::<String>("CNI_NETNS")?
					.filter(|ns| !ns.is_empty())
					.map(PathBuf::from),
				config,
			}),
			Command::Check => Ok(Self::Check {
				container_id: container_id()?,
				ifname: ifname()?,
				netns: require_env("CNI_NETNS")?,
				config,
			}),
			Command::Gc => Ok(Self::Gc { config }),
			Command::Status => Ok(Self::Status { config }),
			Command::Version => unreachable!("handled above"),
		}
	}

	/// Read the invocation, replying with an error document and exiting if
	/// that fails.
	pub fn load() -> Self {
		debug!(
			"CNI plugin built with {} crate version {}",
			env!("CARGO_PKG_NAME"),
			env!("CARGO_PKG_VERSION")
		);

		match Self::from_env() {
			Ok(cni) => cni,
			Err(e) => {
				error!("{}", e);
				reply(e.into_reply(version::fallback()))
			}
		}
	}

	/// The command this invocation carries.
	pub fn command(&self) -> Command {
		match self {
			Self::Add { .. } => Command::Add,
			Self::Del { .. } => Command::Del,
			Self::Check { .. } => Command::Check,
			Self::Gc { .. } => Command::Gc,
			Self::Status { .. } => Command::Status,
			Self::Version(_) => Command::Version,
		}
	}
}

fn require_env<T>(var: &'static str) -> Result<T, CniError>
where
	T: FromStr,
	T::Err: std::error::Error + 'static,
{
	env::var(var)
		.map_err(|err| CniError::MissingEnv { var, err })
		.and_then(|val| {
			debug!("read env var {} = {:?}", var, val);
			val.parse().map_err(|err| CniError::InvalidEnv {
				var,
				err: Box::new(err),
			})
		})
}

fn load_env<T>(var: &'static str) -> Result<Option<T>, CniError>
where
	T: FromStr,
	T::Err: std::error::Error + 'static,
{
	require_env(var).map(Some).or_else(|err| {
		if let CniError::MissingEnv { .. } = err {
			Ok(None)
		} else {
			Err(err)
		}
	})
}

/// Longest interface name the kernel accepts (IFNAMSIZ less the NUL).
pub const IFNAME_MAX: usize = 15;

/// Whether `name` can name a network interface.
pub fn valid_ifname(name: &str) -> bool {
	!name.is_empty()
		&& name.len() <= IFNAME_MAX
		&& name != "."
		&& name != ".."
		&& !name.contains(|c: char| c == '/' || c == ':' || c.is_whitespace())
}

fn ifname() -> Result<String, CniError> {
	let name: String = require_env("CNI_IFNAME")?;
	check_ifname(&name)?;
	Ok(name)
}

fn check_ifname(name: &str) -> Result<(), CniError> {
	if valid_ifname(name) {
		Ok(())
	} else {
		Err(CniError::InvalidEnv {
			var: "CNI_IFNAME",
			err: Box::new(InterfaceNameError),
		})
	}
}

fn container_id() -> Result<String, CniError> {
	let id: String = require_env("CNI_CONTAINERID")?;
	check_container_id(&id)?;
	Ok(id)
}

fn check_container_id(id: &str) -> Result<(), CniError> {
	if id.is_empty() {
		return Err(CniError::InvalidEnv {
			var: "CNI_CONTAINERID",
			err: Box::new(EmptyValueError),
		});
	}

	// UNWRAP: constant pattern
	let re = Regex::new(r"(?i)^[a-z0-9][a-z0-9_.\-]*$").unwrap();
	if !re.is_match(id) {
		return Err(CniError::InvalidEnv {
			var: "CNI_CONTAINERID",
			err: Box::new(RegexValueError(re)),
		});
	}

	Ok(())
}
