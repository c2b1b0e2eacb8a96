//! Errors raised while reading a plugin invocation.

use std::env::VarError;

use regex::Regex;
use semver::Version;
use serde_json::Value;
use thiserror::Error;

use crate::reply::ErrorReply;

/// Failures of the protocol layer: bad environment, bad input, bad config.
///
/// Plugins usually wrap this in their own error type and keep the mapping to
/// reply codes provided by [`CniError::into_reply`].
#[derive(Debug, Error)]
pub enum CniError {
	/// Reading STDIN (or another stream) failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),

	/// The input could not be decoded.
	#[error(transparent)]
	Json(#[from] serde_json::Error),

	/// The configuration asks for a spec version this plugin doesn't speak.
	#[error("plugin does not understand CNI version: {0}")]
	Incompatible(Version),

	/// STDIN was empty.
	#[error("missing input network config")]
	MissingInput,

	/// A required `CNI_*` variable is absent.
	#[error("missing environment variable: {var}: {err}")]
	MissingEnv {
		/// Variable name.
		var: &'static str,
		/// Underlying lookup error.
		#[source]
		err: VarError,
	},

	/// A `CNI_*` variable is present but unusable.
	#[error("environment variable has invalid format: {var}: {err}")]
	InvalidEnv {
		/// Variable name.
		var: &'static str,
		/// Why it was rejected.
		#[source]
		err: Box<dyn std::error::Error>,
	},

	/// A configuration field the plugin needs is absent.
	#[error("missing field in network config: {0}")]
	MissingField(&'static str),

	/// A configuration field has the wrong shape or an unusable value.
	#[error("invalid field in network config: {field}: expected {expected}, got {value}")]
	InvalidField {
		/// Dotted path of the field.
		field: &'static str,
		/// What was expected, in words.
		expected: &'static str,
		/// What was found.
		value: Value,
	},

	/// Anything else.
	#[error("{0}")]
	Generic(String),
}

impl CniError {
	/// Render into the error document written to STDOUT.
	pub fn into_reply(self, cni_version: Version) -> ErrorReply<'static> {
		match self {
			Self::Io(e) => ErrorReply {
				cni_version,
				code: 5,
				msg: "I/O error",
				details: e.to_string(),
			},
			Self::Json(e) => ErrorReply {
				cni_version,
				code: 6,
				msg: "Cannot decode JSON payload",
				details: e.to_string(),
			},
			e @ Self::Incompatible(_) => ErrorReply {
				cni_version,
				code: 1,
				msg: "Incompatible CNI version",
				details: e.to_string(),
			},
			e @ Self::MissingInput => ErrorReply {
				cni_version,
				code: 7,
				msg: "Missing payload",
				details: e.to_string(),
			},
			e @ Self::MissingEnv { .. } => ErrorReply {
				cni_version,
				code: 4,
				msg: "Missing environment variable",
				details: e.to_string(),
			},
			e @ Self::InvalidEnv { .. } => ErrorReply {
				cni_version,
				code: 4,
				msg: "Invalid environment variable",
				details: e.to_string(),
			},
			e @ Self::MissingField(_) => ErrorReply {
				cni_version,
				code: 7,
				msg: "Missing field in network config",
				details: e.to_string(),
			},
			e @ Self::InvalidField { .. } => ErrorReply {
				cni_version,
				code: 7,
				msg: "Invalid network config",
				details: e.to_string(),
			},
			e @ Self::Generic(_) => ErrorReply {
				cni_version,
				code: 100,
				msg: "Plugin error",
				details: e.to_string(),
			},
		}
	}
}

/// The value of an environment variable was empty.
#[derive(Clone, Copy, Debug, Error)]
#[error("must not be empty")]
pub struct EmptyValueError;

/// The value of an environment variable didn't match the expected pattern.
#[derive(Clone, Debug, Error)]
#[error("must match regex: {0}")]
pub struct RegexValueError(pub Regex);

/// The value of an environment variable isn't usable as an interface name.
#[derive(Clone, Copy, Debug, Error)]
#[error("must be an interface name of 1 to 15 bytes without '/', ':' or whitespace")]
pub struct InterfaceNameError;

/// `CNI_COMMAND` held something other than a known command.
#[derive(Clone, Copy, Debug, Error)]
#[error("must be one of ADD, DEL, CHECK, GC, STATUS, VERSION")]
pub struct InvalidCommandError;
