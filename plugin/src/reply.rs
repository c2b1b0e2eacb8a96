//! Reply documents and the functions that emit them.
//!
//! A plugin invocation ends with exactly one of: a success document, an error
//! document, a version document, or no output at all (DEL, CHECK, GC, STATUS).

use std::{
	collections::HashMap,
	io::{stdout, Write},
	net::IpAddr,
	path::PathBuf,
	process::exit,
};

use ipnetwork::IpNetwork;
use log::{debug, error};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{config::Route, macaddr::MacAddr};

pub use crate::version::VersionReply;

/// Implemented by every document a plugin can write to STDOUT.
pub trait ReplyPayload<'de>: std::fmt::Debug + Serialize + Deserialize<'de> {
	/// Error code carried by the document, zero for non-errors.
	fn code(&self) -> i32 {
		0
	}
}

/// Error document.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply<'msg> {
	/// Version the document conforms to.
	#[serde(deserialize_with = "crate::version::deserialize_version")]
	#[serde(serialize_with = "crate::version::serialize_version")]
	pub cni_version: Version,

	/// Error code; 1-99 are reserved by the spec, 100+ are plugin-defined.
	pub code: i32,

	/// Short, fixed description of the error kind.
	pub msg: &'msg str,

	/// Longer, instance-specific explanation.
	pub details: String,
}

impl<'de> ReplyPayload<'de> for ErrorReply<'de> {
	fn code(&self) -> i32 {
		self.code
	}
}

/// Success document for ADD.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessReply {
	/// Version the document conforms to.
	#[serde(deserialize_with = "crate::version::deserialize_version")]
	#[serde(serialize_with = "crate::version::serialize_version")]
	pub cni_version: Version,

	/// Interfaces created or touched, host side and sandbox side.
	#[serde(default)]
	pub interfaces: Vec<InterfaceReply>,

	/// Addresses assigned.
	#[serde(default)]
	pub ips: Vec<IpReply>,

	/// Routes installed in the sandbox.
	#[serde(default)]
	pub routes: Vec<Route>,

	/// DNS settings for the sandbox.
	#[serde(default)]
	pub dns: DnsReply,

	/// Extra top-level fields.
	#[serde(flatten)]
	pub specific: HashMap<String, Value>,
}

impl<'de> ReplyPayload<'de> for SuccessReply {}

/// One interface in a [`SuccessReply`].
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceReply {
	/// Interface name.
	pub name: String,

	/// Hardware address.
	pub mac: MacAddr,

	/// Namespace path, for interfaces that live inside the sandbox.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sandbox: Option<PathBuf>,
}

/// One address in a [`SuccessReply`].
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpReply {
	/// Address with prefix length.
	pub address: IpNetwork,

	/// Gateway for the address's subnet.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gateway: Option<IpAddr>,

	/// Index into the reply's `interfaces`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub interface: Option<usize>,
}

/// DNS section of a [`SuccessReply`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DnsReply {
	/// Nameservers, in priority order.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub nameservers: Vec<IpAddr>,

	/// Local domain.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub domain: Option<String>,

	/// Search domains, in priority order.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub search: Vec<String>,

	/// Resolver options.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub options: Vec<String>,
}

impl From<crate::config::Dns> for DnsReply {
	fn from(dns: crate::config::Dns) -> Self {
		Self {
			nameservers: dns.nameservers,
			domain: dns.domain,
			search: dns.search,
			options: dns.options,
		}
	}
}

/// Serialise a reply to `out`, returning the process exit status to use.
pub fn write_reply<'de, T, W>(result: &T, out: W) -> i32
where
	T: ReplyPayload<'de>,
	W: Write,
{
	debug!("replying with {:#?}", result);
	if let Err(err) = serde_json::to_writer(out, result) {
		error!("could not write reply to stdout: {}", err);
		return 1;
	}

	if result.code() == 0 {
		0
	} else {
		1
	}
}

/// Write a reply to STDOUT and exit.
///
/// Exits 0 for success and version documents, 1 for error documents.
pub fn reply<'de, T>(result: T) -> !
where
	T: ReplyPayload<'de>,
{
	let status = write_reply(&result, stdout());
	exit(status);
}

/// Exit successfully without writing anything.
pub fn done() -> ! {
	debug!("done, no reply payload");
	exit(0);
}
