use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// DNS settings from the network configuration.
///
/// The plugin doesn't act on these; they are copied into the ADD result for
/// the runtime to apply. Every field is optional.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
	/// Nameservers, in priority order.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub nameservers: Vec<IpAddr>,

	/// Local domain for short names.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub domain: Option<String>,

	/// Search domains, in priority order.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub search: Vec<String>,

	/// Resolver options.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub options: Vec<String>,
}
