//! The network configuration a plugin receives on STDIN.
//!
//! Start with [`NetworkConfig`]. Plugin-specific keys are not modelled here:
//! they land in the `specific` maps and are pulled out with
//! [`NetworkConfig::field`] / [`IpamConfig::field`].

use std::{collections::HashMap, net::IpAddr};

use ipnetwork::IpNetwork;
use semver::Version;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::CniError;

pub use crate::dns::Dns;

/// Top-level network configuration, as handed over by the runtime.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
	/// Spec version the configuration was written for.
	///
	/// Replies must be written in this version.
	#[serde(deserialize_with = "crate::version::deserialize_version")]
	#[serde(serialize_with = "crate::version::serialize_version")]
	pub cni_version: Version,

	/// Network name, unique on the host.
	pub name: String,

	/// Plugin binary name (`type` in JSON).
	#[serde(rename = "type")]
	pub plugin: String,

	/// Free-form arguments from the runtime.
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub args: HashMap<String, Value>,

	/// Whether to masquerade traffic leaving the network.
	#[serde(default)]
	pub ip_masq: bool,

	/// Address management section.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ipam: Option<IpamConfig>,

	/// DNS settings to hand back in the result.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dns: Option<Dns>,

	/// Result of the previous plugin in a chain, if any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub prev_result: Option<Value>,

	/// Every other top-level key.
	#[serde(flatten)]
	pub specific: HashMap<String, Value>,
}

impl NetworkConfig {
	/// Deserialise an optional plugin-specific top-level key.
	pub fn field<T>(&self, field: &'static str) -> Result<Option<T>, CniError>
	where
		T: DeserializeOwned,
	{
		typed_field(&self.specific, field, field)
	}
}

/// Address management section of the configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConfig {
	/// IPAM type (`type` in JSON).
	#[serde(rename = "type")]
	pub plugin: String,

	/// Every other key in the section.
	#[serde(flatten)]
	pub specific: HashMap<String, Value>,
}

impl IpamConfig {
	/// Deserialise an optional key of the IPAM section.
	///
	/// `path` is the dotted name used in error messages.
	pub fn field<T>(&self, field: &str, path: &'static str) -> Result<Option<T>, CniError>
	where
		T: DeserializeOwned,
	{
		typed_field(&self.specific, field, path)
	}
}

fn typed_field<T>(
	map: &HashMap<String, Value>,
	field: &str,
	path: &'static str,
) -> Result<Option<T>, CniError>
where
	T: DeserializeOwned,
{
	match map.get(field) {
		None | Some(Value::Null) => Ok(None),
		Some(value) => serde_json::from_value(value.clone())
			.map(Some)
			.map_err(|_| CniError::InvalidField {
				field: path,
				expected: std::any::type_name::<T>(),
				value: value.clone(),
			}),
	}
}

/// A route, both in configuration and in results.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Route {
	/// Destination prefix.
	pub dst: IpNetwork,

	/// Next hop, if not the default gateway.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gw: Option<IpAddr>,
}

#[cfg(test)]
mod tests {
	use super::*;

	const CONFIG: &str = r#"{
		"cniVersion": "1.0.0",
		"name": "pods",
		"type": "host-bridge",
		"bridge": "cni0",
		"mtu": 1450,
		"ipMasq": true,
		"ipam": {
			"type": "host-local",
			"subnet": "10.244.1.0/24",
			"routes": [{"dst": "192.168.0.0/16"}]
		},
		"dns": {"nameservers": ["10.96.0.10"]}
	}"#;

	#[test]
	fn known_and_specific_fields() {
		let config: NetworkConfig = serde_json::from_str(CONFIG).unwrap();
		assert_eq!(config.cni_version, Version::new(1, 0, 0));
		assert_eq!(config.plugin, "host-bridge");
		assert!(config.ip_masq);
		assert_eq!(config.field::<String>("bridge").unwrap().unwrap(), "cni0");
		assert_eq!(config.field::<u32>("mtu").unwrap(), Some(1450));
		assert_eq!(config.field::<u32>("absent").unwrap(), None);

		let ipam = config.ipam.unwrap();
		assert_eq!(ipam.plugin, "host-local");
		let routes: Vec<Route> = ipam.field("routes", "ipam.routes").unwrap().unwrap();
		assert_eq!(routes[0].dst, "192.168.0.0/16".parse::<IpNetwork>().unwrap());
		assert_eq!(routes[0].gw, None);
	}

	#[test]
	fn wrongly_typed_field_is_invalid() {
		let config: NetworkConfig = serde_json::from_str(CONFIG).unwrap();
		let err = config.field::<u32>("bridge").unwrap_err();
		assert!(matches!(err, CniError::InvalidField { field: "bridge", .. }));
	}
}
