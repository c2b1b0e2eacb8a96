//! Spec version negotiation.

use std::str::FromStr;

use log::debug;
use semver::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{error::CniError, reply::ReplyPayload};

/// Spec versions this crate can read configs for and reply in.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0", "1.1.0"];

/// Version used for replies written before a config could be read.
pub const FALLBACK_VERSION: &str = "1.0.0";

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VersionPayload {
	#[serde(deserialize_with = "deserialize_version")]
	pub cni_version: Version,
}

/// Reply to the VERSION command.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionReply {
	/// Version of the reply itself.
	#[serde(deserialize_with = "deserialize_version")]
	#[serde(serialize_with = "serialize_version")]
	pub cni_version: Version,

	/// Every version the plugin supports.
	#[serde(deserialize_with = "deserialize_version_list")]
	#[serde(serialize_with = "serialize_version_list")]
	pub supported_versions: Vec<Version>,
}

impl<'de> ReplyPayload<'de> for VersionReply {}

fn supported_list() -> Vec<Version> {
	SUPPORTED_VERSIONS
		.iter()
		.filter_map(|v| Version::parse(v).ok())
		.collect()
}

/// Build the VERSION reply, echoing the requested version.
pub fn supported(cni_version: Version) -> VersionReply {
	VersionReply {
		cni_version,
		supported_versions: supported_list(),
	}
}

/// The version replies fall back to when nothing better is known.
pub fn fallback() -> Version {
	// UNWRAP: constant is a valid version
	Version::parse(FALLBACK_VERSION).unwrap()
}

/// Reject configs written for a version outside [`SUPPORTED_VERSIONS`].
pub fn check(version: &Version) -> Result<(), CniError> {
	if supported_list().iter().any(|v| v == version) {
		debug!("config version {} is supported", version);
		Ok(())
	} else {
		Err(CniError::Incompatible(version.clone()))
	}
}

pub(crate) fn serialize_version<S>(version: &Version, serializer: S) -> Result<S::Ok, S::Error>
where
	S: Serializer,
{
	version.to_string().serialize(serializer)
}

#[allow(clippy::ptr_arg)]
pub(crate) fn serialize_version_list<S>(
	list: &Vec<Version>,
	serializer: S,
) -> Result<S::Ok, S::Error>
where
	S: Serializer,
{
	list.iter()
		.map(Version::to_string)
		.collect::<Vec<String>>()
		.serialize(serializer)
}

pub(crate) fn deserialize_version<'de, D>(deserializer: D) -> Result<Version, D::Error>
where
	D: Deserializer<'de>,
{
	use serde::de::Error;
	let j = String::deserialize(deserializer)?;
	Version::from_str(&j).map_err(Error::custom)
}

pub(crate) fn deserialize_version_list<'de, D>(deserializer: D) -> Result<Vec<Version>, D::Error>
where
	D: Deserializer<'de>,
{
	use serde::de::Error;
	let j = Vec::<String>::deserialize(deserializer)?;
	j.iter()
		.map(|s| Version::from_str(s).map_err(Error::custom))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_listed_versions() {
		assert!(check(&Version::new(1, 0, 0)).is_ok());
		assert!(check(&Version::new(0, 4, 0)).is_ok());
		assert!(matches!(
			check(&Version::new(0, 2, 0)),
			Err(CniError::Incompatible(_))
		));
	}

	#[test]
	fn version_reply_shape() {
		let reply = supported(Version::new(1, 0, 0));
		let json = serde_json::to_value(&reply).unwrap();
		assert_eq!(json["cniVersion"], "1.0.0");
		assert_eq!(json["supportedVersions"].as_array().unwrap().len(), 5);
		assert_eq!(json["supportedVersions"][4], "1.1.0");
	}
}
