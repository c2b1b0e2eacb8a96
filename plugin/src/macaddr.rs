//! MAC addresses as they appear in replies.

use std::{convert::TryFrom, fmt, str::FromStr};

use macaddr::{MacAddr6, ParseError};
use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

/// A MAC address that (de)serialises as `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone)]
pub struct MacAddr(pub MacAddr6);

impl From<MacAddr6> for MacAddr {
	fn from(m: MacAddr6) -> Self {
		Self(m)
	}
}

impl From<MacAddr> for MacAddr6 {
	fn from(m: MacAddr) -> Self {
		m.0
	}
}

impl From<[u8; 6]> for MacAddr {
	fn from(bytes: [u8; 6]) -> Self {
		Self(MacAddr6::from(bytes))
	}
}

/// Link-layer addresses read from the kernel come as byte vectors; anything
/// other than six bytes is not an Ethernet address.
impl TryFrom<&[u8]> for MacAddr {
	type Error = usize;

	fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
		let bytes: [u8; 6] = TryFrom::try_from(bytes).map_err(|_| bytes.len())?;
		Ok(Self::from(bytes))
	}
}

impl fmt::Display for MacAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let b = self.0.as_bytes();
		write!(
			f,
			"{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
			b[0], b[1], b[2], b[3], b[4], b[5]
		)
	}
}

impl FromStr for MacAddr {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		MacAddr6::from_str(s).map(Self)
	}
}

impl Serialize for MacAddr {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		self.to_string().serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for MacAddr {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let j = String::deserialize(deserializer)?;
		Self::from_str(&j).map_err(Error::custom)
	}
}
