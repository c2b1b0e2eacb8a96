//! The IpRange type, describing an address pool in configuration.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CniError;

/// An address range within a subnet.
///
/// Only the subnet is required; `range_start` and `range_end` narrow the
/// allocatable part of it and are inclusive.
///
/// # Examples
///
/// ```json
/// {"subnet": "10.244.1.0/24"}
/// {"subnet": "10.244.0.0/23", "rangeStart": "10.244.1.0", "rangeEnd": "10.244.1.254"}
/// {"subnet": "192.168.1.0/24", "gateway": "192.168.1.254"}
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpRange {
	/// The subnet for the range.
	pub subnet: IpNetwork,

	/// First allocatable address, inclusive.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub range_start: Option<IpAddr>,

	/// Last allocatable address, inclusive.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub range_end: Option<IpAddr>,

	/// Gateway address, never allocated.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gateway: Option<IpAddr>,
}

impl IpRange {
	/// Check that every address given lies within the subnet.
	///
	/// Family mismatches count as lying outside.
	pub fn check_contained(&self) -> Result<(), CniError> {
		let fields = [
			("rangeStart", self.range_start),
			("rangeEnd", self.range_end),
			("gateway", self.gateway),
		];

		for (name, addr) in fields.iter() {
			if let Some(addr) = addr {
				if !self.subnet.contains(*addr) {
					return Err(CniError::InvalidField {
						field: *name,
						expected: "an address within the subnet",
						value: Value::from(addr.to_string()),
					});
				}
			}
		}

		if let (Some(start), Some(end)) = (self.range_start, self.range_end) {
			if start > end {
				return Err(CniError::InvalidField {
					field: "rangeEnd",
					expected: "an address not below rangeStart",
					value: Value::from(end.to_string()),
				});
			}
		}

		Ok(())
	}
}
