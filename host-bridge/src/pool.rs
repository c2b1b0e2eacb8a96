//! Resolved address pools.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use cni_plugin::{error::CniError, ip_range::IpRange};
use ipnetwork::IpNetwork;
use serde_json::Value;

/// A subnet with its gateway and allocatable bounds worked out.
///
/// The network address, the last address of the subnet (the broadcast address
/// for IPv4), and the gateway are never part of the allocatable set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pool {
	subnet: IpNetwork,
	gateway: IpAddr,
	start: u128,
	end: u128,
}

impl Pool {
	/// Resolve a configured range, applying defaults.
	///
	/// The gateway defaults to the first usable address; the range defaults to
	/// every usable address.
	pub fn new(range: &IpRange) -> Result<Self, CniError> {
		range.check_contained()?;

		let subnet = range.subnet;
		let (network, last) = bounds(subnet);
		let too_small = || CniError::InvalidField {
			field: "subnet",
			expected: "a prefix leaving at least two usable addresses",
			value: Value::from(subnet.to_string()),
		};
		// a host prefix at the top of the space has no successor
		let first_usable = network.checked_add(1).ok_or_else(too_small)?;
		let last_usable = last.saturating_sub(1);
		if last_usable <= first_usable {
			return Err(too_small());
		}

		let usable = |field: &'static str, addr: IpAddr| {
			let n = to_u128(addr);
			if n < first_usable || n > last_usable {
				Err(CniError::InvalidField {
					field,
					expected: "a usable host address of the subnet",
					value: Value::from(addr.to_string()),
				})
			} else {
				Ok(n)
			}
		};

		let gateway = match range.gateway {
			Some(gw) => {
				usable("gateway", gw)?;
				gw
			}
			None => from_u128(subnet, first_usable),
		};

		let start = match range.range_start {
			Some(addr) => usable("rangeStart", addr)?,
			None => first_usable,
		};
		let end = match range.range_end {
			Some(addr) => usable("rangeEnd", addr)?,
			None => last_usable,
		};

		let pool = Self {
			subnet,
			gateway,
			start,
			end,
		};

		if pool.size() == 0 {
			return Err(CniError::InvalidField {
				field: "rangeEnd",
				expected: "a range holding an address besides the gateway",
				value: Value::from(from_u128(subnet, end).to_string()),
			});
		}

		Ok(pool)
	}

	/// The subnet, normalised to its network address.
	pub fn subnet(&self) -> IpNetwork {
		// UNWRAP: prefix comes from a valid network of the same family
		IpNetwork::new(self.subnet.network(), self.subnet.prefix()).unwrap()
	}

	/// The reserved gateway address.
	pub fn gateway(&self) -> IpAddr {
		self.gateway
	}

	/// The gateway with the subnet's prefix, as assigned to the bridge.
	pub fn gateway_network(&self) -> IpNetwork {
		self.with_prefix(self.gateway)
	}

	/// An address with the subnet's prefix length.
	pub fn with_prefix(&self, addr: IpAddr) -> IpNetwork {
		// UNWRAP: prefix comes from a valid network of the same family
		IpNetwork::new(addr, self.subnet.prefix()).unwrap()
	}

	/// Whether the pool would ever hand out `addr`.
	pub fn is_allocatable(&self, addr: IpAddr) -> bool {
		if !self.subnet.contains(addr) || addr == self.gateway {
			return false;
		}

		let n = to_u128(addr);
		n >= self.start && n <= self.end
	}

	/// Number of allocatable addresses.
	pub fn size(&self) -> u128 {
		let span = self.end - self.start + 1;
		if self.is_in_range(self.gateway) {
			span - 1
		} else {
			span
		}
	}

	/// Every allocatable address, ascending from the range start.
	pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
		(self.start..=self.end)
			.map(move |n| from_u128(self.subnet, n))
			.filter(move |addr| *addr != self.gateway)
	}

	/// Whether the pool is IPv4.
	pub fn is_ipv4(&self) -> bool {
		self.subnet.is_ipv4()
	}

	fn is_in_range(&self, addr: IpAddr) -> bool {
		let n = to_u128(addr);
		n >= self.start && n <= self.end
	}
}

fn bounds(subnet: IpNetwork) -> (u128, u128) {
	match subnet {
		IpNetwork::V4(net) => {
			let mask = u32::from(net.mask());
			let network = u32::from(net.ip()) & mask;
			(network as u128, (network | !mask) as u128)
		}
		IpNetwork::V6(net) => {
			let mask = u128::from(net.mask());
			let network = u128::from(net.ip()) & mask;
			(network, network | !mask)
		}
	}
}

fn to_u128(addr: IpAddr) -> u128 {
	match addr {
		IpAddr::V4(a) => u32::from(a) as u128,
		IpAddr::V6(a) => u128::from(a),
	}
}

fn from_u128(family: IpNetwork, n: u128) -> IpAddr {
	match family {
		IpNetwork::V4(_) => IpAddr::V4(Ipv4Addr::from(n as u32)),
		IpNetwork::V6(_) => IpAddr::V6(Ipv6Addr::from(n)),
	}
}
