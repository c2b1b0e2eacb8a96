//! Plugin settings, pulled out of the network configuration.

use std::{
	net::IpAddr,
	path::{Path, PathBuf},
	time::Duration,
};

use cni_plugin::{
	config::{Dns, NetworkConfig, Route},
	error::CniError,
	ip_range::IpRange,
	valid_ifname,
};
use ipnetwork::IpNetwork;
use log::debug;
use semver::Version;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{guard::DEFAULT_TIMEOUT, pool::Pool};

pub const DEFAULT_BRIDGE: &str = "cni0";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/cni/networks";

/// Directory under the data dir holding owner and bridge locks.
const LOCKS_DIR: &str = "locks";

#[derive(Clone, Debug)]
pub struct Settings {
	pub cni_version: Version,
	/// Network name; also names the pool directory.
	pub network: String,
	pub bridge: String,
	pub mtu: Option<u32>,
	pub ip_masq: bool,
	pub lock_timeout: Duration,
	pub pool: Pool,
	/// Extra sandbox routes.
	pub routes: Vec<Route>,
	pub data_dir: PathBuf,
	pub dns: Option<Dns>,
}

impl Settings {
	pub fn from_config(config: &NetworkConfig) -> Result<Self, CniError> {
		check_network_name(&config.name)?;

		let bridge = match config.field::<String>("bridge")? {
			Some(b) => b,
			None => config
				.field::<String>("bridgeName")?
				.unwrap_or_else(|| DEFAULT_BRIDGE.into()),
		};
		check_ifname("bridge", &bridge)?;

		let mtu = config.field::<u32>("mtu")?;
		if mtu == Some(0) {
			return Err(CniError::InvalidField {
				field: "mtu",
				expected: "a positive MTU",
				value: Value::from(0),
			});
		}

		let lock_timeout = config
			.field::<u64>("lockTimeout")?
			.map(Duration::from_secs)
			.unwrap_or(DEFAULT_TIMEOUT);

		let range = IpRange {
			subnet: ipam_field(config, "subnet", "ipam.subnet")?
				.ok_or(CniError::MissingField("ipam.subnet"))?,
			range_start: ipam_field(config, "rangeStart", "ipam.rangeStart")?,
			range_end: ipam_field(config, "rangeEnd", "ipam.rangeEnd")?,
			gateway: ipam_field(config, "gateway", "ipam.gateway")?,
		};
		let pool = Pool::new(&range)?;

		let routes: Vec<Route> = match &config.ipam {
			Some(ipam) => ipam.field("routes", "ipam.routes")?.unwrap_or_default(),
			None => Vec::new(),
		};
		for route in &routes {
			check_route(&pool, route)?;
		}

		let data_dir = ipam_field::<PathBuf>(config, "dataDir", "ipam.dataDir")?
			.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

		let settings = Self {
			cni_version: config.cni_version.clone(),
			network: config.name.clone(),
			bridge,
			mtu,
			ip_masq: config.ip_masq,
			lock_timeout,
			pool,
			routes,
			data_dir,
			dns: config.dns.clone(),
		};
		debug!("settings={:?}", settings);
		Ok(settings)
	}

	pub fn data_dir(&self) -> &Path {
		&self.data_dir
	}
}

/// Read from the IPAM section, falling back to the top level.
fn ipam_field<T>(
	config: &NetworkConfig,
	field: &'static str,
	path: &'static str,
) -> Result<Option<T>, CniError>
where
	T: DeserializeOwned,
{
	if let Some(ipam) = &config.ipam {
		if let Some(value) = ipam.field(field, path)? {
			return Ok(Some(value));
		}
	}

	config.field(field)
}

fn check_network_name(name: &str) -> Result<(), CniError> {
	let usable = !name.is_empty()
		&& !name.starts_with('.')
		&& name != LOCKS_DIR
		&& !name.contains('/')
		&& !name.contains('\0');

	if usable {
		Ok(())
	} else {
		Err(CniError::InvalidField {
			field: "name",
			expected: "a network name usable as a directory name (not `locks`)",
			value: Value::from(name),
		})
	}
}

fn check_ifname(field: &'static str, name: &str) -> Result<(), CniError> {
	if valid_ifname(name) {
		Ok(())
	} else {
		Err(CniError::InvalidField {
			field,
			expected: "an interface name of at most 15 bytes",
			value: Value::from(name),
		})
	}
}

fn check_route(pool: &Pool, route: &Route) -> Result<(), CniError> {
	let same_family = |addr: IpAddr| addr.is_ipv4() == pool.is_ipv4();
	let dst_ok = same_family(route.dst.ip());
	let gw_ok = route.gw.map(same_family).unwrap_or(true);

	if dst_ok && gw_ok {
		Ok(())
	} else {
		Err(CniError::InvalidField {
			field: "ipam.routes",
			expected: "routes of the same address family as the subnet",
			value: Value::from(route_string(route.dst, route.gw)),
		})
	}
}

fn route_string(dst: IpNetwork, gw: Option<IpAddr>) -> String {
	match gw {
		Some(gw) => format!("{} via {}", dst, gw),
		None => dst.to_string(),
	}
}
