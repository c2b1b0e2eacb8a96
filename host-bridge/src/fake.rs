//! In-memory [`HostNetwork`] for tests.

use std::{
	collections::{BTreeMap, BTreeSet},
	io,
	net::IpAddr,
	path::{Path, PathBuf},
	sync::{Arc, Mutex, MutexGuard},
};

use cni_plugin::macaddr::MacAddr;
use ipnetwork::IpNetwork;

use crate::netlink::{HostNetwork, Link, NetError, SandboxConfig};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Kind {
	Bridge,
	Veth { peer: u32 },
}

#[derive(Clone, Debug)]
pub struct FakeLink {
	pub index: u32,
	pub kind: Kind,
	pub master: Option<u32>,
	pub addresses: Vec<IpNetwork>,
	pub routes: Vec<(IpNetwork, IpAddr)>,
	pub up: bool,
}

impl FakeLink {
	fn mac(&self) -> MacAddr {
		MacAddr::from([0x02, 0, 0, 0, (self.index >> 8) as u8, self.index as u8])
	}

	fn to_link(&self) -> Link {
		Link {
			index: self.index,
			mac: self.mac(),
			master: self.master,
		}
	}
}

#[derive(Debug, Default)]
struct State {
	next_index: u32,
	host: BTreeMap<String, FakeLink>,
	namespaces: BTreeMap<PathBuf, BTreeMap<String, FakeLink>>,
	masquerades: BTreeSet<(IpAddr, IpNetwork, String)>,
	fail_at: Option<&'static str>,
	mutations: usize,
}

impl State {
	fn new_link(&mut self, kind: Kind) -> FakeLink {
		self.next_index += 1;
		FakeLink {
			index: self.next_index,
			kind,
			master: None,
			addresses: Vec::new(),
			routes: Vec::new(),
			up: false,
		}
	}

	fn remove_index(&mut self, index: u32) {
		self.host.retain(|_, l| l.index != index);
		for links in self.namespaces.values_mut() {
			links.retain(|_, l| l.index != index);
		}
	}

	fn host_link(&self, name: &str) -> Result<&FakeLink, NetError> {
		self.host
			.get(name)
			.ok_or_else(|| NetError::NoSuchLink(name.into()))
	}

	fn namespace(&mut self, netns: &Path) -> Result<&mut BTreeMap<String, FakeLink>, NetError> {
		self.namespaces
			.get_mut(netns)
			.ok_or_else(|| NetError::Namespace {
				path: netns.to_owned(),
				err: io::Error::new(io::ErrorKind::NotFound, "no such namespace"),
			})
	}
}

/// Records links, namespaces, and NAT rules; can be told to fail at a step.
///
/// Clones share state, so one fake can back several plugin instances.
#[derive(Clone, Debug, Default)]
pub struct FakeNetwork {
	state: Arc<Mutex<State>>,
}

impl FakeNetwork {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap()
	}

	/// Enter a step: fails if told to, counts it if it mutates.
	fn step(&self, name: &'static str, mutates: bool) -> Result<MutexGuard<'_, State>, NetError> {
		let mut state = self.state();
		if state.fail_at == Some(name) {
			return Err(NetError::Io(io::Error::new(
				io::ErrorKind::Other,
				format!("injected failure at {}", name),
			)));
		}

		if mutates {
			state.mutations += 1;
		}
		Ok(state)
	}

	pub fn fail_at(&self, step: &'static str) {
		self.state().fail_at = Some(step);
	}

	pub fn succeed(&self) {
		self.state().fail_at = None;
	}

	pub fn add_netns(&self, path: impl Into<PathBuf>) {
		self.state().namespaces.entry(path.into()).or_default();
	}

	/// Destroy a namespace; its veths take their peers with them.
	pub fn remove_netns(&self, path: &Path) {
		let mut state = self.state();
		if let Some(links) = state.namespaces.remove(path) {
			for link in links.values() {
				if let Kind::Veth { peer } = link.kind {
					state.remove_index(peer);
				}
			}
		}
	}

	/// Delete a host link from outside the plugin.
	pub fn tamper_delete(&self, name: &str) {
		let mut state = self.state();
		if let Some(link) = state.host.remove(name) {
			if let Kind::Veth { peer } = link.kind {
				state.remove_index(peer);
			}
		}
	}

	pub fn host_links(&self) -> Vec<String> {
		self.state().host.keys().cloned().collect()
	}

	pub fn sandbox_link(&self, netns: &Path, name: &str) -> Option<FakeLink> {
		self.state().namespaces.get(netns)?.get(name).cloned()
	}

	pub fn sandbox_links(&self, netns: &Path) -> Vec<String> {
		self.state()
			.namespaces
			.get(netns)
			.map(|links| links.keys().cloned().collect())
			.unwrap_or_default()
	}

	pub fn host_link(&self, name: &str) -> Option<FakeLink> {
		self.state().host.get(name).cloned()
	}

	pub fn masquerades(&self) -> Vec<(IpAddr, IpNetwork, String)> {
		self.state().masquerades.iter().cloned().collect()
	}

	/// Number of mutating operations performed so far.
	pub fn mutations(&self) -> usize {
		self.state().mutations
	}
}

impl HostNetwork for FakeNetwork {
	async fn link(&self, name: &str) -> Result<Option<Link>, NetError> {
		let state = self.step("link", false)?;
		Ok(state.host.get(name).map(FakeLink::to_link))
	}

	async fn ensure_bridge(
		&self,
		name: &str,
		gateway: IpNetwork,
		_mtu: Option<u32>,
	) -> Result<Link, NetError> {
		let mut state = self.step("ensure_bridge", true)?;
		if !state.host.contains_key(name) {
			let bridge = state.new_link(Kind::Bridge);
			state.host.insert(name.into(), bridge);
		}

		// UNWRAP: inserted above
		let bridge = state.host.get_mut(name).unwrap();
		if bridge.kind != Kind::Bridge {
			return Err(NetError::Io(io::Error::new(
				io::ErrorKind::AlreadyExists,
				format!("{} is not a bridge", name),
			)));
		}
		if !bridge.addresses.contains(&gateway) {
			bridge.addresses.push(gateway);
		}
		bridge.up = true;
		Ok(bridge.to_link())
	}

	async fn create_veth(
		&self,
		host: &str,
		peer: &str,
		_mtu: Option<u32>,
	) -> Result<Link, NetError> {
		let mut state = self.step("create_veth", true)?;
		if state.host.contains_key(host) || state.host.contains_key(peer) {
			return Err(NetError::Io(io::Error::new(
				io::ErrorKind::AlreadyExists,
				"link exists",
			)));
		}

		let mut host_link = state.new_link(Kind::Veth { peer: 0 });
		let peer_link = state.new_link(Kind::Veth {
			peer: host_link.index,
		});
		host_link.kind = Kind::Veth {
			peer: peer_link.index,
		};

		let link = host_link.to_link();
		state.host.insert(host.into(), host_link);
		state.host.insert(peer.into(), peer_link);
		Ok(link)
	}

	async fn move_to_netns(&self, name: &str, netns: &Path) -> Result<(), NetError> {
		let mut state = self.step("move_to_netns", true)?;
		state.namespace(netns)?;
		let link = state
			.host
			.remove(name)
			.ok_or_else(|| NetError::NoSuchLink(name.into()))?;
		state.namespace(netns)?.insert(name.into(), link);
		Ok(())
	}

	async fn configure_sandbox(
		&self,
		netns: &Path,
		config: &SandboxConfig,
	) -> Result<MacAddr, NetError> {
		let mut state = self.step("configure_sandbox", true)?;
		let links = state.namespace(netns)?;
		let mut link = match links.remove(&config.peer) {
			Some(link) => link,
			None => links
				.remove(&config.ifname)
				.ok_or_else(|| NetError::NoSuchLink(config.peer.clone()))?,
		};

		if !link.addresses.contains(&config.address) {
			link.addresses.push(config.address);
		}
		link.up = true;

		let default = if config.gateway.is_ipv4() {
			"0.0.0.0/0"
		} else {
			"::/0"
		};
		// UNWRAP: constant
		link.routes.push((default.parse().unwrap(), config.gateway));
		for route in &config.routes {
			link.routes
				.push((route.dst, route.gw.unwrap_or(config.gateway)));
		}

		let mac = link.mac();
		links.insert(config.ifname.clone(), link);
		Ok(mac)
	}

	async fn enslave(&self, link: &str, bridge: &str) -> Result<(), NetError> {
		let mut state = self.step("enslave", true)?;
		let bridge = state.host_link(bridge)?.index;
		state.host_link(link)?;
		// UNWRAP: checked above
		let link = state.host.get_mut(link).unwrap();
		link.master = Some(bridge);
		link.up = true;
		Ok(())
	}

	async fn delete_link(&self, name: &str) -> Result<bool, NetError> {
		let mut state = self.step("delete_link", true)?;
		match state.host.remove(name) {
			Some(link) => {
				if let Kind::Veth { peer } = link.kind {
					state.remove_index(peer);
				}
				Ok(true)
			}
			None => Ok(false),
		}
	}

	async fn sandbox_addresses(
		&self,
		netns: &Path,
		ifname: &str,
	) -> Result<Option<Vec<IpNetwork>>, NetError> {
		let mut state = self.step("sandbox_addresses", false)?;
		Ok(state
			.namespace(netns)?
			.get(ifname)
			.map(|l| l.addresses.clone()))
	}

	async fn add_masquerade(
		&self,
		address: IpAddr,
		subnet: IpNetwork,
		comment: &str,
	) -> Result<(), NetError> {
		let mut state = self.step("add_masquerade", true)?;
		state.masquerades.insert((address, subnet, comment.into()));
		Ok(())
	}

	async fn del_masquerade(
		&self,
		address: IpAddr,
		subnet: IpNetwork,
		comment: &str,
	) -> Result<bool, NetError> {
		let mut state = self.step("del_masquerade", true)?;
		Ok(state.masquerades.remove(&(address, subnet, comment.into())))
	}
}
