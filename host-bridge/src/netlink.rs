//! Kernel interface plumbing: links, addresses, routes, namespaces.
//!
//! Everything the attachment saga does to the host goes through
//! [`HostNetwork`]. The real implementation talks rtnetlink; tests use an
//! in-memory fake.

use std::{
	convert::TryFrom,
	fs::File,
	future::Future,
	io,
	net::{IpAddr, Ipv4Addr, Ipv6Addr},
	os::unix::io::AsRawFd,
	path::{Path, PathBuf},
	thread,
};

use async_std::task::{block_on, spawn};
use cni_plugin::{config::Route, macaddr::MacAddr};
use futures::{
	channel::oneshot,
	future::{select, Either},
	pin_mut, TryStreamExt,
};
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use netlink_packet_route::{
	address::nlas::Nla as AddressNla, link::nlas::Nla as LinkNla, LinkMessage,
};
use netlink_sys::SmolSocket;
use nix::{
	errno::Errno,
	sched::{setns, CloneFlags},
};
use rtnetlink::{new_connection_with_socket, Handle};
use thiserror::Error;

use crate::masquerade;

#[derive(Debug, Error)]
pub enum NetError {
	#[error("netlink: {0}")]
	Netlink(#[from] rtnetlink::Error),

	#[error("no link named {0}")]
	NoSuchLink(String),

	#[error("network namespace {}: {err}", .path.display())]
	Namespace {
		path: PathBuf,
		#[source]
		err: io::Error,
	},

	#[error("{program}: {reason}")]
	Command { program: String, reason: String },

	#[error("route to {dst} via {gw} mixes address families")]
	MixedFamilies { dst: IpNetwork, gw: IpAddr },

	#[error(transparent)]
	Io(#[from] io::Error),
}

/// A link as seen from the host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Link {
	pub index: u32,
	pub mac: MacAddr,
	/// Index of the bridge the link is enslaved to.
	pub master: Option<u32>,
}

/// How to set up the sandbox end of a veth pair once it's in the namespace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SandboxConfig {
	/// Name the peer had on the host.
	pub peer: String,
	/// Name to give it inside the namespace.
	pub ifname: String,
	pub address: IpNetwork,
	pub gateway: IpAddr,
	/// Extra routes; those without a next hop go via the gateway.
	pub routes: Vec<Route>,
}

/// Operations on the host network stack.
///
/// Every operation is idempotent where that can be made to make sense:
/// deletes report whether there was anything to delete, ensures leave
/// existing objects in place.
#[allow(async_fn_in_trait)]
pub trait HostNetwork {
	/// Look up a link in the host namespace.
	async fn link(&self, name: &str) -> Result<Option<Link>, NetError>;

	/// Create the bridge if needed, give it the gateway address, bring it up.
	async fn ensure_bridge(
		&self,
		name: &str,
		gateway: IpNetwork,
		mtu: Option<u32>,
	) -> Result<Link, NetError>;

	/// Create a veth pair on the host. Returns the host end.
	async fn create_veth(&self, host: &str, peer: &str, mtu: Option<u32>)
		-> Result<Link, NetError>;

	/// Move a host link into a namespace.
	async fn move_to_netns(&self, name: &str, netns: &Path) -> Result<(), NetError>;

	/// Rename, address, and route the sandbox end. Returns its MAC.
	async fn configure_sandbox(
		&self,
		netns: &Path,
		config: &SandboxConfig,
	) -> Result<MacAddr, NetError>;

	/// Enslave a link to a bridge and bring it up.
	async fn enslave(&self, link: &str, bridge: &str) -> Result<(), NetError>;

	/// Delete a host link; also takes its veth peer wherever it is.
	async fn delete_link(&self, name: &str) -> Result<bool, NetError>;

	/// Addresses of an interface inside a namespace; `None` if there's no
	/// such interface.
	async fn sandbox_addresses(
		&self,
		netns: &Path,
		ifname: &str,
	) -> Result<Option<Vec<IpNetwork>>, NetError>;

	/// Masquerade traffic from `address` leaving `subnet`.
	async fn add_masquerade(
		&self,
		address: IpAddr,
		subnet: IpNetwork,
		comment: &str,
	) -> Result<(), NetError>;

	/// Remove the rule [`add_masquerade`](HostNetwork::add_masquerade) added.
	async fn del_masquerade(
		&self,
		address: IpAddr,
		subnet: IpNetwork,
		comment: &str,
	) -> Result<bool, NetError>;
}

/// [`HostNetwork`] over rtnetlink and iptables.
#[derive(Clone, Debug)]
pub struct Rtnetlink {
	handle: Handle,
}

impl Rtnetlink {
	/// Open a netlink connection in the current namespace.
	pub fn connect() -> Result<Self, NetError> {
		debug!("initialising netlink");
		let (conn, handle, _) = new_connection_with_socket::<SmolSocket>()?;
		spawn(conn);
		Ok(Self { handle })
	}
}

impl HostNetwork for Rtnetlink {
	async fn link(&self, name: &str) -> Result<Option<Link>, NetError> {
		Ok(find(&self.handle, name).await?.as_ref().map(to_link))
	}

	async fn ensure_bridge(
		&self,
		name: &str,
		gateway: IpNetwork,
		mtu: Option<u32>,
	) -> Result<Link, NetError> {
		let handle = &self.handle;
		let bridge = match find(handle, name).await? {
			Some(msg) => to_link(&msg),
			None => {
				info!("creating bridge {}", name);
				match handle.link().add().bridge(name.into()).execute().await {
					Ok(()) => {}
					Err(err) if is_errno(&err, Errno::EEXIST) => {
						debug!("bridge {} appeared concurrently", name);
					}
					Err(err) => return Err(err.into()),
				}

				find(handle, name)
					.await?
					.as_ref()
					.map(to_link)
					.ok_or_else(|| NetError::NoSuchLink(name.into()))?
			}
		};

		if let Some(mtu) = mtu {
			handle.link().set(bridge.index).mtu(mtu).execute().await?;
		}

		add_address(handle, bridge.index, gateway).await?;
		handle.link().set(bridge.index).up().execute().await?;
		Ok(bridge)
	}

	async fn create_veth(
		&self,
		host: &str,
		peer: &str,
		mtu: Option<u32>,
	) -> Result<Link, NetError> {
		let handle = &self.handle;
		debug!("creating veth pair {} <-> {}", host, peer);
		handle
			.link()
			.add()
			.veth(host.into(), peer.into())
			.execute()
			.await?;

		let host_link = require(handle, host).await?;
		if let Some(mtu) = mtu {
			let peer_link = require(handle, peer).await?;
			handle.link().set(host_link.index).mtu(mtu).execute().await?;
			handle.link().set(peer_link.index).mtu(mtu).execute().await?;
		}

		Ok(host_link)
	}

	async fn move_to_netns(&self, name: &str, netns: &Path) -> Result<(), NetError> {
		let link = require(&self.handle, name).await?;
		let ns = File::open(netns).map_err(|err| NetError::Namespace {
			path: netns.to_owned(),
			err,
		})?;

		self.handle
			.link()
			.set(link.index)
			.setns_by_fd(ns.as_raw_fd())
			.execute()
			.await?;
		debug!("moved {} into {}", name, netns.display());
		Ok(())
	}

	async fn configure_sandbox(
		&self,
		netns: &Path,
		config: &SandboxConfig,
	) -> Result<MacAddr, NetError> {
		let config = config.clone();
		in_netns(netns, move |handle| async move {
			let link = match find(&handle, &config.peer).await? {
				Some(msg) => {
					let link = to_link(&msg);
					handle
						.link()
						.set(link.index)
						.name(config.ifname.clone())
						.execute()
						.await?;
					link
				}
				// renamed by an earlier attempt
				None => require(&handle, &config.ifname).await?,
			};

			add_address(&handle, link.index, config.address).await?;
			handle.link().set(link.index).up().execute().await?;

			match find(&handle, "lo").await? {
				Some(lo) => {
					if let Err(err) = handle.link().set(lo.header.index).up().execute().await {
						warn!("could not bring loopback up: {}", err);
					}
				}
				None => warn!("no loopback in sandbox"),
			}

			let default = match config.gateway {
				IpAddr::V4(_) => IpNetwork::new(Ipv4Addr::UNSPECIFIED.into(), 0),
				IpAddr::V6(_) => IpNetwork::new(Ipv6Addr::UNSPECIFIED.into(), 0),
			}
			// UNWRAP: zero prefix is always valid
			.unwrap();
			add_route(&handle, default, config.gateway).await?;

			for route in &config.routes {
				add_route(&handle, route.dst, route.gw.unwrap_or(config.gateway)).await?;
			}

			Ok(link.mac)
		})
		.await
	}

	async fn enslave(&self, link: &str, bridge: &str) -> Result<(), NetError> {
		let handle = &self.handle;
		let link = require(handle, link).await?;
		let bridge = require(handle, bridge).await?;
		handle
			.link()
			.set(link.index)
			.master(bridge.index)
			.execute()
			.await?;
		handle.link().set(link.index).up().execute().await?;
		Ok(())
	}

	async fn delete_link(&self, name: &str) -> Result<bool, NetError> {
		let link = match find(&self.handle, name).await? {
			Some(msg) => to_link(&msg),
			None => return Ok(false),
		};

		match self.handle.link().del(link.index).execute().await {
			Ok(()) => {
				debug!("deleted link {}", name);
				Ok(true)
			}
			Err(err) if is_errno(&err, Errno::ENODEV) => Ok(false),
			Err(err) => Err(err.into()),
		}
	}

	async fn sandbox_addresses(
		&self,
		netns: &Path,
		ifname: &str,
	) -> Result<Option<Vec<IpNetwork>>, NetError> {
		let ifname = ifname.to_owned();
		in_netns(netns, move |handle| async move {
			let link = match find(&handle, &ifname).await? {
				Some(msg) => to_link(&msg),
				None => return Ok(None),
			};

			let mut addresses = Vec::new();
			let mut messages = handle
				.address()
				.get()
				.set_link_index_filter(link.index)
				.execute();
			while let Some(msg) = messages.try_next().await? {
				for nla in &msg.nlas {
					if let AddressNla::Address(bytes) = nla {
						if let Some(net) = ip_from_bytes(bytes)
							.and_then(|ip| IpNetwork::new(ip, msg.header.prefix_len).ok())
						{
							addresses.push(net);
						}
					}
				}
			}

			Ok(Some(addresses))
		})
		.await
	}

	async fn add_masquerade(
		&self,
		address: IpAddr,
		subnet: IpNetwork,
		comment: &str,
	) -> Result<(), NetError> {
		masquerade::enable_forwarding(address).await?;
		masquerade::add(address, subnet, comment).await
	}

	async fn del_masquerade(
		&self,
		address: IpAddr,
		subnet: IpNetwork,
		comment: &str,
	) -> Result<bool, NetError> {
		masquerade::remove(address, subnet, comment).await
	}
}

/// Run `op` with a netlink handle bound inside `netns`.
///
/// Namespace membership is per thread, so this enters the namespace on a
/// dedicated thread that exits afterwards; the calling thread never moves.
async fn in_netns<T, F, Fut>(netns: &Path, op: F) -> Result<T, NetError>
where
	T: Send + 'static,
	F: FnOnce(Handle) -> Fut + Send + 'static,
	Fut: Future<Output = Result<T, NetError>>,
{
	let path = netns.to_owned();
	let (tx, rx) = oneshot::channel();

	thread::Builder::new()
		.name("netns".into())
		.spawn(move || {
			let res = enter(&path).and_then(|()| {
				block_on(async {
					let (conn, handle, _) = new_connection_with_socket::<SmolSocket>()?;
					driving(conn, op(handle)).await
				})
			});
			// receiver only goes away if the caller was dropped
			let _ = tx.send(res);
		})?;

	rx.await.map_err(|_| NetError::Namespace {
		path: netns.to_owned(),
		err: io::Error::new(io::ErrorKind::Other, "namespace worker thread died"),
	})?
}

/// Await `op` while polling `conn` alongside it; `conn` is dropped once `op`
/// is done.
async fn driving<C, F, T>(conn: C, op: F) -> T
where
	C: Future<Output = ()>,
	F: Future<Output = T>,
{
	pin_mut!(conn);
	pin_mut!(op);
	match select(op, conn).await {
		Either::Left((res, _)) => res,
		Either::Right(((), op)) => {
			debug!("namespace netlink connection closed early");
			op.await
		}
	}
}

fn enter(netns: &Path) -> Result<(), NetError> {
	let namespace_err = |err| NetError::Namespace {
		path: netns.to_owned(),
		err,
	};

	let ns = File::open(netns).map_err(namespace_err)?;
	setns(ns.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|errno| namespace_err(errno.into()))
}

async fn find(handle: &Handle, name: &str) -> Result<Option<LinkMessage>, NetError> {
	let mut links = handle.link().get().match_name(name.to_string()).execute();
	match links.try_next().await {
		Ok(msg) => Ok(msg),
		Err(err) if is_errno(&err, Errno::ENODEV) => Ok(None),
		Err(err) => Err(err.into()),
	}
}

async fn require(handle: &Handle, name: &str) -> Result<Link, NetError> {
	find(handle, name)
		.await?
		.as_ref()
		.map(to_link)
		.ok_or_else(|| NetError::NoSuchLink(name.into()))
}

fn to_link(msg: &LinkMessage) -> Link {
	let mut link = Link {
		index: msg.header.index,
		mac: MacAddr::default(),
		master: None,
	};

	for nla in &msg.nlas {
		match nla {
			LinkNla::Address(bytes) => {
				if let Ok(mac) = MacAddr::try_from(bytes.as_slice()) {
					link.mac = mac;
				}
			}
			LinkNla::Master(index) => link.master = Some(*index),
			_ => {}
		}
	}

	link
}

async fn add_address(handle: &Handle, index: u32, address: IpNetwork) -> Result<(), NetError> {
	match handle
		.address()
		.add(index, address.ip(), address.prefix())
		.execute()
		.await
	{
		Ok(()) => Ok(()),
		Err(err) if is_errno(&err, Errno::EEXIST) => {
			debug!("address {} already on link {}", address, index);
			Ok(())
		}
		Err(err) => Err(err.into()),
	}
}

async fn add_route(handle: &Handle, dst: IpNetwork, gw: IpAddr) -> Result<(), NetError> {
	let res = match (dst, gw) {
		(IpNetwork::V4(net), IpAddr::V4(gw)) => {
			handle
				.route()
				.add()
				.v4()
				.destination_prefix(net.network(), net.prefix())
				.gateway(gw)
				.execute()
				.await
		}
		(IpNetwork::V6(net), IpAddr::V6(gw)) => {
			handle
				.route()
				.add()
				.v6()
				.destination_prefix(net.network(), net.prefix())
				.gateway(gw)
				.execute()
				.await
		}
		_ => return Err(NetError::MixedFamilies { dst, gw }),
	};

	match res {
		Ok(()) => Ok(()),
		Err(err) if is_errno(&err, Errno::EEXIST) => {
			debug!("route to {} already present", dst);
			Ok(())
		}
		Err(err) => Err(err.into()),
	}
}

fn is_errno(err: &rtnetlink::Error, errno: Errno) -> bool {
	matches!(err, rtnetlink::Error::NetlinkError(msg) if msg.raw_code() == -(errno as i32))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
	match bytes.len() {
		4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
		16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
		_ => None,
	}
}
