//! Command handling: ADD, DEL, CHECK, GC, STATUS.
//!
//! Every command for one owner runs under that owner's lock, so commands for
//! the same attachment never interleave. Everything is re-derived from the
//! ledger on each invocation.

use std::{
	collections::HashSet,
	net::{IpAddr, Ipv4Addr, Ipv6Addr},
	path::Path,
};

use cni_plugin::{
	config::{NetworkConfig, Route},
	error::{CniError, InterfaceNameError},
	reply::{InterfaceReply, IpReply, SuccessReply},
	valid_ifname,
};
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::{
	allocator::Allocator,
	attach::AttachmentManager,
	error::{AppError, AppResult},
	guard::{Guard, Scope},
	ledger::{AttachmentRecord, Ledger},
	netlink::{HostNetwork, NetError},
	owner::OwnerId,
	settings::Settings,
};

const VALID_ATTACHMENTS: &str = "cni.dev/valid-attachments";

#[derive(Clone, Debug, Deserialize)]
struct ValidAttachment {
	#[serde(rename = "containerID")]
	container_id: String,
	ifname: String,
}

/// Owners a GC must keep, from `cni.dev/valid-attachments`.
pub fn valid_attachments(config: &NetworkConfig) -> AppResult<Vec<OwnerId>> {
	Ok(config
		.field::<Vec<ValidAttachment>>(VALID_ATTACHMENTS)?
		.unwrap_or_default()
		.into_iter()
		.map(|a| OwnerId::new(a.container_id, a.ifname))
		.collect())
}

pub struct Plugin<N> {
	settings: Settings,
	ledger: Ledger,
	guard: Guard,
	net: N,
}

impl<N: HostNetwork> Plugin<N> {
	pub fn new(settings: Settings, net: N) -> AppResult<Self> {
		let ledger = Ledger::open(settings.data_dir(), &settings.network)?;
		let guard = Guard::new(settings.data_dir(), &settings.network, settings.lock_timeout);
		debug!("ledger at {}", ledger.dir().display());
		Ok(Self {
			settings,
			ledger,
			guard,
			net,
		})
	}

	fn allocator(&self) -> Allocator<'_> {
		Allocator {
			pool: &self.settings.pool,
			ledger: &self.ledger,
			guard: &self.guard,
		}
	}

	fn manager(&self) -> AttachmentManager<'_, N> {
		AttachmentManager {
			net: &self.net,
			ledger: &self.ledger,
			guard: &self.guard,
			settings: &self.settings,
		}
	}

	pub async fn add(&self, container_id: &str, ifname: &str, netns: &Path) -> AppResult<SuccessReply> {
		check_ifname(ifname)?;
		let owner = OwnerId::new(container_id, ifname);
		self.guard
			.with_lock(Scope::Owner(&owner), self.establish(&owner, netns))
			.await
	}

	async fn establish(&self, owner: &OwnerId, netns: &Path) -> AppResult<SuccessReply> {
		if let Some(record) = self.ledger.attachment(owner)? {
			if self.is_current(owner, &record, netns).await? {
				info!("{} already attached, replaying result", owner);
				return Ok(self.reply(&record));
			}

			warn!("{} has a stale attachment, rebuilding it", owner);
			self.manager().detach(owner).await?;
		}

		let allocator = self.allocator();
		let fresh = self.ledger.lookup(owner)?.is_none();
		let address = allocator.allocate(owner).await?;

		match self.manager().attach(owner, netns, address).await {
			Ok(record) => Ok(self.reply(&record)),
			Err(err) => {
				if fresh {
					match allocator.release(owner).await {
						Ok(_) => debug!("released {} after failed attach", address),
						Err(rel) => warn!("could not release {} from {}: {}", address, owner, rel),
					}
				}
				Err(err)
			}
		}
	}

	/// Whether a recorded attachment is the one being asked for and is still
	/// in place.
	async fn is_current(&self, owner: &OwnerId, record: &AttachmentRecord, netns: &Path) -> AppResult<bool> {
		let matches = record.netns == netns
			&& record.bridge == self.settings.bridge
			&& record.subnet == self.settings.pool.subnet()
			&& self.settings.pool.is_allocatable(record.address.ip());
		if !matches {
			debug!("{}: recorded parameters differ", owner);
			return Ok(false);
		}

		let held = self.ledger.lookup(owner)?;
		if held != Some(record.address.ip()) {
			debug!("{}: ledger holds {:?}", owner, held);
			return Ok(false);
		}

		let host = self
			.net
			.link(&record.host_ifname)
			.await
			.map_err(|err| AppError::Attach {
				owner: owner.to_string(),
				step: "look up host link",
				err,
			})?;
		Ok(host.is_some())
	}

	fn reply(&self, record: &AttachmentRecord) -> SuccessReply {
		let default = match record.gateway {
			IpAddr::V4(_) => IpNetwork::new(Ipv4Addr::UNSPECIFIED.into(), 0),
			IpAddr::V6(_) => IpNetwork::new(Ipv6Addr::UNSPECIFIED.into(), 0),
		}
		// UNWRAP: zero prefix is always valid
		.unwrap();

		let mut routes = vec![Route {
			dst: default,
			gw: Some(record.gateway),
		}];
		routes.extend(self.settings.routes.iter().cloned());

		SuccessReply {
			cni_version: self.settings.cni_version.clone(),
			interfaces: vec![
				InterfaceReply {
					name: record.bridge.clone(),
					mac: record.bridge_mac,
					sandbox: None,
				},
				InterfaceReply {
					name: record.host_ifname.clone(),
					mac: record.host_mac,
					sandbox: None,
				},
				InterfaceReply {
					name: record.sandbox_ifname.clone(),
					mac: record.sandbox_mac,
					sandbox: Some(record.netns.clone()),
				},
			],
			ips: vec![IpReply {
				address: record.address,
				gateway: Some(record.gateway),
				interface: Some(2),
			}],
			routes,
			dns: self.settings.dns.clone().map(Into::into).unwrap_or_default(),
			specific: Default::default(),
		}
	}

	/// Tear down and release. The namespace is irrelevant: everything is found
	/// from the owner.
	pub async fn del(&self, container_id: &str, ifname: &str, netns: Option<&Path>) -> AppResult<()> {
		let owner = OwnerId::new(container_id, ifname);
		debug!("del {} netns={:?}", owner, netns);
		self.guard
			.with_lock(Scope::Owner(&owner), self.remove(&owner))
			.await
	}

	async fn remove(&self, owner: &OwnerId) -> AppResult<()> {
		self.manager().detach(owner).await?;
		match self.allocator().release(owner).await? {
			Some(address) => info!("released {} from {}", address, owner),
			None => debug!("{} held no address", owner),
		}
		Ok(())
	}

	/// Compare the kernel against the ledger, changing nothing.
	pub async fn check(&self, container_id: &str, ifname: &str, netns: &Path) -> AppResult<()> {
		let owner = OwnerId::new(container_id, ifname);
		self.guard
			.with_lock(Scope::Owner(&owner), self.verify(&owner, netns))
			.await
	}

	async fn verify(&self, owner: &OwnerId, netns: &Path) -> AppResult<()> {
		let record = self
			.ledger
			.attachment(owner)?
			.ok_or_else(|| AppError::mismatch(owner, "no attachment recorded"))?;

		if record.netns != netns {
			return Err(AppError::mismatch(
				owner,
				format!("attached in {}, not {}", record.netns.display(), netns.display()),
			));
		}

		let held = self.ledger.lookup(owner)?;
		if held != Some(record.address.ip()) {
			return Err(AppError::mismatch(
				owner,
				format!("ledger holds {:?}, attachment has {}", held, record.address),
			));
		}

		let inspect = |what: &'static str| {
			move |err: NetError| AppError::mismatch(owner, format!("cannot inspect {}: {}", what, err))
		};

		let bridge = self
			.net
			.link(&record.bridge)
			.await
			.map_err(inspect("bridge"))?
			.ok_or_else(|| AppError::mismatch(owner, format!("bridge {} is gone", record.bridge)))?;

		let host = self
			.net
			.link(&record.host_ifname)
			.await
			.map_err(inspect("host link"))?
			.ok_or_else(|| AppError::mismatch(owner, format!("host link {} is gone", record.host_ifname)))?;
		if host.master != Some(bridge.index) {
			return Err(AppError::mismatch(
				owner,
				format!("{} is not enslaved to {}", record.host_ifname, record.bridge),
			));
		}

		let addresses = self
			.net
			.sandbox_addresses(netns, &record.sandbox_ifname)
			.await
			.map_err(inspect("sandbox"))?
			.ok_or_else(|| {
				AppError::mismatch(owner, format!("{} is gone from the sandbox", record.sandbox_ifname))
			})?;
		if !addresses.contains(&record.address) {
			return Err(AppError::mismatch(
				owner,
				format!("{} lacks {}, has {:?}", record.sandbox_ifname, record.address, addresses),
			));
		}

		debug!("{} checks out", owner);
		Ok(())
	}

	/// Detach and release every owner not in `valid`.
	pub async fn gc(&self, valid: &[OwnerId]) -> AppResult<()> {
		let valid: HashSet<String> = valid.iter().map(ToString::to_string).collect();

		let mut stale = Vec::new();
		for record in self.ledger.list_allocated()? {
			let record = record?;
			if valid.contains(&record.owner) {
				continue;
			}

			match OwnerId::parse(&record.owner) {
				Some(owner) => stale.push(owner),
				None => warn!(
					"ledger entry for {} has unparseable owner {:?}, leaving it",
					record.address, record.owner
				),
			}
		}

		info!("gc: {} stale of {} kept", stale.len(), valid.len());
		let mut first_err = None;
		for owner in stale {
			let res = self
				.guard
				.with_lock(Scope::Owner(&owner), self.remove(&owner))
				.await;
			if let Err(err) = res {
				warn!("gc of {} failed: {}", owner, err);
				first_err.get_or_insert(err);
			}
		}

		match first_err {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	/// Ready if there's room for at least one more attachment.
	pub async fn status(&self) -> AppResult<()> {
		let free = self.allocator().free()?;
		debug!("{} addresses free", free);
		if free == 0 {
			return Err(AppError::Unavailable {
				subnet: self.settings.pool.subnet(),
				reason: "no free addresses".into(),
			});
		}

		Ok(())
	}
}

fn check_ifname(ifname: &str) -> Result<(), CniError> {
	if valid_ifname(ifname) {
		Ok(())
	} else {
		Err(CniError::InvalidEnv {
			var: "CNI_IFNAME",
			err: Box::new(InterfaceNameError),
		})
	}
}

#[cfg(test)]
mod tests {
	use std::{
		collections::BTreeSet,
		path::PathBuf,
		sync::{Arc, Barrier},
		thread,
	};

	use async_std::task::block_on;
	use semver::Version;

	use super::*;
	use crate::fake::FakeNetwork;

	fn config(dir: &Path, subnet: &str, masq: bool) -> NetworkConfig {
		serde_json::from_value(serde_json::json!({
			"cniVersion": "1.0.0",
			"name": "pods",
			"type": "host-bridge",
			"ipMasq": masq,
			"lockTimeout": 10,
			"ipam": {
				"type": "host-local",
				"subnet": subnet,
				"dataDir": dir,
			},
			"dns": {"nameservers": ["10.96.0.10"]},
		}))
		.unwrap()
	}

	fn plugin(dir: &Path, subnet: &str, net: &FakeNetwork) -> Plugin<FakeNetwork> {
		let settings = Settings::from_config(&config(dir, subnet, false)).unwrap();
		Plugin::new(settings, net.clone()).unwrap()
	}

	fn netns(net: &FakeNetwork, name: &str) -> PathBuf {
		let path = PathBuf::from(format!("/run/netns/{}", name));
		net.add_netns(&path);
		path
	}

	fn address(reply: &SuccessReply) -> String {
		reply.ips[0].address.to_string()
	}

	fn code(err: AppError) -> i32 {
		err.into_reply(Version::new(1, 0, 0)).code
	}

	#[test]
	fn end_to_end_lowest_free_reuse() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let p = plugin(tmp.path(), "10.244.1.0/24", &net);
		let (a, b, c) = (netns(&net, "podA"), netns(&net, "podB"), netns(&net, "podC"));

		block_on(async {
			let ra = p.add("podA", "eth0", &a).await.unwrap();
			assert_eq!(address(&ra), "10.244.1.2/24");
			assert_eq!(ra.ips[0].gateway, Some("10.244.1.1".parse().unwrap()));
			assert_eq!(ra.ips[0].interface, Some(2));
			assert_eq!(ra.routes[0].dst.to_string(), "0.0.0.0/0");
			assert_eq!(ra.routes[0].gw, Some("10.244.1.1".parse().unwrap()));
			assert_eq!(ra.interfaces.len(), 3);
			assert_eq!(ra.interfaces[2].name, "eth0");
			assert_eq!(ra.interfaces[2].sandbox.as_deref(), Some(a.as_path()));
			assert_eq!(ra.dns.nameservers.len(), 1);

			let rb = p.add("podB", "eth0", &b).await.unwrap();
			assert_eq!(address(&rb), "10.244.1.3/24");

			p.del("podA", "eth0", Some(&a)).await.unwrap();
			let rc = p.add("podC", "eth0", &c).await.unwrap();
			assert_eq!(address(&rc), "10.244.1.2/24");
		});
	}

	#[test]
	fn add_twice_is_the_same_attachment() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let p = plugin(tmp.path(), "10.244.1.0/24", &net);
		let a = netns(&net, "podA");

		block_on(async {
			let first = p.add("podA", "eth0", &a).await.unwrap();
			let mutations = net.mutations();
			let links = net.host_links();

			let second = p.add("podA", "eth0", &a).await.unwrap();
			assert_eq!(
				serde_json::to_value(&first).unwrap(),
				serde_json::to_value(&second).unwrap()
			);
			assert_eq!(net.mutations(), mutations);
			assert_eq!(net.host_links(), links);
		});
	}

	#[test]
	fn add_into_another_namespace_moves_and_keeps_the_address() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let p = plugin(tmp.path(), "10.244.1.0/24", &net);
		let (old, new) = (netns(&net, "old"), netns(&net, "new"));

		block_on(async {
			let first = p.add("podA", "eth0", &old).await.unwrap();
			let second = p.add("podA", "eth0", &new).await.unwrap();
			assert_eq!(address(&first), address(&second));
		});

		assert!(net.sandbox_links(&old).is_empty());
		assert_eq!(net.sandbox_links(&new), vec!["eth0".to_string()]);
	}

	#[test]
	fn add_rebuilds_a_half_gone_attachment() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let p = plugin(tmp.path(), "10.244.1.0/24", &net);
		let a = netns(&net, "podA");
		let owner = OwnerId::new("podA", "eth0");

		block_on(async {
			p.add("podA", "eth0", &a).await.unwrap();
			net.tamper_delete(&owner.host_ifname());
			let again = p.add("podA", "eth0", &a).await.unwrap();
			assert_eq!(address(&again), "10.244.1.2/24");
		});
		assert!(net.host_link(&owner.host_ifname()).is_some());
	}

	#[test]
	fn del_twice_and_del_of_strangers() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let p = plugin(tmp.path(), "10.244.1.0/24", &net);
		let a = netns(&net, "podA");

		block_on(async {
			p.add("podA", "eth0", &a).await.unwrap();
			p.del("podA", "eth0", Some(&a)).await.unwrap();
			p.del("podA", "eth0", Some(&a)).await.unwrap();
			p.del("never-seen", "eth0", None).await.unwrap();
		});

		let owner = OwnerId::new("podA", "eth0");
		assert_eq!(p.ledger.lookup(&owner).unwrap(), None);
		assert_eq!(p.ledger.attachment(&owner).unwrap(), None);
		assert_eq!(net.host_links(), vec!["cni0".to_string()]);
	}

	#[test]
	fn del_after_the_namespace_went_away() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let p = plugin(tmp.path(), "10.244.1.0/24", &net);
		let a = netns(&net, "podA");

		block_on(async {
			p.add("podA", "eth0", &a).await.unwrap();
			net.remove_netns(&a);
			p.del("podA", "eth0", None).await.unwrap();
		});
		assert_eq!(p.ledger.list_allocated().unwrap().count(), 0);
	}

	#[test]
	fn exhaustion_through_add() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		// one allocatable address
		let p = plugin(tmp.path(), "10.0.0.0/30", &net);
		let (a, b) = (netns(&net, "podA"), netns(&net, "podB"));

		block_on(async {
			p.status().await.unwrap();
			p.add("podA", "eth0", &a).await.unwrap();

			let err = p.add("podB", "eth0", &b).await.unwrap_err();
			assert_eq!(code(err), 110);
			assert_eq!(code(p.status().await.unwrap_err()), 50);
		});

		let podb = OwnerId::new("podB", "eth0");
		assert!(net.host_link(&podb.host_ifname()).is_none());
		assert!(net.sandbox_links(&b).is_empty());
	}

	#[test]
	fn failed_add_releases_its_address_and_leaves_no_links() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let p = plugin(tmp.path(), "10.244.1.0/24", &net);
		let a = netns(&net, "podA");
		let owner = OwnerId::new("podA", "eth0");

		net.fail_at("enslave");
		let err = block_on(p.add("podA", "eth0", &a)).unwrap_err();
		assert_eq!(code(err), 113);

		assert_eq!(p.ledger.lookup(&owner).unwrap(), None);
		assert_eq!(p.ledger.attachment(&owner).unwrap(), None);
		assert!(net.host_link(&owner.host_ifname()).is_none());
		assert!(net.host_link(&owner.peer_ifname()).is_none());
		assert!(net.sandbox_links(&a).is_empty());

		net.succeed();
		let reply = block_on(p.add("podA", "eth0", &a)).unwrap();
		assert_eq!(address(&reply), "10.244.1.2/24");
	}

	#[test]
	fn check_passes_then_spots_tampering() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let p = plugin(tmp.path(), "10.244.1.0/24", &net);
		let a = netns(&net, "podA");
		let owner = OwnerId::new("podA", "eth0");

		block_on(async {
			assert_eq!(code(p.check("podA", "eth0", &a).await.unwrap_err()), 115);

			p.add("podA", "eth0", &a).await.unwrap();
			p.check("podA", "eth0", &a).await.unwrap();

			let elsewhere = netns(&net, "elsewhere");
			assert_eq!(code(p.check("podA", "eth0", &elsewhere).await.unwrap_err()), 115);

			let mutations = net.mutations();
			net.tamper_delete(&owner.host_ifname());
			assert_eq!(code(p.check("podA", "eth0", &a).await.unwrap_err()), 115);
			assert_eq!(net.mutations(), mutations);
		});
	}

	#[test]
	fn gc_removes_everything_not_listed() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let p = plugin(tmp.path(), "10.244.1.0/24", &net);
		let (a, b) = (netns(&net, "podA"), netns(&net, "podB"));

		block_on(async {
			p.add("podA", "eth0", &a).await.unwrap();
			p.add("podB", "eth0", &b).await.unwrap();
			p.gc(&[OwnerId::new("podA", "eth0")]).await.unwrap();
		});

		let kept: Vec<String> = p
			.ledger
			.list_allocated()
			.unwrap()
			.map(|r| r.unwrap().owner)
			.collect();
		assert_eq!(kept, vec!["podA/eth0".to_string()]);
		assert!(net.sandbox_links(&b).is_empty());
		assert_eq!(net.sandbox_links(&a), vec!["eth0".to_string()]);
	}

	#[test]
	fn valid_attachments_from_config() {
		let config: NetworkConfig = serde_json::from_value(serde_json::json!({
			"cniVersion": "1.1.0",
			"name": "pods",
			"type": "host-bridge",
			"cni.dev/valid-attachments": [
				{"containerID": "podA", "ifname": "eth0"},
				{"containerID": "podB", "ifname": "net1"},
			],
		}))
		.unwrap();

		assert_eq!(
			valid_attachments(&config).unwrap(),
			vec![OwnerId::new("podA", "eth0"), OwnerId::new("podB", "net1")]
		);
	}

	#[test]
	fn masquerade_follows_the_attachment() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let settings = Settings::from_config(&config(tmp.path(), "10.244.1.0/24", true)).unwrap();
		let p = Plugin::new(settings, net.clone()).unwrap();
		let a = netns(&net, "podA");

		block_on(p.add("podA", "eth0", &a)).unwrap();
		assert_eq!(
			net.masquerades(),
			vec![(
				"10.244.1.2".parse().unwrap(),
				"10.244.1.0/24".parse().unwrap(),
				"podA/eth0".to_string()
			)]
		);

		block_on(p.del("podA", "eth0", Some(&a))).unwrap();
		assert!(net.masquerades().is_empty());
	}

	#[test]
	fn unusable_interface_name_is_refused_up_front() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let p = plugin(tmp.path(), "10.244.1.0/24", &net);
		let a = netns(&net, "podA");

		for bad in &["", "a/b", "much-too-long-name"] {
			let err = block_on(p.add("podA", bad, &a)).unwrap_err();
			assert_eq!(code(err), 4, "{:?}", bad);
		}

		assert_eq!(net.mutations(), 0);
		assert!(net.host_links().is_empty());
		assert_eq!(p.ledger.list_allocated().unwrap().count(), 0);
	}

	#[test]
	fn del_removes_masquerade_after_the_subnet_changed() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let a = netns(&net, "podA");

		let before = Settings::from_config(&config(tmp.path(), "10.244.1.0/24", true)).unwrap();
		block_on(Plugin::new(before, net.clone()).unwrap().add("podA", "eth0", &a)).unwrap();
		assert_eq!(net.masquerades().len(), 1);

		let after = Settings::from_config(&config(tmp.path(), "10.244.0.0/16", true)).unwrap();
		let p = Plugin::new(after, net.clone()).unwrap();
		block_on(p.del("podA", "eth0", Some(&a))).unwrap();

		assert!(net.masquerades().is_empty());
		assert_eq!(p.ledger.list_allocated().unwrap().count(), 0);
	}

	#[test]
	fn add_after_the_subnet_changed_moves_the_masquerade() {
		let tmp = tempfile::tempdir().unwrap();
		let net = FakeNetwork::new();
		let a = netns(&net, "podA");

		let before = Settings::from_config(&config(tmp.path(), "10.244.1.0/24", true)).unwrap();
		block_on(Plugin::new(before, net.clone()).unwrap().add("podA", "eth0", &a)).unwrap();

		let after = Settings::from_config(&config(tmp.path(), "10.244.0.0/16", true)).unwrap();
		let reply = block_on(Plugin::new(after, net.clone()).unwrap().add("podA", "eth0", &a)).unwrap();

		// still allocatable in the wider pool, so the address stays
		assert_eq!(address(&reply), "10.244.1.2/16");
		assert_eq!(
			net.masquerades(),
			vec![(
				"10.244.1.2".parse().unwrap(),
				"10.244.0.0/16".parse().unwrap(),
				"podA/eth0".to_string()
			)]
		);
	}

	fn concurrent_adds(workers: usize, subnet: &'static str) -> (Vec<String>, Vec<i32>) {
		let tmp = Arc::new(tempfile::tempdir().unwrap());
		let net = FakeNetwork::new();
		let barrier = Arc::new(Barrier::new(workers));

		let handles: Vec<_> = (0..workers)
			.map(|n| {
				let tmp = Arc::clone(&tmp);
				let net = net.clone();
				let barrier = Arc::clone(&barrier);
				thread::spawn(move || {
					let p = plugin(tmp.path(), subnet, &net);
					let ns = netns(&net, &format!("pod{}", n));
					barrier.wait();
					block_on(p.add(&format!("pod{}", n), "eth0", &ns))
						.map(|reply| address(&reply))
						.map_err(code)
				})
			})
			.collect();

		let mut addresses = Vec::new();
		let mut failures = Vec::new();
		for h in handles {
			match h.join().unwrap() {
				Ok(addr) => addresses.push(addr),
				Err(code) => failures.push(code),
			}
		}

		(addresses, failures)
	}

	#[test]
	fn concurrent_adds_never_share_an_address() {
		let (addresses, failures) = concurrent_adds(10, "10.244.1.0/24");
		assert!(failures.is_empty(), "{:?}", failures);
		let distinct: BTreeSet<_> = addresses.iter().collect();
		assert_eq!(distinct.len(), 10);
	}

	#[test]
	fn concurrent_adds_beyond_capacity() {
		// .2 through .6
		let (addresses, failures) = concurrent_adds(8, "10.0.0.0/29");
		let distinct: BTreeSet<_> = addresses.iter().collect();
		assert_eq!(distinct.len(), 5);
		assert_eq!(failures, vec![110, 110, 110]);
	}
}
