//! Building and tearing down one attachment's kernel objects.
//!
//! Attaching is a sequence of steps that each leave something behind in the
//! kernel. Every step that does pushes its compensation; if a later step
//! fails, compensations run in reverse and the error is returned. Nothing is
//! recorded in the ledger until every step has succeeded.

use std::{net::IpAddr, path::Path};

use ipnetwork::IpNetwork;

use log::{debug, info, warn};

use crate::{
	error::{AppError, AppResult},
	guard::{Guard, Scope},
	ledger::{AttachmentRecord, Ledger},
	netlink::{HostNetwork, NetError, SandboxConfig},
	owner::OwnerId,
	settings::Settings,
};

#[derive(Debug)]
enum Undo {
	DeleteLink(String),
	Unmasquerade(IpAddr, IpNetwork),
}

pub struct AttachmentManager<'a, N> {
	pub net: &'a N,
	pub ledger: &'a Ledger,
	pub guard: &'a Guard,
	pub settings: &'a Settings,
}

impl<N: HostNetwork> AttachmentManager<'_, N> {
	/// Attach `owner` inside `netns` with `address`, or leave nothing behind.
	pub async fn attach(
		&self,
		owner: &OwnerId,
		netns: &Path,
		address: IpAddr,
	) -> AppResult<AttachmentRecord> {
		let mut undo = Vec::new();
		match self.build(owner, netns, address, &mut undo).await {
			Ok(record) => {
				info!(
					"attached {} as {} in {} with {}",
					owner,
					record.sandbox_ifname,
					netns.display(),
					record.address
				);
				Ok(record)
			}
			Err(err) => {
				warn!("attaching {} failed, rolling back: {}", owner, err);
				self.rollback(owner, undo).await;
				Err(err)
			}
		}
	}

	async fn build(
		&self,
		owner: &OwnerId,
		netns: &Path,
		address: IpAddr,
		undo: &mut Vec<Undo>,
	) -> AppResult<AttachmentRecord> {
		let settings = self.settings;
		let pool = &settings.pool;
		let failed = |step: &'static str| {
			let owner = owner.to_string();
			move |err: NetError| AppError::Attach { owner, step, err }
		};

		let host = owner.host_ifname();
		let peer = owner.peer_ifname();

		for leftover in [&host, &peer].iter() {
			if self
				.net
				.delete_link(leftover)
				.await
				.map_err(failed("clear leftovers"))?
			{
				info!("removed leftover link {} of {}", leftover, owner);
			}
		}

		let host_link = self
			.net
			.create_veth(&host, &peer, settings.mtu)
			.await
			.map_err(failed("create veth"))?;
		undo.push(Undo::DeleteLink(host.clone()));

		self.net
			.move_to_netns(&peer, netns)
			.await
			.map_err(failed("move into namespace"))?;

		let sandbox = SandboxConfig {
			peer,
			ifname: owner.ifname().into(),
			address: pool.with_prefix(address),
			gateway: pool.gateway(),
			routes: settings.routes.clone(),
		};
		let sandbox_mac = self
			.net
			.configure_sandbox(netns, &sandbox)
			.await
			.map_err(failed("configure sandbox"))?;

		let bridge = self
			.guard
			.with_lock(Scope::Bridge(&settings.bridge), async {
				self.net
					.ensure_bridge(&settings.bridge, pool.gateway_network(), settings.mtu)
					.await
					.map_err(failed("ensure bridge"))
			})
			.await?;

		self.net
			.enslave(&host, &settings.bridge)
			.await
			.map_err(failed("enslave"))?;

		if settings.ip_masq {
			self.net
				.add_masquerade(address, pool.subnet(), &owner.to_string())
				.await
				.map_err(failed("masquerade"))?;
			undo.push(Undo::Unmasquerade(address, pool.subnet()));
		}

		let record = AttachmentRecord {
			owner: owner.to_string(),
			netns: netns.to_owned(),
			sandbox_ifname: sandbox.ifname,
			sandbox_mac,
			host_ifname: host,
			host_mac: host_link.mac,
			bridge: settings.bridge.clone(),
			bridge_mac: bridge.mac,
			address: sandbox.address,
			gateway: sandbox.gateway,
			subnet: pool.subnet(),
			masquerade: settings.ip_masq,
		};
		self.ledger.record_attachment(&record)?;
		Ok(record)
	}

	async fn rollback(&self, owner: &OwnerId, undo: Vec<Undo>) {
		for step in undo.into_iter().rev() {
			let res = match &step {
				Undo::DeleteLink(name) => self.net.delete_link(name).await.map(|_| ()),
				Undo::Unmasquerade(address, subnet) => self
					.net
					.del_masquerade(*address, *subnet, &owner.to_string())
					.await
					.map(|_| ()),
			};

			match res {
				Ok(()) => debug!("rolled back {:?} for {}", step, owner),
				Err(err) => warn!("could not roll back {:?} for {}: {}", step, owner, err),
			}
		}
	}

	/// Remove everything an attachment of `owner` may have created.
	///
	/// Anything already gone counts as removed. Works from the owner alone
	/// when there's no record. Fails only if something that exists can't be
	/// removed; the record is then kept so a retry can finish.
	pub async fn detach(&self, owner: &OwnerId) -> AppResult<()> {
		let record = self.ledger.attachment(owner)?;
		let (address, subnet, masquerade) = match &record {
			Some(r) => (Some(r.address.ip()), r.subnet, r.masquerade),
			None => (
				self.ledger.lookup(owner)?,
				self.settings.pool.subnet(),
				self.settings.ip_masq,
			),
		};

		let mut first_err = None;
		let mut fail = |step: &'static str, err: NetError| {
			warn!("detaching {}: {}: {}", owner, step, err);
			if first_err.is_none() {
				first_err = Some(AppError::Detach {
					owner: owner.to_string(),
					step,
					err,
				});
			}
		};

		if let (true, Some(address)) = (masquerade, address) {
			match self
				.net
				.del_masquerade(address, subnet, &owner.to_string())
				.await
			{
				Ok(true) => debug!("removed masquerade for {}", address),
				Ok(false) => debug!("no masquerade for {}", address),
				Err(err) => fail("unmasquerade", err),
			}
		}

		for name in [owner.host_ifname(), owner.peer_ifname()].iter() {
			match self.net.delete_link(name).await {
				Ok(true) => info!("deleted {} of {}", name, owner),
				Ok(false) => debug!("{} already gone", name),
				Err(err) => fail("delete link", err),
			}
		}

		if let Some(err) = first_err {
			return Err(err);
		}

		if self.ledger.forget_attachment(owner)? {
			info!("detached {}", owner);
		}
		Ok(())
	}
}
