use async_std::task::block_on;
use cni_plugin::{
	config::NetworkConfig,
	error::CniError,
	logger,
	reply::{done, reply, SuccessReply},
	version, Cni,
};
use log::{debug, error, info};

use crate::{
	error::AppResult,
	handler::{valid_attachments, Plugin},
	netlink::Rtnetlink,
	settings::Settings,
};

mod allocator;
mod attach;
mod error;
mod guard;
mod handler;
mod ledger;
mod masquerade;
mod netlink;
mod owner;
mod pool;
mod settings;

#[cfg(test)]
mod fake;

fn main() {
	let mut logconfig = logger::default_config();
	logconfig.add_filter_ignore_str("netlink_proto");
	logger::with_config(env!("CARGO_PKG_NAME"), logconfig.build());

	debug!(
		"{} (CNI bridge plugin) version {}",
		env!("CARGO_PKG_NAME"),
		env!("CARGO_PKG_VERSION")
	);

	let cni = Cni::load();
	let config = match &cni {
		Cni::Version(asked) => reply(version::supported(asked.clone())),
		Cni::Add { config, .. }
		| Cni::Del { config, .. }
		| Cni::Check { config, .. }
		| Cni::Gc { config }
		| Cni::Status { config } => config.clone(),
	};

	let cni_version = config.cni_version.clone(); // for error
	info!(
		"{} serving spec v{} for command={:?} network={}",
		env!("CARGO_PKG_NAME"),
		cni_version,
		cni.command(),
		config.name
	);

	match block_on(run(cni, config)) {
		Ok(Some(success)) => reply(success),
		Ok(None) => done(),
		Err(err) => {
			error!("{}", err);
			reply(err.into_reply(cni_version))
		}
	}
}

async fn run(cni: Cni, config: NetworkConfig) -> AppResult<Option<SuccessReply>> {
	let settings = Settings::from_config(&config)?;
	let net = Rtnetlink::connect()
		.map_err(|err| CniError::Generic(format!("cannot open netlink: {}", err)))?;
	let plugin = Plugin::new(settings, net)?;

	match cni {
		Cni::Add {
			container_id,
			ifname,
			netns,
			..
		} => plugin.add(&container_id, &ifname, &netns).await.map(Some),
		Cni::Del {
			container_id,
			ifname,
			netns,
			..
		} => plugin
			.del(&container_id, &ifname, netns.as_deref())
			.await
			.map(|_| None),
		Cni::Check {
			container_id,
			ifname,
			netns,
			..
		} => plugin
			.check(&container_id, &ifname, &netns)
			.await
			.map(|_| None),
		Cni::Gc { config } => {
			let valid = valid_attachments(&config)?;
			plugin.gc(&valid).await.map(|_| None)
		}
		Cni::Status { .. } => plugin.status().await.map(|_| None),
		Cni::Version(_) => unreachable!("replied before dispatch"),
	}
}
