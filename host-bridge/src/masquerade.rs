//! Per-attachment source NAT with iptables.
//!
//! One rule per attachment in `nat/POSTROUTING`, matching the attachment's
//! address and tagged with its owner so it can be told apart by an operator.

use std::{net::IpAddr, process::Stdio};

use async_process::Command;
use async_std::fs;
use ipnetwork::IpNetwork;
use log::{debug, info};

use crate::netlink::NetError;

const IPV4_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const IPV6_FORWARD: &str = "/proc/sys/net/ipv6/conf/all/forwarding";

fn program(address: IpAddr) -> &'static str {
	if address.is_ipv4() {
		"iptables"
	} else {
		"ip6tables"
	}
}

/// Rule arguments after the chain name; identical for check, append, delete.
pub fn rule(address: IpAddr, subnet: IpNetwork, comment: &str) -> Vec<String> {
	vec![
		"-s".into(),
		address.to_string(),
		"!".into(),
		"-d".into(),
		subnet.to_string(),
		"-m".into(),
		"comment".into(),
		"--comment".into(),
		comment.into(),
		"-j".into(),
		"MASQUERADE".into(),
	]
}

async fn iptables(address: IpAddr, action: &str, rule: &[String]) -> Result<bool, NetError> {
	let program = program(address);
	debug!("{} -t nat {} POSTROUTING {}", program, action, rule.join(" "));

	let output = Command::new(program)
		.args(&["-w", "-t", "nat", action, "POSTROUTING"])
		.args(rule)
		.stdin(Stdio::null())
		.output()
		.await
		.map_err(|err| NetError::Command {
			program: program.into(),
			reason: err.to_string(),
		})?;

	match output.status.code() {
		Some(0) => Ok(true),
		// -C and -D exit 1 when the rule doesn't exist
		Some(1) if action != "-A" => Ok(false),
		_ => Err(NetError::Command {
			program: program.into(),
			reason: format!(
				"{} {}: {}",
				action,
				output.status,
				String::from_utf8_lossy(&output.stderr).trim()
			),
		}),
	}
}

pub async fn add(address: IpAddr, subnet: IpNetwork, comment: &str) -> Result<(), NetError> {
	let rule = rule(address, subnet, comment);
	if iptables(address, "-C", &rule).await? {
		debug!("masquerade for {} already present", address);
		return Ok(());
	}

	iptables(address, "-A", &rule).await?;
	info!("masquerading {} leaving {}", address, subnet);
	Ok(())
}

/// Returns whether a rule was removed.
pub async fn remove(address: IpAddr, subnet: IpNetwork, comment: &str) -> Result<bool, NetError> {
	let rule = rule(address, subnet, comment);
	let mut removed = false;
	// delete every copy, in case an earlier run appended twice
	while iptables(address, "-D", &rule).await? {
		removed = true;
	}

	if removed {
		info!("stopped masquerading {}", address);
	}
	Ok(removed)
}

pub async fn enable_forwarding(address: IpAddr) -> Result<(), NetError> {
	let knob = if address.is_ipv4() {
		IPV4_FORWARD
	} else {
		IPV6_FORWARD
	};

	if fs::read_to_string(knob).await?.trim() == "1" {
		return Ok(());
	}

	fs::write(knob, b"1").await?;
	info!("enabled forwarding via {}", knob);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rule_shape() {
		let rule = rule(
			"10.244.1.2".parse().unwrap(),
			"10.244.1.0/24".parse().unwrap(),
			"podA/eth0",
		);
		assert_eq!(
			rule.join(" "),
			"-s 10.244.1.2 ! -d 10.244.1.0/24 -m comment --comment podA/eth0 -j MASQUERADE"
		);
	}

	#[test]
	fn family_picks_the_binary() {
		assert_eq!(program("10.0.0.1".parse().unwrap()), "iptables");
		assert_eq!(program("fd00::1".parse().unwrap()), "ip6tables");
	}
}
