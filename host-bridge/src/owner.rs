//! Attachment identity and the names derived from it.

use std::fmt;

use sha2::{Digest, Sha256};

/// Prefix of host-side veth names.
pub const HOST_PREFIX: &str = "veth";

/// Prefix of the sandbox-side veth name before it's moved and renamed.
pub const PEER_PREFIX: &str = "vtmp";

/// Linux interface names are at most 15 bytes.
const IFNAME_MAX: usize = 15;

/// Identity of one attachment: a container's interface on this network.
///
/// Rendered as `<container id>/<ifname>`. Container ids cannot contain a
/// slash, so the rendering parses back unambiguously.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OwnerId {
	container_id: String,
	ifname: String,
}

impl OwnerId {
	pub fn new(container_id: impl Into<String>, ifname: impl Into<String>) -> Self {
		Self {
			container_id: container_id.into(),
			ifname: ifname.into(),
		}
	}

	/// Parse the `<container id>/<ifname>` rendering.
	pub fn parse(s: &str) -> Option<Self> {
		let mut parts = s.splitn(2, '/');
		let container_id = parts.next().filter(|c| !c.is_empty())?;
		let ifname = parts.next().filter(|i| !i.is_empty())?;
		Some(Self::new(container_id, ifname))
	}

	pub fn ifname(&self) -> &str {
		&self.ifname
	}

	/// Hex SHA-256 of the rendering; stable across invocations and versions.
	pub fn digest(&self) -> String {
		let hash = Sha256::digest(self.to_string().as_bytes());
		hash.iter().map(|b| format!("{:02x}", b)).collect()
	}

	/// Host-side veth name. Recomputable from the owner alone, so DEL works
	/// without any stored state.
	pub fn host_ifname(&self) -> String {
		self.derived_name(HOST_PREFIX)
	}

	/// Temporary name of the sandbox-side veth while it's still on the host.
	pub fn peer_ifname(&self) -> String {
		self.derived_name(PEER_PREFIX)
	}

	/// ConcurrencyGuard scope serialising all commands for this owner.
	pub fn lock_scope(&self) -> String {
		format!("owner-{}", &self.digest()[..32])
	}

	fn derived_name(&self, prefix: &str) -> String {
		let digest = self.digest();
		format!("{}{}", prefix, &digest[..IFNAME_MAX - prefix.len()])
	}
}

impl fmt::Display for OwnerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.container_id, self.ifname)
	}
}
