#![warn(missing_docs)]

//! Protocol plumbing for CNI plugins.
//!
//! This crate covers the parts of a plugin invocation that don't depend on
//! what the plugin does: reading the `CNI_*` environment and the network
//! configuration from STDIN, checking the requested spec version, and writing
//! success, error, and version replies to STDOUT.
//!
//! - CNI information: on the [cni.dev](https://cni.dev) website.
//!
//! # Quick start
//!
//! ```no_run
//! use cni_plugin::{logger, reply::{done, reply}, Cni};
//! logger::install("hello-world");
//! match Cni::load() {
//!     Cni::Add { container_id, ifname, netns, config } => {}
//!     Cni::Del { container_id, ifname, netns, config } => {}
//!     Cni::Check { container_id, ifname, netns, config } => {}
//!     Cni::Gc { config } | Cni::Status { config } => done(),
//!     Cni::Version(v) => reply(cni_plugin::version::supported(v)),
//! }
//! ```

pub use cni::{valid_ifname, Cni, IFNAME_MAX};
pub use command::Command;

pub mod config;
pub mod error;
pub mod ip_range;
pub mod logger;
pub mod macaddr;
pub mod reply;
pub mod version;

mod cni;
mod command;
mod dns;
