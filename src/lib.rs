//! # Talking to the Open vSwitch kernel datapath
//!
//! ## Rationale
//!
//! This crate is a pure Rust client for the in-kernel Open vSwitch
//! datapath. It speaks generic netlink directly, without any other
//! Open vSwitch user space component, and wraps the kernel constants
//! in enums so that the categories of constants cannot be mixed up.
//!
//! ## Layout
//!
//! * [`consts`], [`nl`], [`genl`]: kernel records and constants.
//! * [`ser`] and [`de`]: building and parsing netlink messages and
//!   their attributes.
//! * [`socket`]: the netlink socket and the request/response handle
//!   built on it.
//! * [`listener`]: a background thread for unsolicited messages.
//! * [`ovs`]: datapaths, vports, flows, packet execution and miss
//!   delivery.
//!
//! ## Example
//!
//! ```no_run
//! use ovsdp::ovs::{flow::{Action, FlowKey, FlowSpec, OvsKeyEthernet}, vport::VportSpec, Dpif};
//!
//! let dpif = Dpif::open().unwrap();
//! let dp = dpif.create_datapath("dp0").unwrap();
//! let port = dp.create_vport(&VportSpec::internal("dp0-int")).unwrap();
//!
//! let mut flow = FlowSpec::new();
//! flow.add_key(FlowKey::ethernet(OvsKeyEthernet::default(), OvsKeyEthernet::default()))
//!     .add_action(Action::Output(port));
//! dp.create_flow(&flow).unwrap();
//! ```
//!
//! ## Logging
//!
//! Every buffer sent and received is logged at `trace` level through
//! the [`log`] facade. Listener lifecycle and skipped messages are
//! logged at `debug`, recoverable listener errors at `warn`.

#![deny(missing_docs)]

pub mod consts;
pub mod de;
pub mod err;
pub mod genl;
pub mod listener;
pub mod nl;
pub mod ovs;
pub mod ser;
pub mod socket;
pub mod utils;
