//! Flows: a match on flow keys plus the actions applied to matching
//! packets.

use byteorder::{ByteOrder, NativeEndian};
use log::debug;

use crate::{
    consts::{
        nl::{NlmF, DUMP_FLAGS, REQUEST_FLAGS},
        ovs::{OvsFlowAttr, OvsFlowCmd, OVS_FLOW_VERSION},
    },
    de::{ensure_len, NlMsgParser},
    err::{DeError, NlError, SerError},
    ovs::{check_headers, datapath::DatapathHandle},
    ser::NlMsgBuilder,
};

/// Flow actions
pub mod action;
/// Flow keys and masks
pub mod key;

pub use self::{action::*, key::*};

/// Counters the kernel reports for a flow
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// Packets matched
    pub packets: u64,
    /// Bytes matched
    pub bytes: u64,
    /// Time of the last match in milliseconds of system uptime
    pub used: Option<u64>,
    /// Union of the TCP flags seen
    pub tcp_flags: Option<u8>,
}

impl FlowStats {
    const SIZE: usize = 16;
}

/// A flow: keys, ordered actions and, when read back from the
/// kernel, counters.
#[derive(Clone, Debug, Default)]
pub struct FlowSpec {
    /// The match
    pub keys: FlowKeys,
    /// Actions in the order they are applied
    pub actions: Vec<Action>,
    /// Counters, only set on flows read from the kernel
    pub stats: Option<FlowStats>,
}

/// Counters do not take part in comparison.
impl PartialEq for FlowSpec {
    fn eq(&self, other: &Self) -> bool {
        self.keys == other.keys && self.actions == other.actions
    }
}

impl Eq for FlowSpec {}

impl FlowSpec {
    /// An empty flow
    pub fn new() -> Self {
        FlowSpec::default()
    }

    /// Add a key to the match.
    pub fn add_key(&mut self, key: FlowKey) -> &mut Self {
        self.keys.add(key);
        self
    }

    /// Append an action.
    pub fn add_action(&mut self, action: Action) -> &mut Self {
        self.actions.push(action);
        self
    }

    /// Write the key, mask and action attributes. The action
    /// attribute is mandatory and written even without actions.
    fn put_attrs(&self, b: &mut NlMsgBuilder) -> Result<(), SerError> {
        b.put_nested_attr(OvsFlowAttr::Key.into(), |b| self.keys.put_keys(b))?;
        b.put_nested_attr(OvsFlowAttr::Mask.into(), |b| self.keys.put_masks(b))?;
        b.put_nested_attr(OvsFlowAttr::Actions.into(), |b| {
            put_actions(b, &self.actions)
        })
    }
}

/// Outcome of a flow deletion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowRemoval {
    /// The flow was removed.
    Removed,
    /// No flow matched.
    NotFound,
}

fn parse_stats(buf: &[u8]) -> Result<(u64, u64), DeError> {
    ensure_len("flow stats", buf, FlowStats::SIZE)?;
    Ok((
        NativeEndian::read_u64(&buf[0..8]),
        NativeEndian::read_u64(&buf[8..16]),
    ))
}

impl DatapathHandle {
    fn flow_request(&self, flags: NlmF, cmd: OvsFlowCmd) -> NlMsgBuilder {
        self.request_builder(
            flags,
            *self.dpif().families().flow().id(),
            cmd.into(),
            OVS_FLOW_VERSION,
        )
    }

    fn parse_flow(&self, msg: &[u8]) -> Result<FlowSpec, NlError> {
        let mut p = NlMsgParser::new(msg);
        let (_, ovshdr) = check_headers(
            &mut p,
            self.dpif().families().flow(),
            &[OvsFlowCmd::New.into(), OvsFlowCmd::Get.into()],
        )?;
        self.check_ifindex(ovshdr.dp_ifindex)?;
        let attrs = p.take_attrs()?;

        let keys = attrs.get_nested(OvsFlowAttr::Key)?;
        let masks = attrs.get_optional_nested(OvsFlowAttr::Mask)?;
        let keys = FlowKeys::parse(&keys, masks.as_ref())?;
        let actions = parse_actions(&attrs.get_ordered(OvsFlowAttr::Actions)?)?;

        let stats = match attrs.get(OvsFlowAttr::Stats) {
            Some(buf) => {
                let (packets, bytes) = parse_stats(buf)?;
                Some(FlowStats {
                    packets,
                    bytes,
                    used: attrs.get_optional_u64(OvsFlowAttr::Used)?,
                    tcp_flags: attrs.get_optional_u8(OvsFlowAttr::TcpFlags)?,
                })
            }
            None => None,
        };

        Ok(FlowSpec {
            keys,
            actions,
            stats,
        })
    }

    /// Install a flow.
    pub fn create_flow(&self, flow: &FlowSpec) -> Result<(), NlError> {
        let mut req = self.flow_request(REQUEST_FLAGS, OvsFlowCmd::New);
        flow.put_attrs(&mut req)?;
        self.dpif().request(req)?;
        debug!(
            "Created flow with {} keys and {} actions in datapath {}",
            flow.keys.len(),
            flow.actions.len(),
            self.ifindex()
        );
        Ok(())
    }

    /// Remove the flow with the match of `flow`.
    pub fn delete_flow(&self, flow: &FlowSpec) -> Result<FlowRemoval, NlError> {
        let mut req = self.flow_request(REQUEST_FLAGS, OvsFlowCmd::Del);
        flow.put_attrs(&mut req)?;
        match self.dpif().request(req) {
            Ok(_) => Ok(FlowRemoval::Removed),
            Err(e) if e.is_errno(libc::ENOENT) => Ok(FlowRemoval::NotFound),
            Err(e) => Err(e),
        }
    }

    /// All flows of the datapath, with their counters.
    pub fn enumerate_flows(&self) -> Result<Vec<FlowSpec>, NlError> {
        let mut res = Vec::new();
        let req = self.flow_request(DUMP_FLAGS, OvsFlowCmd::Get);
        self.dpif().request_multi(req, |msg| {
            res.push(self.parse_flow(msg)?);
            Ok(())
        })?;
        Ok(res)
    }
}
