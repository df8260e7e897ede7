//! Vports are the ports of a datapath. Their numbers are scoped to
//! the datapath they belong to.

use std::{fmt, sync::Arc};

use log::{debug, trace};

use crate::{
    consts::{
        nl::{NlmF, DUMP_FLAGS, REQUEST_FLAGS},
        ovs::{
            OvsTunnelAttr, OvsVportAttr, OvsVportCmd, OvsVportType, OVS_VPORT_MCGROUP,
            OVS_VPORT_VERSION,
        },
        socket::NlFamily,
    },
    de::{Attrs, NlMsgParser},
    err::{DeError, NlError, SerError},
    genl::GenlFamily,
    listener::{Listener, MessageHandler},
    ovs::{check_headers, datapath::DatapathHandle, Dpif, Families},
    ser::NlMsgBuilder,
    socket::NlSocket,
    utils::Groups,
};

/// Number of a vport within its datapath
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VportId(pub u32);

impl fmt::Display for VportId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type and configuration of a vport
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum VportSpec {
    /// An existing network device attached to the datapath
    Netdev {
        /// Device name
        name: String,
    },
    /// A network device created for the datapath
    Internal {
        /// Device name
        name: String,
    },
    /// A VXLAN tunnel endpoint
    Vxlan {
        /// Vport name
        name: String,
        /// UDP destination port
        dst_port: u16,
    },
}

type VportSpecParser = fn(String, Option<Attrs>) -> Result<VportSpec, DeError>;

fn parse_netdev(name: String, _: Option<Attrs>) -> Result<VportSpec, DeError> {
    Ok(VportSpec::Netdev { name })
}

fn parse_internal(name: String, _: Option<Attrs>) -> Result<VportSpec, DeError> {
    Ok(VportSpec::Internal { name })
}

fn parse_vxlan(name: String, options: Option<Attrs>) -> Result<VportSpec, DeError> {
    let options = options.unwrap_or_default();
    Ok(VportSpec::Vxlan {
        name,
        dst_port: options.get_u16(OvsTunnelAttr::DstPort)?,
    })
}

fn vport_spec_parser(ty: OvsVportType) -> Option<VportSpecParser> {
    match ty {
        OvsVportType::Netdev => Some(parse_netdev),
        OvsVportType::Internal => Some(parse_internal),
        OvsVportType::Vxlan => Some(parse_vxlan),
        _ => None,
    }
}

impl VportSpec {
    /// A netdev vport
    pub fn netdev(name: &str) -> Self {
        VportSpec::Netdev {
            name: name.to_string(),
        }
    }

    /// An internal vport
    pub fn internal(name: &str) -> Self {
        VportSpec::Internal {
            name: name.to_string(),
        }
    }

    /// A VXLAN vport listening on `dst_port`
    pub fn vxlan(name: &str, dst_port: u16) -> Self {
        VportSpec::Vxlan {
            name: name.to_string(),
            dst_port,
        }
    }

    /// Name of the vport
    pub fn name(&self) -> &str {
        match self {
            VportSpec::Netdev { name }
            | VportSpec::Internal { name }
            | VportSpec::Vxlan { name, .. } => name,
        }
    }

    /// Short name of the vport type
    pub fn type_name(&self) -> &'static str {
        match self {
            VportSpec::Netdev { .. } => "netdev",
            VportSpec::Internal { .. } => "internal",
            VportSpec::Vxlan { .. } => "vxlan",
        }
    }

    /// Kernel vport type
    pub fn vport_type(&self) -> OvsVportType {
        match self {
            VportSpec::Netdev { .. } => OvsVportType::Netdev,
            VportSpec::Internal { .. } => OvsVportType::Internal,
            VportSpec::Vxlan { .. } => OvsVportType::Vxlan,
        }
    }

    fn put_options(&self, req: &mut NlMsgBuilder) -> Result<(), SerError> {
        match self {
            VportSpec::Vxlan { dst_port, .. } => {
                req.put_u16_attr(OvsTunnelAttr::DstPort.into(), *dst_port)
            }
            _ => Ok(()),
        }
    }
}

/// A vport and its number
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Vport {
    /// Number of the vport in its datapath
    pub id: VportId,
    /// Type and configuration
    pub spec: VportSpec,
}

/// A decoded vport message
struct VportInfo {
    cmd: u8,
    ifindex: i32,
    vport: Vport,
}

fn parse_vport(family: &GenlFamily, msg: &[u8], cmds: &[u8]) -> Result<VportInfo, DeError> {
    let mut p = NlMsgParser::new(msg);
    let (genlhdr, ovshdr) = check_headers(&mut p, family, cmds)?;
    let attrs = p.take_attrs()?;

    let id = VportId(attrs.get_u32(OvsVportAttr::PortNo)?);
    let ty = OvsVportType::from(attrs.get_u32(OvsVportAttr::Type)?);
    let name = attrs.get_string(OvsVportAttr::Name)?;
    let options = attrs.get_optional_nested(OvsVportAttr::Options)?;
    let parse = vport_spec_parser(ty)
        .ok_or_else(|| DeError::new(format!("Unsupported vport type {}", u32::from(ty))))?;

    Ok(VportInfo {
        cmd: genlhdr.cmd,
        ifindex: ovshdr.dp_ifindex,
        vport: Vport {
            id,
            spec: parse(name, options)?,
        },
    })
}

fn reply_cmds(cmd: OvsVportCmd) -> [u8; 2] {
    [OvsVportCmd::New.into(), cmd.into()]
}

fn vport_request(
    family: &GenlFamily,
    ifindex: i32,
    flags: NlmF,
    cmd: OvsVportCmd,
) -> NlMsgBuilder {
    let mut req = NlMsgBuilder::new(flags, *family.id());
    req.put_genlhdr(cmd.into(), OVS_VPORT_VERSION);
    req.put_ovs_header(ifindex);
    req
}

fn lookup_vport_info(dpif: &Dpif, ifindex: i32, name: &str) -> Result<Option<VportInfo>, NlError> {
    let family = dpif.families().vport();
    let mut req = vport_request(family, ifindex, REQUEST_FLAGS, OvsVportCmd::Get);
    req.put_string_attr(OvsVportAttr::Name.into(), name)?;

    match dpif.request(req) {
        Ok(resp) => Ok(Some(parse_vport(
            family,
            &resp,
            &reply_cmds(OvsVportCmd::Get),
        )?)),
        Err(e) if e.is_errno(libc::ENODEV) => Ok(None),
        Err(e) => Err(e),
    }
}

impl Dpif {
    /// Look up a vport by name in any datapath. Returns the datapath
    /// owning it together with the vport, or `None` if there is no
    /// such vport.
    pub fn lookup_vport_by_name(&self, name: &str) -> Result<Option<(DatapathHandle, Vport)>, NlError> {
        Ok(lookup_vport_info(self, 0, name)?
            .map(|info| (self.datapath_handle(info.ifindex), info.vport)))
    }

    /// Subscribe to vport notifications of every datapath. `consumer`
    /// is called from a background thread until the returned listener
    /// is stopped or dropped.
    pub fn consume_vport_events<C>(&self, consumer: C) -> Result<Listener, NlError>
    where
        C: VportEventConsumer,
    {
        let group = self.families().vport().mcast_group(OVS_VPORT_MCGROUP)?;
        let socket = NlSocket::connect(NlFamily::Generic, None, Groups::new_groups(&[group]))?;
        debug!("Subscribed to vport events on group {}", group);
        Listener::spawn(
            socket,
            *self.config().recv_buffer_len(),
            VportEventHandler {
                families: self.families_arc(),
                consumer,
            },
        )
    }
}

impl DatapathHandle {
    fn vport_request(&self, flags: NlmF, cmd: OvsVportCmd) -> NlMsgBuilder {
        vport_request(self.dpif().families().vport(), self.ifindex(), flags, cmd)
    }

    fn parse_vport_reply(&self, msg: &[u8], cmd: OvsVportCmd) -> Result<Vport, NlError> {
        let info = parse_vport(self.dpif().families().vport(), msg, &reply_cmds(cmd))?;
        self.check_ifindex(info.ifindex)?;
        Ok(info.vport)
    }

    /// Add a vport to the datapath and return its number.
    pub fn create_vport(&self, spec: &VportSpec) -> Result<VportId, NlError> {
        let mut req = self.vport_request(REQUEST_FLAGS, OvsVportCmd::New);
        req.put_string_attr(OvsVportAttr::Name.into(), spec.name())?;
        req.put_u32_attr(OvsVportAttr::Type.into(), spec.vport_type().into())?;
        req.put_nested_attr(OvsVportAttr::Options.into(), |b| spec.put_options(b))?;
        req.put_u32_attr(OvsVportAttr::UpcallPid.into(), 0)?;

        let resp = self.dpif().request(req)?;
        let vport = self.parse_vport_reply(&resp, OvsVportCmd::New)?;
        debug!(
            "Created {} vport {} as port {} of datapath {}",
            spec.type_name(),
            spec.name(),
            vport.id,
            self.ifindex()
        );
        Ok(vport.id)
    }

    /// Look up a vport of this datapath by name.
    pub fn lookup_vport_by_name(&self, name: &str) -> Result<Option<Vport>, NlError> {
        match lookup_vport_info(self.dpif(), self.ifindex(), name)? {
            Some(info) => {
                self.check_ifindex(info.ifindex)?;
                Ok(Some(info.vport))
            }
            None => Ok(None),
        }
    }

    /// Look up a vport of this datapath by number.
    pub fn lookup_vport(&self, id: VportId) -> Result<Option<Vport>, NlError> {
        let mut req = self.vport_request(REQUEST_FLAGS, OvsVportCmd::Get);
        req.put_u32_attr(OvsVportAttr::PortNo.into(), id.0)?;

        match self.dpif().request(req) {
            Ok(resp) => Ok(Some(self.parse_vport_reply(&resp, OvsVportCmd::Get)?)),
            Err(e) if e.is_errno(libc::ENODEV) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Name of the vport with number `id`, or `"<ifindex>:<id>"` if
    /// there is no such vport.
    pub fn lookup_vport_name(&self, id: VportId) -> Result<String, NlError> {
        Ok(match self.lookup_vport(id)? {
            Some(vport) => vport.spec.name().to_string(),
            None => format!("{}:{}", self.ifindex(), id),
        })
    }

    /// All vports of the datapath.
    pub fn enumerate_vports(&self) -> Result<Vec<Vport>, NlError> {
        let mut res = Vec::new();
        let req = self.vport_request(DUMP_FLAGS, OvsVportCmd::Get);
        self.dpif().request_multi(req, |msg| {
            res.push(self.parse_vport_reply(msg, OvsVportCmd::Get)?);
            Ok(())
        })?;
        Ok(res)
    }

    /// Remove a vport from the datapath.
    pub fn delete_vport(&self, id: VportId) -> Result<(), NlError> {
        let mut req = self.vport_request(REQUEST_FLAGS, OvsVportCmd::Del);
        req.put_u32_attr(OvsVportAttr::PortNo.into(), id.0)?;
        self.dpif().request(req)?;
        Ok(())
    }

    /// Direct the misses of a vport to the netlink port `pid`.
    pub fn set_vport_upcall_port_id(&self, id: VportId, pid: u32) -> Result<(), NlError> {
        let mut req = self.vport_request(REQUEST_FLAGS, OvsVportCmd::Set);
        req.put_u32_attr(OvsVportAttr::PortNo.into(), id.0)?;
        req.put_u32_attr(OvsVportAttr::UpcallPid.into(), pid)?;
        self.dpif().request(req)?;
        trace!(
            "Set upcall port ID of vport {} of datapath {} to {}",
            id,
            self.ifindex(),
            pid
        );
        Ok(())
    }
}

/// Receiver of vport notifications
pub trait VportEventConsumer: Send + 'static {
    /// A vport was added to datapath `ifindex`, or an existing vport
    /// was reconfigured in a way the kernel reports as new.
    fn new_vport(&mut self, ifindex: i32, vport: Vport) -> Result<(), NlError>;

    /// A vport was removed from datapath `ifindex`.
    fn delete_vport(&mut self, ifindex: i32, vport: Vport) -> Result<(), NlError>;

    /// Report an error. `fatal` is true if notifications have
    /// stopped.
    fn error(&mut self, err: NlError, fatal: bool);
}

pub(crate) struct VportEventHandler<C> {
    pub(crate) families: Arc<Families>,
    pub(crate) consumer: C,
}

impl<C> MessageHandler for VportEventHandler<C>
where
    C: VportEventConsumer,
{
    fn handle(&mut self, msg: &[u8]) -> Result<(), NlError> {
        let info = parse_vport(
            self.families.vport(),
            msg,
            &[
                OvsVportCmd::New.into(),
                OvsVportCmd::Del.into(),
                OvsVportCmd::Set.into(),
                OvsVportCmd::Get.into(),
            ],
        )?;
        match OvsVportCmd::from(info.cmd) {
            OvsVportCmd::New => self.consumer.new_vport(info.ifindex, info.vport),
            OvsVportCmd::Del => self.consumer.delete_vport(info.ifindex, info.vport),
            cmd => {
                trace!("Ignoring vport event {:?} for port {}", cmd, info.vport.id);
                Ok(())
            }
        }
    }

    fn error(&mut self, err: NlError, fatal: bool) {
        self.consumer.error(err, fatal)
    }
}
