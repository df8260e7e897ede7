//! This module contains the generic netlink header and the resolver
//! for dynamically numbered generic netlink families.
//!
//! # Design decisions
//!
//! Families are resolved by name through the control family. When the
//! kernel does not know a family, the resolver makes one best effort
//! attempt per process to get the Open vSwitch module loaded and then
//! retries once.

use std::{
    collections::HashMap,
    io,
    sync::atomic::{AtomicBool, Ordering},
};

use getset::Getters;
use log::{debug, warn};

use crate::{
    consts::{
        genl::{CtrlAttr, CtrlAttrMcastGrp, CtrlCmd, CTRL_VERSION},
        nl::{GenlId, REQUEST_FLAGS},
    },
    de::{ensure_len, parse_ordered_attrs, Attrs, NlMsgParser},
    err::{DeError, NlError},
    ser::NlMsgBuilder,
    socket::NlSocketHandle,
};

/// Generic netlink header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Genlmsghdr {
    /// Generic netlink message command
    pub cmd: u8,
    /// Version of generic netlink family protocol
    pub version: u8,
}

impl Genlmsghdr {
    /// Size of the header on the wire, including two reserved bytes
    pub const SIZE: usize = 4;

    /// Write the header into the first [`Genlmsghdr::SIZE`] bytes of
    /// `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.cmd;
        buf[1] = self.version;
        buf[2] = 0;
        buf[3] = 0;
    }

    /// Read a header from the start of `buf`.
    pub fn read_from(buf: &[u8]) -> Result<Self, DeError> {
        ensure_len("generic netlink header", buf, Self::SIZE)?;
        Ok(Genlmsghdr {
            cmd: buf[0],
            version: buf[1],
        })
    }
}

/// A resolved generic netlink family
#[derive(Clone, Debug, Getters, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct GenlFamily {
    /// Family name
    name: String,
    /// Family ID to use as `nl_type`
    id: u16,
    /// Multicast group IDs by group name
    mcast_groups: HashMap<String, u32>,
}

impl GenlFamily {
    /// Create a family descriptor.
    pub fn new(name: &str, id: u16, mcast_groups: HashMap<String, u32>) -> Self {
        GenlFamily {
            name: name.to_string(),
            id,
            mcast_groups,
        }
    }

    /// ID of the multicast group `group`.
    pub fn mcast_group(&self, group: &str) -> Result<u32, NlError> {
        self.mcast_groups.get(group).copied().ok_or_else(|| {
            NlError::new(format!(
                "No generic netlink multicast group {} in family {}",
                group, self.name
            ))
        })
    }
}

fn parse_mcast_groups(attrs: &Attrs) -> Result<HashMap<String, u32>, DeError> {
    let mut groups = HashMap::new();
    let data = match attrs.get(CtrlAttr::McastGroups) {
        Some(data) => data,
        None => return Ok(groups),
    };
    for (_, group) in parse_ordered_attrs(data)? {
        let group = Attrs::parse(group)?;
        groups.insert(
            group.get_string(CtrlAttrMcastGrp::Name)?,
            group.get_u32(CtrlAttrMcastGrp::Id)?,
        );
    }
    Ok(groups)
}

/// Ask the control family for the ID and multicast groups of the
/// family called `name`.
pub fn lookup_genl_family(sock: &mut NlSocketHandle, name: &str) -> Result<GenlFamily, NlError> {
    let mut req = NlMsgBuilder::new(REQUEST_FLAGS, GenlId::Ctrl.into());
    req.put_genlhdr(CtrlCmd::Getfamily.into(), CTRL_VERSION);
    req.put_string_attr(CtrlAttr::FamilyName.into(), name)?;

    let resp = sock.request(req)?;
    let mut p = NlMsgParser::new(&resp);
    p.expect_nlmsghdr(GenlId::Ctrl.into())?;
    p.expect_genlhdr(CtrlCmd::Newfamily)?;
    let attrs = p.take_attrs()?;

    let family = GenlFamily::new(
        name,
        attrs.get_u16(CtrlAttr::FamilyId)?,
        parse_mcast_groups(&attrs)?,
    );
    debug!("Resolved generic netlink family {:?}", family);
    Ok(family)
}

/// Resolve the family called `name`. If the kernel does not know it
/// and `autoload` is set, try once per process to have the
/// `openvswitch` module loaded and retry exactly once. Still failing
/// with `ENOENT` yields [`NlError::FamilyUnavailable`].
pub fn resolve_genl_family(
    sock: &mut NlSocketHandle,
    name: &str,
    autoload: bool,
) -> Result<GenlFamily, NlError> {
    match lookup_genl_family(sock, name) {
        Err(e) if e.is_errno(libc::ENOENT) => (),
        res => return res,
    }
    if !autoload {
        return Err(NlError::FamilyUnavailable(name.to_string()));
    }

    load_openvswitch_module();
    match lookup_genl_family(sock, name) {
        Err(e) if e.is_errno(libc::ENOENT) => Err(NlError::FamilyUnavailable(name.to_string())),
        res => res,
    }
}

static TRIED_MODULE_LOAD: AtomicBool = AtomicBool::new(false);

#[repr(C)]
struct IfreqIfindex {
    name: [libc::c_char; libc::IFNAMSIZ],
    ifindex: libc::c_int,
    pad: [u8; 20],
}

/// Provoke the kernel into loading the `openvswitch` module. Netdev
/// ioctls request a module named after an unknown device when the
/// caller has `CAP_SYS_MODULE`. Only the first call in a process does
/// anything.
fn load_openvswitch_module() {
    if TRIED_MODULE_LOAD.swap(true, Ordering::SeqCst) {
        return;
    }

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        warn!(
            "Could not open socket to load the openvswitch module: {}",
            io::Error::last_os_error()
        );
        return;
    }

    let mut req = IfreqIfindex {
        name: [0; libc::IFNAMSIZ],
        ifindex: 0,
        pad: [0; 20],
    };
    for (dst, src) in req.name.iter_mut().zip(b"openvswitch".iter()) {
        *dst = *src as libc::c_char;
    }
    if unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX as _, &mut req as *mut IfreqIfindex) } < 0 {
        debug!(
            "Module load probe finished: {}",
            io::Error::last_os_error()
        );
    }
    unsafe {
        libc::close(fd);
    }
}
