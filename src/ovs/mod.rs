//! Client for the Open vSwitch kernel datapath.
//!
//! A [`Dpif`] owns a generic netlink socket and the resolved IDs of
//! the four datapath families. Handles for datapaths
//! ([`DatapathHandle`][crate::ovs::datapath::DatapathHandle]) share the
//! client they were obtained from, so closing the client makes every
//! handle fail with [`NlError::Closed`].
//!
//! # Design decisions
//!
//! The request socket sits behind a mutex that is held for the whole
//! of a request or dump. Replies are only correlated by sequence
//! number, so two requests must never be in flight on one socket.
//! Miss and vport event traffic arrives on separate sockets, see
//! [`miss`].

use std::{sync::Arc, time::Duration};

use byteorder::{ByteOrder, NativeEndian};
use derive_builder::Builder;
use getset::Getters;
use log::debug;
use parking_lot::Mutex;

use crate::{
    consts::ovs::{OVS_DATAPATH_FAMILY, OVS_FLOW_FAMILY, OVS_PACKET_FAMILY, OVS_VPORT_FAMILY},
    de::{ensure_len, NlMsgParser},
    err::{DeError, NlError},
    genl::{resolve_genl_family, GenlFamily, Genlmsghdr},
    ser::NlMsgBuilder,
    socket::NlSocketHandle,
    utils::{default_recv_buffer_len, Groups},
};

/// Datapath operations
pub mod datapath;
/// Flow keys, actions and flow operations
pub mod flow;
/// Miss and vport event delivery
pub mod miss;
/// Packet execution and miss decoding
pub mod packet;
/// Vport operations and events
pub mod vport;

/// Header following the generic netlink header in every Open vSwitch
/// message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OvsHeader {
    /// Interface index of the datapath, 0 when not addressing one
    pub dp_ifindex: i32,
}

impl OvsHeader {
    /// Size of the header on the wire
    pub const SIZE: usize = 4;

    /// Write the header into the first [`OvsHeader::SIZE`] bytes of
    /// `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        NativeEndian::write_i32(&mut buf[0..4], self.dp_ifindex);
    }

    /// Read a header from the start of `buf`.
    pub fn read_from(buf: &[u8]) -> Result<Self, DeError> {
        ensure_len("datapath header", buf, Self::SIZE)?;
        Ok(OvsHeader {
            dp_ifindex: NativeEndian::read_i32(&buf[0..4]),
        })
    }
}

/// Configuration of a [`Dpif`]
#[derive(Builder, Getters, Clone, Debug, PartialEq, Eq)]
#[builder(pattern = "owned")]
pub struct DpifConfig {
    /// Bytes read from a socket at once
    #[builder(default = "default_recv_buffer_len()")]
    #[getset(get = "pub")]
    recv_buffer_len: usize,
    /// Upper bound on every blocking receive of a request. Listener
    /// sockets never time out.
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    recv_timeout: Option<Duration>,
    /// Try to load the kernel module when a family is missing
    #[builder(default = "true")]
    #[getset(get = "pub")]
    autoload_module: bool,
}

impl Default for DpifConfig {
    fn default() -> Self {
        DpifConfig {
            recv_buffer_len: default_recv_buffer_len(),
            recv_timeout: None,
            autoload_module: true,
        }
    }
}

/// The resolved datapath families
#[derive(Clone, Debug, Getters, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct Families {
    /// `ovs_datapath`
    datapath: GenlFamily,
    /// `ovs_vport`
    vport: GenlFamily,
    /// `ovs_flow`
    flow: GenlFamily,
    /// `ovs_packet`
    packet: GenlFamily,
}

impl Families {
    /// Group the four families.
    pub fn new(
        datapath: GenlFamily,
        vport: GenlFamily,
        flow: GenlFamily,
        packet: GenlFamily,
    ) -> Self {
        Families {
            datapath,
            vport,
            flow,
            packet,
        }
    }

    fn resolve(sock: &mut NlSocketHandle, autoload: bool) -> Result<Self, NlError> {
        Ok(Families {
            datapath: resolve_genl_family(sock, OVS_DATAPATH_FAMILY, autoload)?,
            vport: resolve_genl_family(sock, OVS_VPORT_FAMILY, autoload)?,
            flow: resolve_genl_family(sock, OVS_FLOW_FAMILY, autoload)?,
            packet: resolve_genl_family(sock, OVS_PACKET_FAMILY, autoload)?,
        })
    }
}

struct DpifInner {
    sock: Mutex<Option<NlSocketHandle>>,
    families: Arc<Families>,
    config: DpifConfig,
}

/// Connection to the kernel datapath. Cloning yields another
/// reference to the same connection.
#[derive(Clone)]
pub struct Dpif {
    inner: Arc<DpifInner>,
}

impl Dpif {
    /// Connect with the default configuration.
    pub fn open() -> Result<Self, NlError> {
        Dpif::open_with(DpifConfig::default())
    }

    /// Connect and resolve the datapath families.
    pub fn open_with(config: DpifConfig) -> Result<Self, NlError> {
        let mut sock = NlSocketHandle::connect(
            Groups::empty(),
            config.recv_timeout,
            config.recv_buffer_len,
        )?;
        let families = Families::resolve(&mut sock, config.autoload_module)?;
        Ok(Dpif::from_parts(sock, Arc::new(families), config))
    }

    /// Build a client from an already connected socket and resolved
    /// families.
    pub fn from_parts(sock: NlSocketHandle, families: Arc<Families>, config: DpifConfig) -> Self {
        Dpif {
            inner: Arc::new(DpifInner {
                sock: Mutex::new(Some(sock)),
                families,
                config,
            }),
        }
    }

    /// Open an independent connection that shares the resolved
    /// families of this one.
    pub fn reopen(&self) -> Result<Self, NlError> {
        let sock = NlSocketHandle::connect(
            Groups::empty(),
            self.inner.config.recv_timeout,
            self.inner.config.recv_buffer_len,
        )?;
        Ok(Dpif::from_parts(
            sock,
            Arc::clone(&self.inner.families),
            self.inner.config.clone(),
        ))
    }

    /// Close the socket. Later operations through this client or any
    /// of its handles fail with [`NlError::Closed`]. Closing twice is
    /// harmless.
    pub fn close(&self) {
        if let Some(sock) = self.inner.sock.lock().take() {
            debug!("Closing datapath client on port ID {}", sock.pid());
        }
    }

    /// Whether [`Dpif::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.inner.sock.lock().is_none()
    }

    /// The resolved datapath families
    pub fn families(&self) -> &Families {
        &self.inner.families
    }

    pub(crate) fn families_arc(&self) -> Arc<Families> {
        Arc::clone(&self.inner.families)
    }

    /// The configuration this client was opened with
    pub fn config(&self) -> &DpifConfig {
        &self.inner.config
    }

    /// Port ID of the request socket
    pub fn pid(&self) -> Result<u32, NlError> {
        self.with_socket(|sock| Ok(sock.pid()))
    }

    fn with_socket<T, F>(&self, f: F) -> Result<T, NlError>
    where
        F: FnOnce(&mut NlSocketHandle) -> Result<T, NlError>,
    {
        match self.inner.sock.lock().as_mut() {
            Some(sock) => f(sock),
            None => Err(NlError::Closed),
        }
    }

    pub(crate) fn request(&self, req: NlMsgBuilder) -> Result<Vec<u8>, NlError> {
        self.with_socket(|sock| sock.request(req))
    }

    pub(crate) fn request_multi<F>(&self, req: NlMsgBuilder, consumer: F) -> Result<(), NlError>
    where
        F: FnMut(&[u8]) -> Result<(), NlError>,
    {
        self.with_socket(|sock| sock.request_multi(req, consumer))
    }

    pub(crate) fn send(&self, req: NlMsgBuilder) -> Result<(), NlError> {
        self.with_socket(|sock| sock.send(req).map(|_| ()))
    }
}

/// Check the netlink, generic netlink and datapath headers of a
/// message of `family` carrying one of `cmds`.
pub(crate) fn check_headers(
    msg: &mut NlMsgParser,
    family: &GenlFamily,
    cmds: &[u8],
) -> Result<(Genlmsghdr, OvsHeader), DeError> {
    msg.expect_nlmsghdr(*family.id())?;
    let genlhdr = msg.expect_genlhdr_of(cmds)?;
    let ovshdr = msg.take_ovs_header()?;
    Ok((genlhdr, ovshdr))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use std::collections::HashMap;

    use crate::{
        consts::ovs::OVS_VPORT_MCGROUP,
        socket::mock::{self, MockTransport},
        test::setup,
    };

    pub const PID: u32 = 3131;
    pub const DP_FAMILY: u16 = 0x20;
    pub const VPORT_FAMILY: u16 = 0x21;
    pub const FLOW_FAMILY: u16 = 0x22;
    pub const PACKET_FAMILY: u16 = 0x23;
    pub const VPORT_GROUP: u32 = 5;

    pub fn families() -> Families {
        let mut groups = HashMap::new();
        groups.insert(OVS_VPORT_MCGROUP.to_string(), VPORT_GROUP);
        Families::new(
            GenlFamily::new(OVS_DATAPATH_FAMILY, DP_FAMILY, HashMap::new()),
            GenlFamily::new(OVS_VPORT_FAMILY, VPORT_FAMILY, groups),
            GenlFamily::new(OVS_FLOW_FAMILY, FLOW_FAMILY, HashMap::new()),
            GenlFamily::new(OVS_PACKET_FAMILY, PACKET_FAMILY, HashMap::new()),
        )
    }

    /// A client talking to a scripted transport.
    pub fn mock_dpif(mock: &MockTransport) -> Dpif {
        let sock = NlSocketHandle::from_transport(Box::new(mock.clone()), PID, 8192);
        Dpif::from_parts(sock, Arc::new(families()), DpifConfig::default())
    }

    /// Finish a kernel reply of `family` with command `cmd` for
    /// datapath `ifindex`.
    pub fn reply<F>(family: u16, cmd: u8, ifindex: i32, seq: u32, put_attrs: F) -> Vec<u8>
    where
        F: FnOnce(&mut NlMsgBuilder) -> Result<(), crate::err::SerError>,
    {
        let mut b = NlMsgBuilder::new(crate::consts::nl::NlmF::empty(), family);
        b.put_genlhdr(cmd, 1);
        b.put_ovs_header(ifindex);
        put_attrs(&mut b).unwrap();
        mock::response(b, seq, PID)
    }

    #[test]
    fn test_config_builder() {
        setup();

        let config = DpifConfigBuilder::default()
            .recv_timeout(Duration::from_secs(2))
            .autoload_module(false)
            .build()
            .unwrap();
        assert_eq!(*config.recv_buffer_len(), default_recv_buffer_len());
        assert_eq!(*config.recv_timeout(), Some(Duration::from_secs(2)));
        assert!(!*config.autoload_module());

        let default = DpifConfigBuilder::default().build().unwrap();
        assert_eq!(default, DpifConfig::default());
    }

    #[test]
    fn test_closed_client() {
        setup();

        let mock = MockTransport::new();
        let dpif = mock_dpif(&mock);
        let other = dpif.clone();
        assert_eq!(dpif.pid().unwrap(), PID);

        dpif.close();
        dpif.close();
        assert!(other.is_closed());
        assert!(matches!(other.pid(), Err(NlError::Closed)));
        assert!(matches!(
            other.lookup_datapath("dp0"),
            Err(NlError::Closed)
        ));
        assert!(mock.sent().is_empty());
    }

    #[test]
    fn test_ovs_header_layout() {
        let mut buf = [0u8; 4];
        OvsHeader { dp_ifindex: -2 }.write_to(&mut buf);
        assert_eq!(OvsHeader::read_from(&buf).unwrap().dp_ifindex, -2);
        assert!(OvsHeader::read_from(&buf[..3]).is_err());
    }
}
