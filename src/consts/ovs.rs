//! Constants of the Open vSwitch kernel datapath ABI as found in
//! `linux/openvswitch.h`.

use bitflags::bitflags;

/// Generic netlink family name of the datapath family
pub const OVS_DATAPATH_FAMILY: &str = "ovs_datapath";
/// Generic netlink family name of the vport family
pub const OVS_VPORT_FAMILY: &str = "ovs_vport";
/// Generic netlink family name of the flow family
pub const OVS_FLOW_FAMILY: &str = "ovs_flow";
/// Generic netlink family name of the packet family
pub const OVS_PACKET_FAMILY: &str = "ovs_packet";
/// Multicast group of the vport family carrying vport lifecycle
/// notifications
pub const OVS_VPORT_MCGROUP: &str = "ovs_vport";

/// Protocol version of the datapath family
pub const OVS_DATAPATH_VERSION: u8 = 2;
/// Protocol version of the vport family
pub const OVS_VPORT_VERSION: u8 = 1;
/// Protocol version of the flow family
pub const OVS_FLOW_VERSION: u8 = 1;
/// Protocol version of the packet family
pub const OVS_PACKET_VERSION: u8 = 1;

impl_var!(
    /// Commands of the datapath family
    pub OvsDpCmd, u8,
    Unspec => 0,
    New => 1,
    Del => 2,
    Get => 3,
    Set => 4
);

impl_var!(
    /// Attributes of the datapath family
    pub OvsDpAttr, u16,
    Unspec => 0,
    Name => 1,
    UpcallPid => 2,
    Stats => 3,
    MegaflowStats => 4,
    UserFeatures => 5
);

bitflags! {
    /// Values for `OVS_DP_ATTR_USER_FEATURES`
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct DpFeatures: u32 {
        /// Allow the kernel to send upcalls with unaligned packet data
        const UNALIGNED = 1 << 0;
        /// Allow a distinct upcall port id per vport
        const VPORT_PIDS = 1 << 1;
    }
}

impl_var!(
    /// Commands of the vport family
    pub OvsVportCmd, u8,
    Unspec => 0,
    New => 1,
    Del => 2,
    Get => 3,
    Set => 4
);

impl_var!(
    /// Kernel vport types
    pub OvsVportType, u32,
    Unspec => 0,
    Netdev => 1,
    Internal => 2,
    Gre => 3,
    Vxlan => 4,
    Geneve => 5
);

impl_var!(
    /// Attributes of the vport family
    pub OvsVportAttr, u16,
    Unspec => 0,
    PortNo => 1,
    Type => 2,
    Name => 3,
    Options => 4,
    UpcallPid => 5,
    Stats => 6
);

impl_var!(
    /// Attributes nested in [`OvsVportAttr::Options`] of tunnel vports
    pub OvsTunnelAttr, u16,
    Unspec => 0,
    DstPort => 1
);

impl_var!(
    /// Commands of the flow family
    pub OvsFlowCmd, u8,
    Unspec => 0,
    New => 1,
    Del => 2,
    Get => 3,
    Set => 4
);

impl_var!(
    /// Attributes of the flow family
    pub OvsFlowAttr, u16,
    Unspec => 0,
    Key => 1,
    Actions => 2,
    Stats => 3,
    TcpFlags => 4,
    Used => 5,
    Clear => 6,
    Mask => 7
);

impl_var!(
    /// Flow key types nested in [`OvsFlowAttr::Key`] and
    /// [`OvsFlowAttr::Mask`]
    pub OvsKeyAttr, u16,
    Unspec => 0,
    Encap => 1,
    Priority => 2,
    InPort => 3,
    Ethernet => 4,
    Vlan => 5,
    Ethertype => 6,
    Ipv4 => 7,
    Ipv6 => 8,
    Tcp => 9,
    Udp => 10,
    Icmp => 11,
    Icmpv6 => 12,
    Arp => 13,
    Nd => 14,
    SkbMark => 15,
    Tunnel => 16,
    Sctp => 17,
    TcpFlags => 18,
    DpHash => 19,
    RecircId => 20
);

impl_var!(
    /// Sub-fields nested in [`OvsKeyAttr::Tunnel`]
    pub OvsTunnelKeyAttr, u16,
    Id => 0,
    Ipv4Src => 1,
    Ipv4Dst => 2,
    Tos => 3,
    Ttl => 4,
    DontFragment => 5,
    Csum => 6
);

impl_var!(
    /// Action types nested in [`OvsFlowAttr::Actions`]
    pub OvsActionAttr, u16,
    Unspec => 0,
    Output => 1,
    Userspace => 2,
    Set => 3
);

impl_var!(
    /// Commands of the packet family
    pub OvsPacketCmd, u8,
    Unspec => 0,
    Miss => 1,
    Action => 2,
    Execute => 3
);

impl_var!(
    /// Attributes of the packet family
    pub OvsPacketAttr, u16,
    Unspec => 0,
    Packet => 1,
    Key => 2,
    Actions => 3,
    Userdata => 4
);
