//! Flow keys and their masks.
//!
//! Every key type carries a key value and a mask of the same shape.
//! A set mask bit makes the corresponding key bit significant for
//! matching; an all-zero mask wildcards the key type entirely.
//!
//! # Design decisions
//!
//! Most key types are fixed-size byte strings and are handled as
//! [`BlobFlowKey`]s. The tunnel key is a nested attribute set whose
//! fields are present independently, so it gets its own
//! representation in [`TunnelFlowKey`].
//!
//! Decoding looks up the layout of each key type in a registry. A key
//! type missing from the registry fails the decode, since matching
//! on an unknown key cannot be reasoned about.

use std::collections::{btree_map, BTreeMap};

use byteorder::{BigEndian, ByteOrder, NativeEndian};

use crate::{
    consts::ovs::{OvsKeyAttr, OvsTunnelKeyAttr},
    de::Attrs,
    err::{DeError, SerError},
    ovs::vport::VportId,
    ser::NlMsgBuilder,
    utils::all_bytes,
};

/// Source and destination addresses of the Ethernet key
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct OvsKeyEthernet {
    /// Source MAC address
    pub eth_src: [u8; 6],
    /// Destination MAC address
    pub eth_dst: [u8; 6],
}

impl OvsKeyEthernet {
    /// Size of the key on the wire
    pub const SIZE: usize = 12;

    /// A mask matching both addresses exactly
    pub const EXACT: OvsKeyEthernet = OvsKeyEthernet {
        eth_src: [0xff; 6],
        eth_dst: [0xff; 6],
    };

    /// Write the key into the first [`OvsKeyEthernet::SIZE`] bytes of
    /// `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..6].copy_from_slice(&self.eth_src);
        buf[6..12].copy_from_slice(&self.eth_dst);
    }

    /// Read a key from the start of `buf`.
    pub fn read_from(buf: &[u8]) -> Result<Self, DeError> {
        crate::de::ensure_len("ethernet key", buf, Self::SIZE)?;
        let mut key = OvsKeyEthernet::default();
        key.eth_src.copy_from_slice(&buf[0..6]);
        key.eth_dst.copy_from_slice(&buf[6..12]);
        Ok(key)
    }
}

/// A key type whose key and mask are byte strings of a fixed size
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BlobFlowKey {
    ty: OvsKeyAttr,
    key: Vec<u8>,
    mask: Vec<u8>,
}

impl BlobFlowKey {
    /// A key matching `key` exactly.
    pub fn exact(ty: OvsKeyAttr, key: &[u8]) -> Self {
        BlobFlowKey {
            ty,
            key: key.to_vec(),
            mask: vec![0xff; key.len()],
        }
    }

    /// A key matching the bits of `key` selected by `mask`.
    pub fn masked(ty: OvsKeyAttr, key: &[u8], mask: &[u8]) -> Result<Self, DeError> {
        if key.len() != mask.len() {
            return Err(DeError::BadAttrLength {
                ty: ty.into(),
                expected: key.len(),
                found: mask.len(),
            });
        }
        Ok(BlobFlowKey {
            ty,
            key: key.to_vec(),
            mask: mask.to_vec(),
        })
    }

    /// Key type
    pub fn ty(&self) -> OvsKeyAttr {
        self.ty
    }

    /// Key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Mask bytes
    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    /// Whether the mask wildcards every bit
    pub fn is_ignored(&self) -> bool {
        all_bytes(&self.mask, 0)
    }

    /// Equal masks and equal key bits under the mask
    pub fn masked_eq(&self, other: &BlobFlowKey) -> bool {
        self.ty == other.ty
            && self.mask == other.mask
            && self
                .key
                .iter()
                .zip(other.key.iter())
                .zip(self.mask.iter())
                .all(|((a, b), m)| (a ^ b) & m == 0)
    }
}

/// Which fields of a tunnel key are present in a message
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct TunnelPresence {
    /// Tunnel ID
    pub tun_id: bool,
    /// Outer IPv4 source
    pub ipv4_src: bool,
    /// Outer IPv4 destination
    pub ipv4_dst: bool,
    /// Outer TOS
    pub tos: bool,
    /// Outer TTL
    pub ttl: bool,
    /// Don't fragment flag
    pub df: bool,
    /// Checksum flag
    pub csum: bool,
}

/// Fields of the tunnel key. Used both for key values and for masks.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct TunnelAttrs {
    /// Tunnel ID, network order
    pub tun_id: [u8; 8],
    /// Outer IPv4 source address
    pub ipv4_src: [u8; 4],
    /// Outer IPv4 destination address
    pub ipv4_dst: [u8; 4],
    /// Outer TOS
    pub tos: u8,
    /// Outer TTL
    pub ttl: u8,
    /// Don't fragment flag
    pub df: bool,
    /// Checksum flag
    pub csum: bool,
}

impl TunnelAttrs {
    /// A mask matching every tunnel field exactly
    pub const EXACT: TunnelAttrs = TunnelAttrs {
        tun_id: [0xff; 8],
        ipv4_src: [0xff; 4],
        ipv4_dst: [0xff; 4],
        tos: 0xff,
        ttl: 0xff,
        df: true,
        csum: true,
    };

    /// Fields with a non-zero value. Applied to a mask, this is the
    /// set of fields that take part in matching.
    pub fn present(&self) -> TunnelPresence {
        TunnelPresence {
            tun_id: !all_bytes(&self.tun_id, 0),
            ipv4_src: !all_bytes(&self.ipv4_src, 0),
            ipv4_dst: !all_bytes(&self.ipv4_dst, 0),
            tos: self.tos != 0,
            ttl: self.ttl != 0,
            df: self.df,
            csum: self.csum,
        }
    }

    /// Whether every field is zero
    pub fn is_empty(&self) -> bool {
        *self == TunnelAttrs::default()
    }

    fn to_bytes(self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        buf[0..8].copy_from_slice(&self.tun_id);
        buf[8..12].copy_from_slice(&self.ipv4_src);
        buf[12..16].copy_from_slice(&self.ipv4_dst);
        buf[16] = self.tos;
        buf[17] = self.ttl;
        buf[18] = if self.df { 0xff } else { 0 };
        buf[19] = if self.csum { 0xff } else { 0 };
        buf
    }

    /// Write the fields selected by `present` as tunnel key
    /// attributes. Flags are only written when set.
    pub(crate) fn put_attrs(
        &self,
        b: &mut NlMsgBuilder,
        present: TunnelPresence,
    ) -> Result<(), SerError> {
        if present.tun_id {
            b.put_slice_attr(OvsTunnelKeyAttr::Id.into(), &self.tun_id)?;
        }
        if present.ipv4_src {
            b.put_slice_attr(OvsTunnelKeyAttr::Ipv4Src.into(), &self.ipv4_src)?;
        }
        if present.ipv4_dst {
            b.put_slice_attr(OvsTunnelKeyAttr::Ipv4Dst.into(), &self.ipv4_dst)?;
        }
        if present.tos {
            b.put_u8_attr(OvsTunnelKeyAttr::Tos.into(), self.tos)?;
        }
        if present.ttl {
            b.put_u8_attr(OvsTunnelKeyAttr::Ttl.into(), self.ttl)?;
        }
        if present.df && self.df {
            b.put_empty_attr(OvsTunnelKeyAttr::DontFragment.into())?;
        }
        if present.csum && self.csum {
            b.put_empty_attr(OvsTunnelKeyAttr::Csum.into())?;
        }
        Ok(())
    }

    /// Decode a nested tunnel key attribute set.
    pub(crate) fn parse(data: &[u8]) -> Result<(Self, TunnelPresence), DeError> {
        let attrs = Attrs::parse(data)?;
        let mut ta = TunnelAttrs::default();
        let mut present = TunnelPresence::default();

        if attrs.contains(OvsTunnelKeyAttr::Id) {
            ta.tun_id = attrs.get_array(OvsTunnelKeyAttr::Id)?;
            present.tun_id = true;
        }
        if attrs.contains(OvsTunnelKeyAttr::Ipv4Src) {
            ta.ipv4_src = attrs.get_array(OvsTunnelKeyAttr::Ipv4Src)?;
            present.ipv4_src = true;
        }
        if attrs.contains(OvsTunnelKeyAttr::Ipv4Dst) {
            ta.ipv4_dst = attrs.get_array(OvsTunnelKeyAttr::Ipv4Dst)?;
            present.ipv4_dst = true;
        }
        if let Some(tos) = attrs.get_optional_u8(OvsTunnelKeyAttr::Tos)? {
            ta.tos = tos;
            present.tos = true;
        }
        if let Some(ttl) = attrs.get_optional_u8(OvsTunnelKeyAttr::Ttl)? {
            ta.ttl = ttl;
            present.ttl = true;
        }
        ta.df = attrs.get_flag(OvsTunnelKeyAttr::DontFragment);
        present.df = ta.df;
        ta.csum = attrs.get_flag(OvsTunnelKeyAttr::Csum);
        present.csum = ta.csum;

        Ok((ta, present))
    }
}

/// The tunnel key
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct TunnelFlowKey {
    /// Key values
    pub key: TunnelAttrs,
    /// Mask
    pub mask: TunnelAttrs,
}

impl TunnelFlowKey {
    /// Whether the mask wildcards every field
    pub fn is_ignored(&self) -> bool {
        self.mask.is_empty()
    }

    /// Equal masks and equal key bits under the mask
    pub fn masked_eq(&self, other: &TunnelFlowKey) -> bool {
        let mask = self.mask.to_bytes();
        self.mask == other.mask
            && self
                .key
                .to_bytes()
                .iter()
                .zip(other.key.to_bytes().iter())
                .zip(mask.iter())
                .all(|((a, b), m)| (a ^ b) & m == 0)
    }
}

/// One entry of a flow match
#[derive(Clone, Debug)]
pub enum FlowKey {
    /// A fixed-size key without further interpretation
    Blob(BlobFlowKey),
    /// The input vport. See [`FlowKey::in_port`].
    InPort(BlobFlowKey),
    /// Ethernet addresses. Never treated as ignored, since the kernel
    /// requires the key.
    Ethernet(BlobFlowKey),
    /// Tunnel metadata
    Tunnel(TunnelFlowKey),
}

impl FlowKey {
    /// Match packets received on `port`.
    ///
    /// The kernel always matches the input port exactly when it is
    /// given, and reports masks with the upper bits set even when the
    /// key was not requested. A decoded input port mask other than
    /// all ones is therefore taken as ignored.
    pub fn in_port(port: VportId) -> Self {
        let mut key = [0u8; 4];
        NativeEndian::write_u32(&mut key, port.0);
        FlowKey::InPort(BlobFlowKey::exact(OvsKeyAttr::InPort, &key))
    }

    /// Match Ethernet addresses under `mask`.
    pub fn ethernet(key: OvsKeyEthernet, mask: OvsKeyEthernet) -> Self {
        let mut k = [0u8; OvsKeyEthernet::SIZE];
        let mut m = [0u8; OvsKeyEthernet::SIZE];
        key.write_to(&mut k);
        mask.write_to(&mut m);
        FlowKey::Ethernet(BlobFlowKey {
            ty: OvsKeyAttr::Ethernet,
            key: k.to_vec(),
            mask: m.to_vec(),
        })
    }

    /// Match the QoS priority exactly.
    pub fn priority(priority: u32) -> Self {
        let mut key = [0u8; 4];
        NativeEndian::write_u32(&mut key, priority);
        FlowKey::Blob(BlobFlowKey::exact(OvsKeyAttr::Priority, &key))
    }

    /// Match the Ethernet type exactly.
    pub fn ethertype(ethertype: u16) -> Self {
        let mut key = [0u8; 2];
        BigEndian::write_u16(&mut key, ethertype);
        FlowKey::Blob(BlobFlowKey::exact(OvsKeyAttr::Ethertype, &key))
    }

    /// Match the socket buffer mark exactly.
    pub fn skb_mark(mark: u32) -> Self {
        let mut key = [0u8; 4];
        NativeEndian::write_u32(&mut key, mark);
        FlowKey::Blob(BlobFlowKey::exact(OvsKeyAttr::SkbMark, &key))
    }

    /// Match tunnel metadata under `mask`.
    pub fn tunnel(key: TunnelAttrs, mask: TunnelAttrs) -> Self {
        FlowKey::Tunnel(TunnelFlowKey { key, mask })
    }

    /// Key type
    pub fn ty(&self) -> OvsKeyAttr {
        match self {
            FlowKey::Blob(b) | FlowKey::InPort(b) | FlowKey::Ethernet(b) => b.ty,
            FlowKey::Tunnel(_) => OvsKeyAttr::Tunnel,
        }
    }

    /// Whether the key takes no part in matching. Ignored keys are
    /// left out when encoding.
    pub fn is_ignored(&self) -> bool {
        match self {
            FlowKey::Blob(b) | FlowKey::InPort(b) => b.is_ignored(),
            FlowKey::Ethernet(_) => false,
            FlowKey::Tunnel(t) => t.is_ignored(),
        }
    }

    /// The input vport if this is an in-port key
    pub fn as_in_port(&self) -> Option<VportId> {
        match self {
            FlowKey::InPort(b) => Some(VportId(NativeEndian::read_u32(&b.key))),
            _ => None,
        }
    }

    /// Key and mask if this is an Ethernet key
    pub fn as_ethernet(&self) -> Option<(OvsKeyEthernet, OvsKeyEthernet)> {
        match self {
            FlowKey::Ethernet(b) => Some((
                OvsKeyEthernet::read_from(&b.key).ok()?,
                OvsKeyEthernet::read_from(&b.mask).ok()?,
            )),
            _ => None,
        }
    }

    /// Key and mask if this is a tunnel key
    pub fn as_tunnel(&self) -> Option<&TunnelFlowKey> {
        match self {
            FlowKey::Tunnel(t) => Some(t),
            _ => None,
        }
    }

    /// The underlying byte strings of a fixed-size key
    pub fn as_blob(&self) -> Option<&BlobFlowKey> {
        match self {
            FlowKey::Blob(b) | FlowKey::InPort(b) | FlowKey::Ethernet(b) => Some(b),
            FlowKey::Tunnel(_) => None,
        }
    }

    pub(crate) fn put_key(&self, b: &mut NlMsgBuilder) -> Result<(), SerError> {
        match self {
            FlowKey::Blob(k) | FlowKey::InPort(k) | FlowKey::Ethernet(k) => {
                b.put_slice_attr(k.ty.into(), &k.key)
            }
            FlowKey::Tunnel(t) => b.put_nested_attr(OvsKeyAttr::Tunnel.into(), |b| {
                t.key.put_attrs(b, t.mask.present())
            }),
        }
    }

    pub(crate) fn put_mask(&self, b: &mut NlMsgBuilder) -> Result<(), SerError> {
        match self {
            FlowKey::Blob(k) | FlowKey::InPort(k) | FlowKey::Ethernet(k) => {
                b.put_slice_attr(k.ty.into(), &k.mask)
            }
            FlowKey::Tunnel(t) => b.put_nested_attr(OvsKeyAttr::Tunnel.into(), |b| {
                t.mask.put_attrs(b, t.mask.present())
            }),
        }
    }
}

impl PartialEq for FlowKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FlowKey::Tunnel(a), FlowKey::Tunnel(b)) => a.masked_eq(b),
            (FlowKey::Tunnel(_), _) | (_, FlowKey::Tunnel(_)) => false,
            _ => match (self.as_blob(), other.as_blob()) {
                (Some(a), Some(b)) => a.masked_eq(b),
                _ => false,
            },
        }
    }
}

impl Eq for FlowKey {}

/// The mask to decode a key with
#[derive(Clone, Copy, Debug)]
enum MaskSpec<'a> {
    /// No mask set was sent, so every key bit is significant.
    Exact,
    /// A mask set was sent without this key type.
    Ignore,
    /// The mask attribute for this key type.
    Given(&'a [u8]),
}

/// How a key type is laid out on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyLayout {
    Blob(usize),
    InPort,
    Ethernet,
    Tunnel,
}

fn key_layout(ty: OvsKeyAttr) -> Option<KeyLayout> {
    let layout = match ty {
        OvsKeyAttr::Priority => KeyLayout::Blob(4),
        OvsKeyAttr::InPort => KeyLayout::InPort,
        OvsKeyAttr::Ethernet => KeyLayout::Ethernet,
        OvsKeyAttr::Vlan => KeyLayout::Blob(2),
        OvsKeyAttr::Ethertype => KeyLayout::Blob(2),
        OvsKeyAttr::Ipv4 => KeyLayout::Blob(12),
        OvsKeyAttr::Ipv6 => KeyLayout::Blob(40),
        OvsKeyAttr::Tcp => KeyLayout::Blob(4),
        OvsKeyAttr::Udp => KeyLayout::Blob(4),
        OvsKeyAttr::Icmp => KeyLayout::Blob(2),
        OvsKeyAttr::Icmpv6 => KeyLayout::Blob(2),
        OvsKeyAttr::Arp => KeyLayout::Blob(24),
        OvsKeyAttr::Nd => KeyLayout::Blob(28),
        OvsKeyAttr::SkbMark => KeyLayout::Blob(4),
        OvsKeyAttr::Tunnel => KeyLayout::Tunnel,
        OvsKeyAttr::Sctp => KeyLayout::Blob(4),
        OvsKeyAttr::TcpFlags => KeyLayout::Blob(2),
        OvsKeyAttr::DpHash => KeyLayout::Blob(4),
        OvsKeyAttr::RecircId => KeyLayout::Blob(4),
        _ => return None,
    };
    Some(layout)
}

fn parse_blob(
    ty: OvsKeyAttr,
    key: Option<&[u8]>,
    mask: MaskSpec,
    size: usize,
) -> Result<BlobFlowKey, DeError> {
    let mask = match mask {
        MaskSpec::Exact => vec![0xff; size],
        MaskSpec::Ignore => vec![0; size],
        MaskSpec::Given(m) => m.to_vec(),
    };
    if mask.len() != size {
        return Err(DeError::BadAttrLength {
            ty: ty.into(),
            expected: size,
            found: mask.len(),
        });
    }

    let key = match key {
        Some(k) if k.len() != size => {
            return Err(DeError::BadAttrLength {
                ty: ty.into(),
                expected: size,
                found: k.len(),
            })
        }
        Some(k) => k.to_vec(),
        None if !all_bytes(&mask, 0) => return Err(DeError::MaskWithoutKey(ty.into())),
        None => vec![0; size],
    };

    Ok(BlobFlowKey { ty, key, mask })
}

fn parse_tunnel(key: Option<&[u8]>, mask: MaskSpec) -> Result<TunnelFlowKey, DeError> {
    let mask = match mask {
        MaskSpec::Exact => TunnelAttrs::EXACT,
        MaskSpec::Ignore => TunnelAttrs::default(),
        MaskSpec::Given(m) => TunnelAttrs::parse(m)?.0,
    };
    let key = match key {
        Some(k) => TunnelAttrs::parse(k)?.0,
        None if !mask.is_empty() => {
            return Err(DeError::MaskWithoutKey(OvsKeyAttr::Tunnel.into()))
        }
        None => TunnelAttrs::default(),
    };
    Ok(TunnelFlowKey { key, mask })
}

fn parse_flow_key(ty: u16, key: Option<&[u8]>, mask: MaskSpec) -> Result<FlowKey, DeError> {
    let attr = OvsKeyAttr::from(ty);
    let layout = key_layout(attr).ok_or(DeError::UnknownKeyType(ty))?;
    Ok(match layout {
        KeyLayout::Blob(size) => FlowKey::Blob(parse_blob(attr, key, mask, size)?),
        KeyLayout::InPort => {
            let mask = match mask {
                MaskSpec::Given(m) if !all_bytes(m, 0xff) => MaskSpec::Ignore,
                mask => mask,
            };
            FlowKey::InPort(parse_blob(attr, key, mask, 4)?)
        }
        KeyLayout::Ethernet => {
            FlowKey::Ethernet(parse_blob(attr, key, mask, OvsKeyEthernet::SIZE)?)
        }
        KeyLayout::Tunnel => FlowKey::Tunnel(parse_tunnel(key, mask)?),
    })
}

/// A flow match: at most one key per key type
#[derive(Clone, Debug, Default)]
pub struct FlowKeys {
    keys: BTreeMap<OvsKeyAttr, FlowKey>,
}

impl FlowKeys {
    /// An empty match
    pub fn new() -> Self {
        FlowKeys::default()
    }

    /// Add a key, replacing any key of the same type.
    pub fn add(&mut self, key: FlowKey) -> Option<FlowKey> {
        self.keys.insert(key.ty(), key)
    }

    /// The key of type `ty`
    pub fn get(&self, ty: OvsKeyAttr) -> Option<&FlowKey> {
        self.keys.get(&ty)
    }

    /// Number of key types, including ignored ones
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether there are no keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterate over the keys in key type order.
    pub fn iter(&self) -> btree_map::Values<'_, OvsKeyAttr, FlowKey> {
        self.keys.values()
    }

    /// Write every key that is not ignored as an attribute.
    pub(crate) fn put_keys(&self, b: &mut NlMsgBuilder) -> Result<(), SerError> {
        for key in self.iter().filter(|k| !k.is_ignored()) {
            key.put_key(b)?;
        }
        Ok(())
    }

    /// Write the mask of every key that is not ignored as an
    /// attribute.
    pub(crate) fn put_masks(&self, b: &mut NlMsgBuilder) -> Result<(), SerError> {
        for key in self.iter().filter(|k| !k.is_ignored()) {
            key.put_mask(b)?;
        }
        Ok(())
    }

    /// Decode a key set and an optional mask set.
    ///
    /// Without a mask set every key is an exact match. With one, a
    /// key type missing from it is ignored, and a mask without a key
    /// must be all zero.
    pub(crate) fn parse(keys: &Attrs, masks: Option<&Attrs>) -> Result<Self, DeError> {
        let mut res = FlowKeys::new();

        for (ty, key) in keys.iter() {
            let mask = match masks {
                None => MaskSpec::Exact,
                Some(masks) => masks.get(ty).map(MaskSpec::Given).unwrap_or(MaskSpec::Ignore),
            };
            res.add(parse_flow_key(ty, Some(key), mask)?);
        }

        if let Some(masks) = masks {
            for (ty, mask) in masks.iter().filter(|(ty, _)| !keys.contains(*ty)) {
                res.add(parse_flow_key(ty, None, MaskSpec::Given(mask))?);
            }
        }

        Ok(res)
    }
}

impl FromIterator<FlowKey> for FlowKeys {
    fn from_iter<I: IntoIterator<Item = FlowKey>>(iter: I) -> Self {
        let mut keys = FlowKeys::new();
        for key in iter {
            keys.add(key);
        }
        keys
    }
}

/// A key type absent on one side equals an ignored key on the other.
impl PartialEq for FlowKeys {
    fn eq(&self, other: &Self) -> bool {
        let covers = |a: &FlowKeys, b: &FlowKeys| {
            a.keys.iter().all(|(ty, ak)| match b.keys.get(ty) {
                Some(bk) => ak == bk,
                None => ak.is_ignored(),
            })
        };
        covers(self, other) && covers(other, self)
    }
}

impl Eq for FlowKeys {}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{consts::nl::NlmF, de::NlMsgParser, test::setup};

    const KEY_ATTR: u16 = 1;
    const MASK_ATTR: u16 = 2;

    fn encode(keys: &FlowKeys, with_masks: bool) -> Vec<u8> {
        let mut b = NlMsgBuilder::new(NlmF::empty(), 0x30);
        b.put_nested_attr(KEY_ATTR, |b| keys.put_keys(b)).unwrap();
        if with_masks {
            b.put_nested_attr(MASK_ATTR, |b| keys.put_masks(b)).unwrap();
        }
        b.finish().unwrap().0
    }

    fn decode(msg: &[u8]) -> Result<FlowKeys, DeError> {
        let mut p = NlMsgParser::new(msg);
        p.take_nlmsghdr()?;
        let attrs = p.take_attrs()?;
        let keys = attrs.get_nested(KEY_ATTR)?;
        let masks = attrs.get_optional_nested(MASK_ATTR)?;
        FlowKeys::parse(&keys, masks.as_ref())
    }

    fn round_trip(keys: &FlowKeys) -> FlowKeys {
        decode(&encode(keys, true)).unwrap()
    }

    fn ethernet() -> FlowKey {
        FlowKey::ethernet(
            OvsKeyEthernet {
                eth_src: [1, 2, 3, 4, 5, 6],
                eth_dst: [6, 5, 4, 3, 2, 1],
            },
            OvsKeyEthernet::EXACT,
        )
    }

    #[test]
    fn test_blob_semantics() {
        let ty = OvsKeyAttr::Priority;
        let ignored = BlobFlowKey::masked(ty, &[1, 2, 3, 4], &[0; 4]).unwrap();
        assert!(ignored.is_ignored());

        let exact = BlobFlowKey::exact(ty, &[1, 2, 3, 4]);
        assert!(!exact.is_ignored());
        assert!(exact.masked_eq(&BlobFlowKey::exact(ty, &[1, 2, 3, 4])));
        assert!(!exact.masked_eq(&BlobFlowKey::exact(ty, &[1, 2, 3, 5])));

        let a = BlobFlowKey::masked(ty, &[0x12, 0, 0, 0], &[0xf0, 0, 0, 0]).unwrap();
        let b = BlobFlowKey::masked(ty, &[0x1f, 9, 9, 9], &[0xf0, 0, 0, 0]).unwrap();
        let c = BlobFlowKey::masked(ty, &[0x22, 0, 0, 0], &[0xf0, 0, 0, 0]).unwrap();
        assert!(a.masked_eq(&b));
        assert!(!a.masked_eq(&c));

        let other_mask = BlobFlowKey::masked(ty, &[0x12, 0, 0, 0], &[0xff, 0, 0, 0]).unwrap();
        assert!(!a.masked_eq(&other_mask));

        assert!(BlobFlowKey::masked(ty, &[0; 4], &[0; 2]).is_err());
    }

    #[test]
    fn test_ethernet_never_ignored() {
        let key = FlowKey::ethernet(OvsKeyEthernet::default(), OvsKeyEthernet::default());
        assert!(!key.is_ignored());
        let keys: FlowKeys = vec![key].into_iter().collect();
        assert!(keys != FlowKeys::new());
    }

    #[test]
    fn test_round_trip_blob_keys() {
        setup();

        let keys: FlowKeys = vec![
            FlowKey::priority(7),
            FlowKey::in_port(VportId(3)),
            ethernet(),
            FlowKey::ethertype(0x0800),
            FlowKey::skb_mark(0xdead),
        ]
        .into_iter()
        .collect();
        let decoded = round_trip(&keys);
        assert_eq!(decoded, keys);
        assert_eq!(
            decoded.get(OvsKeyAttr::InPort).unwrap().as_in_port(),
            Some(VportId(3))
        );
        let (eth, mask) = decoded.get(OvsKeyAttr::Ethernet).unwrap().as_ethernet().unwrap();
        assert_eq!(eth.eth_src, [1, 2, 3, 4, 5, 6]);
        assert_eq!(mask, OvsKeyEthernet::EXACT);
        assert_eq!(
            decoded.get(OvsKeyAttr::Ethertype).unwrap().as_blob().unwrap().key(),
            &[0x08, 0x00]
        );
    }

    #[test]
    fn test_round_trip_tunnel_combinations() {
        setup();

        let key = TunnelAttrs {
            tun_id: [0, 0, 0, 0, 0, 0, 0, 42],
            ipv4_src: [10, 0, 0, 1],
            ipv4_dst: [10, 0, 0, 2],
            tos: 4,
            ttl: 64,
            df: true,
            csum: true,
        };
        for bits in 0u8..128 {
            let mask = TunnelAttrs {
                tun_id: if bits & 1 != 0 { [0xff; 8] } else { [0; 8] },
                ipv4_src: if bits & 2 != 0 { [0xff; 4] } else { [0; 4] },
                ipv4_dst: if bits & 4 != 0 { [0xff; 4] } else { [0; 4] },
                tos: if bits & 8 != 0 { 0xff } else { 0 },
                ttl: if bits & 16 != 0 { 0xff } else { 0 },
                df: bits & 32 != 0,
                csum: bits & 64 != 0,
            };
            let keys: FlowKeys = vec![ethernet(), FlowKey::tunnel(key, mask)]
                .into_iter()
                .collect();
            assert_eq!(round_trip(&keys), keys, "mask bits {:#b}", bits);
        }
    }

    #[test]
    fn test_ignored_keys_not_encoded() {
        setup();

        let keys: FlowKeys = vec![
            ethernet(),
            FlowKey::Blob(BlobFlowKey::masked(OvsKeyAttr::SkbMark, &[1, 0, 0, 0], &[0; 4]).unwrap()),
            FlowKey::tunnel(TunnelAttrs::default(), TunnelAttrs::default()),
        ]
        .into_iter()
        .collect();
        let msg = encode(&keys, true);
        let mut p = NlMsgParser::new(&msg);
        p.take_nlmsghdr().unwrap();
        let attrs = p.take_attrs().unwrap();
        assert_eq!(attrs.get_nested(KEY_ATTR).unwrap().len(), 1);
        assert_eq!(attrs.get_nested(MASK_ATTR).unwrap().len(), 1);

        let decoded = decode(&msg).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded, keys);
    }

    #[test]
    fn test_no_mask_set_is_exact() {
        setup();

        let keys: FlowKeys = vec![FlowKey::skb_mark(5)].into_iter().collect();
        let decoded = decode(&encode(&keys, false)).unwrap();
        let mark = decoded.get(OvsKeyAttr::SkbMark).unwrap().as_blob().unwrap();
        assert_eq!(mark.mask(), &[0xff; 4]);
    }

    #[test]
    fn test_mask_only_keys() {
        setup();

        let mut b = NlMsgBuilder::new(NlmF::empty(), 0x30);
        b.put_nested_attr(KEY_ATTR, |b| ethernet().put_key(b)).unwrap();
        b.put_nested_attr(MASK_ATTR, |b| {
            ethernet().put_mask(b)?;
            b.put_slice_attr(OvsKeyAttr::Ipv4.into(), &[0; 12])
        })
        .unwrap();
        let decoded = decode(&b.finish().unwrap().0).unwrap();
        assert!(decoded.get(OvsKeyAttr::Ipv4).unwrap().is_ignored());

        let mut b = NlMsgBuilder::new(NlmF::empty(), 0x30);
        b.put_nested_attr(KEY_ATTR, |b| ethernet().put_key(b)).unwrap();
        b.put_nested_attr(MASK_ATTR, |b| {
            b.put_slice_attr(OvsKeyAttr::Ethernet.into(), &[0xff; 12])?;
            b.put_slice_attr(OvsKeyAttr::SkbMark.into(), &[0, 0, 1, 0])
        })
        .unwrap();
        assert!(matches!(
            decode(&b.finish().unwrap().0),
            Err(DeError::MaskWithoutKey(15))
        ));
    }

    /// The kernel reports in-port masks such as `0xffff0000` even for
    /// flows that never asked for the in-port key. Such masks decode
    /// as ignored. This depends on kernel behaviour rather than a
    /// documented interface.
    #[test]
    fn test_in_port_partial_mask_is_ignored() {
        setup();

        let mut partial = [0u8; 4];
        NativeEndian::write_u32(&mut partial, 0xffff_0000);
        let mut b = NlMsgBuilder::new(NlmF::empty(), 0x30);
        b.put_nested_attr(KEY_ATTR, |b| {
            b.put_u32_attr(OvsKeyAttr::InPort.into(), 2)
        })
        .unwrap();
        b.put_nested_attr(MASK_ATTR, |b| {
            b.put_slice_attr(OvsKeyAttr::InPort.into(), &partial)
        })
        .unwrap();
        let decoded = decode(&b.finish().unwrap().0).unwrap();
        let in_port = decoded.get(OvsKeyAttr::InPort).unwrap();
        assert!(in_port.is_ignored());
        assert_eq!(in_port.as_blob().unwrap().mask(), &[0; 4]);

        let mut b = NlMsgBuilder::new(NlmF::empty(), 0x30);
        b.put_nested_attr(KEY_ATTR, |b| ethernet().put_key(b)).unwrap();
        b.put_nested_attr(MASK_ATTR, |b| {
            ethernet().put_mask(b)?;
            b.put_slice_attr(OvsKeyAttr::InPort.into(), &partial)
        })
        .unwrap();
        let decoded = decode(&b.finish().unwrap().0).unwrap();
        assert_eq!(decoded, vec![ethernet()].into_iter().collect::<FlowKeys>());
    }

    #[test]
    fn test_unknown_key_type() {
        setup();

        let mut b = NlMsgBuilder::new(NlmF::empty(), 0x30);
        b.put_nested_attr(KEY_ATTR, |b| b.put_slice_attr(OvsKeyAttr::Encap.into(), &[]))
            .unwrap();
        assert!(matches!(
            decode(&b.finish().unwrap().0),
            Err(DeError::UnknownKeyType(1))
        ));
    }

    #[test]
    fn test_bad_key_length() {
        setup();

        let mut b = NlMsgBuilder::new(NlmF::empty(), 0x30);
        b.put_nested_attr(KEY_ATTR, |b| {
            b.put_slice_attr(OvsKeyAttr::Ethertype.into(), &[8, 0, 0])
        })
        .unwrap();
        assert!(matches!(
            decode(&b.finish().unwrap().0),
            Err(DeError::BadAttrLength {
                ty: 6,
                expected: 2,
                found: 3
            })
        ));
    }
}
