//! Flow actions. The kernel applies them in order, and the same action
//! may appear more than once.

use byteorder::{ByteOrder, NativeEndian};

use crate::{
    consts::ovs::{OvsActionAttr, OvsKeyAttr},
    de::parse_ordered_attrs,
    err::{DeError, SerError},
    ovs::{
        flow::key::{TunnelAttrs, TunnelPresence},
        vport::VportId,
    },
    ser::NlMsgBuilder,
};

/// Set the tunnel metadata of outgoing packets
#[derive(Clone, Copy, Debug, Default)]
pub struct SetTunnelAction {
    /// Field values
    pub attrs: TunnelAttrs,
    /// Fields to set. The flags are set when their value is true.
    pub present: TunnelPresence,
}

impl SetTunnelAction {
    /// Set every field that has a non-zero value in `attrs`.
    pub fn new(attrs: TunnelAttrs) -> Self {
        SetTunnelAction {
            attrs,
            present: attrs.present(),
        }
    }

    /// The fields that end up on the wire
    fn effective(&self) -> (TunnelAttrs, TunnelPresence) {
        let p = self.present;
        let a = self.attrs;
        let attrs = TunnelAttrs {
            tun_id: if p.tun_id { a.tun_id } else { [0; 8] },
            ipv4_src: if p.ipv4_src { a.ipv4_src } else { [0; 4] },
            ipv4_dst: if p.ipv4_dst { a.ipv4_dst } else { [0; 4] },
            tos: if p.tos { a.tos } else { 0 },
            ttl: if p.ttl { a.ttl } else { 0 },
            df: p.df && a.df,
            csum: p.csum && a.csum,
        };
        let present = TunnelPresence {
            df: attrs.df,
            csum: attrs.csum,
            ..p
        };
        (attrs, present)
    }
}

impl PartialEq for SetTunnelAction {
    fn eq(&self, other: &Self) -> bool {
        self.effective() == other.effective()
    }
}

impl Eq for SetTunnelAction {}

/// A flow action
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Send the packet out of a vport of the same datapath.
    Output(VportId),
    /// Set tunnel metadata for a following output to a tunnel vport.
    SetTunnel(SetTunnelAction),
}

impl Action {
    /// Action type
    pub fn ty(&self) -> OvsActionAttr {
        match self {
            Action::Output(_) => OvsActionAttr::Output,
            Action::SetTunnel(_) => OvsActionAttr::Set,
        }
    }

    pub(crate) fn put(&self, b: &mut NlMsgBuilder) -> Result<(), SerError> {
        match self {
            Action::Output(port) => b.put_u32_attr(OvsActionAttr::Output.into(), port.0),
            Action::SetTunnel(set) => b.put_nested_attr(OvsActionAttr::Set.into(), |b| {
                b.put_nested_attr(OvsKeyAttr::Tunnel.into(), |b| {
                    let (attrs, present) = set.effective();
                    attrs.put_attrs(b, present)
                })
            }),
        }
    }
}

type ActionParser = fn(u16, &[u8]) -> Result<Action, DeError>;

fn parse_output(ty: u16, data: &[u8]) -> Result<Action, DeError> {
    if data.len() < 4 {
        return Err(DeError::BadAttrLength {
            ty,
            expected: 4,
            found: data.len(),
        });
    }
    Ok(Action::Output(VportId(NativeEndian::read_u32(&data[0..4]))))
}

fn parse_set(_: u16, data: &[u8]) -> Result<Action, DeError> {
    match parse_ordered_attrs(data)?.as_slice() {
        [(ty, val)] if OvsKeyAttr::from(*ty) == OvsKeyAttr::Tunnel => {
            let (attrs, present) = TunnelAttrs::parse(val)?;
            Ok(Action::SetTunnel(SetTunnelAction { attrs, present }))
        }
        [(ty, _)] => Err(DeError::new(format!(
            "Unsupported key type {} in set action",
            ty
        ))),
        attrs => Err(DeError::new(format!(
            "Set action carries {} attributes instead of one",
            attrs.len()
        ))),
    }
}

fn action_parser(ty: OvsActionAttr) -> Option<ActionParser> {
    match ty {
        OvsActionAttr::Output => Some(parse_output),
        OvsActionAttr::Set => Some(parse_set),
        _ => None,
    }
}

/// Decode an ordered action list.
pub(crate) fn parse_actions(attrs: &[(u16, &[u8])]) -> Result<Vec<Action>, DeError> {
    attrs
        .iter()
        .map(|(ty, data)| {
            let parse = action_parser(OvsActionAttr::from(*ty))
                .ok_or(DeError::UnknownActionType(*ty))?;
            parse(*ty, data)
        })
        .collect()
}

/// Write an ordered action list.
pub(crate) fn put_actions(b: &mut NlMsgBuilder, actions: &[Action]) -> Result<(), SerError> {
    for action in actions {
        action.put(b)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{consts::nl::NlmF, de::NlMsgParser, test::setup};

    const ACTIONS_ATTR: u16 = 2;

    fn encode(actions: &[Action]) -> Vec<u8> {
        let mut b = NlMsgBuilder::new(NlmF::empty(), 0x30);
        b.put_nested_attr(ACTIONS_ATTR, |b| put_actions(b, actions))
            .unwrap();
        b.finish().unwrap().0
    }

    fn decode(msg: &[u8]) -> Result<Vec<Action>, DeError> {
        let mut p = NlMsgParser::new(msg);
        p.take_nlmsghdr()?;
        parse_actions(&p.take_attrs()?.get_ordered(ACTIONS_ATTR)?)
    }

    #[test]
    fn test_order_and_repeats_kept() {
        setup();

        let tunnel = SetTunnelAction::new(TunnelAttrs {
            tun_id: [0, 0, 0, 0, 0, 0, 0, 9],
            ipv4_dst: [192, 168, 0, 1],
            ttl: 64,
            df: true,
            ..Default::default()
        });
        let actions = vec![
            Action::Output(VportId(2)),
            Action::SetTunnel(tunnel),
            Action::Output(VportId(5)),
            Action::Output(VportId(2)),
        ];
        assert_eq!(decode(&encode(&actions)).unwrap(), actions);
        assert_eq!(decode(&encode(&[])).unwrap(), vec![]);
    }

    #[test]
    fn test_set_tunnel_absent_fields() {
        setup();

        let set = SetTunnelAction {
            attrs: TunnelAttrs {
                tos: 3,
                ttl: 9,
                csum: true,
                ..Default::default()
            },
            present: TunnelPresence {
                ttl: true,
                ..Default::default()
            },
        };
        let decoded = decode(&encode(&[Action::SetTunnel(set)])).unwrap();
        assert_eq!(decoded, vec![Action::SetTunnel(set)]);
        match &decoded[0] {
            Action::SetTunnel(s) => {
                assert_eq!(s.attrs.ttl, 9);
                assert_eq!(s.attrs.tos, 0);
                assert!(!s.present.tos);
                assert!(!s.attrs.csum);
            }
            _ => panic!("Expected a set action"),
        }
    }

    #[test]
    fn test_short_output() {
        setup();

        let mut b = NlMsgBuilder::new(NlmF::empty(), 0x30);
        b.put_nested_attr(ACTIONS_ATTR, |b| {
            b.put_u16_attr(OvsActionAttr::Output.into(), 1)
        })
        .unwrap();
        assert!(matches!(
            decode(&b.finish().unwrap().0),
            Err(DeError::BadAttrLength {
                ty: 1,
                expected: 4,
                found: 2
            })
        ));
    }

    #[test]
    fn test_unknown_action() {
        setup();

        let mut b = NlMsgBuilder::new(NlmF::empty(), 0x30);
        b.put_nested_attr(ACTIONS_ATTR, |b| {
            b.put_u32_attr(OvsActionAttr::Output.into(), 1)?;
            b.put_empty_attr(OvsActionAttr::Userspace.into())
        })
        .unwrap();
        assert!(matches!(
            decode(&b.finish().unwrap().0),
            Err(DeError::UnknownActionType(2))
        ));
    }

    #[test]
    fn test_set_requires_single_tunnel() {
        setup();

        let mut b = NlMsgBuilder::new(NlmF::empty(), 0x30);
        b.put_nested_attr(ACTIONS_ATTR, |b| {
            b.put_nested_attr(OvsActionAttr::Set.into(), |b| {
                b.put_u32_attr(OvsKeyAttr::SkbMark.into(), 1)
            })
        })
        .unwrap();
        assert!(matches!(decode(&b.finish().unwrap().0), Err(DeError::Msg(_))));
    }
}
