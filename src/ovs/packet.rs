//! Packet injection and decoding of miss notifications.

use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::{
    consts::{
        nl::NlmF,
        ovs::{OvsPacketAttr, OvsPacketCmd, OVS_PACKET_VERSION},
    },
    de::NlMsgParser,
    err::NlError,
    listener::MessageHandler,
    ovs::{
        check_headers,
        datapath::DatapathHandle,
        flow::{put_actions, Action, FlowKeys},
        Families,
    },
};

impl DatapathHandle {
    /// Run `actions` on `packet` as if it had been received with flow
    /// keys `keys`. The kernel does not answer, so errors it detects
    /// are not reported.
    pub fn execute(&self, packet: &[u8], keys: &FlowKeys, actions: &[Action]) -> Result<(), NlError> {
        let mut req = self.request_builder(
            NlmF::REQUEST,
            *self.dpif().families().packet().id(),
            OvsPacketCmd::Execute.into(),
            OVS_PACKET_VERSION,
        );
        req.put_slice_attr(OvsPacketAttr::Packet.into(), packet)?;
        req.put_nested_attr(OvsPacketAttr::Key.into(), |b| keys.put_keys(b))?;
        req.put_nested_attr(OvsPacketAttr::Actions.into(), |b| put_actions(b, actions))?;
        self.dpif().send(req)?;
        trace!(
            "Executed {} actions on a {} byte packet in datapath {}",
            actions.len(),
            packet.len(),
            self.ifindex()
        );
        Ok(())
    }
}

/// Receiver of packets that matched no flow
pub trait MissConsumer: Send + 'static {
    /// A packet missed the flow table. `keys` are the flow keys the
    /// kernel extracted from it, all exact.
    fn miss(&mut self, packet: &[u8], keys: FlowKeys) -> Result<(), NlError>;

    /// Report an error from the miss or vport event listener.
    /// `fatal` is true if that listener has stopped.
    fn error(&mut self, err: NlError, fatal: bool);
}

/// Decodes miss messages for one datapath
pub(crate) struct MissHandler<C> {
    pub(crate) families: Arc<Families>,
    pub(crate) ifindex: i32,
    pub(crate) consumer: Arc<Mutex<C>>,
}

impl<C> MessageHandler for MissHandler<C>
where
    C: MissConsumer,
{
    fn handle(&mut self, msg: &[u8]) -> Result<(), NlError> {
        let mut p = NlMsgParser::new(msg);
        let (_, ovshdr) = check_headers(
            &mut p,
            self.families.packet(),
            &[OvsPacketCmd::Miss.into()],
        )?;
        if ovshdr.dp_ifindex != self.ifindex {
            return Err(NlError::IfindexMismatch {
                expected: self.ifindex,
                found: ovshdr.dp_ifindex,
            });
        }

        let attrs = p.take_attrs()?;
        let keys = FlowKeys::parse(&attrs.get_nested(OvsPacketAttr::Key)?, None)?;
        let packet = attrs.get_bytes(OvsPacketAttr::Packet)?;
        self.consumer.lock().miss(packet, keys)
    }

    fn error(&mut self, err: NlError, fatal: bool) {
        self.consumer.lock().error(err, fatal)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use crate::{
        consts::ovs::OvsKeyAttr,
        listener::dispatch_datagram,
        ovs::{
            flow::{FlowKey, OvsKeyEthernet},
            test::{families, mock_dpif, reply, PACKET_FAMILY},
            vport::VportId,
        },
        socket::mock::MockTransport,
        test::setup,
    };

    /// Records misses and errors.
    #[derive(Clone, Default)]
    pub struct MissRecorder {
        pub misses: Arc<Mutex<Vec<(Vec<u8>, FlowKeys)>>>,
        pub errors: Arc<Mutex<Vec<(String, bool)>>>,
    }

    impl MissConsumer for MissRecorder {
        fn miss(&mut self, packet: &[u8], keys: FlowKeys) -> Result<(), NlError> {
            self.misses.lock().push((packet.to_vec(), keys));
            Ok(())
        }

        fn error(&mut self, err: NlError, fatal: bool) {
            self.errors.lock().push((err.to_string(), fatal));
        }
    }

    fn keys() -> FlowKeys {
        vec![
            FlowKey::in_port(VportId(2)),
            FlowKey::ethernet(
                OvsKeyEthernet {
                    eth_src: [2, 0, 0, 0, 0, 1],
                    eth_dst: [2, 0, 0, 0, 0, 2],
                },
                OvsKeyEthernet::EXACT,
            ),
            FlowKey::ethertype(0x0806),
        ]
        .into_iter()
        .collect()
    }

    fn miss_msg(ifindex: i32, packet: &'static [u8]) -> Vec<u8> {
        reply(PACKET_FAMILY, OvsPacketCmd::Miss.into(), ifindex, 0, |b| {
            b.put_slice_attr(OvsPacketAttr::Packet.into(), packet)?;
            b.put_nested_attr(OvsPacketAttr::Key.into(), |b| keys().put_keys(b))
        })
    }

    #[test]
    fn test_execute_request() {
        setup();

        let mock = MockTransport::new();
        let dp = mock_dpif(&mock).datapath_handle(9);
        dp.execute(&[0xaa; 60], &keys(), &[Action::Output(VportId(1))])
            .unwrap();
        assert_eq!(mock.pending(), 0);

        let sent = mock.sent();
        let mut p = NlMsgParser::new(&sent[0]);
        assert_eq!(
            p.expect_nlmsghdr(PACKET_FAMILY).unwrap().nl_flags,
            NlmF::REQUEST
        );
        assert_eq!(
            p.expect_genlhdr(OvsPacketCmd::Execute).unwrap().version,
            OVS_PACKET_VERSION
        );
        assert_eq!(p.take_ovs_header().unwrap().dp_ifindex, 9);
        let attrs = p.take_attrs().unwrap();
        assert_eq!(attrs.get_bytes(OvsPacketAttr::Packet).unwrap(), &[0xaa; 60]);
        let key_attrs = attrs.get_nested(OvsPacketAttr::Key).unwrap();
        assert_eq!(key_attrs.len(), 3);
        assert!(key_attrs.contains(OvsKeyAttr::InPort));
        assert_eq!(attrs.get_ordered(OvsPacketAttr::Actions).unwrap().len(), 1);
    }

    #[test]
    fn test_miss_delivery() {
        setup();

        let recorder = MissRecorder::default();
        let mut handler = MissHandler {
            families: Arc::new(families()),
            ifindex: 9,
            consumer: Arc::new(Mutex::new(recorder.clone())),
        };
        let datagram = [
            miss_msg(9, b"first"),
            miss_msg(10, b"other datapath"),
            miss_msg(9, b"second"),
        ]
        .concat();
        dispatch_datagram(&datagram, &mut handler);

        let misses = recorder.misses.lock();
        assert_eq!(misses.len(), 2);
        assert_eq!(misses[0].0, b"first");
        assert_eq!(misses[0].1, keys());
        assert_eq!(misses[1].0, b"second");

        let errors = recorder.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].1);
    }
}
