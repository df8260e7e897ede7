//! Datapaths. A datapath is named by the caller and identified by the
//! interface index the kernel assigns when creating it. Every other
//! object lives inside one datapath, so its handle is the starting
//! point for vport, flow and packet operations.

use std::collections::HashMap;

use log::debug;

use crate::{
    consts::{
        nl::{NlmF, DUMP_FLAGS, REQUEST_FLAGS},
        ovs::{DpFeatures, OvsDpAttr, OvsDpCmd, OVS_DATAPATH_VERSION},
    },
    de::NlMsgParser,
    err::{DeError, NlError},
    ovs::{check_headers, Dpif},
    ser::NlMsgBuilder,
};

/// Handle on a kernel datapath, identified by its interface index.
#[derive(Clone)]
pub struct DatapathHandle {
    dpif: Dpif,
    ifindex: i32,
}

impl std::fmt::Debug for DatapathHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DatapathHandle")
            .field("ifindex", &self.ifindex)
            .finish()
    }
}

impl PartialEq for DatapathHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ifindex == other.ifindex
    }
}

impl Eq for DatapathHandle {}

/// A datapath together with its name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datapath {
    /// Handle on the datapath
    pub handle: DatapathHandle,
    /// Name of the datapath
    pub name: String,
}

struct DatapathInfo {
    ifindex: i32,
    name: String,
}

impl Dpif {
    fn datapath_request(&self, flags: NlmF, cmd: OvsDpCmd, ifindex: i32) -> NlMsgBuilder {
        let mut req = NlMsgBuilder::new(flags, *self.families().datapath().id());
        req.put_genlhdr(cmd.into(), OVS_DATAPATH_VERSION);
        req.put_ovs_header(ifindex);
        req
    }

    fn parse_datapath_info(&self, msg: &[u8]) -> Result<DatapathInfo, DeError> {
        let mut p = NlMsgParser::new(msg);
        let (_, ovshdr) = check_headers(
            &mut p,
            self.families().datapath(),
            &[OvsDpCmd::New.into(), OvsDpCmd::Get.into()],
        )?;
        let attrs = p.take_attrs()?;
        Ok(DatapathInfo {
            ifindex: ovshdr.dp_ifindex,
            name: attrs.get_string(OvsDpAttr::Name)?,
        })
    }

    pub(crate) fn datapath_handle(&self, ifindex: i32) -> DatapathHandle {
        DatapathHandle {
            dpif: self.clone(),
            ifindex,
        }
    }

    /// Create a datapath. Fails with an error satisfying
    /// [`NlError::is_already_exists`] if the name is taken.
    pub fn create_datapath(&self, name: &str) -> Result<DatapathHandle, NlError> {
        let mut req = self.datapath_request(REQUEST_FLAGS, OvsDpCmd::New, 0);
        req.put_string_attr(OvsDpAttr::Name.into(), name)?;
        req.put_u32_attr(OvsDpAttr::UpcallPid.into(), 0)?;
        req.put_u32_attr(
            OvsDpAttr::UserFeatures.into(),
            (DpFeatures::UNALIGNED | DpFeatures::VPORT_PIDS).bits(),
        )?;

        let resp = self.request(req)?;
        let info = self.parse_datapath_info(&resp)?;
        debug!("Created datapath {} with ifindex {}", name, info.ifindex);
        Ok(self.datapath_handle(info.ifindex))
    }

    /// Look up a datapath by name. Returns `None` if there is no such
    /// datapath.
    pub fn lookup_datapath(&self, name: &str) -> Result<Option<DatapathHandle>, NlError> {
        let mut req = self.datapath_request(REQUEST_FLAGS, OvsDpCmd::Get, 0);
        req.put_string_attr(OvsDpAttr::Name.into(), name)?;

        let resp = match self.request(req) {
            Ok(resp) => resp,
            Err(e) if e.is_errno(libc::ENODEV) => return Ok(None),
            Err(e) => return Err(e),
        };
        let info = self.parse_datapath_info(&resp)?;
        Ok(Some(self.datapath_handle(info.ifindex)))
    }

    /// Look up a datapath by interface index. Returns `None` if there
    /// is no such datapath.
    pub fn lookup_datapath_by_index(&self, ifindex: i32) -> Result<Option<Datapath>, NlError> {
        let req = self.datapath_request(REQUEST_FLAGS, OvsDpCmd::Get, ifindex);

        let resp = match self.request(req) {
            Ok(resp) => resp,
            Err(e) if e.is_errno(libc::ENODEV) => return Ok(None),
            Err(e) => return Err(e),
        };
        let info = self.parse_datapath_info(&resp)?;
        let handle = self.datapath_handle(ifindex);
        handle.check_ifindex(info.ifindex)?;
        Ok(Some(Datapath {
            handle,
            name: info.name,
        }))
    }

    /// All datapaths by name.
    pub fn enumerate_datapaths(&self) -> Result<HashMap<String, DatapathHandle>, NlError> {
        let mut res = HashMap::new();
        let req = self.datapath_request(DUMP_FLAGS, OvsDpCmd::Get, 0);
        self.request_multi(req, |msg| {
            let info = self.parse_datapath_info(msg)?;
            res.insert(info.name, self.datapath_handle(info.ifindex));
            Ok(())
        })?;
        Ok(res)
    }
}

impl DatapathHandle {
    /// Interface index of the datapath
    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }

    /// The client this handle belongs to
    pub fn dpif(&self) -> &Dpif {
        &self.dpif
    }

    /// Delete the datapath. Consumes the handle.
    pub fn delete(self) -> Result<(), NlError> {
        let req = self
            .dpif
            .datapath_request(REQUEST_FLAGS, OvsDpCmd::Del, self.ifindex);
        self.dpif.request(req)?;
        debug!("Deleted datapath with ifindex {}", self.ifindex);
        Ok(())
    }

    /// Start a request of `family` addressed to this datapath.
    pub(crate) fn request_builder(
        &self,
        flags: NlmF,
        family: u16,
        cmd: u8,
        version: u8,
    ) -> NlMsgBuilder {
        let mut req = NlMsgBuilder::new(flags, family);
        req.put_genlhdr(cmd, version);
        req.put_ovs_header(self.ifindex);
        req
    }

    /// Check that a response is about this datapath.
    pub(crate) fn check_ifindex(&self, ifindex: i32) -> Result<(), NlError> {
        if ifindex != self.ifindex {
            return Err(NlError::IfindexMismatch {
                expected: self.ifindex,
                found: ifindex,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        ovs::test::{mock_dpif, reply, DP_FAMILY, PID},
        socket::mock::{self, MockTransport},
        test::{setup, KERNEL_LOCK},
    };

    fn dp_reply(seq: u32, ifindex: i32, name: &'static str) -> Vec<u8> {
        reply(DP_FAMILY, OvsDpCmd::New.into(), ifindex, seq, |b| {
            b.put_string_attr(OvsDpAttr::Name.into(), name)
        })
    }

    #[test]
    fn test_create_datapath_request() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| dp_reply(seq, 12, "dp0"));
        let dpif = mock_dpif(&mock);

        let dp = dpif.create_datapath("dp0").unwrap();
        assert_eq!(dp.ifindex(), 12);

        let sent = mock.sent();
        let mut p = NlMsgParser::new(&sent[0]);
        let hdr = p.expect_nlmsghdr(DP_FAMILY).unwrap();
        assert_eq!(hdr.nl_flags, REQUEST_FLAGS);
        assert_eq!(
            p.expect_genlhdr(OvsDpCmd::New).unwrap().version,
            OVS_DATAPATH_VERSION
        );
        assert_eq!(p.take_ovs_header().unwrap().dp_ifindex, 0);
        let attrs = p.take_attrs().unwrap();
        assert_eq!(attrs.get_string(OvsDpAttr::Name).unwrap(), "dp0");
        assert_eq!(attrs.get_u32(OvsDpAttr::UpcallPid).unwrap(), 0);
        assert_eq!(attrs.get_u32(OvsDpAttr::UserFeatures).unwrap(), 3);
    }

    #[test]
    fn test_create_existing_datapath() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| mock::error(libc::EEXIST, seq, PID));
        let dpif = mock_dpif(&mock);
        assert!(dpif.create_datapath("dp0").unwrap_err().is_already_exists());
    }

    #[test]
    fn test_lookup_not_found() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| mock::error(libc::ENODEV, seq, PID));
        mock.push(|seq| mock::error(libc::ENODEV, seq, PID));
        mock.push(|seq| mock::error(libc::EPERM, seq, PID));
        let dpif = mock_dpif(&mock);

        assert_eq!(dpif.lookup_datapath("nope").unwrap(), None);
        assert_eq!(dpif.lookup_datapath_by_index(99).unwrap(), None);
        assert!(dpif.lookup_datapath("nope").unwrap_err().is_errno(libc::EPERM));
    }

    #[test]
    fn test_lookup_by_index_returns_name() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| {
            reply(DP_FAMILY, OvsDpCmd::Get.into(), 7, seq, |b| {
                b.put_string_attr(OvsDpAttr::Name.into(), "dp7")
            })
        });
        let dpif = mock_dpif(&mock);

        let dp = dpif.lookup_datapath_by_index(7).unwrap().unwrap();
        assert_eq!(dp.name, "dp7");
        assert_eq!(dp.handle.ifindex(), 7);
    }

    #[test]
    fn test_lookup_by_index_ifindex_mismatch() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| dp_reply(seq, 8, "dp8"));
        let dpif = mock_dpif(&mock);

        assert!(matches!(
            dpif.lookup_datapath_by_index(7),
            Err(NlError::IfindexMismatch {
                expected: 7,
                found: 8
            })
        ));
    }

    #[test]
    fn test_enumerate_datapaths() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| [dp_reply(seq, 3, "a"), dp_reply(seq, 4, "b")].concat());
        mock.push(|seq| mock::done(seq, PID));
        let dpif = mock_dpif(&mock);

        let dps = dpif.enumerate_datapaths().unwrap();
        assert_eq!(dps.len(), 2);
        assert_eq!(dps["a"].ifindex(), 3);
        assert_eq!(dps["b"].ifindex(), 4);

        let sent = mock.sent();
        let hdr = NlMsgParser::new(&sent[0]).take_nlmsghdr().unwrap();
        assert_eq!(hdr.nl_flags, DUMP_FLAGS);
    }

    #[test]
    fn test_delete_datapath() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| dp_reply(seq, 12, "dp0"));
        mock.push(|seq| dp_reply(seq, 12, "dp0"));
        let dpif = mock_dpif(&mock);

        let dp = dpif.lookup_datapath("dp0").unwrap().unwrap();
        dp.delete().unwrap();

        let sent = mock.sent();
        let mut p = NlMsgParser::new(&sent[1]);
        p.expect_nlmsghdr(DP_FAMILY).unwrap();
        p.expect_genlhdr(OvsDpCmd::Del).unwrap();
        assert_eq!(p.take_ovs_header().unwrap().dp_ifindex, 12);
    }

    #[test]
    #[ignore]
    fn real_datapath_lifecycle() {
        setup();
        let _lock = KERNEL_LOCK.lock();

        let dpif = Dpif::open().unwrap();
        if let Some(dp) = dpif.lookup_datapath("test1").unwrap() {
            dp.delete().unwrap();
        }

        let dp = dpif.create_datapath("test1").unwrap();
        let found = dpif.lookup_datapath("test1").unwrap().unwrap();
        assert_eq!(found, dp);
        let by_index = dpif.lookup_datapath_by_index(dp.ifindex()).unwrap().unwrap();
        assert_eq!(by_index.name, "test1");
        assert!(dpif.enumerate_datapaths().unwrap().contains_key("test1"));
        assert!(dpif.create_datapath("test1").unwrap_err().is_already_exists());

        dp.delete().unwrap();
        assert!(!dpif.enumerate_datapaths().unwrap().contains_key("test1"));
        assert_eq!(dpif.lookup_datapath("test1").unwrap(), None);
    }
}
