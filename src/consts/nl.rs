use bitflags::bitflags;

impl_var!(
    /// Values for `nl_type` in [`Nlmsghdr`][crate::nl::Nlmsghdr]
    /// reserved by the netlink protocol itself
    pub Nlmsg, u16,
    Noop => libc::NLMSG_NOOP as u16,
    Error => libc::NLMSG_ERROR as u16,
    Done => libc::NLMSG_DONE as u16,
    Overrun => libc::NLMSG_OVERRUN as u16
);

impl_var!(
    /// Statically assigned generic netlink family IDs
    pub GenlId, u16,
    Ctrl => libc::GENL_ID_CTRL as u16
);

bitflags! {
    /// Values for `nl_flags` in [`Nlmsghdr`][crate::nl::Nlmsghdr]
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct NlmF: u16 {
        /// This flag is required for all kernel requests
        const REQUEST = libc::NLM_F_REQUEST as u16;
        #[allow(missing_docs)]
        const MULTI = libc::NLM_F_MULTI as u16;
        #[allow(missing_docs)]
        const ACK = libc::NLM_F_ACK as u16;
        /// Echo the request back, which forces a reply for commands
        /// that are otherwise silent
        const ECHO = libc::NLM_F_ECHO as u16;
        #[allow(missing_docs)]
        const DUMP_INTR = libc::NLM_F_DUMP_INTR as u16;
        #[allow(missing_docs)]
        const ROOT = libc::NLM_F_ROOT as u16;
        #[allow(missing_docs)]
        const MATCH = libc::NLM_F_MATCH as u16;
        #[allow(missing_docs)]
        const ATOMIC = libc::NLM_F_ATOMIC as u16;
        #[allow(missing_docs)]
        const DUMP = libc::NLM_F_DUMP as u16;
        #[allow(missing_docs)]
        const REPLACE = libc::NLM_F_REPLACE as u16;
        #[allow(missing_docs)]
        const EXCL = libc::NLM_F_EXCL as u16;
        #[allow(missing_docs)]
        const CREATE = libc::NLM_F_CREATE as u16;
        #[allow(missing_docs)]
        const APPEND = libc::NLM_F_APPEND as u16;
    }
}

/// Flags for a request expecting exactly one reply
pub const REQUEST_FLAGS: NlmF = NlmF::REQUEST.union(NlmF::ECHO);

/// Flags for a request expecting a `DONE` terminated dump
pub const DUMP_FLAGS: NlmF = NlmF::REQUEST.union(NlmF::DUMP);
