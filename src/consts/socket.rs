impl_var!(
    /// General address families for sockets
    pub AddrFamily, libc::c_int,
    Inet => libc::AF_INET,
    Netlink => libc::AF_NETLINK
);

impl_var!(
    /// Values for `nl_family` in `NlSocket`
    pub NlFamily, libc::c_int,
    Route => libc::NETLINK_ROUTE,
    Generic => libc::NETLINK_GENERIC
);
