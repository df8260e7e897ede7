//! Small helpers shared by the socket and protocol layers.

/// Default number of bytes read from a socket at once. Can be
/// overridden at compile time with `OVSDP_RECV_BUFFER_LEN`.
pub fn default_recv_buffer_len() -> usize {
    option_env!("OVSDP_RECV_BUFFER_LEN")
        .and_then(|len| len.parse().ok())
        .unwrap_or(65536)
}

/// Returns true if every byte of `buf` equals `byte`.
pub fn all_bytes(buf: &[u8], byte: u8) -> bool {
    buf.iter().all(|b| *b == byte)
}

/// A set of netlink multicast group IDs to join when binding a
/// socket
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Groups(Vec<u32>);

impl Groups {
    /// No groups
    pub fn empty() -> Self {
        Groups(Vec::new())
    }

    /// Groups from a list of group IDs as returned by the generic
    /// netlink control family
    pub fn new_groups(groups: &[u32]) -> Self {
        Groups(groups.iter().copied().filter(|g| *g != 0).collect())
    }

    /// Whether no groups are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Group IDs in the form expected by `NETLINK_ADD_MEMBERSHIP`
    pub fn as_groups(&self) -> Vec<u32> {
        self.0.clone()
    }
}
