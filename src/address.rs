//! Endpoint addresses and the destinations that resolve into them.

use std::{fmt, net::SocketAddr};

use derive_more::Display;
use typed_builder::TypedBuilder;

/// A host/port pair identifying what a [`crate::ConnectionPool`] connects to. Distinct
/// from [`AddressList`]: a `Destination` is what the caller asks for, a list is what resolving
/// it produces.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Display)]
#[display("{host}:{port}")]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// An ordered sequence of resolved socket addresses for one [`Destination`]. Immutable once
/// produced; the plaintext stream's connect walks it head-to-tail and never mutates it (§3,
/// "Endpoint address list").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressList {
    addrs: Vec<SocketAddr>,
}

impl AddressList {
    /// Builds a list from resolved addresses, sorting IPv4 entries before IPv6 entries (a
    /// stable sort, so relative order within a family is preserved) to match the original's
    /// stated preference for IPv4.
    pub fn from_resolved(mut addrs: Vec<SocketAddr>) -> Self {
        addrs.sort_by_key(|addr| u8::from(!addr.is_ipv4()));
        Self { addrs }
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.addrs.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }
}

impl fmt::Display for AddressList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.addrs.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", "))
    }
}

/// Whether a destination should be connected to in the clear or through the TLS stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Plain,
    Tls,
}

/// The full identity of a request: which pool group it belongs to, where it connects, under
/// which scheme, and how urgently.
#[derive(Clone, Debug, TypedBuilder)]
pub struct ConnectSpec {
    /// Unique per origin+scheme+purpose; this is the pool's group key (§3, "Group").
    #[builder(setter(into))]
    pub group: String,
    pub destination: Destination,
    #[builder(default = Scheme::Tls)]
    pub scheme: Scheme,
    /// Higher is more urgent (§3, "Connection handle").
    #[builder(default = 0)]
    pub priority: i32,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn address_list_prefers_ipv4_stably() {
        let v6a: SocketAddr = (Ipv6Addr::LOCALHOST, 1).into();
        let v4a: SocketAddr = (Ipv4Addr::new(10, 0, 0, 1), 1).into();
        let v4b: SocketAddr = (Ipv4Addr::new(10, 0, 0, 2), 1).into();
        let list = AddressList::from_resolved(vec![v6a, v4a, v4b]);
        let addrs: Vec<_> = list.iter().collect();
        assert_eq!(addrs, vec![v4a, v4b, v6a]);
    }
}
