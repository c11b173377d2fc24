//! Network address types.

use std::{
    fmt,
    hash::{Hash, Hasher},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::{core::id::PubKey, error::AddrError};

/// A reachable endpoint: IP, port and, optionally, the identity expected to answer there.
///
/// Two addresses are equal when their IP and port match, the identity is informational.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct NetAddress {
    #[serde(rename = "IP")]
    pub ip: IpAddr,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PubKey>,
}

impl NetAddress {
    /// Creates an address without an identity.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port, id: None }
    }

    /// Attaches the identity expected at this address.
    pub fn with_id(mut self, id: PubKey) -> Self {
        self.id = Some(id);
        self
    }

    /// Returns the socket address to dial.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Parses a comma separated list, skipping blank entries.
    pub fn parse_list(list: &str) -> Result<Vec<Self>, AddrError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }

    /// Returns `true` for loopback addresses and the `0.0.0.0/8` block.
    pub fn is_local(&self) -> bool {
        if let Some(v4) = self.ipv4() {
            return v4.is_loopback() || v4.octets()[0] == 0;
        }

        self.ip.is_loopback()
    }

    /// Returns `true` if the address could ever be dialed.
    pub fn is_valid(&self) -> bool {
        if self.rfc3849() {
            return false;
        }

        match self.ipv4() {
            Some(v4) => !(v4.is_unspecified() || v4.is_broadcast()),
            None => !self.ip.is_unspecified(),
        }
    }

    /// Returns `true` if the address is reachable from the public internet.
    pub fn is_routable(&self) -> bool {
        self.is_valid()
            && !(self.rfc1918()
                || self.rfc3927()
                || self.rfc4862()
                || self.rfc4193()
                || self.rfc4843()
                || self.is_local())
    }

    /// Collapses the address to the network group it belongs to.
    ///
    /// Addresses in the same group compete for the same address book buckets, this bounds how
    /// much of the book a single operator can occupy.
    pub fn group_key(&self, strict: bool) -> String {
        if strict && self.is_local() {
            return "local".to_string();
        }
        if strict && !self.is_routable() {
            return "unroutable".to_string();
        }

        if let Some(v4) = self.ipv4() {
            return v4_group(v4.octets());
        }

        let v6 = match self.ip {
            IpAddr::V6(v6) => v6,
            // Covered by the `ipv4` branch above.
            IpAddr::V4(v4) => return v4_group(v4.octets()),
        };
        let octets = v6.octets();

        // Addresses embedding an IPv4 address are grouped by the embedded address.
        if self.rfc6145() || self.rfc6052() {
            return v4_group([octets[12], octets[13], octets[14], octets[15]]);
        }
        if self.rfc3964() {
            return v4_group([octets[2], octets[3], octets[4], octets[5]]);
        }
        if self.rfc4380() {
            // Teredo tunnels carry the client address XOR 0xff in the last four bytes.
            return v4_group([
                octets[12] ^ 0xff,
                octets[13] ^ 0xff,
                octets[14] ^ 0xff,
                octets[15] ^ 0xff,
            ]);
        }

        // Hurricane Electric hands out /36s rather than /32s.
        let bits = if self.he_net() { 36 } else { 32 };
        let masked = u128::from(v6) & (u128::MAX << (128 - bits));

        format!("{}/{bits}", Ipv6Addr::from(masked))
    }

    // Returns the IPv4 form of the address, including IPv4-mapped IPv6 addresses.
    fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(v6) => v6.to_ipv4_mapped(),
        }
    }

    fn segments(&self) -> Option<[u16; 8]> {
        match self.ip {
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none() => Some(v6.segments()),
            _ => None,
        }
    }

    // RFC1918: 10/8, 172.16/12, 192.168/16.
    fn rfc1918(&self) -> bool {
        self.ipv4().map_or(false, |v4| v4.is_private())
    }

    // RFC3927: 169.254/16.
    fn rfc3927(&self) -> bool {
        self.ipv4().map_or(false, |v4| v4.is_link_local())
    }

    // RFC3849: 2001:db8::/32.
    fn rfc3849(&self) -> bool {
        self.segments()
            .map_or(false, |s| s[0] == 0x2001 && s[1] == 0x0db8)
    }

    // RFC3964: 2002::/16.
    fn rfc3964(&self) -> bool {
        self.segments().map_or(false, |s| s[0] == 0x2002)
    }

    // RFC4193: fc00::/7.
    fn rfc4193(&self) -> bool {
        self.segments().map_or(false, |s| s[0] & 0xfe00 == 0xfc00)
    }

    // RFC4380: 2001::/32.
    fn rfc4380(&self) -> bool {
        self.segments()
            .map_or(false, |s| s[0] == 0x2001 && s[1] == 0x0000)
    }

    // RFC4843: 2001:10::/28.
    fn rfc4843(&self) -> bool {
        self.segments()
            .map_or(false, |s| s[0] == 0x2001 && s[1] & 0xfff0 == 0x0010)
    }

    // RFC4862: fe80::/64.
    fn rfc4862(&self) -> bool {
        self.segments()
            .map_or(false, |s| s[0] == 0xfe80 && s[1..4] == [0, 0, 0])
    }

    // RFC6052: 64:ff9b::/96.
    fn rfc6052(&self) -> bool {
        self.segments()
            .map_or(false, |s| s[0] == 0x0064 && s[1] == 0xff9b && s[2..6] == [0; 4])
    }

    // RFC6145: ::ffff:0:0:0/96.
    fn rfc6145(&self) -> bool {
        self.segments()
            .map_or(false, |s| s[0..4] == [0; 4] && s[4] == 0xffff && s[5] == 0)
    }

    // 2001:470::/32.
    fn he_net(&self) -> bool {
        self.segments()
            .map_or(false, |s| s[0] == 0x2001 && s[1] == 0x0470)
    }
}

fn v4_group(octets: [u8; 4]) -> String {
    format!("{}.{}.0.0/16", octets[0], octets[1])
}

impl PartialEq for NetAddress {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for NetAddress {}

impl Hash for NetAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl FromStr for NetAddress {
    type Err = AddrError;

    /// Accepts `ip:port`, optionally prefixed with `<hex-pubkey>@` and/or `tcp://`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("tcp://").unwrap_or(s);

        let (id, host) = match s.split_once('@') {
            Some((id, host)) => {
                let id = id
                    .parse::<PubKey>()
                    .map_err(|_| AddrError::InvalidId(id.to_string()))?;
                (Some(id), host)
            }
            None => (None, s),
        };

        let addr = host
            .parse::<SocketAddr>()
            .map_err(|_| AddrError::Invalid(s.to_string()))?;

        Ok(Self {
            ip: addr.ip(),
            port: addr.port(),
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NetAddress {
        s.parse().unwrap()
    }

    #[test]
    fn parse() {
        let a = addr("1.2.3.4:4001");
        assert_eq!(a.ip, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(a.port, 4001);
        assert!(a.id.is_none());

        let a = addr("tcp://0.0.0.0:46656");
        assert_eq!(a.port, 46656);

        let a = addr("[2001:db8::1]:80");
        assert_eq!(a.port, 80);
    }

    #[test]
    fn parse_with_id() {
        let id = PubKey::from_u16(42);
        let a = addr(&format!("{id}@10.0.0.1:26656"));
        assert_eq!(a.id, Some(id));
        assert_eq!(a.to_string(), "10.0.0.1:26656");

        assert!(matches!(
            "nothex@10.0.0.1:1".parse::<NetAddress>(),
            Err(AddrError::InvalidId(_))
        ));
    }

    #[test]
    fn parse_invalid() {
        assert!("1.2.3.4".parse::<NetAddress>().is_err());
        assert!("example.com:80".parse::<NetAddress>().is_err());
        assert!("".parse::<NetAddress>().is_err());
    }

    #[test]
    fn parse_list() {
        let list = NetAddress::parse_list("1.2.3.4:4001, 5.6.7.8:4001,,").unwrap();
        assert_eq!(list, vec![addr("1.2.3.4:4001"), addr("5.6.7.8:4001")]);

        assert!(NetAddress::parse_list("").unwrap().is_empty());
        assert!(NetAddress::parse_list("1.2.3.4:1,bogus").is_err());
    }

    #[test]
    fn equality_ignores_id() {
        let a = addr("1.2.3.4:4001");
        let b = addr("1.2.3.4:4001").with_id(PubKey::from_u16(1));
        assert_eq!(a, b);
        assert_ne!(a, addr("1.2.3.4:4002"));
    }

    #[test]
    fn routability() {
        assert!(addr("8.8.8.8:1").is_routable());
        assert!(!addr("10.1.2.3:1").is_routable());
        assert!(!addr("192.168.1.1:1").is_routable());
        assert!(!addr("169.254.0.1:1").is_routable());
        assert!(!addr("127.0.0.1:1").is_routable());
        assert!(!addr("0.0.0.0:1").is_valid());
        assert!(!addr("255.255.255.255:1").is_valid());
        assert!(!addr("[2001:db8::1]:1").is_valid());
        assert!(!addr("[fe80::1]:1").is_routable());
        assert!(!addr("[fc00::1]:1").is_routable());
        assert!(addr("[2a00:1450::1]:1").is_routable());
    }

    #[test]
    fn local() {
        assert!(addr("127.0.0.1:1").is_local());
        assert!(addr("0.1.2.3:1").is_local());
        assert!(addr("[::1]:1").is_local());
        assert!(!addr("8.8.8.8:1").is_local());
    }

    #[test]
    fn group_key_ipv4() {
        assert_eq!(addr("1.2.3.4:1").group_key(false), "1.2.0.0/16");
        assert_eq!(addr("1.2.200.9:1").group_key(true), "1.2.0.0/16");
        assert_eq!(addr("[::ffff:1.2.3.4]:1").group_key(false), "1.2.0.0/16");
    }

    #[test]
    fn group_key_strict_sentinels() {
        assert_eq!(addr("127.0.0.1:1").group_key(true), "local");
        assert_eq!(addr("10.0.0.1:1").group_key(true), "unroutable");
        // Without strict checking, private ranges group like any other.
        assert_eq!(addr("127.0.0.1:1").group_key(false), "127.0.0.0/16");
    }

    #[test]
    fn group_key_embedded_ipv4() {
        // 6to4.
        assert_eq!(addr("[2002:0102:0304::1]:1").group_key(false), "1.2.0.0/16");
        // NAT64.
        assert_eq!(addr("[64:ff9b::0102:0304]:1").group_key(false), "1.2.0.0/16");
        // Teredo, the client address is obfuscated.
        assert_eq!(
            addr("[2001:0:0:0:0:0:fefd:fcfb]:1").group_key(false),
            "1.2.0.0/16"
        );
    }

    #[test]
    fn group_key_ipv6() {
        assert_eq!(
            addr("[2a00:1450:4001:81b::200e]:1").group_key(false),
            "2a00:1450::/32"
        );
        assert_eq!(
            addr("[2001:470:1fff:ffff::1]:1").group_key(false),
            "2001:470:1000::/36"
        );
    }
}
