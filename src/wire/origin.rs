use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use anyhow::anyhow;

use crate::wire::ProtocolVersion;

/// The address a log message claims to originate from. `Unspecified` is replaced by the local
///  address of the outbound connection when the frame is encoded.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OriginAddress {
    Unspecified,
    Literal(IpAddr),
}

impl OriginAddress {
    /// The address as it goes into a frame header: always IPv4 for protocol versions 1 and 2,
    ///  always IPv6 (with IPv4 addresses mapped to `::ffff:a.b.c.d`) for version 3.
    pub fn wire_addr(&self, version: ProtocolVersion, local_addr: IpAddr) -> IpAddr {
        let addr = match self {
            OriginAddress::Unspecified => local_addr,
            OriginAddress::Literal(addr) => *addr,
        };

        if version.has_ipv6_origin() {
            IpAddr::V6(as_ipv6(addr))
        }
        else {
            // v1 / v2 headers have room for IPv4 only: fall back to the local address
            let v4 = as_ipv4(addr)
                .or_else(|| as_ipv4(local_addr))
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            IpAddr::V4(v4)
        }
    }
}

fn as_ipv6(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn as_ipv4(addr: IpAddr) -> Option<Ipv4Addr> {
    match addr {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

impl From<IpAddr> for OriginAddress {
    fn from(addr: IpAddr) -> Self {
        OriginAddress::Literal(addr)
    }
}

/// `auto` means [OriginAddress::Unspecified], anything else must be a literal IP address
impl FromStr for OriginAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(OriginAddress::Unspecified);
        }
        s.parse::<IpAddr>()
            .map(OriginAddress::Literal)
            .map_err(|e| anyhow!("invalid origin address {:?}: {}", s, e))
    }
}

impl Display for OriginAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OriginAddress::Unspecified => write!(f, "auto"),
            OriginAddress::Literal(addr) => write!(f, "{}", addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::v1_literal_v4(1, "10.1.2.3", "192.168.0.1", "10.1.2.3")]
    #[case::v2_unspecified(2, "auto", "192.168.0.1", "192.168.0.1")]
    #[case::v1_v6_falls_back_to_local(1, "fe80::1", "192.168.0.1", "192.168.0.1")]
    #[case::v1_mapped_v6(1, "::ffff:10.0.0.7", "192.168.0.1", "10.0.0.7")]
    #[case::v1_no_v4_anywhere(1, "fe80::1", "fe80::2", "0.0.0.0")]
    #[case::v3_v4_is_mapped(3, "10.1.2.3", "192.168.0.1", "::ffff:10.1.2.3")]
    #[case::v3_v6(3, "2001:db8::5", "192.168.0.1", "2001:db8::5")]
    #[case::v3_unspecified(3, "auto", "192.168.0.1", "::ffff:192.168.0.1")]
    fn test_wire_addr(#[case] version: u16, #[case] origin: &str, #[case] local: &str, #[case] expected: &str) {
        let version = ProtocolVersion::try_from_raw(version).unwrap();
        let origin: OriginAddress = origin.parse().unwrap();
        let local: IpAddr = local.parse().unwrap();
        let expected: IpAddr = expected.parse().unwrap();
        assert_eq!(origin.wire_addr(version, local), expected);
    }

    #[test]
    fn test_parse_invalid() {
        assert!("not-an-ip".parse::<OriginAddress>().is_err());
        assert_eq!("AUTO".parse::<OriginAddress>().unwrap(), OriginAddress::Unspecified);
        assert_eq!(OriginAddress::Literal("1.2.3.4".parse().unwrap()).to_string(), "1.2.3.4");
    }
}
