//! Transport selector parsed from the conversation script.

use std::fmt;

/// IPPROTO number meaning "raw" — the kernel is handed a complete IP packet.
pub const PROTO_RAW: u8 = 255;

/// How bytes reach the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Tls,
    Udp,
    /// Raw L3 socket with the given IP protocol number. `IP_HDRINCL` is
    /// cleared (the kernel writes the IP header) unless the number is
    /// [`PROTO_RAW`].
    RawL3(u8),
    /// Link-layer raw socket bound to a named interface.
    RawL2,
    Unix,
}

impl Transport {
    /// Parse the script's transport string: `tcp`, `tls`, `udp`, `unix`,
    /// `raw-l2`, or `raw-l3:<name-or-number>`.
    pub fn parse(s: &str) -> Result<Transport, String> {
        let s = s.to_ascii_lowercase();
        match s.as_str() {
            "tcp" => Ok(Transport::Tcp),
            "tls" => Ok(Transport::Tls),
            "udp" => Ok(Transport::Udp),
            "unix" => Ok(Transport::Unix),
            "raw-l2" => Ok(Transport::RawL2),
            _ => match s.strip_prefix("raw-l3:") {
                Some(proto) => proto_number(proto)
                    .map(Transport::RawL3)
                    .ok_or_else(|| format!("unknown L3 protocol '{proto}'")),
                None => Err(format!("unknown transport '{s}'")),
            },
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Tls => write!(f, "tls"),
            Transport::Udp => write!(f, "udp"),
            Transport::RawL3(p) => write!(f, "raw-l3:{p}"),
            Transport::RawL2 => write!(f, "raw-l2"),
            Transport::Unix => write!(f, "unix"),
        }
    }
}

/// IP protocol numbers accepted by name on the raw-L3 path.
fn proto_number(name: &str) -> Option<u8> {
    let n = match name {
        "icmp" => 1,
        "igmp" => 2,
        "tcp" => 6,
        "udp" => 17,
        "gre" => 47,
        "esp" => 50,
        "ah" => 51,
        "icmpv6" => 58,
        "ospf" => 89,
        "sctp" => 132,
        "raw" => PROTO_RAW,
        _ => return name.parse::<u8>().ok(),
    };
    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_transports() {
        assert_eq!(Transport::parse("tcp").unwrap(), Transport::Tcp);
        assert_eq!(Transport::parse("TLS").unwrap(), Transport::Tls);
        assert_eq!(Transport::parse("udp").unwrap(), Transport::Udp);
        assert_eq!(Transport::parse("unix").unwrap(), Transport::Unix);
        assert_eq!(Transport::parse("raw-l2").unwrap(), Transport::RawL2);
    }

    #[test]
    fn test_parse_raw_l3_by_name_and_number() {
        assert_eq!(Transport::parse("raw-l3:icmp").unwrap(), Transport::RawL3(1));
        assert_eq!(Transport::parse("raw-l3:ospf").unwrap(), Transport::RawL3(89));
        assert_eq!(Transport::parse("raw-l3:47").unwrap(), Transport::RawL3(47));
        assert_eq!(
            Transport::parse("raw-l3:raw").unwrap(),
            Transport::RawL3(PROTO_RAW)
        );
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(Transport::parse("sctp").is_err());
        assert!(Transport::parse("raw-l3:bogus").is_err());
        assert!(Transport::parse("raw-l3:999").is_err());
    }
}
