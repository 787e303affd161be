//! Hardware and IP address value types.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::TypesError;

// ============================================================================
// MAC addresses
// ============================================================================

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Create from raw octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = TypesError;

    /// Parse `aa:bb:cc:dd:ee:ff` (or `-` separated).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TypesError::InvalidMac(s.to_string());

        // One separator throughout.
        let sep = match s.as_bytes().get(2) {
            Some(b':') => ':',
            Some(b'-') => '-',
            _ => return Err(invalid()),
        };

        let mut octets = [0u8; 6];
        let mut parts = s.split(sep);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

// ============================================================================
// Interface addresses
// ============================================================================

/// An interface address with its prefix length (e.g. `10.1.2.3/24`).
///
/// Unlike a route prefix, the host bits are kept: this is the address that
/// gets assigned to the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpCidr {
    /// Interface address.
    pub address: IpAddr,

    /// Prefix length (e.g., 24 for /24).
    pub prefix_len: u8,
}

impl IpCidr {
    /// Create a new interface address.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, TypesError> {
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(TypesError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// IP family as used in CNI results ("4" or "6").
    pub fn family(&self) -> &'static str {
        match self.address {
            IpAddr::V4(_) => "4",
            IpAddr::V6(_) => "6",
        }
    }
}

impl FromStr for IpCidr {
    type Err = TypesError;

    /// Parse from CIDR notation (e.g., "10.1.2.3/24").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(TypesError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| TypesError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| TypesError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

// Both types travel as strings on the wire.

macro_rules! string_serde {
    ($ty:ty, $expecting:literal) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse()
                    .map_err(|e| de::Error::custom(format!(concat!($expecting, ": {}"), e)))
            }
        }
    };
}

string_serde!(MacAddr, "expected a MAC address");
string_serde!(IpCidr, "expected an address in CIDR notation");
