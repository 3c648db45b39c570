//! Mesh addressing: deterministic station identifiers
//!
//! Every station derives its mesh address from its callsign: the callsign is
//! normalized (trimmed, uppercased), hashed, and the first 8 bytes of the
//! digest become the address. The same callsign always yields the same
//! address, so any station can compute the address of any other station
//! without a directory lookup. Addresses render in a link-local style
//! (`fe80::xxxx:xxxx:xxxx:xxxx`) for logs and wire envelopes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A fixed-width mesh address derived from a callsign.
///
/// Immutable once computed. Used as the routing key throughout the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshAddress([u8; 8]);

impl MeshAddress {
    /// The all-stations broadcast address.
    pub const BROADCAST: MeshAddress = MeshAddress([0xff; 8]);

    /// Derive the address for a callsign.
    ///
    /// Callsigns are case-insensitive and surrounding whitespace is ignored,
    /// so `" ka1abc "` and `"KA1ABC"` map to the same address.
    pub fn from_callsign(callsign: &str) -> Self {
        let normalized = callsign.trim().to_ascii_uppercase();
        let digest = Sha256::digest(normalized.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        MeshAddress(bytes)
    }

    /// Raw address bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Whether this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "fe80::{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// Parse the `fe80::xxxx:xxxx:xxxx:xxxx` form produced by `Display`.
impl FromStr for MeshAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("fe80::")
            .ok_or_else(|| format!("not a mesh address: {s}"))?;
        let groups: Vec<&str> = rest.split(':').collect();
        if groups.len() != 4 {
            return Err(format!("expected 4 address groups, got {}", groups.len()));
        }
        let mut bytes = [0u8; 8];
        for (i, group) in groups.iter().enumerate() {
            let value = u16::from_str_radix(group, 16)
                .map_err(|_| format!("bad address group: {group}"))?;
            bytes[i * 2] = (value >> 8) as u8;
            bytes[i * 2 + 1] = (value & 0xff) as u8;
        }
        Ok(MeshAddress(bytes))
    }
}

// Serialized as the display string so wire envelopes stay readable JSON.
impl Serialize for MeshAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MeshAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_callsign_same_address() {
        let a = MeshAddress::from_callsign("KA1ABC");
        let b = MeshAddress::from_callsign("KA1ABC");
        assert_eq!(a, b);
    }

    #[test]
    fn test_normalization() {
        let a = MeshAddress::from_callsign("  ka1abc ");
        let b = MeshAddress::from_callsign("KA1ABC");
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_callsigns_differ() {
        let a = MeshAddress::from_callsign("KA1ABC");
        let b = MeshAddress::from_callsign("W2XYZ");
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_round_trip() {
        let a = MeshAddress::from_callsign("N0CALL");
        let text = a.to_string();
        assert!(text.starts_with("fe80::"));
        let parsed: MeshAddress = text.parse().unwrap();
        assert_eq!(a, parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not-an-address".parse::<MeshAddress>().is_err());
        assert!("fe80::zzzz:0000:0000:0000".parse::<MeshAddress>().is_err());
        assert!("fe80::0000:0000".parse::<MeshAddress>().is_err());
    }

    #[test]
    fn test_broadcast() {
        assert!(MeshAddress::BROADCAST.is_broadcast());
        assert!(!MeshAddress::from_callsign("KA1ABC").is_broadcast());
    }

    #[test]
    fn test_serde_as_string() {
        let a = MeshAddress::from_callsign("KA1ABC");
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.starts_with("\"fe80::"));
        let back: MeshAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }
}
