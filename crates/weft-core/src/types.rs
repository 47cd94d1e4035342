//! Shared protocol identifiers and time conversions.
//!
//! Newtypes over the raw integer widths the Matter data model uses, plus
//! the Matter epoch (seconds since 2000-01-01 00:00:00 UTC).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// 64-bit fabric identifier shared by all members of a fabric.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FabricId(pub u64);

/// 64-bit operational node identifier, unique within a fabric.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// Index of a fabric on a node (1-based, u8 on the wire).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FabricIndex(pub u8);

/// CSA-assigned vendor identifier.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VendorId(pub u16);

/// Vendor-scoped product identifier.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProductId(pub u16);

/// Endpoint number within a node; endpoint 0 is the root.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointNumber(pub u16);

/// Cluster identifier (u32; standard clusters occupy the low 16 bits).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(pub u32);

/// Attribute identifier within a cluster.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId(pub u32);

/// Command identifier within a cluster.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u32);

/// Event identifier within a cluster.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u32);

/// Device type identifier from the device library.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeviceTypeId(pub u32);

/// Local secure-session identifier (non-zero u16).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub u16);

/// Per-cluster data version, bumped on every attribute change.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DataVersion(pub u32);

impl DataVersion {
    /// Advance to the next version (wrapping).
    pub fn bump(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }
}

impl ClusterId {
    /// Diagnostics clusters occupy 0x30..=0x3F in the standard space.
    pub fn is_diagnostics(&self) -> bool {
        (0x30..=0x3F).contains(&self.0)
    }
}

impl EndpointNumber {
    /// The root endpoint of every node.
    pub const ROOT: EndpointNumber = EndpointNumber(0);
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl std::fmt::Display for FabricId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

// =============================================================================
// CASE AUTHENTICATED TAGS
// =============================================================================

/// CASE Authenticated Tag: identifier (high 16 bits) plus version (low 16
/// bits). The version must be non-zero for the tag to be valid.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CaseAuthenticatedTag(pub u32);

impl CaseAuthenticatedTag {
    /// At most this many CATs may appear in a NOC subject.
    pub const MAX_PER_NOC: usize = 3;

    pub fn identifier(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn version(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// A CAT is valid only when its version field is non-zero.
    pub fn is_valid(&self) -> bool {
        self.version() != 0
    }
}

/// Validate a CAT list destined for a NOC subject: at most three entries,
/// every version non-zero, identifiers distinct.
pub fn validate_case_authenticated_tags(tags: &[CaseAuthenticatedTag]) -> bool {
    if tags.len() > CaseAuthenticatedTag::MAX_PER_NOC {
        return false;
    }
    if tags.iter().any(|t| !t.is_valid()) {
        return false;
    }
    for (i, a) in tags.iter().enumerate() {
        if tags[i + 1..].iter().any(|b| b.identifier() == a.identifier()) {
            return false;
        }
    }
    true
}

// =============================================================================
// PEER ADDRESSING
// =============================================================================

/// Transport kind for a peer address.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Ble,
}

/// Where a peer can be reached.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub addr: SocketAddr,
    pub kind: TransportKind,
}

impl PeerAddress {
    pub fn udp(addr: SocketAddr) -> Self {
        Self {
            addr,
            kind: TransportKind::Udp,
        }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:?}", self.addr, self.kind)
    }
}

// =============================================================================
// MATTER EPOCH TIME
// =============================================================================

/// Offset of the Matter epoch (2000-01-01 00:00:00 UTC) from the Unix epoch.
pub const MATTER_EPOCH_OFFSET_SECS: u64 = 946_684_800;

/// Unix seconds for 9999-12-31 23:59:59 UTC, the "never expires" sentinel.
pub const NO_EXPIRY_UNIX_SECS: u64 = 253_402_300_799;

/// Seconds since the Matter epoch. The value 0 doubles as the
/// "never expires" sentinel in certificate validity fields.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatterEpochSecs(pub u32);

impl MatterEpochSecs {
    /// Convert Unix seconds to Matter epoch seconds. The 9999-12-31
    /// sentinel and anything past the representable range map to 0.
    pub fn from_unix(unix: u64) -> Self {
        if unix >= NO_EXPIRY_UNIX_SECS {
            return Self(0);
        }
        let secs = unix.saturating_sub(MATTER_EPOCH_OFFSET_SECS);
        if secs > u32::MAX as u64 {
            Self(0)
        } else {
            Self(secs as u32)
        }
    }

    /// Convert back to Unix seconds; 0 maps to the 9999-12-31 sentinel.
    pub fn to_unix(self) -> u64 {
        if self.0 == 0 {
            NO_EXPIRY_UNIX_SECS
        } else {
            self.0 as u64 + MATTER_EPOCH_OFFSET_SECS
        }
    }

    /// Current time as Matter epoch seconds.
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self::from_unix(unix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cat_validation() {
        let good = CaseAuthenticatedTag(0x0001_0002);
        assert!(good.is_valid());
        assert_eq!(good.identifier(), 1);
        assert_eq!(good.version(), 2);

        let zero_version = CaseAuthenticatedTag(0x0001_0000);
        assert!(!zero_version.is_valid());

        assert!(validate_case_authenticated_tags(&[good]));
        assert!(!validate_case_authenticated_tags(&[zero_version]));
        // Duplicate identifiers with different versions are rejected.
        assert!(!validate_case_authenticated_tags(&[
            CaseAuthenticatedTag(0x0001_0001),
            CaseAuthenticatedTag(0x0001_0002),
        ]));
        // More than three tags are rejected.
        assert!(!validate_case_authenticated_tags(&[
            CaseAuthenticatedTag(0x0001_0001),
            CaseAuthenticatedTag(0x0002_0001),
            CaseAuthenticatedTag(0x0003_0001),
            CaseAuthenticatedTag(0x0004_0001),
        ]));
    }

    #[test]
    fn test_matter_epoch_roundtrip() {
        let unix = 1_700_000_000u64;
        let epoch = MatterEpochSecs::from_unix(unix);
        assert_eq!(epoch.0 as u64, unix - MATTER_EPOCH_OFFSET_SECS);
        assert_eq!(epoch.to_unix(), unix);
    }

    #[test]
    fn test_matter_epoch_sentinel() {
        let never = MatterEpochSecs::from_unix(NO_EXPIRY_UNIX_SECS);
        assert_eq!(never.0, 0);
        assert_eq!(never.to_unix(), NO_EXPIRY_UNIX_SECS);
    }

    #[test]
    fn test_diagnostics_cluster_range() {
        assert!(ClusterId(0x36).is_diagnostics());
        assert!(ClusterId(0x30).is_diagnostics());
        assert!(!ClusterId(0x28).is_diagnostics());
        assert!(!ClusterId(0x06).is_diagnostics());
    }
}
