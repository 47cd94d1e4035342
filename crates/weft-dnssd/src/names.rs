//! Matter DNS-SD name vocabulary
//!
//! Operational instances live under `_matter._tcp.local`, commissionable
//! and commissioner services under `_matterc._udp.local` and
//! `_matterd._udp.local`. Sub-service PTR trees narrow queries by fabric,
//! discriminator, vendor, device type or commissioning mode.

/// DNS-SD service enumeration name.
pub const SERVICE_ENUMERATION: &str = "_services._dns-sd._udp.local";

/// Operational (commissioned) node service type.
pub const OPERATIONAL_SERVICE: &str = "_matter._tcp.local";
/// Commissionable node service type.
pub const COMMISSIONABLE_SERVICE: &str = "_matterc._udp.local";
/// Commissioner service type.
pub const COMMISSIONER_SERVICE: &str = "_matterd._udp.local";

/// `<GlobalFabricId_hex16>-<NodeId_hex16>`.
pub fn operational_instance_name(fabric_global_id: u64, node_id: u64) -> String {
    format!("{fabric_global_id:016X}-{node_id:016X}")
}

/// Fully qualified operational instance name.
pub fn operational_instance_qname(fabric_global_id: u64, node_id: u64) -> String {
    format!(
        "{}.{OPERATIONAL_SERVICE}",
        operational_instance_name(fabric_global_id, node_id)
    )
}

/// Fabric sub-service: `_I<GlobalFabricId_hex16>._sub._matter._tcp.local`.
pub fn operational_fabric_subtype(fabric_global_id: u64) -> String {
    format!("_I{fabric_global_id:016X}._sub.{OPERATIONAL_SERVICE}")
}

/// Short-discriminator sub-service (`_S<n>`, 4 bits).
pub fn short_discriminator_subtype(short_discriminator: u8) -> String {
    format!("_S{short_discriminator}._sub.{COMMISSIONABLE_SERVICE}")
}

/// Long-discriminator sub-service (`_L<d>`, 12 bits).
pub fn long_discriminator_subtype(long_discriminator: u16) -> String {
    format!("_L{long_discriminator}._sub.{COMMISSIONABLE_SERVICE}")
}

/// Vendor sub-service (`_V<vendor>`).
pub fn vendor_subtype(vendor_id: u16) -> String {
    format!("_V{vendor_id}._sub.{COMMISSIONABLE_SERVICE}")
}

/// Device-type sub-service (`_T<deviceType>`).
pub fn device_type_subtype(device_type: u32) -> String {
    format!("_T{device_type}._sub.{COMMISSIONABLE_SERVICE}")
}

/// Open-commissioning-mode sub-service (`_CM`).
pub fn commissioning_mode_subtype() -> String {
    format!("_CM._sub.{COMMISSIONABLE_SERVICE}")
}

/// The 4-bit short discriminator carried in a 12-bit long one.
pub fn short_discriminator(long_discriminator: u16) -> u8 {
    ((long_discriminator >> 8) & 0x0F) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operational_names() {
        assert_eq!(
            operational_instance_name(0x18, 1),
            "0000000000000018-0000000000000001"
        );
        assert_eq!(
            operational_instance_qname(0x18, 1),
            "0000000000000018-0000000000000001._matter._tcp.local"
        );
        assert_eq!(
            operational_fabric_subtype(0x18),
            "_I0000000000000018._sub._matter._tcp.local"
        );
    }

    #[test]
    fn test_commissionable_subtypes() {
        assert_eq!(
            long_discriminator_subtype(3840),
            "_L3840._sub._matterc._udp.local"
        );
        assert_eq!(short_discriminator(3840), 15);
        assert_eq!(
            short_discriminator_subtype(short_discriminator(3840)),
            "_S15._sub._matterc._udp.local"
        );
        assert_eq!(vendor_subtype(65521), "_V65521._sub._matterc._udp.local");
        assert_eq!(
            commissioning_mode_subtype(),
            "_CM._sub._matterc._udp.local"
        );
    }
}
