//! Matter-aware DNS-SD for the weft stack.
//!
//! Standard DNS framing over multicast UDP with the Matter service
//! vocabulary on top: operational and commissionable instances, their
//! sub-service PTR trees, TXT key-values, TTL refresh and goodbye
//! handling, plus a scanner with a goodbye-protected record cache.

pub mod advertiser;
pub mod client;
pub mod codec;
pub mod names;
pub mod socket;

pub use advertiser::{
    CommissionableService, CommissionerService, HostConfig, MdnsAdvertiser, OperationalService,
};
pub use client::{CommissionableDevice, DeviceAddresses, DiscoveryIdentifier, MdnsScanner};
pub use codec::{DnsMessage, DnsQuery, DnsRecord, RecordType, RecordValue};
pub use socket::{MdnsBus, MdnsSocket};
