//! mDNS scanner
//!
//! Owns the record cache. Lookups resolve from cache when fresh and
//! otherwise issue a query and wait; concurrent waiters for the same name
//! share one outstanding query and resolve independently. Records
//! announced with TTL zero are honoured only once the goodbye-protection
//! window has passed.

use crate::codec::{DnsMessage, DnsQuery, DnsRecord, RecordType, RecordValue};
use crate::names;
use crate::socket::MdnsBus;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use weft_core::types::PeerAddress;

/// A goodbye for a record first seen less than this long ago is ignored.
pub const GOODBYE_PROTECTION_WINDOW: Duration = Duration::from_secs(1);

/// Default wait budget for lookups that go to the network.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// RECORD CACHE
// =============================================================================

struct CachedRecord {
    record: DnsRecord,
    expires_at: Instant,
    first_seen: Instant,
}

/// TTL-aware cache keyed by (name, record type).
#[derive(Default)]
pub struct RecordCache {
    records: HashMap<(String, RecordType), Vec<CachedRecord>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one received record. Returns true when the cache changed.
    pub fn apply(&mut self, record: &DnsRecord, now: Instant) -> bool {
        let key = (record.name.clone(), record.record_type());
        if record.ttl == 0 {
            // Goodbye: ignored inside the protection window so a stale
            // goodbye crossing a refresh cannot evict a live record.
            let Some(entries) = self.records.get_mut(&key) else {
                return false;
            };
            let before = entries.len();
            entries.retain(|cached| {
                cached.record.value != record.value
                    || now.duration_since(cached.first_seen) < GOODBYE_PROTECTION_WINDOW
            });
            let changed = entries.len() != before;
            if entries.is_empty() {
                self.records.remove(&key);
            }
            return changed;
        }

        let expires_at = now + Duration::from_secs(record.ttl as u64);
        let entries = self.records.entry(key).or_default();
        if let Some(existing) = entries
            .iter_mut()
            .find(|cached| cached.record.value == record.value)
        {
            // Refresh keeps the original first-seen anchor.
            existing.expires_at = expires_at;
            existing.record = record.clone();
            false
        } else {
            entries.push(CachedRecord {
                record: record.clone(),
                expires_at,
                first_seen: now,
            });
            true
        }
    }

    /// Unexpired records under (name, type).
    pub fn lookup(&self, name: &str, record_type: RecordType, now: Instant) -> Vec<DnsRecord> {
        self.records
            .get(&(name.to_string(), record_type))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|cached| cached.expires_at > now)
                    .map(|cached| cached.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired entries.
    pub fn evict_expired(&mut self, now: Instant) {
        self.records.retain(|_, entries| {
            entries.retain(|cached| cached.expires_at > now);
            !entries.is_empty()
        });
    }
}

// =============================================================================
// LOOKUP RESULTS
// =============================================================================

/// Where an operational device can be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceAddresses {
    pub addresses: Vec<PeerAddress>,
}

/// A commissionable device assembled from PTR/SRV/TXT/address records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommissionableDevice {
    pub instance_name: String,
    pub addresses: Vec<PeerAddress>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub device_type: Option<u32>,
    pub device_name: Option<String>,
    pub discriminator: Option<u16>,
    pub commissioning_mode: Option<u8>,
    pub pairing_hint: Option<u16>,
}

/// Which commissionable devices a discovery call is after.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiscoveryIdentifier {
    LongDiscriminator(u16),
    ShortDiscriminator(u8),
    Vendor(u16),
    DeviceType(u32),
    Product(u16),
}

impl DiscoveryIdentifier {
    /// The PTR name to query. Products have no sub-service and filter on
    /// the TXT `VP` value instead.
    fn query_name(&self) -> String {
        match self {
            DiscoveryIdentifier::LongDiscriminator(d) => names::long_discriminator_subtype(*d),
            DiscoveryIdentifier::ShortDiscriminator(d) => names::short_discriminator_subtype(*d),
            DiscoveryIdentifier::Vendor(v) => names::vendor_subtype(*v),
            DiscoveryIdentifier::DeviceType(t) => names::device_type_subtype(*t),
            DiscoveryIdentifier::Product(_) => names::COMMISSIONABLE_SERVICE.to_string(),
        }
    }

    fn matches(&self, device: &CommissionableDevice) -> bool {
        match self {
            DiscoveryIdentifier::LongDiscriminator(d) => device.discriminator == Some(*d),
            DiscoveryIdentifier::ShortDiscriminator(d) => device
                .discriminator
                .map(|long| names::short_discriminator(long) == *d)
                .unwrap_or(false),
            DiscoveryIdentifier::Vendor(v) => device.vendor_id == Some(*v),
            DiscoveryIdentifier::DeviceType(t) => device.device_type == Some(*t),
            DiscoveryIdentifier::Product(p) => device.product_id == Some(*p),
        }
    }
}

/// An operational discovery interest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OperationalTarget {
    pub fabric_global_id: u64,
    /// `None` watches the whole fabric via its sub-service.
    pub node_id: Option<u64>,
}

impl OperationalTarget {
    fn query_name(&self) -> String {
        match self.node_id {
            Some(node_id) => names::operational_instance_qname(self.fabric_global_id, node_id),
            None => names::operational_fabric_subtype(self.fabric_global_id),
        }
    }
}

/// A set of operational targets the scanner should watch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetCriteria {
    pub operational_targets: Vec<OperationalTarget>,
}

// =============================================================================
// SCANNER
// =============================================================================

struct Waiter {
    instance_qname: String,
    tx: oneshot::Sender<DeviceAddresses>,
}

/// Matter-aware mDNS client.
pub struct MdnsScanner {
    bus: MdnsBus,
    cache: Mutex<RecordCache>,
    waiters: Mutex<Vec<Waiter>>,
    queried_targets: Mutex<HashSet<OperationalTarget>>,
    target_criteria: Mutex<Vec<TargetCriteria>>,
}

impl MdnsScanner {
    pub fn new(bus: MdnsBus) -> Arc<Self> {
        Arc::new(Self {
            bus,
            cache: Mutex::new(RecordCache::new()),
            waiters: Mutex::new(Vec::new()),
            queried_targets: Mutex::new(HashSet::new()),
            target_criteria: Mutex::new(Vec::new()),
        })
    }

    /// Consume bus messages until the bus closes.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        while let Ok(message) = rx.recv().await {
            self.handle_message(&message, Instant::now());
        }
    }

    /// Ingest one DNS message at the given instant.
    pub fn handle_message(&self, message: &DnsMessage, now: Instant) {
        if !message.is_response {
            return;
        }
        {
            let mut cache = self.cache.lock();
            for record in message.answers.iter().chain(&message.additionals) {
                if cache.apply(record, now) {
                    trace!(name = %record.name, "cache updated");
                }
            }
        }
        self.satisfy_waiters(now);
    }

    fn satisfy_waiters(&self, now: Instant) {
        let mut waiters = self.waiters.lock();
        let mut remaining = Vec::new();
        for waiter in waiters.drain(..) {
            match self.resolve_instance(&waiter.instance_qname, now) {
                Some(addresses) => {
                    // A dropped receiver just means the caller timed out.
                    let _ = waiter.tx.send(addresses);
                }
                None => remaining.push(waiter),
            }
        }
        *waiters = remaining;
    }

    /// SRV + address records to a reachable address list.
    fn resolve_instance(&self, instance_qname: &str, now: Instant) -> Option<DeviceAddresses> {
        let cache = self.cache.lock();
        let srv_records = cache.lookup(instance_qname, RecordType::Srv, now);
        let (port, target) = srv_records.iter().find_map(|record| match &record.value {
            RecordValue::Srv { port, target, .. } => Some((*port, target.clone())),
            _ => None,
        })?;

        let mut addresses = Vec::new();
        for record in cache
            .lookup(&target, RecordType::Aaaa, now)
            .iter()
            .chain(cache.lookup(&target, RecordType::A, now).iter())
        {
            let ip: IpAddr = match &record.value {
                RecordValue::Aaaa(v6) => (*v6).into(),
                RecordValue::A(v4) => (*v4).into(),
                _ => continue,
            };
            addresses.push(PeerAddress::udp(SocketAddr::new(ip, port)));
        }
        if addresses.is_empty() {
            return None;
        }
        Some(DeviceAddresses { addresses })
    }

    /// Cache-only lookup of an operational device.
    pub fn get_discovered_operational_device(
        &self,
        fabric_global_id: u64,
        node_id: u64,
    ) -> Option<DeviceAddresses> {
        self.resolve_instance(
            &names::operational_instance_qname(fabric_global_id, node_id),
            Instant::now(),
        )
    }

    /// Find an operational device, querying the network when the cache has
    /// nothing fresh. Returns `None` on timeout.
    pub async fn find_operational_device(
        &self,
        fabric_global_id: u64,
        node_id: u64,
        timeout: Option<Duration>,
    ) -> Option<DeviceAddresses> {
        let instance_qname = names::operational_instance_qname(fabric_global_id, node_id);
        if let Some(found) = self.resolve_instance(&instance_qname, Instant::now()) {
            return Some(found);
        }

        let (tx, rx) = oneshot::channel();
        let query_needed = {
            let mut waiters = self.waiters.lock();
            let already_waiting = waiters
                .iter()
                .any(|waiter| waiter.instance_qname == instance_qname);
            waiters.push(Waiter {
                instance_qname: instance_qname.clone(),
                tx,
            });
            !already_waiting
        };
        if query_needed {
            debug!(instance = %instance_qname, "querying for operational device");
            let mut query = DnsMessage::query(0);
            query
                .queries
                .push(DnsQuery::new(instance_qname.clone(), RecordType::Srv));
            self.bus.publish(query);
        }

        let timeout = timeout.unwrap_or(DEFAULT_LOOKUP_TIMEOUT);
        let result = tokio::time::timeout(timeout, rx).await;
        match result {
            Ok(Ok(addresses)) => Some(addresses),
            _ => {
                // Timed out; drop our waiter registration.
                self.waiters
                    .lock()
                    .retain(|waiter| !waiter.tx.is_closed());
                None
            }
        }
    }

    fn commissionable_device(&self, instance_qname: &str, now: Instant) -> Option<CommissionableDevice> {
        let addresses = self.resolve_instance(instance_qname, now)?;
        let cache = self.cache.lock();
        let txt = cache
            .lookup(instance_qname, RecordType::Txt, now)
            .into_iter()
            .find_map(|record| match record.value {
                RecordValue::Txt(entries) => Some(entries),
                _ => None,
            })
            .unwrap_or_default();

        let mut pairs: HashMap<String, String> = HashMap::new();
        for entry in txt {
            if let Some((key, value)) = entry.split_once('=') {
                pairs.insert(key.to_string(), value.to_string());
            }
        }
        let (vendor_id, product_id) = match pairs.get("VP").map(|vp| vp.split_once('+')) {
            Some(Some((vendor, product))) => (vendor.parse().ok(), product.parse().ok()),
            Some(None) => (pairs.get("VP").and_then(|v| v.parse().ok()), None),
            None => (None, None),
        };

        Some(CommissionableDevice {
            instance_name: instance_qname
                .trim_end_matches(&format!(".{}", names::COMMISSIONABLE_SERVICE))
                .to_string(),
            addresses: addresses.addresses,
            vendor_id,
            product_id,
            device_type: pairs.get("DT").and_then(|v| v.parse().ok()),
            device_name: pairs.get("DN").cloned(),
            discriminator: pairs.get("D").and_then(|v| v.parse().ok()),
            commissioning_mode: pairs.get("CM").and_then(|v| v.parse().ok()),
            pairing_hint: pairs.get("PH").and_then(|v| v.parse().ok()),
        })
    }

    /// Cache-only lookup of commissionable devices matching `identifier`.
    pub fn get_discovered_commissionable_devices(
        &self,
        identifier: DiscoveryIdentifier,
    ) -> Vec<CommissionableDevice> {
        let now = Instant::now();
        let ptr_names: Vec<String> = {
            let cache = self.cache.lock();
            let mut instances: Vec<String> = cache
                .lookup(&identifier.query_name(), RecordType::Ptr, now)
                .into_iter()
                .chain(cache.lookup(names::COMMISSIONABLE_SERVICE, RecordType::Ptr, now))
                .filter_map(|record| match record.value {
                    RecordValue::Ptr(target) => Some(target),
                    _ => None,
                })
                .collect();
            instances.sort();
            instances.dedup();
            instances
        };

        ptr_names
            .iter()
            .filter_map(|instance| self.commissionable_device(instance, now))
            .filter(|device| identifier.matches(device))
            .collect()
    }

    /// Query for commissionable devices and collect matches for the full
    /// `timeout` window.
    pub async fn find_commissionable_devices(
        &self,
        identifier: DiscoveryIdentifier,
        timeout: Duration,
    ) -> Vec<CommissionableDevice> {
        let mut query = DnsMessage::query(0);
        query
            .queries
            .push(DnsQuery::new(identifier.query_name(), RecordType::Ptr));
        self.bus.publish(query);

        tokio::time::sleep(timeout).await;
        self.get_discovered_commissionable_devices(identifier)
    }

    /// Register discovery interest. New operational targets trigger one
    /// aggregated PTR query; targets already watched emit nothing.
    pub fn add_target_criteria(&self, criteria: TargetCriteria) {
        let mut new_names = Vec::new();
        {
            let mut queried = self.queried_targets.lock();
            for target in &criteria.operational_targets {
                if queried.insert(*target) {
                    new_names.push(target.query_name());
                }
            }
        }
        self.target_criteria.lock().push(criteria);

        if !new_names.is_empty() {
            debug!(targets = new_names.len(), "querying for new operational targets");
            let mut query = DnsMessage::query(0);
            for name in new_names {
                query.queries.push(DnsQuery::new(name, RecordType::Ptr));
            }
            self.bus.publish(query);
        }
    }

    /// Remove a previously added criteria set. Targets no longer covered
    /// by any criteria become queryable again.
    pub fn remove_target_criteria(&self, criteria: &TargetCriteria) {
        let mut all = self.target_criteria.lock();
        if let Some(index) = all.iter().position(|c| c == criteria) {
            all.remove(index);
        }
        let still_wanted: HashSet<OperationalTarget> = all
            .iter()
            .flat_map(|c| c.operational_targets.iter().copied())
            .collect();
        self.queried_targets
            .lock()
            .retain(|target| still_wanted.contains(target));
    }

    /// Drop expired cache entries.
    pub fn expire(&self, now: Instant) {
        self.cache.lock().evict_expired(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertiser::{HostConfig, MdnsAdvertiser, OperationalService};
    use std::net::Ipv6Addr;

    fn operational_announcement() -> DnsMessage {
        let bus = MdnsBus::new();
        let mut rx = bus.subscribe();
        let advertiser = MdnsAdvertiser::new(
            bus,
            HostConfig {
                hostname: "00B0D063C2260000".into(),
                addresses: vec![IpAddr::V6(
                    "fe80::e777:4f5e:c61e:7314".parse::<Ipv6Addr>().unwrap(),
                )],
            },
        );
        advertiser.add_operational(OperationalService {
            fabric_global_id: 0x18,
            node_id: 1,
            port: 5540,
            session_idle_interval_ms: None,
            session_active_interval_ms: None,
            session_active_threshold_ms: None,
        });
        rx.try_recv().unwrap()
    }

    #[test]
    fn test_cache_goodbye_protection_boundary() {
        let mut cache = RecordCache::new();
        let record = DnsRecord::new(
            "x._matter._tcp.local",
            120,
            RecordValue::Ptr("target".into()),
        );
        let t0 = Instant::now();
        cache.apply(&record, t0);

        // Goodbye inside the window is ignored.
        let goodbye = record.clone().into_goodbye();
        cache.apply(&goodbye, t0 + Duration::from_millis(500));
        assert_eq!(
            cache
                .lookup("x._matter._tcp.local", RecordType::Ptr, t0 + Duration::from_millis(600))
                .len(),
            1
        );

        // After the window it evicts, with no second record required.
        cache.apply(&goodbye, t0 + Duration::from_millis(1100));
        assert!(cache
            .lookup("x._matter._tcp.local", RecordType::Ptr, t0 + Duration::from_millis(1200))
            .is_empty());
    }

    #[test]
    fn test_cache_refresh_keeps_first_seen() {
        let mut cache = RecordCache::new();
        let record = DnsRecord::new("x.local", 120, RecordValue::Ptr("t".into()));
        let t0 = Instant::now();
        cache.apply(&record, t0);
        // Refresh after 2 s; the protection anchor stays at t0, so a
        // goodbye at 2.5 s is already outside the window.
        cache.apply(&record, t0 + Duration::from_secs(2));
        cache.apply(
            &record.clone().into_goodbye(),
            t0 + Duration::from_millis(2500),
        );
        assert!(cache
            .lookup("x.local", RecordType::Ptr, t0 + Duration::from_secs(3))
            .is_empty());
    }

    #[test]
    fn test_cache_expiry() {
        let mut cache = RecordCache::new();
        let record = DnsRecord::new("x.local", 10, RecordValue::Ptr("t".into()));
        let t0 = Instant::now();
        cache.apply(&record, t0);

        assert_eq!(cache.lookup("x.local", RecordType::Ptr, t0 + Duration::from_secs(9)).len(), 1);
        // No record with expiry <= now is ever returned.
        assert!(cache
            .lookup("x.local", RecordType::Ptr, t0 + Duration::from_secs(10))
            .is_empty());
    }

    #[tokio::test]
    async fn test_scanner_resolves_announced_device() {
        let bus = MdnsBus::new();
        let scanner = MdnsScanner::new(bus.clone());
        scanner.handle_message(&operational_announcement(), Instant::now());

        let found = scanner
            .get_discovered_operational_device(0x18, 1)
            .unwrap();
        assert_eq!(found.addresses.len(), 1);
        assert_eq!(found.addresses[0].addr.port(), 5540);
        assert_eq!(
            found.addresses[0].addr.ip(),
            "fe80::e777:4f5e:c61e:7314".parse::<IpAddr>().unwrap()
        );

        // Unknown node: nothing in cache.
        assert!(scanner.get_discovered_operational_device(0x18, 2).is_none());
    }

    #[tokio::test]
    async fn test_find_waits_for_announcement() {
        let bus = MdnsBus::new();
        let scanner = MdnsScanner::new(bus.clone());
        tokio::spawn(scanner.clone().run());

        let finder = {
            let scanner = scanner.clone();
            tokio::spawn(async move {
                scanner
                    .find_operational_device(0x18, 1, Some(Duration::from_secs(2)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish(operational_announcement());

        let found = finder.await.unwrap().unwrap();
        assert_eq!(found.addresses[0].addr.port(), 5540);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_one_query() {
        let bus = MdnsBus::new();
        let mut raw = bus.subscribe();
        let scanner = MdnsScanner::new(bus.clone());
        tokio::spawn(scanner.clone().run());

        let spawn_finder = |scanner: Arc<MdnsScanner>| {
            tokio::spawn(async move {
                scanner
                    .find_operational_device(0x18, 1, Some(Duration::from_secs(2)))
                    .await
            })
        };
        let a = spawn_finder(scanner.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let b = spawn_finder(scanner.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish(operational_announcement());
        assert!(a.await.unwrap().is_some());
        assert!(b.await.unwrap().is_some());

        // Exactly one query for the instance went out.
        let mut queries = 0;
        while let Ok(message) = raw.try_recv() {
            if !message.is_response
                && message
                    .queries
                    .iter()
                    .any(|q| q.name.starts_with("0000000000000018-"))
            {
                queries += 1;
            }
        }
        assert_eq!(queries, 1);
    }

    #[tokio::test]
    async fn test_find_times_out() {
        let bus = MdnsBus::new();
        let scanner = MdnsScanner::new(bus);
        let found = scanner
            .find_operational_device(0x99, 9, Some(Duration::from_millis(50)))
            .await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_target_criteria_aggregate_query_and_dedupe() {
        let bus = MdnsBus::new();
        let mut raw = bus.subscribe();
        let scanner = MdnsScanner::new(bus);

        scanner.add_target_criteria(TargetCriteria {
            operational_targets: vec![
                OperationalTarget {
                    fabric_global_id: 0x18,
                    node_id: Some(1),
                },
                OperationalTarget {
                    fabric_global_id: 0x18,
                    node_id: None,
                },
            ],
        });

        // One aggregated query with both names.
        let query = raw.try_recv().unwrap();
        assert!(!query.is_response);
        assert_eq!(query.queries.len(), 2);

        // Duplicates emit nothing.
        scanner.add_target_criteria(TargetCriteria {
            operational_targets: vec![OperationalTarget {
                fabric_global_id: 0x18,
                node_id: Some(1),
            }],
        });
        assert!(raw.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_goodbye_after_window_clears_lookup() {
        let bus = MdnsBus::new();
        let scanner = MdnsScanner::new(bus);
        let t0 = Instant::now();

        let announcement = operational_announcement();
        scanner.handle_message(&announcement, t0);
        assert!(scanner.get_discovered_operational_device(0x18, 1).is_some());

        // Goodbye past the protection window: every record withdrawn.
        let mut goodbye = announcement.clone();
        for record in goodbye.answers.iter_mut().chain(goodbye.additionals.iter_mut()) {
            record.ttl = 0;
        }
        scanner.handle_message(&goodbye, t0 + Duration::from_millis(1500));
        assert!(scanner.get_discovered_operational_device(0x18, 1).is_none());
    }
}
