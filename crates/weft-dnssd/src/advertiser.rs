//! mDNS advertiser
//!
//! Publishes the full PTR chain for each service instance in one response
//! message: service enumeration, service type, sub-services, then the
//! instance SRV and TXT with host addresses as additionals. Records are
//! re-announced at 75 % of their TTL and withdrawn with a TTL-zero
//! goodbye on close.

use crate::codec::{DnsMessage, DnsQuery, DnsRecord, RecordType, RecordValue};
use crate::names;
use crate::socket::MdnsBus;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Default record TTL in seconds.
pub const DEFAULT_TTL_SECS: u32 = 120;

/// Host record set shared by all advertised instances.
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Hostname label, without the `.local` suffix.
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
}

impl HostConfig {
    fn qname(&self) -> String {
        format!("{}.local", self.hostname)
    }
}

/// A commissioned node's operational service.
#[derive(Clone, Debug)]
pub struct OperationalService {
    pub fabric_global_id: u64,
    pub node_id: u64,
    pub port: u16,
    pub session_idle_interval_ms: Option<u32>,
    pub session_active_interval_ms: Option<u32>,
    pub session_active_threshold_ms: Option<u16>,
}

/// A commissionable node's service, with the pairing TXT vocabulary.
#[derive(Clone, Debug)]
pub struct CommissionableService {
    /// Random instance identifier, rendered as 16 hex chars.
    pub instance_id: u64,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_type: u32,
    pub device_name: String,
    pub discriminator: u16,
    pub commissioning_mode: u8,
    pub pairing_hint: u16,
    pub port: u16,
    pub session_idle_interval_ms: Option<u32>,
    pub session_active_interval_ms: Option<u32>,
    pub session_active_threshold_ms: Option<u16>,
}

/// A commissioner's service, advertised under `_matterd._udp.local`.
#[derive(Clone, Debug)]
pub struct CommissionerService {
    /// Random instance identifier, rendered as 16 hex chars.
    pub instance_id: u64,
    pub vendor_id: u16,
    pub device_type: Option<u32>,
    pub port: u16,
}

#[derive(Clone, Debug)]
enum ServiceKind {
    Operational(OperationalService),
    Commissionable(CommissionableService),
    Commissioner(CommissionerService),
}

impl ServiceKind {
    fn service_type(&self) -> &'static str {
        match self {
            ServiceKind::Operational(_) => names::OPERATIONAL_SERVICE,
            ServiceKind::Commissionable(_) => names::COMMISSIONABLE_SERVICE,
            ServiceKind::Commissioner(_) => names::COMMISSIONER_SERVICE,
        }
    }

    fn instance_qname(&self) -> String {
        match self {
            ServiceKind::Operational(service) => {
                names::operational_instance_qname(service.fabric_global_id, service.node_id)
            }
            ServiceKind::Commissionable(service) => format!(
                "{:016X}.{}",
                service.instance_id,
                names::COMMISSIONABLE_SERVICE
            ),
            ServiceKind::Commissioner(service) => format!(
                "{:016X}.{}",
                service.instance_id,
                names::COMMISSIONER_SERVICE
            ),
        }
    }

    fn subtypes(&self) -> Vec<String> {
        match self {
            ServiceKind::Operational(service) => {
                vec![names::operational_fabric_subtype(service.fabric_global_id)]
            }
            ServiceKind::Commissionable(service) => {
                let mut subtypes = vec![
                    names::short_discriminator_subtype(names::short_discriminator(
                        service.discriminator,
                    )),
                    names::long_discriminator_subtype(service.discriminator),
                    names::vendor_subtype(service.vendor_id),
                    names::device_type_subtype(service.device_type),
                ];
                if service.commissioning_mode != 0 {
                    subtypes.push(names::commissioning_mode_subtype());
                }
                subtypes
            }
            ServiceKind::Commissioner(_) => Vec::new(),
        }
    }

    fn port(&self) -> u16 {
        match self {
            ServiceKind::Operational(service) => service.port,
            ServiceKind::Commissionable(service) => service.port,
            ServiceKind::Commissioner(service) => service.port,
        }
    }

    fn txt_entries(&self) -> Vec<String> {
        let mut entries = Vec::new();
        match self {
            ServiceKind::Operational(service) => {
                push_session_params(
                    &mut entries,
                    service.session_idle_interval_ms,
                    service.session_active_interval_ms,
                    service.session_active_threshold_ms,
                );
            }
            ServiceKind::Commissionable(service) => {
                entries.push(format!("VP={}+{}", service.vendor_id, service.product_id));
                entries.push(format!("DT={}", service.device_type));
                entries.push(format!("DN={}", service.device_name));
                push_session_params(
                    &mut entries,
                    service.session_idle_interval_ms,
                    service.session_active_interval_ms,
                    service.session_active_threshold_ms,
                );
                entries.push(format!("D={}", service.discriminator));
                entries.push(format!("CM={}", service.commissioning_mode));
                entries.push(format!("PH={}", service.pairing_hint));
            }
            ServiceKind::Commissioner(service) => {
                entries.push(format!("VP={}", service.vendor_id));
                if let Some(device_type) = service.device_type {
                    entries.push(format!("DT={device_type}"));
                }
            }
        }
        entries
    }
}

fn push_session_params(
    entries: &mut Vec<String>,
    idle: Option<u32>,
    active: Option<u32>,
    threshold: Option<u16>,
) {
    if let Some(idle) = idle {
        entries.push(format!("SII={idle}"));
    }
    if let Some(active) = active {
        entries.push(format!("SAI={active}"));
    }
    if let Some(threshold) = threshold {
        entries.push(format!("SAT={threshold}"));
    }
}

/// Publishes and maintains Matter service records on a bus.
pub struct MdnsAdvertiser {
    bus: MdnsBus,
    host: HostConfig,
    ttl: u32,
    services: Mutex<Vec<ServiceKind>>,
    shutdown: broadcast::Sender<()>,
}

impl MdnsAdvertiser {
    pub fn new(bus: MdnsBus, host: HostConfig) -> Arc<Self> {
        Self::with_ttl(bus, host, DEFAULT_TTL_SECS)
    }

    pub fn with_ttl(bus: MdnsBus, host: HostConfig, ttl: u32) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            bus,
            host,
            ttl,
            services: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// Advertise an operational instance and announce it immediately.
    pub fn add_operational(&self, service: OperationalService) {
        info!(
            instance = %names::operational_instance_name(service.fabric_global_id, service.node_id),
            port = service.port,
            "advertising operational service"
        );
        let kind = ServiceKind::Operational(service);
        self.announce(&kind, self.ttl);
        self.services.lock().push(kind);
    }

    /// Advertise a commissionable instance and announce it immediately.
    pub fn add_commissionable(&self, service: CommissionableService) {
        info!(
            instance = format!("{:016X}", service.instance_id),
            discriminator = service.discriminator,
            "advertising commissionable service"
        );
        let kind = ServiceKind::Commissionable(service);
        self.announce(&kind, self.ttl);
        self.services.lock().push(kind);
    }

    /// Advertise a commissioner instance and announce it immediately.
    pub fn add_commissioner(&self, service: CommissionerService) {
        info!(
            instance = format!("{:016X}", service.instance_id),
            "advertising commissioner service"
        );
        let kind = ServiceKind::Commissioner(service);
        self.announce(&kind, self.ttl);
        self.services.lock().push(kind);
    }

    fn build_announcement(&self, service: &ServiceKind, ttl: u32) -> DnsMessage {
        let instance = service.instance_qname();
        let service_type = service.service_type();
        let host_qname = self.host.qname();

        let mut message = DnsMessage::response(0);
        message.answers.push(DnsRecord::new(
            names::SERVICE_ENUMERATION,
            ttl,
            RecordValue::Ptr(service_type.to_string()),
        ));
        message.answers.push(DnsRecord::new(
            service_type,
            ttl,
            RecordValue::Ptr(instance.clone()),
        ));
        for subtype in service.subtypes() {
            message.answers.push(DnsRecord::new(
                subtype,
                ttl,
                RecordValue::Ptr(instance.clone()),
            ));
        }
        message.answers.push(DnsRecord::new(
            instance.clone(),
            ttl,
            RecordValue::Srv {
                priority: 0,
                weight: 0,
                port: service.port(),
                target: host_qname.clone(),
            },
        ));
        message.answers.push(DnsRecord::new(
            instance,
            ttl,
            RecordValue::Txt(service.txt_entries()),
        ));
        for address in &self.host.addresses {
            let value = match address {
                IpAddr::V4(v4) => RecordValue::A(*v4),
                IpAddr::V6(v6) => RecordValue::Aaaa(*v6),
            };
            message
                .additionals
                .push(DnsRecord::new(host_qname.clone(), ttl, value));
        }
        message
    }

    fn announce(&self, service: &ServiceKind, ttl: u32) {
        self.bus.publish(self.build_announcement(service, ttl));
    }

    /// Re-announce every service with the configured TTL.
    pub fn announce_all(&self) {
        for service in self.services.lock().iter() {
            self.announce(service, self.ttl);
        }
    }

    fn matches_query(&self, service: &ServiceKind, query: &DnsQuery) -> bool {
        query.name == names::SERVICE_ENUMERATION
            || query.name == service.service_type()
            || query.name == service.instance_qname()
            || service.subtypes().iter().any(|s| *s == query.name)
            || ((query.record_type == RecordType::A
                || query.record_type == RecordType::Aaaa
                || query.record_type == RecordType::Any)
                && query.name == self.host.qname())
    }

    /// Run the TTL refresh timer and the query responder until `close`.
    pub async fn run(self: Arc<Self>) {
        let mut refresh =
            tokio::time::interval(Duration::from_secs((self.ttl as u64 * 3).div_ceil(4)));
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut queries = self.bus.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    debug!("refreshing mdns advertisements");
                    self.announce_all();
                }
                message = queries.recv() => {
                    let Ok(message) = message else { break };
                    if message.is_response {
                        continue;
                    }
                    let services = self.services.lock().clone();
                    for service in &services {
                        if message.queries.iter().any(|q| self.matches_query(service, q)) {
                            self.announce(service, self.ttl);
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Withdraw all records with a goodbye announcement and stop the
    /// background loop.
    pub fn close(&self) {
        let services: Vec<ServiceKind> = self.services.lock().drain(..).collect();
        for service in &services {
            self.announce(service, 0);
        }
        let _ = self.shutdown.send(());
    }
}
