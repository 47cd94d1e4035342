//! Subscription handling
//!
//! A subscription is a standing read: a prime report at establishment,
//! incremental reports when selected attributes change (held to the
//! min-interval floor), and an empty keepalive at the max interval.

use crate::messages::{
    ReportData, Status, StatusResponse, SubscribeRequest, SubscribeResponse,
};
use crate::model::NodeModel;
use crate::path::{AttributePath, WildcardPathFlags};
use crate::read::{chunk_reports, ReadHandler};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};
use weft_core::types::{AttributeId, ClusterId, EndpointNumber, FabricIndex};
use weft_core::Error;

/// Interval bounds are u16 seconds on the wire.
const MAX_INTERVAL_SECS: u64 = 65_535;

/// One live subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: u32,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub fabric: Option<FabricIndex>,
    request: SubscribeRequest,
    /// Reports flow to the subscriber through this queue.
    sender: mpsc::Sender<ReportData>,
    last_report: Mutex<Instant>,
}

impl Subscription {
    /// Whether a change to this concrete path is selected.
    fn selects(&self, endpoint: EndpointNumber, cluster: ClusterId, attribute: AttributeId) -> bool {
        self.request.read.attribute_requests.iter().any(|ib| {
            let path = AttributePath::from_ib(ib);
            path.endpoint.map(|e| e == endpoint).unwrap_or(true)
                && path.cluster.map(|c| c == cluster).unwrap_or(true)
                && path.attribute.map(|a| a == attribute).unwrap_or(true)
        })
    }
}

/// Owns all subscriptions of one interaction server.
pub struct SubscriptionManager {
    next_id: Mutex<u32>,
    subscriptions: Mutex<HashMap<u32, Arc<Subscription>>>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Establish a subscription: validate the interval bounds, send the
    /// prime report through `sender`, and return the response.
    pub fn subscribe(
        &self,
        model: &NodeModel,
        request: SubscribeRequest,
        fabric: Option<FabricIndex>,
        flags: WildcardPathFlags,
        sender: mpsc::Sender<ReportData>,
    ) -> weft_core::Result<(SubscribeResponse, Arc<Subscription>)> {
        if request.min_interval_floor_secs > MAX_INTERVAL_SECS
            || request.max_interval_ceiling_secs > MAX_INTERVAL_SECS
        {
            return Err(Error::MalformedRequest(
                "subscription interval out of range".into(),
            ));
        }

        if !request.keep_subscriptions {
            let mut subscriptions = self.subscriptions.lock();
            let before = subscriptions.len();
            subscriptions.retain(|_, existing| existing.fabric != fabric);
            if before != subscriptions.len() {
                debug!("dropped prior subscriptions on request");
            }
        }

        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next = next.wrapping_add(1).max(1);
            id
        };

        // Prime report: a full read of the selected paths.
        let handler = ReadHandler::new(model).with_flags(flags);
        let (reports, events) = handler.collect_reports(&request.read, fabric);
        for chunk in chunk_reports(reports, events, Some(id)) {
            sender
                .try_send(chunk)
                .map_err(|_| Error::Internal("subscription queue full during prime".into()))?;
        }

        let max_interval = Duration::from_secs(request.max_interval_ceiling_secs);
        let subscription = Arc::new(Subscription {
            id,
            min_interval: Duration::from_secs(request.min_interval_floor_secs),
            max_interval,
            fabric,
            request,
            sender,
            last_report: Mutex::new(Instant::now()),
        });
        self.subscriptions.lock().insert(id, subscription.clone());
        info!(subscription = id, "subscription established");

        Ok((
            SubscribeResponse {
                subscription_id: id,
                max_interval_secs: max_interval.as_secs() as u16,
            },
            subscription,
        ))
    }

    pub fn get(&self, id: u32) -> Option<Arc<Subscription>> {
        self.subscriptions.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: u32) {
        self.subscriptions.lock().remove(&id);
    }

    pub fn count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Push an incremental report to every subscription selecting the
    /// changed path, honouring each subscription's min-interval floor.
    pub fn notify_change(
        &self,
        model: &NodeModel,
        endpoint: EndpointNumber,
        cluster: ClusterId,
        attribute: AttributeId,
        now: Instant,
    ) {
        let subscriptions: Vec<Arc<Subscription>> =
            self.subscriptions.lock().values().cloned().collect();
        for subscription in subscriptions {
            if !subscription.selects(endpoint, cluster, attribute) {
                continue;
            }
            {
                let last = subscription.last_report.lock();
                if now.duration_since(*last) < subscription.min_interval {
                    // Held below the floor; the next keepalive carries it.
                    continue;
                }
            }

            let handler = ReadHandler::new(model);
            let single = crate::messages::ReadRequest {
                attribute_requests: vec![
                    crate::messages::attribute_path(endpoint, cluster, attribute),
                ],
                fabric_filtered: subscription.request.read.fabric_filtered,
                ..crate::messages::ReadRequest::default()
            };
            let (reports, _) = handler.collect_reports(&single, subscription.fabric);
            for chunk in chunk_reports(reports, Vec::new(), Some(subscription.id)) {
                if subscription.sender.try_send(chunk).is_err() {
                    debug!(subscription = subscription.id, "subscriber queue full");
                }
            }
            *subscription.last_report.lock() = now;
        }
    }

    /// Send empty keepalive reports for subscriptions past their max
    /// interval.
    pub fn keepalive(&self, now: Instant) {
        let subscriptions: Vec<Arc<Subscription>> =
            self.subscriptions.lock().values().cloned().collect();
        for subscription in subscriptions {
            let due = {
                let last = subscription.last_report.lock();
                now.duration_since(*last) >= subscription.max_interval
            };
            if due {
                let report = ReportData {
                    subscription_id: Some(subscription.id),
                    suppress_response: false,
                    ..ReportData::default()
                };
                let _ = subscription.sender.try_send(report);
                *subscription.last_report.lock() = now;
            }
        }
    }
}

/// The status answer a subscriber returns after a report.
pub fn report_acknowledgement() -> StatusResponse {
    StatusResponse {
        status: Status::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AttributePathIb, ReadRequest};
    use crate::model::tests::test_model;
    use crate::model::{ClusterServer, CLUSTER_ON_OFF, ON_OFF_CMD_ON};

    fn subscribe_request(min: u64, max: u64) -> SubscribeRequest {
        SubscribeRequest {
            keep_subscriptions: true,
            min_interval_floor_secs: min,
            max_interval_ceiling_secs: max,
            read: ReadRequest {
                attribute_requests: vec![AttributePathIb {
                    endpoint: Some(1),
                    cluster: Some(CLUSTER_ON_OFF.0),
                    attribute: None,
                    list_index: None,
                }],
                fabric_filtered: true,
                ..ReadRequest::default()
            },
        }
    }

    #[tokio::test]
    async fn test_subscribe_primes_and_responds() {
        let (model, _) = test_model();
        let manager = SubscriptionManager::new();
        let (tx, mut rx) = mpsc::channel(16);

        let (response, _subscription) = manager
            .subscribe(
                &model,
                subscribe_request(0, 60),
                Some(FabricIndex(1)),
                WildcardPathFlags::default(),
                tx,
            )
            .unwrap();
        assert_eq!(response.max_interval_secs, 60);
        assert_eq!(manager.count(), 1);

        let prime = rx.recv().await.unwrap();
        assert_eq!(prime.subscription_id, Some(response.subscription_id));
        // OnOff: 6 globals plus the OnOff attribute.
        assert_eq!(prime.attribute_reports.len(), 7);
    }

    #[test]
    fn test_interval_bounds_validated() {
        let (model, _) = test_model();
        let manager = SubscriptionManager::new();
        let (tx, _rx) = mpsc::channel(16);

        let err = manager
            .subscribe(
                &model,
                subscribe_request(0, 65_536),
                None,
                WildcardPathFlags::default(),
                tx,
            )
            .unwrap_err();
        assert!(matches!(err, Error::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn test_change_notification() {
        let (model, on_off) = test_model();
        let manager = SubscriptionManager::new();
        let (tx, mut rx) = mpsc::channel(16);

        manager
            .subscribe(
                &model,
                subscribe_request(0, 60),
                Some(FabricIndex(1)),
                WildcardPathFlags::default(),
                tx,
            )
            .unwrap();
        rx.recv().await.unwrap(); // prime

        on_off.invoke(ON_OFF_CMD_ON, None);
        manager.notify_change(
            &model,
            EndpointNumber(1),
            CLUSTER_ON_OFF,
            AttributeId(0),
            Instant::now() + Duration::from_secs(1),
        );

        let update = rx.recv().await.unwrap();
        assert_eq!(update.attribute_reports.len(), 1);
    }

    #[tokio::test]
    async fn test_min_interval_floor_holds_reports() {
        let (model, _) = test_model();
        let manager = SubscriptionManager::new();
        let (tx, mut rx) = mpsc::channel(16);

        manager
            .subscribe(
                &model,
                subscribe_request(10, 60),
                Some(FabricIndex(1)),
                WildcardPathFlags::default(),
                tx,
            )
            .unwrap();
        rx.recv().await.unwrap(); // prime

        // A change right after the prime stays below the floor.
        manager.notify_change(
            &model,
            EndpointNumber(1),
            CLUSTER_ON_OFF,
            AttributeId(0),
            Instant::now(),
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_keepalive_after_max_interval() {
        let (model, _) = test_model();
        let manager = SubscriptionManager::new();
        let (tx, mut rx) = mpsc::channel(16);

        manager
            .subscribe(
                &model,
                subscribe_request(0, 1),
                Some(FabricIndex(1)),
                WildcardPathFlags::default(),
                tx,
            )
            .unwrap();
        rx.recv().await.unwrap(); // prime

        manager.keepalive(Instant::now() + Duration::from_secs(2));
        let keepalive = rx.recv().await.unwrap();
        assert!(keepalive.attribute_reports.is_empty());
        assert!(keepalive.subscription_id.is_some());
    }

    #[tokio::test]
    async fn test_keep_subscriptions_false_drops_prior() {
        let (model, _) = test_model();
        let manager = SubscriptionManager::new();
        let (tx, _rx) = mpsc::channel(64);

        manager
            .subscribe(
                &model,
                subscribe_request(0, 60),
                Some(FabricIndex(1)),
                WildcardPathFlags::default(),
                tx.clone(),
            )
            .unwrap();
        assert_eq!(manager.count(), 1);

        let mut request = subscribe_request(0, 60);
        request.keep_subscriptions = false;
        manager
            .subscribe(
                &model,
                request,
                Some(FabricIndex(1)),
                WildcardPathFlags::default(),
                tx,
            )
            .unwrap();
        assert_eq!(manager.count(), 1);
    }
}
