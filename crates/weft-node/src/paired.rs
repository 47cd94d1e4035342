//! PairedNode coordinator
//!
//! The user-facing synthesis of discovery, sessions and subscriptions for
//! one paired device: a four-state connection machine, endpoint-tree
//! materialization from Descriptor data, and a coalescing timer so bursts
//! of structure updates collapse into one rebuild.

use crate::structure::{
    build_endpoint_tree, classify_change, EndpointChange, EndpointDescriptor, EndpointTree,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use weft_core::observable::Observable;
use weft_core::types::{EndpointNumber, NodeId};
use weft_core::Result;

/// Bursty structure updates coalesce for this long before applying.
pub const STRUCTURE_UPDATE_COALESCE: Duration = Duration::from_secs(5);

/// Connection state of a paired node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Initial state, or stopped by the controller.
    Disconnected,
    /// Trying known addresses.
    Reconnecting,
    /// All sessions lost; waiting for mDNS to find the device again.
    WaitingForDeviceDiscovery,
    /// Subscription alive.
    Connected,
}

/// Emitted when the endpoint tree changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructureEvent {
    EndpointAdded(EndpointNumber),
    EndpointRemoved(EndpointNumber),
    EndpointChanged(EndpointNumber),
    /// Always last in an update batch.
    StructureChanged,
}

/// Coordinator for one paired device.
pub struct PairedNode {
    pub node_id: NodeId,
    state: RwLock<NodeState>,
    /// Emitted on every state transition.
    pub state_changed: Observable<NodeState>,
    /// Structure events; held back until the node is Connected.
    pub structure_events: Observable<StructureEvent>,
    tree: RwLock<Option<EndpointTree>>,
    pending_descriptors: Mutex<Option<Vec<EndpointDescriptor>>>,
    deferred_events: Mutex<Vec<StructureEvent>>,
    update_timer: Mutex<Option<JoinHandle<()>>>,
    coalesce_delay: Duration,
}

impl PairedNode {
    pub fn new(node_id: NodeId) -> Arc<Self> {
        Self::with_coalesce_delay(node_id, STRUCTURE_UPDATE_COALESCE)
    }

    pub fn with_coalesce_delay(node_id: NodeId, coalesce_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            state: RwLock::new(NodeState::Disconnected),
            state_changed: Observable::new(),
            structure_events: Observable::new(),
            tree: RwLock::new(None),
            pending_descriptors: Mutex::new(None),
            deferred_events: Mutex::new(Vec::new()),
            update_timer: Mutex::new(None),
            coalesce_delay,
        })
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// The current endpoint tree, if one has been materialized.
    pub fn endpoint_tree(&self) -> Option<EndpointTree> {
        self.tree.read().clone()
    }

    fn set_state(&self, next: NodeState) {
        {
            let mut state = self.state.write();
            if *state == next {
                return;
            }
            debug!(node = %self.node_id, from = ?*state, to = ?next, "state transition");
            *state = next;
        }
        self.state_changed.emit(&next);
    }

    fn pause_timer(&self) {
        if let Some(handle) = self.update_timer.lock().take() {
            handle.abort();
        }
    }

    /// Begin connecting. Only meaningful from Disconnected.
    pub fn connect(&self) {
        if self.state() == NodeState::Disconnected {
            self.set_state(NodeState::Reconnecting);
        }
    }

    /// Controller-initiated stop (also used after decommissioning).
    pub fn disconnect(&self) {
        self.pause_timer();
        self.set_state(NodeState::Disconnected);
    }

    /// Release the node entirely.
    pub fn close(&self) {
        self.disconnect();
    }

    /// Feed the subscription status observer.
    pub fn handle_subscription_status(self: &Arc<Self>, alive: bool) {
        match (self.state(), alive) {
            (NodeState::Reconnecting, true) => {
                self.set_state(NodeState::Connected);
                self.flush_deferred();
                // A structure update parked during reconnect applies now.
                if self.pending_descriptors.lock().is_some() {
                    self.schedule_structure_update();
                }
            }
            (NodeState::Connected, false) => {
                info!(node = %self.node_id, "subscription inactive, reconnecting");
                self.pause_timer();
                self.set_state(NodeState::Reconnecting);
            }
            _ => {}
        }
    }

    /// The last session went offline.
    pub fn handle_all_sessions_lost(&self) {
        if matches!(
            self.state(),
            NodeState::Reconnecting | NodeState::Connected
        ) {
            self.pause_timer();
            self.set_state(NodeState::WaitingForDeviceDiscovery);
        }
    }

    /// mDNS found the device again.
    pub fn handle_device_discovered(&self) {
        if self.state() == NodeState::WaitingForDeviceDiscovery {
            self.set_state(NodeState::Reconnecting);
        }
    }

    fn emit_or_defer(&self, event: StructureEvent) {
        if self.state() == NodeState::Connected {
            self.structure_events.emit(&event);
        } else {
            self.deferred_events.lock().push(event);
        }
    }

    fn flush_deferred(&self) {
        let events: Vec<StructureEvent> = self.deferred_events.lock().drain(..).collect();
        for event in events {
            self.structure_events.emit(&event);
        }
    }

    /// Ingest a full set of Descriptor data.
    ///
    /// The first set materializes the tree immediately. Later sets are
    /// coalesced: a single timer (restarted, never stacked) applies the
    /// newest set after the coalesce delay, and only while Connected.
    pub fn ingest_structure(self: &Arc<Self>, descriptors: Vec<EndpointDescriptor>) -> Result<()> {
        if self.tree.read().is_none() {
            let tree = build_endpoint_tree(&descriptors)?;
            let numbers = tree.numbers();
            *self.tree.write() = Some(tree);
            for number in numbers {
                self.emit_or_defer(StructureEvent::EndpointAdded(number));
            }
            self.emit_or_defer(StructureEvent::StructureChanged);
            return Ok(());
        }

        *self.pending_descriptors.lock() = Some(descriptors);
        if self.state() == NodeState::Connected {
            self.schedule_structure_update();
        }
        Ok(())
    }

    fn schedule_structure_update(self: &Arc<Self>) {
        let mut timer = self.update_timer.lock();
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        let node = self.clone();
        let delay = self.coalesce_delay;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = node.apply_pending_structure() {
                warn!(node = %node.node_id, "structure update failed: {err}");
            }
        }));
    }

    fn apply_pending_structure(&self) -> Result<()> {
        let Some(descriptors) = self.pending_descriptors.lock().take() else {
            return Ok(());
        };
        let new_tree = build_endpoint_tree(&descriptors)?;

        let old_tree = self
            .tree
            .read()
            .clone()
            .unwrap_or_default();

        let mut events = Vec::new();
        for number in new_tree.numbers() {
            match old_tree.node(number) {
                None => events.push(StructureEvent::EndpointAdded(number)),
                Some(old_node) => {
                    let new_node = new_tree.node(number).map(|n| &n.descriptor);
                    if let Some(new_descriptor) = new_node {
                        match classify_change(&old_node.descriptor, new_descriptor) {
                            EndpointChange::Recreated => {
                                events.push(StructureEvent::EndpointChanged(number))
                            }
                            EndpointChange::Retained | EndpointChange::Unchanged => {}
                        }
                    }
                }
            }
        }
        for number in old_tree.numbers() {
            if !new_tree.contains(number) {
                events.push(StructureEvent::EndpointRemoved(number));
            }
        }

        *self.tree.write() = Some(new_tree);
        for event in events {
            self.emit_or_defer(event);
        }
        self.emit_or_defer(StructureEvent::StructureChanged);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use weft_core::types::{ClusterId, DeviceTypeId};

    fn descriptor(number: u16, parts: &[u16]) -> EndpointDescriptor {
        EndpointDescriptor {
            number: EndpointNumber(number),
            device_types: vec![(DeviceTypeId(0x100), 1)],
            server_list: vec![ClusterId(0x06)],
            client_list: Vec::new(),
            parts_list: parts.iter().map(|n| EndpointNumber(*n)).collect(),
        }
    }

    fn connected_node() -> Arc<PairedNode> {
        let node = PairedNode::with_coalesce_delay(NodeId(1), Duration::from_millis(50));
        node.connect();
        node.handle_subscription_status(true);
        assert_eq!(node.state(), NodeState::Connected);
        node
    }

    #[tokio::test]
    async fn test_state_machine_paths() {
        let node = PairedNode::new(NodeId(1));
        assert_eq!(node.state(), NodeState::Disconnected);

        node.connect();
        assert_eq!(node.state(), NodeState::Reconnecting);

        node.handle_subscription_status(true);
        assert_eq!(node.state(), NodeState::Connected);

        node.handle_subscription_status(false);
        assert_eq!(node.state(), NodeState::Reconnecting);

        node.handle_all_sessions_lost();
        assert_eq!(node.state(), NodeState::WaitingForDeviceDiscovery);

        // A live subscription report alone cannot leave discovery-wait.
        node.handle_subscription_status(true);
        assert_eq!(node.state(), NodeState::WaitingForDeviceDiscovery);

        node.handle_device_discovered();
        assert_eq!(node.state(), NodeState::Reconnecting);

        node.disconnect();
        assert_eq!(node.state(), NodeState::Disconnected);

        // connect() is the only way out of Disconnected.
        node.handle_device_discovered();
        assert_eq!(node.state(), NodeState::Disconnected);
    }

    #[tokio::test]
    async fn test_first_ingest_emits_added_and_structure_changed() {
        let node = connected_node();
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = events.clone();
        node.structure_events.on(move |event| seen.lock().push(*event));

        node.ingest_structure(vec![
            descriptor(0, &[1, 2]),
            descriptor(1, &[]),
            descriptor(2, &[]),
        ])
        .unwrap();

        let seen = events.lock();
        assert_eq!(seen.len(), 4);
        assert_eq!(*seen.last().unwrap(), StructureEvent::StructureChanged);
        assert!(seen.contains(&StructureEvent::EndpointAdded(EndpointNumber(1))));
    }

    #[tokio::test]
    async fn test_events_deferred_until_connected() {
        let node = PairedNode::with_coalesce_delay(NodeId(1), Duration::from_millis(50));
        node.connect();
        assert_eq!(node.state(), NodeState::Reconnecting);

        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        node.structure_events.on(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        node.ingest_structure(vec![descriptor(0, &[])]).unwrap();
        // Nothing while reconnecting.
        assert_eq!(count.load(Ordering::SeqCst), 0);

        node.handle_subscription_status(true);
        // Added(0) + StructureChanged flushed on connect.
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_updates_coalesce_into_one_apply() {
        let node = connected_node();
        node.ingest_structure(vec![descriptor(0, &[])]).unwrap();

        let structure_changes = Arc::new(AtomicU32::new(0));
        let seen = structure_changes.clone();
        node.structure_events.on(move |event| {
            if *event == StructureEvent::StructureChanged {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Two rapid updates: the timer restarts, one apply runs.
        node.ingest_structure(vec![descriptor(0, &[1]), descriptor(1, &[])])
            .unwrap();
        node.ingest_structure(vec![descriptor(0, &[1, 2]), descriptor(1, &[]), descriptor(2, &[])])
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(structure_changes.load(Ordering::SeqCst), 1);

        // The newest set won.
        let tree = node.endpoint_tree().unwrap();
        assert_eq!(tree.len(), 3);
    }

    #[tokio::test]
    async fn test_update_paused_during_reconnect() {
        let node = connected_node();
        node.ingest_structure(vec![descriptor(0, &[])]).unwrap();

        node.handle_subscription_status(false);
        node.ingest_structure(vec![descriptor(0, &[1]), descriptor(1, &[])])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Parked: the tree is unchanged while reconnecting.
        assert_eq!(node.endpoint_tree().unwrap().len(), 1);

        node.handle_subscription_status(true);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(node.endpoint_tree().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_recreate_vs_retain_events() {
        let node = connected_node();
        node.ingest_structure(vec![descriptor(0, &[1]), descriptor(1, &[])])
            .unwrap();

        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = events.clone();
        node.structure_events.on(move |event| seen.lock().push(*event));

        // Endpoint 1 gains a server cluster: recreated.
        let mut changed = descriptor(1, &[]);
        changed.server_list.push(ClusterId(0x1D));
        node.ingest_structure(vec![descriptor(0, &[1]), changed])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let seen = events.lock();
        assert!(seen.contains(&StructureEvent::EndpointChanged(EndpointNumber(1))));
        assert_eq!(*seen.last().unwrap(), StructureEvent::StructureChanged);
    }

    #[tokio::test]
    async fn test_cycle_keeps_old_tree() {
        let node = connected_node();
        node.ingest_structure(vec![descriptor(0, &[])]).unwrap();

        // A cyclic update fails and the old tree stays exposed.
        node.ingest_structure(vec![
            descriptor(0, &[]),
            descriptor(1, &[2]),
            descriptor(2, &[1]),
        ])
        .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(node.endpoint_tree().unwrap().len(), 1);
    }
}
