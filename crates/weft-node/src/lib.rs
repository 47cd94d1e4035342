//! PairedNode coordination for the weft Matter stack.
//!
//! Sits above discovery, sessions and the Interaction Model: tracks the
//! connection state of one paired device, materializes its endpoint tree
//! from Descriptor-cluster data, and coalesces structure updates while a
//! subscription is live.

pub mod paired;
pub mod structure;
pub mod subscription;

pub use paired::{NodeState, PairedNode, StructureEvent};
pub use structure::{
    build_endpoint_tree, descriptors_from_reports, EndpointDescriptor, EndpointTree,
};
pub use subscription::ClientSubscription;
