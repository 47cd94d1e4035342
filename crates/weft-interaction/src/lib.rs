//! Interaction Model server for the weft Matter stack.
//!
//! Serves Read, Subscribe, Write and Invoke over an endpoint/cluster data
//! model: wildcard path expansion with skip flags, fabric filtering,
//! data-version suppression, chunked array writes, multi-command batches
//! and timed-interaction guards.

pub mod invoke;
pub mod messages;
pub mod model;
pub mod path;
pub mod read;
pub mod server;
pub mod subscribe;
pub mod timed;
pub mod write;

pub use messages::Status;
pub use model::{ClusterServer, Endpoint, NodeModel};
pub use path::{AttributePath, ConcreteAttributePath, WildcardPathFlags};
pub use server::{InteractionContext, InteractionServer};
