//! Session establishment for the weft Matter stack.
//!
//! Binds fabric identity and credentials to the CASE handshake: the
//! exchange layer frames protocol messages over a datagram channel, the
//! secure-channel messenger adds StatusReport semantics on top, and the
//! CASE initiator/responder run Sigma1/Sigma2/Sigma3 (or Sigma2Resume) to
//! install symmetric sessions through the session manager.

pub mod case;
pub mod exchange;
pub mod fabric;
pub mod messenger;
pub mod session;

pub use case::{CaseClient, CaseServer};
pub use exchange::{
    AbortSignal, ExchangeMessage, MessageChannel, MessageExchange, RetransmissionConfig,
};
pub use fabric::Fabric;
pub use messenger::SecureChannelMessenger;
pub use session::{ResumptionRecord, SecureSession, SessionManager, SessionParameters};
