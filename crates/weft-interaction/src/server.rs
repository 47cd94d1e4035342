//! Interaction server
//!
//! Dispatches the Interaction Model opcodes to the read, subscribe,
//! write and invoke handlers, guarded by the timed-interaction state.
//! One server instance fronts one node's data model; the caller supplies
//! a per-request context naming the acting fabric and delivery channel.

use crate::invoke::InvokeHandler;
use crate::messages::{
    opcode, InvokeRequest, ReadRequest, ReportData, Status, StatusResponse, SubscribeRequest,
    TimedRequest, WriteRequest,
};
use crate::model::NodeModel;
use crate::path::WildcardPathFlags;
use crate::read::ReadHandler;
use crate::subscribe::SubscriptionManager;
use crate::timed::TimedInteraction;
use crate::write::WriteHandler;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;
use weft_core::types::FabricIndex;
use weft_core::Error;

/// Per-request context: who is asking and how answers flow back.
pub struct InteractionContext {
    pub fabric: Option<FabricIndex>,
    /// The request arrived on a group (multicast) session.
    pub is_group: bool,
    /// Delivery queue for subscription reports, when subscribing.
    pub subscriber: Option<mpsc::Sender<ReportData>>,
}

impl InteractionContext {
    pub fn unicast(fabric: FabricIndex) -> Self {
        Self {
            fabric: Some(fabric),
            is_group: false,
            subscriber: None,
        }
    }
}

/// One response message: opcode plus TLV payload.
pub type ResponseMessage = (u8, Vec<u8>);

/// The Interaction Model server.
pub struct InteractionServer {
    model: Arc<NodeModel>,
    subscriptions: Arc<SubscriptionManager>,
    timed: TimedInteraction,
    writes: WriteHandler,
    invokes: InvokeHandler,
    flags: WildcardPathFlags,
}

impl InteractionServer {
    pub fn new(model: Arc<NodeModel>) -> Arc<Self> {
        Self::with_limits(model, u16::MAX as usize, WildcardPathFlags::default())
    }

    /// Build with an invoke path cap and wildcard skip flags.
    pub fn with_limits(
        model: Arc<NodeModel>,
        max_paths_per_invoke: usize,
        flags: WildcardPathFlags,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            model: model.clone(),
            subscriptions: Arc::new(SubscriptionManager::new()),
            timed: TimedInteraction::new(),
            writes: WriteHandler::new(),
            invokes: InvokeHandler::new(max_paths_per_invoke),
            flags,
        });

        // Attribute changes feed the subscription stream.
        let weak_model: Weak<NodeModel> = Arc::downgrade(&model);
        let subscriptions = server.subscriptions.clone();
        model
            .attribute_changed
            .on(move |(endpoint, cluster, attribute)| {
                if let Some(model) = weak_model.upgrade() {
                    subscriptions.notify_change(
                        &model,
                        *endpoint,
                        *cluster,
                        *attribute,
                        Instant::now(),
                    );
                }
            });

        server
    }

    pub fn model(&self) -> &Arc<NodeModel> {
        &self.model
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Dispatch one Interaction Model message, producing zero or more
    /// response messages in send order.
    pub fn handle_message(
        &self,
        message_opcode: u8,
        payload: &[u8],
        context: &InteractionContext,
    ) -> weft_core::Result<Vec<ResponseMessage>> {
        let now = Instant::now();
        match message_opcode {
            opcode::TIMED_REQUEST => {
                let request = TimedRequest::from_tlv(payload)?;
                if context.is_group {
                    return Err(Error::UnexpectedData(
                        "timed request on a group session".into(),
                    ));
                }
                self.timed.arm(request.timeout_ms, now)?;
                debug!(timeout_ms = request.timeout_ms, "timed interaction armed");
                Ok(vec![status_response(Status::Success)])
            }
            opcode::READ_REQUEST => {
                let request = ReadRequest::from_tlv(payload)?;
                let handler = ReadHandler::new(&self.model).with_flags(self.flags);
                let chunks = handler.handle(&request, context.fabric);
                Ok(chunks
                    .into_iter()
                    .map(|chunk| (opcode::REPORT_DATA, chunk.to_tlv().encode()))
                    .collect())
            }
            opcode::SUBSCRIBE_REQUEST => {
                let request = SubscribeRequest::from_tlv(payload)?;
                let sender = context.subscriber.clone().ok_or_else(|| {
                    Error::Implementation("subscribe without a subscriber channel".into())
                })?;
                let (response, _subscription) = self.subscriptions.subscribe(
                    &self.model,
                    request,
                    context.fabric,
                    self.flags,
                    sender,
                )?;
                Ok(vec![(
                    opcode::SUBSCRIBE_RESPONSE,
                    response.to_tlv().encode(),
                )])
            }
            opcode::WRITE_REQUEST => {
                let request = WriteRequest::from_tlv(payload)?;
                self.timed
                    .admit(request.timed_request, context.is_group, now)?;
                let fabric = context.fabric.unwrap_or(FabricIndex(0));
                let response = self.writes.handle(&self.model, &request, fabric)?;
                if request.suppress_response || context.is_group {
                    return Ok(Vec::new());
                }
                Ok(vec![(opcode::WRITE_RESPONSE, response.to_tlv().encode())])
            }
            opcode::INVOKE_REQUEST => {
                let request = InvokeRequest::from_tlv(payload)?;
                self.timed
                    .admit(request.timed_request, context.is_group, now)?;
                let chunks = self.invokes.handle(&self.model, &request)?;
                if request.suppress_response || context.is_group {
                    return Ok(Vec::new());
                }
                Ok(chunks
                    .into_iter()
                    .map(|chunk| (opcode::INVOKE_RESPONSE, chunk.to_tlv().encode()))
                    .collect())
            }
            opcode::STATUS_RESPONSE => {
                // Subscriber acknowledgement of a report; nothing to send.
                let _ = StatusResponse::from_tlv(payload)?;
                Ok(Vec::new())
            }
            other => Err(Error::MatterFlow(format!(
                "unexpected interaction opcode {other:#04x}"
            ))),
        }
    }

    /// Map a handler error onto the StatusResponse the peer receives.
    pub fn error_response(err: &Error) -> ResponseMessage {
        let status = match err {
            Error::MalformedRequest(_) => Status::InvalidAction,
            Error::UnexpectedData(message) if message.contains("Timed request window expired") => {
                Status::Timeout
            }
            Error::UnexpectedData(_) => Status::TimedRequestMismatch,
            _ => Status::Failure,
        };
        status_response(status)
    }
}

fn status_response(status: Status) -> ResponseMessage {
    (
        opcode::STATUS_RESPONSE,
        StatusResponse { status }.to_tlv().encode(),
    )
}
