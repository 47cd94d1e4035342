//! Invoke handling
//!
//! Ordered multi-command batches with commandRef bookkeeping, batch
//! validation before any side effect, and size-chunked response streams.

use crate::messages::{
    InvokeCommand, InvokeRequest, InvokeResponse, InvokeResponseItem, Status,
};
use crate::model::{InvokeResult, NodeModel};
use std::collections::HashSet;
use weft_core::types::{ClusterId, CommandId, EndpointNumber};
use weft_core::Error;

/// Soft budget for one InvokeResponse's encoded payload.
const INVOKE_CHUNK_BUDGET: usize = 900;

/// Server-side invoke evaluation.
pub struct InvokeHandler {
    max_paths_per_invoke: usize,
}

impl Default for InvokeHandler {
    fn default() -> Self {
        Self::new(u16::MAX as usize)
    }
}

impl InvokeHandler {
    pub fn new(max_paths_per_invoke: usize) -> Self {
        Self {
            max_paths_per_invoke,
        }
    }

    /// Validate the batch shape. Failures here reject the whole request
    /// before any handler runs.
    fn validate(&self, request: &InvokeRequest) -> weft_core::Result<()> {
        let commands = &request.invoke_requests;
        if commands.len() > self.max_paths_per_invoke {
            return Err(Error::MalformedRequest(format!(
                "{} invoke paths exceed the limit of {}",
                commands.len(),
                self.max_paths_per_invoke
            )));
        }
        if commands.len() > 1 {
            let mut refs = HashSet::new();
            let mut paths = HashSet::new();
            for command in commands {
                match command.command_ref {
                    Some(reference) => {
                        if !refs.insert(reference) {
                            return Err(Error::MalformedRequest(format!(
                                "duplicate commandRef {reference} in batch"
                            )));
                        }
                    }
                    None => {
                        return Err(Error::MalformedRequest(
                            "every command in a batch needs a commandRef".into(),
                        ))
                    }
                }
                if command.path.is_wildcard() {
                    return Err(Error::MalformedRequest(
                        "wildcard command paths are not allowed in a batch".into(),
                    ));
                }
                if !paths.insert(command.path) {
                    return Err(Error::MalformedRequest(
                        "duplicate command path in batch".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Run the batch and chunk the response stream.
    pub fn handle(
        &self,
        model: &NodeModel,
        request: &InvokeRequest,
    ) -> weft_core::Result<Vec<InvokeResponse>> {
        self.validate(request)?;

        let mut items = Vec::new();
        for command in &request.invoke_requests {
            self.invoke_one(model, command, &mut items);
        }
        Ok(chunk_invoke_responses(items, request.suppress_response))
    }

    fn invoke_one(
        &self,
        model: &NodeModel,
        command: &InvokeCommand,
        items: &mut Vec<InvokeResponseItem>,
    ) {
        let endpoints: Vec<EndpointNumber> = match command.path.endpoint {
            Some(endpoint) => vec![EndpointNumber(endpoint)],
            None => model.endpoints().map(|e| e.number).collect(),
        };
        let wildcard = command.path.endpoint.is_none();
        let Some(cluster_id) = command.path.cluster.map(ClusterId) else {
            items.push(status_item(command, Status::InvalidAction));
            return;
        };
        let Some(command_id) = command.path.command.map(CommandId) else {
            items.push(status_item(command, Status::InvalidAction));
            return;
        };

        let mut matched = false;
        for endpoint_number in endpoints {
            let Some(endpoint) = model.endpoint(endpoint_number) else {
                if !wildcard {
                    items.push(status_item(command, Status::UnsupportedEndpoint));
                }
                continue;
            };
            let Some(cluster) = endpoint.cluster(cluster_id) else {
                if !wildcard {
                    items.push(status_item(command, Status::UnsupportedCluster));
                }
                continue;
            };
            matched = true;

            // Unknown commands surface as a per-command status.
            if !cluster.accepted_commands().contains(&command_id) {
                items.push(status_item(command, Status::UnsupportedCommand));
                continue;
            }

            match cluster.invoke(command_id, command.fields.as_ref()) {
                InvokeResult::Success => items.push(status_item(command, Status::Success)),
                InvokeResult::Status {
                    status,
                    cluster_status,
                } => items.push(InvokeResponseItem::Status {
                    path: command.path,
                    command_ref: command.command_ref,
                    status,
                    cluster_status,
                }),
                InvokeResult::Response {
                    command: response_command,
                    data,
                } => items.push(InvokeResponseItem::Command {
                    path: crate::messages::CommandPathIb {
                        endpoint: Some(endpoint_number.0),
                        cluster: Some(cluster_id.0),
                        command: Some(response_command.0),
                    },
                    command_ref: command.command_ref,
                    data: Some(data),
                }),
            }
        }

        // A wildcard that matched nothing reports once.
        if wildcard && !matched {
            items.push(status_item(command, Status::UnsupportedCluster));
        }
    }
}

fn status_item(command: &InvokeCommand, status: Status) -> InvokeResponseItem {
    InvokeResponseItem::Status {
        path: command.path,
        command_ref: command.command_ref,
        status,
        cluster_status: None,
    }
}

/// Split response items into size-bounded InvokeResponse messages.
pub fn chunk_invoke_responses(
    items: Vec<InvokeResponseItem>,
    suppress_response: bool,
) -> Vec<InvokeResponse> {
    let mut chunks: Vec<InvokeResponse> = Vec::new();
    let mut current = InvokeResponse {
        suppress_response,
        ..InvokeResponse::default()
    };

    for item in items {
        current.invoke_responses.push(item);
        if current.to_tlv().encode().len() > INVOKE_CHUNK_BUDGET && current.invoke_responses.len() > 1
        {
            let spill = current.invoke_responses.pop();
            current.more_chunked_messages = true;
            chunks.push(std::mem::replace(
                &mut current,
                InvokeResponse {
                    suppress_response,
                    ..InvokeResponse::default()
                },
            ));
            if let Some(spill) = spill {
                current.invoke_responses.push(spill);
            }
        }
    }
    chunks.push(current);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::CommandPathIb;
    use crate::model::tests::test_model;
    use crate::model::CLUSTER_ON_OFF;
    use weft_core::tlv::{Tag, TlvElement};

    fn command(command_id: u32, command_ref: u16) -> InvokeCommand {
        InvokeCommand {
            path: CommandPathIb {
                endpoint: Some(1),
                cluster: Some(CLUSTER_ON_OFF.0),
                command: Some(command_id),
            },
            fields: None,
            command_ref: Some(command_ref),
        }
    }

    fn single_chunk(responses: Vec<InvokeResponse>) -> InvokeResponse {
        assert_eq!(responses.len(), 1);
        responses.into_iter().next().unwrap()
    }

    #[test]
    fn test_multi_invoke_ordering_and_side_effects() {
        let (model, on_off) = test_model();
        let handler = InvokeHandler::default();

        let request = InvokeRequest {
            invoke_requests: vec![
                command(0, 1), // Off
                command(1, 2), // On
                command(2, 3), // Toggle
                command(100, 4),
            ],
            ..InvokeRequest::default()
        };
        let response = single_chunk(handler.handle(&model, &request).unwrap());
        assert_eq!(response.invoke_responses.len(), 4);

        let expectations = [
            (1u16, Status::Success),
            (2, Status::Success),
            (3, Status::Success),
            (4, Status::UnsupportedCommand),
        ];
        for (item, (expected_ref, expected_status)) in
            response.invoke_responses.iter().zip(expectations)
        {
            match item {
                InvokeResponseItem::Status {
                    command_ref,
                    status,
                    ..
                } => {
                    assert_eq!(*command_ref, Some(expected_ref));
                    assert_eq!(*status, expected_status);
                }
                other => panic!("unexpected item: {other:?}"),
            }
        }
        // Off, On, then Toggle leaves the cluster off.
        assert!(!on_off.is_on());
    }

    #[test]
    fn test_max_paths_per_invoke_rejects_before_side_effects() {
        let (model, on_off) = test_model();
        let handler = InvokeHandler::new(1);

        let request = InvokeRequest {
            invoke_requests: vec![command(1, 1), command(0, 2)],
            ..InvokeRequest::default()
        };
        let err = handler.handle(&model, &request).unwrap_err();
        assert!(matches!(err, Error::MalformedRequest(_)));
        // No command ran.
        assert!(!on_off.is_on());
    }

    #[test]
    fn test_duplicate_command_ref_rejected() {
        let (model, _) = test_model();
        let handler = InvokeHandler::default();
        let request = InvokeRequest {
            invoke_requests: vec![command(0, 7), command(1, 7)],
            ..InvokeRequest::default()
        };
        assert!(matches!(
            handler.handle(&model, &request).unwrap_err(),
            Error::MalformedRequest(_)
        ));
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let (model, _) = test_model();
        let handler = InvokeHandler::default();
        let request = InvokeRequest {
            invoke_requests: vec![command(1, 1), command(1, 2)],
            ..InvokeRequest::default()
        };
        assert!(matches!(
            handler.handle(&model, &request).unwrap_err(),
            Error::MalformedRequest(_)
        ));
    }

    #[test]
    fn test_wildcard_rejected_in_batch_but_allowed_alone() {
        let (model, on_off) = test_model();
        let handler = InvokeHandler::default();

        let wildcard = InvokeCommand {
            path: CommandPathIb {
                endpoint: None,
                cluster: Some(CLUSTER_ON_OFF.0),
                command: Some(1),
            },
            fields: None,
            command_ref: Some(1),
        };

        // In a batch: rejected.
        let request = InvokeRequest {
            invoke_requests: vec![wildcard.clone(), command(0, 2)],
            ..InvokeRequest::default()
        };
        assert!(handler.handle(&model, &request).is_err());

        // Alone: expands over endpoints carrying the cluster.
        let request = InvokeRequest {
            invoke_requests: vec![wildcard],
            ..InvokeRequest::default()
        };
        let response = single_chunk(handler.handle(&model, &request).unwrap());
        assert_eq!(response.invoke_responses.len(), 1);
        assert!(on_off.is_on());
    }

    #[test]
    fn test_missing_commands_need_no_ref_when_single() {
        let (model, _) = test_model();
        let handler = InvokeHandler::default();
        let request = InvokeRequest {
            invoke_requests: vec![InvokeCommand {
                path: CommandPathIb::concrete(EndpointNumber(1), CLUSTER_ON_OFF, CommandId(1)),
                fields: Some(TlvElement::structure(Tag::Anonymous, vec![])),
                command_ref: None,
            }],
            ..InvokeRequest::default()
        };
        let response = single_chunk(handler.handle(&model, &request).unwrap());
        match &response.invoke_responses[0] {
            InvokeResponseItem::Status {
                command_ref,
                status,
                ..
            } => {
                assert_eq!(*command_ref, None);
                assert_eq!(*status, Status::Success);
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn test_response_chunking() {
        let items: Vec<InvokeResponseItem> = (0..40)
            .map(|i| InvokeResponseItem::Status {
                path: CommandPathIb {
                    endpoint: Some(1),
                    cluster: Some(CLUSTER_ON_OFF.0),
                    command: Some(i),
                },
                command_ref: Some(i as u16),
                status: Status::Success,
                cluster_status: None,
            })
            .collect();
        let chunks = chunk_invoke_responses(items, false);
        assert!(chunks.len() > 1);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.more_chunked_messages);
        }
        assert!(!chunks.last().unwrap().more_chunked_messages);
        let total: usize = chunks.iter().map(|c| c.invoke_responses.len()).sum();
        assert_eq!(total, 40);
    }
}
