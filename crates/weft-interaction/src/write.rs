//! Write handling
//!
//! Ordered write lists with mass-write expansion, chunked-array
//! REPLACE_ALL + APPEND semantics across messages, fabric-index override
//! on fabric-scoped list entries, and per-path status responses.

use crate::messages::{Status, WriteData, WriteRequest, WriteResponse, WriteResponseStatus};
use crate::model::{NodeModel, WriteOperation};
use crate::path::{expand_attribute_path, AttributePath, PathExpansion, UnsupportedPath};
use parking_lot::Mutex;
use weft_core::tlv::{Tag, TlvElement, TlvValue};
use weft_core::types::{AttributeId, ClusterId, EndpointNumber, FabricIndex};
use weft_core::Error;

/// Context tag carrying the fabric index inside fabric-scoped entries.
const FABRIC_INDEX_TAG: u8 = 254;

/// A chunked list write in progress, keyed by its concrete path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OngoingListWrite {
    endpoint: EndpointNumber,
    cluster: ClusterId,
    attribute: AttributeId,
}

/// Server-side write evaluation with cross-message chunk state.
pub struct WriteHandler {
    ongoing: Mutex<Option<OngoingListWrite>>,
}

impl Default for WriteHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteHandler {
    pub fn new() -> Self {
        Self {
            ongoing: Mutex::new(None),
        }
    }

    /// Validate the request's path shapes before touching any data.
    ///
    /// Wildcard endpoints are allowed (mass write); a wildcard cluster or
    /// attribute is not, and in particular a concrete endpoint with a
    /// wildcard attribute is rejected outright.
    fn validate_paths(request: &WriteRequest) -> weft_core::Result<()> {
        for write in &request.write_requests {
            if write.path.cluster.is_none() {
                return Err(Error::MalformedRequest(
                    "write path must name a concrete cluster".into(),
                ));
            }
            if write.path.attribute.is_none() {
                return Err(Error::MalformedRequest(
                    "write path must name a concrete attribute".into(),
                ));
            }
        }
        Ok(())
    }

    /// Apply one write message on behalf of the acting session's fabric.
    pub fn handle(
        &self,
        model: &NodeModel,
        request: &WriteRequest,
        fabric: FabricIndex,
    ) -> weft_core::Result<WriteResponse> {
        Self::validate_paths(request)?;

        let mut responses = Vec::new();
        for write in &request.write_requests {
            self.apply_one(model, write, fabric, &mut responses);
        }

        if !request.more_chunked_messages {
            *self.ongoing.lock() = None;
        }
        Ok(WriteResponse {
            write_responses: responses,
        })
    }

    fn apply_one(
        &self,
        model: &NodeModel,
        write: &WriteData,
        fabric: FabricIndex,
        responses: &mut Vec<WriteResponseStatus>,
    ) {
        let path = AttributePath::from_ib(&write.path);
        let expansion = expand_attribute_path(model, &path, Default::default());
        let concrete_paths = match expansion {
            PathExpansion::Unsupported(level) => {
                let status = match level {
                    UnsupportedPath::Endpoint => Status::UnsupportedEndpoint,
                    UnsupportedPath::Cluster => Status::UnsupportedCluster,
                    UnsupportedPath::Attribute => Status::UnsupportedAttribute,
                };
                responses.push(WriteResponseStatus {
                    path: write.path,
                    status,
                    cluster_status: None,
                });
                return;
            }
            PathExpansion::Concrete(paths) => paths,
        };

        for concrete in concrete_paths {
            let Some(cluster) = model.cluster(concrete.endpoint, concrete.cluster) else {
                continue;
            };

            // Data-version precondition.
            if let Some(expected) = write.data_version {
                if cluster.data_version().0 != expected {
                    responses.push(WriteResponseStatus {
                        path: concrete.to_ib(),
                        status: Status::DataVersionMismatch,
                        cluster_status: None,
                    });
                    continue;
                }
            }

            let meta = cluster
                .attributes()
                .into_iter()
                .find(|meta| meta.id == concrete.attribute);
            let fabric_scoped = meta.map(|m| m.fabric_scoped_list).unwrap_or(false);

            // Chunked arrays: an absent listIndex replaces, a null
            // listIndex appends to the list opened by the replace.
            let operation = match write.path.list_index {
                None => {
                    if matches!(write.data.value, TlvValue::Array(_)) {
                        *self.ongoing.lock() = Some(OngoingListWrite {
                            endpoint: concrete.endpoint,
                            cluster: concrete.cluster,
                            attribute: concrete.attribute,
                        });
                    }
                    WriteOperation::Replace
                }
                Some(None) => {
                    let ongoing = *self.ongoing.lock();
                    if ongoing
                        != Some(OngoingListWrite {
                            endpoint: concrete.endpoint,
                            cluster: concrete.cluster,
                            attribute: concrete.attribute,
                        })
                    {
                        responses.push(WriteResponseStatus {
                            path: concrete.to_ib(),
                            status: Status::InvalidAction,
                            cluster_status: None,
                        });
                        continue;
                    }
                    WriteOperation::AppendItem
                }
                Some(Some(_)) => {
                    responses.push(WriteResponseStatus {
                        path: concrete.to_ib(),
                        status: Status::InvalidAction,
                        cluster_status: None,
                    });
                    continue;
                }
            };

            let data = if fabric_scoped {
                override_fabric_index(&write.data, fabric)
            } else {
                write.data.clone()
            };

            let status = match cluster.write_attribute(concrete.attribute, &data, operation, fabric)
            {
                Ok(()) => {
                    model.notify_changed(concrete.endpoint, concrete.cluster, concrete.attribute);
                    Status::Success
                }
                Err(status) => status,
            };
            responses.push(WriteResponseStatus {
                path: concrete.to_ib(),
                status,
                cluster_status: None,
            });
        }
    }
}

/// Replace the fabric-index field of fabric-scoped entries with the
/// session's fabric index. Entries claiming another fabric (group writes
/// carry a literal index) are accepted but always overridden.
fn override_fabric_index(data: &TlvElement, fabric: FabricIndex) -> TlvElement {
    fn rewrite_entry(entry: &TlvElement, fabric: FabricIndex) -> TlvElement {
        let TlvValue::Struct(fields) = &entry.value else {
            return entry.clone();
        };
        let mut fields: Vec<TlvElement> = fields
            .iter()
            .filter(|field| field.tag != Tag::Context(FABRIC_INDEX_TAG))
            .cloned()
            .collect();
        fields.push(TlvElement::unsigned(
            Tag::Context(FABRIC_INDEX_TAG),
            fabric.0 as u64,
        ));
        TlvElement::new(entry.tag, TlvValue::Struct(fields))
    }

    match &data.value {
        TlvValue::Array(entries) => TlvElement::new(
            data.tag,
            TlvValue::Array(
                entries
                    .iter()
                    .map(|entry| rewrite_entry(entry, fabric))
                    .collect(),
            ),
        ),
        TlvValue::Struct(_) => rewrite_entry(data, fabric),
        _ => data.clone(),
    }
}
