//! Read handling
//!
//! Expands the requested paths, applies data-version and event filters,
//! and chunks the resulting reports into DataReport messages.

use crate::messages::{
    AttributeReport, AttributeStatus, AttributeValue, EventReport, ReadRequest, ReportData, Status,
};
use crate::model::{read_cluster_attribute, NodeModel};
use crate::path::{
    expand_attribute_path, AttributePath, PathExpansion, UnsupportedPath, WildcardPathFlags,
};
use weft_core::types::{ClusterId, EndpointNumber, FabricIndex};

/// Soft budget for one DataReport's encoded payload.
const REPORT_CHUNK_BUDGET: usize = 900;

/// Server-side read evaluation.
pub struct ReadHandler<'a> {
    model: &'a NodeModel,
    flags: WildcardPathFlags,
}

impl<'a> ReadHandler<'a> {
    pub fn new(model: &'a NodeModel) -> Self {
        Self {
            model,
            flags: WildcardPathFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: WildcardPathFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Produce every report the request selects, unchunked.
    pub fn collect_reports(
        &self,
        request: &ReadRequest,
        fabric: Option<FabricIndex>,
    ) -> (Vec<AttributeReport>, Vec<EventReport>) {
        let fabric_filter = if request.fabric_filtered { fabric } else { None };
        let mut reports = Vec::new();

        for path_ib in &request.attribute_requests {
            let path = AttributePath::from_ib(path_ib);
            match expand_attribute_path(self.model, &path, self.flags) {
                PathExpansion::Unsupported(level) => {
                    let status = match level {
                        UnsupportedPath::Endpoint => Status::UnsupportedEndpoint,
                        UnsupportedPath::Cluster => Status::UnsupportedCluster,
                        UnsupportedPath::Attribute => Status::UnsupportedAttribute,
                    };
                    reports.push(AttributeReport::Status(AttributeStatus {
                        path: *path_ib,
                        status,
                        cluster_status: None,
                    }));
                }
                PathExpansion::Concrete(paths) => {
                    for concrete in paths {
                        let Some(cluster) =
                            self.model.cluster(concrete.endpoint, concrete.cluster)
                        else {
                            continue;
                        };
                        let version = cluster.data_version();
                        if self.version_suppressed(request, concrete.endpoint, concrete.cluster) {
                            continue;
                        }
                        match read_cluster_attribute(
                            cluster.as_ref(),
                            concrete.attribute,
                            fabric_filter,
                        ) {
                            Ok(value) => reports.push(AttributeReport::Value(AttributeValue {
                                path: concrete.to_ib(),
                                data_version: version.0,
                                value,
                            })),
                            Err(status) => {
                                reports.push(AttributeReport::Status(AttributeStatus {
                                    path: concrete.to_ib(),
                                    status,
                                    cluster_status: None,
                                }))
                            }
                        }
                    }
                }
            }
        }

        let events = self.collect_events(request);
        (reports, events)
    }

    /// Whether a matching data-version filter suppresses this cluster's
    /// attribute values.
    fn version_suppressed(
        &self,
        request: &ReadRequest,
        endpoint: EndpointNumber,
        cluster_id: ClusterId,
    ) -> bool {
        request.data_version_filters.iter().any(|filter| {
            filter.endpoint == endpoint.0
                && filter.cluster == cluster_id.0
                && self
                    .model
                    .cluster(endpoint, cluster_id)
                    .map(|cluster| cluster.data_version().0 == filter.data_version)
                    .unwrap_or(false)
        })
    }

    fn collect_events(&self, request: &ReadRequest) -> Vec<EventReport> {
        let event_min = request
            .event_filters
            .iter()
            .map(|filter| filter.event_min)
            .max()
            .unwrap_or(0);

        let mut events = Vec::new();
        for path in &request.event_requests {
            let endpoints: Vec<EndpointNumber> = match path.endpoint {
                Some(endpoint) => vec![EndpointNumber(endpoint)],
                None => self.model.endpoints().map(|e| e.number).collect(),
            };
            for endpoint_number in endpoints {
                let Some(endpoint) = self.model.endpoint(endpoint_number) else {
                    continue;
                };
                let clusters: Vec<ClusterId> = match path.cluster {
                    Some(cluster) => vec![ClusterId(cluster)],
                    None => endpoint.cluster_ids(),
                };
                for cluster_id in clusters {
                    let Some(cluster) = endpoint.cluster(cluster_id) else {
                        continue;
                    };
                    for record in cluster.read_events(event_min) {
                        if let Some(wanted) = path.event {
                            if record.event.0 != wanted {
                                continue;
                            }
                        }
                        events.push(EventReport {
                            path: crate::messages::event_path(
                                endpoint_number,
                                cluster_id,
                                record.event,
                            ),
                            event_number: record.event_number,
                            data: record.data,
                        });
                    }
                }
            }
        }
        events
    }

    /// Evaluate a read and chunk the reports into DataReport messages.
    /// The final chunk clears `moreChunkedMessages`.
    pub fn handle(&self, request: &ReadRequest, fabric: Option<FabricIndex>) -> Vec<ReportData> {
        let (reports, events) = self.collect_reports(request, fabric);
        chunk_reports(reports, events, None)
    }
}

/// Split reports into size-bounded DataReport messages.
pub fn chunk_reports(
    attribute_reports: Vec<AttributeReport>,
    event_reports: Vec<EventReport>,
    subscription_id: Option<u32>,
) -> Vec<ReportData> {
    let mut chunks: Vec<ReportData> = Vec::new();
    let mut current = ReportData {
        subscription_id,
        suppress_response: false,
        ..ReportData::default()
    };

    let mut flush =
        |current: &mut ReportData, chunks: &mut Vec<ReportData>| {
            current.more_chunked_messages = true;
            chunks.push(std::mem::replace(
                current,
                ReportData {
                    subscription_id,
                    ..ReportData::default()
                },
            ));
        };

    for report in attribute_reports {
        current.attribute_reports.push(report);
        if current.to_tlv().encode().len() > REPORT_CHUNK_BUDGET {
            let spill = current.attribute_reports.pop();
            if current.attribute_reports.is_empty() {
                // A single oversized report still ships alone.
                if let Some(spill) = spill {
                    current.attribute_reports.push(spill);
                }
                flush(&mut current, &mut chunks);
            } else {
                flush(&mut current, &mut chunks);
                if let Some(spill) = spill {
                    current.attribute_reports.push(spill);
                }
            }
        }
    }
    for event in event_reports {
        current.event_reports.push(event);
        if current.to_tlv().encode().len() > REPORT_CHUNK_BUDGET {
            let spill = current.event_reports.pop();
            if current.attribute_reports.is_empty() && current.event_reports.is_empty() {
                if let Some(spill) = spill {
                    current.event_reports.push(spill);
                }
                flush(&mut current, &mut chunks);
            } else {
                flush(&mut current, &mut chunks);
                if let Some(spill) = spill {
                    current.event_reports.push(spill);
                }
            }
        }
    }

    chunks.push(current);
    chunks
}
