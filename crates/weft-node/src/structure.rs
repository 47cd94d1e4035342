//! Endpoint-tree reconstruction
//!
//! Rebuilds a device's endpoint tree from per-endpoint Descriptor data.
//! Children attach bottom-up: an endpoint joins the tree once exactly one
//! already-attached parent lists it in its parts list. Anything left over
//! when no candidate remains means a cycle, and no partial tree escapes.

use std::collections::{BTreeMap, BTreeSet};
use weft_core::types::{ClusterId, DeviceTypeId, EndpointNumber};
use weft_core::{Error, Result};

/// Descriptor-cluster data for one endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub number: EndpointNumber,
    pub device_types: Vec<(DeviceTypeId, u16)>,
    pub server_list: Vec<ClusterId>,
    pub client_list: Vec<ClusterId>,
    pub parts_list: Vec<EndpointNumber>,
}

/// One attached endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeNode {
    pub descriptor: EndpointDescriptor,
    /// Parent endpoint number; `None` only for the root.
    pub parent: Option<EndpointNumber>,
    pub children: Vec<EndpointNumber>,
}

/// A fully assembled endpoint tree, stored flat and linked by number.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointTree {
    nodes: BTreeMap<EndpointNumber, TreeNode>,
}

impl EndpointTree {
    pub fn node(&self, number: EndpointNumber) -> Option<&TreeNode> {
        self.nodes.get(&number)
    }

    pub fn numbers(&self) -> Vec<EndpointNumber> {
        self.nodes.keys().copied().collect()
    }

    pub fn children_of(&self, number: EndpointNumber) -> Vec<EndpointNumber> {
        self.nodes
            .get(&number)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, number: EndpointNumber) -> bool {
        self.nodes.contains_key(&number)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Assemble the tree from descriptor data.
///
/// Endpoint 0 is the root. Attachment repeats until the pool drains:
/// each round adopts the endpoints listed by exactly one already-attached
/// parent. A self-reference or a round with no progress raises an
/// internal error and nothing is exposed.
pub fn build_endpoint_tree(descriptors: &[EndpointDescriptor]) -> Result<EndpointTree> {
    let by_number: BTreeMap<EndpointNumber, &EndpointDescriptor> = descriptors
        .iter()
        .map(|descriptor| (descriptor.number, descriptor))
        .collect();

    if !by_number.contains_key(&EndpointNumber::ROOT) {
        return Err(Error::Internal("endpoint tree lacks a root endpoint".into()));
    }
    for descriptor in descriptors {
        if descriptor.parts_list.contains(&descriptor.number) {
            return Err(Error::Internal(format!(
                "endpoint {} references itself",
                descriptor.number.0
            )));
        }
    }

    let mut nodes: BTreeMap<EndpointNumber, TreeNode> = BTreeMap::new();
    nodes.insert(
        EndpointNumber::ROOT,
        TreeNode {
            descriptor: (*by_number[&EndpointNumber::ROOT]).clone(),
            parent: None,
            children: Vec::new(),
        },
    );

    let mut remaining: BTreeSet<EndpointNumber> = by_number
        .keys()
        .copied()
        .filter(|number| *number != EndpointNumber::ROOT)
        .collect();

    while !remaining.is_empty() {
        let mut attached_this_round = Vec::new();
        for candidate in remaining.iter().copied() {
            let parents: Vec<EndpointNumber> = nodes
                .keys()
                .copied()
                .filter(|attached| {
                    by_number
                        .get(attached)
                        .map(|d| d.parts_list.contains(&candidate))
                        .unwrap_or(false)
                })
                .collect();
            if parents.len() == 1 {
                attached_this_round.push((candidate, parents[0]));
            }
        }

        if attached_this_round.is_empty() {
            return Err(Error::Internal(
                "endpoint tree contains a cycle or unreachable endpoints".into(),
            ));
        }

        for (candidate, parent) in attached_this_round {
            if !remaining.remove(&candidate) {
                continue;
            }
            nodes.insert(
                candidate,
                TreeNode {
                    descriptor: (*by_number[&candidate]).clone(),
                    parent: Some(parent),
                    children: Vec::new(),
                },
            );
            if let Some(parent_node) = nodes.get_mut(&parent) {
                parent_node.children.push(candidate);
            }
        }
    }

    Ok(EndpointTree { nodes })
}

/// Collect per-endpoint Descriptor data out of a full report.
///
/// Only Descriptor-cluster attribute values contribute; endpoints whose
/// reports lack a parts list still appear (as leaves) so a flat device
/// with sparse reports assembles.
pub fn descriptors_from_reports(
    reports: &[weft_interaction::messages::AttributeReport],
) -> Vec<EndpointDescriptor> {
    use weft_interaction::messages::AttributeReport;
    use weft_interaction::model::{
        CLUSTER_DESCRIPTOR, DESCRIPTOR_CLIENT_LIST, DESCRIPTOR_DEVICE_TYPE_LIST,
        DESCRIPTOR_PARTS_LIST, DESCRIPTOR_SERVER_LIST,
    };

    let mut by_endpoint: BTreeMap<EndpointNumber, EndpointDescriptor> = BTreeMap::new();
    for report in reports {
        let AttributeReport::Value(value) = report else {
            continue;
        };
        let (Some(endpoint), Some(cluster), Some(attribute)) = (
            value.path.endpoint,
            value.path.cluster,
            value.path.attribute,
        ) else {
            continue;
        };
        if cluster != CLUSTER_DESCRIPTOR.0 {
            continue;
        }
        let number = EndpointNumber(endpoint);
        let descriptor = by_endpoint.entry(number).or_insert_with(|| EndpointDescriptor {
            number,
            ..EndpointDescriptor::default()
        });

        let Ok(items) = value.value.as_array() else {
            continue;
        };
        if attribute == DESCRIPTOR_DEVICE_TYPE_LIST.0 {
            for item in items {
                let (Some(device_type), Some(revision)) = (
                    item.field(0).and_then(|f| f.as_unsigned().ok()),
                    item.field(1).and_then(|f| f.as_unsigned().ok()),
                ) else {
                    continue;
                };
                descriptor
                    .device_types
                    .push((DeviceTypeId(device_type as u32), revision as u16));
            }
        } else if attribute == DESCRIPTOR_SERVER_LIST.0 {
            for item in items {
                if let Ok(id) = item.as_unsigned() {
                    descriptor.server_list.push(ClusterId(id as u32));
                }
            }
        } else if attribute == DESCRIPTOR_CLIENT_LIST.0 {
            for item in items {
                if let Ok(id) = item.as_unsigned() {
                    descriptor.client_list.push(ClusterId(id as u32));
                }
            }
        } else if attribute == DESCRIPTOR_PARTS_LIST.0 {
            for item in items {
                if let Ok(part) = item.as_unsigned() {
                    descriptor.parts_list.push(EndpointNumber(part as u16));
                }
            }
        }
    }
    by_endpoint.into_values().collect()
}

/// How an endpoint changed between two tree generations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointChange {
    /// Device types, server list or client list changed: rebuild it.
    Recreated,
    /// Only the structure around it changed: keep the instance.
    Retained,
    Unchanged,
}

/// Compare two descriptors for the recreate-vs-retain decision.
pub fn classify_change(old: &EndpointDescriptor, new: &EndpointDescriptor) -> EndpointChange {
    if old.device_types != new.device_types
        || old.server_list != new.server_list
        || old.client_list != new.client_list
    {
        EndpointChange::Recreated
    } else if old.parts_list != new.parts_list {
        EndpointChange::Retained
    } else {
        EndpointChange::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(number: u16, parts: &[u16]) -> EndpointDescriptor {
        EndpointDescriptor {
            number: EndpointNumber(number),
            device_types: vec![(DeviceTypeId(0x100), 1)],
            server_list: vec![ClusterId(0x06)],
            client_list: Vec::new(),
            parts_list: parts.iter().map(|n| EndpointNumber(*n)).collect(),
        }
    }

    #[test]
    fn test_flat_tree() {
        let tree = build_endpoint_tree(&[
            descriptor(0, &[1, 2]),
            descriptor(1, &[]),
            descriptor(2, &[]),
        ])
        .unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(
            tree.children_of(EndpointNumber::ROOT),
            vec![EndpointNumber(1), EndpointNumber(2)]
        );
        assert_eq!(
            tree.node(EndpointNumber(1)).unwrap().parent,
            Some(EndpointNumber::ROOT)
        );
    }

    #[test]
    fn test_nested_tree() {
        // 0 -> 1 (aggregator) -> 2, 3
        let tree = build_endpoint_tree(&[
            descriptor(0, &[1]),
            descriptor(1, &[2, 3]),
            descriptor(2, &[]),
            descriptor(3, &[]),
        ])
        .unwrap();
        assert_eq!(tree.children_of(EndpointNumber(1)), vec![EndpointNumber(2), EndpointNumber(3)]);
        assert_eq!(
            tree.node(EndpointNumber(2)).unwrap().parent,
            Some(EndpointNumber(1))
        );
        // No endpoint hangs under two parents.
        for number in tree.numbers() {
            let parents = tree
                .numbers()
                .into_iter()
                .filter(|p| tree.children_of(*p).contains(&number))
                .count();
            assert!(parents <= 1);
        }
    }

    #[test]
    fn test_self_reference_is_internal_error() {
        let err = build_endpoint_tree(&[descriptor(0, &[1]), descriptor(1, &[1])]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_cycle_is_internal_error() {
        // 1 and 2 reference each other; neither reaches the root.
        let err = build_endpoint_tree(&[
            descriptor(0, &[]),
            descriptor(1, &[2]),
            descriptor(2, &[1]),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_missing_root_rejected() {
        let err = build_endpoint_tree(&[descriptor(1, &[])]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_descriptors_from_reports() {
        use std::sync::Arc;
        use weft_interaction::messages::{AttributePathIb, ReadRequest};
        use weft_interaction::model::{
            BasicInformationCluster, BasicInformationConfig, Endpoint, NodeModel, OnOffCluster,
        };
        use weft_interaction::read::ReadHandler;

        // Serve a real model, read it fully, and rebuild the tree from
        // the resulting reports.
        let model = NodeModel::new(vec![
            Endpoint::new(EndpointNumber::ROOT, vec![(DeviceTypeId(0x16), 1)]).with_cluster(
                Arc::new(BasicInformationCluster::new(BasicInformationConfig::default())),
            ),
            Endpoint::new(EndpointNumber(1), vec![(DeviceTypeId(0x100), 1)])
                .with_cluster(Arc::new(OnOffCluster::new())),
        ]);
        let request = ReadRequest {
            attribute_requests: vec![AttributePathIb::default()],
            fabric_filtered: true,
            ..ReadRequest::default()
        };
        let (reports, _) = ReadHandler::new(&model).collect_reports(&request, None);

        let descriptors = descriptors_from_reports(&reports);
        assert_eq!(descriptors.len(), 2);
        let tree = build_endpoint_tree(&descriptors).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(
            tree.children_of(EndpointNumber::ROOT),
            vec![EndpointNumber(1)]
        );
        let leaf = tree.node(EndpointNumber(1)).unwrap();
        assert!(leaf.descriptor.server_list.contains(&ClusterId(0x06)));
        assert_eq!(leaf.descriptor.device_types, vec![(DeviceTypeId(0x100), 1)]);
    }

    #[test]
    fn test_classify_change() {
        let base = descriptor(1, &[2]);

        assert_eq!(classify_change(&base, &base.clone()), EndpointChange::Unchanged);

        let mut structural = base.clone();
        structural.parts_list = Vec::new();
        assert_eq!(classify_change(&base, &structural), EndpointChange::Retained);

        let mut recreated = base.clone();
        recreated.server_list.push(ClusterId(0x1D));
        assert_eq!(classify_change(&base, &recreated), EndpointChange::Recreated);

        let mut device_changed = base.clone();
        device_changed.device_types = vec![(DeviceTypeId(0x101), 1)];
        assert_eq!(
            classify_change(&base, &device_changed),
            EndpointChange::Recreated
        );
    }
}
