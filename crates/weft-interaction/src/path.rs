//! Attribute path expansion
//!
//! Wildcard paths expand against the data model in endpoint, cluster,
//! attribute order, with globals emitted before user attributes. Skip
//! flags prune wildcard results only; concrete paths always resolve (or
//! produce a status).

use crate::messages::AttributePathIb;
use crate::model::{
    global_attribute_ids, NodeModel, ATTR_ACCEPTED_COMMAND_LIST, ATTR_ATTRIBUTE_LIST,
    ATTR_CLUSTER_REVISION, ATTR_EVENT_LIST, ATTR_FEATURE_MAP, ATTR_GENERATED_COMMAND_LIST,
};
use weft_core::types::{AttributeId, ClusterId, EndpointNumber};

/// A fully resolved attribute address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConcreteAttributePath {
    pub endpoint: EndpointNumber,
    pub cluster: ClusterId,
    pub attribute: AttributeId,
}

impl ConcreteAttributePath {
    pub fn to_ib(&self) -> AttributePathIb {
        AttributePathIb {
            endpoint: Some(self.endpoint.0),
            cluster: Some(self.cluster.0),
            attribute: Some(self.attribute.0),
            list_index: None,
        }
    }
}

/// A request path with optional wildcards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttributePath {
    pub endpoint: Option<EndpointNumber>,
    pub cluster: Option<ClusterId>,
    pub attribute: Option<AttributeId>,
}

impl AttributePath {
    pub fn from_ib(ib: &AttributePathIb) -> Self {
        Self {
            endpoint: ib.endpoint.map(EndpointNumber),
            cluster: ib.cluster.map(ClusterId),
            attribute: ib.attribute.map(AttributeId),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.endpoint.is_none() || self.cluster.is_none() || self.attribute.is_none()
    }
}

/// Which element groups a wildcard expansion leaves out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WildcardPathFlags {
    /// Leave out endpoint 0.
    pub skip_root_node: bool,
    /// Leave out FeatureMap, EventList and ClusterRevision.
    pub skip_global_attributes: bool,
    /// Leave out AttributeList.
    pub skip_attribute_list: bool,
    /// Leave out AcceptedCommandList and GeneratedCommandList.
    pub skip_command_lists: bool,
    /// Leave out attributes flagged as fixed.
    pub skip_fixed_attributes: bool,
    /// Leave out diagnostics clusters (0x30..=0x3F).
    pub skip_diagnostics_clusters: bool,
    /// Leave out attributes whose changes are omitted from reports.
    pub skip_changes_omitted_attributes: bool,
}

impl WildcardPathFlags {
    fn skips_attribute(&self, attribute: AttributeId) -> bool {
        if self.skip_global_attributes
            && (attribute == ATTR_FEATURE_MAP
                || attribute == ATTR_EVENT_LIST
                || attribute == ATTR_CLUSTER_REVISION)
        {
            return true;
        }
        if self.skip_attribute_list && attribute == ATTR_ATTRIBUTE_LIST {
            return true;
        }
        if self.skip_command_lists
            && (attribute == ATTR_ACCEPTED_COMMAND_LIST || attribute == ATTR_GENERATED_COMMAND_LIST)
        {
            return true;
        }
        false
    }
}

/// What a single request path resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathExpansion {
    /// Concrete existing attributes, in report order.
    Concrete(Vec<ConcreteAttributePath>),
    /// A concrete path that misses; carries the status to report.
    Unsupported(UnsupportedPath),
}

/// Which level of a concrete path failed to resolve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnsupportedPath {
    Endpoint,
    Cluster,
    Attribute,
}

/// Expand one request path against the model.
///
/// Wildcard misses vanish silently; a concrete path that names a missing
/// endpoint, cluster or attribute reports the corresponding status.
pub fn expand_attribute_path(
    model: &NodeModel,
    path: &AttributePath,
    flags: WildcardPathFlags,
) -> PathExpansion {
    let wildcard = path.is_wildcard();
    let mut out = Vec::new();

    let endpoints: Vec<EndpointNumber> = match path.endpoint {
        Some(endpoint) => {
            if model.endpoint(endpoint).is_none() {
                return if wildcard {
                    PathExpansion::Concrete(Vec::new())
                } else {
                    PathExpansion::Unsupported(UnsupportedPath::Endpoint)
                };
            }
            vec![endpoint]
        }
        None => model
            .endpoints()
            .map(|endpoint| endpoint.number)
            .filter(|number| !(flags.skip_root_node && *number == EndpointNumber::ROOT))
            .collect(),
    };

    for endpoint_number in endpoints {
        let Some(endpoint) = model.endpoint(endpoint_number) else {
            continue;
        };
        let clusters: Vec<ClusterId> = match path.cluster {
            Some(cluster) => {
                if endpoint.cluster(cluster).is_none() {
                    if !wildcard {
                        return PathExpansion::Unsupported(UnsupportedPath::Cluster);
                    }
                    continue;
                }
                vec![cluster]
            }
            None => endpoint
                .cluster_ids()
                .into_iter()
                .filter(|id| !(flags.skip_diagnostics_clusters && id.is_diagnostics()))
                .collect(),
        };

        for cluster_id in clusters {
            let Some(cluster) = endpoint.cluster(cluster_id) else {
                continue;
            };
            match path.attribute {
                Some(attribute) => {
                    let known = global_attribute_ids().contains(&attribute)
                        || cluster.attributes().iter().any(|meta| meta.id == attribute);
                    if known {
                        out.push(ConcreteAttributePath {
                            endpoint: endpoint_number,
                            cluster: cluster_id,
                            attribute,
                        });
                    } else if !wildcard {
                        return PathExpansion::Unsupported(UnsupportedPath::Attribute);
                    }
                }
                None => {
                    // Globals first, then user attributes in numeric order.
                    for attribute in global_attribute_ids() {
                        if !flags.skips_attribute(attribute) {
                            out.push(ConcreteAttributePath {
                                endpoint: endpoint_number,
                                cluster: cluster_id,
                                attribute,
                            });
                        }
                    }
                    for meta in cluster.attributes() {
                        if flags.skip_fixed_attributes && meta.fixed {
                            continue;
                        }
                        if flags.skip_changes_omitted_attributes && meta.changes_omitted {
                            continue;
                        }
                        out.push(ConcreteAttributePath {
                            endpoint: endpoint_number,
                            cluster: cluster_id,
                            attribute: meta.id,
                        });
                    }
                }
            }
        }
    }
    PathExpansion::Concrete(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::test_model;
    use crate::model::{CLUSTER_BASIC_INFORMATION, CLUSTER_ON_OFF};

    fn count(model: &NodeModel, path: AttributePath, flags: WildcardPathFlags) -> usize {
        match expand_attribute_path(model, &path, flags) {
            PathExpansion::Concrete(paths) => paths.len(),
            PathExpansion::Unsupported(_) => panic!("unexpected unsupported path"),
        }
    }

    #[test]
    fn test_basic_information_full_wildcard_is_23() {
        let (model, _) = test_model();
        let path = AttributePath {
            endpoint: Some(EndpointNumber::ROOT),
            cluster: Some(CLUSTER_BASIC_INFORMATION),
            attribute: None,
        };
        assert_eq!(count(&model, path, WildcardPathFlags::default()), 23);
    }

    #[test]
    fn test_skip_global_attributes_leaves_20() {
        let (model, _) = test_model();
        let path = AttributePath {
            endpoint: Some(EndpointNumber::ROOT),
            cluster: Some(CLUSTER_BASIC_INFORMATION),
            attribute: None,
        };
        let flags = WildcardPathFlags {
            skip_global_attributes: true,
            ..WildcardPathFlags::default()
        };
        assert_eq!(count(&model, path, flags), 20);
    }

    #[test]
    fn test_skip_root_node_leaves_none() {
        let (model, _) = test_model();
        let path = AttributePath {
            endpoint: None,
            cluster: Some(CLUSTER_BASIC_INFORMATION),
            attribute: None,
        };
        let flags = WildcardPathFlags {
            skip_root_node: true,
            ..WildcardPathFlags::default()
        };
        // BasicInformation only lives on the root endpoint.
        assert_eq!(count(&model, path, flags), 0);
    }

    #[test]
    fn test_globals_precede_user_attributes() {
        let (model, _) = test_model();
        let path = AttributePath {
            endpoint: Some(EndpointNumber(1)),
            cluster: Some(CLUSTER_ON_OFF),
            attribute: None,
        };
        let PathExpansion::Concrete(paths) =
            expand_attribute_path(&model, &path, WildcardPathFlags::default())
        else {
            panic!("expected expansion");
        };
        let first_user = paths
            .iter()
            .position(|p| p.attribute.0 < 0xF000)
            .unwrap();
        assert!(paths[..first_user]
            .iter()
            .all(|p| p.attribute.0 >= 0xF000));
        assert_eq!(paths[0].attribute, ATTR_FEATURE_MAP);
    }

    #[test]
    fn test_skip_diagnostics_clusters() {
        use crate::model::{
            AttributeMeta, BasicInformationCluster, BasicInformationConfig, ClusterServer,
            Endpoint,
        };
        use parking_lot::RwLock;
        use std::sync::Arc;
        use weft_core::tlv::{Tag, TlvElement};
        use weft_core::types::{DataVersion, DeviceTypeId, FabricIndex};

        struct DiagnosticsCluster {
            version: RwLock<DataVersion>,
        }

        impl ClusterServer for DiagnosticsCluster {
            fn cluster_id(&self) -> ClusterId {
                ClusterId(0x36)
            }

            fn data_version(&self) -> DataVersion {
                *self.version.read()
            }

            fn attributes(&self) -> Vec<AttributeMeta> {
                vec![AttributeMeta::readonly(0)]
            }

            fn read_attribute(
                &self,
                _attribute: AttributeId,
                _fabric_filter: Option<FabricIndex>,
            ) -> std::result::Result<TlvElement, crate::messages::Status> {
                Ok(TlvElement::unsigned(Tag::Anonymous, 0))
            }
        }

        let model = NodeModel::new(vec![Endpoint::new(
            EndpointNumber::ROOT,
            vec![(DeviceTypeId(0x16), 1)],
        )
        .with_cluster(Arc::new(BasicInformationCluster::new(
            BasicInformationConfig::default(),
        )))
        .with_cluster(Arc::new(DiagnosticsCluster {
            version: RwLock::new(DataVersion(0)),
        }))]);

        let flags = WildcardPathFlags {
            skip_diagnostics_clusters: true,
            ..WildcardPathFlags::default()
        };

        // Wildcard cluster on the root: the diagnostics cluster vanishes.
        let wildcard = AttributePath {
            endpoint: Some(EndpointNumber::ROOT),
            cluster: None,
            attribute: None,
        };
        let PathExpansion::Concrete(paths) = expand_attribute_path(&model, &wildcard, flags)
        else {
            panic!("expected expansion");
        };
        assert!(paths.iter().all(|p| p.cluster != ClusterId(0x36)));

        // BasicInformation itself is untouched: still the full 23.
        assert_eq!(
            count(
                &model,
                AttributePath {
                    endpoint: Some(EndpointNumber::ROOT),
                    cluster: Some(CLUSTER_BASIC_INFORMATION),
                    attribute: None,
                },
                flags
            ),
            23
        );
    }

    #[test]
    fn test_concrete_misses_report_level() {
        let (model, _) = test_model();
        let missing_endpoint = AttributePath {
            endpoint: Some(EndpointNumber(9)),
            cluster: Some(CLUSTER_ON_OFF),
            attribute: Some(AttributeId(0)),
        };
        assert_eq!(
            expand_attribute_path(&model, &missing_endpoint, WildcardPathFlags::default()),
            PathExpansion::Unsupported(UnsupportedPath::Endpoint)
        );

        let missing_cluster = AttributePath {
            endpoint: Some(EndpointNumber(1)),
            cluster: Some(ClusterId(0x99)),
            attribute: Some(AttributeId(0)),
        };
        assert_eq!(
            expand_attribute_path(&model, &missing_cluster, WildcardPathFlags::default()),
            PathExpansion::Unsupported(UnsupportedPath::Cluster)
        );

        let missing_attribute = AttributePath {
            endpoint: Some(EndpointNumber(1)),
            cluster: Some(CLUSTER_ON_OFF),
            attribute: Some(AttributeId(0x42)),
        };
        assert_eq!(
            expand_attribute_path(&model, &missing_attribute, WildcardPathFlags::default()),
            PathExpansion::Unsupported(UnsupportedPath::Attribute)
        );
    }

    #[test]
    fn test_wildcard_misses_are_silent() {
        let (model, _) = test_model();
        // OnOff exists only on endpoint 1; wildcard endpoint with a
        // concrete attribute resolves there alone.
        let path = AttributePath {
            endpoint: None,
            cluster: Some(CLUSTER_ON_OFF),
            attribute: Some(AttributeId(0)),
        };
        assert_eq!(count(&model, path, WildcardPathFlags::default()), 1);
    }
}
