//! Endpoint/cluster data model
//!
//! A flat endpoint registry holding cluster servers. Global attributes
//! are synthesized here so every cluster answers FeatureMap,
//! AttributeList, EventList, the command lists and ClusterRevision
//! without implementing them itself.

use crate::messages::Status;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use weft_core::observable::Observable;
use weft_core::tlv::{Tag, TlvElement};
use weft_core::types::{
    AttributeId, ClusterId, CommandId, DataVersion, DeviceTypeId, EndpointNumber, EventId,
    FabricIndex,
};

// Global attribute ids.
pub const ATTR_GENERATED_COMMAND_LIST: AttributeId = AttributeId(0xFFF8);
pub const ATTR_ACCEPTED_COMMAND_LIST: AttributeId = AttributeId(0xFFF9);
pub const ATTR_EVENT_LIST: AttributeId = AttributeId(0xFFFA);
pub const ATTR_ATTRIBUTE_LIST: AttributeId = AttributeId(0xFFFB);
pub const ATTR_FEATURE_MAP: AttributeId = AttributeId(0xFFFC);
pub const ATTR_CLUSTER_REVISION: AttributeId = AttributeId(0xFFFD);

/// Standard cluster ids used by the built-in servers.
pub const CLUSTER_ON_OFF: ClusterId = ClusterId(0x0006);
pub const CLUSTER_DESCRIPTOR: ClusterId = ClusterId(0x001D);
pub const CLUSTER_BASIC_INFORMATION: ClusterId = ClusterId(0x0028);

/// Flags describing one user attribute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttributeMeta {
    pub id: AttributeId,
    /// Value never changes for the life of the node.
    pub fixed: bool,
    /// Changes are not reported through subscriptions.
    pub changes_omitted: bool,
    pub writable: bool,
    /// A list whose entries are fabric-scoped structs.
    pub fabric_scoped_list: bool,
}

impl AttributeMeta {
    pub fn readonly(id: u32) -> Self {
        Self {
            id: AttributeId(id),
            ..Self::default()
        }
    }

    pub fn fixed(id: u32) -> Self {
        Self {
            id: AttributeId(id),
            fixed: true,
            ..Self::default()
        }
    }

    pub fn writable(id: u32) -> Self {
        Self {
            id: AttributeId(id),
            writable: true,
            ..Self::default()
        }
    }
}

/// How a list write applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOperation {
    /// Replace the whole value.
    Replace,
    /// Append one entry to a list (chunked-array continuation).
    AppendItem,
}

/// Outcome of a command invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum InvokeResult {
    /// Status-only success.
    Success,
    /// A generated response command with its fields.
    Response {
        command: CommandId,
        data: TlvElement,
    },
    /// A non-success status.
    Status {
        status: Status,
        cluster_status: Option<u8>,
    },
}

impl InvokeResult {
    /// Map a handler error onto a command status. A carried status
    /// response becomes that status; anything else is a plain failure.
    pub fn from_error(err: weft_core::Error) -> Self {
        match err {
            weft_core::Error::StatusResponse {
                status,
                cluster_status,
            } => InvokeResult::Status {
                status: crate::messages::status_from_code(status),
                cluster_status,
            },
            _ => InvokeResult::Status {
                status: Status::Failure,
                cluster_status: None,
            },
        }
    }
}

/// An emitted event record.
#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub event: EventId,
    pub event_number: u64,
    pub data: TlvElement,
}

/// A cluster server behind one (endpoint, cluster) address.
pub trait ClusterServer: Send + Sync {
    fn cluster_id(&self) -> ClusterId;

    fn revision(&self) -> u16 {
        1
    }

    fn feature_map(&self) -> u32 {
        0
    }

    fn data_version(&self) -> DataVersion;

    /// User attributes in numeric order.
    fn attributes(&self) -> Vec<AttributeMeta>;

    /// Read a user attribute. Fabric-scoped data is filtered to
    /// `fabric_filter` when given.
    fn read_attribute(
        &self,
        attribute: AttributeId,
        fabric_filter: Option<FabricIndex>,
    ) -> Result<TlvElement, Status>;

    fn write_attribute(
        &self,
        _attribute: AttributeId,
        _value: &TlvElement,
        _operation: WriteOperation,
        _fabric: FabricIndex,
    ) -> Result<(), Status> {
        Err(Status::UnsupportedWrite)
    }

    fn accepted_commands(&self) -> Vec<CommandId> {
        Vec::new()
    }

    fn generated_commands(&self) -> Vec<CommandId> {
        Vec::new()
    }

    fn invoke(&self, _command: CommandId, _fields: Option<&TlvElement>) -> InvokeResult {
        InvokeResult::Status {
            status: Status::UnsupportedCommand,
            cluster_status: None,
        }
    }

    /// Supported event ids, in numeric order.
    fn events(&self) -> Vec<EventId> {
        Vec::new()
    }

    /// Emitted events with `event_number >= min`.
    fn read_events(&self, _min: u64) -> Vec<EventRecord> {
        Vec::new()
    }
}

/// Read a global or user attribute of a cluster.
pub fn read_cluster_attribute(
    cluster: &dyn ClusterServer,
    attribute: AttributeId,
    fabric_filter: Option<FabricIndex>,
) -> Result<TlvElement, Status> {
    fn id_array(ids: impl IntoIterator<Item = u32>) -> TlvElement {
        TlvElement::array(
            Tag::Anonymous,
            ids.into_iter()
                .map(|id| TlvElement::unsigned(Tag::Anonymous, id as u64))
                .collect(),
        )
    }

    match attribute {
        ATTR_FEATURE_MAP => Ok(TlvElement::unsigned(
            Tag::Anonymous,
            cluster.feature_map() as u64,
        )),
        ATTR_CLUSTER_REVISION => Ok(TlvElement::unsigned(
            Tag::Anonymous,
            cluster.revision() as u64,
        )),
        ATTR_ATTRIBUTE_LIST => Ok(id_array(
            global_attribute_ids()
                .iter()
                .map(|id| id.0)
                .chain(cluster.attributes().iter().map(|meta| meta.id.0)),
        )),
        ATTR_EVENT_LIST => Ok(id_array(cluster.events().iter().map(|id| id.0))),
        ATTR_ACCEPTED_COMMAND_LIST => {
            Ok(id_array(cluster.accepted_commands().iter().map(|id| id.0)))
        }
        ATTR_GENERATED_COMMAND_LIST => {
            Ok(id_array(cluster.generated_commands().iter().map(|id| id.0)))
        }
        _ => cluster.read_attribute(attribute, fabric_filter),
    }
}

/// All global attribute ids, in report order.
pub fn global_attribute_ids() -> [AttributeId; 6] {
    [
        ATTR_FEATURE_MAP,
        ATTR_ATTRIBUTE_LIST,
        ATTR_EVENT_LIST,
        ATTR_ACCEPTED_COMMAND_LIST,
        ATTR_GENERATED_COMMAND_LIST,
        ATTR_CLUSTER_REVISION,
    ]
}

/// One endpoint with its cluster servers.
pub struct Endpoint {
    pub number: EndpointNumber,
    pub device_types: Vec<(DeviceTypeId, u16)>,
    clusters: BTreeMap<ClusterId, Arc<dyn ClusterServer>>,
}

impl Endpoint {
    pub fn new(number: EndpointNumber, device_types: Vec<(DeviceTypeId, u16)>) -> Self {
        Self {
            number,
            device_types,
            clusters: BTreeMap::new(),
        }
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterServer>) -> Self {
        self.clusters.insert(cluster.cluster_id(), cluster);
        self
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&Arc<dyn ClusterServer>> {
        self.clusters.get(&id)
    }

    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.clusters.keys().copied().collect()
    }
}

/// The server-side data model: a flat endpoint registry.
pub struct NodeModel {
    endpoints: BTreeMap<EndpointNumber, Endpoint>,
    /// Emitted when an attribute changes through this model.
    pub attribute_changed: Observable<(EndpointNumber, ClusterId, AttributeId)>,
}

impl NodeModel {
    /// Assemble the model, inserting a Descriptor cluster per endpoint.
    /// Endpoint 0 lists every other endpoint in its parts list.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        let all_numbers: Vec<EndpointNumber> =
            endpoints.iter().map(|endpoint| endpoint.number).collect();
        let mut map = BTreeMap::new();
        for mut endpoint in endpoints {
            if endpoint.cluster(CLUSTER_DESCRIPTOR).is_none() {
                let parts = if endpoint.number == EndpointNumber::ROOT {
                    all_numbers
                        .iter()
                        .copied()
                        .filter(|n| *n != EndpointNumber::ROOT)
                        .collect()
                } else {
                    Vec::new()
                };
                let descriptor = DescriptorCluster::new(
                    endpoint.device_types.clone(),
                    endpoint.cluster_ids(),
                    parts,
                );
                endpoint = endpoint.with_cluster(Arc::new(descriptor));
            }
            map.insert(endpoint.number, endpoint);
        }
        Self {
            endpoints: map,
            attribute_changed: Observable::new(),
        }
    }

    pub fn endpoint(&self, number: EndpointNumber) -> Option<&Endpoint> {
        self.endpoints.get(&number)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    pub fn cluster(
        &self,
        endpoint: EndpointNumber,
        cluster: ClusterId,
    ) -> Option<&Arc<dyn ClusterServer>> {
        self.endpoints.get(&endpoint)?.cluster(cluster)
    }

    /// Notify subscribers of an attribute change.
    pub fn notify_changed(
        &self,
        endpoint: EndpointNumber,
        cluster: ClusterId,
        attribute: AttributeId,
    ) {
        self.attribute_changed.emit(&(endpoint, cluster, attribute));
    }
}

// =============================================================================
// DESCRIPTOR CLUSTER (0x1D)
// =============================================================================

/// Descriptor attribute ids.
pub const DESCRIPTOR_DEVICE_TYPE_LIST: AttributeId = AttributeId(0);
pub const DESCRIPTOR_SERVER_LIST: AttributeId = AttributeId(1);
pub const DESCRIPTOR_CLIENT_LIST: AttributeId = AttributeId(2);
pub const DESCRIPTOR_PARTS_LIST: AttributeId = AttributeId(3);

/// The Descriptor cluster describing an endpoint's composition.
pub struct DescriptorCluster {
    device_types: Vec<(DeviceTypeId, u16)>,
    server_list: Vec<ClusterId>,
    parts_list: Vec<EndpointNumber>,
    version: RwLock<DataVersion>,
}

impl DescriptorCluster {
    pub fn new(
        device_types: Vec<(DeviceTypeId, u16)>,
        mut server_list: Vec<ClusterId>,
        parts_list: Vec<EndpointNumber>,
    ) -> Self {
        if !server_list.contains(&CLUSTER_DESCRIPTOR) {
            server_list.push(CLUSTER_DESCRIPTOR);
            server_list.sort();
        }
        Self {
            device_types,
            server_list,
            parts_list,
            version: RwLock::new(DataVersion(0)),
        }
    }
}

impl ClusterServer for DescriptorCluster {
    fn cluster_id(&self) -> ClusterId {
        CLUSTER_DESCRIPTOR
    }

    fn revision(&self) -> u16 {
        2
    }

    fn data_version(&self) -> DataVersion {
        *self.version.read()
    }

    fn attributes(&self) -> Vec<AttributeMeta> {
        vec![
            AttributeMeta::fixed(DESCRIPTOR_DEVICE_TYPE_LIST.0),
            AttributeMeta::readonly(DESCRIPTOR_SERVER_LIST.0),
            AttributeMeta::readonly(DESCRIPTOR_CLIENT_LIST.0),
            AttributeMeta::readonly(DESCRIPTOR_PARTS_LIST.0),
        ]
    }

    fn read_attribute(
        &self,
        attribute: AttributeId,
        _fabric_filter: Option<FabricIndex>,
    ) -> Result<TlvElement, Status> {
        match attribute {
            DESCRIPTOR_DEVICE_TYPE_LIST => Ok(TlvElement::array(
                Tag::Anonymous,
                self.device_types
                    .iter()
                    .map(|(device_type, revision)| {
                        TlvElement::structure(
                            Tag::Anonymous,
                            vec![
                                TlvElement::unsigned(Tag::Context(0), device_type.0 as u64),
                                TlvElement::unsigned(Tag::Context(1), *revision as u64),
                            ],
                        )
                    })
                    .collect(),
            )),
            DESCRIPTOR_SERVER_LIST => Ok(TlvElement::array(
                Tag::Anonymous,
                self.server_list
                    .iter()
                    .map(|id| TlvElement::unsigned(Tag::Anonymous, id.0 as u64))
                    .collect(),
            )),
            DESCRIPTOR_CLIENT_LIST => Ok(TlvElement::array(Tag::Anonymous, Vec::new())),
            DESCRIPTOR_PARTS_LIST => Ok(TlvElement::array(
                Tag::Anonymous,
                self.parts_list
                    .iter()
                    .map(|n| TlvElement::unsigned(Tag::Anonymous, n.0 as u64))
                    .collect(),
            )),
            _ => Err(Status::UnsupportedAttribute),
        }
    }
}

// =============================================================================
// BASIC INFORMATION CLUSTER (0x28)
// =============================================================================

/// Static node identity served by BasicInformation.
#[derive(Clone, Debug)]
pub struct BasicInformationConfig {
    pub vendor_name: String,
    pub vendor_id: u16,
    pub product_name: String,
    pub product_id: u16,
    pub node_label: String,
    pub hardware_version: u16,
    pub hardware_version_string: String,
    pub software_version: u32,
    pub software_version_string: String,
    pub serial_number: String,
    pub unique_id: String,
}

impl Default for BasicInformationConfig {
    fn default() -> Self {
        Self {
            vendor_name: "weft".into(),
            vendor_id: 0xFFF1,
            product_name: "weft-node".into(),
            product_id: 0x8000,
            node_label: String::new(),
            hardware_version: 1,
            hardware_version_string: "1".into(),
            software_version: 1,
            software_version_string: "0.1.0".into(),
            serial_number: "0000000000000000".into(),
            unique_id: "weft-unique".into(),
        }
    }
}

/// BasicInformation cluster server.
pub struct BasicInformationCluster {
    config: BasicInformationConfig,
    node_label: RwLock<String>,
    version: RwLock<DataVersion>,
}

impl BasicInformationCluster {
    pub fn new(config: BasicInformationConfig) -> Self {
        let node_label = config.node_label.clone();
        Self {
            config,
            node_label: RwLock::new(node_label),
            version: RwLock::new(DataVersion(0)),
        }
    }
}

impl ClusterServer for BasicInformationCluster {
    fn cluster_id(&self) -> ClusterId {
        CLUSTER_BASIC_INFORMATION
    }

    fn revision(&self) -> u16 {
        3
    }

    fn data_version(&self) -> DataVersion {
        *self.version.read()
    }

    fn attributes(&self) -> Vec<AttributeMeta> {
        vec![
            AttributeMeta::fixed(0),  // DataModelRevision
            AttributeMeta::fixed(1),  // VendorName
            AttributeMeta::fixed(2),  // VendorID
            AttributeMeta::fixed(3),  // ProductName
            AttributeMeta::fixed(4),  // ProductID
            AttributeMeta::writable(5), // NodeLabel
            AttributeMeta::readonly(6), // Location
            AttributeMeta::fixed(7),  // HardwareVersion
            AttributeMeta::fixed(8),  // HardwareVersionString
            AttributeMeta::fixed(9),  // SoftwareVersion
            AttributeMeta::fixed(10), // SoftwareVersionString
            AttributeMeta::fixed(11), // ManufacturingDate
            AttributeMeta::fixed(12), // PartNumber
            AttributeMeta::fixed(13), // ProductURL
            AttributeMeta::fixed(14), // ProductLabel
            AttributeMeta::fixed(15), // SerialNumber
            AttributeMeta::writable(16), // LocalConfigDisabled
        ]
    }

    fn read_attribute(
        &self,
        attribute: AttributeId,
        _fabric_filter: Option<FabricIndex>,
    ) -> Result<TlvElement, Status> {
        let text = |value: &str| TlvElement::utf8(Tag::Anonymous, value.to_string());
        let number = |value: u64| TlvElement::unsigned(Tag::Anonymous, value);
        match attribute.0 {
            0 => Ok(number(17)),
            1 => Ok(text(&self.config.vendor_name)),
            2 => Ok(number(self.config.vendor_id as u64)),
            3 => Ok(text(&self.config.product_name)),
            4 => Ok(number(self.config.product_id as u64)),
            5 => Ok(text(&self.node_label.read())),
            6 => Ok(text("XX")),
            7 => Ok(number(self.config.hardware_version as u64)),
            8 => Ok(text(&self.config.hardware_version_string)),
            9 => Ok(number(self.config.software_version as u64)),
            10 => Ok(text(&self.config.software_version_string)),
            11 => Ok(text("")),
            12 => Ok(text("")),
            13 => Ok(text("")),
            14 => Ok(text("")),
            15 => Ok(text(&self.config.serial_number)),
            16 => Ok(TlvElement::boolean(Tag::Anonymous, false)),
            _ => Err(Status::UnsupportedAttribute),
        }
    }

    fn write_attribute(
        &self,
        attribute: AttributeId,
        value: &TlvElement,
        _operation: WriteOperation,
        _fabric: FabricIndex,
    ) -> Result<(), Status> {
        match attribute.0 {
            5 => {
                let label = value.as_utf8().map_err(|_| Status::InvalidDataType)?;
                if label.len() > 32 {
                    return Err(Status::ConstraintError);
                }
                *self.node_label.write() = label.to_string();
                self.version.write().bump();
                Ok(())
            }
            _ => Err(Status::UnsupportedWrite),
        }
    }

    fn events(&self) -> Vec<EventId> {
        vec![EventId(0)] // StartUp
    }

    fn read_events(&self, min: u64) -> Vec<EventRecord> {
        let record = EventRecord {
            event: EventId(0),
            event_number: 1,
            data: TlvElement::structure(
                Tag::Anonymous,
                vec![TlvElement::unsigned(
                    Tag::Context(0),
                    self.config.software_version as u64,
                )],
            ),
        };
        if record.event_number >= min {
            vec![record]
        } else {
            Vec::new()
        }
    }
}

// =============================================================================
// ON/OFF CLUSTER (0x06)
// =============================================================================

/// OnOff command ids.
pub const ON_OFF_CMD_OFF: CommandId = CommandId(0);
pub const ON_OFF_CMD_ON: CommandId = CommandId(1);
pub const ON_OFF_CMD_TOGGLE: CommandId = CommandId(2);

/// OnOff cluster server.
pub struct OnOffCluster {
    on: RwLock<bool>,
    version: RwLock<DataVersion>,
}

impl Default for OnOffCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl OnOffCluster {
    pub fn new() -> Self {
        Self {
            on: RwLock::new(false),
            version: RwLock::new(DataVersion(0)),
        }
    }

    pub fn is_on(&self) -> bool {
        *self.on.read()
    }

    fn set(&self, on: bool) {
        *self.on.write() = on;
        self.version.write().bump();
    }
}

impl ClusterServer for OnOffCluster {
    fn cluster_id(&self) -> ClusterId {
        CLUSTER_ON_OFF
    }

    fn revision(&self) -> u16 {
        4
    }

    fn data_version(&self) -> DataVersion {
        *self.version.read()
    }

    fn attributes(&self) -> Vec<AttributeMeta> {
        vec![AttributeMeta::readonly(0)]
    }

    fn read_attribute(
        &self,
        attribute: AttributeId,
        _fabric_filter: Option<FabricIndex>,
    ) -> Result<TlvElement, Status> {
        match attribute.0 {
            0 => Ok(TlvElement::boolean(Tag::Anonymous, self.is_on())),
            _ => Err(Status::UnsupportedAttribute),
        }
    }

    fn accepted_commands(&self) -> Vec<CommandId> {
        vec![ON_OFF_CMD_OFF, ON_OFF_CMD_ON, ON_OFF_CMD_TOGGLE]
    }

    fn invoke(&self, command: CommandId, _fields: Option<&TlvElement>) -> InvokeResult {
        match command {
            ON_OFF_CMD_OFF => {
                self.set(false);
                InvokeResult::Success
            }
            ON_OFF_CMD_ON => {
                self.set(true);
                InvokeResult::Success
            }
            ON_OFF_CMD_TOGGLE => {
                let next = !self.is_on();
                self.set(next);
                InvokeResult::Success
            }
            _ => InvokeResult::Status {
                status: Status::UnsupportedCommand,
                cluster_status: None,
            },
        }
    }
}
