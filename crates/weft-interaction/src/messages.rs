//! Interaction Model wire messages
//!
//! TLV shapes for the ten IM message types plus the information blocks
//! they share. Context-tag numbering follows the Matter Interaction Model
//! encoding; every top-level message carries the advertised
//! interactionModelRevision under tag 255.

use weft_core::tlv::{Tag, TlvElement};
use weft_core::types::{AttributeId, ClusterId, CommandId, EndpointNumber, EventId};
use weft_core::{Error, Result};

/// The Interaction Model revision this server advertises.
pub const INTERACTION_MODEL_REVISION: u8 = 11;

const TAG_REVISION: u8 = 0xFF;

/// Interaction protocol opcodes.
pub mod opcode {
    pub const STATUS_RESPONSE: u8 = 0x01;
    pub const READ_REQUEST: u8 = 0x02;
    pub const SUBSCRIBE_REQUEST: u8 = 0x03;
    pub const SUBSCRIBE_RESPONSE: u8 = 0x04;
    pub const REPORT_DATA: u8 = 0x05;
    pub const WRITE_REQUEST: u8 = 0x06;
    pub const WRITE_RESPONSE: u8 = 0x07;
    pub const INVOKE_REQUEST: u8 = 0x08;
    pub const INVOKE_RESPONSE: u8 = 0x09;
    pub const TIMED_REQUEST: u8 = 0x0A;
}

/// Interaction Model status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Success = 0x00,
    Failure = 0x01,
    InvalidAction = 0x80,
    UnsupportedCommand = 0x81,
    UnsupportedAttribute = 0x86,
    ConstraintError = 0x87,
    UnsupportedWrite = 0x88,
    ResourceExhausted = 0x89,
    NotFound = 0x8B,
    UnreportableAttribute = 0x8C,
    InvalidDataType = 0x8D,
    UnsupportedRead = 0x8F,
    DataVersionMismatch = 0x92,
    Timeout = 0x94,
    Busy = 0x9C,
    UnsupportedCluster = 0xC3,
    NeedsTimedInteraction = 0xC6,
    UnsupportedEvent = 0xC7,
    PathsExhausted = 0xC8,
    TimedRequestMismatch = 0xC9,
    UnsupportedEndpoint = 0x7F,
    UnsupportedAccess = 0x7E,
}

impl Status {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

// =============================================================================
// PATH BLOCKS
// =============================================================================

/// AttributePathIB; absent fields are wildcards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttributePathIb {
    pub endpoint: Option<u16>,
    pub cluster: Option<u32>,
    pub attribute: Option<u32>,
    /// `Some(None)` is an explicit null list index (append).
    pub list_index: Option<Option<u16>>,
}

impl AttributePathIb {
    pub fn to_tlv(&self, tag: Tag) -> TlvElement {
        let mut items = Vec::new();
        if let Some(endpoint) = self.endpoint {
            items.push(TlvElement::unsigned(Tag::Context(2), endpoint as u64));
        }
        if let Some(cluster) = self.cluster {
            items.push(TlvElement::unsigned(Tag::Context(3), cluster as u64));
        }
        if let Some(attribute) = self.attribute {
            items.push(TlvElement::unsigned(Tag::Context(4), attribute as u64));
        }
        match self.list_index {
            Some(Some(index)) => items.push(TlvElement::unsigned(Tag::Context(5), index as u64)),
            Some(None) => items.push(TlvElement::null(Tag::Context(5))),
            None => {}
        }
        TlvElement::list(tag, items)
    }

    pub fn from_tlv(element: &TlvElement) -> Result<Self> {
        let mut path = Self::default();
        for item in element.as_list()? {
            match item.tag {
                Tag::Context(2) => path.endpoint = Some(item.as_unsigned()? as u16),
                Tag::Context(3) => path.cluster = Some(item.as_unsigned()? as u32),
                Tag::Context(4) => path.attribute = Some(item.as_unsigned()? as u32),
                Tag::Context(5) => {
                    path.list_index = if item.is_null() {
                        Some(None)
                    } else {
                        Some(Some(item.as_unsigned()? as u16))
                    };
                }
                _ => {}
            }
        }
        Ok(path)
    }
}

/// CommandPathIB; absent fields are wildcards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CommandPathIb {
    pub endpoint: Option<u16>,
    pub cluster: Option<u32>,
    pub command: Option<u32>,
}

impl CommandPathIb {
    pub fn concrete(endpoint: EndpointNumber, cluster: ClusterId, command: CommandId) -> Self {
        Self {
            endpoint: Some(endpoint.0),
            cluster: Some(cluster.0),
            command: Some(command.0),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.endpoint.is_none() || self.cluster.is_none() || self.command.is_none()
    }

    pub fn to_tlv(&self, tag: Tag) -> TlvElement {
        let mut items = Vec::new();
        if let Some(endpoint) = self.endpoint {
            items.push(TlvElement::unsigned(Tag::Context(0), endpoint as u64));
        }
        if let Some(cluster) = self.cluster {
            items.push(TlvElement::unsigned(Tag::Context(1), cluster as u64));
        }
        if let Some(command) = self.command {
            items.push(TlvElement::unsigned(Tag::Context(2), command as u64));
        }
        TlvElement::list(tag, items)
    }

    pub fn from_tlv(element: &TlvElement) -> Result<Self> {
        let mut path = Self::default();
        for item in element.as_list()? {
            match item.tag {
                Tag::Context(0) => path.endpoint = Some(item.as_unsigned()? as u16),
                Tag::Context(1) => path.cluster = Some(item.as_unsigned()? as u32),
                Tag::Context(2) => path.command = Some(item.as_unsigned()? as u32),
                _ => {}
            }
        }
        Ok(path)
    }
}

/// EventPathIB; absent fields are wildcards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventPathIb {
    pub endpoint: Option<u16>,
    pub cluster: Option<u32>,
    pub event: Option<u32>,
}

impl EventPathIb {
    pub fn to_tlv(&self, tag: Tag) -> TlvElement {
        let mut items = Vec::new();
        if let Some(endpoint) = self.endpoint {
            items.push(TlvElement::unsigned(Tag::Context(1), endpoint as u64));
        }
        if let Some(cluster) = self.cluster {
            items.push(TlvElement::unsigned(Tag::Context(2), cluster as u64));
        }
        if let Some(event) = self.event {
            items.push(TlvElement::unsigned(Tag::Context(3), event as u64));
        }
        TlvElement::list(tag, items)
    }

    pub fn from_tlv(element: &TlvElement) -> Result<Self> {
        let mut path = Self::default();
        for item in element.as_list()? {
            match item.tag {
                Tag::Context(1) => path.endpoint = Some(item.as_unsigned()? as u16),
                Tag::Context(2) => path.cluster = Some(item.as_unsigned()? as u32),
                Tag::Context(3) => path.event = Some(item.as_unsigned()? as u32),
                _ => {}
            }
        }
        Ok(path)
    }
}

// =============================================================================
// REPORT BLOCKS
// =============================================================================

/// A reported attribute value.
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeValue {
    pub path: AttributePathIb,
    pub data_version: u32,
    pub value: TlvElement,
}

/// A reported attribute error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttributeStatus {
    pub path: AttributePathIb,
    pub status: Status,
    pub cluster_status: Option<u8>,
}

/// One entry of a DataReport's attributeReports array.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeReport {
    Value(AttributeValue),
    Status(AttributeStatus),
}

impl AttributeReport {
    fn to_tlv(&self) -> TlvElement {
        match self {
            AttributeReport::Status(status) => TlvElement::structure(
                Tag::Anonymous,
                vec![TlvElement::structure(
                    Tag::Context(0),
                    vec![
                        status.path.to_tlv(Tag::Context(0)),
                        status_ib(Tag::Context(1), status.status.code(), status.cluster_status),
                    ],
                )],
            ),
            AttributeReport::Value(value) => {
                let mut data = value.value.clone();
                data.tag = Tag::Context(2);
                TlvElement::structure(
                    Tag::Anonymous,
                    vec![TlvElement::structure(
                        Tag::Context(1),
                        vec![
                            TlvElement::unsigned(Tag::Context(0), value.data_version as u64),
                            value.path.to_tlv(Tag::Context(1)),
                            data,
                        ],
                    )],
                )
            }
        }
    }

    fn from_tlv(element: &TlvElement) -> Result<Self> {
        if let Some(status) = element.field(0) {
            let path = AttributePathIb::from_tlv(status.expect_field(0)?)?;
            let (code, cluster_status) = parse_status_ib(status.expect_field(1)?)?;
            return Ok(AttributeReport::Status(AttributeStatus {
                path,
                status: status_from_code(code),
                cluster_status,
            }));
        }
        let data = element
            .field(1)
            .ok_or_else(|| Error::UnexpectedData("empty attribute report".into()))?;
        let mut value = data.expect_field(2)?.clone();
        value.tag = Tag::Anonymous;
        Ok(AttributeReport::Value(AttributeValue {
            data_version: data.expect_field(0)?.as_unsigned()? as u32,
            path: AttributePathIb::from_tlv(data.expect_field(1)?)?,
            value,
        }))
    }
}

/// A reported event.
#[derive(Clone, Debug, PartialEq)]
pub struct EventReport {
    pub path: EventPathIb,
    pub event_number: u64,
    pub data: TlvElement,
}

impl EventReport {
    fn to_tlv(&self) -> TlvElement {
        let mut data = self.data.clone();
        data.tag = Tag::Context(7);
        TlvElement::structure(
            Tag::Anonymous,
            vec![TlvElement::structure(
                Tag::Context(1),
                vec![
                    self.path.to_tlv(Tag::Context(0)),
                    TlvElement::unsigned(Tag::Context(1), self.event_number),
                    data,
                ],
            )],
        )
    }

    fn from_tlv(element: &TlvElement) -> Result<Self> {
        let data = element
            .field(1)
            .ok_or_else(|| Error::UnexpectedData("empty event report".into()))?;
        let mut value = data.expect_field(7)?.clone();
        value.tag = Tag::Anonymous;
        Ok(Self {
            path: EventPathIb::from_tlv(data.expect_field(0)?)?,
            event_number: data.expect_field(1)?.as_unsigned()?,
            data: value,
        })
    }
}

fn status_ib(tag: Tag, status: u8, cluster_status: Option<u8>) -> TlvElement {
    let mut items = vec![TlvElement::unsigned(Tag::Context(0), status as u64)];
    if let Some(cluster_status) = cluster_status {
        items.push(TlvElement::unsigned(Tag::Context(1), cluster_status as u64));
    }
    TlvElement::structure(tag, items)
}

fn parse_status_ib(element: &TlvElement) -> Result<(u8, Option<u8>)> {
    let status = element.expect_field(0)?.as_unsigned()? as u8;
    let cluster_status = match element.field(1) {
        Some(f) => Some(f.as_unsigned()? as u8),
        None => None,
    };
    Ok((status, cluster_status))
}

/// Map a raw code back onto the enum, keeping unknown codes as Failure.
pub fn status_from_code(code: u8) -> Status {
    match code {
        0x00 => Status::Success,
        0x7E => Status::UnsupportedAccess,
        0x7F => Status::UnsupportedEndpoint,
        0x80 => Status::InvalidAction,
        0x81 => Status::UnsupportedCommand,
        0x86 => Status::UnsupportedAttribute,
        0x87 => Status::ConstraintError,
        0x88 => Status::UnsupportedWrite,
        0x89 => Status::ResourceExhausted,
        0x8B => Status::NotFound,
        0x8C => Status::UnreportableAttribute,
        0x8D => Status::InvalidDataType,
        0x8F => Status::UnsupportedRead,
        0x92 => Status::DataVersionMismatch,
        0x94 => Status::Timeout,
        0x9C => Status::Busy,
        0xC3 => Status::UnsupportedCluster,
        0xC6 => Status::NeedsTimedInteraction,
        0xC7 => Status::UnsupportedEvent,
        0xC8 => Status::PathsExhausted,
        0xC9 => Status::TimedRequestMismatch,
        _ => Status::Failure,
    }
}

// =============================================================================
// REQUEST / RESPONSE MESSAGES
// =============================================================================

/// DataVersionFilterIB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataVersionFilter {
    pub endpoint: u16,
    pub cluster: u32,
    pub data_version: u32,
}

/// EventFilterIB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventFilter {
    pub event_min: u64,
}

/// ReadRequestMessage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadRequest {
    pub attribute_requests: Vec<AttributePathIb>,
    pub event_requests: Vec<EventPathIb>,
    pub event_filters: Vec<EventFilter>,
    pub fabric_filtered: bool,
    pub data_version_filters: Vec<DataVersionFilter>,
}

impl ReadRequest {
    pub fn to_tlv(&self) -> TlvElement {
        let mut fields = Vec::new();
        fields.push(TlvElement::array(
            Tag::Context(0),
            self.attribute_requests
                .iter()
                .map(|p| p.to_tlv(Tag::Anonymous))
                .collect(),
        ));
        if !self.event_requests.is_empty() {
            fields.push(TlvElement::array(
                Tag::Context(1),
                self.event_requests
                    .iter()
                    .map(|p| p.to_tlv(Tag::Anonymous))
                    .collect(),
            ));
        }
        if !self.event_filters.is_empty() {
            fields.push(TlvElement::array(
                Tag::Context(2),
                self.event_filters
                    .iter()
                    .map(|f| {
                        TlvElement::structure(
                            Tag::Anonymous,
                            vec![TlvElement::unsigned(Tag::Context(1), f.event_min)],
                        )
                    })
                    .collect(),
            ));
        }
        fields.push(TlvElement::boolean(Tag::Context(3), self.fabric_filtered));
        if !self.data_version_filters.is_empty() {
            fields.push(TlvElement::array(
                Tag::Context(4),
                self.data_version_filters
                    .iter()
                    .map(data_version_filter_to_tlv)
                    .collect(),
            ));
        }
        fields.push(TlvElement::unsigned(
            Tag::Context(TAG_REVISION),
            INTERACTION_MODEL_REVISION as u64,
        ));
        TlvElement::structure(Tag::Anonymous, fields)
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        let mut request = Self {
            // isFabricFiltered defaults to true for Read/Subscribe.
            fabric_filtered: true,
            ..Self::default()
        };
        if let Some(paths) = root.field(0) {
            for path in paths.as_array()? {
                request.attribute_requests.push(AttributePathIb::from_tlv(path)?);
            }
        }
        if let Some(paths) = root.field(1) {
            for path in paths.as_array()? {
                request.event_requests.push(EventPathIb::from_tlv(path)?);
            }
        }
        if let Some(filters) = root.field(2) {
            for filter in filters.as_array()? {
                request.event_filters.push(EventFilter {
                    event_min: filter.expect_field(1)?.as_unsigned()?,
                });
            }
        }
        if let Some(filtered) = root.field(3) {
            request.fabric_filtered = filtered.as_bool()?;
        }
        if let Some(filters) = root.field(4) {
            for filter in filters.as_array()? {
                request
                    .data_version_filters
                    .push(data_version_filter_from_tlv(filter)?);
            }
        }
        Ok(request)
    }
}

fn data_version_filter_to_tlv(filter: &DataVersionFilter) -> TlvElement {
    TlvElement::structure(
        Tag::Anonymous,
        vec![
            TlvElement::list(
                Tag::Context(0),
                vec![
                    TlvElement::unsigned(Tag::Context(1), filter.endpoint as u64),
                    TlvElement::unsigned(Tag::Context(2), filter.cluster as u64),
                ],
            ),
            TlvElement::unsigned(Tag::Context(1), filter.data_version as u64),
        ],
    )
}

fn data_version_filter_from_tlv(element: &TlvElement) -> Result<DataVersionFilter> {
    let path = element.expect_field(0)?;
    Ok(DataVersionFilter {
        endpoint: path.expect_field(1)?.as_unsigned()? as u16,
        cluster: path.expect_field(2)?.as_unsigned()? as u32,
        data_version: element.expect_field(1)?.as_unsigned()? as u32,
    })
}

/// ReportDataMessage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReportData {
    pub subscription_id: Option<u32>,
    pub attribute_reports: Vec<AttributeReport>,
    pub event_reports: Vec<EventReport>,
    pub more_chunked_messages: bool,
    pub suppress_response: bool,
}

impl ReportData {
    pub fn to_tlv(&self) -> TlvElement {
        let mut fields = Vec::new();
        if let Some(id) = self.subscription_id {
            fields.push(TlvElement::unsigned(Tag::Context(0), id as u64));
        }
        if !self.attribute_reports.is_empty() {
            fields.push(TlvElement::array(
                Tag::Context(1),
                self.attribute_reports.iter().map(|r| r.to_tlv()).collect(),
            ));
        }
        if !self.event_reports.is_empty() {
            fields.push(TlvElement::array(
                Tag::Context(2),
                self.event_reports.iter().map(|r| r.to_tlv()).collect(),
            ));
        }
        if self.more_chunked_messages {
            fields.push(TlvElement::boolean(Tag::Context(3), true));
        }
        if self.suppress_response {
            fields.push(TlvElement::boolean(Tag::Context(4), true));
        }
        fields.push(TlvElement::unsigned(
            Tag::Context(TAG_REVISION),
            INTERACTION_MODEL_REVISION as u64,
        ));
        TlvElement::structure(Tag::Anonymous, fields)
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        let mut report = Self::default();
        if let Some(id) = root.field(0) {
            report.subscription_id = Some(id.as_unsigned()? as u32);
        }
        if let Some(reports) = root.field(1) {
            for entry in reports.as_array()? {
                report.attribute_reports.push(AttributeReport::from_tlv(entry)?);
            }
        }
        if let Some(reports) = root.field(2) {
            for entry in reports.as_array()? {
                report.event_reports.push(EventReport::from_tlv(entry)?);
            }
        }
        if let Some(more) = root.field(3) {
            report.more_chunked_messages = more.as_bool()?;
        }
        if let Some(suppress) = root.field(4) {
            report.suppress_response = suppress.as_bool()?;
        }
        Ok(report)
    }
}

/// SubscribeRequestMessage.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscribeRequest {
    pub keep_subscriptions: bool,
    pub min_interval_floor_secs: u64,
    pub max_interval_ceiling_secs: u64,
    pub read: ReadRequest,
}

impl SubscribeRequest {
    pub fn to_tlv(&self) -> TlvElement {
        let mut fields = vec![
            TlvElement::boolean(Tag::Context(0), self.keep_subscriptions),
            TlvElement::unsigned(Tag::Context(1), self.min_interval_floor_secs),
            TlvElement::unsigned(Tag::Context(2), self.max_interval_ceiling_secs),
            TlvElement::array(
                Tag::Context(3),
                self.read
                    .attribute_requests
                    .iter()
                    .map(|p| p.to_tlv(Tag::Anonymous))
                    .collect(),
            ),
        ];
        if !self.read.event_requests.is_empty() {
            fields.push(TlvElement::array(
                Tag::Context(4),
                self.read
                    .event_requests
                    .iter()
                    .map(|p| p.to_tlv(Tag::Anonymous))
                    .collect(),
            ));
        }
        if !self.read.event_filters.is_empty() {
            fields.push(TlvElement::array(
                Tag::Context(5),
                self.read
                    .event_filters
                    .iter()
                    .map(|f| {
                        TlvElement::structure(
                            Tag::Anonymous,
                            vec![TlvElement::unsigned(Tag::Context(1), f.event_min)],
                        )
                    })
                    .collect(),
            ));
        }
        fields.push(TlvElement::boolean(Tag::Context(7), self.read.fabric_filtered));
        if !self.read.data_version_filters.is_empty() {
            fields.push(TlvElement::array(
                Tag::Context(8),
                self.read
                    .data_version_filters
                    .iter()
                    .map(data_version_filter_to_tlv)
                    .collect(),
            ));
        }
        fields.push(TlvElement::unsigned(
            Tag::Context(TAG_REVISION),
            INTERACTION_MODEL_REVISION as u64,
        ));
        TlvElement::structure(Tag::Anonymous, fields)
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        let mut read = ReadRequest {
            fabric_filtered: true,
            ..ReadRequest::default()
        };
        if let Some(paths) = root.field(3) {
            for path in paths.as_array()? {
                read.attribute_requests.push(AttributePathIb::from_tlv(path)?);
            }
        }
        if let Some(paths) = root.field(4) {
            for path in paths.as_array()? {
                read.event_requests.push(EventPathIb::from_tlv(path)?);
            }
        }
        if let Some(filters) = root.field(5) {
            for filter in filters.as_array()? {
                read.event_filters.push(EventFilter {
                    event_min: filter.expect_field(1)?.as_unsigned()?,
                });
            }
        }
        if let Some(filtered) = root.field(7) {
            read.fabric_filtered = filtered.as_bool()?;
        }
        if let Some(filters) = root.field(8) {
            for filter in filters.as_array()? {
                read.data_version_filters
                    .push(data_version_filter_from_tlv(filter)?);
            }
        }
        Ok(Self {
            keep_subscriptions: match root.field(0) {
                Some(f) => f.as_bool()?,
                None => true,
            },
            min_interval_floor_secs: root.expect_field(1)?.as_unsigned()?,
            max_interval_ceiling_secs: root.expect_field(2)?.as_unsigned()?,
            read,
        })
    }
}

/// SubscribeResponseMessage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscribeResponse {
    pub subscription_id: u32,
    pub max_interval_secs: u16,
}

impl SubscribeResponse {
    pub fn to_tlv(&self) -> TlvElement {
        TlvElement::structure(
            Tag::Anonymous,
            vec![
                TlvElement::unsigned(Tag::Context(0), self.subscription_id as u64),
                TlvElement::unsigned(Tag::Context(2), self.max_interval_secs as u64),
                TlvElement::unsigned(
                    Tag::Context(TAG_REVISION),
                    INTERACTION_MODEL_REVISION as u64,
                ),
            ],
        )
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        Ok(Self {
            subscription_id: root.expect_field(0)?.as_unsigned()? as u32,
            max_interval_secs: root.expect_field(2)?.as_unsigned()? as u16,
        })
    }
}

/// One AttributeDataIB of a WriteRequest.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteData {
    pub path: AttributePathIb,
    pub data: TlvElement,
    pub data_version: Option<u32>,
}

/// WriteRequestMessage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteRequest {
    pub suppress_response: bool,
    pub timed_request: bool,
    pub write_requests: Vec<WriteData>,
    pub more_chunked_messages: bool,
}

impl WriteRequest {
    pub fn to_tlv(&self) -> TlvElement {
        let writes = self
            .write_requests
            .iter()
            .map(|write| {
                let mut fields = Vec::new();
                if let Some(version) = write.data_version {
                    fields.push(TlvElement::unsigned(Tag::Context(0), version as u64));
                }
                fields.push(write.path.to_tlv(Tag::Context(1)));
                let mut data = write.data.clone();
                data.tag = Tag::Context(2);
                fields.push(data);
                TlvElement::structure(Tag::Anonymous, fields)
            })
            .collect();
        let mut fields = vec![
            TlvElement::boolean(Tag::Context(0), self.suppress_response),
            TlvElement::boolean(Tag::Context(1), self.timed_request),
            TlvElement::array(Tag::Context(2), writes),
        ];
        if self.more_chunked_messages {
            fields.push(TlvElement::boolean(Tag::Context(3), true));
        }
        fields.push(TlvElement::unsigned(
            Tag::Context(TAG_REVISION),
            INTERACTION_MODEL_REVISION as u64,
        ));
        TlvElement::structure(Tag::Anonymous, fields)
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        let mut request = Self::default();
        if let Some(suppress) = root.field(0) {
            request.suppress_response = suppress.as_bool()?;
        }
        if let Some(timed) = root.field(1) {
            request.timed_request = timed.as_bool()?;
        }
        if let Some(writes) = root.field(2) {
            for write in writes.as_array()? {
                let mut data = write.expect_field(2)?.clone();
                data.tag = Tag::Anonymous;
                request.write_requests.push(WriteData {
                    path: AttributePathIb::from_tlv(write.expect_field(1)?)?,
                    data,
                    data_version: match write.field(0) {
                        Some(f) => Some(f.as_unsigned()? as u32),
                        None => None,
                    },
                });
            }
        }
        if let Some(more) = root.field(3) {
            request.more_chunked_messages = more.as_bool()?;
        }
        Ok(request)
    }
}

/// One AttributeStatusIB of a WriteResponse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteResponseStatus {
    pub path: AttributePathIb,
    pub status: Status,
    pub cluster_status: Option<u8>,
}

/// WriteResponseMessage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteResponse {
    pub write_responses: Vec<WriteResponseStatus>,
}

impl WriteResponse {
    pub fn to_tlv(&self) -> TlvElement {
        TlvElement::structure(
            Tag::Anonymous,
            vec![
                TlvElement::array(
                    Tag::Context(0),
                    self.write_responses
                        .iter()
                        .map(|entry| {
                            TlvElement::structure(
                                Tag::Anonymous,
                                vec![
                                    entry.path.to_tlv(Tag::Context(0)),
                                    status_ib(
                                        Tag::Context(1),
                                        entry.status.code(),
                                        entry.cluster_status,
                                    ),
                                ],
                            )
                        })
                        .collect(),
                ),
                TlvElement::unsigned(
                    Tag::Context(TAG_REVISION),
                    INTERACTION_MODEL_REVISION as u64,
                ),
            ],
        )
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        let mut response = Self::default();
        if let Some(entries) = root.field(0) {
            for entry in entries.as_array()? {
                let (code, cluster_status) = parse_status_ib(entry.expect_field(1)?)?;
                response.write_responses.push(WriteResponseStatus {
                    path: AttributePathIb::from_tlv(entry.expect_field(0)?)?,
                    status: status_from_code(code),
                    cluster_status,
                });
            }
        }
        Ok(response)
    }
}

/// One CommandDataIB of an InvokeRequest.
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeCommand {
    pub path: CommandPathIb,
    pub fields: Option<TlvElement>,
    pub command_ref: Option<u16>,
}

/// InvokeRequestMessage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvokeRequest {
    pub suppress_response: bool,
    pub timed_request: bool,
    pub invoke_requests: Vec<InvokeCommand>,
}

impl InvokeRequest {
    pub fn to_tlv(&self) -> TlvElement {
        let commands = self
            .invoke_requests
            .iter()
            .map(|command| {
                let mut fields = vec![command.path.to_tlv(Tag::Context(0))];
                if let Some(data) = &command.fields {
                    let mut data = data.clone();
                    data.tag = Tag::Context(1);
                    fields.push(data);
                }
                if let Some(command_ref) = command.command_ref {
                    fields.push(TlvElement::unsigned(Tag::Context(2), command_ref as u64));
                }
                TlvElement::structure(Tag::Anonymous, fields)
            })
            .collect();
        TlvElement::structure(
            Tag::Anonymous,
            vec![
                TlvElement::boolean(Tag::Context(0), self.suppress_response),
                TlvElement::boolean(Tag::Context(1), self.timed_request),
                TlvElement::array(Tag::Context(2), commands),
                TlvElement::unsigned(
                    Tag::Context(TAG_REVISION),
                    INTERACTION_MODEL_REVISION as u64,
                ),
            ],
        )
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        let mut request = Self::default();
        if let Some(suppress) = root.field(0) {
            request.suppress_response = suppress.as_bool()?;
        }
        if let Some(timed) = root.field(1) {
            request.timed_request = timed.as_bool()?;
        }
        if let Some(commands) = root.field(2) {
            for command in commands.as_array()? {
                request.invoke_requests.push(InvokeCommand {
                    path: CommandPathIb::from_tlv(command.expect_field(0)?)?,
                    fields: command.field(1).map(|f| {
                        let mut data = f.clone();
                        data.tag = Tag::Anonymous;
                        data
                    }),
                    command_ref: match command.field(2) {
                        Some(f) => Some(f.as_unsigned()? as u16),
                        None => None,
                    },
                });
            }
        }
        Ok(request)
    }
}

/// One InvokeResponseIB.
#[derive(Clone, Debug, PartialEq)]
pub enum InvokeResponseItem {
    /// A data-bearing command response.
    Command {
        path: CommandPathIb,
        command_ref: Option<u16>,
        data: Option<TlvElement>,
    },
    /// A status-only command response.
    Status {
        path: CommandPathIb,
        command_ref: Option<u16>,
        status: Status,
        cluster_status: Option<u8>,
    },
}

impl InvokeResponseItem {
    fn to_tlv(&self) -> TlvElement {
        match self {
            InvokeResponseItem::Command {
                path,
                command_ref,
                data,
            } => {
                let mut fields = vec![path.to_tlv(Tag::Context(0))];
                if let Some(data) = data {
                    let mut data = data.clone();
                    data.tag = Tag::Context(1);
                    fields.push(data);
                }
                if let Some(command_ref) = command_ref {
                    fields.push(TlvElement::unsigned(Tag::Context(2), *command_ref as u64));
                }
                TlvElement::structure(
                    Tag::Anonymous,
                    vec![TlvElement::structure(Tag::Context(0), fields)],
                )
            }
            InvokeResponseItem::Status {
                path,
                command_ref,
                status,
                cluster_status,
            } => {
                let mut fields = vec![
                    path.to_tlv(Tag::Context(0)),
                    status_ib(Tag::Context(1), status.code(), *cluster_status),
                ];
                if let Some(command_ref) = command_ref {
                    fields.push(TlvElement::unsigned(Tag::Context(2), *command_ref as u64));
                }
                TlvElement::structure(
                    Tag::Anonymous,
                    vec![TlvElement::structure(Tag::Context(1), fields)],
                )
            }
        }
    }

    fn from_tlv(element: &TlvElement) -> Result<Self> {
        if let Some(command) = element.field(0) {
            return Ok(InvokeResponseItem::Command {
                path: CommandPathIb::from_tlv(command.expect_field(0)?)?,
                data: command.field(1).map(|f| {
                    let mut data = f.clone();
                    data.tag = Tag::Anonymous;
                    data
                }),
                command_ref: match command.field(2) {
                    Some(f) => Some(f.as_unsigned()? as u16),
                    None => None,
                },
            });
        }
        let status = element
            .field(1)
            .ok_or_else(|| Error::UnexpectedData("empty invoke response".into()))?;
        let (code, cluster_status) = parse_status_ib(status.expect_field(1)?)?;
        Ok(InvokeResponseItem::Status {
            path: CommandPathIb::from_tlv(status.expect_field(0)?)?,
            command_ref: match status.field(2) {
                Some(f) => Some(f.as_unsigned()? as u16),
                None => None,
            },
            status: status_from_code(code),
            cluster_status,
        })
    }
}

/// InvokeResponseMessage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvokeResponse {
    pub suppress_response: bool,
    pub invoke_responses: Vec<InvokeResponseItem>,
    pub more_chunked_messages: bool,
}

impl InvokeResponse {
    pub fn to_tlv(&self) -> TlvElement {
        let mut fields = vec![
            TlvElement::boolean(Tag::Context(0), self.suppress_response),
            TlvElement::array(
                Tag::Context(1),
                self.invoke_responses.iter().map(|r| r.to_tlv()).collect(),
            ),
        ];
        if self.more_chunked_messages {
            fields.push(TlvElement::boolean(Tag::Context(2), true));
        }
        fields.push(TlvElement::unsigned(
            Tag::Context(TAG_REVISION),
            INTERACTION_MODEL_REVISION as u64,
        ));
        TlvElement::structure(Tag::Anonymous, fields)
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        let mut response = Self::default();
        if let Some(suppress) = root.field(0) {
            response.suppress_response = suppress.as_bool()?;
        }
        if let Some(items) = root.field(1) {
            for item in items.as_array()? {
                response.invoke_responses.push(InvokeResponseItem::from_tlv(item)?);
            }
        }
        if let Some(more) = root.field(2) {
            response.more_chunked_messages = more.as_bool()?;
        }
        Ok(response)
    }
}

/// TimedRequestMessage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimedRequest {
    pub timeout_ms: u16,
}

impl TimedRequest {
    pub fn to_tlv(&self) -> TlvElement {
        TlvElement::structure(
            Tag::Anonymous,
            vec![
                TlvElement::unsigned(Tag::Context(0), self.timeout_ms as u64),
                TlvElement::unsigned(
                    Tag::Context(TAG_REVISION),
                    INTERACTION_MODEL_REVISION as u64,
                ),
            ],
        )
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        Ok(Self {
            timeout_ms: root.expect_field(0)?.as_unsigned()? as u16,
        })
    }
}

/// StatusResponseMessage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: Status,
}

impl StatusResponse {
    pub fn to_tlv(&self) -> TlvElement {
        TlvElement::structure(
            Tag::Anonymous,
            vec![
                TlvElement::unsigned(Tag::Context(0), self.status.code() as u64),
                TlvElement::unsigned(
                    Tag::Context(TAG_REVISION),
                    INTERACTION_MODEL_REVISION as u64,
                ),
            ],
        )
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        Ok(Self {
            status: status_from_code(root.expect_field(0)?.as_unsigned()? as u8),
        })
    }
}

/// Convenience: the concrete path types used across handlers.
pub fn attribute_path(endpoint: EndpointNumber, cluster: ClusterId, attribute: AttributeId) -> AttributePathIb {
    AttributePathIb {
        endpoint: Some(endpoint.0),
        cluster: Some(cluster.0),
        attribute: Some(attribute.0),
        list_index: None,
    }
}

/// Convenience: a concrete event path.
pub fn event_path(endpoint: EndpointNumber, cluster: ClusterId, event: EventId) -> EventPathIb {
    EventPathIb {
        endpoint: Some(endpoint.0),
        cluster: Some(cluster.0),
        event: Some(event.0),
    }
}
