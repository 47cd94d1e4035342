//! Secure channel messenger
//!
//! Typed message reads and writes over a [`MessageExchange`], with
//! StatusReport handling folded in: a non-success report surfaces as a
//! channel-status error instead of a payload.

use crate::exchange::{ExchangeMessage, MessageExchange, PROTOCOL_SECURE_CHANNEL};
use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use weft_core::tlv::TlvElement;
use weft_core::{Error, Result};

/// SecureChannel message opcodes.
pub mod msg_type {
    pub const SIGMA1: u8 = 0x30;
    pub const SIGMA2: u8 = 0x31;
    pub const SIGMA3: u8 = 0x32;
    pub const SIGMA2_RESUME: u8 = 0x33;
    pub const STATUS_REPORT: u8 = 0x40;
}

/// StatusReport general codes.
pub mod general_status {
    pub const SUCCESS: u16 = 0;
    pub const FAILURE: u16 = 1;
}

/// SecureChannel protocol-status codes carried in StatusReports.
pub mod protocol_status {
    pub const SESSION_ESTABLISHMENT_SUCCESS: u16 = 0;
    pub const NO_SHARED_TRUST_ROOTS: u16 = 1;
    pub const INVALID_PARAM: u16 = 2;
    pub const CLOSE_SESSION: u16 = 3;
    pub const BUSY: u16 = 4;
}

/// Waits default to two seconds; steps involving peer-side signing or key
/// derivation allow thirty.
pub const DEFAULT_EXPECTED_PROCESSING_TIME: Duration = Duration::from_secs(2);
pub const HEAVY_CRYPTO_PROCESSING_TIME: Duration = Duration::from_secs(30);

/// Decoded StatusReport payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusReport {
    pub general_status: u16,
    pub protocol_id: u32,
    pub protocol_status: u16,
}

impl StatusReport {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u16_le(self.general_status);
        buf.put_u32_le(self.protocol_id);
        buf.put_u16_le(self.protocol_status);
        buf.to_vec()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.len() < 8 {
            return Err(Error::UnexpectedData("truncated status report".into()));
        }
        Ok(Self {
            general_status: payload.get_u16_le(),
            protocol_id: payload.get_u32_le(),
            protocol_status: payload.get_u16_le(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.general_status == general_status::SUCCESS
    }
}

/// Framed secure-channel conversation over one exchange.
pub struct SecureChannelMessenger {
    exchange: MessageExchange,
    expected_processing_time: Duration,
}

impl SecureChannelMessenger {
    pub fn new(exchange: MessageExchange) -> Self {
        Self {
            exchange,
            expected_processing_time: DEFAULT_EXPECTED_PROCESSING_TIME,
        }
    }

    pub fn exchange(&self) -> &MessageExchange {
        &self.exchange
    }

    /// Interpret a message that was already pulled off the exchange.
    ///
    /// StatusReports are decoded first: a failure becomes a channel-status
    /// error, a success report for an unexpected type is still unexpected
    /// data. Any other wrong type is unexpected data.
    pub fn process_message(
        &self,
        message: ExchangeMessage,
        expected_type: Option<u8>,
    ) -> Result<ExchangeMessage> {
        if message.message_type == msg_type::STATUS_REPORT {
            let report = StatusReport::decode(&message.payload)?;
            if !report.is_success() {
                return Err(Error::ChannelStatusResponse {
                    general_status: report.general_status,
                    protocol_status: report.protocol_status,
                });
            }
        }
        if let Some(expected) = expected_type {
            if message.message_type != expected {
                return Err(Error::UnexpectedData(format!(
                    "expected message type {expected:#04x}, got {:#04x}",
                    message.message_type
                )));
            }
        }
        Ok(message)
    }

    /// Receive the next message, requiring `expected_type` when given.
    pub async fn next_message(&self, expected_type: Option<u8>) -> Result<ExchangeMessage> {
        let message = self.exchange.recv(self.expected_processing_time).await?;
        self.process_message(message, expected_type)
    }

    /// Receive and TLV-decode the next message.
    pub async fn next_message_tlv(&self, expected_type: u8) -> Result<TlvElement> {
        let message = self.next_message(Some(expected_type)).await?;
        Ok(TlvElement::decode(&message.payload)?)
    }

    /// Send a secure-channel message. `expected_processing_time` bounds the
    /// wait for whatever answer follows; heavy-crypto steps pass the larger
    /// constant.
    pub async fn send(
        &mut self,
        message_type: u8,
        payload: Vec<u8>,
        expected_processing_time: Duration,
    ) -> Result<()> {
        self.expected_processing_time = expected_processing_time;
        self.exchange
            .send(ExchangeMessage::new(
                PROTOCOL_SECURE_CHANNEL,
                message_type,
                payload,
            ))
            .await
    }

    /// Send a TLV-encoded secure-channel message.
    pub async fn send_tlv(
        &mut self,
        message_type: u8,
        element: &TlvElement,
        expected_processing_time: Duration,
    ) -> Result<()> {
        self.send(message_type, element.encode(), expected_processing_time)
            .await
    }

    async fn send_status(&mut self, general: u16, protocol: u16) -> Result<()> {
        let report = StatusReport {
            general_status: general,
            protocol_id: PROTOCOL_SECURE_CHANNEL,
            protocol_status: protocol,
        };
        self.send(
            msg_type::STATUS_REPORT,
            report.encode(),
            DEFAULT_EXPECTED_PROCESSING_TIME,
        )
        .await
    }

    /// Send the session-establishment success report.
    pub async fn send_success(&mut self) -> Result<()> {
        self.send_status(
            general_status::SUCCESS,
            protocol_status::SESSION_ESTABLISHMENT_SUCCESS,
        )
        .await
    }

    /// Send a failure report with the given protocol status.
    pub async fn send_error(&mut self, protocol: u16) -> Result<()> {
        self.send_status(general_status::FAILURE, protocol).await
    }

    /// Send the close-session report.
    pub async fn send_close_session(&mut self) -> Result<()> {
        self.send_status(general_status::SUCCESS, protocol_status::CLOSE_SESSION)
            .await
    }

    /// Wait for a success StatusReport.
    pub async fn wait_for_success(&self) -> Result<()> {
        self.next_message(Some(msg_type::STATUS_REPORT)).await?;
        Ok(())
    }
}
