//! Message exchange over a datagram channel
//!
//! Frames carry a protocol id and a message-type opcode. The channel is a
//! bidirectional pair of queues; a UDP transport pumps datagrams into one
//! end, and tests wire two ends back to back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, trace};
use weft_core::{Error, Result};

/// Matter SecureChannel protocol id.
pub const PROTOCOL_SECURE_CHANNEL: u32 = 0x0000;
/// Matter Interaction Model protocol id.
pub const PROTOCOL_INTERACTION_MODEL: u32 = 0x0001;

/// A protocol message within an exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeMessage {
    pub protocol_id: u32,
    pub message_type: u8,
    pub payload: Vec<u8>,
}

impl ExchangeMessage {
    pub fn new(protocol_id: u32, message_type: u8, payload: Vec<u8>) -> Self {
        Self {
            protocol_id,
            message_type,
            payload,
        }
    }
}

/// Cooperative abort signal honoured between I/O steps.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            if self.is_aborted() {
                return;
            }
            // Register interest before the final check so an abort racing
            // this call cannot slip between check and sleep.
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// One end of a bidirectional message channel.
pub struct MessageChannel {
    tx: mpsc::Sender<ExchangeMessage>,
    rx: Mutex<mpsc::Receiver<ExchangeMessage>>,
}

impl MessageChannel {
    const QUEUE_DEPTH: usize = 32;

    /// Build a channel from raw queue halves (used by transports).
    pub fn from_parts(
        tx: mpsc::Sender<ExchangeMessage>,
        rx: mpsc::Receiver<ExchangeMessage>,
    ) -> Self {
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Two channel ends wired back to back.
    pub fn loopback() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(Self::QUEUE_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(Self::QUEUE_DEPTH);
        (Self::from_parts(a_tx, b_rx), Self::from_parts(b_tx, a_rx))
    }

    async fn send(&self, message: ExchangeMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::Network("channel closed".into()))
    }

    async fn recv(&self) -> Result<ExchangeMessage> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Network("channel closed".into()))
    }
}

/// Sigma1 retransmission budget.
#[derive(Clone, Copy, Debug)]
pub struct RetransmissionConfig {
    pub max_retransmissions: u32,
    pub interval: Duration,
}

impl Default for RetransmissionConfig {
    fn default() -> Self {
        Self {
            max_retransmissions: 5,
            interval: Duration::from_millis(500),
        }
    }
}

/// A bidirectional exchange with a single peer.
pub struct MessageExchange {
    channel: MessageChannel,
    exchange_id: u16,
    abort: AbortSignal,
}

impl MessageExchange {
    pub fn new(channel: MessageChannel, exchange_id: u16, abort: AbortSignal) -> Self {
        Self {
            channel,
            exchange_id,
            abort,
        }
    }

    pub fn exchange_id(&self) -> u16 {
        self.exchange_id
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Send one message.
    pub async fn send(&self, message: ExchangeMessage) -> Result<()> {
        if self.abort.is_aborted() {
            return Err(Error::PeerCommunication("operation aborted".into()));
        }
        trace!(
            exchange = self.exchange_id,
            message_type = message.message_type,
            len = message.payload.len(),
            "send"
        );
        self.channel.send(message).await
    }

    /// Receive the next message, honouring the abort signal and `timeout`.
    pub async fn recv(&self, timeout: Duration) -> Result<ExchangeMessage> {
        tokio::select! {
            message = self.channel.recv() => {
                let message = message?;
                trace!(
                    exchange = self.exchange_id,
                    message_type = message.message_type,
                    len = message.payload.len(),
                    "recv"
                );
                Ok(message)
            }
            _ = self.abort.wait() => {
                Err(Error::PeerCommunication("operation aborted".into()))
            }
            _ = tokio::time::sleep(timeout) => {
                Err(Error::PeerCommunication("timed out waiting for peer".into()))
            }
        }
    }

    /// Send an opening message, retransmitting until the peer answers or
    /// the budget is exhausted.
    pub async fn send_initial(
        &self,
        message: ExchangeMessage,
        config: RetransmissionConfig,
    ) -> Result<ExchangeMessage> {
        for attempt in 0..=config.max_retransmissions {
            if attempt > 0 {
                debug!(
                    exchange = self.exchange_id,
                    attempt, "retransmitting initial message"
                );
            }
            self.send(message.clone()).await?;
            match self.recv(config.interval).await {
                Ok(response) => return Ok(response),
                Err(Error::PeerCommunication(reason)) if reason.contains("timed out") => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::RetransmissionLimitReached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_roundtrip() {
        let (a, b) = MessageChannel::loopback();
        let a = MessageExchange::new(a, 1, AbortSignal::new());
        let b = MessageExchange::new(b, 1, AbortSignal::new());

        let message = ExchangeMessage::new(PROTOCOL_SECURE_CHANNEL, 0x30, vec![1, 2, 3]);
        a.send(message.clone()).await.unwrap();
        let received = b.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let (a, _b) = MessageChannel::loopback();
        let a = MessageExchange::new(a, 1, AbortSignal::new());
        let err = a.recv(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::PeerCommunication(_)));
    }

    #[tokio::test]
    async fn test_abort_interrupts_recv() {
        let (a, _b) = MessageChannel::loopback();
        let abort = AbortSignal::new();
        let a = MessageExchange::new(a, 1, abort.clone());

        let handle = tokio::spawn(async move { a.recv(Duration::from_secs(30)).await });
        tokio::task::yield_now().await;
        abort.abort();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::PeerCommunication(_)));
    }

    #[tokio::test]
    async fn test_retransmission_limit() {
        let (a, b) = MessageChannel::loopback();
        let a = MessageExchange::new(a, 1, AbortSignal::new());

        let message = ExchangeMessage::new(PROTOCOL_SECURE_CHANNEL, 0x30, vec![]);
        let config = RetransmissionConfig {
            max_retransmissions: 2,
            interval: Duration::from_millis(10),
        };
        let err = a.send_initial(message, config).await.unwrap_err();
        assert!(matches!(err, Error::RetransmissionLimitReached));

        // All three attempts landed on the peer queue.
        let b = MessageExchange::new(b, 1, AbortSignal::new());
        for _ in 0..3 {
            b.recv(Duration::from_millis(10)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_retransmission_stops_on_answer() {
        let (a, b) = MessageChannel::loopback();
        let a = MessageExchange::new(a, 1, AbortSignal::new());
        let b = MessageExchange::new(b, 1, AbortSignal::new());

        let answer = ExchangeMessage::new(PROTOCOL_SECURE_CHANNEL, 0x31, vec![9]);
        let responder = {
            let answer = answer.clone();
            tokio::spawn(async move {
                b.recv(Duration::from_secs(1)).await.unwrap();
                b.send(answer).await.unwrap();
            })
        };

        let message = ExchangeMessage::new(PROTOCOL_SECURE_CHANNEL, 0x30, vec![]);
        let response = a
            .send_initial(message, RetransmissionConfig::default())
            .await
            .unwrap();
        assert_eq!(response, answer);
        responder.await.unwrap();
    }
}
