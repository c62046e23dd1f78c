//! Broker transport seam
//!
//! `Connector` opens one `Link` per connection attempt; the connection manager
//! never touches rumqttc directly. Errors come back already classified as
//! fatal (the link is gone) or recoverable (one request was lost).
//!
//! The production implementation polls the rumqttc `EventLoop` in its own
//! task and forwards the events the manager cares about over a channel, so
//! the request queue keeps draining while the caller is busy elsewhere.

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// How long a clean disconnect may take to flush before the link is dropped
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The connection is unusable and must be rebuilt
    Fatal,
    /// The connection survives, only the current request is lost
    Recoverable,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    Fatal(String),
    #[error("request dropped: {0}")]
    Recoverable(String),
}

impl TransportError {
    pub fn disposition(&self) -> Disposition {
        match self {
            TransportError::Fatal(_) => Disposition::Fatal,
            TransportError::Recoverable(_) => Disposition::Recoverable,
        }
    }
}

// Once poll() has returned an error the event loop has already dropped its
// network, so every ConnectionError ends the link.
impl From<rumqttc::ConnectionError> for TransportError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransportError::Fatal(root_cause(&err))
    }
}

// The request channel is closed; the event loop reports why on its own.
impl From<rumqttc::ClientError> for TransportError {
    fn from(err: rumqttc::ClientError) -> Self {
        TransportError::Recoverable(root_cause(&err))
    }
}

/// Retained message the broker publishes on our behalf if we vanish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Testament {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub qos: QoS,
    pub request_capacity: usize,
    pub testament: Testament,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Broker accepted the session (CONNACK success)
    Accepted,
}

type LinkEvents = mpsc::UnboundedReceiver<Result<LinkEvent, TransportError>>;

/// One live connection attempt.
#[allow(async_fn_in_trait)]
pub trait Link {
    /// Waits for the next protocol event. Must be cancel safe.
    async fn next_event(&mut self) -> Result<LinkEvent, TransportError>;

    /// Hands a message to the transport, waiting for room in its request
    /// queue when the broker is slower than the spool.
    async fn publish(&mut self, message: Outbound) -> Result<(), TransportError>;

    /// Best-effort clean disconnect.
    async fn close(&mut self);
}

pub trait Connector {
    type Link: Link;

    fn open(&mut self, options: &SessionOptions) -> Self::Link;
}

/// rumqttc-backed connector
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttConnector;

pub struct MqttLink {
    client: AsyncClient,
    events: LinkEvents,
    driver: JoinHandle<()>,
}

impl Connector for MqttConnector {
    type Link = MqttLink;

    /// Must be called from within a tokio runtime.
    fn open(&mut self, options: &SessionOptions) -> MqttLink {
        let mut opts = MqttOptions::new(&options.client_id, &options.host, options.port);
        opts.set_keep_alive(options.keep_alive);
        opts.set_clean_session(true);
        if let Some((username, password)) = &options.credentials {
            opts.set_credentials(username, password);
        }
        opts.set_last_will(rumqttc::LastWill::new(
            &options.testament.topic,
            options.testament.payload.clone(),
            options.qos,
            true,
        ));

        debug!(
            "Opening MQTT session {} to {}:{}",
            options.client_id, options.host, options.port
        );
        let (client, event_loop) = AsyncClient::new(opts, options.request_capacity);
        let (sender, events) = mpsc::unbounded_channel();
        let driver = task::spawn(drive_event_loop(event_loop, sender));
        MqttLink {
            client,
            events,
            driver,
        }
    }
}

/// Polls the event loop until the session ends: first error, or our own
/// DISCONNECT on the wire. rumqttc would redial on the next poll, the
/// connection manager owns that decision instead.
async fn drive_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::UnboundedSender<Result<LinkEvent, TransportError>>,
) {
    loop {
        let event = match event_loop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => Ok(LinkEvent::Accepted),
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                Err(TransportError::Fatal("disconnected by broker".into()))
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT DISCONNECT sent");
                return;
            }
            Ok(event) => {
                trace!("MQTT event: {:?}", event);
                continue;
            }
            Err(e) => Err(e.into()),
        };
        let ended = event.is_err();
        if events.send(event).is_err() || ended {
            return;
        }
    }
}

impl Link for MqttLink {
    async fn next_event(&mut self) -> Result<LinkEvent, TransportError> {
        match self.events.recv().await {
            Some(event) => event,
            None => Err(TransportError::Fatal("MQTT event loop stopped".into())),
        }
    }

    async fn publish(&mut self, message: Outbound) -> Result<(), TransportError> {
        self.client
            .publish(message.topic, message.qos, message.retain, message.payload)
            .await?;
        Ok(())
    }

    async fn close(&mut self) {
        // queued publishes (the final "dead" announcement) go out before DISCONNECT
        let flushed = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
            self.client.disconnect().await?;
            if let Err(e) = (&mut self.driver).await {
                debug!("MQTT event loop task ended abnormally: {}", e);
            }
            Ok::<_, rumqttc::ClientError>(())
        })
        .await;

        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Error sending disconnect packet: {}", e),
            Err(_) => warn!("MQTT disconnect did not complete within {:?}", CLOSE_FLUSH_TIMEOUT),
        }
        self.driver.abort();
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Innermost message of an error chain, without surrounding quotes.
fn root_cause(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
