//! Broker connection lifecycle
//!
//! `ConnectionManager` owns the only broker link, its state, and the single
//! reconnect timer. Every change goes through [`transition`], a plain table
//! from `(state, input)` to `(next state, action)`:
//!
//! ```text
//! Disconnected      --Open---------> Connecting        (dial)
//! Connecting        --Accepted-----> Connected         (announce "alive")
//! Connecting|Connected --Fatal-----> ReconnectPending  (drop link, arm timer)
//! ReconnectPending  --TimerElapsed-> Connecting        (dial)
//! anything          --Recoverable--> unchanged
//! ```
//!
//! Publishing outside `Connected` is a silent no-op: there is no outbound
//! queue, spool files are consumed whether or not the broker is reachable.
//!
//! Waiting ([`ConnectionManager::wait`]) and reacting
//! ([`ConnectionManager::handle`]) are separate steps so a caller can race the
//! wait against other work in `select!` and still run the reaction to
//! completion.

use crate::transport::{
    Connector, Disposition, Link, LinkEvent, Outbound, SessionOptions, TransportError,
};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(20);

/// Bound on queueing the final "dead" announcement behind a stuck broker
const SHUTDOWN_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Open,
    Accepted,
    Fault(Disposition),
    TimerElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Nothing,
    /// Open a fresh link, superseding any pending timer
    Dial,
    /// Publish the retained "alive" announcement
    Announce,
    /// Drop the link and arm the reconnect timer
    TearDown,
}

pub fn transition(state: ConnectionState, input: Input) -> (ConnectionState, Action) {
    use ConnectionState::*;

    match (state, input) {
        (Disconnected, Input::Open) => (Connecting, Action::Dial),
        (ReconnectPending, Input::TimerElapsed) => (Connecting, Action::Dial),
        (Connecting | Connected, Input::Accepted) => (Connected, Action::Announce),
        (Connecting | Connected, Input::Fault(Disposition::Fatal)) => {
            (ReconnectPending, Action::TearDown)
        }
        // includes a second fatal error while a timer is already pending
        (state, _) => (state, Action::Nothing),
    }
}

/// Result of a publish request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the transport
    Queued,
    /// Not connected, silently discarded
    Dropped,
    /// The transport refused it (already logged)
    Failed,
}

/// What woke [`ConnectionManager::wait`] up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wakeup {
    Link(Result<LinkEvent, TransportError>),
    ReconnectTimer,
}

/// `{"state":"alive"}` or `{"state":"dead"}`
pub fn liveness_payload(state: &str) -> Vec<u8> {
    serde_json::json!({ "state": state }).to_string().into_bytes()
}

pub struct ConnectionManager<C: Connector> {
    connector: C,
    options: SessionOptions,
    reconnect_delay: Duration,
    state: ConnectionState,
    link: Option<C::Link>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

impl<C: Connector> ConnectionManager<C> {
    /// The liveness topic is the testament topic of `options`.
    pub fn new(connector: C, options: SessionOptions, reconnect_delay: Duration) -> Self {
        Self {
            connector,
            options,
            reconnect_delay,
            state: ConnectionState::Disconnected,
            link: None,
            reconnect: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect.is_some()
    }

    pub fn liveness_topic(&self) -> &str {
        &self.options.testament.topic
    }

    /// Starts the first connection attempt. Completion is observed by [`Self::wait`].
    pub fn connect(&mut self) {
        self.apply(Input::Open);
    }

    /// Waits for room in the transport queue rather than dropping the message.
    pub async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Delivery {
        if self.state != ConnectionState::Connected {
            debug!("Not connected ({:?}), dropping message for {}", self.state, topic);
            return Delivery::Dropped;
        }
        let message = Outbound {
            topic: topic.to_string(),
            payload,
            qos: self.options.qos,
            retain: false,
        };
        self.send(message).await
    }

    /// Feeds a classified transport error through the transition table.
    pub fn on_transport_error(&mut self, err: TransportError) {
        match err.disposition() {
            Disposition::Recoverable => warn!("MQTT transport warning: {}", err),
            Disposition::Fatal => error!("MQTT transport error: {}", err),
        }
        self.apply(Input::Fault(err.disposition()));
    }

    /// Waits for the next link event or the reconnect timer.
    ///
    /// Cancel safe; never completes while there is neither a link nor a timer.
    pub async fn wait(&mut self) -> Wakeup {
        if let Some(link) = self.link.as_mut() {
            return Wakeup::Link(link.next_event().await);
        }
        match self.reconnect.as_mut() {
            Some(timer) => {
                timer.as_mut().await;
                Wakeup::ReconnectTimer
            }
            None => std::future::pending().await,
        }
    }

    /// Reacts to a wakeup. May publish, so it should run to completion.
    pub async fn handle(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Link(Ok(LinkEvent::Accepted)) => {
                info!("Connected to MQTT broker {}:{}", self.options.host, self.options.port);
                if self.apply(Input::Accepted) == Action::Announce {
                    let alive = self.liveness(LivenessState::Alive);
                    if self.send(alive).await == Delivery::Queued {
                        info!("Announced liveness on {}", self.options.testament.topic);
                    }
                }
            }
            Wakeup::Link(Err(e)) => self.on_transport_error(e),
            Wakeup::ReconnectTimer => {
                self.apply(Input::TimerElapsed);
            }
        }
    }

    /// [`Self::wait`] then [`Self::handle`].
    pub async fn drive(&mut self) {
        let wakeup = self.wait().await;
        self.handle(wakeup).await;
    }

    /// Clean shutdown: retained "dead" when connected, then DISCONNECT.
    pub async fn shutdown(&mut self) {
        if self.state == ConnectionState::Connected {
            let dead = self.liveness(LivenessState::Dead);
            if tokio::time::timeout(SHUTDOWN_PUBLISH_TIMEOUT, self.send(dead)).await.is_err() {
                warn!("Broker not draining, leaving the \"dead\" state to the last will");
            }
        }
        self.reconnect = None;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.state = ConnectionState::Disconnected;
        info!("MQTT connection closed");
    }

    /// Runs the transition and its side effects, except the announcement,
    /// which needs to publish and is left to the caller.
    fn apply(&mut self, input: Input) -> Action {
        let (next, action) = transition(self.state, input);
        if next != self.state {
            debug!("Connection state {:?} -> {:?} on {:?}", self.state, next, input);
        }
        self.state = next;

        match action {
            Action::Nothing | Action::Announce => {}
            Action::Dial => {
                self.reconnect = None;
                info!(
                    "Connecting to MQTT broker {}:{}...",
                    self.options.host, self.options.port
                );
                self.link = Some(self.connector.open(&self.options));
            }
            Action::TearDown => {
                self.link = None;
                self.reconnect = Some(Box::pin(tokio::time::sleep(self.reconnect_delay)));
                warn!("Reconnecting in {} seconds", self.reconnect_delay.as_secs());
            }
        }
        action
    }

    async fn send(&mut self, message: Outbound) -> Delivery {
        let Some(link) = self.link.as_mut() else {
            return Delivery::Dropped;
        };
        match link.publish(message).await {
            Ok(()) => Delivery::Queued,
            Err(e) => {
                self.on_transport_error(e);
                Delivery::Failed
            }
        }
    }

    fn liveness(&self, state: LivenessState) -> Outbound {
        Outbound {
            topic: self.options.testament.topic.clone(),
            payload: liveness_payload(state.as_str()),
            qos: self.options.qos,
            retain: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Alive,
    Dead,
}

impl LivenessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LivenessState::Alive => "alive",
            LivenessState::Dead => "dead",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_open_only_from_disconnected() {
        assert_eq!(transition(Disconnected, Input::Open), (Connecting, Action::Dial));
        assert_eq!(transition(Connecting, Input::Open), (Connecting, Action::Nothing));
        assert_eq!(transition(Connected, Input::Open), (Connected, Action::Nothing));
        assert_eq!(
            transition(ReconnectPending, Input::Open),
            (ReconnectPending, Action::Nothing)
        );
    }

    #[test]
    fn test_acceptance_announces() {
        assert_eq!(transition(Connecting, Input::Accepted), (Connected, Action::Announce));
        assert_eq!(transition(Connected, Input::Accepted), (Connected, Action::Announce));
        assert_eq!(
            transition(ReconnectPending, Input::Accepted),
            (ReconnectPending, Action::Nothing)
        );
    }

    #[test]
    fn test_fatal_tears_down_once() {
        let fatal = Input::Fault(Disposition::Fatal);
        assert_eq!(transition(Connected, fatal), (ReconnectPending, Action::TearDown));
        assert_eq!(transition(Connecting, fatal), (ReconnectPending, Action::TearDown));
        assert_eq!(transition(ReconnectPending, fatal), (ReconnectPending, Action::Nothing));
        assert_eq!(transition(Disconnected, fatal), (Disconnected, Action::Nothing));
    }

    #[test]
    fn test_recoverable_changes_nothing() {
        let recoverable = Input::Fault(Disposition::Recoverable);
        for state in [Disconnected, Connecting, Connected, ReconnectPending] {
            assert_eq!(transition(state, recoverable), (state, Action::Nothing));
        }
    }

    #[test]
    fn test_timer_only_redials_when_pending() {
        assert_eq!(
            transition(ReconnectPending, Input::TimerElapsed),
            (Connecting, Action::Dial)
        );
        assert_eq!(transition(Connected, Input::TimerElapsed), (Connected, Action::Nothing));
    }

    #[test]
    fn test_liveness_payload() {
        assert_eq!(liveness_payload("alive"), br#"{"state":"alive"}"#.to_vec());
        assert_eq!(
            liveness_payload(LivenessState::Dead.as_str()),
            br#"{"state":"dead"}"#.to_vec()
        );
    }
}
