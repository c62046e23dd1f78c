/*!
Broker MQTT simulé pour tester le pont sans broker

Implémente `Connector`/`Link`: chaque ouverture de session est enregistrée,
chaque publication aussi. Le test pilote la connexion (acceptation, coupure,
erreurs de publication, broker figé) depuis l'extérieur.

Comme rumqttc, chaque lien a une file de requêtes bornée par
`request_capacity`, vidée par une task séparée: une publication attend une
place libre au lieu d'échouer.
*/

use anyhow::Result;
use rumqttc::QoS;
use std::sync::{Arc, Mutex, MutexGuard};
use symbion_nagios_bridge::transport::{
    Connector, Link, LinkEvent, Outbound, SessionOptions, TransportError,
};
use tokio::sync::{mpsc, watch};

type LinkSender = mpsc::UnboundedSender<Result<LinkEvent, TransportError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Default)]
struct BrokerState {
    published: Vec<MockMessage>,
    sessions: Vec<SessionOptions>,
    current: Option<LinkSender>,
    auto_accept: bool,
    publish_failure: Option<TransportError>,
    closed: usize,
}

/// Broker simulé partagé entre le test et le `MockConnector`
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    stalled: Arc<watch::Sender<bool>>,
}

impl MockBroker {
    /// Broker qui accepte chaque session dès son ouverture
    pub fn new() -> Self {
        Self::with_auto_accept(true)
    }

    /// Broker qui attend `accept()` avant de confirmer une session
    pub fn manual() -> Self {
        Self::with_auto_accept(false)
    }

    fn with_auto_accept(auto_accept: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                auto_accept,
                ..Default::default()
            })),
            stalled: Arc::new(watch::channel(false).0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            broker: self.clone(),
        }
    }

    pub fn set_auto_accept(&self, enabled: bool) {
        self.lock().auto_accept = enabled;
    }

    /// Confirme la session courante (CONNACK)
    pub fn accept(&self) {
        self.send(Ok(LinkEvent::Accepted));
    }

    /// Coupe la session courante avec une erreur fatale
    pub fn drop_connection(&self, reason: &str) {
        self.send(Err(TransportError::Fatal(reason.to_string())));
    }

    /// Fait échouer les publications suivantes (`None` pour rétablir)
    pub fn fail_publishes(&self, failure: Option<TransportError>) {
        self.lock().publish_failure = failure;
    }

    /// Fige (ou relance) la vidange des files de requêtes
    pub fn stall(&self, stalled: bool) {
        self.stalled.send_replace(stalled);
    }

    fn send(&self, event: Result<LinkEvent, TransportError>) {
        if let Some(sender) = self.lock().current.as_ref() {
            let _ = sender.send(event);
        }
    }

    /// Sessions ouvertes, dans l'ordre
    pub fn sessions(&self) -> Vec<SessionOptions> {
        self.lock().sessions.clone()
    }

    pub fn opened(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Déconnexions propres reçues
    pub fn closed(&self) -> usize {
        self.lock().closed
    }

    /// Récupère tous les messages publiés (pour assertions de tests)
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.lock().published.clone()
    }

    /// Trouve les messages publiés sur un topic donné
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.lock()
            .published
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last_msg) => Ok(Some(serde_json::from_slice(&last_msg.payload)?)),
            None => Ok(None),
        }
    }

    /// Reset des messages enregistrés
    pub fn clear(&self) {
        self.lock().published.clear();
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MockConnector {
    broker: MockBroker,
}

impl Connector for MockConnector {
    type Link = MockLink;

    fn open(&mut self, options: &SessionOptions) -> MockLink {
        let (sender, events) = mpsc::unbounded_channel();
        let (queue, requests) = mpsc::channel(options.request_capacity.max(1));
        tokio::spawn(drain_requests(requests, self.broker.stalled.subscribe()));

        let mut state = self.broker.lock();
        if state.auto_accept {
            let _ = sender.send(Ok(LinkEvent::Accepted));
        }
        state.sessions.push(options.clone());
        // l'ancien lien ne recevra plus rien
        state.current = Some(sender);
        tracing::debug!("[MOCK] session {} opened", options.client_id);

        MockLink {
            broker: self.broker.clone(),
            events,
            queue,
        }
    }
}

/// Le "réseau": libère une place de la file à chaque tour, sauf broker figé
async fn drain_requests(mut requests: mpsc::Receiver<()>, mut stalled: watch::Receiver<bool>) {
    loop {
        if stalled.wait_for(|stalled| !*stalled).await.is_err() {
            return;
        }
        if requests.recv().await.is_none() {
            return;
        }
    }
}

pub struct MockLink {
    broker: MockBroker,
    events: mpsc::UnboundedReceiver<Result<LinkEvent, TransportError>>,
    queue: mpsc::Sender<()>,
}

impl Link for MockLink {
    async fn next_event(&mut self) -> Result<LinkEvent, TransportError> {
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    async fn publish(&mut self, message: Outbound) -> Result<(), TransportError> {
        let failure = self.broker.lock().publish_failure.clone();
        if let Some(failure) = failure {
            return Err(failure);
        }
        self.queue
            .send(())
            .await
            .map_err(|_| TransportError::Recoverable("request queue closed".into()))?;

        let mut state = self.broker.lock();
        tracing::debug!("[MOCK] Published to {}: {} bytes", message.topic, message.payload.len());
        state.published.push(MockMessage {
            topic: message.topic,
            payload: message.payload,
            qos: message.qos,
            retain: message.retain,
        });
        Ok(())
    }

    async fn close(&mut self) {
        self.broker.lock().closed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use symbion_nagios_bridge::transport::Testament;

    fn options() -> SessionOptions {
        SessionOptions {
            client_id: "test_client".into(),
            host: "localhost".into(),
            port: 1883,
            credentials: None,
            keep_alive: Duration::from_secs(30),
            qos: QoS::AtMostOnce,
            request_capacity: 10,
            testament: Testament {
                topic: "nagios/hosts/test".into(),
                payload: br#"{"state":"dead"}"#.to_vec(),
            },
        }
    }

    fn outbound(topic: &str, payload: &[u8]) -> Outbound {
        Outbound {
            topic: topic.into(),
            payload: payload.to_vec(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    #[tokio::test]
    async fn test_auto_accept_and_publish() {
        let broker = MockBroker::new();
        let mut link = broker.connector().open(&options());
        assert_eq!(link.next_event().await, Ok(LinkEvent::Accepted));

        link.publish(outbound("test/topic", br#"{"test_field":"test_value"}"#))
            .await
            .unwrap();
        assert_eq!(broker.find_messages_by_topic("test/topic").len(), 1);

        let parsed: Option<serde_json::Value> = broker.get_last_json_message("test/topic").unwrap();
        assert_eq!(parsed.unwrap()["test_field"], "test_value");
        assert_eq!(broker.sessions(), vec![options()]);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let broker = MockBroker::manual();
        let mut link = broker.connector().open(&options());

        broker.drop_connection("broker restart");
        assert_eq!(
            link.next_event().await,
            Err(TransportError::Fatal("broker restart".into()))
        );

        broker.fail_publishes(Some(TransportError::Recoverable("queue full".into())));
        assert!(link.publish(outbound("a", b"1")).await.is_err());
        broker.fail_publishes(None);
        assert!(link.publish(outbound("a", b"1")).await.is_ok());

        link.close().await;
        assert_eq!(broker.closed(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_waits_for_the_broker() {
        let broker = MockBroker::new();
        broker.stall(true);
        let mut link = broker.connector().open(&options());

        let mut queued = 0;
        while tokio::time::timeout(Duration::from_millis(50), link.publish(outbound("a", b"1")))
            .await
            .is_ok()
        {
            queued += 1;
            assert!(queued <= 11, "queue never filled");
        }
        assert!(queued >= 10, "only {queued} queued");

        broker.stall(false);
        for _ in 0..20 {
            link.publish(outbound("b", b"2")).await.unwrap();
        }
        assert_eq!(broker.find_messages_by_topic("b").len(), 20);
    }
}
