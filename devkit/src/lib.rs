/*!
# Symbion DevKit - Stubs et Utilitaires pour le pont Nagios

Bibliothèque facilitant les tests du pont sans broker ni Nagios:
- Broker MQTT simulé, piloté par le test
- Répertoire spool temporaire avec dépôts atomiques
- Helpers d'attente sur les publications
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockBroker, MockConnector, MockLink, MockMessage};
pub use test_utils::SpoolHarness;
