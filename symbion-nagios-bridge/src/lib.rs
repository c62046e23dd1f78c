/*!
# Symbion Nagios Bridge

Publie les résultats de checks Nagios déposés dans un répertoire spool vers
MQTT:
- décodage des `perf_data` en métriques typées
- topics `{base}/checks[/{prefix}]/{host}[/{service}]`
- annonce retenue "alive"/"dead" sur `{base}/hosts/{host}` (last will)
- reconnexion à délai fixe, sans file d'attente sortante
*/

pub mod config;
pub mod connection;
pub mod event;
pub mod logging;
pub mod perfdata;
pub mod signal;
pub mod spool;
pub mod supervisor;
pub mod topic;
pub mod transport;

pub use config::BridgeConfig;
pub use connection::{ConnectionManager, ConnectionState, Delivery};
pub use event::CheckEvent;
pub use supervisor::Supervisor;
