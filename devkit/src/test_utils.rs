/*!
Harness de test pour le spool

Un répertoire temporaire avec trois sous-dossiers: `spool` (surveillé),
`staging` (écriture avant renommage) et `quarantine`. Les dépôts passent par
`staging` puis un `rename`, comme le fait le côté Nagios.
*/

use crate::mqtt_stub::{MockBroker, MockMessage};
use anyhow::Result;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use symbion_nagios_bridge::connection::{liveness_payload, LivenessState};
use symbion_nagios_bridge::topic::liveness_topic;
use symbion_nagios_bridge::transport::{SessionOptions, Testament};
use tempfile::TempDir;

pub struct SpoolHarness {
    _root: TempDir,
    spool: PathBuf,
    staging: PathBuf,
    quarantine: PathBuf,
}

impl SpoolHarness {
    pub fn new() -> Result<Self> {
        let root = tempfile::tempdir()?;
        let spool = root.path().join("spool");
        let staging = root.path().join("staging");
        let quarantine = root.path().join("quarantine");
        fs::create_dir(&spool)?;
        fs::create_dir(&staging)?;

        Ok(Self {
            _root: root,
            spool,
            staging,
            quarantine,
        })
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool
    }

    /// Not created until something is quarantined
    pub fn quarantine_dir(&self) -> &Path {
        &self.quarantine
    }

    /// Dépose un événement JSON (écriture dans staging puis rename)
    pub fn drop_event(&self, name: &str, event: &Value) -> Result<PathBuf> {
        self.drop_raw(name, &serde_json::to_vec(event)?)
    }

    pub fn drop_raw(&self, name: &str, payload: &[u8]) -> Result<PathBuf> {
        let staged = self.staging.join(name);
        fs::write(&staged, payload)?;
        let target = self.spool.join(name);
        fs::rename(&staged, &target)?;
        Ok(target)
    }

    /// Écrit directement dans le spool (close-after-write)
    pub fn write_raw(&self, name: &str, payload: &[u8]) -> Result<PathBuf> {
        let target = self.spool.join(name);
        fs::write(&target, payload)?;
        Ok(target)
    }

    /// Noms des fichiers encore présents dans le spool
    pub fn files(&self) -> Result<Vec<String>> {
        list(&self.spool)
    }

    pub fn quarantined(&self) -> Result<Vec<String>> {
        if !self.quarantine.exists() {
            return Ok(Vec::new());
        }
        list(&self.quarantine)
    }
}

fn list(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Session de test: QoS 0, last will "dead" sur `{base}/hosts/{hostname}`
pub fn test_session(base_topic: &str, hostname: &str) -> SessionOptions {
    SessionOptions {
        client_id: format!("symbion-nagios-bridge-{}", hostname),
        host: "localhost".into(),
        port: 1883,
        credentials: None,
        keep_alive: Duration::from_secs(30),
        qos: rumqttc::QoS::AtMostOnce,
        request_capacity: 10,
        testament: Testament {
            topic: liveness_topic(base_topic, hostname),
            payload: liveness_payload(LivenessState::Dead.as_str()),
        },
    }
}

/// Init logging pour tests (`RUST_LOG` respecté)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Attend qu'au moins `count` messages soient publiés sur `topic`
pub async fn wait_for_messages(
    broker: &MockBroker,
    topic: &str,
    count: usize,
    timeout_ms: u64,
) -> Option<Vec<MockMessage>> {
    let waiting = async {
        loop {
            let messages = broker.find_messages_by_topic(topic);
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    match tokio::time::timeout(Duration::from_millis(timeout_ms), waiting).await {
        Ok(messages) => Some(messages),
        Err(_) => {
            tracing::warn!("Timeout waiting for {} message(s) on {}", count, topic);
            None
        }
    }
}

/// Attend que le spool soit vide
pub async fn wait_for_empty_spool(harness: &SpoolHarness, timeout_ms: u64) -> bool {
    let waiting = async {
        loop {
            if harness.files().map(|f| f.is_empty()).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_millis(timeout_ms), waiting)
        .await
        .is_ok()
}
