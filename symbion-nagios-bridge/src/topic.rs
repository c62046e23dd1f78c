//! MQTT topic derivation
//!
//! `{base}/checks[/{prefix}]/{hostname}[/{service_description}]` for check
//! results and `{base}/hosts/{hostname}` for the liveness announcement. MQTT
//! wildcards (`#`, `+`) never survive into a published topic.

use crate::event::CheckEvent;

pub fn check_topic(base: &str, event: &CheckEvent) -> String {
    let mut segments = vec![trim_base(base), "checks"];
    if let Some(prefix) = event.prefix.as_deref().filter(|p| !p.is_empty()) {
        segments.push(prefix);
    }
    segments.push(&event.hostname);
    if event.is_service() {
        segments.push(event.service_description.as_deref().unwrap_or_default());
    }
    strip_wildcards(&segments.join("/"))
}

pub fn liveness_topic(base: &str, hostname: &str) -> String {
    strip_wildcards(&format!("{}/hosts/{}", trim_base(base), hostname))
}

fn trim_base(base: &str) -> &str {
    base.trim_end_matches('/')
}

fn strip_wildcards(topic: &str) -> String {
    topic.chars().filter(|c| !matches!(c, '#' | '+')).collect()
}
