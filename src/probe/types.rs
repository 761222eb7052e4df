//! Introspection endpoint response types
//!
//! Decoding is forward compatible: unknown fields are ignored and every
//! field except `status` has a default. Collections also accept an explicit
//! `null`, which is how the consumer serializes an empty list or map.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

use crate::common::DecodeError;

/// Treat `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Health value reported for a target that is being scraped successfully
pub const HEALTH_UP: &str = "up";

/// Decoded `/api/v1/targets` response at one point in time
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProbeResult {
    pub status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: TargetsData,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetsData {
    #[serde(default, deserialize_with = "null_as_default")]
    pub active_targets: Vec<ActiveTarget>,
    /// Element shape is not relied upon
    #[serde(default, deserialize_with = "null_as_default")]
    pub dropped_targets: Vec<serde_json::Value>,
}

/// One discovered service instance as seen by the consumer
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTarget {
    /// Raw discovery labels (`__address__`, `__meta_consul_service`, ...)
    #[serde(default, deserialize_with = "null_as_default")]
    pub discovered_labels: BTreeMap<String, String>,
    /// Labels after relabelling
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub scrape_url: String,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub last_scrape: Option<DateTime<Utc>>,
    #[serde(default)]
    pub health: String,
}

impl ActiveTarget {
    pub fn is_healthy(&self) -> bool {
        self.health == HEALTH_UP
    }

    pub fn discovered_label(&self, name: &str) -> Option<&str> {
        self.discovered_labels.get(name).map(String::as_str)
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

impl ProbeResult {
    pub fn active_targets(&self) -> &[ActiveTarget] {
        &self.data.active_targets
    }

    pub fn active_count(&self) -> usize {
        self.data.active_targets.len()
    }

    pub fn dropped_count(&self) -> usize {
        self.data.dropped_targets.len()
    }

    pub fn healthy_count(&self) -> usize {
        self.data.active_targets.iter().filter(|t| t.is_healthy()).count()
    }

    /// Active targets whose discovered label `name` equals `value`
    pub fn with_discovered_label<'a>(
        &'a self,
        name: &'a str,
        value: &'a str,
    ) -> impl Iterator<Item = &'a ActiveTarget> + 'a {
        self.data
            .active_targets
            .iter()
            .filter(move |t| t.discovered_label(name) == Some(value))
    }
}

/// Decode a targets response body
pub fn decode_targets(body: &[u8]) -> Result<ProbeResult, DecodeError> {
    Ok(serde_json::from_slice(body)?)
}
