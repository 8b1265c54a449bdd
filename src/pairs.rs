use chrono::{DateTime, Local};
use k8s_openapi::api::core::v1::EnvVar;
use log::warn;
use std::collections::BTreeMap;

/// Name of the variable that changes on every deploy, forcing a new revision.
pub const TIMESTAMP_ENV: &str = "timestamp";

/// Split `key:value` or `key=value` on the first separator.
fn split(token: &str) -> Option<(&str, &str)> {
    token
        .find([':', '='])
        .map(|index| (&token[..index], &token[index + 1..]))
}

/// Service labels from the command line, always including `created-by`.
/// Malformed tokens are logged and skipped.
pub fn labels(tokens: &[String], created_by: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([("created-by".to_string(), created_by.to_string())]);
    for token in tokens {
        match split(token) {
            Some((key, value)) => {
                labels.insert(key.to_string(), value.to_string());
            }
            None => warn!("Can't parse label argument {token}"),
        }
    }
    labels
}

/// Container environment from the command line, in the given order, followed
/// by the deploy timestamp. Malformed tokens are logged and skipped.
pub fn env(tokens: &[String], now: DateTime<Local>) -> Vec<EnvVar> {
    tokens
        .iter()
        .filter_map(|token| {
            let pair = split(token);
            if pair.is_none() {
                warn!("Can't parse environment argument {token}");
            }
            pair
        })
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        })
        .chain(std::iter::once(EnvVar {
            name: TIMESTAMP_ENV.to_string(),
            value: Some(now.format("%Y-%m-%d %H:%M:%S").to_string()),
            ..Default::default()
        }))
        .collect()
}
