use std::time::Duration;

use bstr::ByteSlice;
use serde_json::Value;

use crate::common::process::run_script;
use crate::server::burst_buffer::config::BbConfig;

const POOL_REFRESH_TIMEOUT: Duration = Duration::from_secs(3600);

/// One storage pool as reported by the external status script, with the
/// GiB-denominated derivatives used by the allocators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolEntry {
    pub id: String,
    pub units: String,
    pub granularity: u64,
    pub quantity: u64,
    pub free: u64,
    pub gb_granularity: u64,
    pub gb_quantity: u64,
    pub gb_free: u64,
}

/// Refresh pool data by running the configured `GetSysState` program.
pub async fn fetch_pools(config: &BbConfig) -> Option<Vec<PoolEntry>> {
    let script = match config.get_sys_state.as_ref() {
        Some(script) => script,
        None => {
            log::error!("no GetSysState program configured");
            return None;
        }
    };
    let args = ["jsonpools".to_string(), "pools".to_string()];
    let output = match run_script("jsonpools", script, &args, Some(POOL_REFRESH_TIMEOUT)).await {
        Some(output) if !output.is_empty() => output,
        _ => {
            log::error!("{} did not return any pool", script.display());
            return None;
        }
    };
    parse_pool_document(&output)
}

/// Parse a pool document of the shape `{"<key>": [ {...}, ... ]}`.
///
/// The outer object is iterated once and only the *last* key's array is
/// materialized; callers are expected to send a single-key document such
/// as `{"pools": [...]}`.
pub fn parse_pool_document(data: &[u8]) -> Option<Vec<PoolEntry>> {
    let document: Value = match serde_json::from_slice(data) {
        Ok(document) => document,
        Err(error) => {
            log::error!("json parser failed on {}: {}", data.as_bstr(), error);
            return None;
        }
    };
    let object = match document.as_object() {
        Some(object) => object,
        None => {
            log::error!("pool document is not an object");
            return None;
        }
    };

    let mut entries = None;
    for (_key, value) in object {
        entries = value
            .as_array()
            .map(|array| array.iter().map(parse_pool_object).collect());
    }
    entries
}

fn parse_pool_object(value: &Value) -> PoolEntry {
    let mut entry = PoolEntry::default();
    if let Some(object) = value.as_object() {
        for (key, value) in object {
            match (key.as_str(), value) {
                ("granularity", Value::Number(number)) => {
                    entry.granularity = number.as_u64().unwrap_or(0);
                }
                ("quantity", Value::Number(number)) => {
                    entry.quantity = number.as_u64().unwrap_or(0);
                }
                ("free", Value::Number(number)) => {
                    entry.free = number.as_u64().unwrap_or(0);
                }
                ("id", Value::String(text)) => entry.id = text.clone(),
                ("units", Value::String(text)) => entry.units = text.clone(),
                // Unknown keys and non-scalar values are skipped
                _ => {}
            }
        }
    }
    if entry.units == "bytes" {
        entry.gb_granularity = entry.granularity / (1024 * 1024 * 1024);
        entry.gb_quantity = entry.quantity * entry.gb_granularity;
        entry.gb_free = entry.free * entry.gb_granularity;
    } else {
        entry.gb_granularity = entry.granularity;
        entry.gb_quantity = entry.quantity;
        entry.gb_free = entry.free;
    }
    entry
}
