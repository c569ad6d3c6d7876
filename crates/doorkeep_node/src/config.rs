#![forbid(unsafe_code)]

//! Environment-driven settings for the node and the reader process.
//!
//! Parsing goes through a getter closure so tests pass a map instead of the
//! process environment. Numeric values outside their accepted range fall
//! back to the default.

use std::path::PathBuf;

use doorkeep_contracts::access::DeviceId;
use doorkeep_contracts::identity::DeviceIdentity;
use doorkeep_contracts::ContractViolation;

use crate::backoff::{BackoffPolicy, BACKOFF_JITTER_RATIO_DEFAULT};
use crate::cloud::{
    CloudClientConfig, CloudEndpoint, CloudSchema, CLOUD_CONNECT_TIMEOUT_MS_DEFAULT,
    CLOUD_REQUEST_TIMEOUT_MS_DEFAULT,
};
use crate::reader::{
    ReaderConfig, READER_COOLDOWN_MS_DEFAULT, READER_POLL_MS_DEFAULT, READER_RETRY_MS_DEFAULT,
};
use crate::sync_worker::{SyncWorkerConfig, SYNC_BATCH_SIZE_DEFAULT, SYNC_INTERVAL_MS_DEFAULT};

pub const HTTP_BIND_DEFAULT: &str = "0.0.0.0:5000";
pub const READER_INTAKE_URL_DEFAULT: &str = "http://127.0.0.1:5000/rfid";
pub const READER_DEVICE_DEFAULT: &str = "-";

pub const ENV_CLOUD_URL: &str = "DOORKEEP_CLOUD_URL";
pub const ENV_CLOUD_KEY: &str = "DOORKEEP_CLOUD_KEY";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is required when {because} is set")]
    MissingVar {
        var: &'static str,
        because: &'static str,
    },
    #[error("invalid bootstrap identity: {0}")]
    BootstrapIdentity(#[from] ContractViolation),
    #[error("no store path: set DOORKEEP_STORE_PATH or HOME")]
    NoStorePath,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub http_bind: String,
    pub store_path: PathBuf,
    /// Identity used only when the store has none persisted.
    pub bootstrap_identity: Option<DeviceIdentity>,
    /// Set without a room: the first cloud sync supplies the assignment.
    pub device_id: Option<DeviceId>,
    pub cloud: CloudClientConfig,
    pub sync: SyncWorkerConfig,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_var_map(|name| std::env::var(name).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let http_bind = non_empty(env_getter("DOORKEEP_HTTP_BIND"))
            .unwrap_or_else(|| HTTP_BIND_DEFAULT.to_string());
        let store_path = match non_empty(env_getter("DOORKEEP_STORE_PATH")) {
            Some(path) => PathBuf::from(path),
            None => non_empty(env_getter("HOME"))
                .map(|home| {
                    PathBuf::from(home)
                        .join(".doorkeep")
                        .join("edge")
                        .join("store.jsonl")
                })
                .ok_or(ConfigError::NoStorePath)?,
        };

        let device_id = non_empty(env_getter("DOORKEEP_DEVICE_ID"));
        let room_id = non_empty(env_getter("DOORKEEP_ROOM_ID"));
        let building = non_empty(env_getter("DOORKEEP_BUILDING"));
        let (bootstrap_identity, device_id) = match (device_id, room_id) {
            (Some(device_id), Some(room_id)) => {
                let identity = DeviceIdentity::from_raw(&device_id, &room_id, building.as_deref())?;
                let device_id = identity.device_id.clone();
                (Some(identity), Some(device_id))
            }
            (Some(device_id), None) => (None, Some(DeviceId::new(device_id)?)),
            (None, Some(_)) => {
                return Err(ConfigError::MissingVar {
                    var: "DOORKEEP_DEVICE_ID",
                    because: "DOORKEEP_ROOM_ID",
                })
            }
            (None, None) => (None, None),
        };

        let cloud = cloud_config_from_env_var_map(&mut env_getter)?;

        let backoff_base_ms = ranged(
            &mut env_getter,
            "DOORKEEP_SYNC_BACKOFF_BASE_MS",
            100..=60_000,
            1_000,
        );
        let backoff_max_ms = ranged(
            &mut env_getter,
            "DOORKEEP_SYNC_BACKOFF_MAX_MS",
            1_000..=600_000,
            300_000,
        );
        let sync = SyncWorkerConfig {
            interval_ms: ranged(
                &mut env_getter,
                "DOORKEEP_SYNC_INTERVAL_MS",
                100..=60_000,
                SYNC_INTERVAL_MS_DEFAULT,
            ),
            batch_size: ranged(
                &mut env_getter,
                "DOORKEEP_SYNC_BATCH_SIZE",
                1..=500,
                SYNC_BATCH_SIZE_DEFAULT as u64,
            ) as usize,
            backoff: BackoffPolicy::new(
                backoff_base_ms,
                backoff_max_ms,
                BACKOFF_JITTER_RATIO_DEFAULT,
            ),
        };

        Ok(Self {
            http_bind,
            store_path,
            bootstrap_identity,
            device_id,
            cloud,
            sync,
        })
    }
}

/// Cloud endpoint, credentials and table/field overrides. A URL without a
/// key is an error; neither means offline.
pub fn cloud_config_from_env_var_map<F>(mut env_getter: F) -> Result<CloudClientConfig, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let url = non_empty(env_getter(ENV_CLOUD_URL));
    let key = non_empty(env_getter(ENV_CLOUD_KEY));
    let endpoint = match (url, key) {
        (Some(base_url), Some(api_key)) => Some(CloudEndpoint { base_url, api_key }),
        (Some(_), None) => {
            return Err(ConfigError::MissingVar {
                var: ENV_CLOUD_KEY,
                because: ENV_CLOUD_URL,
            })
        }
        (None, Some(_)) => {
            return Err(ConfigError::MissingVar {
                var: ENV_CLOUD_URL,
                because: ENV_CLOUD_KEY,
            })
        }
        (None, None) => None,
    };

    let defaults = CloudSchema::default();
    let mut field = |name: &str, default: String| non_empty(env_getter(name)).unwrap_or(default);
    let schema = CloudSchema {
        access_logs_table: field("DOORKEEP_ACCESS_LOGS_TABLE", defaults.access_logs_table),
        access_permissions_table: field(
            "DOORKEEP_ACCESS_PERMISSIONS_TABLE",
            defaults.access_permissions_table,
        ),
        devices_table: field("DOORKEEP_DEVICES_TABLE", defaults.devices_table),
        student_field: field(
            "DOORKEEP_ACCESS_LOGS_STUDENT_FIELD",
            defaults.student_field,
        ),
        room_field: field("DOORKEEP_ACCESS_LOGS_ROOM_FIELD", defaults.room_field),
        building_field: field(
            "DOORKEEP_ACCESS_LOGS_BUILDING_FIELD",
            defaults.building_field,
        ),
        reason_field: optional_field(
            &mut env_getter,
            "DOORKEEP_ACCESS_LOGS_REASON_FIELD",
            defaults.reason_field,
        ),
        device_field: optional_field(
            &mut env_getter,
            "DOORKEEP_ACCESS_LOGS_DEVICE_FIELD",
            defaults.device_field,
        ),
        dedupe_field: optional_field(
            &mut env_getter,
            "DOORKEEP_ACCESS_LOGS_DEDUPE_FIELD",
            defaults.dedupe_field,
        ),
    };

    Ok(CloudClientConfig {
        endpoint,
        schema,
        connect_timeout_ms: ranged(
            &mut env_getter,
            "DOORKEEP_CLOUD_CONNECT_TIMEOUT_MS",
            100..=60_000,
            CLOUD_CONNECT_TIMEOUT_MS_DEFAULT,
        ),
        request_timeout_ms: ranged(
            &mut env_getter,
            "DOORKEEP_CLOUD_REQUEST_TIMEOUT_MS",
            100..=120_000,
            CLOUD_REQUEST_TIMEOUT_MS_DEFAULT,
        ),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderSettings {
    pub intake_url: String,
    /// Line-oriented transceiver source; `-` is stdin.
    pub device: String,
    pub reader: ReaderConfig,
}

impl ReaderSettings {
    pub fn from_env() -> Self {
        Self::from_env_var_map(|name| std::env::var(name).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        Self {
            intake_url: non_empty(env_getter("DOORKEEP_READER_INTAKE_URL"))
                .unwrap_or_else(|| READER_INTAKE_URL_DEFAULT.to_string()),
            device: non_empty(env_getter("DOORKEEP_READER_DEVICE"))
                .unwrap_or_else(|| READER_DEVICE_DEFAULT.to_string()),
            reader: ReaderConfig {
                poll_ms: ranged(
                    &mut env_getter,
                    "DOORKEEP_READER_POLL_MS",
                    10..=200,
                    READER_POLL_MS_DEFAULT,
                ),
                cooldown_ms: ranged(
                    &mut env_getter,
                    "DOORKEEP_READER_COOLDOWN_MS",
                    0..=10_000,
                    READER_COOLDOWN_MS_DEFAULT,
                ),
                retry_ms: ranged(
                    &mut env_getter,
                    "DOORKEEP_READER_RETRY_MS",
                    50..=2_000,
                    READER_RETRY_MS_DEFAULT,
                ),
            },
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Set-but-empty disables the column; unset keeps the default.
fn optional_field<F>(env_getter: &mut F, name: &str, default: Option<String>) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    match env_getter(name) {
        Some(v) if v.trim().is_empty() => None,
        Some(v) => Some(v.trim().to_string()),
        None => default,
    }
}

fn ranged<F>(
    env_getter: &mut F,
    name: &str,
    range: std::ops::RangeInclusive<u64>,
    default: u64,
) -> u64
where
    F: FnMut(&str) -> Option<String>,
{
    env_getter(name)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| range.contains(v))
        .unwrap_or(default)
}
