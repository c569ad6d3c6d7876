#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use doorkeep_contracts::identity::DeviceIdentity;
use doorkeep_contracts::UnixTimeNs;
use doorkeep_node::cloud::{cloud_from_config, CloudApi};
use doorkeep_node::config::NodeConfig;
use doorkeep_node::{
    CardIntakeRequest, CloudError, IdentityRegistry, IngestError, IngestionService,
    SyncStatusHandle, SyncWorker, SyncWorkerCounters,
};
use doorkeep_storage::{EdgeStoreRepo, LocalStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardIntakeResponse {
    pub status: String,
    pub outcome: String,
    pub decision: Option<String>,
    pub reason: Option<String>,
    pub log_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityHealth {
    pub device_id: String,
    pub room: String,
    pub building: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxHealth {
    pub total: u64,
    pub unsynced: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub identity: Option<IdentityHealth>,
    pub outbox: OutboxHealth,
    pub sync: SyncWorkerCounters,
}

/// Shared handles behind the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub ingestion: Arc<IngestionService>,
    pub sync_status: SyncStatusHandle,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/rfid", post(intake_card))
        .with_state(state)
}

pub fn ingest_error_status(err: &IngestError) -> StatusCode {
    match err {
        IngestError::Validation(_) => StatusCode::BAD_REQUEST,
        IngestError::IdentityUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        IngestError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rejected(reason: String) -> CardIntakeResponse {
    CardIntakeResponse {
        status: "error".to_string(),
        outcome: "REJECTED".to_string(),
        decision: None,
        reason: Some(reason),
        log_id: None,
    }
}

async fn intake_card(
    State(state): State<AppState>,
    Json(request): Json<CardIntakeRequest>,
) -> (StatusCode, Json<CardIntakeResponse>) {
    let observed_at = UnixTimeNs::now();
    let ingestion = state.ingestion.clone();
    // The outbox append fsyncs; keep it off the async workers.
    let result =
        tokio::task::spawn_blocking(move || ingestion.intake(&request, observed_at)).await;
    match result {
        Ok(Ok(outcome)) => (
            StatusCode::OK,
            Json(CardIntakeResponse {
                status: "ok".to_string(),
                outcome: "RECORDED".to_string(),
                decision: Some(outcome.decision.as_str().to_string()),
                reason: Some(outcome.reason),
                log_id: Some(outcome.log_id.0),
            }),
        ),
        Ok(Err(err)) => (ingest_error_status(&err), Json(rejected(err.to_string()))),
        Err(join_err) => {
            error!(error = %join_err, "intake task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(rejected("intake task failed".to_string())),
            )
        }
    }
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<NodeHealthResponse>) {
    let sync = state.sync_status.snapshot();
    let identity = state.ingestion.registry().get().map(|identity| IdentityHealth {
        device_id: identity.device_id.as_str().to_string(),
        room: identity.room_id.as_str().to_string(),
        building: identity.building.map(String::from),
    });
    let outbox = match state.ingestion.store().outbox_counters() {
        Ok(counters) => OutboxHealth {
            total: counters.total,
            unsynced: counters.unsynced,
        },
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(NodeHealthResponse {
                    status: "error".to_string(),
                    outcome: "UNHEALTHY".to_string(),
                    reason: Some(err.to_string()),
                    identity,
                    outbox: OutboxHealth::default(),
                    sync,
                }),
            )
        }
    };
    let reason = if identity.is_none() {
        Some("device identity not initialized".to_string())
    } else {
        sync.push_degraded_reason
            .clone()
            .or_else(|| sync.pull_degraded_reason.clone())
    };
    let outcome = if reason.is_some() { "DEGRADED" } else { "HEALTHY" };
    (
        StatusCode::OK,
        Json(NodeHealthResponse {
            status: "ok".to_string(),
            outcome: outcome.to_string(),
            reason,
            identity,
            outbox,
            sync,
        }),
    )
}

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("creating store directory {path}: {source}")]
    StoreDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// A booted node: HTTP state plus the sync worker, not yet started.
pub struct EdgeNode {
    pub state: AppState,
    pub worker: SyncWorker,
}

impl EdgeNode {
    pub fn open(config: &NodeConfig) -> Result<Self, BootError> {
        if let Some(dir) = config.store_path.parent() {
            ensure_dir(dir)?;
        }
        let store = Arc::new(LocalStore::open(&config.store_path)?);
        let cloud = cloud_from_config(&config.cloud)?;
        if config.cloud.endpoint.is_none() {
            warn!("no cloud endpoint configured, running offline");
        }
        Self::assemble(store, cloud, config.bootstrap_identity.clone(), config)
    }

    /// Wires a node over an existing store and cloud. The identity persisted
    /// in the store wins over `bootstrap`; with neither, a configured device
    /// id waits for its first cloud assignment.
    pub fn assemble(
        store: Arc<LocalStore>,
        cloud: Arc<dyn CloudApi>,
        bootstrap: Option<DeviceIdentity>,
        config: &NodeConfig,
    ) -> Result<Self, BootError> {
        let identity = resolve_boot_identity(store.as_ref(), bootstrap)?;
        let registry = match (identity, config.device_id.clone()) {
            (Some(identity), _) => {
                info!(
                    device_id = %identity.device_id,
                    room = %identity.room_id,
                    "device identity loaded"
                );
                IdentityRegistry::new(Some(identity))
            }
            (None, Some(device_id)) => {
                info!(%device_id, "waiting for cloud room assignment; scans are refused until then");
                IdentityRegistry::awaiting_assignment(device_id)
            }
            (None, None) => {
                warn!("no device identity yet; scans are refused until one is assigned");
                IdentityRegistry::new(None)
            }
        };
        let registry = Arc::new(registry);
        let store: Arc<dyn EdgeStoreRepo> = store;
        let worker = SyncWorker::new(store.clone(), cloud, registry.clone(), config.sync);
        let state = AppState {
            ingestion: Arc::new(IngestionService::new(store, registry)),
            sync_status: worker.status(),
        };
        Ok(Self { state, worker })
    }
}

fn resolve_boot_identity(
    store: &LocalStore,
    bootstrap: Option<DeviceIdentity>,
) -> Result<Option<DeviceIdentity>, StorageError> {
    if let Some(persisted) = store.get_identity()? {
        if bootstrap.as_ref().is_some_and(|b| *b != persisted) {
            info!("persisted device identity overrides configured bootstrap");
        }
        return Ok(Some(persisted));
    }
    if let Some(bootstrap) = bootstrap.as_ref() {
        store.set_identity(bootstrap.clone())?;
    }
    Ok(bootstrap)
}

fn ensure_dir(dir: &Path) -> Result<(), BootError> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|source| BootError::StoreDir {
        path: dir.display().to_string(),
        source,
    })
}

/// Loads `.env` when present. Runs before tracing is up, so problems go to
/// stderr.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(err) if err.not_found() => {}
        Err(err) => eprintln!("warning: failed to load .env: {err}"),
    }
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
