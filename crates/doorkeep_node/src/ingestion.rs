#![forbid(unsafe_code)]

//! Turns a submitted card identifier into an access decision and a durable
//! log entry. Only local state is consulted; nothing here touches the
//! network.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use doorkeep_contracts::access::{
    AccessDecision, AccessLogEntryInput, AccessLogId, BuildingId, CardId, CardScan, RoomId,
    REASON_UNKNOWN_CARD,
};
use doorkeep_contracts::{ContractViolation, UnixTimeNs};
use doorkeep_storage::{EdgeStoreRepo, StorageError};

use crate::identity_registry::IdentityRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CardIntakeRequest {
    pub card_uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessOutcome {
    pub log_id: AccessLogId,
    pub card_id: CardId,
    pub room: RoomId,
    pub building: Option<BuildingId>,
    pub decision: AccessDecision,
    pub reason: String,
    pub observed_at: UnixTimeNs,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Malformed input. No log entry was written.
    #[error("invalid card submission: {0}")]
    Validation(#[from] ContractViolation),
    /// The node has no device/room identity yet, so no decision can be made.
    #[error("device identity not initialized")]
    IdentityUnavailable,
    /// The outbox could not be written; the tap is lost.
    #[error("local store unavailable: {0}")]
    Storage(#[from] StorageError),
}

/// Physical effect of a decision. Called after the log entry is durable.
pub trait DoorActuator: Send + Sync {
    fn actuate(&self, outcome: &AccessOutcome);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDoorActuator;

impl DoorActuator for LoggingDoorActuator {
    fn actuate(&self, outcome: &AccessOutcome) {
        if outcome.decision.is_admitted() {
            info!(card_id = %outcome.card_id, room = %outcome.room, "door released");
        } else {
            info!(card_id = %outcome.card_id, room = %outcome.room, "door kept locked");
        }
    }
}

pub struct IngestionService {
    store: Arc<dyn EdgeStoreRepo>,
    registry: Arc<IdentityRegistry>,
    actuator: Arc<dyn DoorActuator>,
}

impl IngestionService {
    pub fn new(store: Arc<dyn EdgeStoreRepo>, registry: Arc<IdentityRegistry>) -> Self {
        Self::with_actuator(store, registry, Arc::new(LoggingDoorActuator))
    }

    pub fn with_actuator(
        store: Arc<dyn EdgeStoreRepo>,
        registry: Arc<IdentityRegistry>,
        actuator: Arc<dyn DoorActuator>,
    ) -> Self {
        Self {
            store,
            registry,
            actuator,
        }
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn EdgeStoreRepo> {
        &self.store
    }

    pub fn intake(
        &self,
        request: &CardIntakeRequest,
        observed_at: UnixTimeNs,
    ) -> Result<AccessOutcome, IngestError> {
        let card_id = CardId::new(request.card_uid.trim()).map_err(|err| {
            warn!(card_uid = %request.card_uid, error = %err, "rejected card submission");
            IngestError::Validation(err)
        })?;
        self.handle_scan(CardScan::v1(card_id, observed_at))
    }

    /// Decides, records and actuates one scan. The returned outcome is only
    /// produced once the log entry is durable.
    pub fn handle_scan(&self, scan: CardScan) -> Result<AccessOutcome, IngestError> {
        let identity = self.registry.get().ok_or_else(|| {
            warn!(card_id = %scan.card_id, "scan dropped: device identity not initialized");
            IngestError::IdentityUnavailable
        })?;

        let permission = self
            .store
            .get_permission_row(&scan.card_id, &identity.room_id, identity.building.as_ref())
            .map_err(|err| {
                error!(error = %err, "permission lookup failed");
                IngestError::Storage(err)
            })?;
        let (decision, reason) = match permission {
            Some(permission) => permission.decide(),
            None => (AccessDecision::Denied, REASON_UNKNOWN_CARD.to_string()),
        };

        let input = AccessLogEntryInput::v1(
            scan.card_id.clone(),
            identity.device_id.clone(),
            identity.room_id.clone(),
            identity.building.clone(),
            decision,
            reason.clone(),
            scan.observed_at,
        )?;
        let log_id = self.store.append_log_row(input).map_err(|err| {
            error!(card_id = %scan.card_id, error = %err, "access log append failed, tap lost");
            IngestError::Storage(err)
        })?;

        let outcome = AccessOutcome {
            log_id,
            card_id: scan.card_id,
            room: identity.room_id,
            building: identity.building,
            decision,
            reason,
            observed_at: scan.observed_at,
        };
        info!(
            log_id = outcome.log_id.0,
            card_id = %outcome.card_id,
            room = %outcome.room,
            decision = outcome.decision.as_str(),
            reason = %outcome.reason,
            "access decision"
        );
        self.actuator.actuate(&outcome);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use doorkeep_contracts::access::{AccessPermission, REASON_PERMISSION_ACTIVE};
    use doorkeep_contracts::identity::DeviceIdentity;
    use doorkeep_storage::LocalStore;

    #[derive(Default)]
    struct RecordingActuator {
        seen: Mutex<Vec<AccessDecision>>,
    }

    impl DoorActuator for RecordingActuator {
        fn actuate(&self, outcome: &AccessOutcome) {
            self.seen.lock().unwrap().push(outcome.decision);
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::from_raw("edge-1", "101", Some("A")).unwrap()
    }

    fn service(store: &Arc<LocalStore>) -> IngestionService {
        IngestionService::new(
            store.clone(),
            Arc::new(IdentityRegistry::new(Some(identity()))),
        )
    }

    fn permission(card: &str, building: Option<&str>, blocked: bool) -> AccessPermission {
        AccessPermission::v1(
            CardId::new(card).unwrap(),
            RoomId::new("101").unwrap(),
            building.map(|b| BuildingId::new(b).unwrap()),
            blocked,
            blocked.then(|| "lost card".to_string()),
            UnixTimeNs(1),
        )
        .unwrap()
    }

    fn tap(uid: &str) -> CardIntakeRequest {
        CardIntakeRequest {
            card_uid: uid.to_string(),
        }
    }

    #[test]
    fn at_ingest_01_active_permission_admits_and_logs_once() {
        let store = Arc::new(LocalStore::new_in_memory());
        store
            .upsert_permission(permission("12-34-56-78", Some("A"), false))
            .unwrap();
        let service = service(&store);

        let outcome = service
            .intake(&tap("12-34-56-78"), UnixTimeNs::from_millis(5))
            .unwrap();
        assert_eq!(outcome.decision, AccessDecision::Admitted);
        assert_eq!(outcome.reason, REASON_PERMISSION_ACTIVE);

        let logs = store.log_entries().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, outcome.log_id);
        assert_eq!(logs[0].card_id.as_str(), "12-34-56-78");
        assert_eq!(logs[0].room.as_str(), "101");
        assert_eq!(logs[0].building.as_ref().unwrap().as_str(), "A");
        assert!(!logs[0].synced);
    }

    #[test]
    fn at_ingest_02_blocked_and_unknown_cards_are_denied() {
        let store = Arc::new(LocalStore::new_in_memory());
        store
            .upsert_permission(permission("12-34", None, true))
            .unwrap();
        let actuator = Arc::new(RecordingActuator::default());
        let service = IngestionService::with_actuator(
            store.clone(),
            Arc::new(IdentityRegistry::new(Some(identity()))),
            actuator.clone(),
        );

        let blocked = service.intake(&tap("12-34"), UnixTimeNs(1)).unwrap();
        assert_eq!(blocked.decision, AccessDecision::Denied);
        assert_eq!(blocked.reason, "card blocked: lost card");

        let unknown = service.intake(&tap("99-99"), UnixTimeNs(2)).unwrap();
        assert_eq!(unknown.decision, AccessDecision::Denied);
        assert_eq!(unknown.reason, REASON_UNKNOWN_CARD);

        assert_eq!(store.log_entries().unwrap().len(), 2);
        assert_eq!(
            *actuator.seen.lock().unwrap(),
            vec![AccessDecision::Denied, AccessDecision::Denied]
        );
    }

    #[test]
    fn at_ingest_03_malformed_uid_is_rejected_without_logging() {
        let store = Arc::new(LocalStore::new_in_memory());
        let service = service(&store);
        for bad in ["", "   ", "12--34", "12 34"] {
            let err = service.intake(&tap(bad), UnixTimeNs(1)).unwrap_err();
            assert!(matches!(err, IngestError::Validation(_)), "{bad:?}");
        }
        assert!(store.log_entries().unwrap().is_empty());
    }

    #[test]
    fn at_ingest_04_missing_identity_fails_closed() {
        let store = Arc::new(LocalStore::new_in_memory());
        store
            .upsert_permission(permission("12-34", None, false))
            .unwrap();
        let service = IngestionService::new(store.clone(), Arc::new(IdentityRegistry::new(None)));
        let err = service.intake(&tap("12-34"), UnixTimeNs(1)).unwrap_err();
        assert!(matches!(err, IngestError::IdentityUnavailable));
        assert!(store.log_entries().unwrap().is_empty());
    }

    #[test]
    fn at_ingest_05_decisions_follow_identity_reassignment() {
        let store = Arc::new(LocalStore::new_in_memory());
        store
            .upsert_permission(permission("12-34", Some("A"), false))
            .unwrap();
        let service = service(&store);
        assert!(service
            .intake(&tap("12-34"), UnixTimeNs(1))
            .unwrap()
            .decision
            .is_admitted());

        service
            .registry()
            .set(DeviceIdentity::from_raw("edge-1", "202", Some("A")).unwrap());
        let moved = service.intake(&tap("12-34"), UnixTimeNs(2)).unwrap();
        assert_eq!(moved.decision, AccessDecision::Denied);
        assert_eq!(moved.room.as_str(), "202");
    }
}
