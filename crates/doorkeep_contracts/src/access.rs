#![forbid(unsafe_code)]

use std::fmt;

use crate::common::{validate_token, ContractViolation, UnixTimeNs, Validate};

pub const CARD_ID_SEPARATOR: char = '-';
pub const CARD_ID_MAX_LEN: usize = 64;
pub const SYNC_CURSOR_MAX_LEN: usize = 512;

pub const REASON_PERMISSION_ACTIVE: &str = "permission active";
pub const REASON_CARD_BLOCKED: &str = "card blocked";
pub const REASON_UNKNOWN_CARD: &str = "unknown card";

macro_rules! validated_string_id {
    ($name:ident, $field:literal, $max:expr) => {
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
                let id = id.into();
                validate_token($field, &id, $max)?;
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Validate for $name {
            fn validate(&self) -> Result<(), ContractViolation> {
                validate_token($field, &self.0, $max)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ContractViolation;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

validated_string_id!(RoomId, "room", 64);
validated_string_id!(BuildingId, "building", 64);
validated_string_id!(DeviceId, "device_id", 128);

/// Normalized card identifier: the raw UID bytes in decimal joined by
/// [`CARD_ID_SEPARATOR`], e.g. `"12-34-56-78"`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct CardId(String);

impl CardId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        validate_card_id(&id)?;
        Ok(Self(id))
    }

    pub fn from_uid_bytes(uid: &[u8]) -> Result<Self, ContractViolation> {
        if uid.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "card_id",
                reason: "uid must contain at least one byte",
            });
        }
        let joined = uid
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(&CARD_ID_SEPARATOR.to_string());
        Self::new(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_card_id(id: &str) -> Result<(), ContractViolation> {
    validate_token("card_id", id, CARD_ID_MAX_LEN)?;
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == CARD_ID_SEPARATOR)
    {
        return Err(ContractViolation::InvalidValue {
            field: "card_id",
            reason: "must contain only ascii alphanumerics and separators",
        });
    }
    if id.split(CARD_ID_SEPARATOR).any(str::is_empty) {
        return Err(ContractViolation::InvalidValue {
            field: "card_id",
            reason: "separators must join non-empty segments",
        });
    }
    Ok(())
}

impl Validate for CardId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_card_id(&self.0)
    }
}

impl TryFrom<String> for CardId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CardId> for String {
    fn from(value: CardId) -> Self {
        value.0
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardScan {
    pub card_id: CardId,
    pub observed_at: UnixTimeNs,
}

impl CardScan {
    pub fn v1(card_id: CardId, observed_at: UnixTimeNs) -> Self {
        Self {
            card_id,
            observed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessDecision {
    Admitted,
    Denied,
}

impl AccessDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessDecision::Admitted => "admitted",
            AccessDecision::Denied => "denied",
        }
    }

    pub fn is_admitted(self) -> bool {
        matches!(self, AccessDecision::Admitted)
    }
}

/// Cache key of a permission row. A `None` building matches every building
/// of the room.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PermissionKey {
    pub card_id: CardId,
    pub room: RoomId,
    pub building: Option<BuildingId>,
}

impl PermissionKey {
    pub fn new(card_id: CardId, room: RoomId, building: Option<BuildingId>) -> Self {
        Self {
            card_id,
            room,
            building,
        }
    }

    pub fn without_building(&self) -> Self {
        Self {
            card_id: self.card_id.clone(),
            room: self.room.clone(),
            building: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccessPermission {
    pub card_id: CardId,
    pub room: RoomId,
    pub building: Option<BuildingId>,
    pub blocked: bool,
    pub block_reason: Option<String>,
    pub updated_at: UnixTimeNs,
}

impl AccessPermission {
    pub fn v1(
        card_id: CardId,
        room: RoomId,
        building: Option<BuildingId>,
        blocked: bool,
        block_reason: Option<String>,
        updated_at: UnixTimeNs,
    ) -> Result<Self, ContractViolation> {
        let permission = Self {
            card_id,
            room,
            building,
            blocked,
            block_reason,
            updated_at,
        };
        permission.validate()?;
        Ok(permission)
    }

    pub fn key(&self) -> PermissionKey {
        PermissionKey::new(
            self.card_id.clone(),
            self.room.clone(),
            self.building.clone(),
        )
    }

    /// Decision this row implies for a scan of its card.
    pub fn decide(&self) -> (AccessDecision, String) {
        if !self.blocked {
            return (
                AccessDecision::Admitted,
                REASON_PERMISSION_ACTIVE.to_string(),
            );
        }
        let reason = match self.block_reason.as_deref().map(str::trim) {
            Some(r) if !r.is_empty() => format!("{REASON_CARD_BLOCKED}: {r}"),
            _ => REASON_CARD_BLOCKED.to_string(),
        };
        (AccessDecision::Denied, reason)
    }
}

impl Validate for AccessPermission {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.card_id.validate()?;
        self.room.validate()?;
        if let Some(building) = self.building.as_ref() {
            building.validate()?;
        }
        if let Some(reason) = self.block_reason.as_ref() {
            if reason.len() > 512 {
                return Err(ContractViolation::InvalidValue {
                    field: "block_reason",
                    reason: "must be <= 512 chars",
                });
            }
        }
        Ok(())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct AccessLogId(pub u64);

/// An access event before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogEntryInput {
    pub card_id: CardId,
    pub device_id: DeviceId,
    pub room: RoomId,
    pub building: Option<BuildingId>,
    pub decision: AccessDecision,
    pub reason: String,
    pub observed_at: UnixTimeNs,
}

impl AccessLogEntryInput {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        card_id: CardId,
        device_id: DeviceId,
        room: RoomId,
        building: Option<BuildingId>,
        decision: AccessDecision,
        reason: String,
        observed_at: UnixTimeNs,
    ) -> Result<Self, ContractViolation> {
        if reason.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "reason",
                reason: "must not be empty",
            });
        }
        if reason.len() > 600 {
            return Err(ContractViolation::InvalidValue {
                field: "reason",
                reason: "must be <= 600 chars",
            });
        }
        Ok(Self {
            card_id,
            device_id,
            room,
            building,
            decision,
            reason,
            observed_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccessLogEntry {
    pub id: AccessLogId,
    pub card_id: CardId,
    pub device_id: DeviceId,
    pub room: RoomId,
    pub building: Option<BuildingId>,
    pub decision: AccessDecision,
    pub reason: String,
    pub observed_at: UnixTimeNs,
    pub synced: bool,
    pub synced_at: Option<UnixTimeNs>,
}

impl AccessLogEntry {
    pub fn from_input(id: AccessLogId, input: AccessLogEntryInput) -> Self {
        Self {
            id,
            card_id: input.card_id,
            device_id: input.device_id,
            room: input.room,
            building: input.building,
            decision: input.decision,
            reason: input.reason,
            observed_at: input.observed_at,
            synced: false,
            synced_at: None,
        }
    }
}

/// Watermark of the last permission change pulled from the cloud. Opaque to
/// everything except the sync worker and the cloud client that minted it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyncCursor(String);

impl SyncCursor {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let value = value.into();
        validate_token("sync_cursor", &value, SYNC_CURSOR_MAX_LEN)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SyncCursor {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SyncCursor> for String {
    fn from(value: SyncCursor) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: &str) -> CardId {
        CardId::new(id).unwrap()
    }

    fn room(id: &str) -> RoomId {
        RoomId::new(id).unwrap()
    }

    #[test]
    fn at_access_01_uid_bytes_normalize_to_decimal_segments() {
        let id = CardId::from_uid_bytes(&[12, 34, 56, 78]).unwrap();
        assert_eq!(id.as_str(), "12-34-56-78");
        let id = CardId::from_uid_bytes(&[4, 163, 27, 250, 9]).unwrap();
        assert_eq!(id.as_str(), "4-163-27-250-9");
        assert!(CardId::from_uid_bytes(&[]).is_err());
    }

    #[test]
    fn at_access_02_malformed_card_ids_are_rejected() {
        for bad in ["", "   ", "12--34", "-12", "12-", "12 34", "12/34", "ab\tcd"] {
            assert!(CardId::new(bad).is_err(), "expected reject for {bad:?}");
        }
        assert!(CardId::new("x".repeat(CARD_ID_MAX_LEN + 1)).is_err());
        assert!(CardId::new("04A31B22").is_ok());
    }

    #[test]
    fn at_access_03_serde_revalidates_ids() {
        let ok: CardId = serde_json::from_str("\"12-34\"").unwrap();
        assert_eq!(ok.as_str(), "12-34");
        assert!(serde_json::from_str::<CardId>("\"12--34\"").is_err());
        assert!(serde_json::from_str::<RoomId>("\"\"").is_err());
    }

    #[test]
    fn at_access_04_permission_decisions() {
        let open = AccessPermission::v1(card("1-2"), room("101"), None, false, None, UnixTimeNs(1))
            .unwrap();
        assert_eq!(open.decide().0, AccessDecision::Admitted);

        let blocked = AccessPermission::v1(
            card("1-2"),
            room("101"),
            None,
            true,
            Some("lost card".to_string()),
            UnixTimeNs(1),
        )
        .unwrap();
        let (decision, reason) = blocked.decide();
        assert_eq!(decision, AccessDecision::Denied);
        assert_eq!(reason, "card blocked: lost card");

        let blocked_no_reason =
            AccessPermission::v1(card("1-2"), room("101"), None, true, None, UnixTimeNs(1))
                .unwrap();
        assert_eq!(blocked_no_reason.decide().1, REASON_CARD_BLOCKED);
    }

    #[test]
    fn at_access_05_log_input_requires_reason() {
        let err = AccessLogEntryInput::v1(
            card("1-2"),
            DeviceId::new("edge-1").unwrap(),
            room("101"),
            None,
            AccessDecision::Denied,
            " ".to_string(),
            UnixTimeNs(5),
        );
        assert!(err.is_err());
    }
}
