#![forbid(unsafe_code)]

//! Requests the operator side issues against the cloud authority: blocking a
//! card and browsing the access log.

use crate::access::{BuildingId, CardId, RoomId};
use crate::common::{ContractViolation, UnixTimeNs};

pub const LOG_QUERY_LIMIT_DEFAULT: u32 = 50;
pub const LOG_QUERY_LIMIT_MIN: u32 = 1;
pub const LOG_QUERY_LIMIT_MAX: u32 = 500;

/// Resolves a caller-supplied limit: missing or non-positive falls back to
/// the default, anything above the maximum is capped.
pub fn clamp_query_limit(raw: Option<i64>) -> u32 {
    match raw {
        None => LOG_QUERY_LIMIT_DEFAULT,
        Some(v) if v <= 0 => LOG_QUERY_LIMIT_DEFAULT,
        Some(v) => v.clamp(LOG_QUERY_LIMIT_MIN as i64, LOG_QUERY_LIMIT_MAX as i64) as u32,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub card_id: CardId,
    pub room: RoomId,
    pub building: Option<BuildingId>,
    pub reason: Option<String>,
}

impl BlockRequest {
    /// Builds a block request from raw form input. Card and room are required;
    /// blank building and reason are treated as absent.
    pub fn from_form(
        uid: &str,
        room: &str,
        building: &str,
        reason: &str,
    ) -> Result<Self, ContractViolation> {
        let uid = uid.trim();
        let room = room.trim();
        if uid.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "card_id",
                reason: "is required to block a card",
            });
        }
        if room.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "room",
                reason: "is required to block a card",
            });
        }
        let building = match building.trim() {
            "" => None,
            b => Some(BuildingId::new(b)?),
        };
        let reason = match reason.trim() {
            "" => None,
            r if r.len() > 512 => {
                return Err(ContractViolation::InvalidValue {
                    field: "block_reason",
                    reason: "must be <= 512 chars",
                })
            }
            r => Some(r.to_string()),
        };
        Ok(Self {
            card_id: CardId::new(uid)?,
            room: RoomId::new(room)?,
            building,
            reason,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub student: Option<String>,
    pub room: Option<RoomId>,
    pub building: Option<BuildingId>,
    pub start: Option<UnixTimeNs>,
    pub end: Option<UnixTimeNs>,
    pub limit: u32,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            student: None,
            room: None,
            building: None,
            start: None,
            end: None,
            limit: LOG_QUERY_LIMIT_DEFAULT,
        }
    }
}

impl LogQuery {
    pub fn v1(
        student: Option<String>,
        room: Option<RoomId>,
        building: Option<BuildingId>,
        start: Option<UnixTimeNs>,
        end: Option<UnixTimeNs>,
        raw_limit: Option<i64>,
    ) -> Result<Self, ContractViolation> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(ContractViolation::InvalidValue {
                    field: "date_range",
                    reason: "start must not be after end",
                });
            }
        }
        let student = student
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(Self {
            student,
            room,
            building,
            start,
            end,
            limit: clamp_query_limit(raw_limit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_dashboard_01_limit_is_clamped() {
        assert_eq!(clamp_query_limit(None), 50);
        assert_eq!(clamp_query_limit(Some(0)), 50);
        assert_eq!(clamp_query_limit(Some(-7)), 50);
        assert_eq!(clamp_query_limit(Some(1)), 1);
        assert_eq!(clamp_query_limit(Some(500)), 500);
        assert_eq!(clamp_query_limit(Some(501)), 500);
        assert_eq!(clamp_query_limit(Some(i64::MAX)), 500);
    }

    #[test]
    fn at_dashboard_02_block_requires_uid_and_room() {
        let err = BlockRequest::from_form("", "101", "A", "").unwrap_err();
        assert!(matches!(
            err,
            ContractViolation::InvalidValue {
                field: "card_id",
                ..
            }
        ));
        let err = BlockRequest::from_form("12-34-56-78", "  ", "", "").unwrap_err();
        assert!(matches!(
            err,
            ContractViolation::InvalidValue { field: "room", .. }
        ));
    }

    #[test]
    fn at_dashboard_03_block_blank_optionals_are_absent() {
        let req = BlockRequest::from_form(" 12-34-56-78 ", "101", " ", "").unwrap();
        assert_eq!(req.card_id.as_str(), "12-34-56-78");
        assert_eq!(req.building, None);
        assert_eq!(req.reason, None);
    }

    #[test]
    fn at_dashboard_04_query_rejects_inverted_range() {
        assert!(LogQuery::v1(
            None,
            None,
            None,
            Some(UnixTimeNs(10)),
            Some(UnixTimeNs(5)),
            None
        )
        .is_err());
        let q = LogQuery::v1(Some("  ".to_string()), None, None, None, None, Some(900)).unwrap();
        assert_eq!(q.student, None);
        assert_eq!(q.limit, 500);
    }
}
