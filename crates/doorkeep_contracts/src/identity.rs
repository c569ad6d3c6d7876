#![forbid(unsafe_code)]

use crate::access::{BuildingId, DeviceId, RoomId};
use crate::common::{ContractViolation, Validate};

/// Where this edge node is installed. Every access decision is made in the
/// context of exactly one identity.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub room_id: RoomId,
    pub building: Option<BuildingId>,
}

impl DeviceIdentity {
    pub fn v1(device_id: DeviceId, room_id: RoomId, building: Option<BuildingId>) -> Self {
        Self {
            device_id,
            room_id,
            building,
        }
    }

    pub fn from_raw(
        device_id: &str,
        room_id: &str,
        building: Option<&str>,
    ) -> Result<Self, ContractViolation> {
        let building = match building.map(str::trim) {
            Some(b) if !b.is_empty() => Some(BuildingId::new(b)?),
            _ => None,
        };
        Ok(Self {
            device_id: DeviceId::new(device_id.trim())?,
            room_id: RoomId::new(room_id.trim())?,
            building,
        })
    }
}

impl Validate for DeviceIdentity {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.device_id.validate()?;
        self.room_id.validate()?;
        if let Some(building) = self.building.as_ref() {
            building.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_identity_01_blank_building_is_none() {
        let id = DeviceIdentity::from_raw("edge-1", "101", Some("  ")).unwrap();
        assert_eq!(id.building, None);
        let id = DeviceIdentity::from_raw(" edge-1 ", "101", Some("A")).unwrap();
        assert_eq!(id.device_id.as_str(), "edge-1");
        assert_eq!(id.building.unwrap().as_str(), "A");
    }

    #[test]
    fn at_identity_02_missing_room_fails() {
        assert!(DeviceIdentity::from_raw("edge-1", "", None).is_err());
    }
}
