#![forbid(unsafe_code)]

use std::sync::RwLock;

use doorkeep_contracts::access::DeviceId;
use doorkeep_contracts::identity::DeviceIdentity;

/// Process-wide holder of the node's current device/room identity.
///
/// Readers never wait on I/O: the lock only guards a clone. The sync worker
/// is the only writer once the node is running.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    current: RwLock<Option<DeviceIdentity>>,
    /// Device id known at boot before any room assignment.
    pending_device_id: Option<DeviceId>,
}

impl IdentityRegistry {
    pub fn new(initial: Option<DeviceIdentity>) -> Self {
        Self {
            current: RwLock::new(initial),
            pending_device_id: None,
        }
    }

    /// No identity yet; the first cloud sync assigns one to `device_id`.
    pub fn awaiting_assignment(device_id: DeviceId) -> Self {
        Self {
            current: RwLock::new(None),
            pending_device_id: Some(device_id),
        }
    }

    /// Device id to look up in the cloud: the current identity's, or the
    /// one still waiting for its first assignment.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.get()
            .map(|identity| identity.device_id)
            .or_else(|| self.pending_device_id.clone())
    }

    pub fn get(&self) -> Option<DeviceIdentity> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replaces the identity. Returns `true` when it changed.
    pub fn set(&self, identity: DeviceIdentity) -> bool {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.as_ref() == Some(&identity) {
            return false;
        }
        *guard = Some(identity);
        true
    }
}
