#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time in nanoseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct UnixTimeNs(pub u64);

impl UnixTimeNs {
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(1);
        if nanos > u64::MAX as u128 {
            UnixTimeNs(u64::MAX)
        } else {
            UnixTimeNs(nanos as u64)
        }
    }

    pub fn from_millis(ms: u64) -> Self {
        UnixTimeNs(ms.saturating_mul(1_000_000))
    }

    pub fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    pub fn saturating_add_ms(self, ms: u64) -> Self {
        UnixTimeNs(self.0.saturating_add(ms.saturating_mul(1_000_000)))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractViolation {
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field} out of range [{min}, {max}]: got {got}")]
    InvalidRange {
        field: &'static str,
        min: i64,
        max: i64,
        got: i64,
    },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

pub(crate) fn validate_token(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.trim() != value {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not have surrounding whitespace",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "too long",
        });
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain control characters",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_common_01_time_helpers_saturate() {
        let t = UnixTimeNs(u64::MAX - 5);
        assert_eq!(t.saturating_add_ms(10), UnixTimeNs(u64::MAX));
        assert_eq!(UnixTimeNs::from_millis(1_500).as_millis(), 1_500);
    }

    #[test]
    fn at_common_02_token_rules() {
        assert!(validate_token("room", "101", 64).is_ok());
        assert!(validate_token("room", "  ", 64).is_err());
        assert!(validate_token("room", " 101", 64).is_err());
        assert!(validate_token("room", "a\nb", 64).is_err());
        assert!(validate_token("room", &"x".repeat(65), 64).is_err());
    }
}
