// SPDX-License-Identifier: Apache-2.0 OR MIT
// Severity levels, numbered as syslog levels 3 through 7

use serde::{Deserialize, Serialize};

/// Lower is more severe
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Upstream emit failure after retry
    Error = 3,
    /// Dropped frame, missing uplink
    Warning = 4,
    /// Activation, version downgrade
    Notice = 5,
    /// Group joined or left
    Info = 6,
    /// State transitions, timer firings
    Debug = 7,
}

impl Severity {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            3 => Some(Severity::Error),
            4 => Some(Severity::Warning),
            5 => Some(Severity::Notice),
            6 => Some(Severity::Info),
            7 => Some(Severity::Debug),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Severity::Error),
            "warning" | "warn" => Ok(Severity::Warning),
            "notice" => Ok(Severity::Notice),
            "info" => Ok(Severity::Info),
            "debug" => Ok(Severity::Debug),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_round_trips_through_atomic_value() {
        for severity in [Severity::Error, Severity::Notice, Severity::Debug] {
            assert_eq!(Severity::from_u8(severity.as_u8()), Some(severity));
        }
        assert_eq!(Severity::from_u8(0), None);
        assert!(Severity::Error < Severity::Debug);
    }

    #[test]
    fn test_severity_from_str() {
        assert_eq!("warn".parse::<Severity>(), Ok(Severity::Warning));
        assert_eq!("DEBUG".parse::<Severity>(), Ok(Severity::Debug));
        assert!("emergency".parse::<Severity>().is_err());
    }
}
