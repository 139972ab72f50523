// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging facilities (component identifiers)

use serde::{Deserialize, Serialize};

/// Logging facility - identifies which component generated the log message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facility {
    /// Proxy controller, activation, packet dispatch
    Proxy = 0,
    /// Membership table and per-key state machines
    Membership = 1,
    /// IGMP frame decode/encode
    Codec = 2,
    /// Timer service
    Timer = 3,
    /// Upstream Join/Leave emission
    Upstream = 4,
    /// Configuration loading and validation
    Config = 5,
    /// Counters and membership events
    Stats = 6,
}

impl Facility {
    pub const ALL: [Facility; 7] = [
        Facility::Proxy,
        Facility::Membership,
        Facility::Codec,
        Facility::Timer,
        Facility::Upstream,
        Facility::Config,
        Facility::Stats,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Proxy => "Proxy",
            Facility::Membership => "Membership",
            Facility::Codec => "Codec",
            Facility::Timer => "Timer",
            Facility::Upstream => "Upstream",
            Facility::Config => "Config",
            Facility::Stats => "Stats",
        }
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Case-insensitive facility name, as used in config `log_levels`
impl std::str::FromStr for Facility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Facility::ALL
            .into_iter()
            .find(|facility| facility.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown facility '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facility_display() {
        assert_eq!(format!("{}", Facility::Proxy), "Proxy");
        assert_eq!(format!("{}", Facility::Upstream), "Upstream");
    }

    #[test]
    fn test_facility_from_str() {
        assert_eq!("membership".parse::<Facility>(), Ok(Facility::Membership));
        assert_eq!("CODEC".parse::<Facility>(), Ok(Facility::Codec));
        assert!("datapath".parse::<Facility>().is_err());
        for facility in Facility::ALL {
            assert_eq!(facility.as_str().parse::<Facility>(), Ok(facility));
        }
    }
}
