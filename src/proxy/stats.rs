// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Proxy counters
//!
//! Lock-free atomics, mirrored to the `metrics` facade as they change and
//! snapshotted into a serialisable structure for events and the CLI.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};

macro_rules! igmp_counters {
    ($($variant:ident: $field:ident => $metric:literal),* $(,)?) => {
        /// Counter selector for [`IgmpStatistics::incr`]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Counter {
            $($variant,)*
        }

        impl Counter {
            pub const fn metric_name(self) -> &'static str {
                match self {
                    $(Counter::$variant => $metric,)*
                }
            }
        }

        /// Live counters
        #[derive(Debug, Default)]
        pub struct IgmpStatistics {
            $($field: AtomicU64,)*
            current_groups: AtomicU64,
        }

        /// Point-in-time copy of [`IgmpStatistics`]
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct StatisticsSnapshot {
            $(pub $field: u64,)*
            pub current_groups: u64,
        }

        impl IgmpStatistics {
            fn cell(&self, counter: Counter) -> &AtomicU64 {
                match counter {
                    $(Counter::$variant => &self.$field,)*
                }
            }

            pub fn snapshot(&self) -> StatisticsSnapshot {
                StatisticsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                    current_groups: self.current_groups.load(Ordering::Relaxed),
                }
            }

            pub fn reset(&self) {
                $(self.$field.store(0, Ordering::Relaxed);)*
                self.current_groups.store(0, Ordering::Relaxed);
            }
        }
    };
}

igmp_counters! {
    RxPackets: rx_packets => "igmp_rx_packets_total",
    RxQueries: rx_queries => "igmp_rx_queries_total",
    RxV2Reports: rx_v2_reports => "igmp_rx_v2_reports_total",
    RxV3Reports: rx_v3_reports => "igmp_rx_v3_reports_total",
    RxLeaves: rx_leaves => "igmp_rx_leaves_total",
    MalformedPackets: malformed_packets => "igmp_malformed_packets_total",
    UnsupportedPackets: unsupported_packets => "igmp_unsupported_packets_total",
    InvalidGroups: invalid_groups => "igmp_invalid_groups_total",
    DroppedNotMaster: dropped_not_master => "igmp_dropped_not_master_total",
    DroppedDisabled: dropped_disabled => "igmp_dropped_disabled_total",
    DroppedUnconfigured: dropped_unconfigured => "igmp_dropped_unconfigured_total",
    IgnoredUplinkReports: ignored_uplink_reports => "igmp_ignored_uplink_reports_total",
    IgnoredSubscriberQueries: ignored_subscriber_queries => "igmp_ignored_subscriber_queries_total",
    Joins: joins => "igmp_joins_total",
    Rejoins: rejoins => "igmp_rejoins_total",
    Leaves: leaves => "igmp_leaves_total",
    LeavesCancelled: leaves_cancelled => "igmp_leaves_cancelled_total",
    Expirations: expirations => "igmp_expirations_total",
    UnknownKeyLeaves: unknown_key_leaves => "igmp_unknown_key_leaves_total",
    TimerRacesLost: timer_races_lost => "igmp_timer_races_lost_total",
    UpstreamJoins: upstream_joins => "igmp_upstream_joins_total",
    UpstreamLeaves: upstream_leaves => "igmp_upstream_leaves_total",
    UpstreamReports: upstream_reports => "igmp_upstream_reports_total",
    UpstreamEmitRetries: upstream_emit_retries => "igmp_upstream_emit_retries_total",
    UpstreamEmitFailures: upstream_emit_failures => "igmp_upstream_emit_failures_total",
    DownstreamQueries: downstream_queries => "igmp_downstream_queries_total",
    VersionDowngrades: version_downgrades => "igmp_version_downgrades_total",
    ForwardingAdds: forwarding_adds => "igmp_forwarding_adds_total",
    ForwardingRemoves: forwarding_removes => "igmp_forwarding_removes_total",
}

impl IgmpStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.cell(counter).fetch_add(1, Ordering::Relaxed);
        counter!(counter.metric_name()).increment(1);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.cell(counter).load(Ordering::Relaxed)
    }

    /// Number of active membership keys
    pub fn set_current_groups(&self, count: usize) {
        self.current_groups.store(count as u64, Ordering::Relaxed);
        gauge!("igmp_current_groups").set(count as f64);
    }
}

impl StatisticsSnapshot {
    /// Packets dropped before reaching a state machine
    pub fn dropped(&self) -> u64 {
        self.malformed_packets
            + self.unsupported_packets
            + self.dropped_not_master
            + self.dropped_disabled
            + self.dropped_unconfigured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let stats = IgmpStatistics::new();
        stats.incr(Counter::RxPackets);
        stats.incr(Counter::RxPackets);
        stats.incr(Counter::MalformedPackets);
        stats.incr(Counter::DroppedNotMaster);
        stats.set_current_groups(4);

        let snap = stats.snapshot();
        assert_eq!(snap.rx_packets, 2);
        assert_eq!(stats.get(Counter::RxPackets), 2);
        assert_eq!(snap.current_groups, 4);
        assert_eq!(snap.dropped(), 2);

        stats.reset();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }

    #[test]
    fn test_snapshot_serialises() {
        let stats = IgmpStatistics::new();
        stats.incr(Counter::Joins);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["joins"], 1);
    }
}
