// SPDX-License-Identifier: Apache-2.0 OR MIT
//! IGMP proxy controller
//!
//! [`IgmpProxy`] is the per-packet facade. Worker threads hand it inbound
//! frames with their (device, port, vlan) context; the timer task hands it
//! fired timers. Each membership key is driven under its own entry lock and
//! every side effect of a transition (upstream report, downstream query,
//! forwarding intent, event) is issued from under that lock, so effects for
//! one key are never reordered.
//!
//! Packet emission is fire-and-forget through the injected
//! [`PacketTransport`]: one retry, then the failure is counted and logged
//! while local state keeps advancing.

pub mod events;
pub mod services;
pub mod stats;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{ConfigError, ProxyConfig};
use crate::logging::{Facility, Logger, Severity};
use crate::membership::{
    AggregationKey, GroupMembershipKey, LeaveReason, MemberAction, MemberState, MembershipTable,
    MembershipTimers, Skipped, Step, TimerKind,
};
use crate::protocols::{
    self, DecodeError, GroupRecord, IgmpMessage, IgmpVersion, MacAddr, MembershipChange,
    MembershipIntent,
};
use crate::timer::{clock_now, FiredTimer, TimerRequest, TimerService, TimerType};
use crate::{
    log_debug, log_error, log_kv, log_notice, log_warning, ConnectPoint, DeviceId, FlowAction,
    ForwardingIntent, PacketContext, PortNumber, VlanId,
};

pub use events::{EventSubscriptionManager, ProxyEvent};
pub use services::{
    AlwaysMaster, ChannelTransport, Collaborators, FlowService, LoggingFlowService,
    MastershipService, OutboundFrame, PacketTransport, StaticMastership, TransportError,
};
pub use stats::{Counter, IgmpStatistics, StatisticsSnapshot};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Why an inbound frame never reached a state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Inactive,
    NotMaster,
    UnconfiguredDevice,
    DeviceDisabled,
    Malformed,
    Unsupported,
}

/// Valid frames that are deliberately not acted upon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IgnoreReason {
    /// Reports and leaves are only accepted from subscriber ports
    ReportFromUplink,
    /// Queries are only accepted from the uplink
    QueryFromSubscriber,
}

/// Outcome of [`IgmpProxy::handle_inbound_packet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDisposition {
    Dropped(DropReason),
    Ignored(IgnoreReason),
    /// Report or leave processed; number of membership intents applied
    Membership { intents: usize },
    /// Upstream query processed; number of members asked to respond
    Query { members: usize },
}

/// Validated configuration plus values derived from it
#[derive(Debug)]
struct ActiveConfig {
    config: ProxyConfig,
    source_mac: MacAddr,
    timers: MembershipTimers,
}

impl ActiveConfig {
    fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            source_mac: config.source_mac_bytes()?,
            timers: config.membership_timers(),
            config,
        })
    }

    fn aggregate_for(&self, key: &GroupMembershipKey) -> AggregationKey {
        AggregationKey::for_key(
            key,
            self.config.aggregation_mode(&key.device),
            self.config.aggregation_point(&key.device),
        )
    }

    fn uplink(&self, device: &DeviceId) -> Option<ConnectPoint> {
        self.config
            .device(device)
            .map(|d| ConnectPoint::new(device.clone(), d.uplink_port))
    }
}

/// Non-multicast groups and the link-local control block (224.0.0.0/24,
/// home of 224.0.0.1, 224.0.0.2 and 224.0.0.22) are never proxied
fn is_proxied_group(group: Ipv4Addr) -> bool {
    group.is_multicast() && group.octets()[..3] != [224, 0, 0]
}

fn tag(vlan: VlanId) -> Option<u16> {
    (vlan != 0).then_some(vlan)
}

/// Upstream encoding overrides learned from v2 queriers, keyed by
/// (device, group); a `None` group covers the whole device
type VersionOverrides = HashMap<(DeviceId, Option<Ipv4Addr>), IgmpVersion>;

/// The IGMP proxy
pub struct IgmpProxy {
    config: RwLock<Option<Arc<ActiveConfig>>>,
    table: MembershipTable,
    versions: Mutex<VersionOverrides>,
    collaborators: Collaborators,
    timers: TimerService,
    stats: Arc<IgmpStatistics>,
    events: EventSubscriptionManager,
    logger: Logger,
}

impl IgmpProxy {
    pub fn new(collaborators: Collaborators, logger: Logger) -> Self {
        Self {
            config: RwLock::new(None),
            table: MembershipTable::new(),
            versions: Mutex::new(HashMap::new()),
            collaborators,
            timers: TimerService::new(logger.clone()),
            stats: Arc::new(IgmpStatistics::new()),
            events: EventSubscriptionManager::default(),
            logger,
        }
    }

    fn active(&self) -> Option<Arc<ActiveConfig>> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn versions(&self) -> MutexGuard<'_, VersionOverrides> {
        self.versions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.active().is_some()
    }

    /// Current configuration, if active
    pub fn config(&self) -> Option<ProxyConfig> {
        self.active().map(|active| active.config.clone())
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// Active membership keys
    pub fn snapshot(&self) -> BTreeSet<GroupMembershipKey> {
        self.table.snapshot()
    }

    /// Active membership keys with their state
    pub fn memberships(&self) -> Vec<(GroupMembershipKey, MemberState)> {
        self.table.states()
    }

    pub fn upstream_refcount(&self, key: &GroupMembershipKey) -> usize {
        match self.active() {
            Some(active) => {
                let aggregate = self
                    .table
                    .admitted_aggregate(key)
                    .unwrap_or_else(|| active.aggregate_for(key));
                self.table.upstream_refcount(&aggregate)
            }
            None => 0,
        }
    }

    /// Start, or reconfigure a running proxy. Memberships survive a
    /// reconfiguration.
    pub fn activate(&self, config: ProxyConfig) -> Result<(), ProxyError> {
        self.activate_at(config, Instant::now())
    }

    pub fn activate_at(&self, config: ProxyConfig, now: Instant) -> Result<(), ProxyError> {
        let active = Arc::new(ActiveConfig::new(config)?);
        let cfg = &active.config;

        for facility in Facility::ALL {
            self.logger.clear_facility_level(facility);
        }
        for (facility, level) in cfg.facility_levels()? {
            self.logger.set_facility_level(facility, level);
        }

        self.timers.schedule(TimerRequest::periodic(
            TimerType::Sweep,
            now + cfg.sweep_interval(),
            cfg.sweep_interval(),
        ));
        self.timers.schedule(TimerRequest::periodic(
            TimerType::PublishStatistics,
            now + cfg.statistics_interval(),
            cfg.statistics_interval(),
        ));
        if cfg.periodic_query {
            self.timers.schedule(TimerRequest::periodic(
                TimerType::PeriodicQuery,
                now + cfg.query_interval(),
                cfg.query_interval(),
            ));
        } else {
            self.timers.cancel(&TimerType::PeriodicQuery);
        }

        log_notice!(
            self.logger,
            Facility::Proxy,
            &format!(
                "IGMP proxy activated: {} device(s), default {}, {} aggregation",
                cfg.devices.len(),
                cfg.default_version,
                if cfg.igmp_on_pod_basis { "per-POD" } else { "per-subscriber" }
            )
        );

        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(active);
        Ok(())
    }

    /// Stop processing, drop all membership state and cancel every timer.
    /// Installed forwarding is withdrawn.
    pub fn deactivate(&self) {
        let previous = self
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_none() {
            return;
        }

        self.timers.cancel_all();
        for (device, port, group) in self.table.clear() {
            self.apply_forwarding(&device, port, group, FlowAction::Remove);
        }
        self.versions().clear();
        self.stats.set_current_groups(0);

        log_notice!(self.logger, Facility::Proxy, "IGMP proxy deactivated");
    }

    /// Upstream encoding in force for `group` on `device`
    pub fn upstream_version(&self, device: &DeviceId, group: Ipv4Addr) -> IgmpVersion {
        let default = self
            .active()
            .map_or(IgmpVersion::V3, |active| active.config.default_version);
        self.version_for(device, Some(group), default)
    }

    fn version_for(
        &self,
        device: &DeviceId,
        group: Option<Ipv4Addr>,
        default: IgmpVersion,
    ) -> IgmpVersion {
        let versions = self.versions();
        group
            .and_then(|g| versions.get(&(device.clone(), Some(g))))
            .or_else(|| versions.get(&(device.clone(), None)))
            .copied()
            .unwrap_or(default)
    }

    /// Drop learned version overrides for a group, or for the whole device
    pub fn reset_version(&self, device: &DeviceId, group: Option<Ipv4Addr>) {
        let mut versions = self.versions();
        match group {
            Some(g) => {
                versions.remove(&(device.clone(), Some(g)));
            }
            None => versions.retain(|(dev, _), _| dev != device),
        }
    }

    pub fn handle_inbound_packet(&self, ctx: &PacketContext, frame: &[u8]) -> PacketDisposition {
        self.handle_inbound_packet_at(ctx, frame, Instant::now())
    }

    pub fn handle_inbound_packet_at(
        &self,
        ctx: &PacketContext,
        frame: &[u8],
        now: Instant,
    ) -> PacketDisposition {
        let Some(active) = self.active() else {
            return PacketDisposition::Dropped(DropReason::Inactive);
        };
        self.stats.incr(Counter::RxPackets);

        if !self.collaborators.mastership.is_local_master(&ctx.device) {
            self.stats.incr(Counter::DroppedNotMaster);
            return PacketDisposition::Dropped(DropReason::NotMaster);
        }

        let device_cfg = match active.config.device(&ctx.device) {
            Some(cfg) if cfg.enabled => cfg,
            Some(_) => {
                self.stats.incr(Counter::DroppedDisabled);
                return PacketDisposition::Dropped(DropReason::DeviceDisabled);
            }
            None => {
                self.stats.incr(Counter::DroppedUnconfigured);
                log_debug!(
                    self.logger,
                    Facility::Proxy,
                    &format!("IGMP from unconfigured device {}", ctx.device)
                );
                return PacketDisposition::Dropped(DropReason::UnconfiguredDevice);
            }
        };

        let packet = match protocols::decode(frame) {
            Ok(packet) => packet,
            Err(DecodeError::MalformedPacket(e)) => {
                self.stats.incr(Counter::MalformedPackets);
                log_warning!(
                    self.logger,
                    Facility::Codec,
                    &format!("Malformed IGMP frame on {}: {}", ctx.connect_point(), e)
                );
                return PacketDisposition::Dropped(DropReason::Malformed);
            }
            Err(e @ DecodeError::UnsupportedVersion(_)) => {
                self.stats.incr(Counter::UnsupportedPackets);
                log_debug!(
                    self.logger,
                    Facility::Codec,
                    &format!("Dropping frame on {}: {}", ctx.connect_point(), e)
                );
                return PacketDisposition::Dropped(DropReason::Unsupported);
            }
        };

        log_debug!(
            self.logger,
            Facility::Proxy,
            &format!(
                "Received {} from {} on {} vlan {}",
                packet.message.type_name(),
                packet.headers.src_ip,
                ctx.connect_point(),
                ctx.vlan
            )
        );

        let from_uplink = ctx.port == device_cfg.uplink_port;
        let disposition = match &packet.message {
            IgmpMessage::Query {
                version,
                group,
                max_resp,
                ..
            } => {
                self.stats.incr(Counter::RxQueries);
                if !from_uplink {
                    self.stats.incr(Counter::IgnoredSubscriberQueries);
                    return PacketDisposition::Ignored(IgnoreReason::QueryFromSubscriber);
                }
                let group = (!group.is_unspecified()).then_some(*group);
                let members = self.handle_upstream_query(
                    &active,
                    &ctx.device,
                    *version,
                    group,
                    *max_resp,
                    now,
                );
                PacketDisposition::Query { members }
            }
            message => {
                self.stats.incr(match message {
                    IgmpMessage::Report {
                        version: IgmpVersion::V2,
                        ..
                    } => Counter::RxV2Reports,
                    IgmpMessage::Report { .. } => Counter::RxV3Reports,
                    _ => Counter::RxLeaves,
                });
                if from_uplink {
                    self.stats.incr(Counter::IgnoredUplinkReports);
                    return PacketDisposition::Ignored(IgnoreReason::ReportFromUplink);
                }
                let intents = self.handle_intents(&active, ctx, message.intents(), now);
                PacketDisposition::Membership { intents }
            }
        };

        self.stats.set_current_groups(self.table.len());
        disposition
    }

    fn handle_intents(
        &self,
        active: &ActiveConfig,
        ctx: &PacketContext,
        intents: Vec<MembershipIntent>,
        now: Instant,
    ) -> usize {
        let mut applied = 0;
        for intent in intents {
            if !is_proxied_group(intent.group) {
                self.stats.incr(Counter::InvalidGroups);
                log_debug!(
                    self.logger,
                    Facility::Membership,
                    &format!("Ignoring group {} on {}", intent.group, ctx.connect_point())
                );
                continue;
            }
            applied += 1;
            match intent.change {
                MembershipChange::Join => self.join(active, ctx, intent, now),
                MembershipChange::Leave => self.leave(active, ctx, intent, now),
            }
        }
        applied
    }

    fn key_for(
        &self,
        ctx: &PacketContext,
        group: Ipv4Addr,
        source: Option<Ipv4Addr>,
    ) -> GroupMembershipKey {
        GroupMembershipKey {
            device: ctx.device.clone(),
            port: ctx.port,
            vlan: ctx.vlan,
            group,
            source,
        }
    }

    fn join(
        &self,
        active: &ActiveConfig,
        ctx: &PacketContext,
        intent: MembershipIntent,
        now: Instant,
    ) {
        let source = intent
            .source
            .or_else(|| active.config.ssm_source(intent.group));
        let key = self.key_for(ctx, intent.group, source);

        self.table.with_entry(&key, true, |sm| {
            let step = sm.on_join_report(now, &active.timers);
            self.apply_step(active, sm.key(), step);
        });
    }

    fn leave(
        &self,
        active: &ActiveConfig,
        ctx: &PacketContext,
        intent: MembershipIntent,
        now: Instant,
    ) {
        let keys = match intent.source {
            Some(source) => vec![self.key_for(ctx, intent.group, Some(source))],
            // A source-less leave withdraws every source of the group on
            // this port, including SSM-translated ones
            None => {
                let probe = self.key_for(ctx, intent.group, None);
                self.table.keys_matching(|k| k.same_group_on_port(&probe))
            }
        };

        let mut handled = false;
        for key in keys {
            let done = self.table.with_entry(&key, false, |sm| {
                let step = sm.on_leave_report(now, &active.timers);
                self.apply_step(active, sm.key(), step);
            });
            handled |= done.is_some();
        }

        if !handled {
            self.stats.incr(Counter::UnknownKeyLeaves);
            log_debug!(
                self.logger,
                Facility::Membership,
                &format!(
                    "Leave for {} on {} without membership",
                    intent.group,
                    ctx.connect_point()
                )
            );
        }
    }

    fn handle_upstream_query(
        &self,
        active: &ActiveConfig,
        device: &DeviceId,
        version: IgmpVersion,
        group: Option<Ipv4Addr>,
        max_resp: Duration,
        now: Instant,
    ) -> usize {
        if version == IgmpVersion::V2 {
            let previous = self.versions().insert((device.clone(), group), IgmpVersion::V2);
            if previous.is_none() && active.config.default_version != IgmpVersion::V2 {
                self.stats.incr(Counter::VersionDowngrades);
                let scope = group.map_or_else(|| "all groups".to_string(), |g| g.to_string());
                log_notice!(
                    self.logger,
                    Facility::Upstream,
                    &format!("IGMPv2 querier on {}: using v2 for {}", device, scope)
                );
            }
        }

        // Keys whose aggregate is signalled on this device's uplink
        let candidates = self.table.keys_matching(|k| {
            group.map_or(true, |g| k.group == g)
                && self
                    .table
                    .upstream_uplink(k)
                    .map_or(&k.device == device, |uplink| &uplink.device == device)
        });

        // One responder per upstream aggregate. A key that declines leaves
        // the aggregate open for the next member.
        let mut answered = HashSet::new();
        let mut members = 0;
        for key in candidates {
            let aggregate = self
                .table
                .admitted_aggregate(&key)
                .unwrap_or_else(|| active.aggregate_for(&key));
            if answered.contains(&aggregate) {
                continue;
            }
            let delay = if active.config.immediate_response || max_resp.is_zero() {
                Duration::ZERO
            } else {
                rand::thread_rng().gen_range(Duration::ZERO..=max_resp)
            };
            let handled = self.table.with_entry(&key, false, |sm| {
                let step = sm.on_upstream_query(delay, now);
                let responding = step.skipped.is_none();
                self.apply_step(active, sm.key(), step);
                responding
            });
            if handled == Some(true) {
                answered.insert(aggregate);
                members += 1;
            }
        }
        members
    }

    /// Sweep every key for due timers. Idempotent when nothing is due.
    pub fn handle_query_timer_tick(&self) -> usize {
        self.handle_query_timer_tick_at(Instant::now())
    }

    /// Returns the number of timers processed
    pub fn handle_query_timer_tick_at(&self, now: Instant) -> usize {
        let Some(active) = self.active() else {
            return 0;
        };

        let mut processed = 0;
        for key in self.table.snapshot() {
            let fired = self.table.with_entry(&key, false, |sm| {
                let mut fired = 0;
                for (kind, generation) in sm.due_timers(now) {
                    let step = sm.on_timer(kind, generation, now, &active.timers);
                    if !step.is_skipped() {
                        fired += 1;
                    }
                    self.apply_step(&active, sm.key(), step);
                }
                fired
            });
            processed += fired.unwrap_or(0);
        }

        if processed > 0 {
            self.stats.set_current_groups(self.table.len());
        }
        processed
    }

    /// Dispatch a timer delivered by the timer service
    pub fn handle_timer(&self, fired: FiredTimer) -> bool {
        self.handle_timer_at(fired, Instant::now())
    }

    pub fn handle_timer_at(&self, fired: FiredTimer, now: Instant) -> bool {
        let Some(active) = self.active() else {
            return false;
        };

        match &fired.timer_type {
            TimerType::Sweep => self.handle_query_timer_tick_at(now) > 0,
            TimerType::PeriodicQuery => self.send_periodic_queries(&active) > 0,
            TimerType::PublishStatistics => {
                self.publish_statistics();
                true
            }
            timer_type => {
                let (Some(key), Some(kind)) = (timer_type.key(), TimerKind::of(timer_type)) else {
                    return false;
                };
                let outcome = self.table.with_entry(key, false, |sm| {
                    let step = sm.on_timer(kind, fired.generation, now, &active.timers);
                    let acted = !step.is_skipped();
                    self.apply_step(&active, sm.key(), step);
                    acted
                });
                if outcome.is_none() {
                    self.stats.incr(Counter::TimerRacesLost);
                }
                self.stats.set_current_groups(self.table.len());
                outcome == Some(true)
            }
        }
    }

    /// General query to every subscriber port with members. Returns the
    /// number of queries sent.
    pub fn send_periodic_queries_now(&self) -> usize {
        match self.active() {
            Some(active) => self.send_periodic_queries(&active),
            None => 0,
        }
    }

    fn send_periodic_queries(&self, active: &ActiveConfig) -> usize {
        let ports: BTreeSet<(DeviceId, PortNumber, VlanId)> = self
            .table
            .snapshot()
            .into_iter()
            .map(|k| (k.device, k.port, k.vlan))
            .collect();

        let mut sent = 0;
        for (device, port, vlan) in ports {
            let version = self.version_for(&device, None, active.config.default_version);
            let frame = protocols::encode_query(
                None,
                active.config.query_response_interval(),
                version,
                active.config.querier_timers(),
                active.source_mac,
                active.config.source_ip,
                tag(vlan),
            );
            if self.emit(&ConnectPoint::new(device, port), frame) {
                self.stats.incr(Counter::DownstreamQueries);
                sent += 1;
            }
        }
        sent
    }

    pub fn publish_statistics(&self) -> StatisticsSnapshot {
        self.stats.set_current_groups(self.table.len());
        let stats = self.stats.snapshot();
        log_debug!(
            self.logger,
            Facility::Stats,
            &format!(
                "{} groups, {} upstream joins, {} upstream leaves",
                stats.current_groups, stats.upstream_joins, stats.upstream_leaves
            )
        );
        self.events.send(ProxyEvent::Statistics {
            stats: stats.clone(),
            timestamp: Utc::now(),
        });
        stats
    }

    /// Carry out a transition's effects. Runs under the key's entry lock.
    fn apply_step(&self, active: &ActiveConfig, key: &GroupMembershipKey, step: Step) {
        for timer in &step.cancelled {
            self.timers.cancel(timer);
        }
        for request in step.timers {
            self.timers.schedule(request);
        }

        if step.skipped == Some(Skipped::TimerRaceLost) {
            self.stats.incr(Counter::TimerRacesLost);
        }

        for action in step.actions {
            match action {
                MemberAction::Joined => self.on_joined(active, key),
                MemberAction::Refreshed => self.stats.incr(Counter::Rejoins),
                MemberAction::LeaveCancelled => {
                    self.stats.incr(Counter::LeavesCancelled);
                    log_debug!(
                        self.logger,
                        Facility::Membership,
                        &format!("Leave cancelled for {}", key)
                    );
                }
                MemberAction::QueryDownstream { max_resp } => {
                    let version = self.version_for(
                        &key.device,
                        Some(key.group),
                        active.config.default_version,
                    );
                    let frame = protocols::encode_query(
                        Some(key.group),
                        max_resp,
                        version,
                        active.config.querier_timers(),
                        active.source_mac,
                        active.config.source_ip,
                        tag(key.vlan),
                    );
                    let out = ConnectPoint::new(key.device.clone(), key.port);
                    if self.emit(&out, frame) {
                        self.stats.incr(Counter::DownstreamQueries);
                    }
                }
                MemberAction::Left(reason) => self.on_left(active, key, reason),
                MemberAction::ReportUpstream => {
                    let record = GroupRecord::current_state(key.group, key.source);
                    let uplink = self.table.upstream_uplink(key);
                    if self.emit_upstream(active, key, uplink, vec![record]) {
                        self.stats.incr(Counter::UpstreamReports);
                    }
                }
            }
        }
    }

    fn on_joined(&self, active: &ActiveConfig, key: &GroupMembershipKey) {
        self.stats.incr(Counter::Joins);
        let admission =
            self.table
                .admit(key, &active.aggregate_for(key), active.uplink(&key.device));

        if let Some(record) = admission.upstream {
            self.stats.incr(Counter::UpstreamJoins);
            self.emit_upstream(active, key, admission.uplink, vec![record]);
        }
        if admission.forwarding_add {
            self.apply_forwarding(&key.device, key.port, key.group, FlowAction::Add);
        }

        let active_members = self.table.group_member_count(&key.device, key.group);
        let (group, members) = (key.group.to_string(), active_members.to_string());
        log_kv!(
            self.logger,
            Severity::Info,
            Facility::Membership,
            &format!("Joined {}", key),
            "group" => group.as_str(),
            "members" => members.as_str()
        );
        self.events.send(ProxyEvent::Joined {
            key: key.clone(),
            active_members,
            timestamp: Utc::now(),
        });
    }

    fn on_left(&self, active: &ActiveConfig, key: &GroupMembershipKey, reason: LeaveReason) {
        self.stats.incr(match reason {
            LeaveReason::MembershipExpired => Counter::Expirations,
            LeaveReason::LeaveConfirmed | LeaveReason::FastLeave => Counter::Leaves,
        });
        let release = self.table.release(key);

        if let Some(record) = release.upstream {
            self.stats.incr(Counter::UpstreamLeaves);
            self.emit_upstream(active, key, release.uplink, vec![record]);
        }
        if release.forwarding_remove {
            self.apply_forwarding(&key.device, key.port, key.group, FlowAction::Remove);
        }

        let active_members = self.table.group_member_count(&key.device, key.group);
        let members = active_members.to_string();
        log_kv!(
            self.logger,
            Severity::Info,
            Facility::Membership,
            &format!("Left {}", key),
            "reason" => reason.as_str(),
            "members" => members.as_str()
        );
        self.events.send(ProxyEvent::Left {
            key: key.clone(),
            reason,
            active_members,
            timestamp: Utc::now(),
        });
    }

    fn apply_forwarding(
        &self,
        device: &DeviceId,
        port: PortNumber,
        group: Ipv4Addr,
        action: FlowAction,
    ) {
        self.stats.incr(match action {
            FlowAction::Add => Counter::ForwardingAdds,
            FlowAction::Remove => Counter::ForwardingRemoves,
        });
        self.collaborators.flows.apply(ForwardingIntent {
            device: device.clone(),
            group,
            port,
            action,
        });
    }

    /// Send `records` on the aggregate's recorded uplink, falling back to
    /// the uplink of the key's own device
    fn emit_upstream(
        &self,
        active: &ActiveConfig,
        key: &GroupMembershipKey,
        uplink: Option<ConnectPoint>,
        records: Vec<GroupRecord>,
    ) -> bool {
        let Some(uplink) = uplink.or_else(|| active.uplink(&key.device)) else {
            log_warning!(
                self.logger,
                Facility::Upstream,
                &format!("No uplink configured for {}", key.device)
            );
            return false;
        };
        let group = records.first().map(|r| r.group);
        let version = self.version_for(&uplink.device, group, active.config.default_version);

        let frames = protocols::encode_report(
            &records,
            version,
            active.source_mac,
            active.config.source_ip,
            active.config.upstream_vlan,
        );
        let mut all_sent = true;
        for frame in frames {
            all_sent &= self.emit(&uplink, frame);
        }
        all_sent
    }

    /// Emit with a single retry. Returns whether the frame went out.
    fn emit(&self, out: &ConnectPoint, frame: Vec<u8>) -> bool {
        let transport = &self.collaborators.transport;
        let Err(first) = transport.emit(out, frame.clone()) else {
            return true;
        };

        self.stats.incr(Counter::UpstreamEmitRetries);
        log_warning!(
            self.logger,
            Facility::Upstream,
            &format!("Send to {} failed ({}), retrying", out, first)
        );
        match transport.emit(out, frame) {
            Ok(()) => true,
            Err(e) => {
                self.stats.incr(Counter::UpstreamEmitFailures);
                log_error!(
                    self.logger,
                    Facility::Upstream,
                    &format!("Send to {} failed after retry: {}", out, e)
                );
                false
            }
        }
    }

    /// Start the timer service and feed its firings back into the proxy.
    /// Both tasks end when the returned handle is aborted.
    pub fn spawn_timer_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<FiredTimer>(1024);
        let timer_task = tokio::spawn(self.timers.clone().run(tx));
        let proxy = Arc::clone(self);

        tokio::spawn(async move {
            while let Some(fired) = rx.recv().await {
                proxy.handle_timer_at(fired, clock_now());
            }
            timer_task.abort();
        })
    }
}
