// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Shared harness for proxy integration tests: recording collaborators and
//! subscriber-side frame builders.
#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use igmp_proxy::config::{DeviceConfig, ProxyConfig};
use igmp_proxy::logging::{Logger, MemorySink};
use igmp_proxy::protocols::frame::build_frame;
use igmp_proxy::protocols::igmp::{
    IgmpQueryBuilder, IgmpV2MessageBuilder, IgmpV3ReportBuilder, ALL_ROUTERS_GROUP,
    ALL_SYSTEMS_GROUP, IGMPV3_ALL_ROUTERS_GROUP,
};
use igmp_proxy::protocols::{self, GroupRecord, IgmpMessage, IgmpVersion, PacketBuilder};
use igmp_proxy::proxy::{
    Collaborators, FlowService, IgmpProxy, MastershipService, PacketDisposition, PacketTransport,
    TransportError,
};
use igmp_proxy::{ConnectPoint, DeviceId, FlowAction, ForwardingIntent, PacketContext, PortNumber};

pub const DEVICE: &str = "of:0000000000000001";
pub const DEVICE_B: &str = "of:0000000000000002";
pub const UPLINK: PortNumber = 100;

const SUBSCRIBER_MAC: [u8; 6] = [0x02, 0xaa, 0, 0, 0, 0x01];
const ROUTER_MAC: [u8; 6] = [0x02, 0xbb, 0, 0, 0, 0x01];

pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

/// Transport that records every frame and can be told to fail
#[derive(Default)]
pub struct RecordingTransport {
    frames: Mutex<Vec<(ConnectPoint, Vec<u8>)>>,
    failures: AtomicUsize,
}

impl RecordingTransport {
    /// Fail the next `n` emissions
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<(ConnectPoint, Vec<u8>)> {
        self.frames.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }

    /// Decoded messages sent out of `port` on `device`
    pub fn messages_on(&self, device: &str, port: PortNumber) -> Vec<IgmpMessage> {
        self.frames()
            .into_iter()
            .filter(|(cp, _)| cp.device.as_str() == device && cp.port == port)
            .map(|(_, frame)| protocols::decode(&frame).unwrap().message)
            .collect()
    }
}

impl PacketTransport for RecordingTransport {
    fn emit(&self, out: &ConnectPoint, frame: Vec<u8>) -> Result<(), TransportError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::QueueFull(out.clone()));
        }
        self.frames.lock().unwrap().push((out.clone(), frame));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingFlows {
    intents: Mutex<Vec<ForwardingIntent>>,
}

impl RecordingFlows {
    pub fn intents(&self) -> Vec<ForwardingIntent> {
        self.intents.lock().unwrap().clone()
    }

    pub fn count(&self, action: FlowAction) -> usize {
        self.intents()
            .iter()
            .filter(|intent| intent.action == action)
            .count()
    }
}

impl FlowService for RecordingFlows {
    fn apply(&self, intent: ForwardingIntent) {
        self.intents.lock().unwrap().push(intent);
    }
}

pub struct SwitchableMastership {
    master: AtomicBool,
}

impl SwitchableMastership {
    pub fn set(&self, master: bool) {
        self.master.store(master, Ordering::SeqCst);
    }
}

impl MastershipService for SwitchableMastership {
    fn is_local_master(&self, _device: &DeviceId) -> bool {
        self.master.load(Ordering::SeqCst)
    }
}

/// Upstream messages reduced to what the assertions care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Join(Ipv4Addr, Vec<Ipv4Addr>),
    Leave(Ipv4Addr),
    Block(Ipv4Addr, Vec<Ipv4Addr>),
    Include(Ipv4Addr, Vec<Ipv4Addr>),
    Current(Ipv4Addr, Vec<Ipv4Addr>),
    Other(String),
}

fn classify(message: IgmpMessage) -> Vec<Upstream> {
    use igmp_proxy::protocols::RecordType::*;
    match message {
        IgmpMessage::Leave { group } => vec![Upstream::Leave(group)],
        IgmpMessage::Report { records, .. } => records
            .into_iter()
            .map(|r| match r.record_type {
                ChangeToExcludeMode | AllowNewSources => Upstream::Join(r.group, r.sources),
                ChangeToIncludeMode if r.sources.is_empty() => Upstream::Leave(r.group),
                ChangeToIncludeMode => Upstream::Include(r.group, r.sources),
                BlockOldSources => Upstream::Block(r.group, r.sources),
                ModeIsInclude | ModeIsExclude => Upstream::Current(r.group, r.sources),
            })
            .collect(),
        other => vec![Upstream::Other(other.type_name().to_string())],
    }
}

pub struct Harness {
    pub proxy: Arc<IgmpProxy>,
    pub transport: Arc<RecordingTransport>,
    pub flows: Arc<RecordingFlows>,
    pub mastership: Arc<SwitchableMastership>,
    pub logs: Arc<MemorySink>,
    pub start: Instant,
}

pub fn config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config
        .devices
        .insert(DEVICE.to_string(), DeviceConfig::new(UPLINK));
    config
}

pub fn pod_config() -> ProxyConfig {
    ProxyConfig {
        igmp_on_pod_basis: true,
        ..config()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: ProxyConfig) -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let flows = Arc::new(RecordingFlows::default());
        let mastership = Arc::new(SwitchableMastership {
            master: AtomicBool::new(true),
        });
        let (logger, logs) = Logger::memory();
        let proxy = Arc::new(IgmpProxy::new(
            Collaborators {
                transport: transport.clone(),
                flows: flows.clone(),
                mastership: mastership.clone(),
            },
            logger,
        ));
        let start = Instant::now();
        proxy.activate_at(config, start).unwrap();

        Self {
            proxy,
            transport,
            flows,
            mastership,
            logs,
            start,
        }
    }

    pub fn at(&self, millis: u64) -> Instant {
        self.start + Duration::from_millis(millis)
    }

    pub fn ctx(&self, port: PortNumber) -> PacketContext {
        PacketContext::new(DEVICE, port, 0)
    }

    pub fn receive(&self, ctx: &PacketContext, frame: &[u8], millis: u64) -> PacketDisposition {
        self.proxy
            .handle_inbound_packet_at(ctx, frame, self.at(millis))
    }

    pub fn send_on(&self, port: PortNumber, frame: &[u8], millis: u64) -> PacketDisposition {
        self.receive(&self.ctx(port), frame, millis)
    }

    pub fn tick(&self, millis: u64) -> usize {
        self.proxy.handle_query_timer_tick_at(self.at(millis))
    }

    /// Upstream traffic on the default device's uplink, in order
    pub fn upstream(&self) -> Vec<Upstream> {
        self.upstream_of(DEVICE)
    }

    pub fn upstream_of(&self, device: &str) -> Vec<Upstream> {
        self.transport
            .messages_on(device, UPLINK)
            .into_iter()
            .flat_map(classify)
            .collect()
    }

    /// Queries sent toward a subscriber port
    pub fn queries_on(&self, port: PortNumber) -> Vec<IgmpMessage> {
        self.transport
            .messages_on(DEVICE, port)
            .into_iter()
            .filter(|m| matches!(m, IgmpMessage::Query { .. }))
            .collect()
    }

    pub fn table_len(&self) -> usize {
        self.proxy.snapshot().len()
    }
}

pub fn v3_report(records: Vec<GroupRecord>) -> Vec<u8> {
    let payload = IgmpV3ReportBuilder::new(records).build();
    build_frame(
        SUBSCRIBER_MAC,
        ip("192.168.1.10"),
        IGMPV3_ALL_ROUTERS_GROUP,
        None,
        &payload,
    )
}

/// v3 join: EXCLUDE {} for any-source, ALLOW {s} otherwise
pub fn v3_join(group: &str, source: Option<&str>) -> Vec<u8> {
    v3_report(vec![GroupRecord::join(ip(group), source.map(ip))])
}

/// v3 leave: TO_IN {} for the group, BLOCK {s} for one source
pub fn v3_leave(group: &str, source: Option<&str>) -> Vec<u8> {
    let record = match source {
        Some(s) => GroupRecord::block(ip(group), ip(s)),
        None => GroupRecord::leave(ip(group)),
    };
    v3_report(vec![record])
}

pub fn v2_report(group: &str) -> Vec<u8> {
    let payload = IgmpV2MessageBuilder::report(ip(group)).build();
    build_frame(SUBSCRIBER_MAC, ip("192.168.1.10"), ip(group), None, &payload)
}

pub fn v2_leave(group: &str) -> Vec<u8> {
    let payload = IgmpV2MessageBuilder::leave(ip(group)).build();
    build_frame(SUBSCRIBER_MAC, ip("192.168.1.10"), ALL_ROUTERS_GROUP, None, &payload)
}

/// Query from the multicast router; `group == None` is a general query
pub fn query(version: IgmpVersion, group: Option<&str>, max_resp: Duration) -> Vec<u8> {
    let (builder, dst) = match group {
        Some(g) => (
            IgmpQueryBuilder::group_specific_query(version, ip(g), max_resp),
            ip(g),
        ),
        None => (
            IgmpQueryBuilder::general_query(version, max_resp),
            ALL_SYSTEMS_GROUP,
        ),
    };
    build_frame(ROUTER_MAC, ip("10.0.0.254"), dst, None, &builder.build())
}
