// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Collaborators the proxy is handed at construction
//!
//! Packet I/O, flow programming and mastership live outside the proxy. The
//! binary wires in the channel-backed transport and the logging flow service
//! below; tests substitute recording doubles.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::logging::{Facility, Logger};
use crate::{log_info, ConnectPoint, DeviceId, FlowAction, ForwardingIntent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport queue full for {0}")]
    QueueFull(ConnectPoint),
    #[error("transport closed")]
    Closed,
    #[error("no route to {0}")]
    Unreachable(ConnectPoint),
}

/// Outbound frame injection
pub trait PacketTransport: Send + Sync {
    fn emit(&self, out: &ConnectPoint, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// Datapath forwarding programming
pub trait FlowService: Send + Sync {
    fn apply(&self, intent: ForwardingIntent);
}

/// Whether this instance owns a device
pub trait MastershipService: Send + Sync {
    fn is_local_master(&self, device: &DeviceId) -> bool;
}

/// Single-instance deployment: every device is ours
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysMaster;

impl MastershipService for AlwaysMaster {
    fn is_local_master(&self, _device: &DeviceId) -> bool {
        true
    }
}

/// Mastership over an explicit device set
#[derive(Debug, Default)]
pub struct StaticMastership {
    devices: RwLock<HashSet<DeviceId>>,
}

impl StaticMastership {
    pub fn new(devices: impl IntoIterator<Item = DeviceId>) -> Self {
        Self {
            devices: RwLock::new(devices.into_iter().collect()),
        }
    }

    pub fn grant(&self, device: DeviceId) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device);
    }

    pub fn revoke(&self, device: &DeviceId) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device);
    }
}

impl MastershipService for StaticMastership {
    fn is_local_master(&self, device: &DeviceId) -> bool {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(device)
    }
}

/// Frame queued for the packet I/O task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub out: ConnectPoint,
    pub frame: Vec<u8>,
}

/// Transport that hands frames to an I/O task over a bounded channel.
///
/// Emission never blocks; a full queue is reported as an error.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<OutboundFrame>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl PacketTransport for ChannelTransport {
    fn emit(&self, out: &ConnectPoint, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .try_send(OutboundFrame {
                out: out.clone(),
                frame,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(out.clone()),
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }
}

/// Flow service that only logs intents
#[derive(Debug, Clone)]
pub struct LoggingFlowService {
    logger: Logger,
}

impl LoggingFlowService {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl FlowService for LoggingFlowService {
    fn apply(&self, intent: ForwardingIntent) {
        let verb = match intent.action {
            FlowAction::Add => "add",
            FlowAction::Remove => "remove",
        };
        log_info!(
            self.logger,
            Facility::Proxy,
            &format!(
                "Forwarding {} {} on {}/{}",
                verb, intent.group, intent.device, intent.port
            )
        );
    }
}

/// Shared handles to every collaborator
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn PacketTransport>,
    pub flows: Arc<dyn FlowService>,
    pub mastership: Arc<dyn MastershipService>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_transport_delivers() {
        let (transport, mut rx) = ChannelTransport::new(1);
        let out = ConnectPoint::new(DeviceId::from("of:0001"), 10);
        transport.emit(&out, vec![1, 2, 3]).unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.out, out);
        assert_eq!(frame.frame, vec![1, 2, 3]);
    }

    #[test]
    fn test_channel_transport_full_and_closed() {
        let (transport, rx) = ChannelTransport::new(1);
        let out = ConnectPoint::new(DeviceId::from("of:0001"), 10);
        transport.emit(&out, vec![1]).unwrap();
        assert_eq!(
            transport.emit(&out, vec![2]),
            Err(TransportError::QueueFull(out.clone()))
        );

        drop(rx);
        assert_eq!(transport.emit(&out, vec![3]), Err(TransportError::Closed));
    }

    #[test]
    fn test_static_mastership() {
        let dev = DeviceId::from("of:0001");
        let mastership = StaticMastership::new([dev.clone()]);
        assert!(mastership.is_local_master(&dev));
        mastership.revoke(&dev);
        assert!(!mastership.is_local_master(&dev));
        mastership.grant(dev.clone());
        assert!(mastership.is_local_master(&dev));
        assert!(AlwaysMaster.is_local_master(&DeviceId::from("any")));
    }
}
