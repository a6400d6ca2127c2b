//! Queue-backed smoltcp device
//!
//! The smoltcp interface reads and writes whole IP packets against two
//! in-memory queues; the reactor moves packets between these queues and
//! the tunnel-facing channels.

use std::collections::VecDeque;

use smoltcp::phy::{Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;

/// Maximum packets parked in either queue before the oldest are dropped.
const QUEUE_LIMIT: usize = 512;

pub(crate) struct ChannelDevice {
    mtu: usize,
    /// Packets injected from the tunnel, waiting to enter the stack
    ingress: VecDeque<Vec<u8>>,
    /// Packets emitted by the stack, waiting to leave towards the tunnel
    egress: VecDeque<Vec<u8>>,
}

impl ChannelDevice {
    pub(crate) fn new(mtu: usize) -> Self {
        Self {
            mtu,
            ingress: VecDeque::new(),
            egress: VecDeque::new(),
        }
    }

    pub(crate) fn enqueue_ingress(&mut self, pkt: Vec<u8>) {
        if self.ingress.len() >= QUEUE_LIMIT {
            self.ingress.pop_front();
        }
        self.ingress.push_back(pkt);
    }

    pub(crate) fn pop_egress(&mut self) -> Option<Vec<u8>> {
        self.egress.pop_front()
    }

    pub(crate) fn requeue_egress(&mut self, pkt: Vec<u8>) {
        self.egress.push_front(pkt);
    }

    pub(crate) fn has_egress(&self) -> bool {
        !self.egress.is_empty()
    }
}

impl Device for ChannelDevice {
    type RxToken<'a> = RxToken
    where
        Self: 'a;
    type TxToken<'a> = TxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let pkt = self.ingress.pop_front()?;
        Some((
            RxToken(pkt),
            TxToken {
                queue: &mut self.egress,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        if self.egress.len() >= QUEUE_LIMIT {
            return None;
        }
        Some(TxToken {
            queue: &mut self.egress,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

pub(crate) struct RxToken(Vec<u8>);

impl smoltcp::phy::RxToken for RxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.0)
    }
}

pub(crate) struct TxToken<'a> {
    queue: &'a mut VecDeque<Vec<u8>>,
}

impl smoltcp::phy::TxToken for TxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut pkt = vec![0u8; len];
        let result = f(&mut pkt);
        self.queue.push_back(pkt);
        result
    }
}
