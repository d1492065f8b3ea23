//! The loopback device: every transmitted frame is received right back.

use std::sync::Arc;

use log::trace;

use crate::device::{self, flags, Device, DeviceConfig, Driver};
use crate::error::Result;
use crate::skb::RtSkb;
use crate::wire::EthernetAddress;

pub const LOOPBACK_MTU: usize = 1500;

/// A driver that immediately re-injects transmitted frames into the
/// receive path.
pub struct Loopback;

impl Loopback {
    /// Build the loopback device, conventionally named `rtlo`.
    pub fn device() -> Arc<Device> {
        Device::new(
            DeviceConfig {
                name: "rtlo".into(),
                hwaddr: EthernetAddress([0; 6]),
                mtu: LOOPBACK_MTU,
                flags: flags::IFF_LOOPBACK,
                features: 0,
            },
            Box::new(Loopback),
        )
    }
}

impl Driver for Loopback {
    fn open(&mut self, _dev: &Arc<Device>) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self, _dev: &Arc<Device>) -> Result<()> {
        Ok(())
    }

    fn hard_start_xmit(&mut self, mut skb: RtSkb, dev: &Arc<Device>) -> Result<()> {
        // Both the deliverable and the unclassifiable arm log, then release
        // the frame the same way.
        match device::eth_type_trans(&mut skb, dev) {
            Ok(()) => {
                trace!("rtlo: looping {} byte frame", skb.len());
                dev.netif_rx(skb);
            }
            Err(_) => {
                trace!("rtlo: dropping unclassifiable frame");
                drop(skb);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skb::{PacketKind, Pool};
    use crate::stack::StackManager;
    use crate::wire::{EthernetProtocol, ETHERNET_HEADER_LEN};

    #[test]
    fn xmit_loops_back_to_stack_ring() {
        let manager = StackManager::new(8);
        let dev = Loopback::device();
        dev.stack_connect(manager.rx_handle());

        let pool = Pool::new(2, 256);
        let mut skb = pool.alloc(256).unwrap();
        skb.reserve(ETHERNET_HEADER_LEN);
        skb.put(4).copy_from_slice(b"ping");
        dev.fill_eth_header(&mut skb, dev.hwaddr(), EthernetProtocol::Ipv4);

        dev.hard_xmit(skb).unwrap();

        // Not spawned: the frame sits in the ring; drain it by hand.
        manager.spawn();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        while pool.stats().free != 2 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::yield_now();
        }
        assert_eq!(dev.stats.tx_packets.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(dev.stats.rx_packets.load(std::sync::atomic::Ordering::Relaxed), 1);
        manager.shutdown();
        dev.stack_disconnect();
    }

    #[test]
    fn loopback_frame_is_addressed_to_host() {
        let dev = Loopback::device();
        let pool = Pool::new(1, 128);
        let mut skb = pool.alloc(128).unwrap();
        skb.reserve(ETHERNET_HEADER_LEN);
        skb.put(1);
        dev.fill_eth_header(&mut skb, dev.hwaddr(), EthernetProtocol::Ipv4);

        device::eth_type_trans(&mut skb, &dev).unwrap();
        assert_eq!(skb.pkt_type, PacketKind::Host);
    }
}
