//! Address resolution for IPv4-over-Ethernet.
//!
//! Incoming replies and requests feed the host-route table; requests for
//! one of our addresses are answered. `solicit` broadcasts a request for
//! an unresolved host and is wired into the route table's miss hook.

use std::sync::Arc;

use log::{debug, trace};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::skb::{Pool, RtSkb};
use crate::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetProtocol, Ipv4Address,
    ETHERNET_HEADER_LEN,
};

use super::route::RouteTable;

pub struct Arp {
    pool: Pool,
}

impl Arp {
    pub fn new(pool: Pool) -> Arp {
        Arp { pool }
    }

    /// Broadcast a who-has request for `target` out of `dev`.
    pub fn solicit(&self, dev: &Arc<Device>, target: Ipv4Address) -> Result<()> {
        let repr = ArpRepr {
            operation: ArpOperation::Request,
            source_hardware_addr: dev.hwaddr(),
            source_protocol_addr: dev.local_ip(),
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: target,
        };
        trace!("soliciting {target} on {}", dev.name());
        self.xmit(dev, EthernetAddress::BROADCAST, &repr)
    }

    /// The layer-3 receive entry for ARP frames. Consumes the skb.
    pub fn rcv(&self, routes: &RouteTable, skb: RtSkb) {
        let Some(dev) = skb.dev.clone() else {
            return;
        };
        let Ok(packet) = ArpPacket::new_checked(skb.data()) else {
            return;
        };
        let Ok(repr) = ArpRepr::parse(&packet) else {
            return;
        };

        // Learn the sender's mapping regardless of operation; ARP is only
        // spoken between configured stations here.
        if !repr.source_protocol_addr.is_unspecified() {
            let _ = routes.add_host(repr.source_protocol_addr, repr.source_hardware_addr, dev.clone());
        }

        if repr.operation == ArpOperation::Request
            && repr.target_protocol_addr == dev.local_ip()
        {
            debug!(
                "answering ARP request for {} from {}",
                repr.target_protocol_addr, repr.source_protocol_addr
            );
            let reply = ArpRepr {
                operation: ArpOperation::Reply,
                source_hardware_addr: dev.hwaddr(),
                source_protocol_addr: dev.local_ip(),
                target_hardware_addr: repr.source_hardware_addr,
                target_protocol_addr: repr.source_protocol_addr,
            };
            let _ = self.xmit(&dev, repr.source_hardware_addr, &reply);
        }
    }

    fn xmit(&self, dev: &Arc<Device>, dst: EthernetAddress, repr: &ArpRepr) -> Result<()> {
        let headroom = (ETHERNET_HEADER_LEN + 15) & !15;
        let mut skb = self
            .pool
            .alloc(headroom + repr.buffer_len())
            .ok_or(Error::NoBufs)?;
        skb.reserve(headroom);
        repr.emit(&mut ArpPacket::new_unchecked(skb.put(repr.buffer_len())));
        dev.fill_eth_header(&mut skb, dst, EthernetProtocol::Arp);
        dev.start_xmit(skb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device;
    use crate::stack::StackManager;

    #[test]
    fn request_for_us_is_answered_and_learned() {
        let manager = StackManager::new(8);
        let dev = crate::drivers::Loopback::device();
        dev.stack_connect(manager.rx_handle());
        dev.set_ipv4(Ipv4Address::new(10, 0, 0, 1), Ipv4Address::new(10, 255, 255, 255));

        let pool = Pool::new(4, 512);
        let arp = Arp::new(pool.clone());
        let routes = RouteTable::new();

        // Hand-build a request as if it had arrived from a peer.
        let peer_hw = EthernetAddress([0x02, 0, 0, 0, 0, 9]);
        let peer_ip = Ipv4Address::new(10, 0, 0, 9);
        let mut skb = pool.alloc(512).unwrap();
        skb.reserve(ETHERNET_HEADER_LEN);
        let repr = ArpRepr {
            operation: ArpOperation::Request,
            source_hardware_addr: peer_hw,
            source_protocol_addr: peer_ip,
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: Ipv4Address::new(10, 0, 0, 1),
        };
        repr.emit(&mut ArpPacket::new_unchecked(skb.put(repr.buffer_len())));
        dev.fill_eth_header(&mut skb, EthernetAddress::BROADCAST, EthernetProtocol::Arp);
        device::eth_type_trans(&mut skb, &dev).unwrap();
        skb.dev = Some(dev.clone());

        arp.rcv(&routes, skb);

        let learned = routes.get_host(peer_ip).expect("sender learned");
        assert_eq!(learned.hwaddr, peer_hw);
        // A reply went out through the device.
        assert_eq!(
            dev.stats.tx_packets.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        manager.shutdown();
    }
}
