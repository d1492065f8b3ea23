//! Outgoing IPv4 packet construction.

use log::trace;

use crate::error::{Error, Result};
use crate::skb::Pool;
use crate::wire::{
    EthernetProtocol, IpProtocol, Ipv4Address, Ipv4Packet, ETHERNET_HEADER_LEN, IPV4_HEADER_LEN,
};

use super::route::HostRoute;
use super::Ipv4Stack;

/// Hardware headers start 16-byte aligned in the buffer.
fn eth_headroom() -> usize {
    (ETHERNET_HEADER_LEN + 15) & !15
}

/// The transport payload an IP transmission copies from, possibly in
/// several fragment-sized pieces.
pub trait PayloadSource {
    fn total_len(&self) -> usize;
    /// Copy `out.len()` bytes starting at `offset` into `out`.
    fn emit(&self, offset: usize, out: &mut [u8]);
}

impl PayloadSource for &[u8] {
    fn total_len(&self) -> usize {
        self.len()
    }
    fn emit(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self[offset..offset + out.len()]);
    }
}

/// Build and transmit one datagram along `route`, fragmenting on output
/// when it exceeds the effective MTU. Buffers come from `pool`; an empty
/// pool fails the send with [`Error::NoBufs`].
pub fn ip_build_xmit(
    ipv4: &Ipv4Stack,
    pool: &Pool,
    route: &HostRoute,
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    protocol: IpProtocol,
    priority: u8,
    source: &dyn PayloadSource,
) -> Result<()> {
    let dev = &route.dev;
    let src_addr = if src_addr.is_unspecified() {
        dev.local_ip()
    } else {
        src_addr
    };
    let mtu = dev.mtu_for(priority);
    let total = source.total_len();
    let ident = ipv4.next_ident();

    if IPV4_HEADER_LEN + total <= mtu {
        return xmit_one(
            ipv4, pool, route, src_addr, dst_addr, protocol, priority, ident, source, 0, total,
            false,
        );
    }

    // Fragment on output: every piece but the last carries MF and a
    // multiple-of-eight payload.
    let frag_unit = (mtu - IPV4_HEADER_LEN) & !7;
    if frag_unit == 0 {
        return Err(Error::BadParam);
    }
    trace!("fragmenting {total} byte datagram into {frag_unit} byte units");

    let mut offset = 0;
    while offset < total {
        let chunk = frag_unit.min(total - offset);
        let more = offset + chunk < total;
        xmit_one(
            ipv4, pool, route, src_addr, dst_addr, protocol, priority, ident, source, offset,
            chunk, more,
        )?;
        offset += chunk;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn xmit_one(
    _ipv4: &Ipv4Stack,
    pool: &Pool,
    route: &HostRoute,
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    protocol: IpProtocol,
    priority: u8,
    ident: u16,
    source: &dyn PayloadSource,
    offset: usize,
    len: usize,
    more_frags: bool,
) -> Result<()> {
    let dev = &route.dev;
    let size = eth_headroom() + IPV4_HEADER_LEN + len;
    let mut skb = pool.alloc(size).ok_or(Error::NoBufs)?;
    skb.reserve(eth_headroom());
    skb.priority = priority;

    {
        let buf = skb.put(IPV4_HEADER_LEN + len);
        let mut packet = Ipv4Packet::new_unchecked(&mut buf[..]);
        packet.set_version(4);
        packet.set_header_len(IPV4_HEADER_LEN as u8);
        packet.set_dscp_ecn(0);
        packet.set_total_len((IPV4_HEADER_LEN + len) as u16);
        packet.set_ident(ident);
        packet.clear_flags();
        packet.set_more_frags(more_frags);
        packet.set_frag_offset(offset as u16);
        packet.set_hop_limit(255);
        packet.set_next_header(protocol);
        packet.set_src_addr(src_addr);
        packet.set_dst_addr(dst_addr);
        packet.fill_checksum();
        source.emit(offset, packet.payload_mut());
    }
    skb.mark_network_header();

    dev.fill_eth_header(&mut skb, route.hwaddr, EthernetProtocol::Ipv4);
    dev.start_xmit(skb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::Loopback;
    use crate::skb::RtSkb;
    use crate::stack::StackManager;
    use crate::wire::EthernetAddress;
    use std::sync::{Arc, Mutex};

    /// Capture frames the loopback would deliver, as the stack manager
    /// task would see them.
    fn capture() -> (StackManager, Arc<Mutex<Vec<Vec<u8>>>>) {
        let manager = StackManager::new(32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        manager
            .packet_types()
            .add_pack(crate::stack::PacketType::new(
                EthernetProtocol::Ipv4,
                "capture",
                Box::new(move |skb: RtSkb| {
                    record.lock().unwrap().push(skb.data().to_vec());
                    Ok(())
                }),
            ))
            .unwrap();
        manager.spawn();
        (manager, seen)
    }

    fn wait_for(seen: &Arc<Mutex<Vec<Vec<u8>>>>, count: usize) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        while seen.lock().unwrap().len() < count {
            assert!(std::time::Instant::now() < deadline, "frames not delivered");
            std::thread::yield_now();
        }
    }

    #[test]
    fn single_packet_and_fragmented_output() {
        let (manager, seen) = capture();
        let dev = Loopback::device();
        dev.stack_connect(manager.rx_handle());
        dev.set_ipv4(
            Ipv4Address::new(10, 0, 0, 1),
            Ipv4Address::new(10, 255, 255, 255),
        );

        let pool = Pool::new(8, 2048);
        let ipv4 = Ipv4Stack::new(pool.clone());
        let route = HostRoute {
            addr: Ipv4Address::new(10, 0, 0, 1),
            hwaddr: EthernetAddress([0; 6]),
            dev: dev.clone(),
        };

        let small = vec![0xa5u8; 100];
        ip_build_xmit(
            &ipv4,
            &pool,
            &route,
            Ipv4Address::UNSPECIFIED,
            Ipv4Address::new(10, 0, 0, 1),
            IpProtocol::Udp,
            16,
            &&small[..],
        )
        .unwrap();
        wait_for(&seen, 1);
        {
            let frames = seen.lock().unwrap();
            let packet = Ipv4Packet::new_checked(&frames[0][..]).unwrap();
            assert!(!packet.is_fragment());
            assert_eq!(packet.src_addr(), Ipv4Address::new(10, 0, 0, 1));
            assert_eq!(packet.payload().len(), 100);
        }

        let big = vec![0x5au8; 4000];
        ip_build_xmit(
            &ipv4,
            &pool,
            &route,
            Ipv4Address::UNSPECIFIED,
            Ipv4Address::new(10, 0, 0, 1),
            IpProtocol::Udp,
            16,
            &&big[..],
        )
        .unwrap();
        // Loopback MTU 1500 leaves 1480-byte fragment units.
        let expected = 4000usize.div_ceil(1480);
        wait_for(&seen, 1 + expected);
        {
            let frames = seen.lock().unwrap();
            let mut received = 0;
            for frame in frames.iter().skip(1) {
                let packet = Ipv4Packet::new_checked(&frame[..]).unwrap();
                assert!(packet.is_fragment());
                assert_eq!(packet.ident(), {
                    let first = Ipv4Packet::new_checked(&frames[1][..]).unwrap();
                    first.ident()
                });
                received += packet.payload().len();
            }
            assert_eq!(received, 4000);
            let last = Ipv4Packet::new_checked(&frames.last().unwrap()[..]).unwrap();
            assert!(!last.more_frags());
        }

        manager.shutdown();
        dev.stack_disconnect();
        // Everything transmitted was released back to the pool.
        assert_eq!(pool.stats().free, 8);
    }

    #[test]
    fn empty_pool_reports_nobufs() {
        let dev = Loopback::device();
        let pool = Pool::new(0, 2048);
        let ipv4 = Ipv4Stack::new(pool.clone());
        let route = HostRoute {
            addr: Ipv4Address::new(10, 0, 0, 1),
            hwaddr: EthernetAddress([0; 6]),
            dev,
        };
        let data = [0u8; 8];
        assert_eq!(
            ip_build_xmit(
                &ipv4,
                &pool,
                &route,
                Ipv4Address::UNSPECIFIED,
                Ipv4Address::new(10, 0, 0, 1),
                IpProtocol::Udp,
                16,
                &&data[..],
            ),
            Err(Error::NoBufs)
        );
    }
}
