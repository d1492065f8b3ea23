//! Incoming IPv4 packet processing.

use std::sync::Arc;

use log::trace;

use crate::skb::{PacketKind, RtSkb};
use crate::wire::Ipv4Packet;

use super::Ipv4Stack;

/// Validate and deliver one received IPv4 packet. Always consumes the skb.
pub(super) fn ip_rcv(ipv4: &Arc<Ipv4Stack>, mut skb: RtSkb) {
    // Frames for other stations reach us in promiscuous mode only; do not
    // try to analyse them.
    if skb.pkt_type == PacketKind::OtherHost {
        return;
    }

    // RFC 1122, 3.2.1.2: silently discard any datagram failing header
    // validation: header present and version 4, checksum correct, stated
    // total length plausible.
    let (header_len, total_len, dst_addr) = {
        let Ok(packet) = Ipv4Packet::new_checked(skb.data()) else {
            return;
        };
        if packet.version() != 4 || !packet.verify_checksum() {
            return;
        }
        let total_len = packet.total_len() as usize;
        if skb.len() < total_len || total_len < packet.header_len() as usize {
            return;
        }
        (packet.header_len() as usize, total_len, packet.dst_addr())
    };
    skb.trim(total_len);

    let local = {
        let dev = skb.dev.as_ref();
        dev.map(|dev| {
            dst_addr == dev.local_ip()
                || dst_addr == dev.broadcast_ip()
                || dst_addr.is_broadcast()
                || dev.flags() & crate::device::flags::IFF_LOOPBACK != 0
        })
        .unwrap_or(true)
    };
    if !local {
        let router = ipv4.router().read().unwrap();
        if let Some(hook) = router.as_ref() {
            match hook(skb, dst_addr) {
                Ok(()) => return,
                Err(returned) => skb = returned,
            }
        }
    }

    local_deliver(ipv4, skb, header_len);
}

fn local_deliver(ipv4: &Arc<Ipv4Stack>, mut skb: RtSkb, header_len: usize) {
    let (protocol, is_fragment) = {
        let packet = Ipv4Packet::new_unchecked(skb.data());
        (packet.next_header(), packet.is_fragment())
    };

    let Some(ipprot) = ipv4.get_protocol(protocol) else {
        trace!("no handler for IP protocol {protocol}");
        return;
    };

    // Point past the header; the network header stays recorded on the skb.
    skb.pull(header_len);

    let skb = if is_fragment {
        match ipv4.fragments().defrag(skb) {
            Some(reassembled) => reassembled,
            None => return,
        }
    } else {
        skb
    };

    let Some(sock) = ipprot.dest_socket(&skb) else {
        trace!("no destination socket for {protocol} datagram");
        return;
    };

    // Donate the skb to the socket at the expense of its pool, keeping the
    // receive pool's count intact.
    let mut skb = skb;
    if skb.acquire(sock.pool()).is_err() {
        trace!("socket pool exhausted, dropping {protocol} datagram");
        return;
    }

    ipprot.rcv(skb, &sock);
}
