//! UDP: port demultiplexing and the datagram socket API.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};

use log::trace;

use crate::config::MAX_UDP_SOCKETS;
use crate::error::{Error, Result};
use crate::ipv4::{ip_build_xmit, InetProtocol, Ipv4Stack, PayloadSource};
use crate::skb::RtSkb;
use crate::wire::{
    udp_emit_header, udp_ports, IpProtocol, Ipv4Address, Ipv4Packet, UdpDatagram,
    UDP_HEADER_LEN,
};

use super::{RxCallback, Socket};

const EPHEMERAL_BASE: u16 = 1024;

struct PortEntry {
    port: u16,
    sock: Arc<Socket>,
}

/// The UDP protocol: the bound-port table and the receive path.
pub struct Udp {
    ports: RwLock<heapless::Vec<PortEntry, MAX_UDP_SOCKETS>>,
    next_ephemeral: AtomicU16,
}

impl Udp {
    pub fn new() -> Arc<Udp> {
        Arc::new(Udp {
            ports: RwLock::new(heapless::Vec::new()),
            next_ephemeral: AtomicU16::new(EPHEMERAL_BASE),
        })
    }

    fn register(&self, sock: &Arc<Socket>, addr: Ipv4Address, port: u16) -> Result<u16> {
        let mut ports = self.ports.write().unwrap();
        let port = if port != 0 {
            if ports.iter().any(|entry| entry.port == port) {
                return Err(Error::Exists);
            }
            port
        } else {
            // Pick a free ephemeral port.
            let mut candidate;
            let mut tries = 0;
            loop {
                candidate = self.next_ephemeral.fetch_add(1, Ordering::Relaxed);
                if candidate < EPHEMERAL_BASE {
                    candidate = EPHEMERAL_BASE;
                }
                if !ports.iter().any(|entry| entry.port == candidate) {
                    break;
                }
                tries += 1;
                if tries > u16::MAX as u32 {
                    return Err(Error::Busy);
                }
            }
            candidate
        };

        ports
            .push(PortEntry {
                port,
                sock: sock.clone(),
            })
            .map_err(|_| Error::Busy)?;

        let mut binding = sock.binding.write().unwrap();
        binding.local_addr = addr;
        binding.local_port = port;
        Ok(port)
    }

    fn unregister(&self, sock: &Arc<Socket>) {
        self.ports
            .write()
            .unwrap()
            .retain(|entry| !Arc::ptr_eq(&entry.sock, sock));
    }
}

impl InetProtocol for Udp {
    fn protocol(&self) -> IpProtocol {
        IpProtocol::Udp
    }

    /// Match destination IP (local, broadcast for `INADDR_ANY`-bound
    /// sockets) and port; a connected socket additionally filters on the
    /// datagram's source.
    fn dest_socket(&self, skb: &RtSkb) -> Option<Arc<Socket>> {
        let header = Ipv4Packet::new_unchecked(skb.network_header());
        let (src_addr, dst_addr) = (header.src_addr(), header.dst_addr());
        let (src_port, dst_port) = udp_ports(skb.data()).ok()?;

        let ports = self.ports.read().unwrap();
        ports
            .iter()
            .find(|entry| {
                if entry.port != dst_port {
                    return false;
                }
                let binding = entry.sock.binding.read().unwrap();
                let addr_ok =
                    binding.local_addr.is_unspecified() || binding.local_addr == dst_addr;
                let peer_ok = !binding.connected
                    || (binding.remote_addr == src_addr && binding.remote_port == src_port);
                addr_ok && peer_ok
            })
            .map(|entry| entry.sock.clone())
    }

    fn rcv(&self, skb: RtSkb, sock: &Arc<Socket>) {
        let header = Ipv4Packet::new_unchecked(skb.network_header());
        let (src, dst) = (header.src_addr(), header.dst_addr());
        if UdpDatagram::parse(skb.data(), &src, &dst).is_err() {
            trace!("invalid UDP datagram from {src}, dropping");
            return;
        }
        sock.deliver(skb);
    }
}

/// An outgoing header plus borrowed payload, emitted fragment-wise on
/// transmit.
struct Outbound<'a> {
    header: [u8; UDP_HEADER_LEN],
    payload: &'a [u8],
}

impl<'a> Outbound<'a> {
    fn new(
        src_port: u16,
        dst_port: u16,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        payload: &'a [u8],
    ) -> Outbound<'a> {
        Outbound {
            header: udp_emit_header(src_port, dst_port, &src_addr, &dst_addr, payload),
            payload,
        }
    }
}

impl PayloadSource for Outbound<'_> {
    fn total_len(&self) -> usize {
        UDP_HEADER_LEN + self.payload.len()
    }

    fn emit(&self, offset: usize, out: &mut [u8]) {
        let mut at = offset;
        let mut written = 0;
        if at < UDP_HEADER_LEN {
            let take = (UDP_HEADER_LEN - at).min(out.len());
            out[..take].copy_from_slice(&self.header[at..at + take]);
            written = take;
            at += take;
        }
        if written < out.len() {
            let from = at - UDP_HEADER_LEN;
            let remaining = out.len() - written;
            out[written..].copy_from_slice(&self.payload[from..from + remaining]);
        }
    }
}

/// A datagram socket.
pub struct UdpSocket {
    sock: Arc<Socket>,
    udp: Arc<Udp>,
    ipv4: Arc<Ipv4Stack>,
}

impl UdpSocket {
    pub(crate) fn new(udp: Arc<Udp>, ipv4: Arc<Ipv4Stack>, sock: Arc<Socket>) -> UdpSocket {
        UdpSocket { sock, udp, ipv4 }
    }

    /// Bind to a local address and port; port 0 picks an ephemeral one.
    pub fn bind(&self, addr: Ipv4Address, port: u16) -> Result<u16> {
        if self.sock.binding.read().unwrap().local_port != 0 {
            return Err(Error::Busy);
        }
        self.udp.register(&self.sock, addr, port)
    }

    /// Fix the remote endpoint; subsequent receives filter on it.
    pub fn connect(&self, addr: Ipv4Address, port: u16) -> Result<()> {
        if self.sock.binding.read().unwrap().local_port == 0 {
            self.udp.register(&self.sock, Ipv4Address::UNSPECIFIED, 0)?;
        }
        let mut binding = self.sock.binding.write().unwrap();
        binding.remote_addr = addr;
        binding.remote_port = port;
        binding.connected = true;
        Ok(())
    }

    /// Send a datagram to an explicit destination.
    pub fn send_to(&self, payload: &[u8], addr: Ipv4Address, port: u16) -> Result<usize> {
        if port == 0 {
            return Err(Error::BadParam);
        }
        if self.sock.binding.read().unwrap().local_port == 0 {
            self.udp.register(&self.sock, Ipv4Address::UNSPECIFIED, 0)?;
        }
        let binding = *self.sock.binding.read().unwrap();

        let route = self.ipv4.routes.output_route(addr)?;
        let src_addr = if binding.local_addr.is_unspecified() {
            route.dev.local_ip()
        } else {
            binding.local_addr
        };

        let datagram = Outbound::new(binding.local_port, port, src_addr, addr, payload);
        ip_build_xmit(
            &self.ipv4,
            self.sock.pool(),
            &route,
            src_addr,
            addr,
            IpProtocol::Udp,
            self.sock.priority(),
            &datagram,
        )?;
        Ok(payload.len())
    }

    /// Send to the connected remote endpoint.
    pub fn send(&self, payload: &[u8]) -> Result<usize> {
        let binding = *self.sock.binding.read().unwrap();
        if !binding.connected {
            return Err(Error::BadParam);
        }
        self.send_to(payload, binding.remote_addr, binding.remote_port)
    }

    /// Receive one datagram, blocking per the socket timeout. Returns the
    /// copied length and the sender's endpoint.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, (Ipv4Address, u16))> {
        loop {
            if let Some(skb) = self.sock.dequeue() {
                let header = Ipv4Packet::new_unchecked(skb.network_header());
                let (src_addr, dst_addr) = (header.src_addr(), header.dst_addr());
                // Queued datagrams were validated on the receive path.
                let Ok(datagram) = UdpDatagram::parse(skb.data(), &src_addr, &dst_addr)
                else {
                    continue;
                };
                let n = datagram.payload.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram.payload[..n]);
                return Ok((n, (src_addr, datagram.src_port)));
            }
            self.sock.wait_rx()?;
        }
    }

    /// Receive from the connected remote endpoint.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let (n, _) = self.recv_from(buf)?;
        Ok(n)
    }

    pub fn local_port(&self) -> u16 {
        self.sock.binding.read().unwrap().local_port
    }

    /// Receive timeout in nanoseconds: 0 infinite, positive relative,
    /// negative non-blocking.
    pub fn set_timeout(&self, ns: i64) {
        self.sock.set_timeout(ns);
    }

    pub fn set_priority(&self, priority: u8) {
        self.sock.set_priority(priority);
    }

    pub fn set_callback(&self, callback: Option<Box<RxCallback>>) {
        self.sock.set_callback(callback);
    }

    pub fn extend_pool(&self, count: usize) -> usize {
        self.sock.extend_pool(count)
    }

    pub fn shrink_pool(&self, count: usize) -> usize {
        self.sock.shrink_pool(count)
    }

    /// Datagrams dropped on the receive path for want of buffers.
    pub fn rx_dropped(&self) -> u64 {
        self.sock.rx_dropped()
    }

    pub fn pool_stats(&self) -> crate::skb::PoolStats {
        self.sock.pool().stats()
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.udp.unregister(&self.sock);
        self.sock.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_emit_is_offset_stable() {
        let src = Ipv4Address::new(10, 0, 0, 1);
        let dst = Ipv4Address::new(10, 0, 0, 2);
        let payload: Vec<u8> = (0..64u8).collect();
        let outbound = Outbound::new(1000, 2000, src, dst, &payload);

        // Emitting in two chunks must equal emitting at once.
        let total = outbound.total_len();
        let mut whole = vec![0u8; total];
        outbound.emit(0, &mut whole);

        let mut parts = vec![0u8; total];
        let split = 13;
        outbound.emit(0, &mut parts[..split]);
        outbound.emit(split, &mut parts[split..]);
        assert_eq!(whole, parts);

        // And the emitted datagram checks out end to end.
        let datagram = UdpDatagram::parse(&whole, &src, &dst).unwrap();
        assert_eq!(datagram.src_port, 1000);
        assert_eq!(datagram.dst_port, 2000);
        assert_eq!(datagram.payload, &payload[..]);
    }

    #[test]
    fn port_registration_conflicts() {
        let udp = Udp::new();
        let a = Socket::new(1, 256);
        let b = Socket::new(1, 256);
        assert_eq!(
            udp.register(&a, Ipv4Address::UNSPECIFIED, 37000).unwrap(),
            37000
        );
        assert_eq!(
            udp.register(&b, Ipv4Address::UNSPECIFIED, 37000),
            Err(Error::Exists)
        );
        let ephemeral = udp.register(&b, Ipv4Address::UNSPECIFIED, 0).unwrap();
        assert!(ephemeral >= EPHEMERAL_BASE);
        udp.unregister(&a);
        let c = Socket::new(1, 256);
        assert!(udp.register(&c, Ipv4Address::UNSPECIFIED, 37000).is_ok());
    }
}
