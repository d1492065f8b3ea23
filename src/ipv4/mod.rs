//! The IPv4 layer: input validation, local delivery, reassembly, routed
//! output, and the layer-4 protocol registry.

pub mod arp;
pub mod fragment;
mod input;
mod output;
pub mod route;

pub use self::output::{ip_build_xmit, PayloadSource};
pub use self::route::{HostRoute, NetRoute, RouteTable};

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::MAX_INET_PROTOCOLS;
use crate::error::{Error, Result};
use crate::skb::{Pool, RtSkb};
use crate::socket::Socket;
use crate::wire::IpProtocol;

/// A transport protocol able to receive from the IPv4 layer.
///
/// `dest_socket` peeks at a validated packet (payload at the transport
/// header, network header recorded on the skb) and names the receiving
/// socket; the caller then transfers the skb into that socket's pool and
/// invokes `rcv`.
pub trait InetProtocol: Send + Sync {
    fn protocol(&self) -> IpProtocol;
    fn dest_socket(&self, skb: &RtSkb) -> Option<Arc<Socket>>;
    fn rcv(&self, skb: RtSkb, sock: &Arc<Socket>);
}

fn proto_hash(protocol: IpProtocol) -> usize {
    (u8::from(protocol) as usize) & (MAX_INET_PROTOCOLS - 1)
}

/// Optional forwarding hook: consumes the packet or hands it back for
/// local delivery.
pub type RouterHook =
    dyn Fn(RtSkb, crate::wire::Ipv4Address) -> core::result::Result<(), RtSkb> + Send + Sync;

/// Per-stack IPv4 state.
pub struct Ipv4Stack {
    pub routes: RouteTable,
    frags: fragment::FragTable,
    protocols: [RwLock<Option<Arc<dyn InetProtocol>>>; MAX_INET_PROTOCOLS],
    router: RwLock<Option<Box<RouterHook>>>,
    ident: AtomicU16,
}

impl Ipv4Stack {
    /// `pool` backs fragment reassembly.
    pub fn new(pool: Pool) -> Ipv4Stack {
        Ipv4Stack {
            routes: RouteTable::new(),
            frags: fragment::FragTable::new(pool),
            protocols: core::array::from_fn(|_| RwLock::new(None)),
            router: RwLock::new(None),
            ident: AtomicU16::new(1),
        }
    }

    /// Register a transport protocol in its hash slot.
    pub fn add_protocol(&self, proto: Arc<dyn InetProtocol>) -> Result<()> {
        let mut slot = self.protocols[proto_hash(proto.protocol())].write().unwrap();
        if slot.is_some() {
            return Err(Error::Exists);
        }
        *slot = Some(proto);
        Ok(())
    }

    pub fn del_protocol(&self, protocol: IpProtocol) -> Result<()> {
        let mut slot = self.protocols[proto_hash(protocol)].write().unwrap();
        match slot.take() {
            Some(entry) if entry.protocol() == protocol => Ok(()),
            other => {
                *slot = other;
                Err(Error::NoEntry)
            }
        }
    }

    pub fn get_protocol(&self, protocol: IpProtocol) -> Option<Arc<dyn InetProtocol>> {
        let slot = self.protocols[proto_hash(protocol)].read().unwrap();
        slot.as_ref()
            .filter(|entry| entry.protocol() == protocol)
            .cloned()
    }

    /// Install the forwarding hook consulted for non-local packets.
    pub fn set_router_hook(&self, hook: Box<RouterHook>) {
        *self.router.write().unwrap() = Some(hook);
    }

    /// The reassembly table; exposed for sweeping and inspection.
    pub fn fragments(&self) -> &fragment::FragTable {
        &self.frags
    }

    pub(crate) fn router(&self) -> &RwLock<Option<Box<RouterHook>>> {
        &self.router
    }

    /// Next value for the identification header field.
    pub(crate) fn next_ident(&self) -> u16 {
        self.ident.fetch_add(1, Ordering::Relaxed)
    }

    /// The layer-3 receive entry; registered with the packet-type table.
    pub fn rcv(self: &Arc<Self>, skb: RtSkb) {
        input::ip_rcv(self, skb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProto(IpProtocol);

    impl InetProtocol for FakeProto {
        fn protocol(&self) -> IpProtocol {
            self.0
        }
        fn dest_socket(&self, _skb: &RtSkb) -> Option<Arc<Socket>> {
            None
        }
        fn rcv(&self, _skb: RtSkb, _sock: &Arc<Socket>) {}
    }

    #[test]
    fn protocol_registry() {
        let ipv4 = Ipv4Stack::new(Pool::new(1, 256));
        let udp: Arc<dyn InetProtocol> = Arc::new(FakeProto(IpProtocol::Udp));
        ipv4.add_protocol(udp.clone()).unwrap();
        assert_eq!(ipv4.add_protocol(udp).err(), Some(Error::Exists));
        assert!(ipv4.get_protocol(IpProtocol::Udp).is_some());
        assert!(ipv4.get_protocol(IpProtocol::Icmp).is_none());
        ipv4.del_protocol(IpProtocol::Udp).unwrap();
        assert_eq!(ipv4.del_protocol(IpProtocol::Udp), Err(Error::NoEntry));
    }
}
