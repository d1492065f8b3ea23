/*! A deterministic networking stack with time-division media access.

This crate provides bounded-latency Ethernet and UDP/IP messaging for
control systems: fixed pools of packet buffers ([`skb`]), a lock-free
driver-to-stack hand-off feeding a protocol-dispatch task ([`stack`]),
an IPv4/UDP datagram path ([`ipv4`], [`socket`]), a pluggable
media-access layer ([`rtmac`]) with a TDMA discipline ([`tdma`]), and a
configuration-distribution protocol that brings a fleet of stations into
a known state before traffic begins ([`rtcfg`]).

All state lives in a [`Stack`] value; there are no process-wide tables.
A minimal session against the loopback device:

```
use rtnet::ctrl::{self, CoreCmd};
use rtnet::wire::Ipv4Address;

let stack = rtnet::Stack::new(rtnet::StackConfig::default());
let rtlo = rtnet::drivers::Loopback::device();
stack.register_device(rtlo).unwrap();
ctrl::ifup(&stack, &CoreCmd {
    if_name: "rtlo".into(),
    ip_addr: Ipv4Address::new(10, 0, 0, 1),
    broadcast_ip: Ipv4Address::new(10, 255, 255, 255),
    set_flags: 0,
    clear_flags: 0,
    hwaddr: None,
}).unwrap();

let rx = stack.udp_socket();
rx.bind(Ipv4Address::UNSPECIFIED, 37000).unwrap();
rx.set_timeout(1_000_000_000);
let tx = stack.udp_socket();
tx.send_to(b"ping", Ipv4Address::new(10, 0, 0, 1), 37000).unwrap();

let mut buf = [0u8; 16];
let (len, _from) = rx.recv_from(&mut buf).unwrap();
assert_eq!(&buf[..len], b"ping");
```
*/

pub mod config;
pub mod ctrl;
pub mod device;
pub mod drivers;
pub mod error;
pub mod ipv4;
pub mod rtcfg;
pub mod rtmac;
pub mod rtpc;
pub mod skb;
pub mod socket;
pub mod stack;
pub mod storage;
pub mod sync;
pub mod tdma;
pub mod time;
pub mod wire;

pub use error::{Error, Result};

use std::sync::{Arc, Mutex};

use device::{Device, Registry};
use ipv4::arp::Arp;
use ipv4::Ipv4Stack;
use rtcfg::Rtcfg;
use rtmac::RtmacLayer;
use rtpc::Rtpc;
use skb::Pool;
use socket::{Socket, Udp, UdpSocket};
use stack::{PacketType, StackManager};
use tdma::Tdma;
use wire::EthernetProtocol;

/// Pool and table sizing chosen at stack creation.
#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    /// Buffers in the global pool.
    pub global_rtskbs: usize,
    /// Buffer capacity; also bounds reassembled datagrams.
    pub max_rtskb_size: usize,
    /// Default per-socket pool size.
    pub socket_rtskbs: usize,
}

impl Default for StackConfig {
    fn default() -> StackConfig {
        StackConfig {
            global_rtskbs: config::DEFAULT_GLOBAL_RTSKBS,
            max_rtskb_size: config::DEFAULT_MAX_RTSKB_SIZE,
            socket_rtskbs: config::DEFAULT_SOCKET_RTSKBS,
        }
    }
}

/// The stack context: every table, pool and service task of one stack
/// instance.
pub struct Stack {
    config: StackConfig,
    global_pool: Pool,
    registry: Arc<Registry>,
    manager: StackManager,
    rtpc: Arc<Rtpc>,
    ipv4: Arc<Ipv4Stack>,
    udp: Arc<Udp>,
    arp: Arc<Arp>,
    rtmac: Arc<RtmacLayer>,
    rtcfg: Arc<Rtcfg>,
    packet_types: Mutex<Vec<Arc<PacketType>>>,
}

impl Stack {
    /// Build a stack and start its manager task.
    pub fn new(config: StackConfig) -> Arc<Stack> {
        let global_pool = Pool::new(config.global_rtskbs, config.max_rtskb_size);
        let registry = Arc::new(Registry::new(config::MAX_RT_DEVICES));
        let manager = StackManager::new(config::RX_RING_SIZE);
        let rtpc = Arc::new(Rtpc::new());

        let ipv4 = Arc::new(Ipv4Stack::new(global_pool.clone()));
        let udp = Udp::new();
        ipv4.add_protocol(udp.clone())
            .expect("fresh protocol table");
        let arp = Arc::new(Arp::new(global_pool.clone()));
        let rtmac = RtmacLayer::new();
        let rtcfg = Rtcfg::new(config::MAX_RT_DEVICES, rtpc.clone());

        // Unresolved hosts trigger an ARP solicit on every running
        // non-loopback device.
        {
            let arp = arp.clone();
            let registry = registry.clone();
            ipv4.routes.set_solicit_hook(Box::new(move |target| {
                registry.for_each(|dev| {
                    if dev.is_up() && dev.flags() & device::flags::IFF_LOOPBACK == 0 {
                        let _ = arp.solicit(dev, target);
                    }
                });
            }));
        }

        let mut packet_types = Vec::new();
        {
            let ipv4 = ipv4.clone();
            packet_types.push(PacketType::new(
                EthernetProtocol::Ipv4,
                "IPv4",
                Box::new(move |skb| {
                    ipv4.rcv(skb);
                    Ok(())
                }),
            ));
        }
        {
            let arp = arp.clone();
            let ipv4 = ipv4.clone();
            packet_types.push(PacketType::new(
                EthernetProtocol::Arp,
                "ARP",
                Box::new(move |skb| {
                    arp.rcv(&ipv4.routes, skb);
                    Ok(())
                }),
            ));
        }
        {
            let rtmac = rtmac.clone();
            packet_types.push(PacketType::new(
                EthernetProtocol::Rtmac,
                "RTmac",
                Box::new(move |skb| {
                    rtmac.rcv(skb);
                    Ok(())
                }),
            ));
        }
        {
            let rtcfg = rtcfg.clone();
            packet_types.push(PacketType::new(
                EthernetProtocol::Rtcfg,
                "RTcfg",
                Box::new(move |skb| {
                    rtcfg.rcv(skb);
                    Ok(())
                }),
            ));
        }
        for pt in &packet_types {
            manager
                .packet_types()
                .add_pack(pt.clone())
                .expect("fresh packet-type table");
        }

        manager.spawn();

        Arc::new(Stack {
            config,
            global_pool,
            registry,
            manager,
            rtpc,
            ipv4,
            udp,
            arp,
            rtmac,
            rtcfg,
            packet_types: Mutex::new(packet_types),
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// The stack-wide buffer pool.
    pub fn global_pool(&self) -> &Pool {
        &self.global_pool
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn manager(&self) -> &StackManager {
        &self.manager
    }

    pub fn ipv4(&self) -> &Arc<Ipv4Stack> {
        &self.ipv4
    }

    pub fn arp(&self) -> &Arc<Arp> {
        &self.arp
    }

    pub fn rtmac(&self) -> &Arc<RtmacLayer> {
        &self.rtmac
    }

    pub fn rtcfg(&self) -> &Arc<Rtcfg> {
        &self.rtcfg
    }

    pub fn rtpc(&self) -> &Arc<Rtpc> {
        &self.rtpc
    }

    /// Register a device with this stack.
    pub fn register_device(&self, dev: Arc<Device>) -> Result<usize> {
        self.registry.register(dev)
    }

    /// Remove a device; it must be down and otherwise unreferenced.
    pub fn unregister_device(&self, dev: &Arc<Device>) -> Result<()> {
        if dev.is_up() {
            return Err(Error::Busy);
        }
        self.registry.unregister(dev)
    }

    /// Create an unbound UDP socket with its own buffer pool.
    pub fn udp_socket(self: &Arc<Self>) -> UdpSocket {
        let sock = Socket::new(self.config.socket_rtskbs, self.config.max_rtskb_size);
        UdpSocket::new(self.udp.clone(), self.ipv4.clone(), sock)
    }

    /// Attach a TDMA discipline to `dev`.
    pub fn tdma_attach(&self, dev: &Arc<Device>) -> Result<Arc<Tdma>> {
        Tdma::attach(dev, self.global_pool.clone(), self.rtpc.clone())
    }

    /// Stop every service task. Devices must already be down.
    pub fn shutdown(&self) {
        self.rtcfg.shutdown();
        self.manager.shutdown();
        self.rtpc.shutdown();
        self.packet_types.lock().unwrap().clear();
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown();
    }
}
