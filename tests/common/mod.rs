//! A software Ethernet segment connecting several stacks in-process.
//!
//! Each attached stack gets a port device; transmitting on one port
//! delivers the frame, switch-style, to the port owning the destination
//! address (or to all ports for broadcast/multicast). Every port draws
//! receive buffers from its own pool, as a real NIC driver would.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use rtnet::device::{self, flags, Device, DeviceConfig, Driver};
use rtnet::skb::{Pool, RtSkb};
use rtnet::wire::{EthernetAddress, EthernetFrame, Ipv4Address};
use rtnet::{ctrl, Stack};

struct PortEntry {
    dev: Arc<Device>,
    rx_pool: Pool,
}

pub struct Segment {
    ports: Mutex<Vec<PortEntry>>,
}

impl Segment {
    pub fn new() -> Arc<Segment> {
        Arc::new(Segment {
            ports: Mutex::new(Vec::new()),
        })
    }

    /// Create a port device on `stack`, register it, and bring it up with
    /// the given address.
    pub fn attach(
        self: &Arc<Segment>,
        stack: &Arc<Stack>,
        name: &str,
        mac_octet: u8,
        ip: Ipv4Address,
    ) -> Arc<Device> {
        let port = self.ports.lock().unwrap().len();
        let dev = Device::new(
            DeviceConfig {
                name: name.into(),
                hwaddr: EthernetAddress([0x02, 0, 0, 0, 0, mac_octet]),
                mtu: 1500,
                flags: flags::IFF_BROADCAST,
                features: 0,
            },
            Box::new(SegmentPort {
                segment: self.clone(),
                port,
            }),
        );
        self.ports.lock().unwrap().push(PortEntry {
            dev: dev.clone(),
            rx_pool: Pool::new(32, 4096),
        });

        stack.register_device(dev.clone()).unwrap();
        ctrl::ifup(
            stack,
            &ctrl::CoreCmd {
                if_name: name.into(),
                ip_addr: ip,
                broadcast_ip: Ipv4Address::new(10, 255, 255, 255),
                set_flags: 0,
                clear_flags: 0,
                hwaddr: None,
            },
        )
        .unwrap();
        dev
    }

    fn deliver(&self, from: usize, bytes: &[u8]) {
        let Ok(frame) = EthernetFrame::new_checked(bytes) else {
            return;
        };
        let dst = frame.dst_addr();

        let ports = self.ports.lock().unwrap();
        for (index, entry) in ports.iter().enumerate() {
            if index == from {
                continue;
            }
            if !(dst.is_broadcast() || dst.is_multicast() || dst == entry.dev.hwaddr()) {
                continue;
            }
            let Some(mut skb) = entry.rx_pool.alloc(bytes.len()) else {
                continue;
            };
            skb.put(bytes.len()).copy_from_slice(bytes);
            if device::eth_type_trans(&mut skb, &entry.dev).is_ok() {
                entry.dev.netif_rx(skb);
            }
        }
    }
}

struct SegmentPort {
    segment: Arc<Segment>,
    port: usize,
}

impl Driver for SegmentPort {
    fn open(&mut self, _dev: &Arc<Device>) -> rtnet::Result<()> {
        Ok(())
    }

    fn stop(&mut self, _dev: &Arc<Device>) -> rtnet::Result<()> {
        Ok(())
    }

    fn hard_start_xmit(&mut self, skb: RtSkb, _dev: &Arc<Device>) -> rtnet::Result<()> {
        let bytes = skb.data().to_vec();
        drop(skb);
        self.segment.deliver(self.port, &bytes);
        Ok(())
    }
}

/// Install the host routes two stations need to talk to each other.
pub fn link_routes(
    stack_a: &Arc<Stack>,
    dev_a: &Arc<Device>,
    ip_a: Ipv4Address,
    stack_b: &Arc<Stack>,
    dev_b: &Arc<Device>,
    ip_b: Ipv4Address,
) {
    stack_a
        .ipv4()
        .routes
        .add_host(ip_b, dev_b.hwaddr(), dev_a.clone())
        .unwrap();
    stack_b
        .ipv4()
        .routes
        .add_host(ip_a, dev_a.hwaddr(), dev_b.clone())
        .unwrap();
}

/// Poll `predicate` until it holds or `millis` elapsed.
pub fn wait_until(millis: u64, predicate: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(millis);
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    predicate()
}
