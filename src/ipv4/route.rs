//! Host and network route tables.
//!
//! A host route resolves a destination IP straight to a device and
//! hardware address; a network route redirects a whole prefix to a
//! gateway, which must itself resolve through a host route. Lookups are
//! read-mostly; updates take the write side. Unresolvable hosts optionally
//! trigger an address-resolution solicit before the lookup fails.

use std::sync::{Arc, RwLock};

use log::debug;

use crate::config::{HOST_ROUTE_COUNT, NET_ROUTE_COUNT};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::wire::{EthernetAddress, Ipv4Address};

#[derive(Debug, Clone)]
pub struct HostRoute {
    pub addr: Ipv4Address,
    pub hwaddr: EthernetAddress,
    pub dev: Arc<Device>,
}

#[derive(Debug, Clone, Copy)]
pub struct NetRoute {
    pub network: Ipv4Address,
    pub mask: Ipv4Address,
    pub gateway: Ipv4Address,
}

impl NetRoute {
    fn matches(&self, addr: Ipv4Address) -> bool {
        addr.to_bits() & self.mask.to_bits() == self.network.to_bits() & self.mask.to_bits()
    }
}

type SolicitHook = Box<dyn Fn(Ipv4Address) + Send + Sync>;

/// The routing tables of one stack.
pub struct RouteTable {
    host: RwLock<heapless::Vec<HostRoute, HOST_ROUTE_COUNT>>,
    net: RwLock<heapless::Vec<NetRoute, NET_ROUTE_COUNT>>,
    solicit: RwLock<Option<SolicitHook>>,
}

impl RouteTable {
    pub fn new() -> RouteTable {
        RouteTable {
            host: RwLock::new(heapless::Vec::new()),
            net: RwLock::new(heapless::Vec::new()),
            solicit: RwLock::new(None),
        }
    }

    /// Install the hook fired when a host lookup misses (ARP solicit).
    pub fn set_solicit_hook(&self, hook: SolicitHook) {
        *self.solicit.write().unwrap() = Some(hook);
    }

    /// Add or refresh the host route for `addr`.
    pub fn add_host(
        &self,
        addr: Ipv4Address,
        hwaddr: EthernetAddress,
        dev: Arc<Device>,
    ) -> Result<()> {
        let mut table = self.host.write().unwrap();
        if let Some(entry) = table.iter_mut().find(|entry| entry.addr == addr) {
            entry.hwaddr = hwaddr;
            entry.dev = dev;
            return Ok(());
        }
        table
            .push(HostRoute { addr, hwaddr, dev })
            .map_err(|_| Error::Busy)?;
        debug!("host route {addr} -> {hwaddr}");
        Ok(())
    }

    pub fn del_host(&self, addr: Ipv4Address) -> Result<()> {
        let mut table = self.host.write().unwrap();
        let pos = table
            .iter()
            .position(|entry| entry.addr == addr)
            .ok_or(Error::NoEntry)?;
        table.swap_remove(pos);
        Ok(())
    }

    pub fn get_host(&self, addr: Ipv4Address) -> Option<HostRoute> {
        self.host
            .read()
            .unwrap()
            .iter()
            .find(|entry| entry.addr == addr)
            .cloned()
    }

    pub fn add_net(
        &self,
        network: Ipv4Address,
        mask: Ipv4Address,
        gateway: Ipv4Address,
    ) -> Result<()> {
        let mut table = self.net.write().unwrap();
        if let Some(entry) = table
            .iter_mut()
            .find(|entry| entry.network == network && entry.mask == mask)
        {
            entry.gateway = gateway;
            return Ok(());
        }
        table
            .push(NetRoute {
                network,
                mask,
                gateway,
            })
            .map_err(|_| Error::Busy)?;
        Ok(())
    }

    pub fn del_net(&self, network: Ipv4Address, mask: Ipv4Address) -> Result<()> {
        let mut table = self.net.write().unwrap();
        let pos = table
            .iter()
            .position(|entry| entry.network == network && entry.mask == mask)
            .ok_or(Error::NoEntry)?;
        table.swap_remove(pos);
        Ok(())
    }

    /// Drop every route referencing `dev`; called on device teardown.
    pub fn flush_device(&self, dev: &Arc<Device>) {
        self.host
            .write()
            .unwrap()
            .retain(|entry| !Arc::ptr_eq(&entry.dev, dev));
    }

    /// Resolve the transmit route for `daddr`: host route first, then a
    /// matching network route's gateway. A miss fires the solicit hook and
    /// reports the host unreachable.
    pub fn output_route(&self, daddr: Ipv4Address) -> Result<HostRoute> {
        if let Some(route) = self.get_host(daddr) {
            return Ok(route);
        }

        let gateway = self
            .net
            .read()
            .unwrap()
            .iter()
            .find(|entry| entry.matches(daddr))
            .map(|entry| entry.gateway);

        if let Some(gateway) = gateway {
            if let Some(route) = self.get_host(gateway) {
                return Ok(route);
            }
        }

        if let Some(hook) = self.solicit.read().unwrap().as_ref() {
            hook(gateway.unwrap_or(daddr));
        }
        Err(Error::HostUnreachable)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::Loopback;

    fn hw(octet: u8) -> EthernetAddress {
        EthernetAddress([0x02, 0, 0, 0, 0, octet])
    }

    #[test]
    fn host_route_lifecycle() {
        let table = RouteTable::new();
        let dev = Loopback::device();
        let addr = Ipv4Address::new(10, 0, 0, 2);
        table.add_host(addr, hw(2), dev.clone()).unwrap();
        assert_eq!(table.get_host(addr).unwrap().hwaddr, hw(2));

        // Refresh replaces in place.
        table.add_host(addr, hw(3), dev).unwrap();
        assert_eq!(table.get_host(addr).unwrap().hwaddr, hw(3));

        table.del_host(addr).unwrap();
        assert!(table.get_host(addr).is_none());
        assert_eq!(table.del_host(addr), Err(Error::NoEntry));
    }

    #[test]
    fn gateway_resolution() {
        let table = RouteTable::new();
        let dev = Loopback::device();
        let gateway = Ipv4Address::new(10, 0, 0, 1);
        table.add_host(gateway, hw(1), dev).unwrap();
        table
            .add_net(
                Ipv4Address::new(192, 168, 1, 0),
                Ipv4Address::new(255, 255, 255, 0),
                gateway,
            )
            .unwrap();

        let route = table
            .output_route(Ipv4Address::new(192, 168, 1, 77))
            .unwrap();
        assert_eq!(route.addr, gateway);

        assert_eq!(
            table.output_route(Ipv4Address::new(172, 16, 0, 1)).err(),
            Some(Error::HostUnreachable)
        );
    }

    #[test]
    fn miss_fires_solicit() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let table = RouteTable::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hook_hits = hits.clone();
        table.set_solicit_hook(Box::new(move |_| {
            hook_hits.fetch_add(1, Ordering::Relaxed);
        }));
        let _ = table.output_route(Ipv4Address::new(10, 0, 0, 9));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn flush_device_removes_routes() {
        let table = RouteTable::new();
        let dev = Loopback::device();
        table
            .add_host(Ipv4Address::new(10, 0, 0, 2), hw(2), dev.clone())
            .unwrap();
        table.flush_device(&dev);
        assert!(table.get_host(Ipv4Address::new(10, 0, 0, 2)).is_none());
    }
}
