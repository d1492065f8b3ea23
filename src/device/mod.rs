//! Network devices and the device registry.
//!
//! A [`Device`] is the stack's view of one interface: addressing, flags,
//! the driver behind it, and the transmit path, which is either the
//! driver's `hard_start_xmit` directly or, while a media-access discipline
//! is attached, the discipline's slot scheduler. Drivers are external
//! collaborators implementing [`Driver`]; the in-tree loopback device is
//! the reference implementation.
//!
//! Devices are shared as `Arc<Device>`; the strong count doubles as the
//! reference count that keeps a device alive while packets, routes or
//! disciplines still point at it.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{ByteOrder, NetworkEndian};
use log::trace;

use crate::error::{Error, Result};
use crate::rtmac::Discipline;
use crate::skb::{PacketKind, RtSkb};
use crate::stack::StackRx;
use crate::time::Instant;
use crate::wire::{EthernetAddress, EthernetFrame, Ipv4Address};

pub mod flags {
    pub const IFF_UP: u32 = 0x0001;
    pub const IFF_BROADCAST: u32 = 0x0002;
    pub const IFF_LOOPBACK: u32 = 0x0008;
    pub const IFF_RUNNING: u32 = 0x0040;
    pub const IFF_PROMISC: u32 = 0x0100;
}

/// Drivers that can interleave transmissions skip the per-device transmit
/// mutex.
pub const FEAT_NON_EXCLUSIVE_XMIT: u32 = 0x0001_0000;

/// The operations a NIC driver provides to the stack.
pub trait Driver: Send {
    fn open(&mut self, dev: &Arc<Device>) -> Result<()>;
    fn stop(&mut self, dev: &Arc<Device>) -> Result<()>;
    /// Put one frame on the wire. Ownership of the skb passes to the
    /// driver, which releases it once transmission is done.
    fn hard_start_xmit(&mut self, skb: RtSkb, dev: &Arc<Device>) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct DeviceStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_dropped: AtomicU64,
}

/// Construction parameters for a device.
pub struct DeviceConfig {
    pub name: String,
    pub hwaddr: EthernetAddress,
    pub mtu: usize,
    pub flags: u32,
    pub features: u32,
}

pub struct Device {
    name: String,
    ifindex: AtomicUsize,
    hwaddr: RwLock<EthernetAddress>,
    broadcast_hw: EthernetAddress,
    mtu: usize,
    flags: AtomicU32,
    features: u32,

    local_ip: AtomicU32,
    broadcast_ip: AtomicU32,

    driver: Mutex<Box<dyn Driver>>,
    /// Serializes `hard_start_xmit` for drivers requiring exclusive
    /// transmission; bypassed with [`FEAT_NON_EXCLUSIVE_XMIT`].
    xmit_mutex: Mutex<()>,

    mac: RwLock<Option<Arc<dyn Discipline>>>,
    stack: RwLock<Option<StackRx>>,

    pub stats: DeviceStats,
}

impl Device {
    pub fn new(config: DeviceConfig, driver: Box<dyn Driver>) -> Arc<Device> {
        Arc::new(Device {
            name: config.name,
            ifindex: AtomicUsize::new(0),
            hwaddr: RwLock::new(config.hwaddr),
            broadcast_hw: EthernetAddress::BROADCAST,
            mtu: config.mtu,
            flags: AtomicU32::new(config.flags),
            features: config.features,
            local_ip: AtomicU32::new(0),
            broadcast_ip: AtomicU32::new(0),
            driver: Mutex::new(driver),
            xmit_mutex: Mutex::new(()),
            mac: RwLock::new(None),
            stack: RwLock::new(None),
            stats: DeviceStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index assigned at registration; 0 while unregistered.
    pub fn ifindex(&self) -> usize {
        self.ifindex.load(Ordering::Relaxed)
    }

    pub fn hwaddr(&self) -> EthernetAddress {
        *self.hwaddr.read().unwrap()
    }

    pub fn set_hwaddr(&self, addr: EthernetAddress) {
        *self.hwaddr.write().unwrap() = addr;
    }

    pub fn broadcast_hwaddr(&self) -> EthernetAddress {
        self.broadcast_hw
    }

    /// The raw device MTU; disciplines may report less per priority via
    /// [`Device::mtu_for`].
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// The MTU effective for a packet of the given priority.
    pub fn mtu_for(&self, priority: u8) -> usize {
        match self.mac.read().unwrap().as_ref() {
            Some(disc) => disc.get_mtu(self, priority),
            None => self.mtu,
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn set_flags(&self, set: u32, clear: u32) {
        let mut flags = self.flags.load(Ordering::Relaxed);
        loop {
            let next = (flags | set) & !clear;
            match self.flags.compare_exchange_weak(
                flags,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => flags = actual,
            }
        }
    }

    pub fn is_up(&self) -> bool {
        self.flags() & flags::IFF_UP != 0
    }

    pub fn features(&self) -> u32 {
        self.features
    }

    pub fn local_ip(&self) -> Ipv4Address {
        Ipv4Address::from_bits(self.local_ip.load(Ordering::Relaxed))
    }

    pub fn broadcast_ip(&self) -> Ipv4Address {
        Ipv4Address::from_bits(self.broadcast_ip.load(Ordering::Relaxed))
    }

    pub fn set_ipv4(&self, local: Ipv4Address, broadcast: Ipv4Address) {
        self.local_ip.store(local.to_bits(), Ordering::Relaxed);
        self.broadcast_ip
            .store(broadcast.to_bits(), Ordering::Relaxed);
    }

    /// Connect the receive path to the stack manager. Installed on ifup,
    /// removed on ifdown.
    pub fn stack_connect(&self, rx: StackRx) {
        *self.stack.write().unwrap() = Some(rx);
    }

    pub fn stack_disconnect(&self) {
        *self.stack.write().unwrap() = None;
    }

    /// The driver-side injection point: stamp and hand a received frame to
    /// the stack manager. Runs in the driver's interrupt context, so it
    /// only stamps, enqueues and signals.
    pub fn netif_rx(self: &Arc<Device>, mut skb: RtSkb) {
        skb.rx_stamp = Instant::now();
        skb.dev = Some(self.clone());
        self.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.stats
            .rx_bytes
            .fetch_add(skb.len() as u64, Ordering::Relaxed);
        match self.stack.read().unwrap().as_ref() {
            Some(rx) => rx.rx(skb),
            None => {
                self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Attach a discipline's transmit hook. Fails when one is attached.
    pub(crate) fn set_mac(&self, disc: Arc<dyn Discipline>) -> Result<()> {
        let mut mac = self.mac.write().unwrap();
        if mac.is_some() {
            return Err(Error::AlreadyAttached);
        }
        *mac = Some(disc);
        Ok(())
    }

    pub(crate) fn clear_mac(&self) -> Option<Arc<dyn Discipline>> {
        self.mac.write().unwrap().take()
    }

    pub fn mac(&self) -> Option<Arc<dyn Discipline>> {
        self.mac.read().unwrap().clone()
    }

    /// The stack-side transmit entry: route through the discipline when
    /// one is attached, else straight to the driver.
    pub fn start_xmit(self: &Arc<Device>, skb: RtSkb) -> Result<()> {
        let disc = self.mac.read().unwrap().clone();
        match disc {
            Some(disc) => disc.rt_packet_tx(skb, self),
            None => self.hard_xmit(skb),
        }
    }

    /// Hand a frame to the driver, patching the transmit timestamp and
    /// honoring the exclusive-transmit mutex. Disciplines call this from
    /// their slot schedulers.
    pub fn hard_xmit(self: &Arc<Device>, mut skb: RtSkb) -> Result<()> {
        self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.stats
            .tx_bytes
            .fetch_add(skb.len() as u64, Ordering::Relaxed);

        if let Some(offset) = skb.xmit_stamp_offset.take() {
            // The field is preloaded with a clock-domain correction; adding
            // the local transmit time yields the stamp in the target domain.
            let data = skb.data_mut();
            let preset = NetworkEndian::read_u64(&data[offset..offset + 8]);
            let stamp = preset.wrapping_add(Instant::now().total_nanos() as u64);
            NetworkEndian::write_u64(&mut data[offset..offset + 8], stamp);
        }

        let result = if self.features & FEAT_NON_EXCLUSIVE_XMIT != 0 {
            self.driver.lock().unwrap().hard_start_xmit(skb, self)
        } else {
            let _guard = self.xmit_mutex.lock().unwrap();
            self.driver.lock().unwrap().hard_start_xmit(skb, self)
        };
        if result.is_err() {
            self.stats.tx_dropped.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub(crate) fn open(self: &Arc<Device>) -> Result<()> {
        let mut driver = self.driver.lock().unwrap();
        driver.open(self)?;
        self.set_flags(flags::IFF_UP | flags::IFF_RUNNING, 0);
        Ok(())
    }

    pub(crate) fn close(self: &Arc<Device>) -> Result<()> {
        if self.mac.read().unwrap().is_some() {
            // The discipline must consent to (and perform) detach first.
            return Err(Error::Busy);
        }
        let mut driver = self.driver.lock().unwrap();
        driver.stop(self)?;
        self.set_flags(0, flags::IFF_UP | flags::IFF_RUNNING);
        Ok(())
    }

    /// Fill in the hardware header in front of the current payload.
    pub fn fill_eth_header(
        &self,
        skb: &mut RtSkb,
        dst: EthernetAddress,
        ethertype: crate::wire::EthernetProtocol,
    ) {
        let src = self.hwaddr();
        let header = skb.push(crate::wire::ETHERNET_HEADER_LEN);
        let mut frame = EthernetFrame::new_unchecked(header);
        frame.set_dst_addr(dst);
        frame.set_src_addr(src);
        frame.set_ethertype(ethertype);
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("ifindex", &self.ifindex())
            .field("flags", &format_args!("{:#06x}", self.flags()))
            .finish()
    }
}

/// Classify and strip the Ethernet header of a freshly received frame,
/// recording protocol and packet kind on the skb. Drivers call this before
/// injection so the stack manager sees layer-3 payload.
pub fn eth_type_trans(skb: &mut RtSkb, dev: &Device) -> Result<()> {
    let frame = EthernetFrame::new_checked(skb.data()).map_err(|_| Error::Malformed)?;
    let dst = frame.dst_addr();
    let ethertype = frame.ethertype();
    let src_hwaddr = frame.src_addr();
    skb.protocol = ethertype;
    skb.src_hwaddr = src_hwaddr;
    skb.pkt_type = if dst.is_broadcast() {
        PacketKind::Broadcast
    } else if dst.is_multicast() {
        PacketKind::Multicast
    } else if dst == dev.hwaddr() {
        PacketKind::Host
    } else {
        PacketKind::OtherHost
    };
    skb.pull(crate::wire::ETHERNET_HEADER_LEN);
    Ok(())
}

/// The table of registered devices, indexed by ifindex.
pub struct Registry {
    devices: Mutex<Vec<Option<Arc<Device>>>>,
}

impl Registry {
    pub fn new(max_devices: usize) -> Registry {
        Registry {
            devices: Mutex::new(vec![None; max_devices]),
        }
    }

    /// Register a device, assigning the first free ifindex (1-based).
    pub fn register(&self, dev: Arc<Device>) -> Result<usize> {
        let mut devices = self.devices.lock().unwrap();
        if devices
            .iter()
            .flatten()
            .any(|existing| existing.name() == dev.name())
        {
            return Err(Error::Exists);
        }
        let slot = devices
            .iter()
            .position(Option::is_none)
            .ok_or(Error::Busy)?;
        let ifindex = slot + 1;
        dev.ifindex.store(ifindex, Ordering::Relaxed);
        trace!("registered device {} as index {}", dev.name(), ifindex);
        devices[slot] = Some(dev);
        Ok(ifindex)
    }

    /// Remove a device. Fails while anything besides the registry and the
    /// caller still holds a reference.
    pub fn unregister(&self, dev: &Arc<Device>) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        let slot = dev.ifindex().checked_sub(1).ok_or(Error::NoDevice)?;
        let entry = devices.get_mut(slot).ok_or(Error::NoDevice)?;
        match entry {
            Some(registered) if Arc::ptr_eq(registered, dev) => {
                // Registry + caller's argument are the two expected owners.
                if Arc::strong_count(dev) > 2 {
                    return Err(Error::Busy);
                }
                *entry = None;
                dev.ifindex.store(0, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(Error::NoDevice),
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .find(|dev| dev.name() == name)
            .cloned()
    }

    pub fn get_by_index(&self, ifindex: usize) -> Option<Arc<Device>> {
        let devices = self.devices.lock().unwrap();
        devices.get(ifindex.checked_sub(1)?)?.clone()
    }

    pub fn get_by_hwaddr(&self, addr: EthernetAddress) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .find(|dev| dev.hwaddr() == addr)
            .cloned()
    }

    pub fn get_loopback(&self) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .find(|dev| dev.flags() & flags::IFF_LOOPBACK != 0)
            .cloned()
    }

    /// Visit every registered device.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Device>)) {
        for dev in self.devices.lock().unwrap().iter().flatten() {
            f(dev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;

    impl Driver for NullDriver {
        fn open(&mut self, _dev: &Arc<Device>) -> Result<()> {
            Ok(())
        }
        fn stop(&mut self, _dev: &Arc<Device>) -> Result<()> {
            Ok(())
        }
        fn hard_start_xmit(&mut self, _skb: RtSkb, _dev: &Arc<Device>) -> Result<()> {
            Ok(())
        }
    }

    fn test_dev(name: &str, last_octet: u8) -> Arc<Device> {
        Device::new(
            DeviceConfig {
                name: name.into(),
                hwaddr: EthernetAddress([0x02, 0, 0, 0, 0, last_octet]),
                mtu: 1500,
                flags: flags::IFF_BROADCAST,
                features: 0,
            },
            Box::new(NullDriver),
        )
    }

    #[test]
    fn registry_assigns_and_looks_up() {
        let registry = Registry::new(4);
        let a = test_dev("rteth0", 1);
        let b = test_dev("rteth1", 2);
        assert_eq!(registry.register(a.clone()).unwrap(), 1);
        assert_eq!(registry.register(b.clone()).unwrap(), 2);

        assert!(Arc::ptr_eq(
            &registry.get_by_name("rteth1").unwrap(),
            &b
        ));
        assert!(Arc::ptr_eq(&registry.get_by_index(1).unwrap(), &a));
        assert!(Arc::ptr_eq(
            &registry
                .get_by_hwaddr(EthernetAddress([0x02, 0, 0, 0, 0, 2]))
                .unwrap(),
            &b
        ));
        assert!(registry.get_by_name("rteth9").is_none());
    }

    #[test]
    fn duplicate_name_rejected() {
        let registry = Registry::new(4);
        registry.register(test_dev("rteth0", 1)).unwrap();
        assert_eq!(
            registry.register(test_dev("rteth0", 9)).err(),
            Some(Error::Exists)
        );
    }

    #[test]
    fn unregister_requires_last_reference() {
        let registry = Registry::new(4);
        let dev = test_dev("rteth0", 1);
        registry.register(dev.clone()).unwrap();

        let extra = dev.clone();
        assert_eq!(registry.unregister(&dev), Err(Error::Busy));
        drop(extra);
        registry.unregister(&dev).unwrap();
        assert!(registry.get_by_name("rteth0").is_none());
        assert_eq!(dev.ifindex(), 0);
    }

    #[test]
    fn eth_type_trans_classifies() {
        use crate::skb::Pool;
        use crate::wire::{EthernetProtocol, ETHERNET_HEADER_LEN};

        let dev = test_dev("rteth0", 1);
        let pool = Pool::new(1, 256);
        let mut skb = pool.alloc(256).unwrap();
        skb.reserve(ETHERNET_HEADER_LEN);
        skb.put(4).copy_from_slice(b"data");
        dev.fill_eth_header(&mut skb, EthernetAddress::BROADCAST, EthernetProtocol::Ipv4);

        eth_type_trans(&mut skb, &dev).unwrap();
        assert_eq!(skb.protocol, EthernetProtocol::Ipv4);
        assert_eq!(skb.pkt_type, PacketKind::Broadcast);
        assert_eq!(skb.data(), b"data");
    }
}
