//! The media-access-control framework.
//!
//! A [`Discipline`] interposes between socket transmission and the driver:
//! while attached, the device's `start_xmit` routes through
//! `rt_packet_tx`, which queues the packet for its scheduled slot instead
//! of sending immediately. The framework also owns the RTmac ethertype:
//! on reception it unwraps the discipline header and either hands the
//! inner frame to the attached discipline or, for tunnelled frames, to
//! the virtual-NIC hook serving the non-real-time world.

use std::sync::{Arc, RwLock};

use log::trace;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::skb::RtSkb;
use crate::wire::{
    DisciplineType, EthernetAddress, EthernetProtocol, RtmacHeader, RtmacRepr,
    RTMAC_FLAG_TUNNEL, RTMAC_HEADER_LEN,
};

/// A pluggable media-access policy.
///
/// This is the stack's one necessary dynamic-dispatch seam: the device
/// calls through it on transmit, the framework on receive and teardown.
pub trait Discipline: Send + Sync {
    fn name(&self) -> &'static str;
    fn disc_type(&self) -> DisciplineType;

    /// Transmit a real-time packet under the discipline's schedule.
    fn rt_packet_tx(&self, skb: RtSkb, dev: &Arc<Device>) -> Result<()>;

    /// Transmit a non-real-time (tunnelled) packet.
    fn nrt_packet_tx(&self, skb: RtSkb) -> Result<()>;

    /// Consume a received discipline frame (RTmac header already
    /// stripped).
    fn packet_rx(&self, skb: RtSkb);

    /// Consent to (and perform) detach from `dev`. May refuse with
    /// [`Error::Busy`] while packets are still queued.
    fn detach(&self, dev: &Arc<Device>) -> Result<()>;

    /// The MTU the discipline grants packets of the given priority.
    fn get_mtu(&self, dev: &Device, priority: u8) -> usize;
}

/// Receives decapsulated tunnel frames on behalf of the virtual NIC.
pub type VnicHook = dyn Fn(RtSkb) + Send + Sync;

/// Attach `disc` to `dev`, interposing its transmit path. The device
/// refuses `ifdown` until [`detach`] succeeds.
pub fn attach(dev: &Arc<Device>, disc: Arc<dyn Discipline>) -> Result<()> {
    dev.set_mac(disc.clone())?;
    trace!("{} attached to {}", disc.name(), dev.name());
    Ok(())
}

/// Detach the discipline from `dev`, with its consent.
pub fn detach(dev: &Arc<Device>) -> Result<()> {
    let disc = dev.mac().ok_or(Error::NotAttached)?;
    disc.detach(dev)?;
    dev.clear_mac();
    trace!("{} detached from {}", disc.name(), dev.name());
    Ok(())
}

/// Prepend the RTmac and hardware headers to a discipline frame.
pub fn add_header(
    dev: &Device,
    dst: EthernetAddress,
    skb: &mut RtSkb,
    disc_type: DisciplineType,
    flags: u8,
) {
    let repr = RtmacRepr {
        discipline: disc_type,
        flags,
    };
    repr.emit(&mut RtmacHeader::new_unchecked(skb.push(RTMAC_HEADER_LEN)));
    dev.fill_eth_header(skb, dst, EthernetProtocol::Rtmac);
}

/// Transmit a discipline-internal frame directly, bypassing the
/// discipline's own schedule. Slot schedulers release queued packets
/// through this.
pub fn xmit(skb: RtSkb, dev: &Arc<Device>) -> Result<()> {
    dev.hard_xmit(skb)
}

/// Per-stack RTmac receive state: the registered ethertype handler and
/// the VNIC hand-off.
pub struct RtmacLayer {
    vnic: RwLock<Option<Box<VnicHook>>>,
}

impl RtmacLayer {
    pub fn new() -> Arc<RtmacLayer> {
        Arc::new(RtmacLayer {
            vnic: RwLock::new(None),
        })
    }

    /// Install the virtual-NIC receive hook for tunnelled frames.
    pub fn set_vnic_hook(&self, hook: Option<Box<VnicHook>>) {
        *self.vnic.write().unwrap() = hook;
    }

    /// The RTmac ethertype receive entry. Consumes the skb.
    pub fn rcv(&self, mut skb: RtSkb) {
        let repr = {
            let Ok(header) = RtmacHeader::new_checked(skb.data()) else {
                return;
            };
            match RtmacRepr::parse(&header) {
                Ok(repr) => repr,
                Err(_) => {
                    trace!("RTmac version mismatch, dropping frame");
                    return;
                }
            }
        };
        skb.pull(RTMAC_HEADER_LEN);

        if repr.flags & RTMAC_FLAG_TUNNEL != 0 {
            match self.vnic.read().unwrap().as_ref() {
                Some(hook) => hook(skb),
                None => trace!("tunnel frame without VNIC hook, dropping"),
            }
            return;
        }

        let Some(disc) = skb.dev.as_ref().and_then(|dev| dev.mac()) else {
            trace!("discipline frame on undisciplined device, dropping");
            return;
        };
        if disc.disc_type() != repr.discipline {
            trace!("frame for {:?} on {} device, dropping", repr.discipline, disc.name());
            return;
        }
        disc.packet_rx(skb);
    }

    /// Transmit a non-real-time frame from the virtual NIC through the
    /// attached discipline, wrapped with the tunnel flag.
    pub fn vnic_xmit(&self, dev: &Arc<Device>, mut skb: RtSkb) -> Result<()> {
        let disc = dev.mac().ok_or(Error::NotAttached)?;
        skb.channel = crate::skb::Channel::Nrt;
        skb.priority = crate::config::SKB_MIN_PRIO;
        add_header(
            dev,
            dev.broadcast_hwaddr(),
            &mut skb,
            disc.disc_type(),
            RTMAC_FLAG_TUNNEL,
        );
        disc.nrt_packet_tx(skb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device;
    use crate::drivers::Loopback;
    use crate::skb::Pool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDisc {
        rx: AtomicUsize,
        busy: bool,
    }

    impl Discipline for CountingDisc {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn disc_type(&self) -> DisciplineType {
            DisciplineType::Tdma
        }
        fn rt_packet_tx(&self, skb: RtSkb, dev: &Arc<Device>) -> Result<()> {
            dev.hard_xmit(skb)
        }
        fn nrt_packet_tx(&self, skb: RtSkb) -> Result<()> {
            drop(skb);
            Ok(())
        }
        fn packet_rx(&self, skb: RtSkb) {
            self.rx.fetch_add(1, Ordering::Relaxed);
            drop(skb);
        }
        fn detach(&self, _dev: &Arc<Device>) -> Result<()> {
            if self.busy {
                Err(Error::Busy)
            } else {
                Ok(())
            }
        }
        fn get_mtu(&self, dev: &Device, _priority: u8) -> usize {
            dev.mtu() - RTMAC_HEADER_LEN
        }
    }

    #[test]
    fn attach_interposes_and_detach_needs_consent() {
        let dev = Loopback::device();
        let busy_disc = Arc::new(CountingDisc {
            rx: AtomicUsize::new(0),
            busy: true,
        });
        attach(&dev, busy_disc.clone()).unwrap();
        assert_eq!(
            attach(&dev, busy_disc.clone()).err(),
            Some(Error::AlreadyAttached)
        );

        // ifdown must be refused while attached.
        assert_eq!(dev.close().err(), Some(Error::Busy));
        assert_eq!(detach(&dev).err(), Some(Error::Busy));
        assert!(dev.mac().is_some());

        dev.clear_mac();
        let disc = Arc::new(CountingDisc {
            rx: AtomicUsize::new(0),
            busy: false,
        });
        attach(&dev, disc).unwrap();
        detach(&dev).unwrap();
        assert!(dev.mac().is_none());
    }

    #[test]
    fn rx_unwraps_and_routes_to_discipline() {
        let dev = Loopback::device();
        let disc = Arc::new(CountingDisc {
            rx: AtomicUsize::new(0),
            busy: false,
        });
        attach(&dev, disc.clone()).unwrap();

        let layer = RtmacLayer::new();
        let pool = Pool::new(2, 256);

        let mut skb = pool.alloc(256).unwrap();
        skb.reserve(crate::wire::ETHERNET_HEADER_LEN + RTMAC_HEADER_LEN);
        skb.put(4).copy_from_slice(b"data");
        add_header(&dev, dev.hwaddr(), &mut skb, DisciplineType::Tdma, 0);
        device::eth_type_trans(&mut skb, &dev).unwrap();
        skb.dev = Some(dev.clone());

        assert_eq!(skb.protocol, EthernetProtocol::Rtmac);
        layer.rcv(skb);
        assert_eq!(disc.rx.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn tunnel_frames_go_to_vnic() {
        let dev = Loopback::device();
        let disc = Arc::new(CountingDisc {
            rx: AtomicUsize::new(0),
            busy: false,
        });
        attach(&dev, disc.clone()).unwrap();

        let layer = RtmacLayer::new();
        let tunnelled = Arc::new(AtomicUsize::new(0));
        let count = tunnelled.clone();
        layer.set_vnic_hook(Some(Box::new(move |skb| {
            count.fetch_add(1, Ordering::Relaxed);
            drop(skb);
        })));

        let pool = Pool::new(2, 256);
        let mut skb = pool.alloc(256).unwrap();
        skb.reserve(crate::wire::ETHERNET_HEADER_LEN + RTMAC_HEADER_LEN);
        skb.put(4).copy_from_slice(b"liin");
        add_header(
            &dev,
            dev.hwaddr(),
            &mut skb,
            DisciplineType::Tdma,
            RTMAC_FLAG_TUNNEL,
        );
        device::eth_type_trans(&mut skb, &dev).unwrap();
        skb.dev = Some(dev.clone());

        layer.rcv(skb);
        assert_eq!(tunnelled.load(Ordering::Relaxed), 1);
        assert_eq!(disc.rx.load(Ordering::Relaxed), 0);
    }
}
