//! The packet-type table and the stack-manager task.
//!
//! Drivers hand received frames to [`StackRx::rx`] from their interrupt
//! path: stamp, push onto a lock-free ring, signal, and nothing else. The
//! stack-manager task drains the ring and dispatches each packet to the
//! layer-3 handlers registered for its ethertype. Per device, packets
//! reach layer 3 in enqueue order.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use log::{trace, warn};

use crate::config::{RTPACKET_BUCKET_SIZE, RTPACKET_HASH_KEY_MASK, RTPACKET_HASH_TBL_SIZE};
use crate::device::flags::IFF_PROMISC;
use crate::error::{Error, Result};
use crate::skb::RtSkb;
use crate::storage::SpscRing;
use crate::sync::Event;
use crate::time::Timeout;
use crate::wire::EthernetProtocol;

/// A handler either consumes the packet or hands it back for the next
/// handler of the same type.
pub type PacketHandler = dyn Fn(RtSkb) -> core::result::Result<(), RtSkb> + Send + Sync;

/// A registered layer-3 protocol.
pub struct PacketType {
    pub ethertype: EthernetProtocol,
    pub name: &'static str,
    refcount: AtomicUsize,
    handler: Box<PacketHandler>,
}

impl PacketType {
    pub fn new(
        ethertype: EthernetProtocol,
        name: &'static str,
        handler: Box<PacketHandler>,
    ) -> Arc<PacketType> {
        Arc::new(PacketType {
            ethertype,
            name,
            refcount: AtomicUsize::new(0),
            handler,
        })
    }
}

impl core::fmt::Debug for PacketType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketType")
            .field("ethertype", &self.ethertype)
            .field("name", &self.name)
            .finish()
    }
}

type Bucket = RwLock<heapless::Vec<Arc<PacketType>, RTPACKET_BUCKET_SIZE>>;

/// The hashed registry of layer-3 handlers.
pub struct PacketTypeTable {
    buckets: [Bucket; RTPACKET_HASH_TBL_SIZE],
}

fn hash(ethertype: EthernetProtocol) -> usize {
    (u16::from(ethertype) & RTPACKET_HASH_KEY_MASK) as usize
}

impl PacketTypeTable {
    pub fn new() -> PacketTypeTable {
        PacketTypeTable {
            buckets: core::array::from_fn(|_| RwLock::new(heapless::Vec::new())),
        }
    }

    /// Link a protocol into its hash bucket.
    pub fn add_pack(&self, pt: Arc<PacketType>) -> Result<()> {
        let mut bucket = self.buckets[hash(pt.ethertype)].write().unwrap();
        bucket.push(pt).map_err(|_| Error::Busy)
    }

    /// Unlink a protocol. Fails with [`Error::InUse`] while a handler call
    /// is in flight.
    pub fn remove_pack(&self, pt: &Arc<PacketType>) -> Result<()> {
        let mut bucket = self.buckets[hash(pt.ethertype)].write().unwrap();
        let pos = bucket
            .iter()
            .position(|entry| Arc::ptr_eq(entry, pt))
            .ok_or(Error::NoEntry)?;
        if pt.refcount.load(Ordering::Acquire) != 0 {
            return Err(Error::InUse);
        }
        bucket.swap_remove(pos);
        Ok(())
    }

    /// Offer `skb` to each handler matching its protocol, in registration
    /// order, until one consumes it. Unconsumed packets come back.
    fn deliver(&self, skb: RtSkb) -> core::result::Result<(), RtSkb> {
        // Snapshot the matching handlers with their refcounts held so the
        // bucket lock is not held across handler calls.
        let mut matches: heapless::Vec<Arc<PacketType>, RTPACKET_BUCKET_SIZE> =
            heapless::Vec::new();
        {
            let bucket = self.buckets[hash(skb.protocol)].read().unwrap();
            for pt in bucket.iter() {
                if pt.ethertype == skb.protocol {
                    pt.refcount.fetch_add(1, Ordering::AcqRel);
                    // Bucket and snapshot share a capacity bound.
                    let _ = matches.push(pt.clone());
                }
            }
        }

        let mut verdict = Err(skb);
        for pt in &matches {
            verdict = match verdict {
                Err(skb) => (pt.handler)(skb),
                Ok(()) => break,
            };
        }
        for pt in &matches {
            pt.refcount.fetch_sub(1, Ordering::AcqRel);
        }
        verdict
    }
}

impl Default for PacketTypeTable {
    fn default() -> Self {
        Self::new()
    }
}

struct StackCore {
    ring: SpscRing<RtSkb>,
    event: Event,
    packet_types: PacketTypeTable,
    rx_dropped: AtomicU64,
}

/// The driver-facing injection handle; cheap to clone.
#[derive(Clone)]
pub struct StackRx {
    core: Arc<StackCore>,
}

impl StackRx {
    /// Enqueue a received packet for the stack-manager task. On ring
    /// overflow the packet is dropped and counted; this path never blocks.
    pub fn rx(&self, skb: RtSkb) {
        if let Err(skb) = self.core.ring.try_push(skb) {
            self.core.rx_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("stack ring overflow, dropping packet");
            drop(skb);
        }
        self.core.event.signal();
    }
}

/// The stack manager: owns the RX ring and the task draining it.
pub struct StackManager {
    core: Arc<StackCore>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StackManager {
    pub fn new(ring_size: usize) -> StackManager {
        StackManager {
            core: Arc::new(StackCore {
                ring: SpscRing::new(ring_size),
                event: Event::new(),
                packet_types: PacketTypeTable::new(),
                rx_dropped: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn packet_types(&self) -> &PacketTypeTable {
        &self.core.packet_types
    }

    /// Packets dropped because the RX ring was full.
    pub fn rx_dropped(&self) -> u64 {
        self.core.rx_dropped.load(Ordering::Relaxed)
    }

    /// The handle drivers use to inject received packets.
    pub fn rx_handle(&self) -> StackRx {
        StackRx {
            core: self.core.clone(),
        }
    }

    /// Start the manager task. Idempotent.
    pub fn spawn(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let core = self.core.clone();
        *task = Some(
            std::thread::Builder::new()
                .name("rtnet-stack".into())
                .spawn(move || stack_mgr_task(&core))
                .expect("failed to spawn stack manager"),
        );
    }

    /// Stop the manager task, draining and releasing queued packets.
    pub fn shutdown(&self) {
        self.core.event.close();
        if let Some(task) = self.task.lock().unwrap().take() {
            let _ = task.join();
        }
        while let Some(skb) = self.core.ring.pop() {
            drop(skb);
        }
    }
}

impl Drop for StackManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stack_mgr_task(core: &StackCore) {
    loop {
        let closed = core.event.wait(Timeout::Infinite).is_err();
        while let Some(mut skb) = core.ring.pop() {
            skb.mark_network_header();
            let promisc = skb
                .dev
                .as_ref()
                .map(|dev| dev.flags() & IFF_PROMISC != 0)
                .unwrap_or(false);
            let protocol = skb.protocol;

            if let Err(skb) = core.packet_types.deliver(skb) {
                if !promisc {
                    trace!(
                        "no one cared for packet with layer 3 protocol {}",
                        protocol
                    );
                }
                drop(skb);
            }
        }
        if closed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skb::Pool;
    use std::sync::atomic::AtomicUsize;

    fn skb_with_proto(pool: &Pool, proto: EthernetProtocol) -> RtSkb {
        let mut skb = pool.alloc(64).unwrap();
        skb.protocol = proto;
        skb
    }

    #[test]
    fn handler_chain_consumes_or_drops() {
        let table = PacketTypeTable::new();
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let calls = first_calls.clone();
            PacketType::new(
                EthernetProtocol::Ipv4,
                "refuse",
                Box::new(move |skb| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    Err(skb)
                }),
            )
        };
        let second = {
            let calls = second_calls.clone();
            PacketType::new(
                EthernetProtocol::Ipv4,
                "consume",
                Box::new(move |skb| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    drop(skb);
                    Ok(())
                }),
            )
        };
        table.add_pack(first.clone()).unwrap();
        table.add_pack(second.clone()).unwrap();

        let pool = Pool::new(2, 64);
        assert!(table
            .deliver(skb_with_proto(&pool, EthernetProtocol::Ipv4))
            .is_ok());
        assert_eq!(first_calls.load(Ordering::Relaxed), 1);
        assert_eq!(second_calls.load(Ordering::Relaxed), 1);

        // No handler for ARP: the packet comes back.
        assert!(table
            .deliver(skb_with_proto(&pool, EthernetProtocol::Arp))
            .is_err());
    }

    #[test]
    fn remove_pack_lifecycle() {
        let table = PacketTypeTable::new();
        let pt = PacketType::new(EthernetProtocol::Arp, "arp", Box::new(|skb| Err(skb)));
        table.add_pack(pt.clone()).unwrap();
        table.remove_pack(&pt).unwrap();
        assert_eq!(table.remove_pack(&pt), Err(Error::NoEntry));
    }

    #[test]
    fn manager_task_dispatches_in_order() {
        let manager = StackManager::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pt = {
            let seen = seen.clone();
            PacketType::new(
                EthernetProtocol::Ipv4,
                "record",
                Box::new(move |skb| {
                    seen.lock().unwrap().push(skb.len());
                    Ok(())
                }),
            )
        };
        manager.packet_types().add_pack(pt).unwrap();
        manager.spawn();

        let pool = Pool::new(4, 64);
        let rx = manager.rx_handle();
        for len in [1usize, 2, 3] {
            let mut skb = skb_with_proto(&pool, EthernetProtocol::Ipv4);
            skb.put(len);
            rx.rx(skb);
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        while seen.lock().unwrap().len() < 3 {
            assert!(std::time::Instant::now() < deadline, "packets not drained");
            std::thread::yield_now();
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        manager.shutdown();
        // All buffers returned to the pool.
        assert_eq!(pool.stats().free, 4);
    }

    #[test]
    fn ring_overflow_drops_and_counts() {
        let manager = StackManager::new(2);
        // No task spawned: the ring fills up.
        let pool = Pool::new(8, 64);
        let rx = manager.rx_handle();
        for _ in 0..5 {
            rx.rx(skb_with_proto(&pool, EthernetProtocol::Ipv4));
        }
        assert!(manager.rx_dropped() >= 3);
        manager.shutdown();
        assert_eq!(pool.stats().free, 8);
    }
}
