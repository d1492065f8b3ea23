//! The rtskb packet descriptor and the pools that own it.
//!
//! Every packet travelling through the stack lives in an `RtSkb`: a
//! fixed-capacity buffer drawn from a [`Pool`] plus the cursors `data`,
//! `tail` and `end` into it, with `0 <= data <= tail <= end <= capacity`
//! and `len == tail - data` holding after every public operation.
//!
//! An rtskb belongs to exactly one pool at any instant. Dropping it
//! re-enqueues the buffer on that pool; [`RtSkb::acquire`] transfers it to
//! another pool by refunding a placeholder buffer first, so a receive path
//! can donate a packet to its destination socket without starving the
//! driver's pool. Allocation and release are O(1) and never block; only
//! pool creation and extension allocate memory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::time::Instant;
use crate::wire::{EthernetAddress, EthernetProtocol};

/// How a received frame was addressed, derived from its destination MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketKind {
    #[default]
    Host,
    Broadcast,
    Multicast,
    /// Addressed to another station; seen in promiscuous mode only.
    OtherHost,
    Outgoing,
}

/// The transmit path a packet takes through an attached discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Channel {
    /// Deterministic traffic, scheduled into real-time slots.
    #[default]
    Rt,
    /// Best-effort traffic, scheduled into the non-real-time slot.
    Nrt,
}

struct SkbBuf {
    bytes: Box<[u8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers owned by the pool (free + in flight).
    pub capacity: usize,
    /// Buffers currently enqueued and allocatable.
    pub free: usize,
    /// Buffers currently out with packets.
    pub in_flight: usize,
    /// High-water mark of `in_flight`.
    pub peak_in_flight: usize,
}

/// Process-wide pool accounting, aggregated over every live pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateStats {
    pub pools: usize,
    pub peak_pools: usize,
    pub buffers: usize,
    pub peak_buffers: usize,
}

mod aggregate {
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub static POOLS: AtomicUsize = AtomicUsize::new(0);
    pub static PEAK_POOLS: AtomicUsize = AtomicUsize::new(0);
    pub static BUFFERS: AtomicUsize = AtomicUsize::new(0);
    pub static PEAK_BUFFERS: AtomicUsize = AtomicUsize::new(0);

    pub fn add(counter: &AtomicUsize, peak: &AtomicUsize, n: usize) {
        let now = counter.fetch_add(n, Ordering::Relaxed) + n;
        peak.fetch_max(now, Ordering::Relaxed);
    }

    pub fn sub(counter: &AtomicUsize, n: usize) {
        counter.fetch_sub(n, Ordering::Relaxed);
    }
}

/// Snapshot the aggregate pool statistics.
pub fn aggregate_stats() -> AggregateStats {
    use std::sync::atomic::Ordering;
    AggregateStats {
        pools: aggregate::POOLS.load(Ordering::Relaxed),
        peak_pools: aggregate::PEAK_POOLS.load(Ordering::Relaxed),
        buffers: aggregate::BUFFERS.load(Ordering::Relaxed),
        peak_buffers: aggregate::PEAK_BUFFERS.load(Ordering::Relaxed),
    }
}

struct PoolShared {
    free: Mutex<VecDeque<SkbBuf>>,
    buf_size: usize,
    capacity: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        aggregate::sub(&aggregate::POOLS, 1);
        aggregate::sub(
            &aggregate::BUFFERS,
            self.capacity.load(Ordering::Relaxed),
        );
    }
}

impl PoolShared {
    fn note_in_flight(&self) {
        let in_flight = self
            .capacity
            .load(Ordering::Relaxed)
            .saturating_sub(self.free.lock().unwrap().len());
        self.peak_in_flight.fetch_max(in_flight, Ordering::Relaxed);
    }
}

/// A FIFO pool of rtskb buffers, shared by handle.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Create a pool of `count` buffers of `buf_size` bytes each.
    pub fn new(count: usize, buf_size: usize) -> Pool {
        let pool = Pool {
            shared: Arc::new(PoolShared {
                free: Mutex::new(VecDeque::with_capacity(count)),
                buf_size,
                capacity: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
        };
        aggregate::add(&aggregate::POOLS, &aggregate::PEAK_POOLS, 1);
        pool.extend(count);
        pool
    }

    /// The fixed buffer capacity of this pool's rtskbs.
    pub fn buf_size(&self) -> usize {
        self.shared.buf_size
    }

    /// Add `count` fresh buffers. Returns how many were added. Not for use
    /// on the fast path.
    pub fn extend(&self, count: usize) -> usize {
        let mut free = self.shared.free.lock().unwrap();
        for _ in 0..count {
            free.push_back(SkbBuf {
                bytes: vec![0u8; self.shared.buf_size].into_boxed_slice(),
            });
        }
        self.shared.capacity.fetch_add(count, Ordering::Relaxed);
        aggregate::add(&aggregate::BUFFERS, &aggregate::PEAK_BUFFERS, count);
        count
    }

    /// Remove up to `count` free buffers. Returns how many were removed;
    /// buffers out with packets are never reclaimed.
    pub fn shrink(&self, count: usize) -> usize {
        let mut free = self.shared.free.lock().unwrap();
        let mut removed = 0;
        while removed < count {
            if free.pop_front().is_none() {
                break;
            }
            removed += 1;
        }
        self.shared.capacity.fetch_sub(removed, Ordering::Relaxed);
        aggregate::sub(&aggregate::BUFFERS, removed);
        removed
    }

    /// Dequeue a buffer and dress it as an rtskb with `end = size`.
    /// Fails when the pool is empty or `size` exceeds the buffer capacity.
    pub fn alloc(&self, size: usize) -> Option<RtSkb> {
        if size > self.shared.buf_size {
            return None;
        }
        let buf = self.shared.free.lock().unwrap().pop_front()?;
        self.shared.note_in_flight();
        Some(RtSkb {
            buf: Some(buf),
            pool: self.shared.clone(),
            data: 0,
            tail: 0,
            end: size,
            protocol: EthernetProtocol::Unknown(0),
            pkt_type: PacketKind::default(),
            src_hwaddr: EthernetAddress::default(),
            channel: Channel::default(),
            priority: crate::config::SKB_DEF_RT_PRIO,
            dev: None,
            rx_stamp: Instant::ZERO,
            xmit_stamp_offset: None,
            nh_offset: 0,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.shared.free.lock().unwrap().len();
        let capacity = self.shared.capacity.load(Ordering::Relaxed);
        PoolStats {
            capacity,
            free,
            in_flight: capacity.saturating_sub(free),
            peak_in_flight: self.shared.peak_in_flight.load(Ordering::Relaxed),
        }
    }

    /// Whether `skb` currently belongs to this pool.
    pub fn owns(&self, skb: &RtSkb) -> bool {
        Arc::ptr_eq(&self.shared, &skb.pool)
    }
}

impl core::fmt::Debug for Pool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("buf_size", &self.shared.buf_size)
            .field("free", &stats.free)
            .field("capacity", &stats.capacity)
            .finish()
    }
}

/// A packet descriptor owning one pool buffer.
pub struct RtSkb {
    buf: Option<SkbBuf>,
    pool: Arc<PoolShared>,
    data: usize,
    tail: usize,
    end: usize,

    /// Layer-3 protocol from the Ethernet header.
    pub protocol: EthernetProtocol,
    pub pkt_type: PacketKind,
    /// Sender's hardware address, recorded when the Ethernet header is
    /// stripped on reception.
    pub src_hwaddr: EthernetAddress,
    pub channel: Channel,
    /// Transmit priority, 0 most urgent.
    pub priority: u8,
    /// Receiving or transmitting device.
    pub dev: Option<Arc<crate::device::Device>>,
    /// Stamped by the driver on reception.
    pub rx_stamp: Instant,
    /// If set, the device layer patches the transmit timestamp at this
    /// offset into `data()` right before the frame leaves.
    pub xmit_stamp_offset: Option<usize>,

    nh_offset: usize,
}

impl RtSkb {
    /// Bytes between `data` and `tail`.
    pub fn len(&self) -> usize {
        self.tail - self.data
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Room left behind `tail`.
    pub fn tailroom(&self) -> usize {
        self.end - self.tail
    }

    /// Room in front of `data`.
    pub fn headroom(&self) -> usize {
        self.data
    }

    pub fn data(&self) -> &[u8] {
        &self.buf.as_ref().unwrap().bytes[self.data..self.tail]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut().unwrap().bytes[self.data..self.tail]
    }

    /// Move both cursors forward to reserve headroom on an empty skb.
    pub fn reserve(&mut self, n: usize) {
        assert!(self.tail + n <= self.end, "rtskb reserve beyond end");
        self.data += n;
        self.tail += n;
    }

    /// Extend the payload by `n` bytes at the tail.
    pub fn put(&mut self, n: usize) -> &mut [u8] {
        assert!(self.tail + n <= self.end, "rtskb put beyond end");
        let old_tail = self.tail;
        self.tail += n;
        &mut self.buf.as_mut().unwrap().bytes[old_tail..self.tail]
    }

    /// Prepend `n` bytes of headroom to the payload.
    pub fn push(&mut self, n: usize) -> &mut [u8] {
        assert!(self.data >= n, "rtskb push beyond start");
        self.data -= n;
        &mut self.buf.as_mut().unwrap().bytes[self.data..self.data + n]
    }

    /// Strip `n` bytes from the front of the payload.
    pub fn pull(&mut self, n: usize) {
        assert!(n <= self.len(), "rtskb pull beyond tail");
        self.data += n;
    }

    /// Cut the payload down to `len` bytes.
    pub fn trim(&mut self, len: usize) {
        if len < self.len() {
            self.tail = self.data + len;
        }
    }

    /// Record the current `data` position as the network header.
    pub fn mark_network_header(&mut self) {
        self.nh_offset = self.data;
    }

    /// The payload from the recorded network header to `tail`.
    pub fn network_header(&self) -> &[u8] {
        &self.buf.as_ref().unwrap().bytes[self.nh_offset..self.tail]
    }

    /// Transfer ownership to `new_pool`, refunding one of its free buffers
    /// into the current owner so that pool can receive again immediately.
    /// Without a free buffer in `new_pool` the transfer fails and nothing
    /// changes.
    pub fn acquire(&mut self, new_pool: &Pool) -> Result<()> {
        if Arc::ptr_eq(&self.pool, &new_pool.shared) {
            return Ok(());
        }
        if new_pool.shared.buf_size < self.pool.buf_size {
            return Err(Error::BadParam);
        }
        let placeholder = new_pool
            .shared
            .free
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(Error::PoolEmpty)?;
        self.pool.free.lock().unwrap().push_back(placeholder);
        self.pool = new_pool.shared.clone();
        self.pool.note_in_flight();
        Ok(())
    }

    #[cfg(test)]
    fn cursors(&self) -> (usize, usize, usize) {
        (self.data, self.tail, self.end)
    }
}

impl Drop for RtSkb {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.lock().unwrap().push_back(buf);
        }
    }
}

impl core::fmt::Debug for RtSkb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RtSkb")
            .field("len", &self.len())
            .field("data", &self.data)
            .field("tail", &self.tail)
            .field("end", &self.end)
            .field("protocol", &self.protocol)
            .field("pkt_type", &self.pkt_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_resets_cursors() {
        let pool = Pool::new(2, 256);
        let skb = pool.alloc(128).unwrap();
        assert_eq!(skb.cursors(), (0, 0, 128));
        assert_eq!(skb.len(), 0);
        assert_eq!(skb.tailroom(), 128);
    }

    #[test]
    fn oversized_alloc_rejected() {
        let pool = Pool::new(1, 256);
        assert!(pool.alloc(256).is_some());
        // Pool is now empty and the size check is independent of that.
        assert!(pool.alloc(257).is_none());
    }

    #[test]
    fn empty_pool_alloc_fails_and_drop_refills() {
        let pool = Pool::new(1, 64);
        let skb = pool.alloc(64).unwrap();
        assert!(pool.alloc(1).is_none());
        drop(skb);
        assert!(pool.alloc(1).is_some());
    }

    #[test]
    fn cursor_ops_uphold_invariants() {
        let pool = Pool::new(1, 256);
        let mut skb = pool.alloc(200).unwrap();
        skb.reserve(16);
        assert_eq!(skb.cursors(), (16, 16, 200));
        skb.put(100).fill(0xaa);
        assert_eq!(skb.len(), 100);
        skb.push(14).fill(0xbb);
        assert_eq!(skb.len(), 114);
        skb.pull(14);
        assert_eq!(skb.len(), 100);
        skb.trim(60);
        assert_eq!(skb.len(), 60);
        let (data, tail, end) = skb.cursors();
        assert!(data <= tail && tail <= end);
    }

    #[test]
    #[should_panic(expected = "rtskb put beyond end")]
    fn put_overflow_panics() {
        let pool = Pool::new(1, 64);
        let mut skb = pool.alloc(64).unwrap();
        skb.put(65);
    }

    #[test]
    #[should_panic(expected = "rtskb push beyond start")]
    fn push_underflow_panics() {
        let pool = Pool::new(1, 64);
        let mut skb = pool.alloc(64).unwrap();
        skb.push(1);
    }

    #[test]
    fn acquire_preserves_pool_counts() {
        let source = Pool::new(4, 128);
        let dest = Pool::new(2, 128);

        let mut skb = source.alloc(64).unwrap();
        assert_eq!(source.stats().free, 3);
        assert_eq!(dest.stats().free, 2);

        skb.acquire(&dest).unwrap();
        assert!(dest.owns(&skb));
        // The source got its buffer count back at once.
        assert_eq!(source.stats().free, 4);
        assert_eq!(dest.stats().free, 1);

        drop(skb);
        assert_eq!(dest.stats().free, 2);
        assert_eq!(source.stats().free, 4);
    }

    #[test]
    fn acquire_from_empty_pool_fails_without_side_effects() {
        let source = Pool::new(1, 128);
        let dest = Pool::new(1, 128);
        let _held = dest.alloc(1).unwrap();

        let mut skb = source.alloc(64).unwrap();
        assert_eq!(skb.acquire(&dest), Err(Error::PoolEmpty));
        assert!(source.owns(&skb));
        assert_eq!(source.stats().free, 0);
    }

    #[test]
    fn conservation_through_extend_and_shrink() {
        let pool = Pool::new(2, 64);
        assert_eq!(pool.extend(3), 3);
        assert_eq!(pool.stats().capacity, 5);

        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(1).unwrap();
        // Only free buffers can be removed.
        assert_eq!(pool.shrink(10), 3);
        let stats = pool.stats();
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.free, 0);
        assert_eq!(stats.in_flight, 2);

        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.capacity, stats.free);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn peak_in_flight_tracks_high_water() {
        let pool = Pool::new(3, 64);
        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(1).unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.stats().peak_in_flight, 2);
    }
}
