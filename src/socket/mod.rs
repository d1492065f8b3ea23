//! The socket core.
//!
//! A socket owns its own rtskb pool (the receive path donates packets
//! into it via [`crate::skb::RtSkb::acquire`]), an RX queue, and the event
//! its reader blocks on. Protocol specifics (UDP demultiplexing, the
//! public datagram API) live in [`udp`].

pub mod udp;

pub use self::udp::{Udp, UdpSocket};

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::trace;

use crate::config::SKB_DEF_RT_PRIO;
use crate::error::Result;
use crate::skb::{Pool, RtSkb};
use crate::storage::RingBuffer;
use crate::sync::Event;
use crate::time::Timeout;
use crate::wire::Ipv4Address;

/// An RX callback either consumes the packet or passes it back for the
/// default queue-and-wake delivery.
pub type RxCallback = dyn Fn(RtSkb) -> core::result::Result<(), RtSkb> + Send + Sync;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Binding {
    pub local_addr: Ipv4Address,
    pub local_port: u16,
    pub remote_addr: Ipv4Address,
    pub remote_port: u16,
    pub connected: bool,
}

impl Default for Binding {
    fn default() -> Binding {
        Binding {
            local_addr: Ipv4Address::UNSPECIFIED,
            local_port: 0,
            remote_addr: Ipv4Address::UNSPECIFIED,
            remote_port: 0,
            connected: false,
        }
    }
}

/// Protocol-independent socket state.
pub struct Socket {
    pool: Pool,
    rx_queue: Mutex<RingBuffer<'static, RtSkb>>,
    rx_event: Event,
    callback: RwLock<Option<Box<RxCallback>>>,
    timeout_ns: AtomicI64,
    priority: AtomicU8,
    rx_dropped: AtomicU64,
    pub(crate) binding: RwLock<Binding>,
}

impl Socket {
    /// Create a socket with a private pool of `pool_size` buffers of
    /// `buf_size` bytes.
    pub fn new(pool_size: usize, buf_size: usize) -> Arc<Socket> {
        Arc::new(Socket {
            pool: Pool::new(pool_size, buf_size),
            // The queue can hold everything the pool can lend out, plus the
            // same again for buffers donated by extension.
            rx_queue: Mutex::new(RingBuffer::new_owned(2 * pool_size.max(1))),
            rx_event: Event::new(),
            callback: RwLock::new(None),
            timeout_ns: AtomicI64::new(0),
            priority: AtomicU8::new(SKB_DEF_RT_PRIO),
            rx_dropped: AtomicU64::new(0),
            binding: RwLock::new(Binding::default()),
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Receive timeout in nanoseconds: 0 infinite, positive relative,
    /// negative non-blocking.
    pub fn set_timeout(&self, ns: i64) {
        self.timeout_ns.store(ns, Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Timeout {
        Timeout::from_ns(self.timeout_ns.load(Ordering::Relaxed))
    }

    pub fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Install (or clear) the RX callback invoked from handler context.
    pub fn set_callback(&self, callback: Option<Box<RxCallback>>) {
        *self.callback.write().unwrap() = callback;
    }

    /// Packets dropped because the RX queue was full.
    pub fn rx_dropped(&self) -> u64 {
        self.rx_dropped.load(Ordering::Relaxed)
    }

    /// Grow the private pool by `count` buffers.
    pub fn extend_pool(&self, count: usize) -> usize {
        self.pool.extend(count)
    }

    /// Shrink the private pool by up to `count` currently-free buffers;
    /// returns how many were actually removed.
    pub fn shrink_pool(&self, count: usize) -> usize {
        self.pool.shrink(count)
    }

    /// Deliver a received packet: the callback gets the first look, then
    /// the default path enqueues and wakes the reader.
    pub(crate) fn deliver(&self, skb: RtSkb) {
        let skb = {
            let callback = self.callback.read().unwrap();
            match callback.as_ref() {
                Some(callback) => match callback(skb) {
                    Ok(()) => return,
                    Err(skb) => skb,
                },
                None => skb,
            }
        };
        match self.rx_queue.lock().unwrap().enqueue(skb) {
            Ok(()) => self.rx_event.signal(),
            Err(skb) => {
                self.rx_dropped.fetch_add(1, Ordering::Relaxed);
                trace!("socket RX queue full, dropping datagram");
                drop(skb);
            }
        }
    }

    pub(crate) fn dequeue(&self) -> Option<RtSkb> {
        self.rx_queue.lock().unwrap().dequeue()
    }

    /// Block per the socket timeout until new data may be queued.
    pub(crate) fn wait_rx(&self) -> Result<()> {
        self.rx_event.wait(self.timeout())
    }

    /// Unblock readers and release queued packets.
    pub fn close(&self) {
        self.rx_event.close();
        self.rx_queue.lock().unwrap().drain(drop);
    }
}

impl core::fmt::Debug for Socket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Socket")
            .field("binding", &*self.binding.read().unwrap())
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn skb(pool: &Pool) -> RtSkb {
        pool.alloc(64).unwrap()
    }

    #[test]
    fn deliver_queues_and_wakes() {
        let sock = Socket::new(2, 128);
        let feed = Pool::new(1, 128);
        sock.deliver(skb(&feed));
        assert!(sock.dequeue().is_some());
        assert!(sock.dequeue().is_none());
    }

    #[test]
    fn callback_may_consume_or_pass() {
        let sock = Socket::new(2, 128);
        sock.set_callback(Some(Box::new(|skb| {
            if skb.len() == 0 {
                drop(skb);
                Ok(())
            } else {
                Err(skb)
            }
        })));

        let feed = Pool::new(2, 128);
        sock.deliver(skb(&feed)); // len 0: consumed
        assert!(sock.dequeue().is_none());

        let mut fat = skb(&feed);
        fat.put(10);
        sock.deliver(fat); // passed through
        assert!(sock.dequeue().is_some());
    }

    #[test]
    fn close_unblocks_reader() {
        let sock = Socket::new(1, 128);
        sock.set_timeout(0);
        let reader = {
            let sock = sock.clone();
            std::thread::spawn(move || sock.wait_rx())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        sock.close();
        assert_eq!(reader.join().unwrap(), Err(Error::Closed));
    }

    #[test]
    fn nonblocking_timeout_is_immediate() {
        let sock = Socket::new(1, 128);
        sock.set_timeout(-1);
        assert_eq!(sock.wait_rx(), Err(Error::WouldBlock));
    }
}
