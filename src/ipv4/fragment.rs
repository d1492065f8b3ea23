//! IPv4 reassembly.
//!
//! A bounded set of collectors, one per in-flight datagram, each backed by
//! a single maximum-size rtskb the fragments are copied into. Collectors
//! expire after [`crate::config::FRAGMENT_TTL_NS`]; when all are busy the
//! oldest is evicted. The reassembled datagram therefore never exceeds one
//! rtskb, which is why the pool buffer size bounds the largest
//! reassemblable datagram.
//!
//! Duplicate fragments (exact resends) are tolerated; a fragment whose
//! byte range properly overlaps already-received data conflicts with it
//! and rejects the whole datagram.

use std::sync::Mutex;

use log::{debug, trace};

use crate::config::{COLLECTOR_COUNT, FRAGMENT_TTL_NS};
use crate::skb::{Pool, RtSkb};
use crate::storage::{AddError, Assembler};
use crate::time::{Duration, Instant};
use crate::wire::{Ipv4FragKey, Ipv4Packet, IPV4_HEADER_LEN};

struct Collector {
    key: Ipv4FragKey,
    skb: RtSkb,
    assembler: Assembler,
    /// Known once the final fragment (MF clear) arrived.
    total_len: Option<usize>,
    last_update: Instant,
}

pub struct FragTable {
    collectors: Mutex<Vec<Option<Collector>>>,
    pool: Pool,
}

impl FragTable {
    /// `pool` provides the collector buffers; its buffer size bounds the
    /// reassembled datagram.
    pub fn new(pool: Pool) -> FragTable {
        let mut collectors = Vec::with_capacity(COLLECTOR_COUNT);
        collectors.resize_with(COLLECTOR_COUNT, || None);
        FragTable {
            collectors: Mutex::new(collectors),
            pool,
        }
    }

    /// Release every collector whose datagram went stale.
    pub fn sweep(&self, now: Instant) {
        let ttl = Duration::from_nanos(FRAGMENT_TTL_NS);
        let mut collectors = self.collectors.lock().unwrap();
        for slot in collectors.iter_mut() {
            if let Some(collector) = slot {
                if now - collector.last_update > ttl {
                    debug!("reassembly timeout, dropping datagram");
                    *slot = None;
                }
            }
        }
    }

    /// Feed one fragment. Returns the reassembled datagram once complete:
    /// an skb whose network header is the rebuilt IPv4 header and whose
    /// payload is the full transport datagram.
    ///
    /// The fragment's `data` must point at its transport payload and its
    /// network header must still be recorded on the skb.
    pub fn defrag(&self, skb: RtSkb) -> Option<RtSkb> {
        let now = Instant::now();
        self.sweep(now);

        let (key, offset, more_frags, header) = {
            let header_bytes = skb.network_header();
            let packet = Ipv4Packet::new_checked(header_bytes).ok()?;
            (
                packet.frag_key(),
                packet.frag_offset() as usize,
                packet.more_frags(),
                {
                    let mut copy = [0u8; IPV4_HEADER_LEN];
                    copy.copy_from_slice(&header_bytes[..IPV4_HEADER_LEN]);
                    copy
                },
            )
        };
        let payload = skb.data();
        let payload_len = payload.len();

        let mut collectors = self.collectors.lock().unwrap();
        let slot_index = match collectors
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|c| c.key == key))
        {
            Some(index) => index,
            None => self.fresh_slot(&mut collectors)?,
        };

        {
            let slot = &mut collectors[slot_index];
            if slot.is_none() {
                let mut buf = self.pool.alloc(self.pool.buf_size())?;
                buf.put(self.pool.buf_size());
                *slot = Some(Collector {
                    key,
                    skb: buf,
                    assembler: Assembler::new(),
                    total_len: None,
                    last_update: now,
                });
            }
            let collector = slot.as_mut().unwrap();
            collector.last_update = now;

            if IPV4_HEADER_LEN + offset + payload_len > collector.skb.len() {
                trace!("fragment beyond collector capacity, dropping datagram");
                *slot = None;
                return None;
            }
            match collector.assembler.add(offset, payload_len) {
                Ok(()) => {}
                Err(AddError::Overlap) => {
                    trace!("overlapping fragment, dropping datagram");
                    *slot = None;
                    return None;
                }
                Err(AddError::TooFragmented) => {
                    trace!("fragment pattern too scattered, dropping datagram");
                    *slot = None;
                    return None;
                }
            }
            collector.skb.data_mut()[IPV4_HEADER_LEN + offset..][..payload_len]
                .copy_from_slice(payload);
            if offset == 0 {
                // Keep the leading fragment's header for the final rebuild.
                collector.skb.data_mut()[..IPV4_HEADER_LEN].copy_from_slice(&header);
            }
            if !more_frags {
                collector.total_len = Some(offset + payload_len);
            }
        }
        drop(skb);

        let complete = {
            let collector = collectors[slot_index].as_ref().unwrap();
            collector
                .total_len
                .is_some_and(|total| collector.assembler.is_complete(total))
        };
        if !complete {
            return None;
        }

        let collector = collectors[slot_index].take().unwrap();
        let total = collector.total_len.unwrap();
        let mut skb = collector.skb;
        skb.trim(IPV4_HEADER_LEN + total);
        {
            let mut packet = Ipv4Packet::new_unchecked(skb.data_mut());
            packet.set_header_len(IPV4_HEADER_LEN as u8);
            packet.set_total_len((IPV4_HEADER_LEN + total) as u16);
            packet.clear_flags();
            packet.fill_checksum();
        }
        skb.mark_network_header();
        skb.pull(IPV4_HEADER_LEN);
        Some(skb)
    }

    /// Find a free slot, evicting the stalest collector if none is free.
    fn fresh_slot(&self, collectors: &mut [Option<Collector>]) -> Option<usize> {
        if let Some(index) = collectors.iter().position(Option::is_none) {
            return Some(index);
        }
        let oldest = collectors
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.as_ref().map(|c| c.last_update))?
            .0;
        debug!("collector table full, evicting oldest datagram");
        collectors[oldest] = None;
        Some(oldest)
    }
}
