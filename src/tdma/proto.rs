//! TDMA frame construction and reception.
//!
//! Timestamp handling follows the clock-domain-correction scheme: the
//! transmit-stamp field of an outgoing frame is preloaded with the
//! sender's clock offset (master minus local), and the device layer adds
//! the local transmit time when the frame leaves. The stamp on the wire
//! is therefore already in the master's clock domain.

use std::sync::atomic::Ordering;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::rtmac;
use crate::skb::RtSkb;
use crate::wire::{
    CalReplyRepr, CalRequestRepr, DisciplineType, SyncRepr, TdmaFrameId,
    ETHERNET_HEADER_LEN, RTMAC_HEADER_LEN,
};

use super::worker::Job;
use super::{flag, TdmaInner};

fn frame_headroom() -> usize {
    (ETHERNET_HEADER_LEN + RTMAC_HEADER_LEN + 15) & !15
}

/// Offset of a payload field within `skb.data()` once the RTmac and
/// Ethernet headers are in front.
const fn patch_offset(field_offset: usize) -> usize {
    ETHERNET_HEADER_LEN + RTMAC_HEADER_LEN + field_offset
}

/// Emit this cycle's SYNC frame.
pub(super) fn xmit_sync_frame(inner: &TdmaInner) {
    let clock_offset = inner.clock_offset.load(Ordering::Relaxed);
    let cycle_start = inner.current_cycle_start.load(Ordering::Relaxed);
    let repr = SyncRepr {
        cycle_no: inner.current_cycle.load(Ordering::Relaxed) as u16,
        sched_xmit_stamp: (cycle_start + clock_offset) as u64,
        // Preloaded correction; the device adds the local transmit time.
        xmit_stamp: clock_offset as u64,
    };

    let Some(mut skb) = inner.pool.alloc(frame_headroom() + repr.buffer_len()) else {
        warn!("{}: failed to transmit sync frame", inner.dev.name());
        return;
    };
    skb.reserve(frame_headroom());
    repr.emit(skb.put(repr.buffer_len()));
    rtmac::add_header(
        &inner.dev,
        inner.dev.broadcast_hwaddr(),
        &mut skb,
        DisciplineType::Tdma,
        0,
    );
    skb.xmit_stamp_offset = Some(patch_offset(SyncRepr::XMIT_STAMP_OFFSET));

    if rtmac::xmit(skb, &inner.dev).is_err() {
        warn!("{}: failed to transmit sync frame", inner.dev.name());
    }
}

/// Emit a calibration request towards the master.
pub(super) fn xmit_request_cal_frame(
    inner: &TdmaInner,
    reply_cycle: u32,
    reply_offset: u64,
) -> Result<()> {
    let repr = CalRequestRepr {
        // Local clock: no correction preset.
        xmit_stamp: 0,
        reply_cycle,
        reply_offset,
    };

    let mut skb = inner
        .pool
        .alloc(frame_headroom() + repr.buffer_len())
        .ok_or(Error::NoBufs)?;
    skb.reserve(frame_headroom());
    repr.emit(skb.put(repr.buffer_len()));
    let master = *inner.master_hwaddr.lock().unwrap();
    rtmac::add_header(&inner.dev, master, &mut skb, DisciplineType::Tdma, 0);
    skb.xmit_stamp_offset = Some(patch_offset(CalRequestRepr::XMIT_STAMP_OFFSET));

    rtmac::xmit(skb, &inner.dev)
}

/// The discipline receive entry: SYNC and calibration frames.
pub(super) fn packet_rx(inner: &TdmaInner, skb: RtSkb) {
    match crate::wire::tdma_frame_id(skb.data()) {
        Ok(TdmaFrameId::Sync) => process_sync(inner, &skb),
        Ok(TdmaFrameId::RequestCal) => process_request_cal(inner, &skb),
        Ok(TdmaFrameId::ReplyCal) => process_reply_cal(inner, &skb),
        Ok(TdmaFrameId::Unknown(id)) => {
            warn!("{}: unknown TDMA frame {id:#06x}", inner.dev.name())
        }
        Err(_) => trace!("{}: malformed TDMA frame", inner.dev.name()),
    }
    // Frame consumed either way.
}

fn process_sync(inner: &TdmaInner, skb: &RtSkb) {
    let Ok(sync) = SyncRepr::parse(skb.data()) else {
        return;
    };

    // Widen the 16-bit wire counter into the monotonic cycle count.
    let current = inner.current_cycle.load(Ordering::Acquire);
    let delta = sync.cycle_no.wrapping_sub(current as u16) as i16;
    let new_cycle = current.wrapping_add(delta as i32 as u32);
    if new_cycle < current {
        inner.stale_syncs.fetch_add(1, Ordering::Relaxed);
        trace!("{}: stale sync (cycle {new_cycle})", inner.dev.name());
        return;
    }
    if new_cycle > current + 1 && current != 0 {
        inner
            .missed_syncs
            .fetch_add((new_cycle - current - 1) as u64, Ordering::Relaxed);
    }

    // Time arithmetic: clock_offset = (xmit + delay) - rx_local;
    // cycle_start = sched - clock_offset.
    let delay = inner.master_packet_delay.load(Ordering::Relaxed);
    let clock_offset =
        (sync.xmit_stamp as i64 + delay) - skb.rx_stamp.total_nanos();
    let cycle_start = sync.sched_xmit_stamp as i64 - clock_offset;

    inner.clock_offset.store(clock_offset, Ordering::Release);
    inner.current_cycle_start.store(cycle_start, Ordering::Release);
    inner.current_cycle.store(new_cycle, Ordering::Release);
    *inner.master_hwaddr.lock().unwrap() = skb.src_hwaddr;

    inner.set_flag(flag::RECEIVED_SYNC);
    inner.sync_event.signal();
}

/// Master side: queue a prebuilt reply for the requested cycle and slot.
fn process_request_cal(inner: &TdmaInner, skb: &RtSkb) {
    let Ok(request) = CalRequestRepr::parse(skb.data()) else {
        return;
    };
    let clock_offset = inner.clock_offset.load(Ordering::Relaxed);
    let repr = CalReplyRepr {
        request_xmit_stamp: request.xmit_stamp,
        reception_stamp: (skb.rx_stamp.total_nanos() + clock_offset) as u64,
        xmit_stamp: clock_offset as u64,
    };

    let Some(mut reply) = inner.pool.alloc(frame_headroom() + repr.buffer_len()) else {
        warn!("{}: no buffer for calibration reply", inner.dev.name());
        return;
    };
    reply.reserve(frame_headroom());
    repr.emit(reply.put(repr.buffer_len()));
    rtmac::add_header(
        &inner.dev,
        skb.src_hwaddr,
        &mut reply,
        DisciplineType::Tdma,
        0,
    );
    reply.xmit_stamp_offset = Some(patch_offset(CalReplyRepr::XMIT_STAMP_OFFSET));

    debug!(
        "{}: calibration request from {}, replying in cycle {}",
        inner.dev.name(),
        skb.src_hwaddr,
        request.reply_cycle
    );
    let mut state = inner.state.lock().unwrap();
    state.insert_job(
        request.reply_offset as i64,
        Job::XmitRplCal {
            reply_cycle: request.reply_cycle,
            reply_offset: request.reply_offset as i64,
        },
        Some(reply),
    );
}

/// Slave side: account the measured round and schedule the next one.
fn process_reply_cal(inner: &TdmaInner, skb: &RtSkb) {
    let Ok(reply) = CalReplyRepr::parse(skb.data()) else {
        return;
    };

    let round_trip = (skb.rx_stamp.total_nanos() - reply.request_xmit_stamp as i64)
        - (reply.xmit_stamp as i64 - reply.reception_stamp as i64);
    let delay = round_trip / 2;
    if delay < 0 {
        trace!("{}: negative calibration delay, ignoring", inner.dev.name());
        return;
    }

    if let Some((offset, period, phasing)) = inner.calibration_round(delay) {
        let mut state = inner.state.lock().unwrap();
        state.insert_job(
            offset,
            Job::XmitReqCal {
                offset,
                period,
                phasing,
            },
            None,
        );
    }
}
