//! The per-device worker task.
//!
//! One pass over the sorted job ring per cycle. The boundary job sits at
//! the head (`WaitOnSync` for slaves, `XmitSync` for the master,
//! `BackupSync` for backups) and advances the cycle; slot and calibration
//! jobs follow in offset order. All sleeping happens outside the state
//! lock. The job-list revision counter re-synchronizes the worker's
//! cursor after any mutation, whether by an admin call or by a
//! self-removing job.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::trace;

use crate::rtmac;
use crate::sync::Event;
use crate::time::{sleep_until, Instant, Timeout};

use super::proto;
use super::{flag, TdmaInner};

/// A scheduled activity within the cycle.
#[derive(Debug, Clone)]
pub(crate) enum Job {
    /// Block until the next SYNC arrives (slave boundary).
    WaitOnSync,
    /// Sleep to the end of the cycle, advance, transmit SYNC (master
    /// boundary).
    XmitSync,
    /// Sleep into the next cycle's backup offset; transmit SYNC only if
    /// the master's never appeared (backup boundary).
    BackupSync,
    /// Fire transmit slot `slot` in matching cycles.
    Slot { slot: usize },
    /// Transmit one calibration request, then leave the ring until the
    /// reply arrives.
    XmitReqCal { offset: i64, period: u32, phasing: u32 },
    /// Transmit a prebuilt calibration reply in its assigned cycle.
    XmitRplCal { reply_cycle: u32, reply_offset: i64 },
}

pub(crate) struct JobEntry {
    pub id: u64,
    /// Sort key: boundary jobs use `i64::MIN`, others their cycle offset.
    pub key: i64,
    pub job: Job,
    /// Prebuilt frame for `XmitRplCal`.
    pub frame: Option<crate::skb::RtSkb>,
}

fn wait(event: &Event) -> bool {
    event.wait(Timeout::Infinite).is_ok()
}

pub(crate) fn worker_task(inner: Arc<TdmaInner>) {
    if !wait(&inner.worker_wakeup) || inner.flag(flag::SHUTDOWN) {
        return;
    }

    let mut index = 0usize;
    let mut seen_revision = {
        let state = inner.state.lock().unwrap();
        state.revision
    };

    loop {
        if inner.flag(flag::SHUTDOWN) {
            return;
        }

        let (job_id, key, job) = {
            let state = inner.state.lock().unwrap();
            if state.jobs.is_empty() {
                return;
            }
            if index >= state.jobs.len() {
                index = 0;
            }
            seen_revision = state.revision;
            let entry = &state.jobs[index];
            (entry.id, entry.key, entry.job.clone())
        };

        let cycle = inner.current_cycle.load(Ordering::Acquire);
        let cycle_start = inner.current_cycle_start.load(Ordering::Acquire);
        let period_ns = inner.cycle_period.load(Ordering::Relaxed);

        match job {
            Job::WaitOnSync => {
                if !wait(&inner.sync_event) {
                    return;
                }
            }

            Job::XmitSync => {
                sleep_until(Instant::from_nanos(cycle_start + period_ns));
                inner.current_cycle.fetch_add(1, Ordering::AcqRel);
                inner
                    .current_cycle_start
                    .fetch_add(period_ns, Ordering::AcqRel);
                proto::xmit_sync_frame(&inner);
                inner.sync_event.signal();
            }

            Job::BackupSync => {
                let inc = inner.backup_sync_inc.load(Ordering::Relaxed);
                sleep_until(Instant::from_nanos(cycle_start + inc));
                // Take over only when every earlier master stayed silent.
                if !inner.test_and_clear_flag(flag::RECEIVED_SYNC) {
                    inner.current_cycle.fetch_add(1, Ordering::AcqRel);
                    inner
                        .current_cycle_start
                        .fetch_add(period_ns, Ordering::AcqRel);
                    proto::xmit_sync_frame(&inner);
                    inner.set_flag(flag::BACKUP_ACTIVE);
                    inner.sync_event.signal();
                } else {
                    inner.clear_flag(flag::BACKUP_ACTIVE);
                }
            }

            Job::Slot { slot } => {
                let fire = {
                    let state = inner.state.lock().unwrap();
                    state.slots[slot].as_ref().map(|slot| {
                        let fires =
                            slot.period == 1 || cycle % slot.period == slot.phasing;
                        (fires, slot.offset, slot.queue.clone())
                    })
                };
                if let Some((true, offset, queue)) = fire {
                    // Wait for the slot, then release one pending packet.
                    sleep_until(Instant::from_nanos(cycle_start + offset));
                    let skb = queue.lock().unwrap().dequeue();
                    if let Some(skb) = skb {
                        if let Err(err) = rtmac::xmit(skb, &inner.dev) {
                            trace!("slot {slot} transmission failed: {err}");
                        }
                    }
                }
            }

            Job::XmitReqCal {
                offset,
                period,
                phasing,
            } => {
                if period == 1 || cycle % period == phasing {
                    // Leave the ring until the reply re-adds us.
                    {
                        let mut state = inner.state.lock().unwrap();
                        state.remove_job(job_id);
                    }
                    sleep_until(Instant::from_nanos(cycle_start + offset));
                    let reply_cycle = cycle.wrapping_add(period);
                    if let Err(err) =
                        proto::xmit_request_cal_frame(&inner, reply_cycle, offset as u64)
                    {
                        trace!("calibration request failed: {err}");
                        inner.finish_calibration(Err(err));
                    }
                }
            }

            Job::XmitRplCal {
                reply_cycle,
                reply_offset,
            } => {
                if reply_cycle <= cycle {
                    let frame = {
                        let mut state = inner.state.lock().unwrap();
                        state.remove_job(job_id).and_then(|entry| entry.frame)
                    };
                    if reply_cycle == cycle {
                        sleep_until(Instant::from_nanos(cycle_start + reply_offset));
                        if let Some(frame) = frame {
                            let _ = rtmac::xmit(frame, &inner.dev);
                        }
                    } else {
                        // The assigned cycle already passed.
                        trace!("dropping stale calibration reply");
                        drop(frame);
                    }
                }
            }
        }

        // Advance, re-synchronizing against any mutation that happened
        // while this job ran (including our own removals).
        let state = inner.state.lock().unwrap();
        if state.jobs.is_empty() {
            return;
        }
        if state.revision == seen_revision {
            index = (index + 1) % state.jobs.len();
        } else {
            index = state
                .jobs
                .iter()
                .position(|entry| entry.key > key)
                .unwrap_or(0);
            seen_revision = state.revision;
        }
    }
}
