//! The TDMA v2 media-access discipline.
//!
//! All stations share the master's clock through periodic SYNC frames.
//! Transmission happens only in configured slots, each defined by its
//! offset from the cycle start, a period/phasing pair selecting the
//! cycles it fires in, and a size cap. A single worker task per device
//! walks the sorted job ring once per cycle; see [`worker`].
//!
//! Backup masters carry a `BackupSync` job instead of `XmitSync`: each
//! cycle they wait until their backup offset into the next cycle and take
//! over SYNC transmission for exactly the cycles in which no earlier
//! master transmitted. Slaves calibrate the master-to-slave propagation
//! delay with request/reply frames before joining (see [`proto`]).

mod proto;
mod worker;

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};

use crate::config::{SKB_MIN_PRIO, TDMA_MAX_SLOTS};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::rtmac::{self, Discipline};
use crate::rtpc::{CallToken, Rtpc, Verdict};
use crate::skb::{Channel, Pool, RtSkb};
use crate::storage::PrioQueue;
use crate::sync::Event;
use crate::time::{Instant, Timeout};
use crate::wire::{DisciplineType, EthernetAddress};

use self::worker::{Job, JobEntry};

/// Slot 0 carries default real-time traffic.
pub const DEFAULT_SLOT: usize = 0;
/// Slot 1 carries default non-real-time (tunnelled) traffic.
pub const DEFAULT_NRT_SLOT: usize = 1;

mod flag {
    pub const SHUTDOWN: u32 = 1 << 0;
    pub const RECEIVED_SYNC: u32 = 1 << 1;
    pub const BACKUP_ACTIVE: u32 = 1 << 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unconfigured,
    Master,
    BackupMaster,
    Slave,
}

pub(crate) struct Slot {
    pub offset: i64,
    pub period: u32,
    pub phasing: u32,
    pub size: usize,
    pub queue: Arc<Mutex<PrioQueue<RtSkb>>>,
}

pub(crate) struct TdmaState {
    pub slots: Vec<Option<Slot>>,
    pub jobs: Vec<JobEntry>,
    pub revision: u64,
    next_job_id: u64,
}

impl TdmaState {
    pub(crate) fn insert_job(&mut self, key: i64, job: Job, frame: Option<RtSkb>) -> u64 {
        let id = self.next_job_id;
        self.next_job_id += 1;
        let pos = self
            .jobs
            .iter()
            .position(|entry| entry.key > key)
            .unwrap_or(self.jobs.len());
        self.jobs.insert(pos, JobEntry { id, key, job, frame });
        self.revision += 1;
        id
    }

    pub(crate) fn remove_job(&mut self, id: u64) -> Option<JobEntry> {
        let pos = self.jobs.iter().position(|entry| entry.id == id)?;
        self.revision += 1;
        Some(self.jobs.remove(pos))
    }
}

struct Calibration {
    token: CallToken,
    results: Vec<i64>,
    remaining: u32,
    /// Request job parameters for the next round.
    offset: i64,
    period: u32,
    phasing: u32,
}

pub(crate) struct TdmaInner {
    pub dev: Arc<Device>,
    pub pool: Pool,
    pub state: Mutex<TdmaState>,
    flags: AtomicU32,
    pub sync_event: Event,
    pub worker_wakeup: Event,

    pub current_cycle: AtomicU32,
    pub current_cycle_start: AtomicI64,
    pub clock_offset: AtomicI64,
    pub cycle_period: AtomicI64,
    /// Cycle period plus the configured backup offset.
    pub backup_sync_inc: AtomicI64,
    pub master_packet_delay: AtomicI64,

    pub master_hwaddr: Mutex<EthernetAddress>,
    cal: Mutex<Option<Calibration>>,
    last_cal: Mutex<Vec<i64>>,
    pub missed_syncs: AtomicU64,
    pub stale_syncs: AtomicU64,

    mode: Mutex<Mode>,
}

impl TdmaInner {
    pub(crate) fn flag(&self, bit: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }

    pub(crate) fn set_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    pub(crate) fn clear_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }

    pub(crate) fn test_and_clear_flag(&self, bit: u32) -> bool {
        self.flags.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Complete the pending calibration, successfully or not.
    pub(crate) fn finish_calibration(&self, result: crate::error::Result<()>) {
        if let Some(cal) = self.cal.lock().unwrap().take() {
            *self.last_cal.lock().unwrap() = cal.results;
            cal.token.complete(result);
        }
    }

    /// Account one calibration reply; returns the follow-up request job
    /// parameters while rounds remain.
    pub(crate) fn calibration_round(&self, delay_ns: i64) -> Option<(i64, u32, u32)> {
        let mut guard = self.cal.lock().unwrap();
        let Some(cal) = guard.as_mut() else {
            return None;
        };
        cal.results.push(delay_ns);
        self.master_packet_delay.store(delay_ns, Ordering::Relaxed);
        cal.remaining -= 1;
        if cal.remaining == 0 {
            let cal = guard.take().unwrap();
            *self.last_cal.lock().unwrap() = cal.results;
            cal.token.complete(Ok(()));
            None
        } else {
            Some((cal.offset, cal.period, cal.phasing))
        }
    }
}

/// One TDMA instance, attached to one device.
pub struct Tdma {
    inner: Arc<TdmaInner>,
    rtpc: Arc<Rtpc>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Tdma {
    /// Attach the discipline to `dev` and start its worker task. Frames
    /// and slot queues draw from `pool`.
    pub fn attach(dev: &Arc<Device>, pool: Pool, rtpc: Arc<Rtpc>) -> Result<Arc<Tdma>> {
        let mut slots = Vec::with_capacity(TDMA_MAX_SLOTS);
        slots.resize_with(TDMA_MAX_SLOTS, || None);

        let inner = Arc::new(TdmaInner {
            dev: dev.clone(),
            pool,
            state: Mutex::new(TdmaState {
                slots,
                jobs: Vec::new(),
                revision: 0,
                next_job_id: 1,
            }),
            flags: AtomicU32::new(0),
            sync_event: Event::new(),
            worker_wakeup: Event::new(),
            current_cycle: AtomicU32::new(0),
            current_cycle_start: AtomicI64::new(0),
            clock_offset: AtomicI64::new(0),
            cycle_period: AtomicI64::new(0),
            backup_sync_inc: AtomicI64::new(0),
            master_packet_delay: AtomicI64::new(0),
            master_hwaddr: Mutex::new(EthernetAddress::BROADCAST),
            cal: Mutex::new(None),
            last_cal: Mutex::new(Vec::new()),
            missed_syncs: AtomicU64::new(0),
            stale_syncs: AtomicU64::new(0),
            mode: Mutex::new(Mode::Unconfigured),
        });

        let tdma = Arc::new(Tdma {
            inner: inner.clone(),
            rtpc,
            worker: Mutex::new(None),
        });
        rtmac::attach(dev, tdma.clone())?;

        let worker_inner = inner.clone();
        let task = std::thread::Builder::new()
            .name(format!("tdma-worker-{}", dev.name()))
            .spawn(move || worker::worker_task(worker_inner))
            .expect("failed to spawn TDMA worker");
        *tdma.worker.lock().unwrap() = Some(task);

        Ok(tdma)
    }

    fn configure(&self, mode: Mode, cycle_period_ns: i64, boundary: Job) -> Result<()> {
        if cycle_period_ns <= 0 {
            return Err(Error::BadParam);
        }
        let mut current = self.inner.mode.lock().unwrap();
        if *current != Mode::Unconfigured {
            return Err(Error::Busy);
        }
        *current = mode;

        self.inner
            .cycle_period
            .store(cycle_period_ns, Ordering::Relaxed);
        self.inner
            .current_cycle_start
            .store(Instant::now().total_nanos(), Ordering::Relaxed);

        let mut state = self.inner.state.lock().unwrap();
        state.insert_job(i64::MIN, boundary, None);
        drop(state);

        self.inner.worker_wakeup.signal();
        debug!("{}: TDMA {mode:?} started", self.inner.dev.name());
        Ok(())
    }

    /// Become the cycle master with the given period.
    pub fn master(&self, cycle_period_ns: i64) -> Result<()> {
        self.configure(Mode::Master, cycle_period_ns, Job::XmitSync)
    }

    /// Become a backup master firing `backup_offset_ns` into any cycle
    /// whose SYNC did not appear.
    pub fn backup_master(&self, cycle_period_ns: i64, backup_offset_ns: i64) -> Result<()> {
        if backup_offset_ns <= 0 || backup_offset_ns >= cycle_period_ns {
            return Err(Error::BadParam);
        }
        // The boundary job sleeps into the *next* cycle before checking.
        self.inner
            .backup_sync_inc
            .store(cycle_period_ns + backup_offset_ns, Ordering::Relaxed);
        self.configure(Mode::BackupMaster, cycle_period_ns, Job::BackupSync)
    }

    /// Join as a slave. `cal_rounds` calibration exchanges run when the
    /// first slot is installed.
    pub fn slave(&self, cycle_period_ns: i64, cal_rounds: u32) -> Result<()> {
        self.configure(Mode::Slave, cycle_period_ns, Job::WaitOnSync)?;
        if cal_rounds > 0 {
            let mut cal = self.inner.cal.lock().unwrap();
            *cal = Some(Calibration {
                // Placeholder token, replaced when calibration actually
                // starts with the first slot.
                token: dead_token(),
                results: Vec::with_capacity(cal_rounds as usize),
                remaining: cal_rounds,
                offset: 0,
                period: 1,
                phasing: 0,
            });
        }
        Ok(())
    }

    /// Install or replace transmit slot `id`.
    ///
    /// `joint` aliases the queue of an existing slot so two logical slot
    /// IDs share one physical queue. On a slave with calibration rounds
    /// pending, the first slot installation first runs the calibration
    /// handshake in this slot's position; `timeout_ns` bounds that wait.
    pub fn set_slot(
        &self,
        id: usize,
        offset_ns: i64,
        period: u32,
        phasing: u32,
        size: Option<usize>,
        joint: Option<usize>,
        timeout_ns: i64,
    ) -> Result<()> {
        if id >= TDMA_MAX_SLOTS || period == 0 || phasing >= period || offset_ns < 0 {
            return Err(Error::BadParam);
        }
        let period_ns = self.inner.cycle_period.load(Ordering::Relaxed);
        if period_ns == 0 {
            return Err(Error::NotAttached);
        }
        if offset_ns >= period_ns {
            return Err(Error::BadParam);
        }
        let size = match size {
            Some(size) if size > self.inner.dev.mtu() => return Err(Error::BadParam),
            Some(size) => size,
            None => self.inner.dev.mtu(),
        };

        self.maybe_calibrate(offset_ns, period, phasing, timeout_ns)?;

        let mut state = self.inner.state.lock().unwrap();
        let queue = match joint {
            Some(joint_id) if joint_id >= TDMA_MAX_SLOTS => return Err(Error::BadParam),
            Some(joint_id) => state.slots[joint_id]
                .as_ref()
                .map(|slot| slot.queue.clone())
                .ok_or(Error::NoEntry)?,
            None => Arc::new(Mutex::new(PrioQueue::new(16))),
        };

        if let Some(existing) = state.slots[id].take() {
            // Replacing: drop the old job; queued packets move over only
            // for private queues.
            let old_job = state
                .jobs
                .iter()
                .find(|entry| matches!(entry.job, Job::Slot { slot } if slot == id))
                .map(|entry| entry.id);
            if let Some(job_id) = old_job {
                state.remove_job(job_id);
            }
            drop(existing);
        }

        state.slots[id] = Some(Slot {
            offset: offset_ns,
            period,
            phasing,
            size,
            queue,
        });
        state.insert_job(offset_ns, Job::Slot { slot: id }, None);
        Ok(())
    }

    /// Remove slot `id`, releasing its queued packets.
    pub fn remove_slot(&self, id: usize) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        let slot = state.slots.get_mut(id).ok_or(Error::BadParam)?;
        let slot = slot.take().ok_or(Error::NoEntry)?;
        let job_id = state
            .jobs
            .iter()
            .find(|entry| matches!(entry.job, Job::Slot { slot } if slot == id))
            .map(|entry| entry.id);
        if let Some(job_id) = job_id {
            state.remove_job(job_id);
        }
        drop(state);
        // Last queue owner releases the packets.
        if let Ok(mut queue) = slot.queue.try_lock() {
            queue.drain(drop);
        }
        Ok(())
    }

    /// Run the pending calibration handshake, if any, parked on the rtpc
    /// dispatcher until the replies arrive.
    fn maybe_calibrate(
        &self,
        offset_ns: i64,
        period: u32,
        phasing: u32,
        timeout_ns: i64,
    ) -> Result<()> {
        {
            let cal = self.inner.cal.lock().unwrap();
            if cal.is_none() {
                return Ok(());
            }
        }
        let inner = self.inner.clone();
        let result = self.rtpc.call(
            Box::new(move |token| {
                {
                    let mut cal = inner.cal.lock().unwrap();
                    match cal.as_mut() {
                        Some(cal) => {
                            cal.token = token;
                            cal.offset = offset_ns;
                            cal.period = period;
                            cal.phasing = phasing;
                        }
                        None => return Verdict::Complete(Err(Error::Busy)),
                    }
                }
                let mut state = inner.state.lock().unwrap();
                state.insert_job(
                    offset_ns,
                    Job::XmitReqCal {
                        offset: offset_ns,
                        period,
                        phasing,
                    },
                    None,
                );
                Verdict::Pending
            }),
            Timeout::from_ns(timeout_ns),
        );
        if result.is_err() {
            // Orphan the calibration so a late reply cannot complete it.
            self.inner.finish_calibration(result);
        }
        result
    }

    /// Delays measured by the last calibration run, one entry per round.
    pub fn cal_results(&self) -> Vec<i64> {
        self.inner.last_cal.lock().unwrap().clone()
    }

    /// Current master-minus-local clock offset in nanoseconds.
    pub fn time_offset(&self) -> i64 {
        self.inner.clock_offset.load(Ordering::Relaxed)
    }

    pub fn current_cycle(&self) -> u32 {
        self.inner.current_cycle.load(Ordering::Relaxed)
    }

    /// Block until the next SYNC is processed (or emitted, on a master).
    pub fn wait_on_cycle(&self, timeout_ns: i64) -> Result<()> {
        self.inner.sync_event.wait(Timeout::from_ns(timeout_ns))
    }

    /// As [`wait_on_cycle`], additionally returning the new cycle number.
    ///
    /// [`wait_on_cycle`]: Tdma::wait_on_cycle
    pub fn wait_on_cycle_ex(&self, timeout_ns: i64) -> Result<u32> {
        self.inner.sync_event.wait(Timeout::from_ns(timeout_ns))?;
        Ok(self.current_cycle())
    }

    /// Whether this backup master transmitted the last SYNC.
    pub fn backup_active(&self) -> bool {
        self.inner.flag(flag::BACKUP_ACTIVE)
    }

    /// Hardware address of the station whose SYNC we last followed.
    pub fn master_addr(&self) -> EthernetAddress {
        *self.inner.master_hwaddr.lock().unwrap()
    }

    /// Cycles whose SYNC this slave never saw.
    pub fn missed_syncs(&self) -> u64 {
        self.inner.missed_syncs.load(Ordering::Relaxed)
    }

    /// Detach from the device, with the discipline's consent.
    pub fn detach_from(&self, dev: &Arc<Device>) -> Result<()> {
        rtmac::detach(dev)
    }
}

fn dead_token() -> CallToken {
    // A token nobody waits on; completing it is a no-op beyond state.
    CallToken::detached()
}

impl Discipline for Tdma {
    fn name(&self) -> &'static str {
        "TDMA"
    }

    fn disc_type(&self) -> DisciplineType {
        DisciplineType::Tdma
    }

    fn rt_packet_tx(&self, mut skb: RtSkb, _dev: &Arc<Device>) -> Result<()> {
        skb.channel = Channel::Rt;
        self.queue_for_slot(DEFAULT_SLOT, skb)
    }

    fn nrt_packet_tx(&self, mut skb: RtSkb) -> Result<()> {
        skb.channel = Channel::Nrt;
        skb.priority = SKB_MIN_PRIO;
        self.queue_for_slot(DEFAULT_NRT_SLOT, skb)
    }

    fn packet_rx(&self, skb: RtSkb) {
        proto::packet_rx(&self.inner, skb);
    }

    fn detach(&self, _dev: &Arc<Device>) -> Result<()> {
        {
            let state = self.inner.state.lock().unwrap();
            let queued: usize = state
                .slots
                .iter()
                .flatten()
                .map(|slot| slot.queue.lock().unwrap().len())
                .sum();
            if queued != 0 {
                return Err(Error::Busy);
            }
        }

        self.inner.set_flag(flag::SHUTDOWN);
        self.inner.worker_wakeup.close();
        self.inner.sync_event.close();
        if let Some(task) = self.worker.lock().unwrap().take() {
            let _ = task.join();
        }
        self.inner.finish_calibration(Err(Error::Closed));

        let mut state = self.inner.state.lock().unwrap();
        state.jobs.clear();
        for slot in state.slots.iter_mut() {
            if let Some(slot) = slot.take() {
                slot.queue.lock().unwrap().drain(drop);
            }
        }
        *self.inner.mode.lock().unwrap() = Mode::Unconfigured;
        debug!("{}: TDMA stopped", self.inner.dev.name());
        Ok(())
    }

    fn get_mtu(&self, dev: &Device, priority: u8) -> usize {
        let slot_id = if priority >= SKB_MIN_PRIO {
            DEFAULT_NRT_SLOT
        } else {
            DEFAULT_SLOT
        };
        let state = self.inner.state.lock().unwrap();
        state.slots[slot_id]
            .as_ref()
            .map(|slot| slot.size)
            .unwrap_or_else(|| dev.mtu())
    }
}

impl Tdma {
    fn queue_for_slot(&self, slot_id: usize, skb: RtSkb) -> Result<()> {
        let state = self.inner.state.lock().unwrap();
        let slot = state.slots[slot_id].as_ref().ok_or(Error::WouldBlock)?;
        if skb.len() > slot.size + crate::wire::ETHERNET_HEADER_LEN {
            warn!(
                "{}: frame exceeds slot {} size, dropping",
                self.inner.dev.name(),
                slot_id
            );
            return Err(Error::BadParam);
        }
        slot.queue.lock().unwrap().enqueue_tail(skb.priority, skb);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::Loopback;

    fn harness() -> (Arc<Device>, Arc<Tdma>, Pool) {
        let dev = Loopback::device();
        let pool = Pool::new(8, 2048);
        let rtpc = Arc::new(Rtpc::new());
        let tdma = Tdma::attach(&dev, pool.clone(), rtpc).unwrap();
        (dev, tdma, pool)
    }

    #[test]
    fn configure_once_only() {
        let (dev, tdma, _pool) = harness();
        tdma.master(1_000_000).unwrap();
        assert_eq!(tdma.master(1_000_000), Err(Error::Busy));
        assert_eq!(tdma.slave(1_000_000, 0), Err(Error::Busy));
        tdma.detach_from(&dev).unwrap();
    }

    #[test]
    fn slot_table_and_jobs() {
        let (dev, tdma, _pool) = harness();
        tdma.master(1_000_000).unwrap();

        tdma.set_slot(0, 100_000, 1, 0, None, None, 0).unwrap();
        tdma.set_slot(2, 500_000, 2, 1, Some(256), None, 0).unwrap();
        // Joint slot shares the queue of slot 0.
        tdma.set_slot(3, 700_000, 1, 0, None, Some(0), 0).unwrap();

        {
            let state = tdma.inner.state.lock().unwrap();
            // Boundary + three slot jobs, sorted by offset.
            assert_eq!(state.jobs.len(), 4);
            assert!(state.jobs.windows(2).all(|w| w[0].key <= w[1].key));
            let s0 = state.slots[0].as_ref().unwrap();
            let s3 = state.slots[3].as_ref().unwrap();
            assert!(Arc::ptr_eq(&s0.queue, &s3.queue));
        }

        assert_eq!(tdma.remove_slot(1), Err(Error::NoEntry));
        tdma.remove_slot(2).unwrap();
        {
            let state = tdma.inner.state.lock().unwrap();
            assert_eq!(state.jobs.len(), 3);
        }
        tdma.remove_slot(0).unwrap();
        tdma.remove_slot(3).unwrap();
        tdma.detach_from(&dev).unwrap();
    }

    #[test]
    fn slot_parameter_validation() {
        let (dev, tdma, _pool) = harness();
        tdma.master(1_000_000).unwrap();
        assert_eq!(
            tdma.set_slot(0, 2_000_000, 1, 0, None, None, 0),
            Err(Error::BadParam)
        );
        assert_eq!(
            tdma.set_slot(0, 0, 2, 2, None, None, 0),
            Err(Error::BadParam)
        );
        assert_eq!(
            tdma.set_slot(0, 0, 1, 0, Some(99_999), None, 0),
            Err(Error::BadParam)
        );
        assert_eq!(
            tdma.set_slot(0, 0, 1, 0, None, Some(7), 0),
            Err(Error::NoEntry)
        );
        tdma.detach_from(&dev).unwrap();
    }

    #[test]
    fn detach_refuses_while_packets_queued() {
        let (dev, tdma, pool) = harness();
        // A long cycle keeps the worker parked on the boundary job, so
        // the queued packet stays queued for the whole test.
        tdma.master(50_000_000).unwrap();
        tdma.set_slot(0, 40_000_000, 1, 0, None, None, 0).unwrap();

        let skb = pool.alloc(64).unwrap();
        dev.start_xmit(skb).unwrap();
        assert_eq!(tdma.detach_from(&dev).err(), Some(Error::Busy));

        tdma.remove_slot(0).unwrap();
        tdma.detach_from(&dev).unwrap();
    }
}
