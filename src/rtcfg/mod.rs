//! RTcfg, the configuration-distribution protocol.
//!
//! A server station periodically invites its configured clients with
//! stage-1 frames, answers their announces, streams each its stage-2 blob
//! in acknowledged fragment bursts, and watches their heartbeats. A
//! client listens for its invitation, announces itself, collects the
//! stage-2 blob and the other stations, and reports ready. The blocking
//! commands (`server`, `add`, `wait`, `client`, `announce`, `ready`,
//! `down`) ride the rtpc bridge; frame events arrive on the
//! stack-manager task; the timer task paces retransmission bursts and
//! heartbeats. All three meet on the per-device state mutex.

mod event;

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::debug;

use crate::config::{DEFAULT_DEVICE_RTSKBS, RTCFG_MAX_STATIONS};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::rtpc::{CallToken, Rtpc, Verdict};
use crate::skb::{Pool, RtSkb};
use crate::time::{Duration, Instant, Timeout};
use crate::wire::{EthernetAddress, Ipv4Address};

/// How a station is addressed in commands and stage-1 frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationAddr {
    Mac(EthernetAddress),
    Ip(Ipv4Address),
}

/// Main per-device protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainState {
    Off,
    ServerRunning,
    Client0,
    Client1,
    ClientAnnounced,
    ClientAllKnown,
    ClientAllFrames,
    Client2,
    ClientReady,
}

/// Server-side view of one configured client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Still inviting with stage-1 frames.
    Searching,
    /// Announced itself; stage-2 transfer may be running.
    Stage1,
    /// Acknowledged the complete stage-2 blob.
    Stage2,
    /// Reported ready.
    Ready,
    /// Heartbeats stopped arriving.
    Dead,
}

pub(crate) struct Connection {
    pub addr: StationAddr,
    /// Learned hardware address (for IP-addressed stations).
    pub mac: Option<EthernetAddress>,
    pub state: ConnState,
    pub stage1: Vec<u8>,
    pub stage2: Vec<u8>,
    /// Client burstrate negotiated at announce time.
    pub burstrate: u32,
    /// Stage-2 bytes acknowledged so far.
    pub acked: usize,
    pub last_heartbeat: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Stage-1 invitation period.
    pub period_ns: i64,
    /// Frames per invitation or fragment burst.
    pub burstrate: u32,
    /// Client heartbeat period.
    pub heartbeat_ns: i64,
    /// Heartbeats missed before a station counts as lost.
    pub threshold: u32,
}

/// What a parked blocking command is waiting for.
pub(crate) enum PendingKind {
    /// Server `wait`: all stations ready.
    Wait,
    /// Client `client`: first matching stage-1 frame.
    Client,
    /// Client `announce`: stage-2 complete and all stations known.
    Announce,
}

pub(crate) struct PendingCall {
    pub kind: PendingKind,
    pub token: CallToken,
}

pub(crate) struct Station {
    pub mac: EthernetAddress,
    pub ready: bool,
}

pub(crate) struct DevState {
    pub main: MainState,

    // Server side.
    pub config: ServerConfig,
    pub conns: Vec<Connection>,

    // Client side.
    pub srv_mac: EthernetAddress,
    pub stage1: Vec<u8>,
    pub stage2: Vec<u8>,
    /// Whether the stage-2 head frame arrived (the blob may be empty).
    pub stage2_started: bool,
    pub cfg_len: usize,
    pub received: usize,
    /// Fragments since the last acknowledgement.
    pub packet_counter: u32,
    pub burstrate: u32,
    /// Server's burst rate, learned from the stage-1 frame.
    pub srv_burstrate: u32,
    pub other_stations: usize,
    pub stations: heapless::Vec<Station, RTCFG_MAX_STATIONS>,
    pub heartbeat_ns: i64,
    pub last_heartbeat_tx: Instant,

    pub pending: Vec<PendingCall>,
}

impl DevState {
    fn new() -> DevState {
        DevState {
            main: MainState::Off,
            config: ServerConfig {
                period_ns: 0,
                burstrate: 0,
                heartbeat_ns: 0,
                threshold: 0,
            },
            conns: Vec::new(),
            srv_mac: EthernetAddress::BROADCAST,
            stage1: Vec::new(),
            stage2: Vec::new(),
            stage2_started: false,
            cfg_len: 0,
            received: 0,
            packet_counter: 0,
            burstrate: 0,
            srv_burstrate: 0,
            other_stations: 0,
            stations: heapless::Vec::new(),
            heartbeat_ns: 0,
            last_heartbeat_tx: Instant::ZERO,
            pending: Vec::new(),
        }
    }

    /// Fail and drop every parked call.
    pub(crate) fn fail_pending(&mut self, error: Error) {
        for call in self.pending.drain(..) {
            call.token.complete(Err(error));
        }
    }

    /// Complete parked calls of one kind.
    pub(crate) fn complete_pending(&mut self, matches: impl Fn(&PendingKind) -> bool) {
        let mut kept = Vec::new();
        for call in self.pending.drain(..) {
            if matches(&call.kind) {
                call.token.complete(Ok(()));
            } else {
                kept.push(call);
            }
        }
        self.pending = kept;
    }
}

pub(crate) struct DevInner {
    pub dev: Arc<Device>,
    pub pool: Pool,
    pub state: Mutex<DevState>,
    pub timer_stop: crate::sync::Event,
}

struct DevEntry {
    inner: Arc<DevInner>,
    timer: Option<JoinHandle<()>>,
}

/// Per-stack RTcfg instance.
pub struct Rtcfg {
    devs: Mutex<Vec<Option<DevEntry>>>,
    rtpc: Arc<Rtpc>,
}

impl Rtcfg {
    pub fn new(max_devices: usize, rtpc: Arc<Rtpc>) -> Arc<Rtcfg> {
        let mut devs = Vec::with_capacity(max_devices);
        devs.resize_with(max_devices, || None);
        Arc::new(Rtcfg {
            devs: Mutex::new(devs),
            rtpc,
        })
    }

    fn inner_for(&self, dev: &Arc<Device>) -> Result<Arc<DevInner>> {
        let ifindex = dev.ifindex();
        let slot = ifindex.checked_sub(1).ok_or(Error::NoDevice)?;
        let mut devs = self.devs.lock().unwrap();
        let entry = devs.get_mut(slot).ok_or(Error::NoDevice)?;
        if entry.is_none() {
            let inner = Arc::new(DevInner {
                dev: dev.clone(),
                pool: Pool::new(DEFAULT_DEVICE_RTSKBS, dev.mtu() + 64),
                state: Mutex::new(DevState::new()),
                timer_stop: crate::sync::Event::new(),
            });
            let timer_inner = inner.clone();
            let timer = std::thread::Builder::new()
                .name(format!("rtcfg-timer-{}", dev.name()))
                .spawn(move || event::timer_task(timer_inner))
                .expect("failed to spawn rtcfg timer");
            *entry = Some(DevEntry {
                inner,
                timer: Some(timer),
            });
        }
        Ok(entry.as_ref().unwrap().inner.clone())
    }

    fn existing(&self, dev: &Arc<Device>) -> Result<Arc<DevInner>> {
        let slot = dev.ifindex().checked_sub(1).ok_or(Error::NoDevice)?;
        let devs = self.devs.lock().unwrap();
        devs.get(slot)
            .and_then(|entry| entry.as_ref())
            .map(|entry| entry.inner.clone())
            .ok_or(Error::NoDevice)
    }

    /// The RTcfg ethertype receive entry. Consumes the skb.
    pub fn rcv(&self, skb: RtSkb) {
        let Some(dev) = skb.dev.clone() else {
            return;
        };
        let Ok(inner) = self.existing(&dev) else {
            return;
        };
        event::frame_event(&inner, skb);
    }

    /// Start serving the configured stations on `dev`.
    pub fn server(&self, dev: &Arc<Device>, config: ServerConfig) -> Result<()> {
        if config.period_ns <= 0 || config.burstrate == 0 || config.heartbeat_ns < 0 {
            return Err(Error::BadParam);
        }
        let inner = self.inner_for(dev)?;
        let mut state = inner.state.lock().unwrap();
        if state.main != MainState::Off {
            return Err(Error::Busy);
        }
        state.config = config;
        state.main = MainState::ServerRunning;
        debug!("{}: RTcfg server running", dev.name());
        Ok(())
    }

    /// Configure a station the server will bring up.
    pub fn add_station(
        &self,
        dev: &Arc<Device>,
        addr: StationAddr,
        stage1: Vec<u8>,
        stage2: Vec<u8>,
    ) -> Result<()> {
        let inner = self.inner_for(dev)?;
        let mut state = inner.state.lock().unwrap();
        if state.conns.iter().any(|conn| conn.addr == addr) {
            return Err(Error::Exists);
        }
        state.conns.push(Connection {
            addr,
            mac: match addr {
                StationAddr::Mac(mac) => Some(mac),
                StationAddr::Ip(_) => None,
            },
            state: ConnState::Searching,
            stage1,
            stage2,
            burstrate: 0,
            acked: 0,
            last_heartbeat: Instant::ZERO,
        });
        Ok(())
    }

    pub fn del_station(&self, dev: &Arc<Device>, addr: StationAddr) -> Result<()> {
        let inner = self.existing(dev)?;
        let mut state = inner.state.lock().unwrap();
        let pos = state
            .conns
            .iter()
            .position(|conn| conn.addr == addr)
            .ok_or(Error::NoEntry)?;
        state.conns.remove(pos);
        Ok(())
    }

    /// Block until every configured station reported ready, or a station
    /// is lost.
    pub fn wait(&self, dev: &Arc<Device>, timeout_ns: i64) -> Result<()> {
        let inner = self.existing(dev)?;
        let call_inner = inner.clone();
        let result = self.rtpc.call(
            Box::new(move |token| {
                let mut state = call_inner.state.lock().unwrap();
                if state.main != MainState::ServerRunning {
                    return Verdict::Complete(Err(Error::BadParam));
                }
                if state
                    .conns
                    .iter()
                    .any(|conn| conn.state == ConnState::Dead)
                {
                    // A station was already lost.
                    return Verdict::Complete(Err(Error::Timeout));
                }
                if event::all_ready(&state) {
                    return Verdict::Complete(Ok(()));
                }
                state.pending.push(PendingCall {
                    kind: PendingKind::Wait,
                    token,
                });
                Verdict::Pending
            }),
            Timeout::from_ns(timeout_ns),
        );
        if result.is_err() {
            inner
                .state
                .lock()
                .unwrap()
                .pending
                .retain(|call| !matches!(call.kind, PendingKind::Wait));
        }
        result
    }

    /// Enter client mode and wait for this station's stage-1 data.
    pub fn client(&self, dev: &Arc<Device>, timeout_ns: i64) -> Result<Vec<u8>> {
        let inner = self.inner_for(dev)?;
        let call_inner = inner.clone();
        let result = self.rtpc.call(
            Box::new(move |token| {
                let mut state = call_inner.state.lock().unwrap();
                if state.main != MainState::Off {
                    return Verdict::Complete(Err(Error::Busy));
                }
                state.main = MainState::Client0;
                state.pending.push(PendingCall {
                    kind: PendingKind::Client,
                    token,
                });
                Verdict::Pending
            }),
            Timeout::from_ns(timeout_ns),
        );
        if let Err(err) = result {
            // An expired invitation wait resets the station.
            let mut state = inner.state.lock().unwrap();
            if state.main == MainState::Client0 {
                state.main = MainState::Off;
            }
            state
                .pending
                .retain(|call| !matches!(call.kind, PendingKind::Client));
            return Err(err);
        }
        let stage1 = inner.state.lock().unwrap().stage1.clone();
        Ok(stage1)
    }

    /// Announce this station and collect the stage-2 data plus the other
    /// stations. Returns the stage-2 blob.
    pub fn announce(
        &self,
        dev: &Arc<Device>,
        timeout_ns: i64,
        get_cfg: bool,
        burstrate: u32,
    ) -> Result<Vec<u8>> {
        if burstrate == 0 {
            return Err(Error::BadParam);
        }
        let inner = self.existing(dev)?;
        let call_inner = inner.clone();
        let result = self.rtpc.call(
            Box::new(move |token| {
                let mut state = call_inner.state.lock().unwrap();
                if state.main != MainState::Client1 {
                    return Verdict::Complete(Err(Error::BadParam));
                }
                state.burstrate = burstrate;
                if let Err(err) = event::send_announce_new(&call_inner, &state, get_cfg) {
                    return Verdict::Complete(Err(err));
                }
                state.main = MainState::ClientAnnounced;
                if !get_cfg {
                    // Nothing further to collect.
                    state.main = MainState::Client2;
                    return Verdict::Complete(Ok(()));
                }
                state.pending.push(PendingCall {
                    kind: PendingKind::Announce,
                    token,
                });
                Verdict::Pending
            }),
            Timeout::from_ns(timeout_ns),
        );
        if let Err(err) = result {
            let mut state = inner.state.lock().unwrap();
            if !matches!(state.main, MainState::Off | MainState::ServerRunning) {
                state.main = MainState::Off;
            }
            state
                .pending
                .retain(|call| !matches!(call.kind, PendingKind::Announce));
            return Err(err);
        }
        let stage2 = inner.state.lock().unwrap().stage2.clone();
        Ok(stage2)
    }

    /// Report this station ready to the fleet.
    pub fn ready(&self, dev: &Arc<Device>, _timeout_ns: i64) -> Result<()> {
        let inner = self.existing(dev)?;
        let mut state = inner.state.lock().unwrap();
        if state.main != MainState::Client2 {
            return Err(Error::BadParam);
        }
        event::send_ready(&inner)?;
        state.main = MainState::ClientReady;
        Ok(())
    }

    /// Tear the protocol down on `dev`, failing every parked call.
    pub fn down(&self, dev: &Arc<Device>) -> Result<()> {
        let inner = self.existing(dev)?;
        let mut state = inner.state.lock().unwrap();
        state.fail_pending(Error::Closed);
        *state = DevState::new();
        debug!("{}: RTcfg down", dev.name());
        Ok(())
    }

    pub fn main_state(&self, dev: &Arc<Device>) -> MainState {
        self.existing(dev)
            .map(|inner| inner.state.lock().unwrap().main)
            .unwrap_or(MainState::Off)
    }

    /// Detach from every device, stopping the timer tasks.
    pub fn shutdown(&self) {
        let mut devs = self.devs.lock().unwrap();
        for entry in devs.iter_mut() {
            if let Some(mut entry) = entry.take() {
                entry
                    .inner
                    .state
                    .lock()
                    .unwrap()
                    .fail_pending(Error::Closed);
                entry.inner.timer_stop.close();
                if let Some(timer) = entry.timer.take() {
                    let _ = timer.join();
                }
            }
        }
    }
}

impl Drop for Rtcfg {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One tick of the retransmission/heartbeat pacing loop.
pub(crate) fn tick_period(state: &DevState) -> Duration {
    match state.main {
        MainState::ServerRunning if state.config.period_ns > 0 => {
            Duration::from_nanos(state.config.period_ns)
        }
        MainState::Client2 | MainState::ClientReady if state.heartbeat_ns > 0 => {
            Duration::from_nanos(state.heartbeat_ns)
        }
        _ => Duration::from_millis(10),
    }
}
