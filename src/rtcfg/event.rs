//! RTcfg frame processing, transmission helpers, and the timer task.

use std::sync::Arc;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::skb::RtSkb;
use crate::time::{Instant, Timeout};
use crate::wire::{
    EthernetAddress, EthernetProtocol, RtcfgAddr, RtcfgRepr, ETHERNET_HEADER_LEN,
};

use super::{
    tick_period, ConnState, Connection, DevInner, DevState, MainState, PendingKind, Station,
    StationAddr,
};

fn eth_headroom() -> usize {
    (ETHERNET_HEADER_LEN + 15) & !15
}

/// Per-fragment stage-2 payload capacity on this device.
fn frag_size(inner: &DevInner) -> usize {
    inner.dev.mtu() - 16
}

fn send_frame(inner: &DevInner, dst: EthernetAddress, repr: &RtcfgRepr<'_>) -> Result<()> {
    let mut skb = inner
        .pool
        .alloc(eth_headroom() + repr.buffer_len())
        .ok_or(Error::NoBufs)?;
    skb.reserve(eth_headroom());
    repr.emit(skb.put(repr.buffer_len()));
    inner.dev.fill_eth_header(&mut skb, dst, EthernetProtocol::Rtcfg);
    inner.dev.start_xmit(skb)
}

fn our_wire_addr(inner: &DevInner) -> RtcfgAddr {
    let ip = inner.dev.local_ip();
    if ip.is_unspecified() {
        RtcfgAddr::Mac
    } else {
        RtcfgAddr::Ip(ip)
    }
}

pub(super) fn send_announce_new(
    inner: &DevInner,
    state: &DevState,
    get_cfg: bool,
) -> Result<()> {
    send_frame(
        inner,
        EthernetAddress::BROADCAST,
        &RtcfgRepr::AnnounceNew {
            addr: our_wire_addr(inner),
            get_cfg,
            burstrate: state.burstrate as u8,
        },
    )
}

pub(super) fn send_ready(inner: &DevInner) -> Result<()> {
    send_frame(inner, EthernetAddress::BROADCAST, &RtcfgRepr::Ready)
}

/// Whether every configured station has reported ready.
pub(super) fn all_ready(state: &DevState) -> bool {
    !state.conns.is_empty()
        && state
            .conns
            .iter()
            .all(|conn| conn.state == ConnState::Ready)
}

/// The RTcfg ethertype receive path. Consumes the skb.
pub(super) fn frame_event(inner: &Arc<DevInner>, skb: RtSkb) {
    let src = skb.src_hwaddr;
    // Ignore our own broadcasts looped back by the medium.
    if src == inner.dev.hwaddr() {
        return;
    }
    let data = skb.data();
    let repr = match RtcfgRepr::parse(data) {
        Ok(repr) => repr,
        Err(_) => {
            trace!("{}: malformed RTcfg frame", inner.dev.name());
            return;
        }
    };

    let unicast = skb.pkt_type == crate::skb::PacketKind::Host;
    let mut state = inner.state.lock().unwrap();
    match state.main {
        MainState::Off => {}
        MainState::ServerRunning => server_frame(inner, &mut state, src, &repr),
        _ => client_frame(inner, &mut state, src, unicast, &repr),
    }
}

fn addr_matches(conn: &Connection, src: EthernetAddress, announced: &RtcfgAddr) -> bool {
    match (conn.addr, announced) {
        (StationAddr::Mac(mac), _) => mac == src,
        (StationAddr::Ip(ip), RtcfgAddr::Ip(announced_ip)) => ip == *announced_ip,
        (StationAddr::Ip(_), RtcfgAddr::Mac) => conn.mac == Some(src),
    }
}

fn server_frame(
    inner: &Arc<DevInner>,
    state: &mut DevState,
    src: EthernetAddress,
    repr: &RtcfgRepr<'_>,
) {
    match repr {
        RtcfgRepr::AnnounceNew {
            addr,
            get_cfg,
            burstrate,
        } => {
            let Some(conn) = state
                .conns
                .iter_mut()
                .find(|conn| addr_matches(conn, src, addr))
            else {
                warn!("{}: announce from unknown station {src}", inner.dev.name());
                return;
            };
            conn.mac = Some(src);
            conn.last_heartbeat = Instant::now();
            if conn.state == ConnState::Searching {
                conn.state = ConnState::Stage1;
            }
            conn.burstrate = (*burstrate as u32).min(state.config.burstrate).max(1);
            debug!("{}: station {src} announced", inner.dev.name());

            let _ = send_frame(
                inner,
                src,
                &RtcfgRepr::AnnounceReply {
                    addr: our_wire_addr(inner),
                },
            );
            if *get_cfg {
                send_stage_2_burst(inner, state, src);
            } else if let Some(conn) = state
                .conns
                .iter_mut()
                .find(|conn| conn.mac == Some(src))
            {
                conn.state = ConnState::Stage2;
            }
        }

        RtcfgRepr::AckCfg { ack_len } => {
            let ack_len = *ack_len as usize;
            let complete = {
                let Some(conn) = state.conns.iter_mut().find(|conn| conn.mac == Some(src))
                else {
                    return;
                };
                conn.acked = ack_len.min(conn.stage2.len());
                conn.last_heartbeat = Instant::now();
                if conn.acked >= conn.stage2.len() {
                    conn.state = ConnState::Stage2;
                    true
                } else {
                    false
                }
            };
            if !complete {
                send_stage_2_burst(inner, state, src);
            }
        }

        RtcfgRepr::Ready => {
            if let Some(conn) = state.conns.iter_mut().find(|conn| conn.mac == Some(src)) {
                conn.state = ConnState::Ready;
                conn.last_heartbeat = Instant::now();
            }
            if all_ready(state) {
                state.complete_pending(|kind| matches!(kind, PendingKind::Wait));
            }
        }

        RtcfgRepr::Heartbeat => {
            if let Some(conn) = state.conns.iter_mut().find(|conn| conn.mac == Some(src)) {
                conn.last_heartbeat = Instant::now();
            }
        }

        _ => trace!("{}: unexpected frame in server state", inner.dev.name()),
    }
}

/// Send the next burst of stage-2 data to `dst`, head frame first.
fn send_stage_2_burst(inner: &Arc<DevInner>, state: &mut DevState, dst: EthernetAddress) {
    let frag = frag_size(inner);
    let stations = state.conns.len().saturating_sub(1) as u32;
    let heartbeat_ms = (state.config.heartbeat_ns / 1_000_000).clamp(0, u16::MAX as i64) as u16;

    let Some(conn) = state.conns.iter_mut().find(|conn| conn.mac == Some(dst)) else {
        return;
    };
    let total = conn.stage2.len();
    let burst = conn.burstrate.max(1);

    let mut offset = conn.acked;
    for _ in 0..burst {
        if offset == 0 {
            let chunk = total.min(frag);
            let result = send_frame(
                inner,
                dst,
                &RtcfgRepr::Stage2Cfg {
                    stations,
                    heartbeat_period: heartbeat_ms,
                    cfg_len: total as u32,
                    cfg_data: &conn.stage2[..chunk],
                },
            );
            if result.is_err() {
                break;
            }
            offset = chunk;
            if total == 0 {
                break;
            }
        } else if offset < total {
            let chunk = (total - offset).min(frag);
            let result = send_frame(
                inner,
                dst,
                &RtcfgRepr::Stage2CfgFrag {
                    frag_offs: offset as u32,
                    cfg_data: &conn.stage2[offset..offset + chunk],
                },
            );
            if result.is_err() {
                break;
            }
            offset += chunk;
        } else {
            break;
        }
    }
}

fn client_frame(
    inner: &Arc<DevInner>,
    state: &mut DevState,
    src: EthernetAddress,
    unicast: bool,
    repr: &RtcfgRepr<'_>,
) {
    match repr {
        RtcfgRepr::Stage1Cfg {
            client_addr,
            burstrate,
            cfg_data,
            ..
        } => {
            if state.main != MainState::Client0 {
                return;
            }
            let ours = match client_addr {
                RtcfgAddr::Ip(ip) => *ip == inner.dev.local_ip(),
                // MAC-addressed invitations arrive unicast to our address.
                RtcfgAddr::Mac => unicast,
            };
            if !ours {
                return;
            }
            state.srv_mac = src;
            state.srv_burstrate = (*burstrate as u32).max(1);
            state.stage1 = cfg_data.to_vec();
            state.main = MainState::Client1;
            debug!("{}: stage 1 received from {src}", inner.dev.name());
            state.complete_pending(|kind| matches!(kind, PendingKind::Client));
        }

        RtcfgRepr::Stage2Cfg {
            stations,
            heartbeat_period,
            cfg_len,
            cfg_data,
        } => {
            if state.main != MainState::ClientAnnounced {
                return;
            }
            state.other_stations = *stations as usize;
            state.heartbeat_ns = *heartbeat_period as i64 * 1_000_000;
            state.stage2_started = true;
            state.cfg_len = *cfg_len as usize;
            state.stage2 = vec![0; state.cfg_len];
            state.stage2[..cfg_data.len()].copy_from_slice(cfg_data);
            state.received = cfg_data.len();
            state.packet_counter = 1;
            client_progress(inner, state);
        }

        RtcfgRepr::Stage2CfgFrag {
            frag_offs,
            cfg_data,
        } => {
            if state.cfg_len == 0 {
                return;
            }
            let offset = *frag_offs as usize;
            if offset + cfg_data.len() > state.cfg_len {
                trace!("{}: stage 2 fragment overruns blob", inner.dev.name());
                return;
            }
            if offset != state.received {
                // Out-of-order burst; re-ack to resynchronize the server.
                let received = state.received;
                let _ = send_frame(
                    inner,
                    state.srv_mac,
                    &RtcfgRepr::AckCfg {
                        ack_len: received as u32,
                    },
                );
                state.packet_counter = 0;
                return;
            }
            state.stage2[offset..offset + cfg_data.len()].copy_from_slice(cfg_data);
            state.received += cfg_data.len();
            state.packet_counter += 1;
            client_progress(inner, state);
        }

        RtcfgRepr::AnnounceNew { .. } => {
            // Another client joining: record it and help it learn us.
            client_learn_station(state, src);
            let _ = send_frame(
                inner,
                src,
                &RtcfgRepr::AnnounceReply {
                    addr: our_wire_addr(inner),
                },
            );
            client_progress(inner, state);
        }

        RtcfgRepr::AnnounceReply { .. } => {
            if src != state.srv_mac {
                client_learn_station(state, src);
                client_progress(inner, state);
            }
        }

        RtcfgRepr::Ready => {
            if let Some(station) = state.stations.iter_mut().find(|s| s.mac == src) {
                station.ready = true;
            }
        }

        RtcfgRepr::Heartbeat => {}

        _ => trace!("{}: unexpected frame in client state", inner.dev.name()),
    }
}

fn client_learn_station(state: &mut DevState, mac: EthernetAddress) {
    if state.stations.iter().any(|s| s.mac == mac) {
        return;
    }
    let _ = state.stations.push(Station { mac, ready: false });
}

/// Advance the announced client towards `Client2`, acknowledging bursts
/// and finishing when both the blob and the station set are complete.
fn client_progress(inner: &Arc<DevInner>, state: &mut DevState) {
    if !matches!(
        state.main,
        MainState::ClientAnnounced | MainState::ClientAllKnown | MainState::ClientAllFrames
    ) {
        return;
    }

    let frames_done = state.stage2_started && state.received >= state.cfg_len;
    let stations_done = state.stations.len() >= state.other_stations;

    if frames_done && state.main == MainState::ClientAnnounced && !stations_done {
        state.main = MainState::ClientAllFrames;
    } else if stations_done && state.main == MainState::ClientAnnounced && !frames_done {
        state.main = MainState::ClientAllKnown;
    }

    // Acknowledge after every full burst and at completion. The burst
    // length effective on the wire is the lower of both stations' rates.
    let burst = state.burstrate.max(1).min(state.srv_burstrate.max(1));
    if state.stage2_started && (state.packet_counter >= burst || frames_done) {
        let received = state.received;
        let _ = send_frame(
            inner,
            state.srv_mac,
            &RtcfgRepr::AckCfg {
                ack_len: received as u32,
            },
        );
        state.packet_counter = 0;
    }

    if frames_done && stations_done {
        state.main = MainState::Client2;
        state.last_heartbeat_tx = Instant::now();
        debug!("{}: configuration complete", inner.dev.name());
        state.complete_pending(|kind| matches!(kind, PendingKind::Announce));
    }
}

/// The pacing task: stage-1 invitation bursts and heartbeat-loss checks
/// on servers, heartbeat transmission on configured clients.
pub(super) fn timer_task(inner: Arc<DevInner>) {
    loop {
        let period = {
            let state = inner.state.lock().unwrap();
            tick_period(&state)
        };
        if inner.timer_stop.wait(Timeout::Relative(period)) != Err(Error::Timeout) {
            // Signalled or closed: shut down.
            return;
        }

        let mut state = inner.state.lock().unwrap();
        match state.main {
            MainState::ServerRunning => server_tick(&inner, &mut state),
            MainState::Client2 | MainState::ClientReady => client_tick(&inner, &mut state),
            _ => {}
        }
    }
}

fn server_tick(inner: &Arc<DevInner>, state: &mut DevState) {
    let burst = state.config.burstrate.max(1);
    let heartbeat = state.config.heartbeat_ns;
    let threshold = state.config.threshold.max(1) as i64;
    let now = Instant::now();

    let mut lost = false;
    let mut invitations = Vec::new();
    for conn in state.conns.iter_mut() {
        match conn.state {
            ConnState::Searching => invitations.push((conn.addr, conn.mac, conn.stage1.clone())),
            ConnState::Dead => {}
            _ => {
                if heartbeat > 0
                    && (now - conn.last_heartbeat).total_nanos() > threshold * heartbeat
                {
                    warn!("{}: station lost", inner.dev.name());
                    conn.state = ConnState::Dead;
                    lost = true;
                }
            }
        }
    }

    if lost {
        state.fail_pending(Error::Timeout);
    }

    for (addr, mac, stage1) in invitations.into_iter().take(burst as usize) {
        let (wire_addr, dst) = match (addr, mac) {
            (StationAddr::Ip(ip), Some(mac)) => (RtcfgAddr::Ip(ip), mac),
            (StationAddr::Ip(ip), None) => (RtcfgAddr::Ip(ip), EthernetAddress::BROADCAST),
            (StationAddr::Mac(mac), _) => (RtcfgAddr::Mac, mac),
        };
        let server_addr = match wire_addr {
            RtcfgAddr::Ip(_) => RtcfgAddr::Ip(inner.dev.local_ip()),
            RtcfgAddr::Mac => RtcfgAddr::Mac,
        };
        let _ = send_frame(
            inner,
            dst,
            &RtcfgRepr::Stage1Cfg {
                client_addr: wire_addr,
                server_addr,
                burstrate: burst as u8,
                cfg_data: &stage1,
            },
        );
    }
}

fn client_tick(inner: &Arc<DevInner>, state: &mut DevState) {
    if state.heartbeat_ns <= 0 {
        return;
    }
    let now = Instant::now();
    if (now - state.last_heartbeat_tx).total_nanos() >= state.heartbeat_ns {
        let _ = send_frame(inner, state.srv_mac, &RtcfgRepr::Heartbeat);
        state.last_heartbeat_tx = now;
    }
}

