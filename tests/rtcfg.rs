//! Configuration-distribution scenarios: the three-station happy path,
//! replay determinism, and heartbeat loss detection.

mod common;

use std::sync::Arc;

use rtnet::rtcfg::{MainState, ServerConfig, StationAddr};
use rtnet::wire::Ipv4Address;
use rtnet::{Error, Stack, StackConfig};

const IP_SRV: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
const IP_B: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
const IP_C: Ipv4Address = Ipv4Address::new(10, 0, 0, 3);

struct Fleet {
    server: Arc<Stack>,
    clients: Vec<Arc<Stack>>,
    server_dev: Arc<rtnet::device::Device>,
    client_devs: Vec<Arc<rtnet::device::Device>>,
}

fn fleet() -> Fleet {
    let server = Stack::new(StackConfig::default());
    let client_b = Stack::new(StackConfig::default());
    let client_c = Stack::new(StackConfig::default());
    let segment = common::Segment::new();
    let server_dev = segment.attach(&server, "rteth0", 1, IP_SRV);
    let dev_b = segment.attach(&client_b, "rteth0", 2, IP_B);
    let dev_c = segment.attach(&client_c, "rteth0", 3, IP_C);
    Fleet {
        server,
        clients: vec![client_b, client_c],
        server_dev,
        client_devs: vec![dev_b, dev_c],
    }
}

fn server_config() -> ServerConfig {
    ServerConfig {
        period_ns: 5_000_000,
        burstrate: 4,
        heartbeat_ns: 30_000_000,
        threshold: 4,
    }
}

/// Drive one client through client → announce → ready; returns both
/// received blobs.
fn run_client(stack: Arc<Stack>, dev: Arc<rtnet::device::Device>) -> (Vec<u8>, Vec<u8>) {
    let rtcfg = stack.rtcfg().clone();
    let stage1 = rtcfg.client(&dev, 5_000_000_000).expect("stage 1");
    let stage2 = rtcfg
        .announce(&dev, 5_000_000_000, true, 4)
        .expect("stage 2");
    rtcfg.ready(&dev, 0).expect("ready");
    (stage1, stage2)
}

fn run_handshake(fleet: &Fleet) -> Vec<(Vec<u8>, Vec<u8>)> {
    // A stage-2 blob long enough to need several fragment bursts.
    let stage2_b: Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();
    let stage2_c: Vec<u8> = (0..4321u32).map(|i| (i % 127) as u8).collect();

    let client_threads: Vec<_> = fleet
        .clients
        .iter()
        .zip(&fleet.client_devs)
        .map(|(stack, dev)| {
            let stack = stack.clone();
            let dev = dev.clone();
            std::thread::spawn(move || run_client(stack, dev))
        })
        .collect();

    let rtcfg = fleet.server.rtcfg();
    rtcfg
        .add_station(
            &fleet.server_dev,
            StationAddr::Mac(fleet.client_devs[0].hwaddr()),
            b"stage1 for B".to_vec(),
            stage2_b.clone(),
        )
        .unwrap();
    rtcfg
        .add_station(
            &fleet.server_dev,
            StationAddr::Mac(fleet.client_devs[1].hwaddr()),
            b"stage1 for C".to_vec(),
            stage2_c.clone(),
        )
        .unwrap();
    rtcfg.server(&fleet.server_dev, server_config()).unwrap();

    rtcfg.wait(&fleet.server_dev, 10_000_000_000).expect("wait");

    let results: Vec<_> = client_threads
        .into_iter()
        .map(|thread| thread.join().unwrap())
        .collect();

    assert_eq!(results[0].0, b"stage1 for B");
    assert_eq!(results[0].1, stage2_b);
    assert_eq!(results[1].0, b"stage1 for C");
    assert_eq!(results[1].1, stage2_c);
    results
}

#[test]
fn three_station_happy_path() {
    let fleet = fleet();
    run_handshake(&fleet);

    assert_eq!(
        fleet.server.rtcfg().main_state(&fleet.server_dev),
        MainState::ServerRunning
    );
    for (stack, dev) in fleet.clients.iter().zip(&fleet.client_devs) {
        assert_eq!(stack.rtcfg().main_state(dev), MainState::ClientReady);
    }
}

/// Running the identical command/frame sequence on a fresh fleet rebuilds
/// the identical states and blobs.
#[test]
fn handshake_replay_is_deterministic() {
    let first = {
        let fleet = fleet();
        run_handshake(&fleet)
    };
    let second = {
        let fleet = fleet();
        run_handshake(&fleet)
    };
    assert_eq!(first, second);
}

#[test]
fn lost_heartbeat_fails_the_wait() {
    let fleet = fleet();
    run_handshake(&fleet);

    // Silence client C; its heartbeats stop.
    fleet.clients[1]
        .rtcfg()
        .down(&fleet.client_devs[1])
        .unwrap();

    // Give the server time to pass the loss threshold (4 × 30 ms), then
    // a renewed wait reports the lost station.
    std::thread::sleep(std::time::Duration::from_millis(500));
    let result = fleet
        .server
        .rtcfg()
        .wait(&fleet.server_dev, 5_000_000_000);
    assert_eq!(result, Err(Error::Timeout));
}
