//! Two-node TDMA scenarios over the software segment: slot-scheduled
//! traffic, calibration, and backup-master takeover.

mod common;

use rtnet::wire::Ipv4Address;
use rtnet::{Stack, StackConfig};

const IP_A: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
const IP_B: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
const IP_C: Ipv4Address = Ipv4Address::new(10, 0, 0, 3);

const CYCLE_NS: i64 = 2_000_000;

#[test]
fn master_and_slave_exchange_slot_traffic() {
    // Sockets must buffer a full run of datagrams: the receiver reads
    // only after every cycle has fired.
    let config = StackConfig {
        socket_rtskbs: 64,
        ..StackConfig::default()
    };
    let stack_a = Stack::new(config);
    let stack_b = Stack::new(config);
    let segment = common::Segment::new();
    let dev_a = segment.attach(&stack_a, "rteth0", 1, IP_A);
    let dev_b = segment.attach(&stack_b, "rteth0", 2, IP_B);
    common::link_routes(&stack_a, &dev_a, IP_A, &stack_b, &dev_b, IP_B);

    let tdma_a = stack_a.tdma_attach(&dev_a).unwrap();
    tdma_a.master(CYCLE_NS).unwrap();
    // One slot right at the cycle start, a joint alias just before the
    // cycle ends: both windows drain the same queue.
    tdma_a.set_slot(0, 0, 1, 0, None, None, 0).unwrap();
    tdma_a
        .set_slot(2, CYCLE_NS - 100_000, 1, 0, None, Some(0), 0)
        .unwrap();

    let tdma_b = stack_b.tdma_attach(&dev_b).unwrap();
    tdma_b.slave(CYCLE_NS, 0).unwrap();
    tdma_b.set_slot(0, CYCLE_NS / 2, 1, 0, None, None, 0).unwrap();

    // The slave locks onto the master's cycle.
    assert!(common::wait_until(1000, || tdma_b.current_cycle() >= 3));
    let locked_cycle = tdma_b.wait_on_cycle_ex(1_000_000_000).unwrap();
    assert!(locked_cycle >= 3);

    // A transmits two datagrams per cycle (one per slot window); B sees
    // all of them in order.
    let rx = stack_b.udp_socket();
    rx.bind(Ipv4Address::UNSPECIFIED, 37000).unwrap();
    rx.set_timeout(2_000_000_000);
    let tx = stack_a.udp_socket();

    const CYCLES: u32 = 25;
    for cycle in 0..CYCLES {
        tdma_a.wait_on_cycle(1_000_000_000).unwrap();
        tx.send_to(&cycle.to_be_bytes(), IP_B, 37000).unwrap();
        tx.send_to(&cycle.to_be_bytes(), IP_B, 37000).unwrap();
    }

    let mut buf = [0u8; 16];
    for cycle in 0..CYCLES {
        for _ in 0..2 {
            let (len, _) = rx.recv_from(&mut buf).unwrap();
            assert_eq!(len, 4);
            assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), cycle);
        }
    }

    // The slave's cycle counter kept up and stayed monotonic.
    let final_cycle = tdma_b.current_cycle();
    assert!(final_cycle >= locked_cycle + CYCLES);
    assert!(tdma_b.missed_syncs() <= 2);

    // B replies in its own slot.
    let rx_a = stack_a.udp_socket();
    rx_a.bind(Ipv4Address::UNSPECIFIED, 37001).unwrap();
    rx_a.set_timeout(2_000_000_000);
    let tx_b = stack_b.udp_socket();
    tx_b.send_to(b"reply", IP_A, 37001).unwrap();
    let (len, _) = rx_a.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"reply");

    tdma_b.detach_from(&dev_b).unwrap();
    tdma_a.detach_from(&dev_a).unwrap();
}

#[test]
fn slave_calibrates_against_master() {
    let stack_a = Stack::new(StackConfig::default());
    let stack_b = Stack::new(StackConfig::default());
    let segment = common::Segment::new();
    let dev_a = segment.attach(&stack_a, "rteth0", 1, IP_A);
    let dev_b = segment.attach(&stack_b, "rteth0", 2, IP_B);

    let tdma_a = stack_a.tdma_attach(&dev_a).unwrap();
    tdma_a.master(CYCLE_NS).unwrap();
    tdma_a.set_slot(0, 100_000, 1, 0, None, None, 0).unwrap();

    let tdma_b = stack_b.tdma_attach(&dev_b).unwrap();
    tdma_b.slave(CYCLE_NS, 3).unwrap();
    // Installing the first slot runs the three calibration rounds.
    tdma_b
        .set_slot(0, CYCLE_NS / 2, 1, 0, None, None, 5_000_000_000)
        .unwrap();

    let results = tdma_b.cal_results();
    assert_eq!(results.len(), 3);
    // In-process propagation: one-way delays are tiny but non-negative.
    for delay in &results {
        assert!(*delay >= 0);
        assert!(*delay < CYCLE_NS);
    }

    // With delays this small, master and slave clocks agree closely.
    let offset = tdma_b.time_offset().abs();
    assert!(offset < CYCLE_NS, "offset {offset} out of range");

    tdma_b.detach_from(&dev_b).unwrap();
    tdma_a.detach_from(&dev_a).unwrap();
}

#[test]
fn backup_master_takes_over_and_cycle_stays_monotonic() {
    let stack_m = Stack::new(StackConfig::default());
    let stack_b = Stack::new(StackConfig::default());
    let stack_s = Stack::new(StackConfig::default());
    let segment = common::Segment::new();
    let dev_m = segment.attach(&stack_m, "rteth0", 1, IP_A);
    let dev_b = segment.attach(&stack_b, "rteth0", 2, IP_B);
    let dev_s = segment.attach(&stack_s, "rteth0", 3, IP_C);

    const CYCLE: i64 = 5_000_000;

    let tdma_m = stack_m.tdma_attach(&dev_m).unwrap();
    tdma_m.master(CYCLE).unwrap();

    let tdma_b = stack_b.tdma_attach(&dev_b).unwrap();
    tdma_b.backup_master(CYCLE, 1_000_000).unwrap();

    let tdma_s = stack_s.tdma_attach(&dev_s).unwrap();
    tdma_s.slave(CYCLE, 0).unwrap();

    // Primary alive: the slave follows it, the backup stays quiet.
    assert!(common::wait_until(2000, || tdma_s.current_cycle() >= 5));
    assert!(!tdma_b.backup_active());
    assert_eq!(tdma_s.master_addr(), dev_m.hwaddr());

    // Kill the primary.
    let cycle_at_kill = tdma_s.current_cycle();
    tdma_m.detach_from(&dev_m).unwrap();

    // The backup takes over within a cycle or two; the slave's counter
    // keeps rising without regressing.
    assert!(common::wait_until(2000, || {
        tdma_s.current_cycle() >= cycle_at_kill + 5
    }));
    assert!(tdma_b.backup_active());
    assert_eq!(tdma_s.master_addr(), dev_b.hwaddr());

    let mut last = tdma_s.current_cycle();
    for _ in 0..10 {
        let cycle = tdma_s.wait_on_cycle_ex(1_000_000_000).unwrap();
        assert!(cycle >= last);
        last = cycle;
    }

    tdma_s.detach_from(&dev_s).unwrap();
    tdma_b.detach_from(&dev_b).unwrap();
}
