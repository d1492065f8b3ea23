//! Address resolution between two stations on the segment.

mod common;

use rtnet::wire::Ipv4Address;
use rtnet::{Error, Stack, StackConfig};

const IP_A: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
const IP_B: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);

#[test]
fn unresolved_host_is_solicited_and_learned() {
    let stack_a = Stack::new(StackConfig::default());
    let stack_b = Stack::new(StackConfig::default());
    let segment = common::Segment::new();
    let _dev_a = segment.attach(&stack_a, "rteth0", 1, IP_A);
    let dev_b = segment.attach(&stack_b, "rteth0", 2, IP_B);

    // No route yet: the send fails but fires a who-has request.
    let tx = stack_a.udp_socket();
    assert_eq!(
        tx.send_to(b"early", IP_B, 37000).err(),
        Some(Error::HostUnreachable)
    );

    // B answers; A learns the mapping.
    assert!(common::wait_until(1000, || {
        stack_a.ipv4().routes.get_host(IP_B).is_some()
    }));
    assert_eq!(
        stack_a.ipv4().routes.get_host(IP_B).unwrap().hwaddr,
        dev_b.hwaddr()
    );

    // And traffic flows.
    let rx = stack_b.udp_socket();
    rx.bind(Ipv4Address::UNSPECIFIED, 37000).unwrap();
    rx.set_timeout(1_000_000_000);
    tx.send_to(b"hello", IP_B, 37000).unwrap();
    let mut buf = [0u8; 16];
    let (len, (from, _)) = rx.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"hello");
    assert_eq!(from, IP_A);

    // Route deletion is visible to the next lookup.
    stack_a.ipv4().routes.del_host(IP_B).unwrap();
    assert!(stack_a.ipv4().routes.get_host(IP_B).is_none());
}
