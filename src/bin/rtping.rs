//! Round-trip timing over the loopback device.
//!
//! Brings up `rtlo`, binds a receiver, and measures how long a datagram
//! takes to travel socket → IP → driver → stack manager → socket.
//!
//! Usage: `rtping [count] [payload-bytes]`

use std::sync::Arc;

use rtnet::ctrl::{self, CoreCmd};
use rtnet::time::Instant;
use rtnet::wire::Ipv4Address;
use rtnet::{Stack, StackConfig};

fn main() {
    let mut args = std::env::args().skip(1);
    let count: u32 = args
        .next()
        .map(|arg| arg.parse().expect("count must be a number"))
        .unwrap_or(10);
    let payload_len: usize = args
        .next()
        .map(|arg| arg.parse().expect("payload size must be a number"))
        .unwrap_or(64);

    let stack = Stack::new(StackConfig::default());
    stack
        .register_device(rtnet::drivers::Loopback::device())
        .expect("loopback registration");
    ctrl::ifup(
        &stack,
        &CoreCmd {
            if_name: "rtlo".into(),
            ip_addr: Ipv4Address::new(10, 0, 0, 1),
            broadcast_ip: Ipv4Address::new(10, 255, 255, 255),
            set_flags: 0,
            clear_flags: 0,
            hwaddr: None,
        },
    )
    .expect("ifup rtlo");

    let receiver = stack.udp_socket();
    receiver
        .bind(Ipv4Address::UNSPECIFIED, 37000)
        .expect("bind :37000");
    receiver.set_timeout(1_000_000_000);

    let sender = stack.udp_socket();
    let payload = vec![0x55u8; payload_len];
    let mut buf = vec![0u8; payload_len];
    let mut worst = 0i64;
    let mut sum = 0i64;
    let mut received = 0u32;

    for seq in 0..count {
        let start = Instant::now();
        sender
            .send_to(&payload, Ipv4Address::new(10, 0, 0, 1), 37000)
            .expect("send");
        match receiver.recv_from(&mut buf) {
            Ok((len, _)) => {
                let elapsed = (Instant::now() - start).total_nanos();
                assert_eq!(len, payload_len);
                sum += elapsed;
                worst = worst.max(elapsed);
                received += 1;
                println!("seq={seq} bytes={len} time={:.1}us", elapsed as f64 / 1000.0);
            }
            Err(err) => println!("seq={seq} lost ({err})"),
        }
    }

    if received > 0 {
        println!(
            "--- {received}/{count} received, avg {:.1}us, worst {:.1}us ---",
            sum as f64 / received as f64 / 1000.0,
            worst as f64 / 1000.0
        );
    }

    drop(sender);
    drop(receiver);
    ctrl::ifdown(&stack, "rtlo").expect("ifdown rtlo");
    let _ = Arc::strong_count(&stack);
}
