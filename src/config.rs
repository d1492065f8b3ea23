//! Compile-time sizing of the stack.
//!
//! Everything on the fast path draws from buffers and tables dimensioned
//! here; nothing is grown at runtime. Setup-time operations (pool extension,
//! device registration) may allocate, packet handling never does.

/// Number of rtskbs in the global pool of a freshly created stack.
pub const DEFAULT_GLOBAL_RTSKBS: usize = 16;

/// Default per-device pool contribution added on `ifup`.
pub const DEFAULT_DEVICE_RTSKBS: usize = 16;

/// Default per-socket pool size.
pub const DEFAULT_SOCKET_RTSKBS: usize = 16;

/// Default maximum rtskb payload capacity in bytes. Relevant for IP
/// reassembly: a defragmented datagram must fit into a single rtskb.
pub const DEFAULT_MAX_RTSKB_SIZE: usize = 1544;

/// rtskb buffers are aligned to this boundary.
pub const RTSKB_ALIGN: usize = 16;

/// Capacity of the driver-to-stack-manager RX ring. Must be a power of two.
pub const RX_RING_SIZE: usize = 32;

/// Number of buckets in the layer-3 packet-type table.
pub const RTPACKET_HASH_TBL_SIZE: usize = 16;
pub const RTPACKET_HASH_KEY_MASK: u16 = RTPACKET_HASH_TBL_SIZE as u16 - 1;

/// Packet-type handlers per hash bucket.
pub const RTPACKET_BUCKET_SIZE: usize = 4;

/// Layer-4 protocol table size (hashed by IP protocol number).
pub const MAX_INET_PROTOCOLS: usize = 32;

/// Maximum number of registered devices.
pub const MAX_RT_DEVICES: usize = 8;

/// Host route table capacity.
pub const HOST_ROUTE_COUNT: usize = 32;

/// Network route table capacity.
pub const NET_ROUTE_COUNT: usize = 16;

/// Concurrent IP reassembly collectors.
pub const COLLECTOR_COUNT: usize = 4;

/// Reassembly timeout in nanoseconds (10 ms as in the classic stack).
pub const FRAGMENT_TTL_NS: i64 = 10_000_000;

/// Bound UDP sockets per stack.
pub const MAX_UDP_SOCKETS: usize = 16;

/// TDMA slot table capacity per device (slot IDs 0..MAX_SLOTS-1).
pub const TDMA_MAX_SLOTS: usize = 16;

/// Priority levels of a slot queue; 0 is the highest.
pub const SKB_PRIO_LEVELS: usize = 32;

/// Default priority of RT socket traffic.
pub const SKB_DEF_RT_PRIO: u8 = 16;

/// Lowest priority, used for non-RT tunnelled traffic.
pub const SKB_MIN_PRIO: u8 = SKB_PRIO_LEVELS as u8 - 1;

/// RTcfg station table capacity (clients a server can manage, stations a
/// client can track).
pub const RTCFG_MAX_STATIONS: usize = 32;

const _: () = assert!(RX_RING_SIZE.is_power_of_two());
const _: () = assert!(RTPACKET_HASH_TBL_SIZE.is_power_of_two());
const _: () = assert!(MAX_INET_PROTOCOLS.is_power_of_two());
