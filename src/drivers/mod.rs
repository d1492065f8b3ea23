//! In-tree reference drivers.
//!
//! Real NIC drivers live outside the stack and implement
//! [`crate::device::Driver`]; the loopback device is kept in-tree as the
//! reference implementation and test vehicle.

pub mod loopback;

pub use self::loopback::Loopback;
