//! User Datagram Protocol header access.
//!
//! UDP asks very little of this stack, and the module mirrors that: the
//! receive path needs the port pair to demultiplex ([`ports`]) and a
//! fully validated view of one datagram ([`Datagram::parse`]); the
//! transmit path needs a checksummed header to place in front of a
//! payload that is copied out separately, possibly fragment-wise
//! ([`emit_header`]). Both sides work directly on the transport slice of
//! an rtskb, and the checksum always runs over the IPv4 pseudo header.

use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::checksum;
use super::ipv4::Address;
use super::{Error, IpProtocol, Result};

mod field {
    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const LENGTH: Field = 4..6;
    pub const CHECKSUM: Field = 6..8;
}

pub const HEADER_LEN: usize = field::CHECKSUM.end;

/// Peek at the port pair of a datagram for socket demultiplexing. No
/// further validation; the receive handler validates before delivery.
pub fn ports(data: &[u8]) -> Result<(u16, u16)> {
    if data.len() < HEADER_LEN {
        return Err(Error);
    }
    Ok((
        NetworkEndian::read_u16(&data[field::SRC_PORT]),
        NetworkEndian::read_u16(&data[field::DST_PORT]),
    ))
}

/// A validated view of one received datagram.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Datagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    /// Validate the datagram in `data` and return its ports and payload.
    ///
    /// Rejects a buffer shorter than its length field claims, a length
    /// field shorter than the header, a zero destination port, and a bad
    /// checksum. An all-zero checksum means the transmitter computed
    /// none, which is accepted on UDP-over-IPv4.
    pub fn parse(
        data: &'a [u8],
        src_addr: &Address,
        dst_addr: &Address,
    ) -> Result<Datagram<'a>> {
        let (src_port, dst_port) = ports(data)?;
        // Destination port cannot be omitted (but source port can be).
        if dst_port == 0 {
            return Err(Error);
        }

        let len = NetworkEndian::read_u16(&data[field::LENGTH]) as usize;
        if len < HEADER_LEN || len > data.len() {
            return Err(Error);
        }

        if NetworkEndian::read_u16(&data[field::CHECKSUM]) != 0 {
            let folded = checksum::combine(&[
                checksum::pseudo_header(src_addr, dst_addr, IpProtocol::Udp, len as u32),
                checksum::data(&data[..len]),
            ]);
            if folded != !0 {
                return Err(Error);
            }
        }

        Ok(Datagram {
            src_port,
            dst_port,
            payload: &data[HEADER_LEN..len],
        })
    }
}

impl fmt::Display for Datagram<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "UDP src={} dst={} len={}",
            self.src_port,
            self.dst_port,
            self.payload.len()
        )
    }
}

/// Build the checksummed header for an outgoing datagram.
///
/// The payload is only read for length and checksum here; the caller
/// copies it behind the header itself, which lets the IP layer emit it
/// in fragment-sized pieces without a contiguous staging buffer.
pub fn emit_header(
    src_port: u16,
    dst_port: u16,
    src_addr: &Address,
    dst_addr: &Address,
    payload: &[u8],
) -> [u8; HEADER_LEN] {
    let len = (HEADER_LEN + payload.len()) as u16;
    let mut header = [0u8; HEADER_LEN];
    NetworkEndian::write_u16(&mut header[field::SRC_PORT], src_port);
    NetworkEndian::write_u16(&mut header[field::DST_PORT], dst_port);
    NetworkEndian::write_u16(&mut header[field::LENGTH], len);

    let sum = !checksum::combine(&[
        checksum::pseudo_header(src_addr, dst_addr, IpProtocol::Udp, len as u32),
        checksum::data(&header),
        checksum::data(payload),
    ]);
    // Zero on the wire means "no checksum"; all-ones is arithmetically
    // equivalent.
    NetworkEndian::write_u16(
        &mut header[field::CHECKSUM],
        if sum == 0 { 0xffff } else { sum },
    );
    header
}
