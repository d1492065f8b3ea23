/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*. It provides two
levels of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens through the
   `Packet` family of structures, e.g. [EthernetFrame] or [Ipv4Packet].
 * Second, in cases where the space of valid field values is much smaller
   than the space of possible field values, it provides a compact,
   high-level representation of packet data that can be parsed from and
   emitted into a sequence of octets. This happens through the `Repr`
   family of structs and enums, e.g. [ArpRepr] or [SyncRepr].

[EthernetFrame]: struct.EthernetFrame.html
[Ipv4Packet]: struct.Ipv4Packet.html
[ArpRepr]: enum.ArpRepr.html
[SyncRepr]: struct.SyncRepr.html

The `Packet` family of data structures guarantees that, if the
`Packet::check_len()` method returned `Ok(())`, then no accessor or setter
method will panic. `Packet::new_checked` is a shorthand for a combination
of `Packet::new_unchecked` and `Packet::check_len`. When parsing untrusted
input, it is *necessary* to use `Packet::new_checked()`.

In the `Repr` family, `Repr::parse()` never panics as long as
`Packet::new_checked()` (or `Packet::check_len()`) has succeeded, and
`Repr::emit()` never panics as long as the underlying buffer is at least
`Repr::buffer_len()` octets long.
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

use core::fmt;

mod ethernet;
pub use self::ethernet::{
    Address as EthernetAddress, EtherType as EthernetProtocol, Frame as EthernetFrame,
    Repr as EthernetRepr, HEADER_LEN as ETHERNET_HEADER_LEN,
};

mod arp;
pub use self::arp::{Operation as ArpOperation, Packet as ArpPacket, Repr as ArpRepr};

pub(crate) mod ipv4;
pub use self::ipv4::{
    Address as Ipv4Address, Key as Ipv4FragKey, Packet as Ipv4Packet, Protocol as IpProtocol,
    Repr as Ipv4Repr, HEADER_LEN as IPV4_HEADER_LEN,
};

mod udp;
pub use self::udp::{
    emit_header as udp_emit_header, ports as udp_ports, Datagram as UdpDatagram,
    HEADER_LEN as UDP_HEADER_LEN,
};

mod rtmac;
pub use self::rtmac::{
    DisciplineType, Header as RtmacHeader, Repr as RtmacRepr, FLAG_TUNNEL as RTMAC_FLAG_TUNNEL,
    HEADER_LEN as RTMAC_HEADER_LEN, VERSION as RTMAC_VERSION,
};

mod tdma;
pub use self::tdma::{
    frame_id as tdma_frame_id, CalReplyRepr, CalRequestRepr, FrameId as TdmaFrameId, SyncRepr,
    FRM_VERSION as TDMA_FRM_VERSION, HEAD_LEN as TDMA_HEAD_LEN,
};

mod rtcfg;
pub use self::rtcfg::{
    Frame as RtcfgFrame, FrameId as RtcfgFrameId, Repr as RtcfgRepr, RtcfgAddr,
    VERSION as RTCFG_VERSION,
};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;

pub(crate) mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::ipv4::Address;
    use super::IpProtocol;

    const fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0u32;

        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }
        if let Some(&byte) = data.first() {
            accum += (byte as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub fn combine(checksums: &[u16]) -> u16 {
        let mut accum = 0u32;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// Compute an IP pseudo header checksum.
    pub fn pseudo_header(
        src_addr: &Address,
        dst_addr: &Address,
        next_header: IpProtocol,
        length: u32,
    ) -> u16 {
        let mut proto_len = [0u8; 4];
        proto_len[1] = next_header.into();
        NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

        combine(&[
            data(&src_addr.octets()),
            data(&dst_addr.octets()),
            data(&proto_len),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::checksum;

    #[test]
    fn checksum_is_complement_stable() {
        let bytes = [0x45u8, 0x00, 0x00, 0x54, 0xa6, 0xf2, 0x40, 0x00, 0x40, 0x01];
        let sum = checksum::data(&bytes);
        // Folding the complement back in always yields all-ones.
        assert_eq!(checksum::combine(&[sum, !sum]), 0xffff);
    }

    #[test]
    fn checksum_odd_length() {
        let even = checksum::data(&[0xab, 0x00]);
        let odd = checksum::data(&[0xab]);
        assert_eq!(even, odd);
    }
}
