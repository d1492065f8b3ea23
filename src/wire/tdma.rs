//! TDMA discipline frames, carried behind the RTmac header.
//!
//! All timestamps travel as unsigned nanoseconds in the master's clock
//! domain. The `xmit_stamp` fields are written as zero at build time and
//! patched with the actual transmit time by the device layer right before
//! the frame leaves; [`SyncRepr::XMIT_STAMP_OFFSET`] and
//! [`CalReplyRepr::XMIT_STAMP_OFFSET`] locate the patch field.

use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};

/// TDMA protocol version on the wire.
pub const FRM_VERSION: u16 = 0x0201;

mod field {
    use crate::wire::field::*;

    pub const VERSION: Field = 0..2;
    pub const ID: Field = 2..4;

    pub const SYNC_CYCLE_NO: Field = 4..6;
    pub const SYNC_SCHED_XMIT: Field = 6..14;
    pub const SYNC_XMIT: Field = 14..22;

    pub const REQ_CAL_XMIT: Field = 4..12;
    pub const REQ_CAL_RPL_CYCLE: Field = 12..16;
    pub const REQ_CAL_RPL_OFFSET: Field = 16..24;

    pub const RPL_CAL_REQ_XMIT: Field = 4..12;
    pub const RPL_CAL_RECEPTION: Field = 12..20;
    pub const RPL_CAL_XMIT: Field = 20..28;
}

/// Length of the common {version, id} head.
pub const HEAD_LEN: usize = field::ID.end;

pub const SYNC_LEN: usize = field::SYNC_XMIT.end;
pub const REQ_CAL_LEN: usize = field::REQ_CAL_RPL_OFFSET.end;
pub const RPL_CAL_LEN: usize = field::RPL_CAL_XMIT.end;

/// The kind of a TDMA frame.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FrameId {
    Sync,
    RequestCal,
    ReplyCal,
    Unknown(u16),
}

impl From<u16> for FrameId {
    fn from(value: u16) -> FrameId {
        match value {
            0x0000 => FrameId::Sync,
            0x0010 => FrameId::RequestCal,
            0x0011 => FrameId::ReplyCal,
            other => FrameId::Unknown(other),
        }
    }
}

impl From<FrameId> for u16 {
    fn from(value: FrameId) -> u16 {
        match value {
            FrameId::Sync => 0x0000,
            FrameId::RequestCal => 0x0010,
            FrameId::ReplyCal => 0x0011,
            FrameId::Unknown(other) => other,
        }
    }
}

/// Peek at the common head of a TDMA frame, rejecting version mismatches.
pub fn frame_id(data: &[u8]) -> Result<FrameId> {
    if data.len() < HEAD_LEN {
        return Err(Error);
    }
    if NetworkEndian::read_u16(&data[field::VERSION]) != FRM_VERSION {
        return Err(Error);
    }
    Ok(NetworkEndian::read_u16(&data[field::ID]).into())
}

fn emit_head(data: &mut [u8], id: FrameId) {
    NetworkEndian::write_u16(&mut data[field::VERSION], FRM_VERSION);
    NetworkEndian::write_u16(&mut data[field::ID], id.into());
}

/// The frame a master emits at the head of every cycle.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SyncRepr {
    /// Cycle number, truncated to 16 bit on the wire.
    pub cycle_no: u16,
    /// Scheduled start of this cycle, master clock.
    pub sched_xmit_stamp: u64,
    /// Actual transmit time, master clock; patched at transmission.
    pub xmit_stamp: u64,
}

impl SyncRepr {
    /// Offset of the transmit-stamp patch field within the frame.
    pub const XMIT_STAMP_OFFSET: usize = field::SYNC_XMIT.start;

    pub fn parse(data: &[u8]) -> Result<SyncRepr> {
        if frame_id(data)? != FrameId::Sync || data.len() < SYNC_LEN {
            return Err(Error);
        }
        Ok(SyncRepr {
            cycle_no: NetworkEndian::read_u16(&data[field::SYNC_CYCLE_NO]),
            sched_xmit_stamp: NetworkEndian::read_u64(&data[field::SYNC_SCHED_XMIT]),
            xmit_stamp: NetworkEndian::read_u64(&data[field::SYNC_XMIT]),
        })
    }

    pub const fn buffer_len(&self) -> usize {
        SYNC_LEN
    }

    pub fn emit(&self, data: &mut [u8]) {
        emit_head(data, FrameId::Sync);
        NetworkEndian::write_u16(&mut data[field::SYNC_CYCLE_NO], self.cycle_no);
        NetworkEndian::write_u64(&mut data[field::SYNC_SCHED_XMIT], self.sched_xmit_stamp);
        NetworkEndian::write_u64(&mut data[field::SYNC_XMIT], self.xmit_stamp);
    }
}

/// Calibration request, slave to master.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CalRequestRepr {
    /// Transmit time of this request, local (slave) clock; patched.
    pub xmit_stamp: u64,
    /// Cycle in which the slave expects the reply.
    pub reply_cycle: u32,
    /// Slot offset at which the slave expects the reply.
    pub reply_offset: u64,
}

impl CalRequestRepr {
    pub const XMIT_STAMP_OFFSET: usize = field::REQ_CAL_XMIT.start;

    pub fn parse(data: &[u8]) -> Result<CalRequestRepr> {
        if frame_id(data)? != FrameId::RequestCal || data.len() < REQ_CAL_LEN {
            return Err(Error);
        }
        Ok(CalRequestRepr {
            xmit_stamp: NetworkEndian::read_u64(&data[field::REQ_CAL_XMIT]),
            reply_cycle: NetworkEndian::read_u32(&data[field::REQ_CAL_RPL_CYCLE]),
            reply_offset: NetworkEndian::read_u64(&data[field::REQ_CAL_RPL_OFFSET]),
        })
    }

    pub const fn buffer_len(&self) -> usize {
        REQ_CAL_LEN
    }

    pub fn emit(&self, data: &mut [u8]) {
        emit_head(data, FrameId::RequestCal);
        NetworkEndian::write_u64(&mut data[field::REQ_CAL_XMIT], self.xmit_stamp);
        NetworkEndian::write_u32(&mut data[field::REQ_CAL_RPL_CYCLE], self.reply_cycle);
        NetworkEndian::write_u64(&mut data[field::REQ_CAL_RPL_OFFSET], self.reply_offset);
    }
}

/// Calibration reply, master to slave.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CalReplyRepr {
    /// Echo of the request's transmit stamp, slave clock.
    pub request_xmit_stamp: u64,
    /// When the master received the request, master clock.
    pub reception_stamp: u64,
    /// When the master transmitted this reply, master clock; patched.
    pub xmit_stamp: u64,
}

impl CalReplyRepr {
    pub const XMIT_STAMP_OFFSET: usize = field::RPL_CAL_XMIT.start;

    pub fn parse(data: &[u8]) -> Result<CalReplyRepr> {
        if frame_id(data)? != FrameId::ReplyCal || data.len() < RPL_CAL_LEN {
            return Err(Error);
        }
        Ok(CalReplyRepr {
            request_xmit_stamp: NetworkEndian::read_u64(&data[field::RPL_CAL_REQ_XMIT]),
            reception_stamp: NetworkEndian::read_u64(&data[field::RPL_CAL_RECEPTION]),
            xmit_stamp: NetworkEndian::read_u64(&data[field::RPL_CAL_XMIT]),
        })
    }

    pub const fn buffer_len(&self) -> usize {
        RPL_CAL_LEN
    }

    pub fn emit(&self, data: &mut [u8]) {
        emit_head(data, FrameId::ReplyCal);
        NetworkEndian::write_u64(&mut data[field::RPL_CAL_REQ_XMIT], self.request_xmit_stamp);
        NetworkEndian::write_u64(&mut data[field::RPL_CAL_RECEPTION], self.reception_stamp);
        NetworkEndian::write_u64(&mut data[field::RPL_CAL_XMIT], self.xmit_stamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_roundtrip() {
        let repr = SyncRepr {
            cycle_no: 512,
            sched_xmit_stamp: 1_000_000_000,
            xmit_stamp: 0,
        };
        let mut bytes = vec![0u8; repr.buffer_len()];
        repr.emit(&mut bytes);
        assert_eq!(frame_id(&bytes).unwrap(), FrameId::Sync);
        assert_eq!(SyncRepr::parse(&bytes).unwrap(), repr);
    }

    #[test]
    fn cal_roundtrip() {
        let req = CalRequestRepr {
            xmit_stamp: 42,
            reply_cycle: 7,
            reply_offset: 200_000,
        };
        let mut bytes = vec![0u8; req.buffer_len()];
        req.emit(&mut bytes);
        assert_eq!(CalRequestRepr::parse(&bytes).unwrap(), req);

        let rpl = CalReplyRepr {
            request_xmit_stamp: 42,
            reception_stamp: 100,
            xmit_stamp: 150,
        };
        let mut bytes = vec![0u8; rpl.buffer_len()];
        rpl.emit(&mut bytes);
        assert_eq!(CalReplyRepr::parse(&bytes).unwrap(), rpl);
    }

    #[test]
    fn version_mismatch_rejected() {
        let repr = SyncRepr {
            cycle_no: 1,
            sched_xmit_stamp: 0,
            xmit_stamp: 0,
        };
        let mut bytes = vec![0u8; repr.buffer_len()];
        repr.emit(&mut bytes);
        bytes[0] = 0x01;
        assert_eq!(frame_id(&bytes).err(), Some(Error));
    }

    #[test]
    fn patch_offset_hits_xmit_stamp() {
        let repr = SyncRepr {
            cycle_no: 1,
            sched_xmit_stamp: 2,
            xmit_stamp: 0,
        };
        let mut bytes = vec![0u8; repr.buffer_len()];
        repr.emit(&mut bytes);
        NetworkEndian::write_u64(
            &mut bytes[SyncRepr::XMIT_STAMP_OFFSET..SyncRepr::XMIT_STAMP_OFFSET + 8],
            99,
        );
        assert_eq!(SyncRepr::parse(&bytes).unwrap().xmit_stamp, 99);
    }
}
