//! Configuration-distribution frames.
//!
//! Every frame begins with a single packed byte carrying a 3-bit version
//! and a 5-bit frame id, followed by id-specific fields. Station addresses
//! are variable length: `addr_type` 0 names the station by its Ethernet
//! source address (zero additional bytes), 1 appends a four-byte IPv4
//! address.

use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::ipv4::Address as Ipv4Address;
use super::{Error, Result};

/// Protocol version spoken by this implementation.
pub const VERSION: u8 = 2;

/// The kind of a configuration frame.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FrameId {
    Stage1Cfg,
    AnnounceNew,
    AnnounceReply,
    Stage2Cfg,
    Stage2CfgFrag,
    AckCfg,
    Heartbeat,
    Ready,
    Unknown(u8),
}

impl From<u8> for FrameId {
    fn from(value: u8) -> FrameId {
        match value {
            0 => FrameId::Stage1Cfg,
            1 => FrameId::AnnounceNew,
            2 => FrameId::AnnounceReply,
            3 => FrameId::Stage2Cfg,
            4 => FrameId::Stage2CfgFrag,
            5 => FrameId::AckCfg,
            6 => FrameId::Heartbeat,
            7 => FrameId::Ready,
            other => FrameId::Unknown(other),
        }
    }
}

impl From<FrameId> for u8 {
    fn from(value: FrameId) -> u8 {
        match value {
            FrameId::Stage1Cfg => 0,
            FrameId::AnnounceNew => 1,
            FrameId::AnnounceReply => 2,
            FrameId::Stage2Cfg => 3,
            FrameId::Stage2CfgFrag => 4,
            FrameId::AckCfg => 5,
            FrameId::Heartbeat => 6,
            FrameId::Ready => 7,
            FrameId::Unknown(other) => other,
        }
    }
}

/// A station address as carried on the wire.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RtcfgAddr {
    /// Address the station by its Ethernet address.
    Mac,
    /// Address the station by IPv4 address.
    Ip(Ipv4Address),
}

impl RtcfgAddr {
    const TYPE_MAC: u8 = 0;
    const TYPE_IP: u8 = 1;

    const fn addr_len(addr_type: u8) -> Result<usize> {
        match addr_type {
            RtcfgAddr::TYPE_MAC => Ok(0),
            RtcfgAddr::TYPE_IP => Ok(4),
            _ => Err(Error),
        }
    }

    const fn len(&self) -> usize {
        match self {
            RtcfgAddr::Mac => 0,
            RtcfgAddr::Ip(_) => 4,
        }
    }

    fn parse(data: &[u8], at: &mut usize) -> Result<RtcfgAddr> {
        let addr_type = *data.get(*at).ok_or(Error)?;
        *at += 1;
        RtcfgAddr::parse_raw(addr_type, data, at)
    }

    /// Parse the address bytes for an already-consumed `addr_type`.
    fn parse_raw(addr_type: u8, data: &[u8], at: &mut usize) -> Result<RtcfgAddr> {
        match addr_type {
            RtcfgAddr::TYPE_MAC => Ok(RtcfgAddr::Mac),
            RtcfgAddr::TYPE_IP => {
                let bytes = data.get(*at..*at + 4).ok_or(Error)?;
                *at += 4;
                Ok(RtcfgAddr::Ip(Ipv4Address::new(
                    bytes[0], bytes[1], bytes[2], bytes[3],
                )))
            }
            _ => Err(Error),
        }
    }

    fn emit_raw(&self, data: &mut [u8], at: &mut usize) {
        if let RtcfgAddr::Ip(addr) = self {
            data[*at..*at + 4].copy_from_slice(&addr.octets());
            *at += 4;
        }
    }

    const fn addr_type(&self) -> u8 {
        match self {
            RtcfgAddr::Mac => RtcfgAddr::TYPE_MAC,
            RtcfgAddr::Ip(_) => RtcfgAddr::TYPE_IP,
        }
    }

    fn emit(&self, data: &mut [u8], at: &mut usize) {
        match self {
            RtcfgAddr::Mac => {
                data[*at] = RtcfgAddr::TYPE_MAC;
                *at += 1;
            }
            RtcfgAddr::Ip(addr) => {
                data[*at] = RtcfgAddr::TYPE_IP;
                *at += 1;
                data[*at..*at + 4].copy_from_slice(&addr.octets());
                *at += 4;
            }
        }
    }
}

impl fmt::Display for RtcfgAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RtcfgAddr::Mac => write!(f, "mac"),
            RtcfgAddr::Ip(addr) => write!(f, "{addr}"),
        }
    }
}

/// A thin wrapper around a configuration frame buffer exposing the head.
#[derive(Debug, Clone)]
pub struct Frame<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Frame<T> {
    pub const fn new_unchecked(buffer: T) -> Frame<T> {
        Frame { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Frame<T>> {
        let frame = Self::new_unchecked(buffer);
        frame.check_len()?;
        Ok(frame)
    }

    pub fn check_len(&self) -> Result<()> {
        if self.buffer.as_ref().is_empty() {
            Err(Error)
        } else {
            Ok(())
        }
    }

    /// Return the 5-bit frame id.
    pub fn id(&self) -> FrameId {
        (self.buffer.as_ref()[0] & 0x1f).into()
    }

    /// Return the 3-bit version.
    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[0] >> 5
    }
}

fn emit_head(data: &mut [u8], id: FrameId) {
    data[0] = (VERSION << 5) | (u8::from(id) & 0x1f);
}

/// A high-level representation of a configuration frame.
///
/// `cfg_data` fields borrow from the parsed buffer; emission copies them
/// behind the header.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Repr<'a> {
    /// Periodic server invitation carrying the stage-1 blob.
    Stage1Cfg {
        client_addr: RtcfgAddr,
        server_addr: RtcfgAddr,
        burstrate: u8,
        cfg_data: &'a [u8],
    },
    /// A new client announcing itself.
    AnnounceNew {
        addr: RtcfgAddr,
        get_cfg: bool,
        burstrate: u8,
    },
    /// The server (or another station) replying to an announce.
    AnnounceReply { addr: RtcfgAddr },
    /// Head of the stage-2 transfer.
    Stage2Cfg {
        stations: u32,
        heartbeat_period: u16,
        cfg_len: u32,
        cfg_data: &'a [u8],
    },
    /// A follow-up fragment of the stage-2 blob.
    Stage2CfgFrag { frag_offs: u32, cfg_data: &'a [u8] },
    /// Client acknowledging received configuration bytes.
    AckCfg { ack_len: u32 },
    /// Periodic client liveness signal.
    Heartbeat,
    /// Client reporting that its application is up.
    Ready,
}

impl<'a> Repr<'a> {
    /// Parse a configuration frame, rejecting version mismatches.
    pub fn parse(data: &'a [u8]) -> Result<Repr<'a>> {
        let frame = Frame::new_checked(data)?;
        if frame.version() != VERSION {
            return Err(Error);
        }

        let mut at = 1;
        match frame.id() {
            FrameId::Stage1Cfg => {
                // A single addr_type byte is followed by both raw addresses.
                let addr_type = *data.get(at).ok_or(Error)?;
                let addr_len = RtcfgAddr::addr_len(addr_type)?;
                at += 1;
                let client_addr = RtcfgAddr::parse_raw(addr_type, data, &mut at)?;
                let server_addr = RtcfgAddr::parse_raw(addr_type, data, &mut at)?;
                debug_assert_eq!(client_addr.len(), addr_len);
                let burstrate = *data.get(at).ok_or(Error)?;
                at += 1;
                let cfg_len =
                    NetworkEndian::read_u16(data.get(at..at + 2).ok_or(Error)?) as usize;
                at += 2;
                let cfg_data = data.get(at..at + cfg_len).ok_or(Error)?;
                Ok(Repr::Stage1Cfg {
                    client_addr,
                    server_addr,
                    burstrate,
                    cfg_data,
                })
            }
            FrameId::AnnounceNew => {
                let addr = RtcfgAddr::parse(data, &mut at)?;
                let get_cfg = *data.get(at).ok_or(Error)? != 0;
                at += 1;
                let burstrate = *data.get(at).ok_or(Error)?;
                Ok(Repr::AnnounceNew {
                    addr,
                    get_cfg,
                    burstrate,
                })
            }
            FrameId::AnnounceReply => {
                let addr = RtcfgAddr::parse(data, &mut at)?;
                Ok(Repr::AnnounceReply { addr })
            }
            FrameId::Stage2Cfg => {
                let stations = NetworkEndian::read_u32(data.get(at..at + 4).ok_or(Error)?);
                at += 4;
                let heartbeat_period =
                    NetworkEndian::read_u16(data.get(at..at + 2).ok_or(Error)?);
                at += 2;
                let cfg_len = NetworkEndian::read_u32(data.get(at..at + 4).ok_or(Error)?);
                at += 4;
                let cfg_data = data.get(at..).ok_or(Error)?;
                if cfg_data.len() > cfg_len as usize {
                    return Err(Error);
                }
                Ok(Repr::Stage2Cfg {
                    stations,
                    heartbeat_period,
                    cfg_len,
                    cfg_data,
                })
            }
            FrameId::Stage2CfgFrag => {
                let frag_offs = NetworkEndian::read_u32(data.get(at..at + 4).ok_or(Error)?);
                at += 4;
                let cfg_data = data.get(at..).ok_or(Error)?;
                Ok(Repr::Stage2CfgFrag {
                    frag_offs,
                    cfg_data,
                })
            }
            FrameId::AckCfg => {
                let ack_len = NetworkEndian::read_u32(data.get(at..at + 4).ok_or(Error)?);
                Ok(Repr::AckCfg { ack_len })
            }
            FrameId::Heartbeat => Ok(Repr::Heartbeat),
            FrameId::Ready => Ok(Repr::Ready),
            FrameId::Unknown(_) => Err(Error),
        }
    }

    /// Return the length of a frame that will be emitted from this
    /// high-level representation.
    pub fn buffer_len(&self) -> usize {
        match self {
            Repr::Stage1Cfg {
                client_addr,
                server_addr,
                cfg_data,
                ..
            } => {
                // One shared addr_type byte, then both raw addresses.
                1 + 1 + client_addr.len() + server_addr.len() + 1 + 2 + cfg_data.len()
            }
            Repr::AnnounceNew { addr, .. } => 1 + 1 + addr.len() + 2,
            Repr::AnnounceReply { addr } => 1 + 1 + addr.len(),
            Repr::Stage2Cfg { cfg_data, .. } => 1 + 4 + 2 + 4 + cfg_data.len(),
            Repr::Stage2CfgFrag { cfg_data, .. } => 1 + 4 + cfg_data.len(),
            Repr::AckCfg { .. } => 1 + 4,
            Repr::Heartbeat | Repr::Ready => 1,
        }
    }

    /// Emit a high-level representation into an octet buffer.
    pub fn emit(&self, data: &mut [u8]) {
        match self {
            Repr::Stage1Cfg {
                client_addr,
                server_addr,
                burstrate,
                cfg_data,
            } => {
                assert_eq!(client_addr.addr_type(), server_addr.addr_type());
                emit_head(data, FrameId::Stage1Cfg);
                let mut at = 1;
                data[at] = client_addr.addr_type();
                at += 1;
                client_addr.emit_raw(data, &mut at);
                server_addr.emit_raw(data, &mut at);
                data[at] = *burstrate;
                at += 1;
                NetworkEndian::write_u16(&mut data[at..at + 2], cfg_data.len() as u16);
                at += 2;
                data[at..at + cfg_data.len()].copy_from_slice(cfg_data);
            }
            Repr::AnnounceNew {
                addr,
                get_cfg,
                burstrate,
            } => {
                emit_head(data, FrameId::AnnounceNew);
                let mut at = 1;
                addr.emit(data, &mut at);
                data[at] = *get_cfg as u8;
                data[at + 1] = *burstrate;
            }
            Repr::AnnounceReply { addr } => {
                emit_head(data, FrameId::AnnounceReply);
                let mut at = 1;
                addr.emit(data, &mut at);
            }
            Repr::Stage2Cfg {
                stations,
                heartbeat_period,
                cfg_len,
                cfg_data,
            } => {
                emit_head(data, FrameId::Stage2Cfg);
                let mut at = 1;
                NetworkEndian::write_u32(&mut data[at..at + 4], *stations);
                at += 4;
                NetworkEndian::write_u16(&mut data[at..at + 2], *heartbeat_period);
                at += 2;
                NetworkEndian::write_u32(&mut data[at..at + 4], *cfg_len);
                at += 4;
                data[at..at + cfg_data.len()].copy_from_slice(cfg_data);
            }
            Repr::Stage2CfgFrag {
                frag_offs,
                cfg_data,
            } => {
                emit_head(data, FrameId::Stage2CfgFrag);
                let mut at = 1;
                NetworkEndian::write_u32(&mut data[at..at + 4], *frag_offs);
                at += 4;
                data[at..at + cfg_data.len()].copy_from_slice(cfg_data);
            }
            Repr::AckCfg { ack_len } => {
                emit_head(data, FrameId::AckCfg);
                NetworkEndian::write_u32(&mut data[1..5], *ack_len);
            }
            Repr::Heartbeat => emit_head(data, FrameId::Heartbeat),
            Repr::Ready => emit_head(data, FrameId::Ready),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(repr: Repr<'_>) {
        let mut bytes = vec![0u8; repr.buffer_len()];
        repr.emit(&mut bytes);
        assert_eq!(Repr::parse(&bytes).unwrap(), repr);
    }

    #[test]
    fn all_frames_roundtrip() {
        roundtrip(Repr::Stage1Cfg {
            client_addr: RtcfgAddr::Ip(Ipv4Address::new(10, 0, 0, 2)),
            server_addr: RtcfgAddr::Ip(Ipv4Address::new(10, 0, 0, 1)),
            burstrate: 4,
            cfg_data: b"stage-1 payload",
        });
        roundtrip(Repr::AnnounceNew {
            addr: RtcfgAddr::Ip(Ipv4Address::new(10, 0, 0, 2)),
            get_cfg: true,
            burstrate: 4,
        });
        roundtrip(Repr::AnnounceReply { addr: RtcfgAddr::Mac });
        roundtrip(Repr::Stage2Cfg {
            stations: 2,
            heartbeat_period: 500,
            cfg_len: 6,
            cfg_data: b"abc",
        });
        roundtrip(Repr::Stage2CfgFrag {
            frag_offs: 3,
            cfg_data: b"def",
        });
        roundtrip(Repr::AckCfg { ack_len: 6 });
        roundtrip(Repr::Heartbeat);
        roundtrip(Repr::Ready);
    }

    #[test]
    fn version_mismatch_rejected() {
        let repr = Repr::Heartbeat;
        let mut bytes = vec![0u8; repr.buffer_len()];
        repr.emit(&mut bytes);
        bytes[0] = (7 << 5) | u8::from(FrameId::Heartbeat);
        assert_eq!(Repr::parse(&bytes).err(), Some(Error));
    }

    #[test]
    fn head_packing() {
        let mut bytes = [0u8];
        emit_head(&mut bytes, FrameId::AckCfg);
        let frame = Frame::new_checked(&bytes[..]).unwrap();
        assert_eq!(frame.id(), FrameId::AckCfg);
        assert_eq!(frame.version(), VERSION);
    }

    #[test]
    fn truncated_frame_rejected() {
        let repr = Repr::AckCfg { ack_len: 10 };
        let mut bytes = vec![0u8; repr.buffer_len()];
        repr.emit(&mut bytes);
        assert_eq!(Repr::parse(&bytes[..3]).err(), Some(Error));
    }
}
