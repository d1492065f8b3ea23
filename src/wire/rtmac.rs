use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::{Error, Result};

/// Protocol version spoken by this implementation.
pub const VERSION: u8 = 0x02;

/// The frame carries a tunnelled non-realtime Ethernet frame for the
/// virtual NIC instead of discipline traffic.
pub const FLAG_TUNNEL: u8 = 0x01;

/// The media-access discipline a frame belongs to.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DisciplineType {
    Tdma,
    Nomac,
    Unknown(u16),
}

impl From<u16> for DisciplineType {
    fn from(value: u16) -> DisciplineType {
        match value {
            0x0001 => DisciplineType::Tdma,
            0x0002 => DisciplineType::Nomac,
            other => DisciplineType::Unknown(other),
        }
    }
}

impl From<DisciplineType> for u16 {
    fn from(value: DisciplineType) -> u16 {
        match value {
            DisciplineType::Tdma => 0x0001,
            DisciplineType::Nomac => 0x0002,
            DisciplineType::Unknown(other) => other,
        }
    }
}

/// A read/write wrapper around the discipline header that follows the
/// Ethernet header on every RTmac frame.
#[derive(Debug, Clone)]
pub struct Header<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    use crate::wire::field::*;

    pub const TYPE: Field = 0..2;
    pub const VERSION: usize = 2;
    pub const FLAGS: usize = 3;
    pub const PAYLOAD: Rest = 4..;
}

pub const HEADER_LEN: usize = field::PAYLOAD.start;

impl<T: AsRef<[u8]>> Header<T> {
    pub const fn new_unchecked(buffer: T) -> Header<T> {
        Header { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Header<T>> {
        let header = Self::new_unchecked(buffer);
        header.check_len()?;
        Ok(header)
    }

    pub fn check_len(&self) -> Result<()> {
        if self.buffer.as_ref().len() < HEADER_LEN {
            Err(Error)
        } else {
            Ok(())
        }
    }

    /// Return the discipline type field.
    #[inline]
    pub fn discipline(&self) -> DisciplineType {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::TYPE]).into()
    }

    /// Return the version field.
    #[inline]
    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[field::VERSION]
    }

    /// Return the flags field.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.buffer.as_ref()[field::FLAGS]
    }

    /// Query the tunnel flag.
    #[inline]
    pub fn is_tunnel(&self) -> bool {
        self.flags() & FLAG_TUNNEL != 0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Header<&'a T> {
    /// Return a pointer to the discipline payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.buffer.as_ref()[field::PAYLOAD]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Header<T> {
    #[inline]
    pub fn set_discipline(&mut self, value: DisciplineType) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::TYPE], value.into())
    }

    #[inline]
    pub fn set_version(&mut self, value: u8) {
        self.buffer.as_mut()[field::VERSION] = value
    }

    #[inline]
    pub fn set_flags(&mut self, value: u8) {
        self.buffer.as_mut()[field::FLAGS] = value
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[field::PAYLOAD]
    }
}

/// A high-level representation of an RTmac discipline header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub discipline: DisciplineType,
    pub flags: u8,
}

impl Repr {
    /// Parse a discipline header, rejecting version mismatches.
    pub fn parse<T: AsRef<[u8]> + ?Sized>(header: &Header<&T>) -> Result<Repr> {
        header.check_len()?;
        if header.version() != VERSION {
            return Err(Error);
        }
        Ok(Repr {
            discipline: header.discipline(),
            flags: header.flags(),
        })
    }

    pub const fn buffer_len(&self) -> usize {
        HEADER_LEN
    }

    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, header: &mut Header<T>) {
        header.set_discipline(self.discipline);
        header.set_version(VERSION);
        header.set_flags(self.flags);
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "RTmac disc={:?} flags={:#04x}",
            self.discipline, self.flags
        )
    }
}
