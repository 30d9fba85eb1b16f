//! Blocking transaction payload

use std::fmt;

use crate::addr::AddrSpace;

/// Identifies the initiator of a transaction (CPU index for wrappers).
pub type InitiatorId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Read,
    Write,
}

/// Outcome of a blocking transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlmStatus {
    Ok,
    AddressError,
    GenericError,
}

impl TlmStatus {
    pub fn is_ok(self) -> bool {
        self == TlmStatus::Ok
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Payload {
    pub command: Command,
    pub address: u64,
    pub data: Vec<u8>,
    /// One byte per data byte, `0xff` enables the lane.
    pub byte_enable: Option<Vec<u8>>,
    /// `false` for DMI queries: the target only reports eligibility.
    pub is_active: bool,
    /// Set by the target when the fast path is safe for this address.
    pub dmi: bool,
    /// Part of an exclusive (load-linked / store-conditional) pair.
    pub exclusive: bool,
    pub initiator: InitiatorId,
}

impl Payload {
    pub fn read(address: u64, len: usize, initiator: InitiatorId) -> Self {
        Payload {
            command: Command::Read,
            address,
            data: vec![0; len],
            byte_enable: None,
            is_active: true,
            dmi: false,
            exclusive: false,
            initiator,
        }
    }

    pub fn write(address: u64, data: &[u8], initiator: InitiatorId) -> Self {
        Payload {
            command: Command::Write,
            data: data.to_vec(),
            ..Payload::read(address, 0, initiator)
        }
    }

    /// DMI query for `address`.
    pub fn dmi_query(address: u64, command: Command, initiator: InitiatorId) -> Self {
        Payload {
            command,
            is_active: false,
            ..Payload::read(address, 0, initiator)
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Addresses touched, `None` for empty payloads or when the access wraps.
    pub fn span(&self) -> Option<AddrSpace> {
        AddrSpace::from_size(self.address, self.data.len() as u64).ok()
    }

    /// Data as a little-endian integer (up to 8 bytes).
    pub fn data_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        let n = self.data.len().min(8);
        buf[..n].copy_from_slice(&self.data[..n]);
        u64::from_le_bytes(buf)
    }

    /// Fill the data buffer with `value`, little-endian, truncated to its length.
    pub fn set_data_u64(&mut self, value: u64) {
        let bytes = value.to_le_bytes();
        let n = self.data.len().min(8);
        self.data[..n].copy_from_slice(&bytes[..n]);
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.command {
            Command::Read => "R",
            Command::Write => "W",
        };
        write!(f, "{}{} 0x{:x}+{} from {}", if self.is_active { "" } else { "query " }, op, self.address, self.data.len(), self.initiator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_helpers() {
        let mut p = Payload::read(0x100, 4, 0);
        p.set_data_u64(0x1122_3344_5566);
        assert_eq!(p.data, vec![0x66, 0x55, 0x44, 0x33]);
        assert_eq!(p.data_u64(), 0x3344_5566);
        assert_eq!(p.span(), Some(AddrSpace::new(0x100, 0x103).unwrap()));
        assert!(Payload::dmi_query(0x0, Command::Read, 1).span().is_none());
    }
}
