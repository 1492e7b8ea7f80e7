/// ADU buffer and frame length computation
///
/// [`Adu`] is the single fixed-capacity buffer type every frame passes
/// through, sized for the larger of the two transports (260 bytes). The
/// length tables below drive the receive loop: once the function byte is
/// known they give the number of fixed "meta" bytes that follow it, and
/// once the meta bytes arrived they give the remaining variable data
/// length. Both tables depend on whether the frame is a request arriving
/// at a server (indication) or a response arriving at a client
/// (confirmation).
use std::fmt;
use std::ops::Deref;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::data_utils;
use crate::MAX_ADU_LENGTH;

/// Direction of a frame relative to the receiving side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Request arriving at a server
    Indication,
    /// Response arriving at a client
    Confirmation,
}

/// Fixed-capacity ADU buffer, large enough for either transport
#[derive(Clone)]
pub struct Adu {
    buf: [u8; MAX_ADU_LENGTH],
    len: usize,
}

impl Adu {
    pub fn new() -> Self {
        Adu {
            buf: [0u8; MAX_ADU_LENGTH],
            len: 0,
        }
    }

    /// Copy existing bytes into a fresh buffer
    pub fn from_slice(data: &[u8]) -> ModbusResult<Self> {
        let mut adu = Adu::new();
        adu.extend_from_slice(data)?;
        Ok(adu)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_ADU_LENGTH {
            return Err(ModbusError::too_many_data("ADU buffer full"));
        }
        self.buf[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) -> ModbusResult<()> {
        if self.len + data.len() > MAX_ADU_LENGTH {
            return Err(ModbusError::too_many_data(format!(
                "ADU would grow to {} bytes, maximum is {}",
                self.len + data.len(),
                MAX_ADU_LENGTH
            )));
        }
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    pub fn push_u16_be(&mut self, value: u16) -> ModbusResult<()> {
        self.extend_from_slice(&value.to_be_bytes())
    }

    /// Overwrite two bytes in place, big-endian. Used to patch the MBAP
    /// length field once the frame is complete.
    pub fn set_u16_be(&mut self, at: usize, value: u16) {
        debug_assert!(at + 2 <= self.len);
        self.buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    /// Writable tail of the buffer, at most `max` bytes
    pub(crate) fn spare_mut(&mut self, max: usize) -> &mut [u8] {
        let end = (self.len + max).min(MAX_ADU_LENGTH);
        let start = self.len;
        &mut self.buf[start..end]
    }

    /// Commit `n` bytes written into the spare area
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(self.len + n <= MAX_ADU_LENGTH);
        self.len += n;
    }
}

impl Default for Adu {
    fn default() -> Self {
        Adu::new()
    }
}

impl Deref for Adu {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Adu {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Adu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Adu[{}; ", self.len)?;
        for (i, byte) in self.as_slice().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        write!(f, "]")
    }
}

/// Number of fixed bytes following the function code, before any
/// variable-length data. Unknown function codes yield a minimal estimate so
/// the dispatcher can still read the frame and answer with an exception.
pub fn meta_length_after_function(function: u8, kind: FrameKind) -> usize {
    match kind {
        FrameKind::Indication => match function {
            0x01..=0x06 => 4,
            0x0F | 0x10 => 5,
            0x16 => 6,
            0x17 => 9,
            _ => 0,
        },
        FrameKind::Confirmation => match function {
            0x05 | 0x06 | 0x0F | 0x10 => 4,
            0x16 => 6,
            // read responses and exceptions carry one leading byte:
            // the byte count or the exception code
            _ => 1,
        },
    }
}

/// Variable data length, readable once the meta bytes are present.
/// `msg` must hold at least `header_length + 1 + meta` bytes.
pub fn data_length_after_meta(msg: &[u8], header_length: usize, kind: FrameKind) -> usize {
    let function = msg[header_length];
    match kind {
        FrameKind::Indication => match function {
            0x0F | 0x10 => msg[header_length + 5] as usize,
            0x17 => msg[header_length + 9] as usize,
            _ => 0,
        },
        FrameKind::Confirmation => match function {
            0x01..=0x04 | 0x11 | 0x17 => msg[header_length + 1] as usize,
            _ => 0,
        },
    }
}

/// Decode a bit-read payload (`[byte_count, packed bits...]`) into booleans
pub fn decode_bit_payload(payload: &[u8], count: u16) -> ModbusResult<Vec<bool>> {
    if payload.is_empty() {
        return Err(ModbusError::frame("empty bit payload"));
    }
    let byte_count = payload[0] as usize;
    let expected = (count as usize + 7) / 8;
    if byte_count != expected || payload.len() != 1 + byte_count {
        return Err(ModbusError::frame(format!(
            "bit payload declares {} bytes, expected {} for {} bits",
            byte_count, expected, count
        )));
    }
    Ok(data_utils::unpack_bits(&payload[1..], count as usize))
}

/// Decode a register-read payload (`[byte_count, registers...]`)
pub fn decode_register_payload(payload: &[u8], count: u16) -> ModbusResult<Vec<u16>> {
    if payload.is_empty() {
        return Err(ModbusError::frame("empty register payload"));
    }
    let byte_count = payload[0] as usize;
    let expected = count as usize * 2;
    if byte_count != expected || payload.len() != 1 + byte_count {
        return Err(ModbusError::frame(format!(
            "register payload declares {} bytes, expected {} for {} registers",
            byte_count, expected, count
        )));
    }
    data_utils::bytes_to_registers(&payload[1..])
        .ok_or_else(|| ModbusError::frame("odd register payload length"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adu_building() {
        let mut adu = Adu::new();
        assert!(adu.is_empty());

        adu.push(0x01).unwrap();
        adu.push(0x03).unwrap();
        adu.push_u16_be(0x0064).unwrap();
        adu.push_u16_be(0x0003).unwrap();
        assert_eq!(adu.as_slice(), &[0x01, 0x03, 0x00, 0x64, 0x00, 0x03]);

        adu.set_u16_be(2, 0x1234);
        assert_eq!(adu[2..4], [0x12, 0x34]);

        adu.truncate(2);
        assert_eq!(adu.len(), 2);
    }

    #[test]
    fn test_adu_capacity_enforced() {
        let mut adu = Adu::from_slice(&[0u8; MAX_ADU_LENGTH]).unwrap();
        assert!(adu.push(0x00).is_err());
        assert!(adu.extend_from_slice(&[0x00]).is_err());
    }

    #[test]
    fn test_adu_spare_area() {
        let mut adu = Adu::new();
        let spare = adu.spare_mut(12);
        assert_eq!(spare.len(), 12);
        spare[..3].copy_from_slice(&[0xAA, 0xBB, 0xCC]);
        adu.advance(3);
        assert_eq!(adu.as_slice(), &[0xAA, 0xBB, 0xCC]);

        // near capacity the spare area shrinks
        let mut adu = Adu::from_slice(&[0u8; MAX_ADU_LENGTH - 2]).unwrap();
        assert_eq!(adu.spare_mut(12).len(), 2);
    }

    #[test]
    fn test_meta_length_tables() {
        use FrameKind::*;

        // requests: read and single-write carry address + quantity/value
        assert_eq!(meta_length_after_function(0x03, Indication), 4);
        assert_eq!(meta_length_after_function(0x05, Indication), 4);
        // multiple writes add the byte count
        assert_eq!(meta_length_after_function(0x10, Indication), 5);
        assert_eq!(meta_length_after_function(0x16, Indication), 6);
        assert_eq!(meta_length_after_function(0x17, Indication), 9);
        assert_eq!(meta_length_after_function(0x11, Indication), 0);

        // responses: reads lead with a byte count, echoes are fixed
        assert_eq!(meta_length_after_function(0x01, Confirmation), 1);
        assert_eq!(meta_length_after_function(0x06, Confirmation), 4);
        assert_eq!(meta_length_after_function(0x10, Confirmation), 4);
        assert_eq!(meta_length_after_function(0x16, Confirmation), 6);
        // exception response: one code byte
        assert_eq!(meta_length_after_function(0x83, Confirmation), 1);
    }

    #[test]
    fn test_data_length_tables() {
        use FrameKind::*;

        // write-multiple-registers request, byte count 6 at header+5 (RTU)
        let msg = [0x11, 0x10, 0x00, 0x01, 0x00, 0x03, 0x06];
        assert_eq!(data_length_after_meta(&msg, 1, Indication), 6);

        // read-holding response, byte count at header+1
        let msg = [0x11, 0x03, 0x06, 0xAE, 0x41, 0x56, 0x52, 0x43, 0x40];
        assert_eq!(data_length_after_meta(&msg, 1, Confirmation), 6);

        // single-write echo carries no variable part
        let msg = [0x11, 0x06, 0x00, 0x01, 0x00, 0x03];
        assert_eq!(data_length_after_meta(&msg, 1, Confirmation), 0);
    }

    #[test]
    fn test_decode_bit_payload() {
        // 10 coils packed into 2 bytes
        let payload = [0x02, 0b1100_1101, 0b0000_0010];
        let bits = decode_bit_payload(&payload, 10).unwrap();
        assert_eq!(bits.len(), 10);
        assert!(bits[0] && bits[2] && bits[3] && bits[6] && bits[7] && bits[9]);
        assert!(!bits[1] && !bits[4] && !bits[5] && !bits[8]);

        // declared byte count disagrees with quantity
        assert!(decode_bit_payload(&payload, 20).is_err());
        assert!(decode_bit_payload(&[0x02, 0xFF], 10).is_err());
    }

    #[test]
    fn test_decode_register_payload() {
        let payload = [0x04, 0x00, 0x0A, 0x01, 0x02];
        assert_eq!(
            decode_register_payload(&payload, 2).unwrap(),
            vec![0x000A, 0x0102]
        );

        assert!(decode_register_payload(&payload, 3).is_err());
        assert!(decode_register_payload(&[], 1).is_err());
    }
}
