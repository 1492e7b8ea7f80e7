/// Modbus protocol definitions
///
/// Function codes, exception codes and the data layout helpers shared by
/// client and server: bit packing (LSB-first within each byte), big-endian
/// register serialization, and the u32/f32 register-pair conversions.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier (0 = broadcast, 1-247 devices, 0xFF TCP)
pub type SlaveId = u8;

/// Modbus function codes supported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Report Slave ID (0x11)
    ReportSlaveId = 0x11,
    /// Mask Write Register (0x16)
    MaskWriteRegister = 0x16,
    /// Write And Read Registers (0x17)
    WriteAndReadRegisters = 0x17,
}

impl ModbusFunction {
    /// Convert from a function code byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusFunction::ReadCoils),
            0x02 => Some(ModbusFunction::ReadDiscreteInputs),
            0x03 => Some(ModbusFunction::ReadHoldingRegisters),
            0x04 => Some(ModbusFunction::ReadInputRegisters),
            0x05 => Some(ModbusFunction::WriteSingleCoil),
            0x06 => Some(ModbusFunction::WriteSingleRegister),
            0x0F => Some(ModbusFunction::WriteMultipleCoils),
            0x10 => Some(ModbusFunction::WriteMultipleRegisters),
            0x11 => Some(ModbusFunction::ReportSlaveId),
            0x16 => Some(ModbusFunction::MaskWriteRegister),
            0x17 => Some(ModbusFunction::WriteAndReadRegisters),
            _ => None,
        }
    }

    /// Function code byte
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Functions whose confirmation carries a data payload to decode
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
                | ModbusFunction::WriteAndReadRegisters
                | ModbusFunction::ReportSlaveId
        )
    }

    /// Functions that modify server state
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteSingleRegister
                | ModbusFunction::WriteMultipleCoils
                | ModbusFunction::WriteMultipleRegisters
                | ModbusFunction::MaskWriteRegister
                | ModbusFunction::WriteAndReadRegisters
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
            ModbusFunction::ReportSlaveId => "Report Slave ID",
            ModbusFunction::MaskWriteRegister => "Mask Write Register",
            ModbusFunction::WriteAndReadRegisters => "Write And Read Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Standard Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusException {
    /// Function code not supported (0x01)
    IllegalFunction = 0x01,
    /// Address range outside the mapping (0x02)
    IllegalDataAddress = 0x02,
    /// Quantity or value outside the allowed range (0x03)
    IllegalDataValue = 0x03,
    /// Unrecoverable failure while servicing the request (0x04)
    ServerDeviceFailure = 0x04,
    /// Long-running request accepted, poll for completion (0x05)
    Acknowledge = 0x05,
    /// Server busy with a long-running command (0x06)
    ServerDeviceBusy = 0x06,
    /// Negative acknowledge, function cannot be performed (0x07)
    NegativeAcknowledge = 0x07,
    /// Memory parity error on extended file access (0x08)
    MemoryParityError = 0x08,
    /// Gateway path unavailable (0x0A)
    GatewayPathUnavailable = 0x0A,
    /// Gateway target device failed to respond (0x0B)
    GatewayTargetFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from an exception code byte; reserved and unknown codes map
    /// to `None` so callers can surface an invalid-exception error
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x07 => Some(ModbusException::NegativeAcknowledge),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetFailedToRespond),
            _ => None,
        }
    }

    /// Exception code byte
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "Illegal function",
            ModbusException::IllegalDataAddress => "Illegal data address",
            ModbusException::IllegalDataValue => "Illegal data value",
            ModbusException::ServerDeviceFailure => "Server device failure",
            ModbusException::Acknowledge => "Acknowledge",
            ModbusException::ServerDeviceBusy => "Server device busy",
            ModbusException::NegativeAcknowledge => "Negative acknowledge",
            ModbusException::MemoryParityError => "Memory parity error",
            ModbusException::GatewayPathUnavailable => "Gateway path unavailable",
            ModbusException::GatewayTargetFailedToRespond => "Gateway target failed to respond",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), *self as u8)
    }
}

/// Data conversion helpers for the Modbus data model
pub mod data_utils {
    /// Serialize registers big-endian, two bytes each
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Deserialize big-endian register bytes; `None` on odd byte count
    pub fn bytes_to_registers(bytes: &[u8]) -> Option<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(2)
                .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                .collect(),
        )
    }

    /// Pack bit values into bytes, LSB-first within each byte
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Unpack `count` bit values from packed bytes, LSB-first
    pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
        (0..count.min(bytes.len() * 8))
            .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
            .collect()
    }

    /// Split a u32 across two registers, high word first
    pub fn u32_to_registers(value: u32) -> [u16; 2] {
        [(value >> 16) as u16, value as u16]
    }

    /// Combine a high/low register pair into a u32
    pub fn registers_to_u32(high: u16, low: u16) -> u32 {
        ((high as u32) << 16) | (low as u32)
    }

    /// Split an f32 across two registers, high word first
    pub fn f32_to_registers(value: f32) -> [u16; 2] {
        u32_to_registers(value.to_bits())
    }

    /// Combine a high/low register pair into an f32
    pub fn registers_to_f32(high: u16, low: u16) -> f32 {
        f32::from_bits(registers_to_u32(high, low))
    }
}
