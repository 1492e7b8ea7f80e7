/// Per-transport backend capability set
///
/// Everything that differs between serial RTU and TCP framing lives behind
/// [`ModbusBackend`]: header and checksum geometry, ADU basis construction,
/// frame finalization (CRC append vs. MBAP length patch), integrity
/// checking and the request/confirmation correlation rule. The transaction
/// engine holds a `Box<dyn ModbusBackend>` chosen at construction and never
/// rebinds it, so the engine itself stays transport-agnostic.
use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};
use crate::frame::Adu;
use crate::{BROADCAST_ADDRESS, MAX_ADU_LENGTH, MAX_RTU_ADU_LENGTH, TCP_SLAVE_UNUSED};

/// CRC-16/MODBUS (polynomial 0x8005 reflected as 0xA001, init 0xFFFF)
pub const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC over an RTU frame body. The low byte travels first on the wire.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Transport family a backend frames for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Rtu,
    Tcp,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Rtu => write!(f, "RTU"),
            BackendKind::Tcp => write!(f, "TCP"),
        }
    }
}

/// Addressing triple a server echoes back in its response: the requesting
/// slave/unit id, the function code byte and the TCP transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionTriple {
    pub slave: u8,
    pub function: u8,
    pub tid: u16,
}

/// Framing capabilities required from each transport family
pub trait ModbusBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Bytes preceding the function code (RTU: 1, TCP: 7)
    fn header_length(&self) -> usize;

    /// Trailing checksum bytes (RTU: 2, TCP: 0)
    fn checksum_length(&self) -> usize;

    /// Largest legal ADU for this framing
    fn max_adu_length(&self) -> usize;

    /// Whether `slave` is an addressable station for this framing
    fn accepts_slave(&self, slave: u8) -> bool;

    /// Slave address a fresh context starts with
    fn default_slave(&self) -> u8;

    /// Start a request ADU: header, function code, address and quantity
    /// (or value) fields. TCP draws a fresh transaction id here.
    fn build_request_basis(
        &mut self,
        slave: u8,
        function: u8,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Adu>;

    /// Start a response ADU echoing the request's addressing triple
    fn build_response_basis(&self, triple: &TransactionTriple) -> ModbusResult<Adu>;

    /// Transaction id to echo in a response, if this framing carries one
    fn prepare_response_tid(&self, request: &[u8]) -> u16;

    /// Finalize an outgoing ADU: append the CRC (RTU) or patch the MBAP
    /// length field (TCP). Must be called exactly once per frame.
    fn send_msg_pre(&self, adu: &mut Adu) -> ModbusResult<()>;

    /// Validate a received frame's integrity; returns the frame length
    fn check_integrity(&self, msg: &[u8]) -> ModbusResult<usize>;

    /// Validate that a confirmation answers the given request (slave
    /// address for RTU, transaction and protocol id for TCP)
    fn pre_check_confirmation(&self, request: &[u8], response: &[u8]) -> ModbusResult<()>;
}

/// Serial line framing: one address byte, trailing CRC-16
#[derive(Debug, Default)]
pub struct RtuBackend;

impl RtuBackend {
    pub fn new() -> Self {
        RtuBackend
    }
}

impl ModbusBackend for RtuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Rtu
    }

    fn header_length(&self) -> usize {
        1
    }

    fn checksum_length(&self) -> usize {
        2
    }

    fn max_adu_length(&self) -> usize {
        MAX_RTU_ADU_LENGTH
    }

    fn accepts_slave(&self, slave: u8) -> bool {
        slave <= 247
    }

    fn default_slave(&self) -> u8 {
        1
    }

    fn build_request_basis(
        &mut self,
        slave: u8,
        function: u8,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Adu> {
        let mut adu = Adu::new();
        adu.push(slave)?;
        adu.push(function)?;
        adu.push_u16_be(address)?;
        adu.push_u16_be(quantity)?;
        Ok(adu)
    }

    fn build_response_basis(&self, triple: &TransactionTriple) -> ModbusResult<Adu> {
        let mut adu = Adu::new();
        adu.push(triple.slave)?;
        adu.push(triple.function)?;
        Ok(adu)
    }

    fn prepare_response_tid(&self, _request: &[u8]) -> u16 {
        0
    }

    fn send_msg_pre(&self, adu: &mut Adu) -> ModbusResult<()> {
        let crc = crc16(adu.as_slice());
        adu.extend_from_slice(&crc.to_le_bytes())
    }

    fn check_integrity(&self, msg: &[u8]) -> ModbusResult<usize> {
        if msg.len() < 4 {
            return Err(ModbusError::frame(format!(
                "RTU frame too short: {} bytes",
                msg.len()
            )));
        }
        if msg.len() > MAX_RTU_ADU_LENGTH {
            return Err(ModbusError::frame(format!(
                "RTU frame too long: {} bytes",
                msg.len()
            )));
        }
        let computed = crc16(&msg[..msg.len() - 2]);
        let received = u16::from_le_bytes([msg[msg.len() - 2], msg[msg.len() - 1]]);
        if computed != received {
            return Err(ModbusError::crc_mismatch(computed, received));
        }
        Ok(msg.len())
    }

    fn pre_check_confirmation(&self, request: &[u8], response: &[u8]) -> ModbusResult<()> {
        let req_slave = request[0];
        let rsp_slave = response[0];
        if rsp_slave != req_slave && req_slave != BROADCAST_ADDRESS {
            return Err(ModbusError::confirmation_mismatch(format!(
                "response from slave {} while slave {} was addressed",
                rsp_slave, req_slave
            )));
        }
        Ok(())
    }
}

/// TCP framing: 7-byte MBAP header, transaction-id correlation, no checksum
#[derive(Debug, Default)]
pub struct TcpBackend {
    transaction_id: u16,
}

impl TcpBackend {
    pub fn new() -> Self {
        TcpBackend { transaction_id: 0 }
    }

    /// Wrapping counter; zero is skipped so a fresh counter never collides
    /// with a zero-initialized peer
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }
}

impl ModbusBackend for TcpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tcp
    }

    fn header_length(&self) -> usize {
        7
    }

    fn checksum_length(&self) -> usize {
        0
    }

    fn max_adu_length(&self) -> usize {
        MAX_ADU_LENGTH
    }

    fn accepts_slave(&self, slave: u8) -> bool {
        slave <= 247 || slave == TCP_SLAVE_UNUSED
    }

    fn default_slave(&self) -> u8 {
        TCP_SLAVE_UNUSED
    }

    fn build_request_basis(
        &mut self,
        slave: u8,
        function: u8,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Adu> {
        let mut adu = Adu::new();
        adu.push_u16_be(self.next_transaction_id())?;
        adu.push_u16_be(0)?; // protocol id
        adu.push_u16_be(0)?; // length, patched by send_msg_pre
        adu.push(slave)?;
        adu.push(function)?;
        adu.push_u16_be(address)?;
        adu.push_u16_be(quantity)?;
        Ok(adu)
    }

    fn build_response_basis(&self, triple: &TransactionTriple) -> ModbusResult<Adu> {
        let mut adu = Adu::new();
        adu.push_u16_be(triple.tid)?;
        adu.push_u16_be(0)?;
        adu.push_u16_be(0)?;
        adu.push(triple.slave)?;
        adu.push(triple.function)?;
        Ok(adu)
    }

    fn prepare_response_tid(&self, request: &[u8]) -> u16 {
        u16::from_be_bytes([request[0], request[1]])
    }

    fn send_msg_pre(&self, adu: &mut Adu) -> ModbusResult<()> {
        if adu.len() < 7 {
            return Err(ModbusError::frame("MBAP header incomplete"));
        }
        adu.set_u16_be(4, (adu.len() - 6) as u16);
        Ok(())
    }

    fn check_integrity(&self, msg: &[u8]) -> ModbusResult<usize> {
        if msg.len() < 8 {
            return Err(ModbusError::frame(format!(
                "TCP frame too short: {} bytes",
                msg.len()
            )));
        }
        let declared = u16::from_be_bytes([msg[4], msg[5]]) as usize + 6;
        if declared != msg.len() {
            return Err(ModbusError::length_mismatch(declared, msg.len()));
        }
        Ok(msg.len())
    }

    fn pre_check_confirmation(&self, request: &[u8], response: &[u8]) -> ModbusResult<()> {
        let req_tid = u16::from_be_bytes([request[0], request[1]]);
        let rsp_tid = u16::from_be_bytes([response[0], response[1]]);
        if req_tid != rsp_tid {
            return Err(ModbusError::confirmation_mismatch(format!(
                "transaction id {} received, {} expected",
                rsp_tid, req_tid
            )));
        }
        let rsp_pid = u16::from_be_bytes([response[2], response[3]]);
        if rsp_pid != 0 {
            return Err(ModbusError::confirmation_mismatch(format!(
                "protocol id {} received, 0 expected",
                rsp_pid
            )));
        }
        Ok(())
    }
}
