/// Client-side transaction engine
///
/// [`ModbusContext`] owns one transport and one backend, selected at
/// construction, and drives one exchange at a time through the cycle
/// build → send → await confirmation → validate → decode. The application
/// layer is shared between RTU and TCP; only the framing differs, and
/// that lives in the backend.
///
/// The receive loop grows the frame in three steps: it reads until the
/// function code is known, then until the fixed meta bytes after it have
/// arrived, then until the variable data (plus checksum) is complete. The
/// first wait is bounded by the response timeout (or the indication
/// timeout on the server path), later waits by the byte timeout. Reads ask
/// the transport for at least [`crate::MIN_PROBE_LENGTH`] bytes so most
/// frames complete in one read; since transports return only what is
/// available, shorter frames are unaffected, but on a multi-drop serial
/// bus an oversized ask may swallow the start of an unrelated frame.
///
/// Recovery, when enabled, is bounded per exchange: one reconnect-resend
/// after a connection failure, one flush-retransmit after an integrity
/// failure, one discard-and-rewait after a mismatched confirmation.
/// Device exceptions are never retried.
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendKind, ModbusBackend, RtuBackend, TcpBackend};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{self, Adu, FrameKind};
use crate::logging::log_frame;
use crate::protocol::{data_utils, ModbusException, ModbusFunction, SlaveId};
use crate::recovery::{ErrorRecovery, RetryPolicy};
use crate::transport::{ModbusTransport, SerialConfig, SerialTransport, TcpTransport};
use crate::{
    BROADCAST_ADDRESS, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS,
    MAX_WR_READ_REGISTERS, MAX_WR_WRITE_REGISTERS, MIN_PROBE_LENGTH,
};

/// The three waits of the engine. A zero byte or indication timeout means
/// "wait forever"; the response timeout should stay finite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusTimeouts {
    /// First-byte wait for a confirmation
    pub response: Duration,
    /// Wait between bytes inside a frame
    pub byte: Duration,
    /// First-byte wait for an indication (server side)
    pub indication: Duration,
}

impl Default for ModbusTimeouts {
    fn default() -> Self {
        ModbusTimeouts {
            response: Duration::from_millis(500),
            byte: Duration::from_millis(500),
            indication: Duration::ZERO,
        }
    }
}

fn wait_of(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

/// One Modbus station: transport + backend + addressing + policy.
/// Not `Sync`; a context runs one exchange at a time.
pub struct ModbusContext {
    pub(crate) backend: Box<dyn ModbusBackend>,
    pub(crate) transport: Box<dyn ModbusTransport>,
    slave: SlaveId,
    timeouts: ModbusTimeouts,
    policy: RetryPolicy,
    debug: bool,
}

impl ModbusContext {
    /// TCP context dialing `address`; the unit id defaults to the reserved
    /// 0xFF since most TCP servers ignore it
    pub fn tcp(address: SocketAddr) -> Self {
        Self::with_transport(BackendKind::Tcp, Box::new(TcpTransport::new(address)))
    }

    /// RTU context over the configured serial line
    pub fn rtu(config: SerialConfig) -> Self {
        Self::with_transport(BackendKind::Rtu, Box::new(SerialTransport::new(config)))
    }

    /// Context over a caller-supplied transport: accepted server sockets,
    /// in-memory transports in tests, tunnelled links
    pub fn with_transport(kind: BackendKind, transport: Box<dyn ModbusTransport>) -> Self {
        let backend: Box<dyn ModbusBackend> = match kind {
            BackendKind::Rtu => Box::new(RtuBackend::new()),
            BackendKind::Tcp => Box::new(TcpBackend::new()),
        };
        let slave = backend.default_slave();
        ModbusContext {
            backend,
            transport,
            slave,
            timeouts: ModbusTimeouts::default(),
            policy: RetryPolicy::default(),
            debug: false,
        }
    }

    // Configuration

    /// Address the context talks to (client) or answers as (server).
    /// RTU accepts 0-247, TCP additionally accepts 0xFF.
    pub fn set_slave(&mut self, slave: SlaveId) -> ModbusResult<()> {
        if !self.backend.accepts_slave(slave) {
            return Err(ModbusError::invalid_argument(format!(
                "slave address {} not valid for {}",
                slave,
                self.backend.kind()
            )));
        }
        self.slave = slave;
        Ok(())
    }

    pub fn slave(&self) -> SlaveId {
        self.slave
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn set_error_recovery(&mut self, recovery: ErrorRecovery) {
        self.policy.set_recovery(recovery);
    }

    pub fn error_recovery(&self) -> ErrorRecovery {
        self.policy.recovery()
    }

    pub fn set_timeouts(&mut self, timeouts: ModbusTimeouts) {
        self.timeouts = timeouts;
    }

    pub fn timeouts(&self) -> ModbusTimeouts {
        self.timeouts
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.timeouts.response = timeout;
    }

    pub fn set_byte_timeout(&mut self, timeout: Duration) {
        self.timeouts.byte = timeout;
    }

    pub fn set_indication_timeout(&mut self, timeout: Duration) {
        self.timeouts.indication = timeout;
    }

    /// Hex-dump every frame sent and received
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    // Connection lifecycle

    pub async fn connect(&mut self) -> ModbusResult<()> {
        self.transport.connect().await
    }

    pub async fn close(&mut self) -> ModbusResult<()> {
        self.transport.close().await
    }

    pub async fn flush(&mut self) -> ModbusResult<()> {
        self.transport.flush().await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    // Read operations

    /// Read coils (0x01)
    pub async fn read_bits(&mut self, address: u16, nb: u16) -> ModbusResult<Vec<bool>> {
        check_count(nb as usize, MAX_READ_BITS, "bits to read")?;
        self.read_bit_function(ModbusFunction::ReadCoils, address, nb)
            .await
    }

    /// Read discrete inputs (0x02)
    pub async fn read_input_bits(&mut self, address: u16, nb: u16) -> ModbusResult<Vec<bool>> {
        check_count(nb as usize, MAX_READ_BITS, "input bits to read")?;
        self.read_bit_function(ModbusFunction::ReadDiscreteInputs, address, nb)
            .await
    }

    /// Read holding registers (0x03)
    pub async fn read_registers(&mut self, address: u16, nb: u16) -> ModbusResult<Vec<u16>> {
        check_count(nb as usize, MAX_READ_REGISTERS, "registers to read")?;
        self.read_register_function(ModbusFunction::ReadHoldingRegisters, address, nb)
            .await
    }

    /// Read input registers (0x04)
    pub async fn read_input_registers(&mut self, address: u16, nb: u16) -> ModbusResult<Vec<u16>> {
        check_count(nb as usize, MAX_READ_REGISTERS, "input registers to read")?;
        self.read_register_function(ModbusFunction::ReadInputRegisters, address, nb)
            .await
    }

    // Write operations

    /// Write a single coil (0x05). On the wire ON is 0xFF00, OFF is 0x0000.
    pub async fn write_bit(&mut self, address: u16, status: bool) -> ModbusResult<()> {
        let value = if status { 0xFF00 } else { 0x0000 };
        let request =
            self.backend
                .build_request_basis(self.slave, ModbusFunction::WriteSingleCoil.to_u8(), address, value)?;
        self.transact(request).await.map(|_| ())
    }

    /// Write a single holding register (0x06)
    pub async fn write_register(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        let request = self.backend.build_request_basis(
            self.slave,
            ModbusFunction::WriteSingleRegister.to_u8(),
            address,
            value,
        )?;
        self.transact(request).await.map(|_| ())
    }

    /// Write multiple coils (0x0F); returns the confirmed quantity,
    /// zero for broadcast
    pub async fn write_bits(&mut self, address: u16, values: &[bool]) -> ModbusResult<usize> {
        check_count(values.len(), MAX_WRITE_BITS, "bits to write")?;
        let nb = values.len() as u16;
        let mut request = self.backend.build_request_basis(
            self.slave,
            ModbusFunction::WriteMultipleCoils.to_u8(),
            address,
            nb,
        )?;
        let packed = data_utils::pack_bits(values);
        request.push(packed.len() as u8)?;
        request.extend_from_slice(&packed)?;
        match self.transact(request).await? {
            Some(_) => Ok(nb as usize),
            None => Ok(0),
        }
    }

    /// Write multiple holding registers (0x10); returns the confirmed
    /// quantity, zero for broadcast
    pub async fn write_registers(&mut self, address: u16, values: &[u16]) -> ModbusResult<usize> {
        check_count(values.len(), MAX_WRITE_REGISTERS, "registers to write")?;
        let nb = values.len() as u16;
        let mut request = self.backend.build_request_basis(
            self.slave,
            ModbusFunction::WriteMultipleRegisters.to_u8(),
            address,
            nb,
        )?;
        request.push((nb * 2) as u8)?;
        request.extend_from_slice(&data_utils::registers_to_bytes(values))?;
        match self.transact(request).await? {
            Some(_) => Ok(nb as usize),
            None => Ok(0),
        }
    }

    /// Mask-write a holding register (0x16):
    /// `value = (current AND and_mask) OR (or_mask AND NOT and_mask)`
    pub async fn mask_write_register(
        &mut self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<()> {
        let mut request = self.backend.build_request_basis(
            self.slave,
            ModbusFunction::MaskWriteRegister.to_u8(),
            address,
            and_mask,
        )?;
        request.push_u16_be(or_mask)?;
        self.transact(request).await.map(|_| ())
    }

    /// Write then read holding registers in one transaction (0x17)
    pub async fn write_and_read_registers(
        &mut self,
        write_address: u16,
        values: &[u16],
        read_address: u16,
        read_nb: u16,
    ) -> ModbusResult<Vec<u16>> {
        check_count(values.len(), MAX_WR_WRITE_REGISTERS, "registers to write")?;
        check_count(read_nb as usize, MAX_WR_READ_REGISTERS, "registers to read")?;
        let write_nb = values.len() as u16;
        let mut request = self.backend.build_request_basis(
            self.slave,
            ModbusFunction::WriteAndReadRegisters.to_u8(),
            read_address,
            read_nb,
        )?;
        request.push_u16_be(write_address)?;
        request.push_u16_be(write_nb)?;
        request.push((write_nb * 2) as u8)?;
        request.extend_from_slice(&data_utils::registers_to_bytes(values))?;
        match self.transact(request).await? {
            Some(response) => self.decode_register_response(&response, read_nb),
            None => Ok(Vec::new()),
        }
    }

    /// Report slave id (0x11); returns the raw identification bytes
    /// (slave id, run indicator, additional data)
    pub async fn report_slave_id(&mut self) -> ModbusResult<Vec<u8>> {
        let mut request = self.backend.build_request_basis(
            self.slave,
            ModbusFunction::ReportSlaveId.to_u8(),
            0,
            0,
        )?;
        // the request carries no address or quantity fields
        request.truncate(request.len() - 4);
        match self.transact(request).await? {
            Some(response) => {
                let payload = self.confirmation_payload(&response);
                if payload.is_empty() || payload.len() != 1 + payload[0] as usize {
                    return Err(ModbusError::frame(format!(
                        "report-slave-id payload declares {} bytes, got {}",
                        payload.first().copied().unwrap_or(0),
                        payload.len().saturating_sub(1)
                    )));
                }
                Ok(payload[1..].to_vec())
            }
            None => Ok(Vec::new()),
        }
    }

    // Raw access

    /// Finalize and send a caller-built ADU (header + PDU, no checksum),
    /// bypassing request validation. Pairs with [`receive_confirmation`]
    /// for protocol testing.
    ///
    /// [`receive_confirmation`]: ModbusContext::receive_confirmation
    pub async fn send_raw_request(&mut self, raw: &[u8]) -> ModbusResult<usize> {
        let mut adu = Adu::from_slice(raw)?;
        self.backend.send_msg_pre(&mut adu)?;
        self.send_bytes_recovering(adu.as_slice()).await?;
        Ok(adu.len())
    }

    /// Receive one confirmation frame and verify its integrity, without
    /// correlating or decoding it
    pub async fn receive_confirmation(&mut self) -> ModbusResult<Vec<u8>> {
        let response = self.receive_frame(FrameKind::Confirmation).await?;
        self.backend.check_integrity(response.as_slice())?;
        Ok(response.as_slice().to_vec())
    }

    // Engine internals

    async fn read_bit_function(
        &mut self,
        function: ModbusFunction,
        address: u16,
        nb: u16,
    ) -> ModbusResult<Vec<bool>> {
        let request = self
            .backend
            .build_request_basis(self.slave, function.to_u8(), address, nb)?;
        match self.transact(request).await? {
            Some(response) => frame::decode_bit_payload(self.confirmation_payload(&response), nb),
            None => Ok(Vec::new()),
        }
    }

    async fn read_register_function(
        &mut self,
        function: ModbusFunction,
        address: u16,
        nb: u16,
    ) -> ModbusResult<Vec<u16>> {
        let request = self
            .backend
            .build_request_basis(self.slave, function.to_u8(), address, nb)?;
        match self.transact(request).await? {
            Some(response) => self.decode_register_response(&response, nb),
            None => Ok(Vec::new()),
        }
    }

    fn decode_register_response(&self, response: &Adu, nb: u16) -> ModbusResult<Vec<u16>> {
        frame::decode_register_payload(self.confirmation_payload(response), nb)
    }

    /// PDU bytes after the function code, checksum stripped
    fn confirmation_payload<'a>(&self, response: &'a Adu) -> &'a [u8] {
        let header = self.backend.header_length();
        let checksum = self.backend.checksum_length();
        &response[header + 1..response.len() - checksum]
    }

    /// Run one full exchange. `Ok(None)` is the broadcast case: the frame
    /// was sent and no confirmation will ever come.
    async fn transact(&mut self, mut request: Adu) -> ModbusResult<Option<Adu>> {
        self.backend.send_msg_pre(&mut request)?;
        self.send_bytes_recovering(request.as_slice()).await?;

        if self.slave == BROADCAST_ADDRESS {
            debug!("broadcast request, skipping confirmation wait");
            return Ok(None);
        }

        let mut retransmitted = false;
        let mut reread = false;
        loop {
            match self.receive_checked(&request).await {
                Ok(response) => return Ok(Some(response)),
                Err(error) if self.policy.should_retransmit(&error) && !retransmitted => {
                    warn!("integrity failure, retransmitting once: {}", error);
                    retransmitted = true;
                    self.transport.flush().await?;
                    self.send_bytes_recovering(request.as_slice()).await?;
                }
                Err(error) if self.policy.should_reread(&error) && !reread => {
                    warn!("discarding mismatched confirmation: {}", error);
                    reread = true;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn receive_checked(&mut self, request: &Adu) -> ModbusResult<Adu> {
        let response = self.receive_frame(FrameKind::Confirmation).await?;
        self.backend.check_integrity(response.as_slice())?;
        self.backend
            .pre_check_confirmation(request.as_slice(), response.as_slice())?;
        self.check_confirmation(request.as_slice(), response.as_slice())?;
        Ok(response)
    }

    /// Send finalized bytes, reconnecting once if LINK recovery applies
    pub(crate) async fn send_bytes_recovering(&mut self, data: &[u8]) -> ModbusResult<()> {
        if self.debug {
            log_frame(self.backend.kind(), "send", data);
        }
        match self.transport.send(data).await {
            Ok(_) => Ok(()),
            Err(error) if self.policy.should_reconnect(&error) => {
                warn!("send failed ({}), reconnecting", error);
                self.transport.close().await?;
                self.transport.connect().await?;
                self.transport.send(data).await.map(|_| ())
            }
            Err(error) => Err(error),
        }
    }

    /// Length-aware receive loop shared by client and server paths
    pub(crate) async fn receive_frame(&mut self, kind: FrameKind) -> ModbusResult<Adu> {
        let header = self.backend.header_length();
        let checksum = self.backend.checksum_length();

        let first_wait = match kind {
            FrameKind::Confirmation => self.timeouts.response,
            FrameKind::Indication => self.timeouts.indication,
        };
        let mut wait = wait_of(first_wait);

        let mut adu = Adu::new();
        let mut meta: Option<usize> = None;
        let mut total: Option<usize> = None;

        loop {
            if meta.is_none() && adu.len() > header {
                meta = Some(frame::meta_length_after_function(adu[header], kind));
            }
            if let (Some(m), None) = (meta, total) {
                if adu.len() >= header + 1 + m {
                    let data = frame::data_length_after_meta(adu.as_slice(), header, kind);
                    let t = header + 1 + m + data + checksum;
                    if t > self.backend.max_adu_length() {
                        return Err(ModbusError::frame(format!(
                            "frame of {} bytes exceeds the {} byte {} limit",
                            t,
                            self.backend.max_adu_length(),
                            self.backend.kind()
                        )));
                    }
                    total = Some(t);
                }
            }

            // target the next known boundary, never below the probe size
            let target = match (total, meta) {
                (Some(t), _) => t,
                (None, Some(m)) => (header + 1 + m).max(MIN_PROBE_LENGTH),
                (None, None) => (header + 1).max(MIN_PROBE_LENGTH),
            };
            if adu.len() >= target {
                break;
            }

            if let Err(error) = self.transport.wait_readable(wait).await {
                if error.is_timeout() {
                    let (phase, timeout) = if adu.is_empty() {
                        match kind {
                            FrameKind::Confirmation => ("waiting for confirmation", first_wait),
                            FrameKind::Indication => ("waiting for indication", first_wait),
                        }
                    } else {
                        ("waiting for frame completion", self.timeouts.byte)
                    };
                    return Err(ModbusError::timeout(phase, timeout.as_millis() as u64));
                }
                return Err(error);
            }

            let needed = target - adu.len();
            let spare = adu.spare_mut(needed);
            let n = self.transport.receive(spare).await?;
            if n == 0 {
                return Err(ModbusError::connection("connection closed by peer"));
            }
            adu.advance(n);

            // subsequent waits are paced by the byte timeout
            wait = wait_of(self.timeouts.byte);
        }

        if self.debug {
            log_frame(self.backend.kind(), "recv", adu.as_slice());
        }
        Ok(adu)
    }

    /// Application-layer checks: function echo, exception decoding and the
    /// expected confirmation length for the issued request
    fn check_confirmation(&self, request: &[u8], response: &[u8]) -> ModbusResult<()> {
        let header = self.backend.header_length();
        let req_function = request[header];
        let rsp_function = response[header];

        if rsp_function == req_function | 0x80 {
            let code = response[header + 1];
            return Err(match ModbusException::from_u8(code) {
                Some(exception) => ModbusError::exception(req_function, exception),
                None => ModbusError::invalid_exception(code),
            });
        }
        if rsp_function != req_function {
            return Err(ModbusError::confirmation_mismatch(format!(
                "function 0x{:02X} received, 0x{:02X} expected",
                rsp_function, req_function
            )));
        }

        if let Some(expected) = self.expected_confirmation_length(request) {
            if response.len() != expected {
                return Err(ModbusError::frame(format!(
                    "confirmation of {} bytes, {} expected for function 0x{:02X}",
                    response.len(),
                    expected,
                    req_function
                )));
            }
        }
        Ok(())
    }

    /// `None` when the length is not predictable from the request
    /// (report-slave-id)
    fn expected_confirmation_length(&self, request: &[u8]) -> Option<usize> {
        let header = self.backend.header_length();
        let nb = || u16::from_be_bytes([request[header + 3], request[header + 4]]) as usize;
        let pdu = match request[header] {
            0x01 | 0x02 => 2 + (nb() + 7) / 8,
            0x03 | 0x04 => 2 + 2 * nb(),
            // echo of address + value/quantity
            0x05 | 0x06 | 0x0F | 0x10 => 5,
            // echo of address + both masks
            0x16 => 7,
            // byte count + the read part of the request
            0x17 => 2 + 2 * nb(),
            _ => return None,
        };
        Some(header + pdu + self.backend.checksum_length())
    }
}

fn check_count(nb: usize, max: u16, what: &str) -> ModbusResult<()> {
    if nb == 0 || nb > max as usize {
        return Err(ModbusError::too_many_data(format!(
            "{} must be 1-{}, got {}",
            what, max, nb
        )));
    }
    Ok(())
}
