/// Server-side dispatcher and TCP server harness
///
/// The dispatcher reuses the client's receive loop: [`ModbusContext`] gains
/// `receive_indication` (corrupt frames are dropped silently, since on a
/// shared serial bus they are usually someone else's traffic) and `reply`,
/// which filters by address, executes the request against a
/// [`ModbusMapping`], and answers with a normal or exception response.
/// Broadcast requests are executed but never answered, exceptions included.
///
/// [`ModbusTcpServer`] is a Tokio accept loop that gives every client
/// connection its own dispatcher context over one shared mapping.
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::backend::{BackendKind, TransactionTriple};
use crate::client::ModbusContext;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{Adu, FrameKind};
use crate::mapping::ModbusMapping;
use crate::protocol::{data_utils, ModbusException, ModbusFunction, SlaveId};
use crate::transport::TcpTransport;
use crate::{BROADCAST_ADDRESS, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS,
    MAX_WRITE_REGISTERS, MAX_WR_READ_REGISTERS, MAX_WR_WRITE_REGISTERS, TCP_SLAVE_UNUSED};

impl ModbusContext {
    /// Wait for one well-formed indication. Frames failing the integrity
    /// check are dropped without a reply and the wait continues.
    pub async fn receive_indication(&mut self) -> ModbusResult<Adu> {
        loop {
            let adu = self.receive_frame(FrameKind::Indication).await?;
            match self.backend.check_integrity(adu.as_slice()) {
                Ok(_) => return Ok(adu),
                Err(error) => {
                    debug!("dropping corrupt indication: {}", error);
                }
            }
        }
    }

    /// Execute `request` against `mapping` and send the response. Returns
    /// the number of bytes sent: zero when the frame was not addressed to
    /// this context or when the reply is suppressed (broadcast).
    pub async fn reply(
        &mut self,
        request: &[u8],
        mapping: &mut ModbusMapping,
    ) -> ModbusResult<usize> {
        let header = self.backend.header_length();
        let checksum = self.backend.checksum_length();
        if request.len() < header + 1 + checksum {
            return Err(ModbusError::frame(format!(
                "indication of {} bytes is too short to dispatch",
                request.len()
            )));
        }

        let dest = request[header - 1];
        let addressed = dest == self.slave()
            || dest == BROADCAST_ADDRESS
            || (self.backend_kind() == BackendKind::Tcp && self.slave() == TCP_SLAVE_UNUSED);
        if !addressed {
            debug!("ignoring indication for slave {}", dest);
            return Ok(0);
        }

        let broadcast = dest == BROADCAST_ADDRESS;
        let function = request[header];
        let pdu = &request[header..request.len() - checksum];

        let (function_byte, payload) = match execute_request(pdu, dest, mapping) {
            Ok(payload) => (function, payload),
            Err(exception) => {
                debug!(
                    "function 0x{:02X} rejected: {}",
                    function,
                    exception.description()
                );
                (function | 0x80, vec![exception.to_u8()])
            }
        };

        if broadcast {
            debug!("broadcast indication executed, reply suppressed");
            return Ok(0);
        }

        self.send_reply(request, dest, function_byte, &payload).await
    }

    /// Answer `request` with an exception response. For applications that
    /// veto a request the mapping itself would have accepted.
    pub async fn reply_exception(
        &mut self,
        request: &[u8],
        exception: ModbusException,
    ) -> ModbusResult<usize> {
        let header = self.backend.header_length();
        if request.len() < header + 1 {
            return Err(ModbusError::frame("indication too short for an exception reply"));
        }
        let dest = request[header - 1];
        if dest == BROADCAST_ADDRESS {
            return Ok(0);
        }
        let function = request[header] | 0x80;
        self.send_reply(request, dest, function, &[exception.to_u8()])
            .await
    }

    async fn send_reply(
        &mut self,
        request: &[u8],
        dest: SlaveId,
        function_byte: u8,
        payload: &[u8],
    ) -> ModbusResult<usize> {
        let triple = TransactionTriple {
            slave: dest,
            function: function_byte,
            tid: self.backend.prepare_response_tid(request),
        };
        let mut response = self.backend.build_response_basis(&triple)?;
        response.extend_from_slice(payload)?;
        self.backend.send_msg_pre(&mut response)?;
        self.send_bytes_recovering(response.as_slice()).await?;
        Ok(response.len())
    }
}

/// Execute one PDU against the mapping. Returns the response payload
/// (bytes after the function code) or the exception to answer with.
/// State changes are all or nothing: any rejection leaves the mapping
/// untouched.
fn execute_request(
    pdu: &[u8],
    unit: SlaveId,
    mapping: &mut ModbusMapping,
) -> Result<Vec<u8>, ModbusException> {
    use ModbusException::{IllegalDataAddress, IllegalDataValue, IllegalFunction};

    let function = ModbusFunction::from_u8(pdu[0]).ok_or(IllegalFunction)?;
    let word = |at: usize| -> Result<u16, ModbusException> {
        if at + 2 > pdu.len() {
            return Err(IllegalDataValue);
        }
        Ok(u16::from_be_bytes([pdu[at], pdu[at + 1]]))
    };

    match function {
        ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
            let address = word(1)?;
            let nb = word(3)?;
            if nb == 0 || nb > MAX_READ_BITS {
                return Err(IllegalDataValue);
            }
            let bits = match function {
                ModbusFunction::ReadCoils => mapping.read_bits(address, nb),
                _ => mapping.read_input_bits(address, nb),
            }
            .ok_or(IllegalDataAddress)?;
            let packed = data_utils::pack_bits(bits);
            let mut payload = Vec::with_capacity(1 + packed.len());
            payload.push(packed.len() as u8);
            payload.extend_from_slice(&packed);
            Ok(payload)
        }

        ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
            let address = word(1)?;
            let nb = word(3)?;
            if nb == 0 || nb > MAX_READ_REGISTERS {
                return Err(IllegalDataValue);
            }
            let registers = match function {
                ModbusFunction::ReadHoldingRegisters => mapping.read_registers(address, nb),
                _ => mapping.read_input_registers(address, nb),
            }
            .ok_or(IllegalDataAddress)?;
            let mut payload = Vec::with_capacity(1 + registers.len() * 2);
            payload.push((registers.len() * 2) as u8);
            payload.extend_from_slice(&data_utils::registers_to_bytes(registers));
            Ok(payload)
        }

        ModbusFunction::WriteSingleCoil => {
            let address = word(1)?;
            let status = match word(3)? {
                0xFF00 => true,
                0x0000 => false,
                _ => return Err(IllegalDataValue),
            };
            if !mapping.write_bit(address, status) {
                return Err(IllegalDataAddress);
            }
            Ok(pdu[1..5].to_vec())
        }

        ModbusFunction::WriteSingleRegister => {
            let address = word(1)?;
            let value = word(3)?;
            if !mapping.write_register(address, value) {
                return Err(IllegalDataAddress);
            }
            Ok(pdu[1..5].to_vec())
        }

        ModbusFunction::WriteMultipleCoils => {
            let address = word(1)?;
            let nb = word(3)?;
            if nb == 0 || nb > MAX_WRITE_BITS {
                return Err(IllegalDataValue);
            }
            let byte_count = (nb as usize + 7) / 8;
            if pdu.len() != 6 + byte_count || pdu[5] as usize != byte_count {
                return Err(IllegalDataValue);
            }
            let values = data_utils::unpack_bits(&pdu[6..], nb as usize);
            if !mapping.write_bits(address, &values) {
                return Err(IllegalDataAddress);
            }
            Ok(pdu[1..5].to_vec())
        }

        ModbusFunction::WriteMultipleRegisters => {
            let address = word(1)?;
            let nb = word(3)?;
            if nb == 0 || nb > MAX_WRITE_REGISTERS {
                return Err(IllegalDataValue);
            }
            let byte_count = nb as usize * 2;
            if pdu.len() != 6 + byte_count || pdu[5] as usize != byte_count {
                return Err(IllegalDataValue);
            }
            let values = data_utils::bytes_to_registers(&pdu[6..]).ok_or(IllegalDataValue)?;
            if !mapping.write_registers(address, &values) {
                return Err(IllegalDataAddress);
            }
            Ok(pdu[1..5].to_vec())
        }

        ModbusFunction::MaskWriteRegister => {
            let address = word(1)?;
            let and_mask = word(3)?;
            let or_mask = word(5)?;
            if !mapping.mask_write_register(address, and_mask, or_mask) {
                return Err(IllegalDataAddress);
            }
            Ok(pdu[1..7].to_vec())
        }

        ModbusFunction::WriteAndReadRegisters => {
            let read_address = word(1)?;
            let read_nb = word(3)?;
            let write_address = word(5)?;
            let write_nb = word(7)?;
            if read_nb == 0
                || read_nb > MAX_WR_READ_REGISTERS
                || write_nb == 0
                || write_nb > MAX_WR_WRITE_REGISTERS
            {
                return Err(IllegalDataValue);
            }
            let byte_count = write_nb as usize * 2;
            if pdu.len() != 10 + byte_count || pdu[9] as usize != byte_count {
                return Err(IllegalDataValue);
            }
            // both ranges are checked before the write lands
            if mapping.read_registers(read_address, read_nb).is_none() {
                return Err(IllegalDataAddress);
            }
            let values = data_utils::bytes_to_registers(&pdu[10..]).ok_or(IllegalDataValue)?;
            if !mapping.write_registers(write_address, &values) {
                return Err(IllegalDataAddress);
            }
            let registers = mapping
                .read_registers(read_address, read_nb)
                .ok_or(IllegalDataAddress)?;
            let mut payload = Vec::with_capacity(1 + registers.len() * 2);
            payload.push((registers.len() * 2) as u8);
            payload.extend_from_slice(&data_utils::registers_to_bytes(registers));
            Ok(payload)
        }

        ModbusFunction::ReportSlaveId => {
            let version = crate::VERSION.as_bytes();
            let mut payload = Vec::with_capacity(3 + version.len());
            payload.push((2 + version.len()) as u8);
            payload.push(unit);
            payload.push(0xFF); // run indicator: ON
            payload.extend_from_slice(version);
            Ok(payload)
        }
    }
}

/// TCP server configuration
#[derive(Debug, Clone)]
pub struct ModbusTcpServerConfig {
    pub bind_address: SocketAddr,
    /// Unit id this server answers as; the default accepts any unit id
    pub unit_id: SlaveId,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        ModbusTcpServerConfig {
            bind_address: ([0, 0, 0, 0], crate::DEFAULT_TCP_PORT).into(),
            unit_id: TCP_SLAVE_UNUSED,
        }
    }
}

/// Concurrent TCP server: one dispatcher context per connection, one
/// shared mapping
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    mapping: Arc<Mutex<ModbusMapping>>,
    shutdown: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    local_address: Option<SocketAddr>,
}

impl ModbusTcpServer {
    pub fn with_mapping(config: ModbusTcpServerConfig, mapping: ModbusMapping) -> Self {
        ModbusTcpServer {
            config,
            mapping: Arc::new(Mutex::new(mapping)),
            shutdown: None,
            accept_task: None,
            local_address: None,
        }
    }

    /// Shared handle to the register mapping, for application updates
    /// while the server runs
    pub fn mapping(&self) -> Arc<Mutex<ModbusMapping>> {
        Arc::clone(&self.mapping)
    }

    /// Address the listener is bound to; useful with an ephemeral port
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }

    /// Bind and start accepting connections
    pub async fn start(&mut self) -> ModbusResult<SocketAddr> {
        let listener = TcpListener::bind(self.config.bind_address)
            .await
            .map_err(|e| {
                ModbusError::connection(format!(
                    "bind to {} failed: {}",
                    self.config.bind_address, e
                ))
            })?;
        let local_address = listener.local_addr().map_err(ModbusError::from)?;
        self.local_address = Some(local_address);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown = Some(shutdown_tx.clone());

        let mapping = Arc::clone(&self.mapping);
        let unit_id = self.config.unit_id;

        info!("🚀 Modbus TCP server listening on {}", local_address);
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Modbus TCP server shutting down");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            info!("🔌 client connected: {}", peer);
                            let transport = TcpTransport::from_stream(stream);
                            let mut ctx = ModbusContext::with_transport(
                                BackendKind::Tcp,
                                Box::new(transport),
                            );
                            if let Err(error) = ctx.set_slave(unit_id) {
                                error!("invalid unit id {}: {}", unit_id, error);
                                break;
                            }
                            tokio::spawn(serve_connection(
                                ctx,
                                Arc::clone(&mapping),
                                shutdown_tx.subscribe(),
                            ));
                        }
                        Err(error) => {
                            error!("accept failed: {}", error);
                            break;
                        }
                    }
                }
            }
        }));

        Ok(local_address)
    }

    /// Block until the accept loop exits
    pub async fn wait(&mut self) {
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }

    /// Signal shutdown and wait for the accept loop to finish
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.wait().await;
    }

    pub fn is_running(&self) -> bool {
        self.accept_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

async fn serve_connection(
    mut ctx: ModbusContext,
    mapping: Arc<Mutex<ModbusMapping>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            received = ctx.receive_indication() => match received {
                Ok(request) => {
                    let mut mapping = mapping.lock().await;
                    if let Err(error) = ctx.reply(request.as_slice(), &mut mapping).await {
                        warn!("reply failed: {}", error);
                        break;
                    }
                }
                Err(error) if error.is_connection_error() => {
                    debug!("client disconnected: {}", error);
                    break;
                }
                Err(error) => {
                    warn!("dropping connection: {}", error);
                    break;
                }
            }
        }
    }
    let _ = ctx.close().await;
}
