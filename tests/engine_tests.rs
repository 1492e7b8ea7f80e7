//! Engine integration tests over an in-memory scripted transport, plus an
//! end-to-end TCP client/server exchange over a loopback socket.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use modbus_link::backend::crc16;
use modbus_link::{
    BackendKind, ErrorRecovery, ModbusContext, ModbusError, ModbusException, ModbusMapping,
    ModbusResult, ModbusTcpServer, ModbusTcpServerConfig, ModbusTransport,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Append the CRC to an RTU frame body, low byte first
fn rtu_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend_from_slice(&crc16(body).to_le_bytes());
    frame
}

#[derive(Default)]
struct MemoryInner {
    /// Scripted inbound frames; `receive` never crosses a frame boundary,
    /// modelling bytes that arrive in separate bursts
    incoming: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    flushes: usize,
    /// Number of upcoming sends that fail with a connection error
    failing_sends: usize,
    connects: usize,
}

/// Scripted transport. Clones share state so tests can inspect traffic
/// after the context has taken ownership of its copy.
#[derive(Clone, Default)]
struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryTransport {
    fn new() -> Self {
        Self::default()
    }

    fn push_incoming(&self, frame: &[u8]) {
        self.inner.lock().unwrap().incoming.push_back(frame.to_vec());
    }

    fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().sent.clone()
    }

    fn flushes(&self) -> usize {
        self.inner.lock().unwrap().flushes
    }

    fn fail_next_sends(&self, n: usize) {
        self.inner.lock().unwrap().failing_sends = n;
    }

    fn connects(&self) -> usize {
        self.inner.lock().unwrap().connects
    }
}

#[async_trait]
impl ModbusTransport for MemoryTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        self.inner.lock().unwrap().connects += 1;
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        Ok(())
    }

    async fn flush(&mut self) -> ModbusResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.incoming.clear();
        inner.flushes += 1;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> ModbusResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_sends > 0 {
            inner.failing_sends -= 1;
            return Err(ModbusError::connection("peer reset the connection"));
        }
        inner.sent.push(data.to_vec());
        Ok(data.len())
    }

    async fn receive(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut frame) = inner.incoming.pop_front() else {
            return Ok(0);
        };
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        if n < frame.len() {
            let rest = frame.split_off(n);
            inner.incoming.push_front(rest);
        }
        Ok(n)
    }

    async fn wait_readable(&mut self, timeout: Option<Duration>) -> ModbusResult<()> {
        if self.inner.lock().unwrap().incoming.is_empty() {
            let ms = timeout.map(|d| d.as_millis() as u64).unwrap_or(0);
            return Err(ModbusError::timeout("no scripted data left", ms));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

fn rtu_context(transport: &MemoryTransport) -> ModbusContext {
    ModbusContext::with_transport(BackendKind::Rtu, Box::new(transport.clone()))
}

fn tcp_context(transport: &MemoryTransport) -> ModbusContext {
    ModbusContext::with_transport(BackendKind::Tcp, Box::new(transport.clone()))
}

// Client side

#[tokio::test]
async fn oversized_counts_rejected_before_any_io() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);

    assert!(matches!(
        ctx.read_registers(0, 126).await,
        Err(ModbusError::TooManyData { .. })
    ));
    assert!(ctx.read_registers(0, 0).await.is_err());
    assert!(ctx.read_bits(0, 2001).await.is_err());
    assert!(ctx.write_registers(0, &[0u16; 124]).await.is_err());
    assert!(ctx.write_bits(0, &[false; 1969]).await.is_err());
    assert!(ctx
        .write_and_read_registers(0, &[0u16; 122], 0, 1)
        .await
        .is_err());
    assert!(ctx
        .write_and_read_registers(0, &[0u16; 1], 0, 126)
        .await
        .is_err());

    // slice lengths past u16 must not wrap into the valid range
    assert!(ctx.write_bits(0, &vec![false; 65537]).await.is_err());
    assert!(ctx.write_registers(0, &vec![0u16; 65659]).await.is_err());

    // nothing ever reached the transport
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn byte_timeout_mid_frame_reported() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);

    // first three bytes of an 11-byte response, then silence
    transport.push_incoming(&[0x01, 0x03, 0x06]);

    let err = ctx.read_registers(100, 3).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(err.to_string().contains("waiting for frame completion"));

    // with no bytes at all the first wait is the one that expires
    let err = ctx.read_registers(100, 3).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(err.to_string().contains("waiting for confirmation"));
}

#[tokio::test]
async fn rtu_read_holding_registers_roundtrip() {
    init_logging();
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);
    ctx.set_debug(true);

    transport.push_incoming(&rtu_frame(&[
        0x01, 0x03, 0x06, 0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E,
    ]));

    let registers = ctx.read_registers(100, 3).await.unwrap();
    assert_eq!(registers, vec![10, 20, 30]);

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0], rtu_frame(&[0x01, 0x03, 0x00, 0x64, 0x00, 0x03]));
}

#[tokio::test]
async fn rtu_short_exception_frame_is_received_whole() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);

    // 5-byte exception response, shorter than the initial read probe
    transport.push_incoming(&rtu_frame(&[0x01, 0x83, 0x02]));

    let err = ctx.read_registers(500, 1).await.unwrap_err();
    assert_eq!(
        err,
        ModbusError::exception(0x03, ModbusException::IllegalDataAddress)
    );
}

#[tokio::test]
async fn broadcast_reports_success_without_waiting() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);
    ctx.set_slave(0).unwrap();

    // no scripted responses: any confirmation wait would error out
    ctx.write_bit(2, true).await.unwrap();
    assert_eq!(ctx.write_registers(0, &[1, 2, 3]).await.unwrap(), 0);
    assert_eq!(ctx.read_registers(0, 3).await.unwrap(), Vec::<u16>::new());

    // the write frames were still sent
    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0], rtu_frame(&[0x00, 0x05, 0x00, 0x02, 0xFF, 0x00]));
}

#[tokio::test]
async fn corrupted_crc_without_recovery_is_fatal() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);

    let mut response = rtu_frame(&[0x01, 0x03, 0x02, 0x00, 0x0A]);
    *response.last_mut().unwrap() ^= 0xFF;
    transport.push_incoming(&response);

    let err = ctx.read_registers(0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::CrcMismatch { .. }));
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn corrupted_crc_with_protocol_recovery_retransmits_once() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);
    ctx.set_error_recovery(ErrorRecovery::PROTOCOL);

    let mut response = rtu_frame(&[0x01, 0x03, 0x02, 0x00, 0x0A]);
    *response.last_mut().unwrap() ^= 0xFF;
    transport.push_incoming(&response);

    // the retransmitted request gets no answer, so the exchange times out
    let err = ctx.read_registers(0, 1).await.unwrap_err();
    assert!(err.is_timeout());

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
    assert_eq!(transport.flushes(), 1);
}

#[tokio::test]
async fn send_failure_with_link_recovery_reconnects_once() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);
    ctx.set_error_recovery(ErrorRecovery::LINK);

    transport.fail_next_sends(1);
    transport.push_incoming(&rtu_frame(&[0x01, 0x03, 0x02, 0x00, 0x0A]));

    let registers = ctx.read_registers(0, 1).await.unwrap();
    assert_eq!(registers, vec![0x000A]);

    // one reconnect, and only the resent frame reached the wire
    assert_eq!(transport.connects(), 1);
    assert_eq!(transport.sent().len(), 1);
    assert_eq!(transport.sent()[0], rtu_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]));
}

#[tokio::test]
async fn send_failure_after_reconnect_is_fatal() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);
    ctx.set_error_recovery(ErrorRecovery::LINK);

    // both the original send and the post-reconnect resend fail
    transport.fail_next_sends(2);
    let err = ctx.write_register(0, 1).await.unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(transport.connects(), 1);
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn send_failure_without_link_recovery_is_fatal() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);

    transport.fail_next_sends(1);
    let err = ctx.write_register(0, 1).await.unwrap_err();
    assert!(err.is_connection_error());

    // no reconnect was attempted
    assert_eq!(transport.connects(), 0);
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn tcp_transaction_id_mismatch_without_recovery_fails() {
    let transport = MemoryTransport::new();
    let mut ctx = tcp_context(&transport);

    // first request draws transaction id 1; answer with id 0x42
    transport.push_incoming(&[
        0x00, 0x42, 0x00, 0x00, 0x00, 0x05, 0xFF, 0x03, 0x02, 0x00, 0x0A,
    ]);

    let err = ctx.read_registers(0, 1).await.unwrap_err();
    assert!(err.is_confirmation_mismatch());
}

#[tokio::test]
async fn tcp_stale_confirmation_discarded_under_protocol_recovery() {
    let transport = MemoryTransport::new();
    let mut ctx = tcp_context(&transport);
    ctx.set_error_recovery(ErrorRecovery::PROTOCOL);

    // a stale frame with the wrong transaction id, then the real answer
    transport.push_incoming(&[
        0x00, 0x42, 0x00, 0x00, 0x00, 0x05, 0xFF, 0x03, 0x02, 0x00, 0x63,
    ]);
    transport.push_incoming(&[
        0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0xFF, 0x03, 0x02, 0x00, 0x0A,
    ]);

    let registers = ctx.read_registers(0, 1).await.unwrap();
    assert_eq!(registers, vec![0x000A]);
    // no retransmission happened, only the one request
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn tcp_declared_length_mismatch_rejected() {
    let transport = MemoryTransport::new();
    let mut ctx = tcp_context(&transport);

    // MBAP header declares 6 following bytes, but the PDU carries 5
    transport.push_incoming(&[
        0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0xFF, 0x03, 0x02, 0x00, 0x0A,
    ]);

    let err = ctx.read_registers(0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::LengthMismatch { .. }));
}

#[tokio::test]
async fn report_slave_id_decoded() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);

    transport.push_incoming(&rtu_frame(&[0x01, 0x11, 0x04, 0x01, 0xFF, 0x41, 0x42]));

    let id = ctx.report_slave_id().await.unwrap();
    assert_eq!(id, vec![0x01, 0xFF, 0x41, 0x42]);

    // the request is just slave + function + CRC
    assert_eq!(transport.sent()[0], rtu_frame(&[0x01, 0x11]));
}

#[tokio::test]
async fn raw_request_and_confirmation_passthrough() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);

    // deliberately undersized quantity field: the codec would refuse this
    let sent_len = ctx
        .send_raw_request(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x00])
        .await
        .unwrap();
    assert_eq!(sent_len, 8);
    assert_eq!(
        transport.sent()[0],
        rtu_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x00])
    );

    transport.push_incoming(&rtu_frame(&[0x01, 0x83, 0x03]));
    let confirmation = ctx.receive_confirmation().await.unwrap();
    assert_eq!(confirmation, rtu_frame(&[0x01, 0x83, 0x03]));
}

// Server side

fn server_mapping() -> ModbusMapping {
    let mut mapping = ModbusMapping::with_start_addresses(0, 16, 0, 16, 100, 10, 0, 0);
    mapping.write_registers(100, &[10, 20, 30, 0, 0, 0, 0, 0, 0, 0]);
    mapping
}

#[tokio::test]
async fn server_answers_read_holding_registers() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);
    ctx.set_slave(0x11).unwrap();
    let mut mapping = server_mapping();

    transport.push_incoming(&rtu_frame(&[0x11, 0x03, 0x00, 0x64, 0x00, 0x03]));

    let request = ctx.receive_indication().await.unwrap();
    let sent_len = ctx.reply(&request, &mut mapping).await.unwrap();
    assert!(sent_len > 0);

    assert_eq!(
        transport.sent()[0],
        rtu_frame(&[0x11, 0x03, 0x06, 0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E])
    );
}

#[tokio::test]
async fn server_drops_corrupt_frames_silently() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);
    ctx.set_slave(0x11).unwrap();

    let mut corrupt = rtu_frame(&[0x11, 0x03, 0x00, 0x64, 0x00, 0x01]);
    corrupt[3] ^= 0x01;
    transport.push_incoming(&corrupt);
    transport.push_incoming(&rtu_frame(&[0x11, 0x03, 0x00, 0x64, 0x00, 0x01]));

    // the corrupt frame is skipped, the valid one comes back
    let request = ctx.receive_indication().await.unwrap();
    assert_eq!(request.as_slice(), &rtu_frame(&[0x11, 0x03, 0x00, 0x64, 0x00, 0x01])[..]);
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn server_ignores_other_stations() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);
    ctx.set_slave(0x11).unwrap();
    let mut mapping = server_mapping();

    transport.push_incoming(&rtu_frame(&[0x05, 0x03, 0x00, 0x64, 0x00, 0x01]));

    let request = ctx.receive_indication().await.unwrap();
    let sent_len = ctx.reply(&request, &mut mapping).await.unwrap();
    assert_eq!(sent_len, 0);
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn server_rejects_bad_coil_value_and_leaves_state() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);
    ctx.set_slave(0x11).unwrap();
    let mut mapping = server_mapping();

    // only 0x0000 and 0xFF00 are legal single-coil values
    transport.push_incoming(&rtu_frame(&[0x11, 0x05, 0x00, 0x02, 0x12, 0x34]));

    let request = ctx.receive_indication().await.unwrap();
    ctx.reply(&request, &mut mapping).await.unwrap();

    assert_eq!(transport.sent()[0], rtu_frame(&[0x11, 0x85, 0x03]));
    assert_eq!(mapping.bit(2), Some(false));
}

#[tokio::test]
async fn server_rejects_out_of_range_write_untouched() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);
    ctx.set_slave(0x11).unwrap();
    let mut mapping = server_mapping();

    // write 3 registers at 108: spills past the bank end at 110
    transport.push_incoming(&rtu_frame(&[
        0x11, 0x10, 0x00, 0x6C, 0x00, 0x03, 0x06, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03,
    ]));

    let request = ctx.receive_indication().await.unwrap();
    ctx.reply(&request, &mut mapping).await.unwrap();

    assert_eq!(transport.sent()[0], rtu_frame(&[0x11, 0x90, 0x02]));
    assert_eq!(
        mapping.read_registers(100, 10).unwrap(),
        &[10, 20, 30, 0, 0, 0, 0, 0, 0, 0]
    );
}

#[tokio::test]
async fn server_executes_broadcast_but_never_replies() {
    let transport = MemoryTransport::new();
    let mut ctx = rtu_context(&transport);
    ctx.set_slave(0x11).unwrap();
    let mut mapping = server_mapping();

    transport.push_incoming(&rtu_frame(&[0x00, 0x06, 0x00, 0x64, 0x00, 0x63]));

    let request = ctx.receive_indication().await.unwrap();
    let sent_len = ctx.reply(&request, &mut mapping).await.unwrap();

    assert_eq!(sent_len, 0);
    assert!(transport.sent().is_empty());
    assert_eq!(mapping.register(100), Some(0x63));
}

// End to end over loopback TCP

#[tokio::test]
async fn tcp_client_server_exchange() {
    init_logging();

    let config = ModbusTcpServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    let mut server = ModbusTcpServer::with_mapping(config, ModbusMapping::new(32, 32, 32, 32));
    let address = server.start().await.unwrap();

    {
        let mapping = server.mapping();
        let mut mapping = mapping.lock().await;
        mapping.set_input_register(3, 0x5555);
    }

    let mut ctx = ModbusContext::tcp(address);
    ctx.connect().await.unwrap();

    ctx.write_registers(0, &[100, 200, 300]).await.unwrap();
    assert_eq!(ctx.read_registers(0, 3).await.unwrap(), vec![100, 200, 300]);

    ctx.write_bit(5, true).await.unwrap();
    let bits = ctx.read_bits(0, 8).await.unwrap();
    assert!(bits[5]);
    assert!(!bits[0]);

    assert_eq!(ctx.read_input_registers(3, 1).await.unwrap(), vec![0x5555]);

    ctx.mask_write_register(1, 0x00F0, 0x000F).await.unwrap();
    assert_eq!(ctx.read_registers(1, 1).await.unwrap(), vec![(200 & 0x00F0) | 0x000F]);

    let readback = ctx
        .write_and_read_registers(10, &[7, 8], 10, 2)
        .await
        .unwrap();
    assert_eq!(readback, vec![7, 8]);

    // out-of-range read surfaces as a device exception
    let err = ctx.read_registers(100, 5).await.unwrap_err();
    assert_eq!(
        err,
        ModbusError::exception(0x03, ModbusException::IllegalDataAddress)
    );

    let id = ctx.report_slave_id().await.unwrap();
    assert_eq!(id[1], 0xFF); // run indicator on

    ctx.close().await.unwrap();
    server.stop().await;
}
