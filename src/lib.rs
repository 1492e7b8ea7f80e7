//! # Modbus Link - Modbus RTU/TCP Protocol Engine
//!
//! A Modbus application-layer engine for industrial automation and SCADA
//! tooling, implemented in pure Rust on top of Tokio. One transaction state
//! machine drives both supported transports (serial RTU and TCP); the
//! per-transport differences are isolated behind a small backend trait.
//!
//! ## Features
//!
//! - Client (master) request/confirmation cycle with response, byte and
//!   indication timeouts and configurable link/protocol error recovery
//! - Server (slave) indication dispatcher over an in-memory register mapping
//! - RTU framing with CRC-16 integrity checking, TCP framing with MBAP
//!   header and transaction-id correlation
//! - Broadcast semantics (slave address 0): execute without reply
//! - Raw-request escape hatch for exercising malformed-frame handling
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x11 | Report Slave ID | ✅ | ✅ |
//! | 0x16 | Mask Write Register | ✅ | ✅ |
//! | 0x17 | Write And Read Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ### Client
//!
//! ```rust,no_run
//! use modbus_link::{ModbusContext, ModbusResult};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut ctx = ModbusContext::tcp("127.0.0.1:502".parse().unwrap());
//!     ctx.set_slave(1)?;
//!     ctx.connect().await?;
//!
//!     let registers = ctx.read_registers(100, 3).await?;
//!     println!("Registers: {:?}", registers);
//!
//!     ctx.write_register(100, 0x1234).await?;
//!     ctx.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Server
//!
//! ```rust,no_run
//! use modbus_link::{ModbusMapping, ModbusTcpServer, ModbusTcpServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ModbusTcpServerConfig {
//!         bind_address: "127.0.0.1:502".parse()?,
//!         ..Default::default()
//!     };
//!     let mapping = ModbusMapping::new(100, 100, 100, 100);
//!     let mut server = ModbusTcpServer::with_mapping(config, mapping);
//!     server.start().await?;
//!     server.wait().await;
//!     Ok(())
//! }
//! ```

/// Error types and result alias
pub mod error;

/// Protocol definitions: function codes, exception codes, data layout helpers
pub mod protocol;

/// ADU buffer and frame length computation
pub mod frame;

/// Per-transport backend capability set (RTU, TCP)
pub mod backend;

/// Byte-stream transports (TCP socket, serial line)
pub mod transport;

/// Error-recovery flags and the retry policy shared by client and server
pub mod recovery;

/// Client-side transaction engine
pub mod client;

/// Server-side dispatcher and TCP server harness
pub mod server;

/// Server register mapping (coils, discrete inputs, holding/input registers)
pub mod mapping;

/// Frame hex-dump helpers behind the context debug flag
pub mod logging;

pub use backend::{BackendKind, ModbusBackend, RtuBackend, TcpBackend, TransactionTriple};
pub use client::{ModbusContext, ModbusTimeouts};
pub use error::{ModbusError, ModbusResult};
pub use frame::{Adu, FrameKind};
pub use mapping::ModbusMapping;
pub use protocol::{data_utils, ModbusException, ModbusFunction, SlaveId};
pub use recovery::{ErrorRecovery, RetryPolicy};
pub use server::{ModbusTcpServer, ModbusTcpServerConfig};
pub use transport::{ModbusTransport, SerialConfig, SerialTransport, TcpTransport};

/// Broadcast slave address: every slave executes, none replies
pub const BROADCAST_ADDRESS: u8 = 0;

/// Reserved TCP unit identifier used when the unit id is irrelevant
pub const TCP_SLAVE_UNUSED: u8 = 0xFF;

/// Maximum quantity of coils/discrete inputs readable in one request
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum quantity of coils writable in one request
pub const MAX_WRITE_BITS: u16 = 1968;

/// Maximum quantity of registers readable in one request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum quantity of registers writable in one request
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Write-part limit of the combined write/read request
pub const MAX_WR_WRITE_REGISTERS: u16 = 121;

/// Read-part limit of the combined write/read request
pub const MAX_WR_READ_REGISTERS: u16 = 125;

/// Maximum PDU size, inherited from the serial line constraint
pub const MAX_PDU_LENGTH: usize = 253;

/// Maximum ADU size across both transports (RTU 256, TCP 260); one buffer
/// of this size serves either
pub const MAX_ADU_LENGTH: usize = 260;

/// Maximum RTU ADU size: 253-byte PDU + slave address + CRC
pub const MAX_RTU_ADU_LENGTH: usize = 256;

/// Number of bytes requested by the first read of the receive loop. Large
/// enough to swallow most frames in one read on both transports; the
/// transports return whatever is available so short frames never stall.
pub const MIN_PROBE_LENGTH: usize = 12;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
