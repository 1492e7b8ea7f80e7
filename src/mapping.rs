/// Server register mapping
///
/// Four independent banks backing the server dispatcher: coils and holding
/// registers (writable by clients), discrete inputs and input registers
/// (written by the application, read-only over the wire). Each bank covers
/// the half-open address range `[start, start + len)`; every access is
/// range-checked against that window and multi-element writes are all or
/// nothing, so a rejected request leaves the mapping untouched.
use crate::protocol::ModbusAddress;

#[derive(Debug, Clone)]
pub struct ModbusMapping {
    start_bits: ModbusAddress,
    bits: Vec<bool>,
    start_input_bits: ModbusAddress,
    input_bits: Vec<bool>,
    start_registers: ModbusAddress,
    registers: Vec<u16>,
    start_input_registers: ModbusAddress,
    input_registers: Vec<u16>,
}

fn span(start: ModbusAddress, len: usize, address: ModbusAddress, nb: u16) -> Option<std::ops::Range<usize>> {
    let start = start as usize;
    let address = address as usize;
    let nb = nb as usize;
    if nb == 0 || address < start || address + nb > start + len {
        return None;
    }
    Some(address - start..address - start + nb)
}

impl ModbusMapping {
    /// All four banks starting at address 0
    pub fn new(nb_bits: u16, nb_input_bits: u16, nb_registers: u16, nb_input_registers: u16) -> Self {
        Self::with_start_addresses(0, nb_bits, 0, nb_input_bits, 0, nb_registers, 0, nb_input_registers)
    }

    /// Banks covering `[start, start + nb)` per data type
    #[allow(clippy::too_many_arguments)]
    pub fn with_start_addresses(
        start_bits: ModbusAddress,
        nb_bits: u16,
        start_input_bits: ModbusAddress,
        nb_input_bits: u16,
        start_registers: ModbusAddress,
        nb_registers: u16,
        start_input_registers: ModbusAddress,
        nb_input_registers: u16,
    ) -> Self {
        ModbusMapping {
            start_bits,
            bits: vec![false; nb_bits as usize],
            start_input_bits,
            input_bits: vec![false; nb_input_bits as usize],
            start_registers,
            registers: vec![0; nb_registers as usize],
            start_input_registers,
            input_registers: vec![0; nb_input_registers as usize],
        }
    }

    // Wire-facing reads. `None` means the range falls outside the bank and
    // the dispatcher answers with an illegal-data-address exception.

    pub fn read_bits(&self, address: ModbusAddress, nb: u16) -> Option<&[bool]> {
        span(self.start_bits, self.bits.len(), address, nb).map(|r| &self.bits[r])
    }

    pub fn read_input_bits(&self, address: ModbusAddress, nb: u16) -> Option<&[bool]> {
        span(self.start_input_bits, self.input_bits.len(), address, nb).map(|r| &self.input_bits[r])
    }

    pub fn read_registers(&self, address: ModbusAddress, nb: u16) -> Option<&[u16]> {
        span(self.start_registers, self.registers.len(), address, nb).map(|r| &self.registers[r])
    }

    pub fn read_input_registers(&self, address: ModbusAddress, nb: u16) -> Option<&[u16]> {
        span(
            self.start_input_registers,
            self.input_registers.len(),
            address,
            nb,
        )
        .map(|r| &self.input_registers[r])
    }

    // Wire-facing writes. The range is checked up front; a failed write
    // modifies nothing.

    pub fn write_bit(&mut self, address: ModbusAddress, value: bool) -> bool {
        match span(self.start_bits, self.bits.len(), address, 1) {
            Some(r) => {
                self.bits[r.start] = value;
                true
            }
            None => false,
        }
    }

    pub fn write_bits(&mut self, address: ModbusAddress, values: &[bool]) -> bool {
        match span(self.start_bits, self.bits.len(), address, values.len() as u16) {
            Some(r) => {
                self.bits[r].copy_from_slice(values);
                true
            }
            None => false,
        }
    }

    pub fn write_register(&mut self, address: ModbusAddress, value: u16) -> bool {
        match span(self.start_registers, self.registers.len(), address, 1) {
            Some(r) => {
                self.registers[r.start] = value;
                true
            }
            None => false,
        }
    }

    pub fn write_registers(&mut self, address: ModbusAddress, values: &[u16]) -> bool {
        match span(
            self.start_registers,
            self.registers.len(),
            address,
            values.len() as u16,
        ) {
            Some(r) => {
                self.registers[r].copy_from_slice(values);
                true
            }
            None => false,
        }
    }

    /// `value = (current AND and_mask) OR (or_mask AND NOT and_mask)`
    pub fn mask_write_register(&mut self, address: ModbusAddress, and_mask: u16, or_mask: u16) -> bool {
        match span(self.start_registers, self.registers.len(), address, 1) {
            Some(r) => {
                let current = self.registers[r.start];
                self.registers[r.start] = (current & and_mask) | (or_mask & !and_mask);
                true
            }
            None => false,
        }
    }

    // Application-side accessors for priming read-only banks and
    // inspecting state.

    pub fn set_input_bit(&mut self, address: ModbusAddress, value: bool) -> bool {
        match span(self.start_input_bits, self.input_bits.len(), address, 1) {
            Some(r) => {
                self.input_bits[r.start] = value;
                true
            }
            None => false,
        }
    }

    pub fn set_input_register(&mut self, address: ModbusAddress, value: u16) -> bool {
        match span(
            self.start_input_registers,
            self.input_registers.len(),
            address,
            1,
        ) {
            Some(r) => {
                self.input_registers[r.start] = value;
                true
            }
            None => false,
        }
    }

    pub fn bit(&self, address: ModbusAddress) -> Option<bool> {
        self.read_bits(address, 1).map(|b| b[0])
    }

    pub fn register(&self, address: ModbusAddress) -> Option<u16> {
        self.read_registers(address, 1).map(|r| r[0])
    }

    pub fn input_register(&self, address: ModbusAddress) -> Option<u16> {
        self.read_input_registers(address, 1).map(|r| r[0])
    }
}
