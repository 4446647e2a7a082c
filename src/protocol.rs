//! The OCD link protocol.
//!
//! Every debugger command is a fixed-format byte sequence: an 8-bit opcode,
//! optionally followed by a big-endian 16-bit address, an 8- or 16-bit
//! length and a payload. Read commands elicit exactly `length` response
//! bytes with no framing overhead; the transport either delivers the
//! bytes or raises a timeout. [`Link`] frames these commands, fragments
//! large transfers to the transport's maximum unit, and recovers from
//! pending link error conditions (an uncommanded clock switch shows up as
//! a break on the wire) by re-running the autobaud handshake before the
//! next command.

use std::time::Duration;

use crate::error::Error;
use crate::transport::{Transport, TransportError};

/// Program memory address space.
pub const MEM_SIZE: usize = 0x1_0000;
/// Register file address space.
pub const REG_FILE_SIZE: usize = 0x1000;
/// Flash page size in bytes.
pub const PAGE_SIZE: usize = 512;
/// Largest register file transfer in one command.
pub const REG_CHUNK: usize = 256;

/// Wire opcodes understood by the on-chip debugger.
pub mod commands {
    pub const AUTOBAUD: u8 = 0x80;
    pub const RD_REVID: u8 = 0x00;
    pub const WR_CNTR: u8 = 0x01;
    pub const RD_DBGSTAT: u8 = 0x02;
    pub const RD_CNTR: u8 = 0x03;
    pub const WR_DBGCTL: u8 = 0x04;
    pub const RD_DBGCTL: u8 = 0x05;
    pub const WR_PC: u8 = 0x06;
    pub const RD_PC: u8 = 0x07;
    pub const WR_REG: u8 = 0x08;
    pub const RD_REG: u8 = 0x09;
    pub const WR_MEM: u8 = 0x0A;
    pub const RD_MEM: u8 = 0x0B;
    pub const WR_EDATA: u8 = 0x0C;
    pub const RD_EDATA: u8 = 0x0D;
    pub const RD_MEMCRC: u8 = 0x0E;
    pub const STEP_INST: u8 = 0x10;
    pub const STUFF_INST: u8 = 0x11;
    pub const EXEC_INST: u8 = 0x12;
    pub const RD_RELOAD: u8 = 0x1B;
    pub const TRACE: u8 = 0x40;
    /// The memory size register read is a two byte escape sequence.
    pub const RD_MEMSIZE_0: u8 = 0xF3;
    pub const RD_MEMSIZE_1: u8 = 0x84;

    /// Sub-commands of [`TRACE`], present only on emulator builds.
    pub mod trace {
        pub const RD_STATUS: u8 = 0x01;
        pub const WR_CTL: u8 = 0x02;
        pub const RD_CTL: u8 = 0x03;
        pub const WR_EVENT: u8 = 0x04;
        pub const RD_EVENT: u8 = 0x05;
        pub const RD_WR_PTR: u8 = 0x06;
        pub const RD_BUFF: u8 = 0x08;
    }
}

/// Register file locations with wired-in meaning to the debugger.
pub mod regs {
    /// Start of the peripheral register block; RAM below, peripherals at
    /// and above. Only RAM writes are readback-verified.
    pub const PERIPHERAL_BASE: u16 = 0xF00;
    /// Interrupt controller master register.
    pub const IRQCTL: u16 = 0xFCF;
    /// Flash interface: control, page select and two frequency registers.
    pub const FCTL: u16 = 0xFF8;
    pub const FPS: u16 = 0xFF9;

    /// Values written to (and states read from) the flash control register.
    pub mod fctl {
        pub const LOCK: u8 = 0x00;
        pub const UNLOCK_0: u8 = 0x73;
        pub const UNLOCK_1: u8 = 0x8C;
        pub const PROTECT: u8 = 0x5E;
        pub const PAGE_ERASE: u8 = 0x95;
        pub const MASS_ERASE: u8 = 0x63;
        pub const UNLOCKED: u8 = 0x02;
    }
}

/// One trace event comparator: register address/data, CPU flags and PC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceData {
    pub reg_addr: u16,
    pub reg_data: u8,
    pub cpu_flags: u8,
    pub pc: u16,
}

/// A trace event: control byte plus a mask/value comparator pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceEvent {
    pub ctl: u8,
    pub mask: TraceData,
    pub data: TraceData,
}

/// One captured trace buffer frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceFrame {
    pub data: [u8; 8],
}

/// The framed command/response layer over a [`Transport`].
///
/// The link keeps a generation counter that is bumped on every reset,
/// including the silent recovery resets issued when the transport reports
/// a pending error. Callers that cache device state compare generations
/// before trusting their caches.
#[derive(Debug)]
pub struct Link {
    transport: Box<dyn Transport>,
    generation: u64,
}

impl Link {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Link {
            transport,
            generation: 0,
        }
    }

    /// Generation counter; changes whenever the link was reset.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Re-autobauds the link and invalidates all caches keyed to it.
    pub fn reset(&mut self) -> Result<(), Error> {
        tracing::debug!("resetting debug link");
        self.transport.reset()?;
        self.generation += 1;
        Ok(())
    }

    /// Checks for a pending transport error condition before a command
    /// and recovers by resetting the link. Models recovery from an
    /// uncommanded clock-source change on the target.
    fn ensure_ready(&mut self) -> Result<(), Error> {
        if self.transport.error_pending() {
            tracing::warn!("pending link error condition, re-autobauding");
            self.reset()?;
        }
        Ok(())
    }

    /// Writes raw bytes, fragmented to the transport's maximum unit.
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let mtu = self.transport.max_transmission_unit().unwrap_or(usize::MAX);
        for chunk in data.chunks(mtu.max(1)) {
            tracing::trace!("dbg <- {chunk:02X?}");
            self.transport.write(chunk)?;
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.transport.read(buf).map_err(|e| match e {
            TransportError::Timeout => Error::timeout(
                "Read from on-chip debugger failed",
                "timed out waiting for response",
            ),
            other => Error::Transport(other),
        })?;
        tracing::trace!("dbg -> {buf:02X?}");
        Ok(())
    }

    /// Largest read response that fits one transport unit, leaving room
    /// for the command bytes sharing the unit.
    fn read_chunk_limit(&self, overhead: usize) -> usize {
        match self.transport.max_transmission_unit() {
            Some(mtu) if mtu > overhead => mtu - overhead,
            Some(_) => 1,
            None => usize::MAX,
        }
    }

    pub fn read_revision_id(&mut self) -> Result<u16, Error> {
        self.ensure_ready()?;
        self.write(&[commands::RD_REVID])?;
        let mut data = [0u8; 2];
        self.read(&mut data)?;
        Ok(u16::from_be_bytes(data))
    }

    pub fn read_debug_status(&mut self) -> Result<u8, Error> {
        self.ensure_ready()?;
        self.write(&[commands::RD_DBGSTAT])?;
        let mut data = [0u8; 1];
        self.read(&mut data)?;
        Ok(data[0])
    }

    pub fn read_debug_ctl(&mut self) -> Result<u8, Error> {
        self.ensure_ready()?;
        self.write(&[commands::RD_DBGCTL])?;
        let mut data = [0u8; 1];
        self.read(&mut data)?;
        Ok(data[0])
    }

    pub fn write_debug_ctl(&mut self, value: u8) -> Result<(), Error> {
        self.ensure_ready()?;
        self.write(&[commands::WR_DBGCTL, value])
    }

    pub fn read_pc(&mut self) -> Result<u16, Error> {
        self.ensure_ready()?;
        self.write(&[commands::RD_PC])?;
        let mut data = [0u8; 2];
        self.read(&mut data)?;
        Ok(u16::from_be_bytes(data))
    }

    pub fn write_pc(&mut self, pc: u16) -> Result<(), Error> {
        self.ensure_ready()?;
        let [hi, lo] = pc.to_be_bytes();
        self.write(&[commands::WR_PC, hi, lo])
    }

    pub fn read_counter(&mut self) -> Result<u16, Error> {
        self.ensure_ready()?;
        self.write(&[commands::RD_CNTR])?;
        let mut data = [0u8; 2];
        self.read(&mut data)?;
        Ok(u16::from_be_bytes(data))
    }

    pub fn write_counter(&mut self, value: u16) -> Result<(), Error> {
        self.ensure_ready()?;
        let [hi, lo] = value.to_be_bytes();
        self.write(&[commands::WR_CNTR, hi, lo])
    }

    pub fn read_reload(&mut self) -> Result<u16, Error> {
        self.ensure_ready()?;
        self.write(&[commands::RD_RELOAD])?;
        let mut data = [0u8; 2];
        self.read(&mut data)?;
        Ok(u16::from_be_bytes(data))
    }

    pub fn read_memory_size(&mut self) -> Result<u8, Error> {
        self.write(&[commands::RD_MEMSIZE_0, commands::RD_MEMSIZE_1])?;
        let mut data = [0u8; 1];
        self.read(&mut data)?;
        Ok(data[0])
    }

    pub fn read_memory_crc(&mut self) -> Result<u16, Error> {
        self.write(&[commands::RD_MEMCRC])?;
        let mut data = [0u8; 2];
        self.read(&mut data)?;
        Ok(u16::from_be_bytes(data))
    }

    pub fn step_instruction(&mut self) -> Result<(), Error> {
        self.write(&[commands::STEP_INST])
    }

    /// Executes one instruction with `opcode` substituted for the byte at
    /// the program counter.
    pub fn stuff_instruction(&mut self, opcode: u8) -> Result<(), Error> {
        self.write(&[commands::STUFF_INST, opcode])
    }

    /// Stuffs a whole instruction (up to five bytes) and executes it
    /// without touching program memory.
    pub fn execute_instruction(&mut self, opcodes: &[u8]) -> Result<(), Error> {
        debug_assert!(opcodes.len() <= 5);
        let mut command = Vec::with_capacity(opcodes.len() + 1);
        command.push(commands::EXEC_INST);
        command.extend_from_slice(opcodes);
        self.write(&command)
    }

    /// Attempts to read the stop acknowledge byte. Returns `false` when no
    /// byte is waiting; anything other than `0xFF` is a link error.
    pub fn read_ack(&mut self) -> Result<bool, Error> {
        if !self.transport.available()? {
            return Ok(false);
        }
        let mut data = [0u8; 1];
        self.read(&mut data)?;
        if data[0] != 0xFF {
            return Err(Error::link(
                "Read acknowledge from on-chip debugger failed",
                format!("acknowledge byte was {:#04x}, not FF", data[0]),
            ));
        }
        Ok(true)
    }

    pub fn read_registers(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Error> {
        assert!(usize::from(address) + buf.len() <= REG_FILE_SIZE);
        assert!(!buf.is_empty());
        let limit = self.read_chunk_limit(4).min(REG_CHUNK);
        let mut address = address;
        for chunk in buf.chunks_mut(limit) {
            let [hi, lo] = address.to_be_bytes();
            let len = encode_reg_len(chunk.len());
            self.ensure_ready()?;
            self.write(&[commands::RD_REG, hi, lo, len])?;
            self.read(chunk)?;
            address += chunk.len() as u16;
        }
        Ok(())
    }

    pub fn write_registers(&mut self, address: u16, data: &[u8]) -> Result<(), Error> {
        assert!(usize::from(address) + data.len() <= REG_FILE_SIZE);
        assert!(!data.is_empty());
        let mut address = address;
        for chunk in data.chunks(REG_CHUNK) {
            let [hi, lo] = address.to_be_bytes();
            let len = encode_reg_len(chunk.len());
            self.ensure_ready()?;
            self.write(&[commands::WR_REG, hi, lo, len])?;
            self.write(chunk)?;
            address += chunk.len() as u16;
        }
        Ok(())
    }

    pub fn read_program_memory(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Error> {
        self.read_paged(commands::RD_MEM, address, buf)
    }

    pub fn write_program_memory(&mut self, address: u16, data: &[u8]) -> Result<(), Error> {
        self.write_paged(commands::WR_MEM, address, data)
    }

    pub fn read_data_memory(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Error> {
        self.read_paged(commands::RD_EDATA, address, buf)
    }

    pub fn write_data_memory(&mut self, address: u16, data: &[u8]) -> Result<(), Error> {
        self.write_paged(commands::WR_EDATA, address, data)
    }

    // Transfers are tracked as usize offsets from the base address; a
    // transfer ending exactly at the top of the 64 KiB space must not
    // advance a u16 cursor past 0xFFFF.
    fn read_paged(&mut self, opcode: u8, address: u16, buf: &mut [u8]) -> Result<(), Error> {
        let base = usize::from(address);
        assert!(base + buf.len() <= MEM_SIZE);
        // The length field is 16 bits, so a full-space read takes two
        // commands even without a transport limit.
        let limit = self.read_chunk_limit(5).min(0xFFFF);
        let mut offset = 0;
        for chunk in buf.chunks_mut(limit) {
            let [ahi, alo] = ((base + offset) as u16).to_be_bytes();
            let [lhi, llo] = (chunk.len() as u16).to_be_bytes();
            self.write(&[opcode, ahi, alo, lhi, llo])?;
            self.read(chunk)?;
            offset += chunk.len();
        }
        Ok(())
    }

    fn write_paged(&mut self, opcode: u8, address: u16, data: &[u8]) -> Result<(), Error> {
        let base = usize::from(address);
        assert!(base + data.len() <= MEM_SIZE);
        let mut offset = 0;
        for chunk in data.chunks(0xFFFF) {
            let [ahi, alo] = ((base + offset) as u16).to_be_bytes();
            let [lhi, llo] = (chunk.len() as u16).to_be_bytes();
            self.write(&[opcode, ahi, alo, lhi, llo])?;
            self.write(chunk)?;
            offset += chunk.len();
        }
        Ok(())
    }

    pub fn read_trace_status(&mut self) -> Result<u8, Error> {
        self.write(&[commands::TRACE, commands::trace::RD_STATUS])?;
        let mut data = [0u8; 1];
        self.read(&mut data)?;
        Ok(data[0])
    }

    pub fn write_trace_ctl(&mut self, ctl: u8) -> Result<(), Error> {
        self.write(&[commands::TRACE, commands::trace::WR_CTL, ctl])
    }

    pub fn read_trace_ctl(&mut self) -> Result<u8, Error> {
        self.write(&[commands::TRACE, commands::trace::RD_CTL])?;
        let mut data = [0u8; 1];
        self.read(&mut data)?;
        Ok(data[0])
    }

    pub fn write_trace_event(&mut self, slot: u8, event: &TraceEvent) -> Result<(), Error> {
        let mut command = [0u8; 16];
        command[0] = commands::TRACE;
        command[1] = commands::trace::WR_EVENT;
        command[2] = slot;
        command[3] = event.ctl;
        encode_trace_data(&event.mask, &mut command[4..10]);
        encode_trace_data(&event.data, &mut command[10..16]);
        self.write(&command)
    }

    pub fn read_trace_event(&mut self, slot: u8) -> Result<TraceEvent, Error> {
        self.write(&[commands::TRACE, commands::trace::RD_EVENT, slot])?;
        let mut data = [0u8; 13];
        self.read(&mut data)?;
        Ok(TraceEvent {
            ctl: data[0],
            mask: decode_trace_data(&data[1..7]),
            data: decode_trace_data(&data[7..13]),
        })
    }

    pub fn read_trace_write_ptr(&mut self) -> Result<u16, Error> {
        self.write(&[commands::TRACE, commands::trace::RD_WR_PTR])?;
        let mut data = [0u8; 2];
        self.read(&mut data)?;
        Ok(u16::from_be_bytes(data))
    }

    pub fn read_trace_buffer(&mut self, address: u16, count: u16) -> Result<Vec<TraceFrame>, Error> {
        let [ahi, alo] = address.to_be_bytes();
        let [chi, clo] = count.to_be_bytes();
        self.write(&[
            commands::TRACE,
            commands::trace::RD_BUFF,
            ahi,
            alo,
            chi,
            clo,
        ])?;
        let count = if count == 0 { 0x1_0000 } else { usize::from(count) };
        let mut raw = vec![0u8; count * 8];
        self.read(&mut raw)?;
        Ok(raw
            .chunks_exact(8)
            .map(|frame| {
                let mut data = [0u8; 8];
                data.copy_from_slice(frame);
                TraceFrame { data }
            })
            .collect())
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.transport.set_timeout(timeout);
    }

    pub fn set_baudrate(&mut self, baud: u32) -> Result<(), Error> {
        self.transport.set_baudrate(baud)?;
        Ok(())
    }

    pub fn link_speed(&self) -> u32 {
        self.transport.link_speed()
    }

    pub fn link_open(&self) -> bool {
        self.transport.link_open()
    }

    pub fn link_up(&self) -> bool {
        self.transport.link_up()
    }
}

/// Register transfers encode a full 256 byte chunk as a zero length byte.
fn encode_reg_len(len: usize) -> u8 {
    debug_assert!(len > 0 && len <= REG_CHUNK);
    if len == REG_CHUNK {
        0
    } else {
        len as u8
    }
}

fn encode_trace_data(data: &TraceData, out: &mut [u8]) {
    out[0..2].copy_from_slice(&data.reg_addr.to_be_bytes());
    out[2] = data.reg_data;
    out[3] = data.cpu_flags;
    out[4..6].copy_from_slice(&data.pc.to_be_bytes());
}

fn decode_trace_data(raw: &[u8]) -> TraceData {
    TraceData {
        reg_addr: u16::from_be_bytes([raw[0], raw[1]]),
        reg_data: raw[2],
        cpu_flags: raw[3],
        pc: u16::from_be_bytes([raw[4], raw[5]]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FakeOcd;

    fn link(revision: u16) -> (Link, std::sync::Arc<std::sync::Mutex<crate::transport::FakeDevice>>)
    {
        let fake = FakeOcd::new(revision, 0x05);
        let device = fake.device();
        let mut link = Link::new(Box::new(fake));
        link.reset().unwrap();
        (link, device)
    }

    #[test]
    fn revision_id_round_trip() {
        let (mut link, _) = link(0x0127);
        assert_eq!(link.read_revision_id().unwrap(), 0x0127);
    }

    #[test]
    fn pc_and_counter_round_trip() {
        let (mut link, device) = link(0x0127);
        link.write_pc(0x1234).unwrap();
        assert_eq!(link.read_pc().unwrap(), 0x1234);
        assert_eq!(device.lock().unwrap().pc, 0x1234);
        link.write_counter(0xBEEF).unwrap();
        assert_eq!(link.read_counter().unwrap(), 0xBEEF);
    }

    #[test]
    fn register_chunking_encodes_256_as_zero() {
        assert_eq!(encode_reg_len(256), 0);
        assert_eq!(encode_reg_len(255), 255);
        assert_eq!(encode_reg_len(1), 1);
    }

    #[test]
    fn large_register_read_is_fragmented() {
        let (mut link, device) = link(0x0127);
        for i in 0..0x400usize {
            device.lock().unwrap().regs[i] = i as u8;
        }
        let mut buf = vec![0u8; 0x400];
        link.read_registers(0x000, &mut buf).unwrap();
        for (i, &b) in buf.iter().enumerate() {
            assert_eq!(b, i as u8);
        }
    }

    #[test]
    fn memory_transfers_reach_the_top_of_the_address_space() {
        let (mut link, device) = link(0x0127);
        device.lock().unwrap().mem[0xFFFF] = 0x42;

        // A transfer ending exactly at 0x10000 must not push the address
        // cursor past the last byte.
        let mut buf = vec![0u8; 0x200];
        link.read_program_memory(0xFE00, &mut buf).unwrap();
        assert_eq!(buf[0x1FF], 0x42);

        buf.fill(0x00);
        link.write_registers(regs::FCTL, &[regs::fctl::UNLOCK_0]).unwrap();
        link.write_registers(regs::FCTL, &[regs::fctl::UNLOCK_1]).unwrap();
        link.write_program_memory(0xFE00, &buf).unwrap();
        assert_eq!(device.lock().unwrap().mem[0xFFFF], 0x00);
    }

    #[test]
    fn executed_instruction_reaches_the_device() {
        let (mut link, device) = link(0x0127);
        link.execute_instruction(&[0xE6, 0x12, 0x34]).unwrap();
        assert_eq!(device.lock().unwrap().executed, vec![vec![0xE6, 0x12, 0x34]]);
    }

    #[test]
    fn pending_error_triggers_reset_before_command() {
        let (mut link, device) = link(0x0127);
        let before = link.generation();
        device.lock().unwrap().break_pending = true;
        link.read_revision_id().unwrap();
        assert!(link.generation() > before);
        assert!(!device.lock().unwrap().break_pending);
    }

    #[test]
    fn generation_bumps_on_every_reset() {
        let (mut link, _) = link(0x0127);
        let g0 = link.generation();
        link.reset().unwrap();
        link.reset().unwrap();
        assert_eq!(link.generation(), g0 + 2);
    }

    #[test]
    fn ack_absent_reads_as_false() {
        let (mut link, _) = link(0x0127);
        assert!(!link.read_ack().unwrap());
    }

    #[test]
    fn trace_event_round_trip() {
        let (mut link, _) = link(0x8127);
        let event = TraceEvent {
            ctl: 0x81,
            mask: TraceData {
                reg_addr: 0x0FFF,
                reg_data: 0xFF,
                cpu_flags: 0x0F,
                pc: 0xFFFF,
            },
            data: TraceData {
                reg_addr: 0x0123,
                reg_data: 0x55,
                cpu_flags: 0x05,
                pc: 0x4242,
            },
        };
        link.write_trace_event(3, &event).unwrap();
        assert_eq!(link.read_trace_event(3).unwrap(), event);
    }
}
