//! A mock transport with a simulated eZ8 device behind it.
//!
//! [`FakeOcd`] decodes the wire command set and applies it to an in-memory
//! [`FakeDevice`]: 64 KiB of flash with monotonic programming (a write can
//! only clear bits unless the page was erased first), the flash controller
//! lock/unlock state machine, the debug control/status registers and the
//! memory CRC command. Tests hold a second handle to the device state and
//! can inspect or perturb it mid-session.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Transport, TransportError};
use crate::crc::crc16_ccitt;
use crate::policy::RevisionPolicy;
use crate::protocol::commands;
use crate::protocol::regs;

const MEM_SIZE: usize = 0x1_0000;
const REG_SIZE: usize = 0x1000;
const PAGE_SIZE: usize = 512;
const INFO_WINDOW_CODE: usize = 0xFE00;
const INFO_WINDOW_DATA: usize = 0xFF80;

const DBGCTL_DBG_MODE: u8 = 0x80;
const DBGCTL_BRK_EN: u8 = 0x40;
const DBGCTL_BRK_ACK: u8 = 0x20;
const DBGCTL_BRK_PC: u8 = 0x08;
const DBGCTL_BRK_CNTR: u8 = 0x04;
const DBGCTL_RST: u8 = 0x01;
const DBGSTAT_STOPPED: u8 = 0x80;
const DBGSTAT_RD_PROTECT: u8 = 0x20;

/// Simulated device state. Shared between the [`FakeOcd`] transport and
/// the test that constructed it.
pub struct FakeDevice {
    pub revision_id: u16,
    pub memsize_code: u8,
    pub reload: u16,
    pub dbgctl: u8,
    pub dbgstat: u8,
    pub pc: u16,
    pub cntr: u16,
    pub mem: Vec<u8>,
    pub info: Vec<u8>,
    pub edata: Vec<u8>,
    pub regs: Vec<u8>,
    pub trace_status: u8,
    pub trace_ctl: u8,
    pub trace_write_ptr: u16,
    trace_events: [[u8; 13]; 8],

    /// Flash controller unlock progression: 0 locked, 1 after the first
    /// unlock code, 2 unlocked.
    fctl_stage: u8,
    /// Status reads left that still report the erase-busy bits.
    busy_reads_left: u8,
    busy_bits: u8,

    /// Pending break condition; cleared by a link reset.
    pub break_pending: bool,
    /// Force this many upcoming reads to time out (simulated dropped
    /// responses).
    pub drop_reads: u8,
    pub link_up: bool,

    // Instrumentation for tests.
    pub page_erases: usize,
    pub mass_erases: usize,
    pub mem_write_bytes: usize,
    pub mem_write_commands: usize,
    pub step_count: usize,
    pub stuffed: Vec<u8>,
    pub executed: Vec<Vec<u8>>,
    pub irqctl_history: Vec<u8>,
    pub link_resets: usize,

    command: Vec<u8>,
    response: VecDeque<u8>,
}

impl FakeDevice {
    fn new(revision_id: u16, memsize_code: u8) -> Self {
        FakeDevice {
            revision_id,
            memsize_code,
            reload: 0,
            dbgctl: 0x00,
            dbgstat: 0x00,
            pc: 0x0000,
            cntr: 0x0000,
            mem: vec![0xFF; MEM_SIZE],
            info: vec![0xFF; PAGE_SIZE],
            edata: vec![0x00; MEM_SIZE],
            regs: vec![0x00; REG_SIZE],
            trace_status: 0x00,
            trace_ctl: 0x00,
            trace_write_ptr: 0x0000,
            trace_events: [[0u8; 13]; 8],
            fctl_stage: 0,
            busy_reads_left: 0,
            busy_bits: 0,
            break_pending: false,
            drop_reads: 0,
            link_up: false,
            page_erases: 0,
            mass_erases: 0,
            mem_write_bytes: 0,
            mem_write_commands: 0,
            step_count: 0,
            stuffed: Vec::new(),
            executed: Vec::new(),
            irqctl_history: Vec::new(),
            link_resets: 0,
            command: Vec::new(),
            response: VecDeque::new(),
        }
    }

    /// Marks the device read-protected. Subsequent status reads report it.
    pub fn set_read_protect(&mut self, enabled: bool) {
        if enabled {
            self.dbgstat |= DBGSTAT_RD_PROTECT;
        } else {
            self.dbgstat &= !DBGSTAT_RD_PROTECT;
        }
    }

    /// Whether the device is halted in debug mode.
    pub fn halted(&self) -> bool {
        self.dbgctl & DBGCTL_DBG_MODE != 0
    }

    fn memory_size(&self) -> usize {
        let size = RevisionPolicy::lookup(self.revision_id).memory_size(self.memsize_code) as usize;
        if size == 0 {
            MEM_SIZE
        } else {
            size
        }
    }

    fn info_selected(&self) -> bool {
        self.regs[usize::from(regs::FPS)] & 0x80 != 0
    }

    fn push_response(&mut self, bytes: &[u8]) {
        self.response.extend(bytes.iter().copied());
    }

    fn ingest(&mut self, bytes: &[u8]) {
        self.command.extend_from_slice(bytes);
        while let Some(len) = self.command_len() {
            if self.command.len() < len {
                break;
            }
            let cmd: Vec<u8> = self.command.drain(..len).collect();
            self.execute(&cmd);
        }
    }

    /// Total byte length of the command at the head of the buffer, or
    /// `None` if the header is not complete yet.
    fn command_len(&self) -> Option<usize> {
        let buf = &self.command;
        let op = *buf.first()?;
        let len = match op {
            commands::AUTOBAUD => 1,
            commands::RD_REVID
            | commands::RD_DBGSTAT
            | commands::RD_CNTR
            | commands::RD_DBGCTL
            | commands::RD_PC
            | commands::RD_MEMCRC
            | commands::STEP_INST
            | commands::RD_RELOAD => 1,
            commands::WR_DBGCTL | commands::STUFF_INST | commands::RD_MEMSIZE_0 => 2,
            // The real device works out the instruction length from the
            // opcode bytes themselves. The link writes each command in one
            // piece, so everything buffered belongs to this one.
            commands::EXEC_INST => buf.len(),
            commands::WR_CNTR | commands::WR_PC => 3,
            commands::RD_REG => 4,
            commands::WR_REG => {
                if buf.len() < 4 {
                    return None;
                }
                4 + reg_len(buf[3])
            }
            commands::RD_MEM | commands::RD_EDATA => 5,
            commands::WR_MEM | commands::WR_EDATA => {
                if buf.len() < 5 {
                    return None;
                }
                5 + usize::from(u16::from_be_bytes([buf[3], buf[4]]))
            }
            commands::TRACE => {
                if buf.len() < 2 {
                    return None;
                }
                match buf[1] {
                    commands::trace::RD_STATUS
                    | commands::trace::RD_CTL
                    | commands::trace::RD_WR_PTR => 2,
                    commands::trace::WR_CTL | commands::trace::RD_EVENT => 3,
                    commands::trace::WR_EVENT => 16,
                    commands::trace::RD_BUFF => 6,
                    sub => panic!("FakeOcd: unsupported trace sub-command {sub:#04x}"),
                }
            }
            op => panic!("FakeOcd: unsupported command {op:#04x}"),
        };
        Some(len)
    }

    fn execute(&mut self, cmd: &[u8]) {
        match cmd[0] {
            commands::AUTOBAUD => {
                self.link_up = true;
            }
            commands::RD_REVID => self.push_response(&self.revision_id.to_be_bytes()),
            commands::RD_DBGSTAT => self.push_response(&[self.dbgstat]),
            commands::RD_DBGCTL => self.push_response(&[self.dbgctl]),
            commands::WR_DBGCTL => self.write_dbgctl(cmd[1]),
            commands::RD_PC => self.push_response(&self.pc.to_be_bytes()),
            commands::WR_PC => self.pc = u16::from_be_bytes([cmd[1], cmd[2]]),
            commands::RD_CNTR => self.push_response(&self.cntr.to_be_bytes()),
            commands::WR_CNTR => self.cntr = u16::from_be_bytes([cmd[1], cmd[2]]),
            commands::RD_RELOAD => self.push_response(&self.reload.to_be_bytes()),
            commands::RD_MEMSIZE_0 => {
                assert_eq!(cmd[1], commands::RD_MEMSIZE_1);
                self.push_response(&[self.memsize_code]);
            }
            commands::RD_MEMCRC => {
                let size = self.memory_size();
                let crc = crc16_ccitt(0x0000, &self.mem[..size]);
                self.push_response(&crc.to_be_bytes());
            }
            commands::STEP_INST => {
                self.step_count += 1;
                self.pc = self.pc.wrapping_add(1);
            }
            commands::STUFF_INST => {
                self.stuffed.push(cmd[1]);
                self.pc = self.pc.wrapping_add(1);
            }
            commands::EXEC_INST => {
                self.executed.push(cmd[1..].to_vec());
            }
            commands::RD_REG => {
                let addr = u16::from_be_bytes([cmd[1], cmd[2]]);
                let len = reg_len(cmd[3]);
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    out.push(self.read_reg_byte(addr + i as u16));
                }
                self.push_response(&out);
            }
            commands::WR_REG => {
                let addr = u16::from_be_bytes([cmd[1], cmd[2]]);
                for (i, &b) in cmd[4..].iter().enumerate() {
                    self.write_reg_byte(addr + i as u16, b);
                }
            }
            commands::RD_MEM => {
                let addr = usize::from(u16::from_be_bytes([cmd[1], cmd[2]]));
                let len = usize::from(u16::from_be_bytes([cmd[3], cmd[4]]));
                let mut out = Vec::with_capacity(len);
                for a in addr..addr + len {
                    out.push(self.read_mem_byte(a));
                }
                self.push_response(&out);
            }
            commands::WR_MEM => {
                let addr = usize::from(u16::from_be_bytes([cmd[1], cmd[2]]));
                self.mem_write_commands += 1;
                self.mem_write_bytes += cmd[5..].len();
                for (i, &b) in cmd[5..].iter().enumerate() {
                    self.write_mem_byte(addr + i, b);
                }
            }
            commands::RD_EDATA => {
                let addr = usize::from(u16::from_be_bytes([cmd[1], cmd[2]]));
                let len = usize::from(u16::from_be_bytes([cmd[3], cmd[4]]));
                let mut out = Vec::with_capacity(len);
                for a in addr..addr + len {
                    out.push(self.read_edata_byte(a));
                }
                self.push_response(&out);
            }
            commands::WR_EDATA => {
                let addr = usize::from(u16::from_be_bytes([cmd[1], cmd[2]]));
                for (i, &b) in cmd[5..].iter().enumerate() {
                    self.write_edata_byte(addr + i, b);
                }
            }
            commands::TRACE => self.execute_trace(cmd),
            op => panic!("FakeOcd: unsupported command {op:#04x}"),
        }
    }

    fn execute_trace(&mut self, cmd: &[u8]) {
        match cmd[1] {
            commands::trace::RD_STATUS => self.push_response(&[self.trace_status]),
            commands::trace::WR_CTL => self.trace_ctl = cmd[2],
            commands::trace::RD_CTL => self.push_response(&[self.trace_ctl]),
            commands::trace::WR_EVENT => {
                let slot = usize::from(cmd[2]) % self.trace_events.len();
                self.trace_events[slot].copy_from_slice(&cmd[3..16]);
            }
            commands::trace::RD_EVENT => {
                let slot = usize::from(cmd[2]) % self.trace_events.len();
                let event = self.trace_events[slot];
                self.push_response(&event);
            }
            commands::trace::RD_WR_PTR => {
                self.push_response(&self.trace_write_ptr.to_be_bytes())
            }
            commands::trace::RD_BUFF => {
                let count = usize::from(u16::from_be_bytes([cmd[4], cmd[5]]));
                // Frames are not modeled in detail; a fixed fill pattern
                // is enough for the framing to be exercised.
                self.push_response(&vec![0xA5; count * 8]);
            }
            sub => panic!("FakeOcd: unsupported trace sub-command {sub:#04x}"),
        }
    }

    fn write_dbgctl(&mut self, value: u8) {
        if value & DBGCTL_RST != 0 {
            // Chip reset: the reset bit self-clears, the program counter
            // returns to the reset vector and the flash controller locks.
            self.pc = 0x0000;
            self.dbgctl = value & !DBGCTL_RST;
            self.fctl_stage = 0;
            return;
        }
        self.dbgctl = value;
        if value & DBGCTL_DBG_MODE == 0 {
            self.dbgstat &= !DBGSTAT_STOPPED;
            self.enter_run(value);
        }
    }

    /// Simulated execution. The fake "runs" instantaneously: a PC-compare
    /// or counter breakpoint lands at once, and free-running execution
    /// scans forward for the first trap byte. With no trap in reach the
    /// device simply stays in run mode.
    fn enter_run(&mut self, ctl: u8) {
        if ctl & DBGCTL_BRK_PC != 0 {
            self.pc = self.cntr;
            self.halt(ctl);
            return;
        }
        if ctl & DBGCTL_BRK_CNTR != 0 {
            self.pc = self.pc.wrapping_add(self.cntr);
            self.halt(ctl);
            return;
        }
        if ctl & DBGCTL_BRK_EN != 0 {
            let start = usize::from(self.pc);
            if let Some(offset) = self.mem[start..].iter().position(|&b| b == 0x00) {
                self.pc = (start + offset) as u16;
                self.halt(ctl);
            }
        }
    }

    fn halt(&mut self, ctl: u8) {
        self.dbgctl |= DBGCTL_DBG_MODE;
        self.dbgstat |= DBGSTAT_STOPPED;
        if ctl & DBGCTL_BRK_ACK != 0 {
            self.response.push_back(0xFF);
        }
    }

    fn read_reg_byte(&mut self, addr: u16) -> u8 {
        if addr == regs::FCTL {
            if self.busy_reads_left > 0 {
                self.busy_reads_left -= 1;
                return self.busy_bits;
            }
            return if self.fctl_stage == 2 {
                regs::fctl::UNLOCKED
            } else {
                0x00
            };
        }
        self.regs[usize::from(addr) % REG_SIZE]
    }

    fn write_reg_byte(&mut self, addr: u16, value: u8) {
        if addr == regs::FCTL {
            match value {
                regs::fctl::UNLOCK_0 if self.fctl_stage == 0 => self.fctl_stage = 1,
                regs::fctl::UNLOCK_1 if self.fctl_stage == 1 => self.fctl_stage = 2,
                regs::fctl::PAGE_ERASE if self.fctl_stage == 2 => {
                    self.erase_page();
                    self.fctl_stage = 0;
                }
                regs::fctl::MASS_ERASE if self.fctl_stage == 2 => {
                    self.erase_all();
                    self.fctl_stage = 0;
                }
                _ => self.fctl_stage = 0,
            }
            return;
        }
        if addr == regs::IRQCTL {
            self.irqctl_history.push(value);
        }
        self.regs[usize::from(addr) % REG_SIZE] = value;
    }

    fn erase_page(&mut self) {
        self.page_erases += 1;
        let page = self.regs[usize::from(regs::FPS)];
        if page & 0x80 != 0 {
            self.info.fill(0xFF);
        } else {
            let base = usize::from(page & 0x7F) * PAGE_SIZE;
            if base + PAGE_SIZE <= self.mem.len() {
                self.mem[base..base + PAGE_SIZE].fill(0xFF);
            }
        }
        self.busy_bits = 0x10;
        self.busy_reads_left = 1;
    }

    fn erase_all(&mut self) {
        self.mass_erases += 1;
        self.mem.fill(0xFF);
        if self.info_selected() {
            self.info.fill(0xFF);
        }
        self.busy_bits = 0x20;
        self.busy_reads_left = 1;
    }

    fn read_mem_byte(&mut self, addr: usize) -> u8 {
        if self.info_selected() && addr >= INFO_WINDOW_CODE {
            return self.info[(addr - INFO_WINDOW_CODE) % PAGE_SIZE];
        }
        self.mem[addr % MEM_SIZE]
    }

    /// Program memory is flash: writes go nowhere while the controller is
    /// locked, and programming can only clear bits.
    fn write_mem_byte(&mut self, addr: usize, value: u8) {
        if self.fctl_stage != 2 {
            return;
        }
        if self.info_selected() && addr >= INFO_WINDOW_CODE {
            self.info[(addr - INFO_WINDOW_CODE) % PAGE_SIZE] &= value;
            return;
        }
        let slot = &mut self.mem[addr % MEM_SIZE];
        *slot &= value;
    }

    fn read_edata_byte(&mut self, addr: usize) -> u8 {
        if self.info_selected() && addr >= INFO_WINDOW_DATA {
            return self.info[(addr - INFO_WINDOW_DATA) % PAGE_SIZE];
        }
        self.edata[addr % MEM_SIZE]
    }

    fn write_edata_byte(&mut self, addr: usize, value: u8) {
        if self.info_selected() && addr >= INFO_WINDOW_DATA {
            if self.fctl_stage == 2 {
                self.info[(addr - INFO_WINDOW_DATA) % PAGE_SIZE] &= value;
            }
            return;
        }
        self.edata[addr % MEM_SIZE] = value;
    }
}

fn reg_len(encoded: u8) -> usize {
    if encoded == 0 {
        256
    } else {
        usize::from(encoded)
    }
}

/// A [`Transport`] backed by a [`FakeDevice`].
pub struct FakeOcd {
    device: Arc<Mutex<FakeDevice>>,
    timeout: Duration,
    speed: u32,
}

impl std::fmt::Debug for FakeOcd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeOcd").finish_non_exhaustive()
    }
}

impl FakeOcd {
    /// Creates a fake transport fronting a device with the given revision
    /// ID and raw memory-size register value.
    pub fn new(revision_id: u16, memsize_code: u8) -> Self {
        FakeOcd {
            device: Arc::new(Mutex::new(FakeDevice::new(revision_id, memsize_code))),
            timeout: Duration::from_millis(1000),
            speed: 115_200,
        }
    }

    /// A second handle to the simulated device, for test inspection.
    pub fn device(&self) -> Arc<Mutex<FakeDevice>> {
        Arc::clone(&self.device)
    }
}

impl Transport for FakeOcd {
    fn name(&self) -> &str {
        "fake-ocd"
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        let mut dev = self.device.lock().unwrap();
        dev.link_resets += 1;
        dev.link_up = true;
        dev.break_pending = false;
        dev.command.clear();
        dev.response.clear();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut dev = self.device.lock().unwrap();
        if dev.drop_reads > 0 {
            dev.drop_reads -= 1;
            dev.response.clear();
            return Err(TransportError::Timeout);
        }
        for slot in buf.iter_mut() {
            *slot = dev.response.pop_front().ok_or(TransportError::Timeout)?;
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let mut dev = self.device.lock().unwrap();
        if !dev.link_up {
            return Err(TransportError::NotOpen);
        }
        dev.ingest(buf);
        Ok(())
    }

    fn available(&mut self) -> Result<bool, TransportError> {
        Ok(!self.device.lock().unwrap().response.is_empty())
    }

    fn error_pending(&mut self) -> bool {
        self.device.lock().unwrap().break_pending
    }

    fn link_open(&self) -> bool {
        true
    }

    fn link_up(&self) -> bool {
        self.device.lock().unwrap().link_up
    }

    fn set_baudrate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.speed = baud;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn link_speed(&self) -> u32 {
        self.speed
    }
}
