//! A live debug session against one device.
//!
//! The [`Session`] owns the protocol [`Link`] plus cached copies of the
//! device registers and a full shadow image of program memory. Every
//! cached field has a validity bit: accessors return the cached value when
//! the bit is set and otherwise issue the wire command, store the result
//! and set the bit. Mutating operations clear exactly the bits whose
//! backing state they may have changed, and all bits are keyed to the link
//! generation so that a silent link recovery drops every cache at once.

mod breakpoints;
mod flash;
mod trace;

pub use breakpoints::Breakpoint;

use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::crc::crc16_ccitt;
use crate::error::Error;
use crate::policy::RevisionPolicy;
use crate::protocol::{regs, Link, MEM_SIZE, REG_FILE_SIZE};
use crate::transport::Transport;

/// Typical chip reset is ~10 ms; give it five seconds before declaring
/// the part dead.
const RESET_TIMEOUT: Duration = Duration::from_secs(5);

/// The opcode programmed over an instruction to trap into debug mode.
pub(crate) const TRAP_OPCODE: u8 = 0x00;
/// DI; executing it leaves interrupts disabled, so the single-step
/// erratum workaround must not re-enable them afterwards.
const DI_OPCODE: u8 = 0x8F;
/// 3-byte absolute call, for step-over.
const CALL_DA_OPCODE: u8 = 0xD6;
/// 2-byte indirect-register call.
const CALL_IRR_OPCODE: u8 = 0xD4;

bitflags! {
    /// Validity bits for the per-session device state cache.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Cached: u16 {
        const REVID    = 0x0001;
        const DBGCTL   = 0x0002;
        const DBGSTAT  = 0x0004;
        const PC       = 0x0008;
        const CRC      = 0x0010;
        const MEMCRC   = 0x0020;
        const MEMSIZE  = 0x0040;
        const BAUDRATE = 0x0100;
        const RELOAD   = 0x0200;
        const SYSCLK   = 0x0400;
        const FREQ     = 0x0800;
        const TIMEOUT  = 0x1000;
    }
}

bitflags! {
    /// Debug control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DebugCtl: u8 {
        const DBG_MODE = 0x80;
        const BRK_EN   = 0x40;
        const BRK_ACK  = 0x20;
        const BRK_LOOP = 0x10;
        const BRK_PC   = 0x08;
        const BRK_CNTR = 0x04;
        const RST      = 0x01;
    }
}

bitflags! {
    /// Debug status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DebugStatus: u8 {
        const STOPPED        = 0x80;
        const HALT_MODE      = 0x40;
        const RD_PROTECT     = 0x20;
        const PARAM_UNLOCKED = 0x10;
    }
}

/// What the core is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStatus {
    /// Fully stopped, in debug mode.
    Halted,
    /// Stopped at a breakpoint but not in full debug mode; interrupts
    /// may still be serviced in the background.
    AtBreakpoint,
    /// Executing.
    Running,
}

/// How flash writes are verified when the shadow cache was trustworthy
/// going in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyPolicy {
    /// A CRC mismatch after programming fails the write.
    #[default]
    Strict,
    /// A CRC mismatch is logged and the write reports success. Readback
    /// byte-compare failures are always fatal regardless of policy.
    Warn,
}

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Serve program memory reads from the shadow image whenever the
    /// device CRC proves it current.
    pub memory_cache: bool,
    /// Flash write verification policy.
    pub verify: VerifyPolicy,
    /// Known system clock in Hz, when the target cannot report one.
    pub system_clock: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            memory_cache: true,
            verify: VerifyPolicy::Strict,
            system_clock: None,
        }
    }
}

/// Grants for operations that are destructive beyond the usual debugging
/// workflow.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    erase_all: bool,
}

impl Permissions {
    /// Allow mass erasing the device.
    pub fn allow_erase_all(mut self) -> Self {
        self.erase_all = true;
        self
    }

    pub(crate) fn require_erase_all(&self, what: &'static str) -> Result<(), Error> {
        if self.erase_all {
            Ok(())
        } else {
            Err(Error::precondition(
                what,
                "mass erase denied, attach with Permissions::allow_erase_all",
            ))
        }
    }
}

/// One live connection to a device.
///
/// A session is single threaded by contract: every operation is a
/// blocking request/response exchange, and callers poll
/// [`is_running`](Session::is_running) themselves while the target
/// executes. Dropping the session removes all breakpoints and leaves the
/// device in run mode.
pub struct Session {
    link: Link,
    config: SessionConfig,
    permissions: Permissions,

    cache: Cached,
    cache_generation: u64,

    revision_id: u16,
    dbgctl: DebugCtl,
    dbgstat: DebugStatus,
    pc: u16,
    crc: u16,
    memcrc: u16,
    memsize_code: u8,
    reload: u16,
    baudrate: u32,
    sysclk: u32,
    freq_khz: u16,
    timeout: Duration,

    shadow: Vec<u8>,
    pub(crate) breakpoints: Vec<Breakpoint>,
    pub(crate) tbreak: Option<u16>,

    detached: bool,
}

impl Session {
    /// Connects to the device behind `transport` and resets the debug
    /// link (autobaud handshake).
    pub fn attach(
        transport: Box<dyn Transport>,
        config: SessionConfig,
        permissions: Permissions,
    ) -> Result<Self, Error> {
        let mut link = Link::new(transport);
        link.reset()?;
        let cache_generation = link.generation();
        let mut session = Session {
            link,
            config,
            permissions,
            cache: Cached::empty(),
            cache_generation,
            revision_id: 0,
            dbgctl: DebugCtl::empty(),
            dbgstat: DebugStatus::empty(),
            pc: 0,
            crc: 0,
            memcrc: 0,
            memsize_code: 0,
            reload: 0,
            baudrate: 0,
            sysclk: 0,
            freq_khz: 0,
            timeout: Duration::ZERO,
            shadow: vec![0xFF; MEM_SIZE],
            breakpoints: Vec::new(),
            tbreak: None,
            detached: false,
        };
        if let Some(hz) = session.config.system_clock {
            session.set_system_clock(hz)?;
        }
        Ok(session)
    }

    /// Removes all breakpoints, restores run mode and closes the session.
    pub fn detach(mut self) -> Result<(), Error> {
        let result = self.teardown();
        self.detached = true;
        result
    }

    fn teardown(&mut self) -> Result<(), Error> {
        while let Some(address) = self.breakpoints.last().map(|bp| bp.address()) {
            self.remove_breakpoint(address)?;
        }
        self.tbreak = None;
        if self.link.link_open() && self.link.link_up() {
            self.link.write_debug_ctl(0x00)?;
        }
        Ok(())
    }

    // --- cache plumbing -------------------------------------------------

    /// A link reset (including the silent recovery kind inside the
    /// protocol layer) invalidates everything we think we know.
    fn sync_cache(&mut self) {
        if self.cache_generation != self.link.generation() {
            self.cache = Cached::empty();
            self.cache_generation = self.link.generation();
        }
    }

    fn is_cached(&mut self, flag: Cached) -> bool {
        self.sync_cache();
        self.cache.contains(flag)
    }

    fn store(&mut self, flag: Cached) {
        self.sync_cache();
        self.cache.insert(flag);
    }

    fn invalidate(&mut self, flags: Cached) {
        self.sync_cache();
        self.cache.remove(flags);
    }

    /// Drops every cached value; the next accessor round-trips.
    pub fn flush_cache(&mut self) {
        self.cache = Cached::empty();
    }

    /// Re-autobauds the link and flushes the cache.
    pub fn reset_link(&mut self) -> Result<(), Error> {
        self.flush_cache();
        self.link.reset()
    }

    // --- cached accessors -----------------------------------------------

    /// The revision ID of the on-chip debugger.
    pub fn revision_id(&mut self) -> Result<u16, Error> {
        if !self.is_cached(Cached::REVID) {
            self.revision_id = self.link.read_revision_id()?;
            self.store(Cached::REVID);
        }
        Ok(self.revision_id)
    }

    /// The behavioral policy for the connected revision.
    pub fn policy(&mut self) -> Result<RevisionPolicy, Error> {
        Ok(RevisionPolicy::lookup(self.revision_id()?))
    }

    fn cached_dbgctl(&mut self) -> Result<DebugCtl, Error> {
        if !self.is_cached(Cached::DBGCTL) {
            self.dbgctl = DebugCtl::from_bits_retain(self.link.read_debug_ctl()?);
            self.store(Cached::DBGCTL);
        }
        Ok(self.dbgctl)
    }

    fn cached_dbgstat(&mut self) -> Result<DebugStatus, Error> {
        if !self.is_cached(Cached::DBGSTAT) {
            self.dbgstat = DebugStatus::from_bits_retain(self.link.read_debug_status()?);
            self.store(Cached::DBGSTAT);
        }
        Ok(self.dbgstat)
    }

    fn cached_memsize_code(&mut self) -> Result<u8, Error> {
        if !self.is_cached(Cached::MEMSIZE) {
            self.memsize_code = self.link.read_memory_size()?;
            self.store(Cached::MEMSIZE);
        }
        Ok(self.memsize_code)
    }

    /// Program memory size in bytes; zero when the revision is unknown
    /// and size-dependent features must be disabled.
    pub fn memory_size(&mut self) -> Result<u32, Error> {
        let policy = self.policy()?;
        if !policy.known() {
            return Ok(0);
        }
        let code = self.cached_memsize_code()?;
        Ok(policy.memory_size(code))
    }

    /// The CRC of program memory as reported by the device.
    pub fn device_crc(&mut self) -> Result<u16, Error> {
        if !self.is_cached(Cached::CRC) {
            self.require_stopped("Cannot read memory crc")?;
            self.refresh_timeout()?;
            self.crc = self.link.read_memory_crc()?;
            self.store(Cached::CRC);
        }
        Ok(self.crc)
    }

    /// The CRC of the local shadow image over the device's memory size.
    pub(crate) fn shadow_crc(&mut self) -> Result<u16, Error> {
        if !self.is_cached(Cached::MEMCRC) {
            let size = self.memory_size()? as usize;
            if size == 0 {
                self.memcrc = 0;
                return Ok(0);
            }
            self.memcrc = crc16_ccitt(0x0000, &self.shadow[..size]);
            self.store(Cached::MEMCRC);
        }
        Ok(self.memcrc)
    }

    /// The program counter. Requires the device stopped and readable.
    pub fn program_counter(&mut self) -> Result<u16, Error> {
        if !self.is_cached(Cached::PC) {
            self.require_stopped("Cannot read program counter")?;
            self.require_unprotected("Cannot read program counter")?;
            self.pc = self.link.read_pc()?;
            self.store(Cached::PC);
        }
        Ok(self.pc)
    }

    /// Writes and readback-verifies the program counter.
    pub fn set_pc(&mut self, address: u16) -> Result<(), Error> {
        self.require_stopped("Cannot write program counter")?;
        self.require_unprotected("Cannot write program counter")?;
        self.invalidate(Cached::PC);
        self.link.write_pc(address)?;
        if self.program_counter()? != address {
            return Err(Error::verify(
                "Write program counter failed",
                "readback verify failed",
            ));
        }
        Ok(())
    }

    /// The run counter (clocks between breakpoints).
    pub fn counter(&mut self) -> Result<u16, Error> {
        self.require_stopped("Cannot read counter")?;
        self.link.read_counter()
    }

    /// The baud reload register, or zero on revisions without one.
    pub fn baud_reload(&mut self) -> Result<u16, Error> {
        if !self.is_cached(Cached::RELOAD) {
            self.reload = if self.policy()?.has_reload {
                self.link.read_reload()?
            } else {
                0
            };
            self.store(Cached::RELOAD);
        }
        Ok(self.reload)
    }

    fn cached_baudrate(&mut self) -> Result<u32, Error> {
        if !self.is_cached(Cached::BAUDRATE) {
            self.baudrate = self.link.link_speed();
            self.store(Cached::BAUDRATE);
        }
        Ok(self.baudrate)
    }

    /// System clock in Hz, auto-detected from the reload register and the
    /// link baud rate; zero when it cannot be derived.
    pub fn system_clock(&mut self) -> Result<u32, Error> {
        if self.is_cached(Cached::SYSCLK) {
            return Ok(self.sysclk);
        }
        let reload = self.baud_reload()?;
        let baudrate = self.cached_baudrate()?;
        if reload == 0 || baudrate == 0 {
            return Ok(0);
        }
        self.sysclk = u32::from(reload) * baudrate / 8;
        self.store(Cached::SYSCLK);
        Ok(self.sysclk)
    }

    /// Overrides the system clock used for timeouts and flash timing.
    pub fn set_system_clock(&mut self, hz: u32) -> Result<(), Error> {
        if hz / 1000 > 0x1_0000 {
            return Err(Error::precondition(
                "Set system clock failed",
                "value out of range",
            ));
        }
        self.sysclk = hz;
        self.invalidate(Cached::FREQ | Cached::TIMEOUT);
        self.store(Cached::SYSCLK);
        Ok(())
    }

    /// Switches the link baud rate; derived clock state must be
    /// re-learned afterwards.
    pub fn set_baudrate(&mut self, baud: u32) -> Result<(), Error> {
        self.link.set_baudrate(baud)?;
        self.invalidate(Cached::BAUDRATE | Cached::SYSCLK | Cached::FREQ | Cached::TIMEOUT);
        Ok(())
    }

    /// System clock in kHz, as programmed into the flash frequency
    /// registers.
    pub(crate) fn cached_freq_khz(&mut self) -> Result<u16, Error> {
        if !self.is_cached(Cached::FREQ) {
            let sysclk = self.system_clock()?;
            self.freq_khz = (sysclk / 1000) as u16;
            self.store(Cached::FREQ);
        }
        Ok(self.freq_khz)
    }

    /// Lengthens the transport timeout to the worst-case round trip at
    /// the current clock. The applied timeout only ever grows.
    pub(crate) fn refresh_timeout(&mut self) -> Result<(), Error> {
        if self.is_cached(Cached::TIMEOUT) {
            return Ok(());
        }
        let sysclk = self.system_clock()?;
        // Worst case is a full 64 KiB CRC pass on a part running from the
        // 32 kHz internal oscillator.
        let clock = if sysclk != 0 { u64::from(sysclk) } else { 32_768 };
        let worst_case = Duration::from_millis(65_536 * 3 / 2 * 1000 / clock);
        if worst_case > self.timeout {
            self.link.set_timeout(worst_case);
            self.timeout = worst_case;
        }
        self.store(Cached::TIMEOUT);
        Ok(())
    }

    // --- state predicates -----------------------------------------------

    pub(crate) fn is_stopped(&mut self) -> Result<bool, Error> {
        Ok(self.cached_dbgctl()?.contains(DebugCtl::DBG_MODE))
    }

    pub(crate) fn is_protected(&mut self) -> Result<bool, Error> {
        Ok(self.cached_dbgstat()?.contains(DebugStatus::RD_PROTECT))
    }

    /// Three-way execution status.
    pub fn status(&mut self) -> Result<CoreStatus, Error> {
        if self.cached_dbgctl()?.contains(DebugCtl::DBG_MODE) {
            return Ok(CoreStatus::Halted);
        }
        if self.cached_dbgstat()?.contains(DebugStatus::STOPPED) {
            return Ok(CoreStatus::AtBreakpoint);
        }
        Ok(CoreStatus::Running)
    }

    pub(crate) fn require_stopped(&mut self, what: &'static str) -> Result<(), Error> {
        if self.is_stopped()? {
            Ok(())
        } else {
            Err(Error::precondition(what, "device is running"))
        }
    }

    pub(crate) fn require_unprotected(&mut self, what: &'static str) -> Result<(), Error> {
        if self.is_protected()? {
            Err(Error::precondition(what, "memory read protect is enabled"))
        } else {
            Ok(())
        }
    }

    // --- execution control ----------------------------------------------

    /// Writes the debug control register, dropping the caches it
    /// invalidates (execution state changed, so PC and CRC are stale).
    fn write_debug_ctl(&mut self, ctl: DebugCtl) -> Result<(), Error> {
        self.invalidate(Cached::PC | Cached::CRC | Cached::DBGSTAT);
        self.link.write_debug_ctl(ctl.bits())?;
        self.dbgctl = ctl;
        self.store(Cached::DBGCTL);
        Ok(())
    }

    /// Stops the CPU and enters debug mode. No-op when already stopped.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.sync_cache();
        if self.cache.contains(Cached::DBGCTL) && self.dbgctl.contains(DebugCtl::DBG_MODE) {
            return Ok(());
        }

        self.invalidate(Cached::DBGCTL);
        if let Err(e) = self.cached_dbgctl() {
            if !e.is_recoverable() {
                return Err(e);
            }
            // A part in stop-mode resets when first probed; re-autobaud
            // and try once more.
            self.reset_link()?;
            self.cached_dbgctl()?;
        }

        if !self.dbgctl.contains(DebugCtl::DBG_MODE) {
            let ctl = DebugCtl::DBG_MODE | DebugCtl::BRK_EN;
            self.write_debug_ctl(ctl)?;
            self.invalidate(Cached::DBGCTL);
            if self.cached_dbgctl()? != ctl {
                return Err(Error::verify(
                    "Write on-chip debugger control register failed",
                    "readback verify failed",
                ));
            }
        }

        self.clear_temp_breakpoint()?;
        Ok(())
    }

    /// Puts the CPU in run mode. No-op when already running.
    pub fn run(&mut self) -> Result<(), Error> {
        if !self.is_stopped()? {
            return Ok(());
        }

        if !self.policy()?.can_run_protected && self.is_protected()? {
            return Err(Error::precondition(
                "Cannot put device into run mode",
                "memory read protect is enabled",
            ));
        }

        // Running with a trap byte under the program counter would stop
        // again immediately; step past it first.
        let pc = self.program_counter()?;
        if self.breakpoint_is_set(pc) {
            self.step()?;
        }

        self.write_debug_ctl(DebugCtl::BRK_EN | DebugCtl::BRK_ACK)
    }

    /// Runs until `address` is reached (or an earlier breakpoint hits).
    pub fn run_to(&mut self, address: u16) -> Result<(), Error> {
        self.require_stopped("Cannot run to address")?;
        self.require_unprotected("Cannot run to address")?;

        let pc = self.program_counter()?;
        if self.breakpoint_is_set(pc) {
            self.step()?;
        }

        let mut ctl = DebugCtl::BRK_EN | DebugCtl::BRK_ACK;
        if self.policy()?.has_hw_breakpoint {
            self.link.write_counter(address)?;
            ctl |= DebugCtl::BRK_PC;
        } else {
            // No PC-compare hardware on this revision: plant a temporary
            // software breakpoint instead, cleared next time the device
            // is observed stopped.
            if self.tbreak.is_some() {
                return Err(Error::precondition(
                    "Cannot run to address",
                    "a temporary breakpoint is already pending",
                ));
            }
            // A breakpoint the caller planted at the target already stops
            // the device there; only plant a temporary one if none exists.
            if !self.breakpoint_is_set(address) {
                self.set_breakpoint(address)?;
                self.tbreak = Some(address);
            }
        }

        self.write_debug_ctl(ctl)
    }

    /// Runs for `clocks` system clock cycles, using the hardware counter
    /// breakpoint.
    pub fn run_for_clocks(&mut self, clocks: u16) -> Result<(), Error> {
        if !self.policy()?.has_hw_breakpoint {
            return Err(Error::feature_unavailable(
                "Cannot run for duration of clock cycles",
                "hardware revision does not support the counter breakpoint",
            ));
        }
        self.require_stopped("Cannot run for duration of clock cycles")?;
        self.require_unprotected("Cannot run for duration of clock cycles")?;

        self.link.write_counter(clocks)?;
        if self.link.read_counter()? != clocks {
            return Err(Error::verify(
                "Write on-chip debugger counter failed",
                "readback verify failed",
            ));
        }

        self.write_debug_ctl(DebugCtl::BRK_EN | DebugCtl::BRK_ACK | DebugCtl::BRK_CNTR)
    }

    /// Whether the CPU is still executing. Tolerates one transient link
    /// failure (clock switches drop the line) with a reset-and-retry.
    pub fn is_running(&mut self) -> Result<bool, Error> {
        self.sync_cache();
        if self.cache.contains(Cached::DBGCTL) {
            if self.dbgctl.contains(DebugCtl::DBG_MODE) {
                return Ok(false);
            }
            // Believed running: a stop acknowledge byte is the cheap way
            // to notice the break.
            match self.link.read_ack() {
                Ok(false) => return Ok(true),
                Ok(true) => {}
                Err(_) => self.reset_link()?,
            }
        }

        self.invalidate(Cached::DBGCTL);
        if let Err(first) = self.cached_dbgctl() {
            if !first.is_recoverable() {
                return Err(first);
            }
            self.reset_link()?;
            if self.cached_dbgctl().is_err() {
                return Err(first);
            }
        }

        if self.dbgctl.contains(DebugCtl::DBG_MODE) {
            self.clear_temp_breakpoint()?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Executes one instruction.
    pub fn step(&mut self) -> Result<(), Error> {
        self.require_stopped("Could not single step instruction")?;
        self.require_unprotected("Could not single step instruction")?;

        let policy = self.policy()?;
        let pc = self.program_counter()?;
        let stuffed = self
            .breakpoints
            .iter()
            .find(|bp| bp.address() == pc)
            .map(|bp| bp.original_byte());

        if policy.step_irq_erratum {
            self.step_with_irq_workaround(pc, stuffed)
        } else {
            self.invalidate(Cached::PC | Cached::CRC);
            match stuffed {
                Some(opcode) => self.link.stuff_instruction(opcode),
                None => self.link.step_instruction(),
            }
        }
    }

    /// Single-step on the afflicted revision: a pending interrupt can be
    /// lost or double-serviced by the step, so mask the interrupt
    /// controller around it and restore afterwards, unless the stepped
    /// instruction itself disables interrupts.
    fn step_with_irq_workaround(&mut self, pc: u16, stuffed: Option<u8>) -> Result<(), Error> {
        let mut irqctl = [0u8; 1];
        self.link.read_registers(regs::IRQCTL, &mut irqctl)?;
        let enabled = irqctl[0] & 0x80 != 0;
        if enabled {
            self.link.write_registers(regs::IRQCTL, &[irqctl[0] & 0x7F])?;
        }

        let opcode = match stuffed {
            Some(opcode) => opcode,
            None => {
                let mut buf = [0u8; 1];
                self.read_memory(pc, &mut buf)?;
                buf[0]
            }
        };

        self.invalidate(Cached::PC | Cached::CRC);
        match stuffed {
            Some(opcode) => self.link.stuff_instruction(opcode)?,
            None => self.link.step_instruction()?,
        }

        if enabled && opcode != DI_OPCODE {
            self.link.write_registers(regs::IRQCTL, &[irqctl[0]])?;
        }
        Ok(())
    }

    /// Steps over the instruction at the program counter: calls get a
    /// temporary run-to breakpoint after the call site, everything else
    /// is a plain step. Poll [`is_running`](Session::is_running) to see
    /// when a stepped-over call returns.
    pub fn next(&mut self) -> Result<(), Error> {
        self.require_stopped("Could not step over instruction")?;
        self.require_unprotected("Could not step over instruction")?;

        let pc = self.program_counter()?;
        let mut opcode = [0u8; 1];
        self.read_memory(pc, &mut opcode)?;

        let resume_at = match opcode[0] {
            CALL_DA_OPCODE => Some(pc.wrapping_add(3)),
            CALL_IRR_OPCODE => Some(pc.wrapping_add(2)),
            _ => None,
        };

        match resume_at {
            Some(address) => self.run_to(address),
            None => self.step(),
        }
    }

    /// Resets the chip and waits for the reset bit to clear.
    pub fn reset_chip(&mut self) -> Result<(), Error> {
        let ctl = self.cached_dbgctl()?;
        if self.link.write_debug_ctl((ctl | DebugCtl::RST).bits()).is_err() {
            self.reset_link()?;
        }
        self.flush_cache();

        let start = Instant::now();
        loop {
            thread::sleep(Duration::from_millis(5));
            self.invalidate(Cached::DBGCTL);
            self.cached_dbgctl()?;
            if !self.dbgctl.contains(DebugCtl::RST) {
                return Ok(());
            }
            if start.elapsed() >= RESET_TIMEOUT {
                return Err(Error::timeout(
                    "Reset chip failed",
                    "timeout waiting for reset to finish",
                ));
            }
        }
    }

    // --- register file and data memory ----------------------------------

    /// Reads from the register file.
    pub fn read_registers(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Error> {
        self.require_stopped("Cannot read register file")?;
        if address < regs::PERIPHERAL_BASE {
            self.require_unprotected("Cannot read register file")?;
        }
        if usize::from(address) + buf.len() > REG_FILE_SIZE {
            return Err(Error::precondition(
                "Cannot read register file",
                "invalid address range",
            ));
        }
        self.link.read_registers(address, buf)
    }

    /// Writes to the register file, readback-verifying the RAM portion.
    /// Peripheral registers (0xF00 and up) read back as the hardware
    /// pleases and are not verified.
    pub fn write_registers(&mut self, address: u16, data: &[u8]) -> Result<(), Error> {
        self.require_stopped("Cannot write register file")?;
        if usize::from(address) + data.len() > REG_FILE_SIZE {
            return Err(Error::precondition(
                "Cannot write register file",
                "invalid address range",
            ));
        }
        if address < regs::PERIPHERAL_BASE {
            self.require_unprotected("Cannot write register file")?;
        }

        // Touching the flash control block can kick off state changes
        // that alter program memory.
        let end = usize::from(address) + data.len();
        if address <= regs::FCTL && end > usize::from(regs::FCTL) {
            self.invalidate(Cached::CRC);
        }

        self.link.write_registers(address, data)?;

        let verify_len = if address >= regs::PERIPHERAL_BASE {
            0
        } else {
            data.len()
                .min(usize::from(regs::PERIPHERAL_BASE - address))
        };
        if verify_len > 0 {
            let mut readback = vec![0u8; verify_len];
            self.link.read_registers(address, &mut readback)?;
            if readback != data[..verify_len] {
                return Err(Error::verify(
                    "Register write failed",
                    "readback verify failed",
                ));
            }
        }
        Ok(())
    }

    /// Reads external data memory.
    pub fn read_data(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Error> {
        self.require_stopped("Cannot read data memory")?;
        self.require_unprotected("Cannot read data memory")?;
        self.link.read_data_memory(address, buf)
    }

    /// Writes external data memory.
    pub fn write_data(&mut self, address: u16, data: &[u8]) -> Result<(), Error> {
        self.require_stopped("Cannot write data memory")?;
        self.require_unprotected("Cannot write data memory")?;
        self.link.write_data_memory(address, data)
    }

}

impl Drop for Session {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Err(e) = self.teardown() {
            tracing::warn!("session teardown failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FakeOcd;

    fn session(revision: u16) -> Session {
        Session::attach(
            Box::new(FakeOcd::new(revision, 0x05)),
            SessionConfig::default(),
            Permissions::default(),
        )
        .unwrap()
    }

    #[test]
    fn revision_id_is_read_once() {
        let fake = FakeOcd::new(0x0127, 0x05);
        let device = fake.device();
        let mut session = Session::attach(
            Box::new(fake),
            SessionConfig::default(),
            Permissions::default(),
        )
        .unwrap();
        assert_eq!(session.revision_id().unwrap(), 0x0127);
        // Nothing left to answer a second wire read: the cache serves it.
        device.lock().unwrap().revision_id = 0xDEAD;
        assert_eq!(session.revision_id().unwrap(), 0x0127);
        session.detach().unwrap();
    }

    #[test]
    fn control_register_write_invalidates_pc_and_crc() {
        let mut session = session(0x0127);
        session.stop().unwrap();
        let _ = session.program_counter().unwrap();
        let _ = session.device_crc().unwrap();
        assert!(session.cache.contains(Cached::PC));
        assert!(session.cache.contains(Cached::CRC));
        session
            .write_debug_ctl(DebugCtl::DBG_MODE | DebugCtl::BRK_EN)
            .unwrap();
        assert!(!session.cache.contains(Cached::PC));
        assert!(!session.cache.contains(Cached::CRC));
        session.detach().unwrap();
    }

    #[test]
    fn stop_is_idempotent() {
        let mut session = session(0x0127);
        session.stop().unwrap();
        session.stop().unwrap();
        assert_eq!(session.status().unwrap(), CoreStatus::Halted);
        session.detach().unwrap();
    }

    #[test]
    fn run_then_stop_round_trip() {
        let fake = FakeOcd::new(0x0127, 0x05);
        let device = fake.device();
        let mut session = Session::attach(
            Box::new(fake),
            SessionConfig::default(),
            Permissions::default(),
        )
        .unwrap();
        session.stop().unwrap();
        session.run().unwrap();
        assert!(!device.lock().unwrap().halted());
        assert!(session.is_running().unwrap());
        session.stop().unwrap();
        assert!(device.lock().unwrap().halted());
        assert!(!session.is_running().unwrap());
        session.detach().unwrap();
    }

    #[test]
    fn run_while_protected_fails_on_old_silicon() {
        let fake = FakeOcd::new(0x0110, 0x02);
        let device = fake.device();
        let mut session = Session::attach(
            Box::new(fake),
            SessionConfig::default(),
            Permissions::default(),
        )
        .unwrap();
        session.stop().unwrap();
        device.lock().unwrap().set_read_protect(true);
        session.invalidate(Cached::DBGSTAT);
        let err = session.run().unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
        // Tear down by hand: the fake is still protected, so the normal
        // detach path is not exercised here.
        session.detached = true;
    }

    #[test]
    fn run_for_clocks_needs_counter_hardware() {
        let mut session = session(0x0100);
        let err = session.run_for_clocks(100).unwrap_err();
        assert!(matches!(err, Error::FeatureUnavailable { .. }));
        session.detach().unwrap();
    }

    #[test]
    fn set_pc_round_trip() {
        let mut session = session(0x0127);
        session.stop().unwrap();
        session.set_pc(0x1000).unwrap();
        assert_eq!(session.program_counter().unwrap(), 0x1000);
        session.detach().unwrap();
    }

    #[test]
    fn register_write_verifies_ram_only() {
        let fake = FakeOcd::new(0x0127, 0x05);
        let device = fake.device();
        let mut session = Session::attach(
            Box::new(fake),
            SessionConfig::default(),
            Permissions::default(),
        )
        .unwrap();
        session.stop().unwrap();
        session.write_registers(0x0100, &[0x11, 0x22, 0x33]).unwrap();
        let dev = device.lock().unwrap();
        assert_eq!(&dev.regs[0x100..0x103], &[0x11, 0x22, 0x33]);
        drop(dev);
        session.detach().unwrap();
    }

    #[test]
    fn timeout_is_only_ever_lengthened() {
        let mut session = session(0x0127);
        session.stop().unwrap();
        session.refresh_timeout().unwrap();
        let first = session.timeout;
        assert!(first >= Duration::from_millis(3000));
        // A faster clock would shorten the computed value; the applied
        // timeout must stay put.
        session.set_system_clock(20_000_000).unwrap();
        session.refresh_timeout().unwrap();
        assert_eq!(session.timeout, first);
        session.detach().unwrap();
    }

    #[test]
    fn link_recovery_drops_all_caches() {
        let fake = FakeOcd::new(0x0127, 0x05);
        let device = fake.device();
        let mut session = Session::attach(
            Box::new(fake),
            SessionConfig::default(),
            Permissions::default(),
        )
        .unwrap();
        session.stop().unwrap();
        let _ = session.program_counter().unwrap();
        assert!(session.cache.contains(Cached::PC));
        // A break condition on the wire forces a silent link reset on the
        // next command; every cache bit must fall with it.
        device.lock().unwrap().break_pending = true;
        let _ = session.revision_id().unwrap();
        assert!(!session.cache.contains(Cached::PC));
        session.detach().unwrap();
    }
}
