//! Software breakpoints.
//!
//! A breakpoint is a trap opcode programmed over an instruction byte. The
//! trap is all-zero, so planting one only ever clears flash bits and
//! needs no page erase; removing one sets bits again and goes through the
//! full flash write path. The session records the displaced byte and
//! [`read_code`](Session::read_code) overlays it back, so callers never
//! see a trap they planted themselves.

use crate::error::Error;
use crate::protocol::PAGE_SIZE;

use super::{Cached, Session, TRAP_OPCODE};

/// One planted breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    pub(crate) address: u16,
    pub(crate) original: u8,
}

impl Breakpoint {
    /// The program memory address the trap sits at.
    pub fn address(&self) -> u16 {
        self.address
    }

    /// The instruction byte the trap displaced.
    pub fn original_byte(&self) -> u8 {
        self.original
    }
}

impl Session {
    /// Plants a breakpoint at `address`. At most one breakpoint can sit at
    /// any address, and address zero is reserved.
    pub fn set_breakpoint(&mut self, address: u16) -> Result<(), Error> {
        self.require_stopped("Cannot set breakpoint")?;
        self.require_unprotected("Cannot set breakpoint")?;
        if address == 0x0000 {
            return Err(Error::precondition(
                "Cannot set breakpoint",
                "address zero cannot hold a breakpoint",
            ));
        }
        let size = self.memory_size()?;
        if size > 0 && u32::from(address) >= size {
            return Err(Error::precondition(
                "Cannot set breakpoint",
                "address is beyond the end of device flash",
            ));
        }
        if self.breakpoint_is_set(address) {
            return Err(Error::precondition(
                "Cannot set breakpoint",
                "a breakpoint is already set at this address",
            ));
        }

        let mut original = [0u8; 1];
        self.read_memory(address, &mut original)?;

        if original[0] != TRAP_OPCODE {
            // The trap clears every bit, so it programs straight over the
            // old byte without an erase.
            let saved = self.save_flash_state()?;
            self.flash_setup((usize::from(address) / PAGE_SIZE) as u8)?;
            self.link.write_program_memory(address, &[TRAP_OPCODE])?;
            self.flash_lock()?;
            self.restore_flash_state(saved)?;

            let mut readback = [0u8; 1];
            self.link.read_program_memory(address, &mut readback)?;
            if readback[0] != TRAP_OPCODE {
                return Err(Error::verify(
                    "Set breakpoint failed",
                    "the trap byte did not program",
                ));
            }
            self.shadow[usize::from(address)] = TRAP_OPCODE;
            self.invalidate(Cached::CRC | Cached::MEMCRC);
        }

        tracing::debug!("breakpoint set at {address:#06x}");
        self.breakpoints.push(Breakpoint {
            address,
            original: original[0],
        });
        Ok(())
    }

    /// Removes the breakpoint at `address`, restoring the displaced byte.
    pub fn remove_breakpoint(&mut self, address: u16) -> Result<(), Error> {
        self.require_stopped("Cannot remove breakpoint")?;
        self.require_unprotected("Cannot remove breakpoint")?;
        let index = self
            .breakpoints
            .iter()
            .position(|bp| bp.address == address)
            .ok_or_else(|| {
                Error::precondition("Cannot remove breakpoint", "no breakpoint at this address")
            })?;

        let original = self.breakpoints[index].original;
        // Take the entry out before rewriting flash: the memory write
        // path keeps listed traps planted.
        self.breakpoints.remove(index);
        if original != TRAP_OPCODE {
            if let Err(e) = self.write_memory(address, &[original]) {
                self.breakpoints.push(Breakpoint { address, original });
                return Err(e);
            }
        }

        if self.tbreak == Some(address) {
            self.tbreak = None;
        }
        tracing::debug!("breakpoint removed at {address:#06x}");
        Ok(())
    }

    /// Whether a breakpoint is planted at `address`.
    pub fn breakpoint_is_set(&self, address: u16) -> bool {
        self.breakpoints.iter().any(|bp| bp.address == address)
    }

    /// All planted breakpoints, including a pending temporary one.
    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// Removes the temporary run-to breakpoint, if one is pending. Called
    /// whenever the device is observed stopped.
    pub(crate) fn clear_temp_breakpoint(&mut self) -> Result<(), Error> {
        if let Some(address) = self.tbreak.take() {
            self.remove_breakpoint(address)?;
        }
        Ok(())
    }

    /// Reads program memory as the program would see it: planted trap
    /// bytes are replaced by the instruction bytes they displaced.
    pub fn read_code(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Error> {
        self.read_memory(address, buf)?;
        let start = usize::from(address);
        for bp in &self.breakpoints {
            let at = usize::from(bp.address);
            if at >= start && at < start + buf.len() {
                buf[at - start] = bp.original;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::session::{Permissions, Session, SessionConfig};
    use crate::transport::FakeOcd;
    use crate::Error;

    fn stopped_session() -> (Session, std::sync::Arc<std::sync::Mutex<crate::transport::FakeDevice>>)
    {
        let fake = FakeOcd::new(0x0127, 0x05);
        let device = fake.device();
        let mut session = Session::attach(
            Box::new(fake),
            SessionConfig::default(),
            Permissions::default(),
        )
        .unwrap();
        session.stop().unwrap();
        (session, device)
    }

    #[test]
    fn breakpoint_at_reset_vector_is_rejected() {
        let (mut session, _device) = stopped_session();
        let err = session.set_breakpoint(0x0000).unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
        assert!(session.breakpoints().is_empty());
        session.detach().unwrap();
    }

    #[test]
    fn breakpoint_round_trip_restores_the_byte() {
        let (mut session, device) = stopped_session();
        session.write_memory(0x0200, &[0xE4, 0x12, 0x34]).unwrap();

        session.set_breakpoint(0x0200).unwrap();
        assert_eq!(device.lock().unwrap().mem[0x0200], 0x00);
        assert!(session.breakpoint_is_set(0x0200));

        session.remove_breakpoint(0x0200).unwrap();
        assert_eq!(device.lock().unwrap().mem[0x0200], 0xE4);
        assert!(session.breakpoints().is_empty());
        session.detach().unwrap();
    }

    #[test]
    fn duplicate_set_and_remove_of_unset_fail() {
        let (mut session, device) = stopped_session();
        session.set_breakpoint(0x0300).unwrap();
        let err = session.set_breakpoint(0x0300).unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
        assert_eq!(session.breakpoints().len(), 1);

        let err = session.remove_breakpoint(0x0400).unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
        drop(device);
        session.detach().unwrap();
    }

    #[test]
    fn breakpoint_at_address_one_is_allowed() {
        let (mut session, device) = stopped_session();
        session.write_memory(0x0001, &[0x8F]).unwrap();

        session.set_breakpoint(0x0001).unwrap();
        assert_eq!(device.lock().unwrap().mem[0x0001], 0x00);

        session.remove_breakpoint(0x0001).unwrap();
        assert_eq!(device.lock().unwrap().mem[0x0001], 0x8F);
        session.detach().unwrap();
    }

    #[test]
    fn read_code_never_shows_the_trap() {
        let (mut session, device) = stopped_session();
        session
            .write_memory(0x0100, &[0x10, 0x20, 0x30, 0x40])
            .unwrap();
        session.set_breakpoint(0x0101).unwrap();
        session.set_breakpoint(0x0103).unwrap();
        assert_eq!(device.lock().unwrap().mem[0x0101], 0x00);

        let mut code = [0u8; 4];
        session.read_code(0x0100, &mut code).unwrap();
        assert_eq!(code, [0x10, 0x20, 0x30, 0x40]);

        // The raw view does show the traps.
        let mut raw = [0u8; 4];
        session.read_memory(0x0100, &mut raw).unwrap();
        assert_eq!(raw, [0x10, 0x00, 0x30, 0x00]);
        session.detach().unwrap();
    }

    #[test]
    fn memory_write_under_a_breakpoint_keeps_the_trap() {
        let (mut session, device) = stopped_session();
        session.write_memory(0x0500, &[0xAA, 0xBB]).unwrap();
        session.set_breakpoint(0x0500).unwrap();

        session.write_memory(0x0500, &[0x55, 0x66]).unwrap();
        // Flash still traps, the recorded original byte follows the write.
        assert_eq!(device.lock().unwrap().mem[0x0500], 0x00);
        assert_eq!(device.lock().unwrap().mem[0x0501], 0x66);
        let mut code = [0u8; 2];
        session.read_code(0x0500, &mut code).unwrap();
        assert_eq!(code, [0x55, 0x66]);

        session.remove_breakpoint(0x0500).unwrap();
        assert_eq!(device.lock().unwrap().mem[0x0500], 0x55);
        session.detach().unwrap();
    }

    #[test]
    fn detach_removes_breakpoints() {
        let (mut session, device) = stopped_session();
        session.write_memory(0x0600, &[0x77]).unwrap();
        session.set_breakpoint(0x0600).unwrap();
        session.detach().unwrap();
        let dev = device.lock().unwrap();
        assert_eq!(dev.mem[0x0600], 0x77);
        // Run mode restored on the way out.
        assert!(!dev.halted());
    }
}
