//! Program memory access and the flash program/erase engine.
//!
//! Flash programming is monotonic: a write can only clear bits, so a page
//! needs an erase exactly when the new image wants a bit set that the old
//! one has clear. The writer works page by page against the shadow image,
//! erases only the pages that need it, skips bytes that already hold
//! their target value and verifies the result by CRC when the shadow was
//! trustworthy going in, or by byte readback when it was not.

use std::ops::Range;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::protocol::{regs, MEM_SIZE, PAGE_SIZE};

use super::{Cached, Session, VerifyPolicy, TRAP_OPCODE};

const PAGE_ERASE_TIMEOUT: Duration = Duration::from_secs(4);
const PAGE_ERASE_POLL: Duration = Duration::from_millis(10);
const MASS_ERASE_TIMEOUT: Duration = Duration::from_secs(20);
const MASS_ERASE_POLL: Duration = Duration::from_millis(200);
/// Behind read protect the flash status register cannot be polled; a
/// fixed wait covers the worst-case mass erase instead.
const PROTECTED_MASS_ERASE_WAIT: Duration = Duration::from_millis(500);

/// Flash status busy bits.
const FSTAT_PAGE_ERASE_BUSY: u8 = 0x10;
const FSTAT_MASS_ERASE_BUSY: u8 = 0x20;

/// Page select value addressing the information area.
const FPS_INFO: u8 = 0x80;

/// Write runs separated by fewer than this many unchanged bytes are
/// merged into one programming command.
const RUN_COALESCE_GAP: usize = 8;

impl Session {
    /// Reads program memory, serving from the shadow image whenever the
    /// device CRC proves it current.
    pub fn read_memory(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Error> {
        self.require_stopped("Cannot read program memory")?;
        self.require_unprotected("Cannot read program memory")?;
        let start = usize::from(address);
        let end = start + buf.len();
        if end > MEM_SIZE {
            return Err(Error::precondition(
                "Cannot read program memory",
                "address range exceeds the 64 KiB program space",
            ));
        }
        if buf.is_empty() {
            return Ok(());
        }

        if !self.config.memory_cache {
            return self.link.read_program_memory(address, buf);
        }

        if self.device_crc()? == self.shadow_crc()? {
            buf.copy_from_slice(&self.shadow[start..end]);
            return Ok(());
        }

        self.link.read_program_memory(address, buf)?;
        self.shadow[start..end].copy_from_slice(buf);
        self.invalidate(Cached::MEMCRC);
        Ok(())
    }

    /// Writes program memory through the flash controller.
    ///
    /// Pages are erased only when the new image sets a bit the old one
    /// has clear, unchanged bytes are skipped, and traps belonging to
    /// planted breakpoints stay planted (their recorded original byte
    /// follows the write instead).
    pub fn write_memory(&mut self, address: u16, data: &[u8]) -> Result<(), Error> {
        self.require_stopped("Cannot write program memory")?;
        self.require_unprotected("Cannot write program memory")?;
        if data.is_empty() {
            return Ok(());
        }
        let start = usize::from(address);
        let end = start + data.len();
        if end > MEM_SIZE {
            return Err(Error::precondition(
                "Cannot write program memory",
                "address range exceeds the 64 KiB program space",
            ));
        }
        let device_size = self.memory_size()? as usize;
        if device_size > 0 && end > device_size {
            return Err(Error::precondition(
                "Cannot write program memory",
                "address range exceeds the end of device flash",
            ));
        }

        let saved = self.save_flash_state()?;

        let first_page = start / PAGE_SIZE;
        let last_page = (end - 1) / PAGE_SIZE;
        let span = first_page * PAGE_SIZE..(last_page + 1) * PAGE_SIZE;

        // The erase decisions below are only as good as the shadow image;
        // refresh the affected pages unless the CRC vouches for it.
        let trusted = self.config.memory_cache && self.device_crc()? == self.shadow_crc()?;
        if !trusted {
            let mut fresh = vec![0u8; span.len()];
            self.link
                .read_program_memory(span.start as u16, &mut fresh)?;
            self.shadow[span.clone()].copy_from_slice(&fresh);
            self.invalidate(Cached::MEMCRC);
        }

        let mut merged = self.shadow[span.clone()].to_vec();
        merged[start - span.start..end - span.start].copy_from_slice(data);

        // Keep planted traps planted; the displaced byte tracks the new
        // image instead.
        for bp in &mut self.breakpoints {
            let at = usize::from(bp.address);
            if at >= start && at < end {
                bp.original = data[at - start];
                merged[at - span.start] = TRAP_OPCODE;
            }
        }

        for page in first_page..=last_page {
            let offset = page * PAGE_SIZE - span.start;
            let target = &merged[offset..offset + PAGE_SIZE];
            let current = &self.shadow[page * PAGE_SIZE..(page + 1) * PAGE_SIZE];

            let needs_erase = target
                .iter()
                .zip(current)
                .any(|(&new, &old)| old & new != new);
            let base: Vec<u8> = if needs_erase {
                vec![0xFF; PAGE_SIZE]
            } else {
                current.to_vec()
            };

            let runs = write_runs(target, &base);
            tracing::debug!(
                "flash page {page:#04x}: erase {needs_erase}, {} write runs",
                runs.len()
            );

            if needs_erase {
                self.flash_page_erase(page as u8)?;
            }
            if !runs.is_empty() {
                self.flash_setup(page as u8)?;
                for run in runs {
                    let run_addr = (page * PAGE_SIZE + run.start) as u16;
                    self.link
                        .write_program_memory(run_addr, &target[run])?;
                }
                self.flash_lock()?;
            }
        }

        self.shadow[span].copy_from_slice(&merged);
        self.invalidate(Cached::CRC | Cached::MEMCRC);

        self.restore_flash_state(saved)?;

        if trusted {
            let expected = self.shadow_crc()?;
            let device = self.device_crc()?;
            if device != expected {
                match self.config.verify {
                    VerifyPolicy::Strict => {
                        return Err(Error::verify(
                            "Program memory write failed",
                            "post-write crc does not match the expected image",
                        ));
                    }
                    VerifyPolicy::Warn => tracing::warn!(
                        "post-write crc mismatch: device {device:#06x}, expected {expected:#06x}"
                    ),
                }
            }
        } else {
            let first = first_page * PAGE_SIZE;
            let mut readback = vec![0u8; merged.len()];
            self.link.read_program_memory(first as u16, &mut readback)?;
            if readback != merged {
                return Err(Error::verify(
                    "Program memory write failed",
                    "readback does not match the written image",
                ));
            }
        }
        Ok(())
    }

    /// Erases all of program memory. Requires the erase-all permission;
    /// this is the one operation that also clears read protect (after the
    /// chip is reset).
    pub fn mass_erase(&mut self) -> Result<(), Error> {
        self.permissions
            .require_erase_all("Cannot mass erase program memory")?;
        self.require_stopped("Cannot mass erase program memory")?;
        let protected = self.is_protected()?;

        self.flash_setup(0x00)?;
        self.link
            .write_registers(regs::FCTL, &[regs::fctl::MASS_ERASE])?;

        if protected {
            thread::sleep(PROTECTED_MASS_ERASE_WAIT);
        } else {
            let begin = Instant::now();
            loop {
                let mut status = [0u8; 1];
                self.link.read_registers(regs::FCTL, &mut status)?;
                if status[0] & FSTAT_MASS_ERASE_BUSY == 0 {
                    break;
                }
                if begin.elapsed() >= MASS_ERASE_TIMEOUT {
                    return Err(Error::timeout(
                        "Mass erase failed",
                        "timeout waiting for the erase to complete",
                    ));
                }
                thread::sleep(MASS_ERASE_POLL);
            }
        }
        self.flash_lock()?;

        // Every trap went with the rest of flash.
        self.breakpoints.clear();
        self.tbreak = None;
        self.shadow.fill(0xFF);
        self.invalidate(Cached::CRC | Cached::MEMCRC | Cached::DBGSTAT);

        if protected {
            // Read protect latches until the option bytes reload.
            self.reset_chip()?;
        }
        Ok(())
    }

    /// Reads from the information area.
    pub fn read_info(&mut self, offset: u16, buf: &mut [u8]) -> Result<(), Error> {
        self.require_stopped("Cannot read information area")?;
        self.require_unprotected("Cannot read information area")?;
        let (base, window, via_data) = self.info_window()?;
        if usize::from(offset) + buf.len() > window {
            return Err(Error::precondition(
                "Cannot read information area",
                "address range exceeds the information page window",
            ));
        }
        if buf.is_empty() {
            return Ok(());
        }

        let saved = self.save_flash_state()?;
        self.link.write_registers(regs::FPS, &[FPS_INFO])?;
        let result = if via_data {
            self.link.read_data_memory(base + offset, buf)
        } else {
            self.link.read_program_memory(base + offset, buf)
        };
        self.restore_flash_state(saved)?;
        result
    }

    /// Writes to the information area, erasing the page first when the
    /// new bytes need bits set.
    pub fn write_info(&mut self, offset: u16, data: &[u8]) -> Result<(), Error> {
        self.require_stopped("Cannot write information area")?;
        self.require_unprotected("Cannot write information area")?;
        if data.is_empty() {
            return Ok(());
        }
        let (base, window, via_data) = self.info_window()?;
        let off = usize::from(offset);
        if off + data.len() > window {
            return Err(Error::precondition(
                "Cannot write information area",
                "address range exceeds the information page window",
            ));
        }

        let saved = self.save_flash_state()?;
        self.link.write_registers(regs::FPS, &[FPS_INFO])?;

        let mut merged = vec![0u8; window];
        if via_data {
            self.link.read_data_memory(base, &mut merged)?;
        } else {
            self.link.read_program_memory(base, &mut merged)?;
        }
        let needs_erase = data
            .iter()
            .zip(&merged[off..])
            .any(|(&new, &old)| old & new != new);
        merged[off..off + data.len()].copy_from_slice(data);

        if needs_erase {
            self.flash_page_erase(FPS_INFO)?;
        }
        self.flash_setup(FPS_INFO)?;
        if needs_erase {
            // The erase took the whole window; rewrite all of it.
            if via_data {
                self.link.write_data_memory(base, &merged)?;
            } else {
                self.link.write_program_memory(base, &merged)?;
            }
        } else if via_data {
            self.link.write_data_memory(base + offset, data)?;
        } else {
            self.link.write_program_memory(base + offset, data)?;
        }
        self.flash_lock()?;

        let mut readback = vec![0u8; window];
        if via_data {
            self.link.read_data_memory(base, &mut readback)?;
        } else {
            self.link.read_program_memory(base, &mut readback)?;
        }
        self.restore_flash_state(saved)?;
        if readback != merged {
            return Err(Error::verify(
                "Information area write failed",
                "readback does not match the written image",
            ));
        }
        Ok(())
    }

    /// Writes `serial` into the information area at `offset`, then steps
    /// it (big-endian) to the value for the next device. A serial at the
    /// end of its number space is left unchanged and reported as an
    /// error.
    pub fn stamp_serial_number(&mut self, offset: u16, serial: &mut [u8]) -> Result<(), Error> {
        self.write_info(offset, serial)?;
        increment_serial(serial)
    }

    /// Where the information page is mapped for this revision: window
    /// base, window size and whether it sits in the external-data space.
    fn info_window(&mut self) -> Result<(u16, usize, bool), Error> {
        Ok(if self.policy()?.info_via_data_window {
            (0xFF80, 0x80, true)
        } else {
            (0xFE00, PAGE_SIZE, false)
        })
    }

    /// Snapshot of the flash controller state (status and page select).
    pub(crate) fn save_flash_state(&mut self) -> Result<[u8; 2], Error> {
        let mut state = [0u8; 2];
        self.link.read_registers(regs::FCTL, &mut state)?;
        Ok(state)
    }

    /// Puts the page select back if the operation moved it.
    pub(crate) fn restore_flash_state(&mut self, saved: [u8; 2]) -> Result<(), Error> {
        let mut current = [0u8; 2];
        self.link.read_registers(regs::FCTL, &mut current)?;
        if current[1] != saved[1] {
            self.link.write_registers(regs::FPS, &[saved[1]])?;
        }
        Ok(())
    }

    /// Selects `page`, programs the frequency registers and runs the
    /// two-code unlock sequence.
    pub(crate) fn flash_setup(&mut self, page: u8) -> Result<(), Error> {
        let freq = self.cached_freq_khz()?;
        self.link.write_registers(regs::FPS, &[page])?;
        self.link
            .write_registers(regs::FCTL + 2, &freq.to_be_bytes())?;
        self.link
            .write_registers(regs::FCTL, &[regs::fctl::UNLOCK_0])?;
        self.link
            .write_registers(regs::FCTL, &[regs::fctl::UNLOCK_1])?;

        let mut status = [0u8; 1];
        self.link.read_registers(regs::FCTL, &mut status)?;
        if status[0] & regs::fctl::UNLOCKED == 0 {
            return Err(Error::link(
                "Unlock flash controller failed",
                "controller does not report the unlocked state",
            ));
        }
        Ok(())
    }

    pub(crate) fn flash_lock(&mut self) -> Result<(), Error> {
        self.link.write_registers(regs::FCTL, &[regs::fctl::LOCK])
    }

    /// Erases one 512 byte page and waits out the busy bit.
    fn flash_page_erase(&mut self, page: u8) -> Result<(), Error> {
        self.flash_setup(page)?;
        self.link
            .write_registers(regs::FCTL, &[regs::fctl::PAGE_ERASE])?;

        let begin = Instant::now();
        loop {
            let mut status = [0u8; 1];
            self.link.read_registers(regs::FCTL, &mut status)?;
            if status[0] & FSTAT_PAGE_ERASE_BUSY == 0 {
                break;
            }
            if begin.elapsed() >= PAGE_ERASE_TIMEOUT {
                return Err(Error::timeout(
                    "Page erase failed",
                    "timeout waiting for the erase to complete",
                ));
            }
            thread::sleep(PAGE_ERASE_POLL);
        }
        self.flash_lock()
    }
}

/// The byte ranges of `target` that differ from `current`, with nearby
/// runs coalesced into one programming command.
fn write_runs(target: &[u8], current: &[u8]) -> Vec<Range<usize>> {
    let mut runs: Vec<Range<usize>> = Vec::new();
    for (i, (&new, &old)) in target.iter().zip(current).enumerate() {
        if new == old {
            continue;
        }
        match runs.last_mut() {
            Some(run) if i - run.end < RUN_COALESCE_GAP => run.end = i + 1,
            _ => runs.push(i..i + 1),
        }
    }
    runs
}

fn increment_serial(serial: &mut [u8]) -> Result<(), Error> {
    for byte in serial.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            return Ok(());
        }
    }
    // Only an all-0xFF serial carries out of the top byte; put it back.
    serial.fill(0xFF);
    Err(Error::precondition(
        "Increment serial number failed",
        "serial number space is exhausted",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_split_on_large_gaps_only() {
        let mut target = vec![0xFFu8; 64];
        let current = vec![0xFFu8; 64];
        target[0] = 0x11;
        target[5] = 0x22; // 4 byte gap, coalesced
        target[20] = 0x33; // 14 byte gap, new run
        let runs = write_runs(&target, &current);
        assert_eq!(runs, vec![0..6, 20..21]);
    }

    #[test]
    fn identical_image_needs_no_runs() {
        let image = vec![0xA5u8; 512];
        assert!(write_runs(&image, &image).is_empty());
    }

    #[test]
    fn serial_increment_carries_big_endian() {
        let mut serial = [0x00, 0x00, 0xFF];
        increment_serial(&mut serial).unwrap();
        assert_eq!(serial, [0x00, 0x01, 0x00]);

        let mut serial = [0x12, 0xFF, 0xFF];
        increment_serial(&mut serial).unwrap();
        assert_eq!(serial, [0x13, 0x00, 0x00]);
    }

    #[test]
    fn serial_increment_refuses_to_wrap() {
        let mut serial = [0xFF, 0xFF];
        let err = increment_serial(&mut serial).unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
        assert_eq!(serial, [0xFF, 0xFF]);
    }
}
