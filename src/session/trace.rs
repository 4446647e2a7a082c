//! Trace subsystem access, present on emulator builds only.

use crate::error::Error;
use crate::protocol::{TraceEvent, TraceFrame};

use super::Session;

/// Number of trace event comparator slots.
pub const TRACE_EVENT_SLOTS: u8 = 8;

impl Session {
    fn require_trace(&mut self, what: &'static str) -> Result<(), Error> {
        if self.policy()?.has_trace {
            Ok(())
        } else {
            Err(Error::feature_unavailable(
                what,
                "the trace subsystem only exists on emulator builds",
            ))
        }
    }

    fn require_event_slot(slot: u8, what: &'static str) -> Result<(), Error> {
        if slot < TRACE_EVENT_SLOTS {
            Ok(())
        } else {
            Err(Error::precondition(what, "event slot out of range"))
        }
    }

    /// The trace status register.
    pub fn trace_status(&mut self) -> Result<u8, Error> {
        self.require_trace("Cannot read trace status")?;
        self.link.read_trace_status()
    }

    /// The trace control register.
    pub fn trace_ctl(&mut self) -> Result<u8, Error> {
        self.require_trace("Cannot read trace control")?;
        self.link.read_trace_ctl()
    }

    /// Writes the trace control register.
    pub fn set_trace_ctl(&mut self, ctl: u8) -> Result<(), Error> {
        self.require_trace("Cannot write trace control")?;
        self.link.write_trace_ctl(ctl)
    }

    /// Reads the event comparator in `slot`.
    pub fn trace_event(&mut self, slot: u8) -> Result<TraceEvent, Error> {
        self.require_trace("Cannot read trace event")?;
        Self::require_event_slot(slot, "Cannot read trace event")?;
        self.link.read_trace_event(slot)
    }

    /// Programs the event comparator in `slot`.
    pub fn set_trace_event(&mut self, slot: u8, event: &TraceEvent) -> Result<(), Error> {
        self.require_trace("Cannot write trace event")?;
        Self::require_event_slot(slot, "Cannot write trace event")?;
        self.link.write_trace_event(slot, event)
    }

    /// Index of the next trace buffer frame to be written.
    pub fn trace_write_ptr(&mut self) -> Result<u16, Error> {
        self.require_trace("Cannot read trace write pointer")?;
        self.link.read_trace_write_ptr()
    }

    /// Reads `count` frames of the capture buffer starting at `address`.
    pub fn read_trace(&mut self, address: u16, count: u16) -> Result<Vec<TraceFrame>, Error> {
        self.require_trace("Cannot read trace buffer")?;
        self.require_stopped("Cannot read trace buffer")?;
        self.refresh_timeout()?;
        self.link.read_trace_buffer(address, count)
    }
}

#[cfg(test)]
mod tests {
    use crate::session::{Permissions, Session, SessionConfig};
    use crate::transport::FakeOcd;
    use crate::Error;

    fn session(revision: u16) -> Session {
        Session::attach(
            Box::new(FakeOcd::new(revision, 0x05)),
            SessionConfig::default(),
            Permissions::default(),
        )
        .unwrap()
    }

    #[test]
    fn trace_requires_an_emulator_build() {
        let mut session = session(0x0127);
        let err = session.trace_status().unwrap_err();
        assert!(matches!(err, Error::FeatureUnavailable { .. }));
        session.detach().unwrap();
    }

    #[test]
    fn trace_ctl_round_trip_on_emulator() {
        let mut session = session(0x8127);
        session.set_trace_ctl(0x41).unwrap();
        assert_eq!(session.trace_ctl().unwrap(), 0x41);
        session.detach().unwrap();
    }

    #[test]
    fn event_slot_is_bounded() {
        let mut session = session(0x8127);
        let err = session.trace_event(8).unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
        session.detach().unwrap();
    }

    #[test]
    fn trace_buffer_read_requires_stop() {
        let mut session = session(0x8127);
        session.stop().unwrap();
        let frames = session.read_trace(0, 4).unwrap();
        assert_eq!(frames.len(), 4);
        session.detach().unwrap();
    }
}
