//! Revision-dependent device policy.
//!
//! The on-chip debugger behaves differently across silicon steppings:
//! memory size encodings differ per family, the oldest revisions lack the
//! hardware PC-compare/counter breakpoint and the baud reload register,
//! and one revision needs an interrupt-controller workaround around
//! single-step. Rather than scattering revision checks through the
//! debugger, all of that knowledge lives in this one pure lookup.

/// Decode table from the 3-bit memory-size field to a byte count.
type SizeTable = [u32; 8];

/// 2k/4k/8k/16k/24k/32k/48k/64k, the 64k-class family.
const SIZES_64K_CLASS: SizeTable = [
    0x0800, 0x1000, 0x2000, 0x4000, 0x6000, 0x8000, 0xC000, 0x1_0000,
];

/// 1k/2k/4k/8k/16k/32k/64k/64k, the small-flash family.
const SIZES_SMALL_CLASS: SizeTable = [
    0x0400, 0x0800, 0x1000, 0x2000, 0x4000, 0x8000, 0x1_0000, 0x1_0000,
];

/// Small-flash decode with a 12k part in the otherwise unused code 7.
const SIZES_SMALL_12K: SizeTable = [
    0x0400, 0x0800, 0x1000, 0x2000, 0x4000, 0x8000, 0x1_0000, 0x3000,
];

/// Small-flash decode with a 24k part in code 7.
const SIZES_SMALL_24K: SizeTable = [
    0x0400, 0x0800, 0x1000, 0x2000, 0x4000, 0x8000, 0x1_0000, 0x6000,
];

/// Behavioral parameters of one debugger revision.
///
/// Built once per session from the revision ID and consulted wherever
/// behavior depends on the stepping. An unknown revision yields a policy
/// with every capability absent and a memory size of zero rather than an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionPolicy {
    /// Revision with the emulator bit masked off.
    pub revision: u16,
    /// `None` for unknown revisions.
    size_table: Option<&'static SizeTable>,
    /// Whether the baud reload register exists. Older revisions return
    /// garbage for the read, so it must not even be issued.
    pub has_reload: bool,
    /// Whether the hardware PC-compare and counter breakpoints exist.
    /// Without them, "run to address" falls back to a temporary software
    /// breakpoint and "run for N clocks" is unavailable.
    pub has_hw_breakpoint: bool,
    /// Whether the part can re-enter run mode while read protect is
    /// enabled. The earliest three revisions cannot.
    pub can_run_protected: bool,
    /// Whether single-step must save/mask/restore the interrupt
    /// controller to work around the pending-interrupt erratum.
    pub step_irq_erratum: bool,
    /// Emulator build with the trace subsystem (high bit of the ID).
    pub has_trace: bool,
    /// Whether the information area is reached through the external-data
    /// window at 0xFF80 instead of the program-memory window at 0xFE00.
    pub info_via_data_window: bool,
}

impl RevisionPolicy {
    /// Looks up the policy for a raw revision ID.
    pub fn lookup(revision_id: u16) -> Self {
        let has_trace = revision_id & 0x8000 != 0;
        let revision = revision_id & 0x7FFF;

        let size_table = match revision {
            0x0100 | 0x0110 | 0x0120 | 0x0121 | 0x0122 | 0x0123 | 0x0125 | 0x0126 | 0x0127
            | 0x012B | 0x012C | 0x012D => Some(&SIZES_64K_CLASS),
            0x0124 | 0x0128 | 0x012A | 0x012E | 0x012F => Some(&SIZES_SMALL_CLASS),
            0x0130 => Some(&SIZES_SMALL_12K),
            0x0131 => Some(&SIZES_SMALL_24K),
            _ => None,
        };
        let known = size_table.is_some();

        RevisionPolicy {
            revision,
            size_table,
            has_reload: matches!(revision, 0x0126 | 0x012D),
            has_hw_breakpoint: known && !matches!(revision, 0x0100 | 0x0110),
            can_run_protected: known && !matches!(revision, 0x0100 | 0x0110 | 0x0120),
            step_irq_erratum: revision == 0x0100,
            has_trace,
            info_via_data_window: revision == 0x0100,
        }
    }

    /// Decodes the raw memory-size register into a byte count. Unknown
    /// revisions always decode to zero.
    pub fn memory_size(&self, size_code: u8) -> u32 {
        match self.size_table {
            Some(table) => table[usize::from(size_code & 0x07)],
            None => 0,
        }
    }

    /// Whether this revision is known to the policy table at all.
    pub fn known(&self) -> bool {
        self.size_table.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN_REVISIONS: &[u16] = &[
        0x0100, 0x0110, 0x0120, 0x0121, 0x0122, 0x0123, 0x0124, 0x0125, 0x0126, 0x0127, 0x0128,
        0x012A, 0x012B, 0x012C, 0x012D, 0x012E, 0x012F, 0x0130, 0x0131,
    ];

    #[test]
    fn unknown_revision_has_nothing() {
        for id in [0x0000u16, 0x0200, 0x7FFF, 0x0129] {
            let policy = RevisionPolicy::lookup(id);
            assert!(!policy.known());
            assert!(!policy.has_reload);
            assert!(!policy.has_hw_breakpoint);
            assert!(!policy.can_run_protected);
            for code in 0..8 {
                assert_eq!(policy.memory_size(code), 0);
            }
        }
    }

    #[test]
    fn known_sizes_are_sane() {
        for &id in KNOWN_REVISIONS {
            let policy = RevisionPolicy::lookup(id);
            for code in 0..8u8 {
                let size = policy.memory_size(code);
                assert!(size >= 0x0400 && size <= 0x1_0000, "rev {id:#06x} code {code}");
                // Whole number of 512 byte pages.
                assert_eq!(size % 512, 0);
            }
        }
    }

    #[test]
    fn family_decode_differences() {
        let large = RevisionPolicy::lookup(0x0127);
        assert_eq!(large.memory_size(0), 0x0800);
        assert_eq!(large.memory_size(4), 0x6000);
        assert_eq!(large.memory_size(7), 0x1_0000);

        let small = RevisionPolicy::lookup(0x0128);
        assert_eq!(small.memory_size(0), 0x0400);
        assert_eq!(small.memory_size(6), 0x1_0000);
        assert_eq!(small.memory_size(7), 0x1_0000);

        assert_eq!(RevisionPolicy::lookup(0x0130).memory_size(7), 0x3000);
        assert_eq!(RevisionPolicy::lookup(0x0131).memory_size(7), 0x6000);
    }

    #[test]
    fn emulator_bit_is_masked_for_decode_but_flags_trace() {
        let policy = RevisionPolicy::lookup(0x8127);
        assert!(policy.has_trace);
        assert_eq!(policy.revision, 0x0127);
        assert_eq!(policy.memory_size(0), 0x0800);
        assert!(!RevisionPolicy::lookup(0x0127).has_trace);
    }

    #[test]
    fn capability_matrix() {
        // Oldest revisions: no hardware breakpoint, no reload, no re-entry
        // from read protect.
        for id in [0x0100u16, 0x0110] {
            let policy = RevisionPolicy::lookup(id);
            assert!(!policy.has_hw_breakpoint);
            assert!(!policy.has_reload);
            assert!(!policy.can_run_protected);
        }
        assert!(!RevisionPolicy::lookup(0x0120).can_run_protected);
        assert!(RevisionPolicy::lookup(0x0121).can_run_protected);

        assert!(RevisionPolicy::lookup(0x0126).has_reload);
        assert!(RevisionPolicy::lookup(0x012D).has_reload);
        assert!(!RevisionPolicy::lookup(0x0127).has_reload);

        assert!(RevisionPolicy::lookup(0x0100).step_irq_erratum);
        assert!(!RevisionPolicy::lookup(0x0110).step_irq_erratum);

        assert!(RevisionPolicy::lookup(0x0100).info_via_data_window);
        assert!(!RevisionPolicy::lookup(0x0127).info_via_data_window);
    }
}
