//! Child-side outcome carried in the exit code

use std::fmt;

/// Bit set the child reports through its exit code; `0` means success
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChildOutcome(u8);

impl ChildOutcome {
    /// Everything succeeded
    pub const OK: Self = Self(0);
    /// The child's bind or unmount failed
    pub const MUTATION_FAILED: Self = Self(0b0000_0001);
    /// First visibility check failed
    pub const PHASE1_MISMATCH: Self = Self(0b0000_0010);
    /// Second visibility check failed
    pub const PHASE2_MISMATCH: Self = Self(0b0000_0100);
    /// A checkpoint wait or wake failed or timed out
    pub const CHECKPOINT_FAILED: Self = Self(0b0000_1000);
    /// Child-side setup (e.g. demoting to slave) failed
    pub const SETUP_FAILED: Self = Self(0b0001_0000);

    const ALL: u8 = 0b0001_1111;

    /// Decode an exit code; `None` for codes the child never produces
    #[must_use]
    pub fn from_exit_code(code: i32) -> Option<Self> {
        u8::try_from(code)
            .ok()
            .filter(|bits| bits & !Self::ALL == 0)
            .map(Self)
    }

    /// Exit code for this outcome
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        self.0 as i32
    }

    /// Add a flag
    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Check if flag is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Whether no flag is set
    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Whether the outcome means the child could not run the protocol
    #[must_use]
    pub const fn is_broken(self) -> bool {
        self.0 & (Self::MUTATION_FAILED.0 | Self::CHECKPOINT_FAILED.0 | Self::SETUP_FAILED.0) != 0
    }
}

impl std::ops::BitOr for ChildOutcome {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for ChildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return f.write_str("ok");
        }

        let names = [
            (Self::MUTATION_FAILED, "mutation failed"),
            (Self::PHASE1_MISMATCH, "phase 1 mismatch"),
            (Self::PHASE2_MISMATCH, "phase 2 mismatch"),
            (Self::CHECKPOINT_FAILED, "checkpoint failed"),
            (Self::SETUP_FAILED, "setup failed"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&set.join(", "))
    }
}
