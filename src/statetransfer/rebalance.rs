//! Rebalance protocol selection and phase progression.
//!
//! ```text
//!   NO_REBALANCE ──► READ_OLD_WRITE_ALL ──► READ_ALL_WRITE_ALL
//!        ▲                                         │
//!        └──────────── READ_NEW_WRITE_ALL ◄────────┘
//! ```
//!
//! Each arrow out of a rebalance phase is taken by the coordinator once
//! every member confirmed the phase.

use crate::topology::Phase;

/// How a cache moves data when membership changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceType {
    /// No data movement.
    None,
    /// Four-phase rebalance with per-phase confirmation.
    FourPhase,
}

impl RebalanceType {
    /// Whether members must confirm `phase` before the coordinator moves on.
    pub fn requires_confirmation(&self, phase: Phase) -> bool {
        match self {
            RebalanceType::None => false,
            RebalanceType::FourPhase => phase.is_rebalance(),
        }
    }

    /// Phase following `phase` once confirmed.
    pub fn next_phase(&self, phase: Phase) -> Phase {
        match (self, phase) {
            (RebalanceType::None, _) => Phase::NoRebalance,
            (RebalanceType::FourPhase, Phase::ReadOldWriteAll) => Phase::ReadAllWriteAll,
            (RebalanceType::FourPhase, Phase::ReadAllWriteAll) => Phase::ReadNewWriteAll,
            (RebalanceType::FourPhase, Phase::ReadNewWriteAll) => Phase::NoRebalance,
            (RebalanceType::FourPhase, Phase::ConflictResolution) => Phase::NoRebalance,
            (RebalanceType::FourPhase, Phase::NoRebalance) => Phase::ReadOldWriteAll,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_four_phase_cycle() {
        let rt = RebalanceType::FourPhase;
        let mut phase = Phase::NoRebalance;
        let mut seen = vec![phase];
        for _ in 0..4 {
            phase = rt.next_phase(phase);
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                Phase::NoRebalance,
                Phase::ReadOldWriteAll,
                Phase::ReadAllWriteAll,
                Phase::ReadNewWriteAll,
                Phase::NoRebalance,
            ]
        );
    }

    #[test]
    fn test_confirmation_required_only_for_rebalance_phases() {
        let rt = RebalanceType::FourPhase;
        assert!(rt.requires_confirmation(Phase::ReadOldWriteAll));
        assert!(rt.requires_confirmation(Phase::ReadAllWriteAll));
        assert!(rt.requires_confirmation(Phase::ReadNewWriteAll));
        assert!(!rt.requires_confirmation(Phase::NoRebalance));
        assert!(!rt.requires_confirmation(Phase::ConflictResolution));
        assert!(!RebalanceType::None.requires_confirmation(Phase::ReadOldWriteAll));
        assert_eq!(
            RebalanceType::None.next_phase(Phase::ReadAllWriteAll),
            Phase::NoRebalance
        );
    }
}
