// Transaction Lifecycle
//
// Tracks the per-slot state machine of a batched transaction.
// This module is pure, deterministic, and side-effect free.

use serde::{Deserialize, Serialize};

/// Coordinator-allocated transaction identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TxnId(pub u64);

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a single transaction slot.
///
/// NOTE:
/// `Committed` and `Aborted` are terminal. A slot never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Allocated but not yet activated.
    Inactive,

    /// Currently eligible for writes.
    Open,

    /// Committed, no longer writable.
    Committed,

    /// Aborted, buffered writes discarded.
    Aborted,
}

/// Errors produced during slot transitions.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal transaction transition: {0}")]
    IllegalTransition(String),
}

/// Stateful reducer for one transaction slot.
#[derive(Debug)]
pub struct TxnSlot {
    id: TxnId,
    state: TxnState,
}

impl TxnSlot {
    /// Create a slot for a freshly allocated transaction.
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: TxnState::Inactive,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Activate the slot.
    pub fn open(&mut self) -> Result<(), StateError> {
        self.advance(TxnState::Open)
    }

    /// Resolve the slot as committed.
    pub fn commit(&mut self) -> Result<(), StateError> {
        self.advance(TxnState::Committed)
    }

    /// Resolve the slot as aborted.
    pub fn abort(&mut self) -> Result<(), StateError> {
        self.advance(TxnState::Aborted)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TxnState::Committed | TxnState::Aborted)
    }

    fn advance(&mut self, target: TxnState) -> Result<(), StateError> {
        use TxnState::*;

        self.state = match (self.state, target) {
            // Activation
            (Inactive, Open) => Open,

            // Resolution of the open slot
            (Open, Committed) => Committed,
            (Open, Aborted) => Aborted,

            // Anything else is illegal
            (state, target) => {
                return Err(StateError::IllegalTransition(format!(
                    "transaction {} cannot move from {:?} to {:?}",
                    self.id, state, target
                )))
            }
        };

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_lifecycle() {
        let mut slot = TxnSlot::new(TxnId(7));
        assert_eq!(slot.state(), TxnState::Inactive);

        slot.open().unwrap();
        assert_eq!(slot.state(), TxnState::Open);
        assert!(!slot.is_terminal());

        slot.commit().unwrap();
        assert_eq!(slot.state(), TxnState::Committed);
        assert!(slot.is_terminal());
    }

    #[test]
    fn abort_lifecycle() {
        let mut slot = TxnSlot::new(TxnId(8));
        slot.open().unwrap();
        slot.abort().unwrap();
        assert_eq!(slot.state(), TxnState::Aborted);
        assert!(slot.is_terminal());
    }

    #[test]
    fn resolving_an_inactive_slot_is_rejected() {
        let mut slot = TxnSlot::new(TxnId(9));

        let err = slot.commit().unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition(_)));
    }

    #[test]
    fn terminal_states_are_final() {
        let mut slot = TxnSlot::new(TxnId(10));
        slot.open().unwrap();
        slot.commit().unwrap();

        assert!(slot.open().is_err());
        assert!(slot.abort().is_err());
        assert_eq!(slot.state(), TxnState::Committed);
    }

    #[test]
    fn reopening_an_open_slot_is_rejected() {
        let mut slot = TxnSlot::new(TxnId(11));
        slot.open().unwrap();

        let err = slot.open().unwrap_err();
        assert!(err.to_string().contains("cannot move from Open"));
    }
}
