//! Partition state machine
//!
//! `missing/failed -> pending -> in_progress -> {succeeded | failed | quarantined}`.
//! Any state may re-enter `pending` through staleness or invalidation. A
//! `pending` or `in_progress` partition that never committed can be released
//! back to the state it held before the run.

use chrono::{DateTime, Utc};
use runway_core::PartitionState;

/// Lifecycle of one partition within a run
#[derive(Debug, Clone)]
pub struct StateMachine {
    prior_state: PartitionState,
    current_state: PartitionState,
    state_history: Vec<(PartitionState, DateTime<Utc>)>,
}

impl StateMachine {
    /// Start from the state stored in the catalog
    pub fn new(stored: PartitionState) -> Self {
        Self {
            prior_state: stored,
            current_state: stored,
            state_history: vec![(stored, Utc::now())],
        }
    }

    pub fn current_state(&self) -> PartitionState {
        self.current_state
    }

    /// State held before the run touched the partition
    pub fn prior_state(&self) -> PartitionState {
        self.prior_state
    }

    /// Transition to a new state
    pub fn transition(&mut self, new_state: PartitionState) -> Result<(), String> {
        if !self.is_valid_transition(new_state) {
            return Err(format!(
                "Invalid transition from {} to {}",
                self.current_state, new_state
            ));
        }

        self.current_state = new_state;
        self.state_history.push((new_state, Utc::now()));
        Ok(())
    }

    /// Return to the prior state; only valid before anything was committed
    pub fn release(&mut self) -> Result<PartitionState, String> {
        match self.current_state {
            PartitionState::Pending | PartitionState::InProgress => {
                self.current_state = self.prior_state;
                self.state_history.push((self.prior_state, Utc::now()));
                Ok(self.prior_state)
            }
            other => Err(format!("Cannot release partition in state {}", other)),
        }
    }

    fn is_valid_transition(&self, new_state: PartitionState) -> bool {
        use PartitionState::*;

        match (self.current_state, new_state) {
            (_, Pending) => true,
            (Pending, InProgress) => true,
            (InProgress, Succeeded | Failed | Quarantined) => true,
            _ => false,
        }
    }

    pub fn history(&self) -> &[(PartitionState, DateTime<Utc>)] {
        &self.state_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = StateMachine::new(PartitionState::Missing);
        assert!(sm.transition(PartitionState::Pending).is_ok());
        assert!(sm.transition(PartitionState::InProgress).is_ok());
        assert!(sm.transition(PartitionState::Succeeded).is_ok());
        assert_eq!(sm.history().len(), 4);
    }

    #[test]
    fn test_cannot_skip_pending() {
        let mut sm = StateMachine::new(PartitionState::Failed);
        assert!(sm.transition(PartitionState::InProgress).is_err());
        assert!(sm.transition(PartitionState::Succeeded).is_err());
    }

    #[test]
    fn test_succeeded_reenters_pending() {
        let mut sm = StateMachine::new(PartitionState::Succeeded);
        assert!(sm.transition(PartitionState::Pending).is_ok());
    }

    #[test]
    fn test_release_restores_prior_state() {
        let mut sm = StateMachine::new(PartitionState::Quarantined);
        sm.transition(PartitionState::Pending).unwrap();
        assert_eq!(sm.release().unwrap(), PartitionState::Quarantined);
        assert_eq!(sm.current_state(), PartitionState::Quarantined);
    }

    #[test]
    fn test_release_after_commit_is_rejected() {
        let mut sm = StateMachine::new(PartitionState::Missing);
        sm.transition(PartitionState::Pending).unwrap();
        sm.transition(PartitionState::InProgress).unwrap();
        sm.transition(PartitionState::Failed).unwrap();
        assert!(sm.release().is_err());
    }
}
