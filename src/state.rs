//! Forward-cyclic device state machines.
//!
//! A [`StateMachine`] is an ordered ring of states, each paired with the sample
//! value that moves the machine into it. [`StateMachine::update`] only ever looks
//! at the immediate successor of the current state: if the sample equals the
//! successor's trigger value the machine advances one step (wrapping from the last
//! state back to the first), otherwise nothing happens. Hardware sequences such as
//! "shutter opens, frame scans, shutter closes" are modelled this way because the
//! devices only ever move forward one phase at a time.
//!
//! Transitions are serialized by a per-machine lock. Reading the current state
//! is a lock-free load of the state index.

use crate::error::{AppResult, BeamlineError};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A forward-cyclic automaton over states `S` driven by samples `V`.
pub struct StateMachine<S, V> {
    name: String,
    states: Vec<S>,
    triggers: Vec<V>,
    current: AtomicUsize,
    last_sample: Mutex<Option<V>>,
}

impl<S: Debug, V: Debug> Debug for StateMachine<S, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("current", &self.states[self.current.load(Ordering::Acquire)])
            .field("states", &self.states)
            .field("triggers", &self.triggers)
            .finish_non_exhaustive()
    }
}

impl<S, V> StateMachine<S, V>
where
    S: Clone + PartialEq + Debug,
    V: Clone + PartialEq,
{
    /// Build a machine over `states`, where entering `states[i]` requires the
    /// sample `triggers[i]`.
    ///
    /// Fails with [`BeamlineError::InconsistentStates`] when the two tables differ
    /// in length (or are empty) and with [`BeamlineError::InvalidState`] when
    /// `initial` is not one of `states`.
    pub fn new(
        name: impl Into<String>,
        states: Vec<S>,
        triggers: Vec<V>,
        initial: S,
    ) -> AppResult<Self> {
        let name = name.into();
        if states.len() != triggers.len() || states.is_empty() {
            return Err(BeamlineError::InconsistentStates {
                states: states.len(),
                values: triggers.len(),
            });
        }
        let index = states
            .iter()
            .position(|s| *s == initial)
            .ok_or_else(|| BeamlineError::InvalidState {
                machine: name.clone(),
                state: format!("{initial:?}"),
            })?;
        let sample = triggers[index].clone();

        Ok(Self {
            name,
            states,
            triggers,
            current: AtomicUsize::new(index),
            last_sample: Mutex::new(Some(sample)),
        })
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All states in cyclic order.
    pub fn states(&self) -> &[S] {
        &self.states
    }

    fn index(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Current state. Lock-free.
    pub fn current(&self) -> S {
        self.states[self.index()].clone()
    }

    /// Whether the machine is currently in `state`.
    pub fn is(&self, state: &S) -> bool {
        self.states[self.index()] == *state
    }

    /// The state `update` would advance to.
    pub fn next(&self) -> S {
        self.states[(self.index() + 1) % self.states.len()].clone()
    }

    /// The most recent sample that moved (or forced) the machine.
    pub fn trigger(&self) -> Option<V> {
        self.last_sample.lock().clone()
    }

    /// Force the machine into `state`, recording its trigger value as the last sample.
    ///
    /// The machine continues cycling normally from there.
    pub fn change_state(&self, state: &S) -> AppResult<()> {
        let index = self
            .states
            .iter()
            .position(|s| s == state)
            .ok_or_else(|| BeamlineError::InvalidState {
                machine: self.name.clone(),
                state: format!("{state:?}"),
            })?;

        let mut sample = self.last_sample.lock();
        *sample = Some(self.triggers[index].clone());
        self.current.store(index, Ordering::Release);
        tracing::debug!(machine = %self.name, state = ?self.states[index], "State forced");
        Ok(())
    }

    /// Feed one sample. Advances to the successor state when `value` equals its
    /// trigger value and returns whether a transition happened.
    pub fn update(&self, value: &V) -> bool {
        let mut sample = self.last_sample.lock();
        let next = (self.index() + 1) % self.states.len();
        if self.triggers[next] != *value {
            return false;
        }
        *sample = Some(value.clone());
        self.current.store(next, Ordering::Release);
        tracing::trace!(machine = %self.name, state = ?self.states[next], "State advanced");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        A,
        B,
        C,
    }

    fn machine() -> StateMachine<Phase, i32> {
        StateMachine::new("test", vec![Phase::A, Phase::B, Phase::C], vec![0, 1, 2], Phase::A)
            .unwrap()
    }

    #[test]
    fn advances_only_on_successor_trigger() {
        let sm = machine();
        assert!(!sm.update(&0));
        assert!(!sm.update(&2));
        assert_eq!(sm.current(), Phase::A);

        assert!(sm.update(&1));
        assert_eq!(sm.current(), Phase::B);
        assert!(sm.update(&2));
        assert_eq!(sm.current(), Phase::C);
        assert!(sm.update(&0));
        assert_eq!(sm.current(), Phase::A);
        assert_eq!(sm.trigger(), Some(0));
    }

    #[test]
    fn repeated_sample_does_not_skip_ahead() {
        let sm = machine();
        assert!(sm.update(&1));
        assert!(!sm.update(&1));
        assert_eq!(sm.current(), Phase::B);
    }

    #[test]
    fn forced_state_participates_in_cycle() {
        let sm = machine();
        sm.change_state(&Phase::B).unwrap();
        assert_eq!(sm.current(), Phase::B);
        assert_eq!(sm.trigger(), Some(1));
        assert!(sm.update(&2));
        assert_eq!(sm.current(), Phase::C);
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Named {
        Idle,
        Busy,
        Elsewhere,
    }

    #[test]
    fn forcing_unknown_state_fails() {
        let sm = StateMachine::new("named", vec![Named::Idle, Named::Busy], vec![0, 1], Named::Idle)
            .unwrap();
        let err = sm.change_state(&Named::Elsewhere).unwrap_err();
        assert!(matches!(err, BeamlineError::InvalidState { .. }));
        assert_eq!(sm.current(), Named::Idle);
    }

    #[test]
    fn construction_checks_tables() {
        let mismatched = StateMachine::new("bad", vec![Phase::A, Phase::B], vec![0], Phase::A);
        assert!(matches!(
            mismatched,
            Err(BeamlineError::InconsistentStates { states: 2, values: 1 })
        ));

        let bad_initial = StateMachine::new("bad", vec![Phase::A, Phase::B], vec![0, 1], Phase::C);
        assert!(matches!(bad_initial, Err(BeamlineError::InvalidState { .. })));
    }

    #[test]
    fn concurrent_updates_step_once_per_trigger() {
        let sm = Arc::new(machine());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sm = sm.clone();
                std::thread::spawn(move || sm.update(&1))
            })
            .collect();
        let advanced = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|a| *a)
            .count();
        assert_eq!(advanced, 1);
        assert_eq!(sm.current(), Phase::B);
    }
}
