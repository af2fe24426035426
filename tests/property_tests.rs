//! Property-Based Tests
//!
//! These tests verify:
//! - The transition table never mutates state on a rejected operation
//! - History records exactly the accepted state changes
//! - Registry positions stay consistent with step identities under edits

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;

use snippet_sequencer::simulated::{ActivityLog, SimulatedStep};
use snippet_sequencer::{SequenceContext, SequenceOperation, SequenceRegistry, SequenceState};

// =============================================================================
// State table
// =============================================================================

fn operation_strategy() -> impl Strategy<Value = SequenceOperation> {
    prop::sample::select(SequenceOperation::iter().collect::<Vec<_>>())
}

fn state_strategy() -> impl Strategy<Value = SequenceState> {
    prop::sample::select(SequenceState::iter().collect::<Vec<_>>())
}

proptest! {
    /// Rejected operations leave the context untouched; accepted ones are
    /// recorded only when the state actually changes.
    #[test]
    fn rejected_operations_never_mutate(ops in prop::collection::vec(operation_strategy(), 0..64)) {
        let mut ctx = SequenceContext::new();
        let mut changes = 0;

        for op in ops {
            let before = ctx.current();
            match ctx.apply(op) {
                Ok(next) => {
                    prop_assert_eq!(ctx.current(), next);
                    if next != before {
                        changes += 1;
                    }
                }
                Err(_) => prop_assert_eq!(ctx.current(), before),
            }
        }

        prop_assert_eq!(ctx.transition_history().len(), changes);
    }

    /// Run-scoped operations are only ever accepted while a run is active.
    #[test]
    fn run_operations_require_active_state(state in state_strategy()) {
        for op in [
            SequenceOperation::Stop,
            SequenceOperation::Skip,
            SequenceOperation::Repeat,
            SequenceOperation::ReturnToPrevious,
            SequenceOperation::StepCompleted,
        ] {
            prop_assert_eq!(state.transition(op).is_ok(), state.is_active());
        }
    }

    /// A stopped sequence can only be left through Restart (or stays put).
    #[test]
    fn stopped_only_leaves_through_restart(op in operation_strategy()) {
        if let Ok(next) = SequenceState::Stopped.transition(op) {
            prop_assert_eq!(op, SequenceOperation::Restart);
            prop_assert_eq!(next, SequenceState::Restarting);
        }
    }
}

// =============================================================================
// Registry renumbering
// =============================================================================

fn registry_with(count: usize, log: &ActivityLog) -> SequenceRegistry {
    let mut registry = SequenceRegistry::new();
    for n in 0..count {
        registry.push_step(Arc::new(SimulatedStep::new(
            format!("s{}", n),
            Duration::from_millis(1),
            log.clone(),
        )));
    }
    registry
}

fn assert_consistent(registry: &SequenceRegistry) -> Result<(), TestCaseError> {
    for (position, entry) in registry.steps().iter().enumerate() {
        prop_assert_eq!(registry.position_of(entry.id), Some(position));
    }
    Ok(())
}

proptest! {
    /// Inserting never reorders the steps that were already there.
    #[test]
    fn insert_preserves_relative_order(
        initial in 1usize..8,
        inserts in prop::collection::vec(0usize..32, 0..8),
    ) {
        let log = ActivityLog::new();
        let mut registry = registry_with(initial, &log);
        let original = registry.step_ids();

        for raw in inserts {
            let position = raw % (registry.len() + 1);
            registry
                .insert_step(position, Arc::new(SimulatedStep::new("new", Duration::ZERO, log.clone())))
                .expect("in range");
            assert_consistent(&registry)?;
        }

        let survivors: Vec<_> = registry
            .step_ids()
            .into_iter()
            .filter(|id| original.contains(id))
            .collect();
        prop_assert_eq!(survivors, original);
    }

    /// Removing keeps every remaining identity at a consistent position and
    /// leaves no scoped constraint without its owner.
    #[test]
    fn remove_keeps_positions_consistent(
        initial in 1usize..10,
        removals in prop::collection::vec(0usize..32, 0..10),
    ) {
        let log = ActivityLog::new();
        let mut registry = registry_with(initial, &log);
        for id in registry.step_ids() {
            registry
                .add_constraint(
                    snippet_sequencer::ConstraintScope::Scoped(id),
                    Arc::new(snippet_sequencer::simulated::LoggingConstraint::new("zone", log.clone())),
                )
                .expect("owner exists");
        }

        for raw in removals {
            if registry.is_empty() {
                break;
            }
            let position = raw % registry.len();
            registry.remove_step(position).expect("in range");
            assert_consistent(&registry)?;
        }

        prop_assert_eq!(registry.constraints().len(), registry.len());
        for constraint in registry.constraints() {
            let owner = constraint.scope.owner().expect("scoped");
            prop_assert!(registry.contains_step(owner));
        }
    }
}
