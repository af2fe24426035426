//! Sequence registry: the ordered steps and their constraints.
//!
//! Ordinal positions are the indices of the step vector, so they are always
//! `0..N-1` without gaps; every insert/remove implicitly renumbers the steps
//! after the mutation point. Everything that must survive renumbering (the UI
//! selection, a scoped constraint's owner, the engine's current step) is held
//! by [`StepId`], never by position.

use std::sync::Arc;
use tracing::debug;

use crate::constraint::{Constraint, ConstraintScope};
use crate::error::{Result, SequencerError};
use crate::ids::{ConstraintId, StepId};
use crate::step::ExecutableStep;

/// One step of the sequence.
#[derive(Debug, Clone)]
pub struct StepEntry {
    pub id: StepId,
    pub step: Arc<dyn ExecutableStep>,
}

impl StepEntry {
    pub fn name(&self) -> &str {
        self.step.name()
    }
}

/// One registered constraint.
#[derive(Debug, Clone)]
pub struct ConstraintEntry {
    pub id: ConstraintId,
    pub scope: ConstraintScope,
    pub constraint: Arc<dyn Constraint>,
}

impl ConstraintEntry {
    pub fn name(&self) -> &str {
        self.constraint.name()
    }
}

/// Result of removing a step: the step itself plus the scoped constraints
/// that were deleted along with it.
#[derive(Debug)]
pub struct RemovedStep {
    pub entry: StepEntry,
    pub position: usize,
    pub orphaned_constraints: Vec<ConstraintEntry>,
}

/// In-memory workflow: ordered steps, global and scoped constraints, and the
/// step currently selected by the UI.
#[derive(Debug, Clone, Default)]
pub struct SequenceRegistry {
    steps: Vec<StepEntry>,
    constraints: Vec<ConstraintEntry>,
    selected: Option<StepId>,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[inline]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[StepEntry] {
        &self.steps
    }

    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.id).collect()
    }

    pub fn step_at(&self, position: usize) -> Option<&StepEntry> {
        self.steps.get(position)
    }

    pub fn step(&self, id: StepId) -> Option<&StepEntry> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Current ordinal position of a step.
    pub fn position_of(&self, id: StepId) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    pub fn contains_step(&self, id: StepId) -> bool {
        self.position_of(id).is_some()
    }

    pub fn constraints(&self) -> &[ConstraintEntry] {
        &self.constraints
    }

    pub fn constraint(&self, id: ConstraintId) -> Option<&ConstraintEntry> {
        self.constraints.iter().find(|c| c.id == id)
    }

    /// Global constraints in registration order.
    pub fn global_constraints(&self) -> Vec<ConstraintEntry> {
        self.constraints
            .iter()
            .filter(|c| c.scope.is_global())
            .cloned()
            .collect()
    }

    /// Scoped constraints owned by `step`, in registration order.
    pub fn scoped_constraints(&self, step: StepId) -> Vec<ConstraintEntry> {
        self.constraints
            .iter()
            .filter(|c| c.scope.is_owned_by(step))
            .cloned()
            .collect()
    }

    pub fn selected(&self) -> Option<StepId> {
        self.selected
    }

    /// Position of the selected step, re-resolved by identity.
    pub fn selected_index(&self) -> Option<usize> {
        self.selected.and_then(|id| self.position_of(id))
    }

    // =========================================================================
    // Step mutation
    // =========================================================================

    /// Append a step at the end of the sequence.
    pub fn push_step(&mut self, step: Arc<dyn ExecutableStep>) -> StepId {
        let id = StepId::new();
        debug!(step = %id, name = step.name(), position = self.steps.len(), "Appending step");
        self.steps.push(StepEntry { id, step });
        id
    }

    /// Insert a step at `position`, shifting every later step by one.
    pub fn insert_step(&mut self, position: usize, step: Arc<dyn ExecutableStep>) -> Result<StepId> {
        if position > self.steps.len() {
            return Err(SequencerError::IndexOutOfRange {
                index: position,
                len: self.steps.len(),
            });
        }
        let id = StepId::new();
        debug!(step = %id, name = step.name(), position, "Inserting step");
        self.steps.insert(position, StepEntry { id, step });
        Ok(id)
    }

    /// Remove the step at `position` together with its scoped constraints.
    ///
    /// Any other scoped constraint whose owner is no longer registered is
    /// pruned in the same pass, so the registry never keeps a dangling owner.
    pub fn remove_step(&mut self, position: usize) -> Result<RemovedStep> {
        if position >= self.steps.len() {
            return Err(SequencerError::IndexOutOfRange {
                index: position,
                len: self.steps.len(),
            });
        }
        let entry = self.steps.remove(position);
        if self.selected == Some(entry.id) {
            self.selected = None;
        }
        let orphaned_constraints = self.prune_orphans();
        debug!(
            step = %entry.id,
            position,
            orphaned = orphaned_constraints.len(),
            "Removed step"
        );
        Ok(RemovedStep {
            entry,
            position,
            orphaned_constraints,
        })
    }

    /// Exchange two steps. No other step moves, and the selection follows
    /// its step because it is tracked by identity.
    pub fn swap_steps(&mut self, a: usize, b: usize) -> Result<()> {
        let len = self.steps.len();
        for index in [a, b] {
            if index >= len {
                return Err(SequencerError::IndexOutOfRange { index, len });
            }
        }
        self.steps.swap(a, b);
        Ok(())
    }

    /// Duplicate the step at `position` into `position + 1`, copying its
    /// scoped constraints onto the new step.
    pub fn duplicate_step(&mut self, position: usize) -> Result<StepId> {
        let original = self
            .steps
            .get(position)
            .cloned()
            .ok_or(SequencerError::IndexOutOfRange {
                index: position,
                len: self.steps.len(),
            })?;

        let copy_id = self.insert_step(position + 1, original.step.duplicate())?;
        for scoped in self.scoped_constraints(original.id) {
            self.constraints.push(ConstraintEntry {
                id: ConstraintId::new(),
                scope: ConstraintScope::Scoped(copy_id),
                constraint: scoped.constraint.duplicate(),
            });
        }
        Ok(copy_id)
    }

    /// Remove every step and constraint.
    pub fn clear(&mut self) {
        self.steps.clear();
        self.constraints.clear();
        self.selected = None;
    }

    // =========================================================================
    // Constraint mutation
    // =========================================================================

    /// Register a constraint. A scoped constraint's owner must be present.
    pub fn add_constraint(
        &mut self,
        scope: ConstraintScope,
        constraint: Arc<dyn Constraint>,
    ) -> Result<ConstraintId> {
        if let Some(owner) = scope.owner() {
            if !self.contains_step(owner) {
                return Err(SequencerError::UnknownStep(owner));
            }
        }
        let id = ConstraintId::new();
        debug!(constraint = %id, name = constraint.name(), %scope, "Adding constraint");
        self.constraints.push(ConstraintEntry {
            id,
            scope,
            constraint,
        });
        Ok(id)
    }

    pub fn remove_constraint(&mut self, id: ConstraintId) -> Result<ConstraintEntry> {
        let position = self
            .constraints
            .iter()
            .position(|c| c.id == id)
            .ok_or(SequencerError::UnknownConstraint(id))?;
        Ok(self.constraints.remove(position))
    }

    /// Delete scoped constraints whose owning step is gone.
    pub fn prune_orphans(&mut self) -> Vec<ConstraintEntry> {
        let present = self.step_ids();
        let (kept, orphaned): (Vec<_>, Vec<_>) = self
            .constraints
            .drain(..)
            .partition(|c| c.scope.owner().map_or(true, |owner| present.contains(&owner)));
        self.constraints = kept;
        orphaned
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Select the step at `position` (UI concern; gates scoped visualization).
    pub fn select(&mut self, position: usize) -> Result<StepId> {
        let id = self
            .steps
            .get(position)
            .map(|s| s.id)
            .ok_or(SequencerError::IndexOutOfRange {
                index: position,
                len: self.steps.len(),
            })?;
        self.selected = Some(id);
        Ok(id)
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }
}
