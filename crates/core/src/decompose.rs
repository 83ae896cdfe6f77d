//! # Concern Decomposition
//!
//! Splits an unscoped task into exactly three concern children: the feature
//! itself, the guard (validation and invariants), and the failure paths.
//! The parent stays in the store and completes by fan-in once all three
//! children are done.

use crate::error::{ForgeError, Result};
use crate::state::{Concern, Task, TaskStore};

/// Priority multiplier for the guard and failure children. The feature
/// child keeps the parent's full score; its siblings trail it slightly so
/// the behavior lands before its hardening.
const PREREQ_DISCOUNT: f64 = 0.75;

/// Splits unscoped tasks into their three concern children
pub struct Decomposer {
    store: TaskStore,
}

impl Decomposer {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    /// Decompose `parent_id` into feature, guard, and failure children.
    /// Returns the children in that order. Fails if the parent is already
    /// concern-scoped or already decomposed.
    pub fn decompose(&self, parent_id: &str) -> Result<Vec<Task>> {
        let parent = self.store.get(parent_id)?;
        if parent.concern != Concern::Unscoped {
            return Err(ForgeError::NotDecomposable(parent_id.to_string()));
        }
        if parent.is_decomposed() {
            return Err(ForgeError::AlreadyDecomposed(parent_id.to_string()));
        }

        let children = vec![
            self.child(&parent, Concern::Feature),
            self.child(&parent, Concern::Guard),
            self.child(&parent, Concern::Failure),
        ];
        self.store.register_decomposition(parent_id, &children)?;

        tracing::info!(
            parent = %parent_id,
            "Decomposed into {} concern children",
            children.len()
        );
        Ok(children)
    }

    fn child(&self, parent: &Task, concern: Concern) -> Task {
        let (priority, complexity) = match concern {
            // The feature carries the value and roughly half the effort
            Concern::Feature => (parent.priority, div_ceil(parent.complexity, 2)),
            // Hardening children are smaller and slightly discounted
            _ => (
                parent.priority * PREREQ_DISCOUNT,
                div_ceil(parent.complexity, 4),
            ),
        };

        let mut task = Task::new(
            format!("{}-{}", parent.id, concern),
            format!("[{}] {}", concern, parent.title),
        )
        .with_description(child_description(parent, concern))
        .with_concern(concern)
        .with_priority(priority)
        .with_complexity(complexity)
        .with_files(parent.files.clone());
        task.parent_id = Some(parent.id.clone());
        task.max_retries = parent.max_retries;
        task
    }
}

fn child_description(parent: &Task, concern: Concern) -> String {
    match concern {
        Concern::Feature => format!("Implement the primary behavior: {}", parent.description),
        Concern::Guard => format!(
            "Add input validation and invariant checks for: {}",
            parent.title
        ),
        Concern::Failure => format!(
            "Handle error paths and degraded modes for: {}",
            parent.title
        ),
        Concern::Unscoped => parent.description.clone(),
    }
}

fn div_ceil(n: u32, d: u32) -> u32 {
    ((n + d - 1) / d).max(1)
}
