//! Duplication planner
//!
//! Unrolls the schema into a flat list of levels, breadth-first from the root
//! kind. Each level names the kind it copies, the earlier level holding its
//! parents and the column that links them. Self-referencing and cyclic
//! relations are unrolled only down to the schema's depth ceiling. Every edge
//! cut off at the ceiling becomes a guard: the executor checks that no source
//! rows lie beyond it and fails the copy if any do.

use std::collections::VecDeque;

use serde::Serialize;

use crate::error::StorageError;

use super::schema::HierarchySchema;

/// Upper bound on emitted levels, independent of depth, so a wide cyclic
/// schema cannot produce an enormous plan.
pub const MAX_PLAN_LEVELS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanLevel {
    pub index: usize,
    pub depth: u32,
    pub kind: String,
    /// Level whose copied rows are the parents of this level (None for root)
    pub parent_level: Option<usize>,
    pub parent_column: Option<String>,
}

/// An edge that would cross the depth ceiling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepthGuard {
    pub parent_level: usize,
    pub kind: String,
    pub parent_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicationPlan {
    pub root_kind: String,
    pub max_depth: u32,
    pub levels: Vec<PlanLevel>,
    pub guards: Vec<DepthGuard>,
}

impl DuplicationPlan {
    pub fn root(&self) -> &PlanLevel {
        &self.levels[0]
    }

    /// Levels below the root, in execution order
    pub fn descendant_levels(&self) -> &[PlanLevel] {
        &self.levels[1..]
    }
}

/// Build the level plan for copying a tree rooted at `root_kind`.
pub fn plan(schema: &HierarchySchema, root_kind: &str) -> Result<DuplicationPlan, StorageError> {
    schema.validate()?;
    if schema.kind(root_kind).is_none() {
        return Err(StorageError::Config(format!("unknown root kind '{}'", root_kind)));
    }

    let mut levels = vec![PlanLevel {
        index: 0,
        depth: 0,
        kind: root_kind.to_string(),
        parent_level: None,
        parent_column: None,
    }];
    let mut guards = Vec::new();
    let mut queue = VecDeque::from([0usize]);

    while let Some(parent_index) = queue.pop_front() {
        let parent_depth = levels[parent_index].depth;
        let parent_kind = levels[parent_index].kind.clone();

        for relation in schema.children_of(&parent_kind) {
            if parent_depth + 1 > schema.max_depth() {
                guards.push(DepthGuard {
                    parent_level: parent_index,
                    kind: relation.child.clone(),
                    parent_column: relation.parent_column.clone(),
                });
                continue;
            }

            if levels.len() >= MAX_PLAN_LEVELS {
                return Err(StorageError::Integrity(format!(
                    "schema unrolls to more than {} levels",
                    MAX_PLAN_LEVELS
                )));
            }

            let index = levels.len();
            levels.push(PlanLevel {
                index,
                depth: parent_depth + 1,
                kind: relation.child.clone(),
                parent_level: Some(parent_index),
                parent_column: Some(relation.parent_column.clone()),
            });
            queue.push_back(index);
        }
    }

    Ok(DuplicationPlan {
        root_kind: root_kind.to_string(),
        max_depth: schema.max_depth(),
        levels,
        guards,
    })
}
