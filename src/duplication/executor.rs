//! Duplication executor
//!
//! Copies a whole hierarchy in one store transaction:
//!
//! ```text
//! find_duplicate(source, actor) ── hit ──► return existing root
//!     │ miss
//!     ▼
//! copy root (owner/origin set, exclusions dropped)
//!     │
//!     ▼
//! for each plan level: load children of the parent level's source ids,
//!     rewrite parent column via IdentifierMap, insert as one batch
//!     │
//!     ▼
//! depth guards ── rows beyond ceiling ──► Integrity error (rollback)
//!     │
//!     ▼
//! attachment outbox + duplication record ──► commit
//! ```
//!
//! Blob copying happens after commit, driven by the attachment copier.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::attachments::duplicate_location;
use crate::error::StorageError;
use crate::field::FieldValue;

use super::identifier_map::IdentifierMap;
use super::planner::{self, DuplicationPlan};
use super::schema::{HierarchySchema, NodeKind};
use super::store::{HierarchyStore, HierarchyTx, NewAttachmentCopy, NodeSelector, SourceNode};

/// Parent ids per load query
const LOAD_CHUNK: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicationRequest {
    pub source_root_id: i64,
    pub actor_id: String,
}

impl DuplicationRequest {
    pub fn new(source_root_id: i64, actor_id: impl Into<String>) -> Self {
        Self {
            source_root_id,
            actor_id: actor_id.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DuplicationOutcome {
    pub duplicate_root_id: i64,
    /// True when an earlier run already produced this duplicate
    pub already_existed: bool,
    pub identifiers: IdentifierMap,
    pub attachment_copies: usize,
}

impl DuplicationOutcome {
    pub fn entities_created(&self) -> usize {
        self.identifiers.len()
    }
}

pub struct DuplicationExecutor<H> {
    store: Arc<H>,
    schema: Arc<HierarchySchema>,
    plan: Arc<DuplicationPlan>,
}

impl<H: HierarchyStore> DuplicationExecutor<H> {
    pub fn new(
        store: Arc<H>,
        schema: Arc<HierarchySchema>,
        root_kind: &str,
    ) -> Result<Self, StorageError> {
        let plan = planner::plan(&schema, root_kind)?;
        debug!(
            root_kind = root_kind,
            levels = plan.levels.len(),
            guards = plan.guards.len(),
            "Built duplication plan"
        );
        Ok(Self {
            store,
            schema,
            plan: Arc::new(plan),
        })
    }

    pub fn plan(&self) -> &DuplicationPlan {
        &self.plan
    }

    pub fn store(&self) -> &Arc<H> {
        &self.store
    }

    /// Copy the hierarchy rooted at `request.source_root_id` for `request.actor_id`.
    pub fn duplicate(&self, request: &DuplicationRequest) -> Result<DuplicationOutcome, StorageError> {
        let outcome = self.store.transaction(|tx| {
            if let Some(existing) = tx.find_duplicate(request.source_root_id, &request.actor_id)? {
                debug!(
                    source_root_id = request.source_root_id,
                    actor_id = %request.actor_id,
                    duplicate_root_id = existing,
                    "Duplicate already exists"
                );
                return Ok(DuplicationOutcome {
                    duplicate_root_id: existing,
                    already_existed: true,
                    identifiers: IdentifierMap::new(),
                    attachment_copies: 0,
                });
            }

            let mut run = CopyRun {
                tx,
                schema: &self.schema,
                request,
                identifiers: IdentifierMap::new(),
                columns: HashMap::new(),
                attachments: Vec::new(),
                root_id: 0,
            };
            run.execute(&self.plan)
        })?;

        if !outcome.already_existed {
            info!(
                source_root_id = request.source_root_id,
                actor_id = %request.actor_id,
                duplicate_root_id = outcome.duplicate_root_id,
                entities = outcome.entities_created(),
                attachments = outcome.attachment_copies,
                "Duplicated hierarchy"
            );
        }

        Ok(outcome)
    }
}

/// State of one transactional copy
struct CopyRun<'r, 't> {
    tx: &'r mut (dyn HierarchyTx + 't),
    schema: &'r HierarchySchema,
    request: &'r DuplicationRequest,
    identifiers: IdentifierMap,
    columns: HashMap<String, Vec<String>>,
    attachments: Vec<NewAttachmentCopy>,
    root_id: i64,
}

impl CopyRun<'_, '_> {
    fn execute(&mut self, plan: &DuplicationPlan) -> Result<DuplicationOutcome, StorageError> {
        let root_kind = self.kind(&plan.root().kind)?;

        let columns = self.copy_columns(&root_kind)?;
        let source = self
            .tx
            .load_nodes(
                &root_kind.table,
                NodeSelector::Ids(&[self.request.source_root_id]),
                &columns,
                None,
            )?
            .pop()
            .ok_or_else(|| {
                StorageError::NotFound(format!(
                    "source {} {}",
                    root_kind.name, self.request.source_root_id
                ))
            })?;

        let ids = self.insert_level(&root_kind, &columns, None, std::slice::from_ref(&source))?;
        self.root_id = ids[0];

        // source ids copied at each plan level, indexed like plan.levels
        let mut level_sources: Vec<Vec<i64>> = vec![vec![source.id]];

        for level in plan.descendant_levels() {
            let (Some(parent_level), Some(parent_column)) =
                (level.parent_level, level.parent_column.as_deref())
            else {
                return Err(StorageError::Internal(format!(
                    "plan level {} has no parent",
                    level.index
                )));
            };

            let parent_ids = level_sources[parent_level].clone();
            if parent_ids.is_empty() {
                level_sources.push(Vec::new());
                continue;
            }

            let kind = self.kind(&level.kind)?;
            let columns = self.copy_columns(&kind)?;

            let mut nodes = Vec::new();
            for chunk in parent_ids.chunks(LOAD_CHUNK) {
                nodes.extend(self.tx.load_nodes(
                    &kind.table,
                    NodeSelector::Children {
                        parent_column,
                        parent_ids: chunk,
                    },
                    &columns,
                    kind.position_column.as_deref(),
                )?);
            }

            if !nodes.is_empty() {
                let parent_kind = &plan.levels[parent_level].kind;
                self.insert_level(&kind, &columns, Some((parent_kind, parent_column)), &nodes)?;
                debug!(
                    level = level.index,
                    depth = level.depth,
                    kind = %kind.name,
                    copied = nodes.len(),
                    "Copied level"
                );
            }

            level_sources.push(nodes.iter().map(|n| n.id).collect());
        }

        for guard in &plan.guards {
            let parent_ids = &level_sources[guard.parent_level];
            if parent_ids.is_empty() {
                continue;
            }
            let kind = self.kind(&guard.kind)?;
            let mut beyond = 0u64;
            for chunk in parent_ids.chunks(LOAD_CHUNK) {
                beyond += self.tx.count_nodes(
                    &kind.table,
                    NodeSelector::Children {
                        parent_column: &guard.parent_column,
                        parent_ids: chunk,
                    },
                )?;
            }
            if beyond > 0 {
                return Err(StorageError::Integrity(format!(
                    "{} {} rows nest deeper than the depth ceiling of {}; source hierarchy is corrupt or cyclic",
                    beyond, kind.name, plan.max_depth
                )));
            }
        }

        self.tx.enqueue_attachment_copies(&self.attachments)?;
        self.tx.record_duplicate(
            self.request.source_root_id,
            &self.request.actor_id,
            self.root_id,
        )?;

        Ok(DuplicationOutcome {
            duplicate_root_id: self.root_id,
            already_existed: false,
            identifiers: std::mem::take(&mut self.identifiers),
            attachment_copies: self.attachments.len(),
        })
    }

    fn kind(&self, name: &str) -> Result<NodeKind, StorageError> {
        self.schema
            .kind(name)
            .cloned()
            .ok_or_else(|| StorageError::Internal(format!("plan names unknown kind '{}'", name)))
    }

    /// Columns copied verbatim for `kind`: everything except the id, parent
    /// links, exclusions and the columns this run sets itself.
    fn copy_columns(&mut self, kind: &NodeKind) -> Result<Vec<String>, StorageError> {
        if let Some(columns) = self.columns.get(&kind.name) {
            return Ok(columns.clone());
        }

        let parent_columns = self.schema.parent_columns(&kind.name);
        let columns: Vec<String> = self
            .tx
            .table_columns(&kind.table)?
            .into_iter()
            .filter(|c| {
                c != "id"
                    && !parent_columns.contains(&c.as_str())
                    && !kind.excluded.contains(c)
                    && kind.owner_column.as_ref() != Some(c)
                    && kind.origin_column.as_ref() != Some(c)
            })
            .collect();

        if let Some(attachment) = &kind.attachment {
            if !columns.contains(&attachment.location_column) {
                return Err(StorageError::Config(format!(
                    "attachment column {}.{} is not copied",
                    kind.table, attachment.location_column
                )));
            }
        }

        self.columns.insert(kind.name.clone(), columns.clone());
        Ok(columns)
    }

    /// Build clone rows for one batch, insert them and map the new ids.
    fn insert_level(
        &mut self,
        kind: &NodeKind,
        columns: &[String],
        parent: Option<(&str, &str)>,
        nodes: &[SourceNode],
    ) -> Result<Vec<i64>, StorageError> {
        let mut insert_columns = columns.to_vec();
        if let Some((_, parent_column)) = parent {
            insert_columns.push(parent_column.to_string());
        }
        if let Some(owner) = &kind.owner_column {
            insert_columns.push(owner.clone());
        }
        if let Some(origin) = &kind.origin_column {
            insert_columns.push(origin.clone());
        }

        let location_index = kind
            .attachment
            .as_ref()
            .and_then(|a| columns.iter().position(|c| *c == a.location_column));

        let mut rows = Vec::with_capacity(nodes.len());
        let mut copies: Vec<(usize, String, String)> = Vec::new();

        for (row_index, node) in nodes.iter().enumerate() {
            let mut values = node.values.clone();

            if let Some(index) = location_index {
                if let Some(source_location) = values[index].as_text().filter(|s| !s.is_empty()) {
                    let source_location = source_location.to_string();
                    let dest_location = duplicate_location(&source_location);
                    values[index] = FieldValue::Text(dest_location.clone());
                    copies.push((row_index, source_location, dest_location));
                }
            }

            if let Some((parent_kind, parent_column)) = parent {
                let source_parent = node.parent_id.ok_or_else(|| {
                    StorageError::Integrity(format!(
                        "{} {} has no {}",
                        kind.name, node.id, parent_column
                    ))
                })?;
                let new_parent = self.identifiers.get(parent_kind, source_parent).ok_or_else(|| {
                    StorageError::Integrity(format!(
                        "{} {} points at unmapped {} {}",
                        kind.name, node.id, parent_kind, source_parent
                    ))
                })?;
                values.push(FieldValue::Integer(new_parent));
            }
            if kind.owner_column.is_some() {
                values.push(FieldValue::Text(self.request.actor_id.clone()));
            }
            if kind.origin_column.is_some() {
                values.push(FieldValue::Integer(node.id));
            }

            rows.push(values);
        }

        let ids = self.tx.insert_nodes(&kind.table, &insert_columns, &rows)?;
        if ids.len() != nodes.len() {
            return Err(StorageError::Internal(format!(
                "store returned {} ids for {} {} rows",
                ids.len(),
                nodes.len(),
                kind.name
            )));
        }

        for (node, id) in nodes.iter().zip(&ids) {
            self.identifiers.insert(&kind.name, node.id, *id)?;
        }

        if let Some(attachment) = &kind.attachment {
            // the root id is unknown until the root itself is inserted
            let root_id = if self.root_id == 0 { ids[0] } else { self.root_id };
            for (row_index, source_location, dest_location) in copies {
                self.attachments.push(NewAttachmentCopy {
                    root_id,
                    entity_table: kind.table.clone(),
                    entity_id: ids[row_index],
                    broken_column: attachment.broken_column.clone(),
                    source_location,
                    dest_location,
                });
            }
        }

        Ok(ids)
    }
}
