//! Hierarchy schema for duplication
//!
//! Declares the node kinds that take part in a deep copy, the parent/child
//! relations between them and the depth ceiling. Kinds and relations are
//! plain data, so the same engine copies any tree a store can describe.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::field::is_identifier;

/// Default hard ceiling on hierarchy depth (root is depth 0)
pub const DEFAULT_MAX_DEPTH: u32 = 10;

/// Depth of a step's top-level blocks in the curriculum tree
/// (path 0, chapter 1, step 2). Nested blocks sit one deeper than their
/// parent; a block's fields and media sit one deeper than the block.
pub const TOP_BLOCK_DEPTH: u32 = 3;

/// Column that holds an external blob location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentField {
    /// Column holding the blob location
    pub location_column: String,
    /// Column set to 1 when the blob could not be copied
    pub broken_column: String,
}

/// One entity type in the hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeKind {
    pub name: String,
    pub table: String,
    /// Sibling order column, used to load children in source order
    #[serde(default)]
    pub position_column: Option<String>,
    /// Columns never copied (secrets, per-copy state)
    #[serde(default)]
    pub excluded: Vec<String>,
    /// Column set to the requesting actor on the copy
    #[serde(default)]
    pub owner_column: Option<String>,
    /// Column set to the source id on the copy
    #[serde(default)]
    pub origin_column: Option<String>,
    #[serde(default)]
    pub attachment: Option<AttachmentField>,
}

impl NodeKind {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            position_column: None,
            excluded: Vec::new(),
            owner_column: None,
            origin_column: None,
            attachment: None,
        }
    }

    pub fn ordered_by(mut self, column: impl Into<String>) -> Self {
        self.position_column = Some(column.into());
        self
    }

    pub fn excluding(mut self, column: impl Into<String>) -> Self {
        self.excluded.push(column.into());
        self
    }

    pub fn owned_by(mut self, column: impl Into<String>) -> Self {
        self.owner_column = Some(column.into());
        self
    }

    pub fn originating_from(mut self, column: impl Into<String>) -> Self {
        self.origin_column = Some(column.into());
        self
    }

    pub fn with_attachment(
        mut self,
        location_column: impl Into<String>,
        broken_column: impl Into<String>,
    ) -> Self {
        self.attachment = Some(AttachmentField {
            location_column: location_column.into(),
            broken_column: broken_column.into(),
        });
        self
    }

    fn identifiers(&self) -> Vec<&str> {
        let mut names = vec![self.table.as_str()];
        names.extend(self.position_column.as_deref());
        names.extend(self.excluded.iter().map(String::as_str));
        names.extend(self.owner_column.as_deref());
        names.extend(self.origin_column.as_deref());
        if let Some(a) = &self.attachment {
            names.push(&a.location_column);
            names.push(&a.broken_column);
        }
        names
    }
}

/// Parent to child edge: children of `child` kind point at their `parent`
/// through `parent_column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub parent: String,
    pub child: String,
    pub parent_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchySchema {
    kinds: Vec<NodeKind>,
    relations: Vec<Relation>,
    max_depth: u32,
}

impl HierarchySchema {
    pub fn new(max_depth: u32) -> Self {
        Self {
            kinds: Vec::new(),
            relations: Vec::new(),
            max_depth,
        }
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn with_relation(
        mut self,
        parent: impl Into<String>,
        child: impl Into<String>,
        parent_column: impl Into<String>,
    ) -> Self {
        self.relations.push(Relation {
            parent: parent.into(),
            child: child.into(),
            parent_column: parent_column.into(),
        });
        self
    }

    /// Curriculum tree: path → chapter → step → block (nestable) → field / media
    pub fn curriculum(max_depth: u32) -> Self {
        Self::new(max_depth)
            .with_kind(
                NodeKind::new("path", "paths")
                    .excluding("share_token")
                    .excluding("created_at")
                    .excluding("updated_at")
                    .owned_by("created_by")
                    .originating_from("forked_from_id"),
            )
            .with_kind(NodeKind::new("chapter", "chapters").ordered_by("order_index"))
            .with_kind(NodeKind::new("step", "steps").ordered_by("order_index"))
            .with_kind(NodeKind::new("block", "step_blocks").ordered_by("order_index"))
            .with_kind(NodeKind::new("field", "block_fields"))
            .with_kind(
                NodeKind::new("media", "block_media")
                    .excluding("broken")
                    .with_attachment("storage_location", "broken"),
            )
            .with_relation("path", "chapter", "path_id")
            .with_relation("chapter", "step", "chapter_id")
            .with_relation("step", "block", "step_id")
            .with_relation("block", "block", "parent_block_id")
            .with_relation("block", "field", "block_id")
            .with_relation("block", "media", "block_id")
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn kinds(&self) -> &[NodeKind] {
        &self.kinds
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn kind(&self, name: &str) -> Option<&NodeKind> {
        self.kinds.iter().find(|k| k.name == name)
    }

    /// Relations whose parent is `kind`, in declaration order
    pub fn children_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Relation> + 'a {
        self.relations.iter().filter(move |r| r.parent == kind)
    }

    /// Every column through which `kind` points at a parent
    pub fn parent_columns(&self, kind: &str) -> Vec<&str> {
        let mut columns: Vec<&str> = self
            .relations
            .iter()
            .filter(|r| r.child == kind)
            .map(|r| r.parent_column.as_str())
            .collect();
        columns.dedup();
        columns
    }

    /// Check names, references and identifiers
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.max_depth == 0 {
            return Err(StorageError::Config("max_depth must be at least 1".into()));
        }

        for (i, kind) in self.kinds.iter().enumerate() {
            if self.kinds[..i].iter().any(|k| k.name == kind.name) {
                return Err(StorageError::Config(format!("duplicate kind '{}'", kind.name)));
            }
            if let Some(bad) = kind.identifiers().into_iter().find(|n| !is_identifier(n)) {
                return Err(StorageError::Config(format!(
                    "kind '{}' uses invalid identifier '{}'",
                    kind.name, bad
                )));
            }
        }

        for relation in &self.relations {
            for end in [&relation.parent, &relation.child] {
                if self.kind(end).is_none() {
                    return Err(StorageError::Config(format!(
                        "relation references unknown kind '{}'",
                        end
                    )));
                }
            }
            if !is_identifier(&relation.parent_column) {
                return Err(StorageError::Config(format!(
                    "invalid parent column '{}'",
                    relation.parent_column
                )));
            }
        }

        Ok(())
    }
}

impl Default for HierarchySchema {
    fn default() -> Self {
        Self::curriculum(DEFAULT_MAX_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curriculum_schema_is_valid() {
        let schema = HierarchySchema::default();
        schema.validate().unwrap();
        assert_eq!(schema.max_depth(), DEFAULT_MAX_DEPTH);
        assert_eq!(schema.kind("media").unwrap().table, "block_media");
        assert_eq!(schema.children_of("block").count(), 3);
        assert_eq!(schema.parent_columns("block"), vec!["step_id", "parent_block_id"]);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let schema = HierarchySchema::new(3)
            .with_kind(NodeKind::new("a", "a_table"))
            .with_relation("a", "b", "a_id");
        assert!(matches!(schema.validate(), Err(StorageError::Config(_))));
    }

    #[test]
    fn test_bad_identifier_rejected() {
        let schema = HierarchySchema::new(3).with_kind(NodeKind::new("a", "a; drop"));
        assert!(schema.validate().is_err());
    }
}
