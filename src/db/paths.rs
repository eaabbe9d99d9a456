//! Path tree CRUD operations
//!
//! Paths own chapters, chapters own steps, steps own blocks. Blocks nest:
//! a top-level block has `step_id` set, a nested block has `parent_block_id`
//! set instead. Fields and media hang off blocks.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::duplication::TOP_BLOCK_DEPTH;
use crate::error::StorageError;

/// Path row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRow {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub path_type: String,
    pub difficulty: Option<String>,
    pub estimated_duration: Option<String>,
    pub metadata_json: Option<String>,
    pub visibility: String,
    #[serde(skip_serializing)]
    pub share_token: Option<String>,
    pub created_by: Option<String>,
    pub forked_from_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl PathRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            path_type: row.get("path_type")?,
            difficulty: row.get("difficulty")?,
            estimated_duration: row.get("estimated_duration")?,
            metadata_json: row.get("metadata_json")?,
            visibility: row.get("visibility")?,
            share_token: row.get("share_token")?,
            created_by: row.get("created_by")?,
            forked_from_id: row.get("forked_from_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Chapter row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterRow {
    pub id: i64,
    pub path_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub order_index: i64,
    pub estimated_duration: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepRow>,
}

impl ChapterRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            path_id: row.get("path_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            order_index: row.get("order_index")?,
            estimated_duration: row.get("estimated_duration")?,
            steps: vec![],
        })
    }
}

/// Step row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRow {
    pub id: i64,
    pub chapter_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub step_type: String,
    pub resource_id: Option<String>,
    pub order_index: i64,
    pub estimated_duration: Option<String>,
    pub metadata_json: Option<String>,
    #[serde(default)]
    pub blocks: Vec<BlockRow>,
}

impl StepRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            chapter_id: row.get("chapter_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            step_type: row.get("step_type")?,
            resource_id: row.get("resource_id")?,
            order_index: row.get("order_index")?,
            estimated_duration: row.get("estimated_duration")?,
            metadata_json: row.get("metadata_json")?,
            blocks: vec![],
        })
    }
}

/// Content block, with its fields, media and nested blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRow {
    pub id: i64,
    pub step_id: Option<i64>,
    pub parent_block_id: Option<i64>,
    pub block_type: String,
    pub body: Option<String>,
    pub order_index: i64,
    #[serde(default)]
    pub fields: Vec<FieldRow>,
    #[serde(default)]
    pub media: Vec<MediaRow>,
    #[serde(default)]
    pub children: Vec<BlockRow>,
}

impl BlockRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            step_id: row.get("step_id")?,
            parent_block_id: row.get("parent_block_id")?,
            block_type: row.get("block_type")?,
            body: row.get("body")?,
            order_index: row.get("order_index")?,
            fields: vec![],
            media: vec![],
            children: vec![],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRow {
    pub id: i64,
    pub block_id: i64,
    pub name: String,
    pub value: Option<String>,
}

/// Media attachment; `storage_location` is a key into the blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRow {
    pub id: i64,
    pub block_id: i64,
    pub media_type: String,
    pub storage_location: String,
    pub caption: Option<String>,
    pub broken: bool,
}

/// Path with its ordered chapters, steps and blocks
#[derive(Debug, Clone, Serialize)]
pub struct PathTree {
    pub path: PathRow,
    pub chapters: Vec<ChapterRow>,
}

impl PathTree {
    pub fn steps(&self) -> impl Iterator<Item = &StepRow> {
        self.chapters.iter().flat_map(|c| c.steps.iter())
    }

    /// Every media row in the tree, nested blocks included
    pub fn media(&self) -> Vec<&MediaRow> {
        fn walk<'a>(blocks: &'a [BlockRow], out: &mut Vec<&'a MediaRow>) {
            for block in blocks {
                out.extend(block.media.iter());
                walk(&block.children, out);
            }
        }
        let mut out = Vec::new();
        for step in self.steps() {
            walk(&step.blocks, &mut out);
        }
        out
    }
}

/// Input for creating a path
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePathInput {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_path_type")]
    pub path_type: String,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub estimated_duration: Option<String>,
    #[serde(default)]
    pub metadata_json: Option<String>,
    #[serde(default = "default_visibility")]
    pub visibility: String,
    #[serde(default)]
    pub share_token: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub chapters: Vec<CreateChapterInput>,
}

fn default_path_type() -> String { "guided".to_string() }
fn default_visibility() -> String { "public".to_string() }
fn default_step_type() -> String { "learn".to_string() }
fn default_block_type() -> String { "text".to_string() }
fn default_media_type() -> String { "image".to_string() }

/// Input for creating a chapter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateChapterInput {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub estimated_duration: Option<String>,
    #[serde(default)]
    pub steps: Vec<CreateStepInput>,
}

/// Input for creating a step
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateStepInput {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_step_type")]
    pub step_type: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub estimated_duration: Option<String>,
    #[serde(default)]
    pub metadata_json: Option<String>,
    #[serde(default)]
    pub blocks: Vec<CreateBlockInput>,
}

/// Input for creating a block and everything under it
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateBlockInput {
    #[serde(default = "default_block_type")]
    pub block_type: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub media: Vec<CreateMediaInput>,
    #[serde(default)]
    pub children: Vec<CreateBlockInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateMediaInput {
    #[serde(default = "default_media_type")]
    pub media_type: String,
    pub storage_location: String,
    #[serde(default)]
    pub caption: Option<String>,
}

/// Where a new block hangs
#[derive(Clone, Copy)]
enum BlockParent {
    Step(i64),
    Block(i64),
}

/// Message for rows that would sit below the depth ceiling, if any exist
fn depth_violation(what: &str, depth: u32, max_depth: u32, present: bool) -> Option<String> {
    (present && depth > max_depth).then(|| {
        format!(
            "{} at depth {} exceed the depth ceiling of {}",
            what, depth, max_depth
        )
    })
}

/// Create a path with its whole tree in one transaction.
///
/// Sibling positions follow input order, starting at 0. Every row must sit
/// within `max_depth`, counted as the duplicator counts it: path 0,
/// chapter 1, step 2, top-level block 3, and a block's fields and media one
/// below the block.
pub fn create_path(
    conn: &mut Connection,
    input: &CreatePathInput,
    max_depth: u32,
) -> Result<i64, StorageError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    tx.execute(
        r#"
        INSERT INTO paths (
            title, description, path_type, difficulty, estimated_duration,
            metadata_json, visibility, share_token, created_by
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            input.title,
            input.description,
            input.path_type,
            input.difficulty,
            input.estimated_duration,
            input.metadata_json,
            input.visibility,
            input.share_token,
            input.created_by,
        ],
    )?;
    let path_id = tx.last_insert_rowid();

    let chapter_depth = TOP_BLOCK_DEPTH - 2;
    if let Some(msg) = depth_violation("chapters", chapter_depth, max_depth, !input.chapters.is_empty()) {
        return Err(StorageError::InvalidInput(msg));
    }

    for (chapter_index, chapter) in input.chapters.iter().enumerate() {
        if let Some(msg) =
            depth_violation("steps", chapter_depth + 1, max_depth, !chapter.steps.is_empty())
        {
            return Err(StorageError::InvalidInput(msg));
        }

        tx.execute(
            r#"
            INSERT INTO chapters (path_id, title, description, order_index, estimated_duration)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                path_id,
                chapter.title,
                chapter.description,
                chapter_index as i64,
                chapter.estimated_duration,
            ],
        )?;
        let chapter_id = tx.last_insert_rowid();

        for (step_index, step) in chapter.steps.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO steps (
                    chapter_id, title, description, step_type, resource_id,
                    order_index, estimated_duration, metadata_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    chapter_id,
                    step.title,
                    step.description,
                    step.step_type,
                    step.resource_id,
                    step_index as i64,
                    step.estimated_duration,
                    step.metadata_json,
                ],
            )?;
            let step_id = tx.last_insert_rowid();
            insert_blocks(
                &tx,
                BlockParent::Step(step_id),
                &step.blocks,
                TOP_BLOCK_DEPTH,
                max_depth,
            )?;
        }
    }

    tx.commit()?;
    debug!(path_id, chapters = input.chapters.len(), "Created path");
    Ok(path_id)
}

fn insert_blocks(
    tx: &Transaction<'_>,
    parent: BlockParent,
    blocks: &[CreateBlockInput],
    depth: u32,
    max_depth: u32,
) -> Result<(), StorageError> {
    if let Some(msg) = depth_violation("blocks", depth, max_depth, !blocks.is_empty()) {
        return Err(StorageError::InvalidInput(msg));
    }

    let (step_id, parent_block_id) = match parent {
        BlockParent::Step(id) => (Some(id), None),
        BlockParent::Block(id) => (None, Some(id)),
    };

    for (index, block) in blocks.iter().enumerate() {
        let leaves = !(block.fields.is_empty() && block.media.is_empty());
        if let Some(msg) = depth_violation("fields and media", depth + 1, max_depth, leaves) {
            return Err(StorageError::InvalidInput(msg));
        }

        tx.execute(
            "INSERT INTO step_blocks (step_id, parent_block_id, block_type, body, order_index)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![step_id, parent_block_id, block.block_type, block.body, index as i64],
        )?;
        let block_id = tx.last_insert_rowid();

        for (name, value) in &block.fields {
            tx.execute(
                "INSERT INTO block_fields (block_id, name, value) VALUES (?1, ?2, ?3)",
                params![block_id, name, value],
            )?;
        }
        for media in &block.media {
            tx.execute(
                "INSERT INTO block_media (block_id, media_type, storage_location, caption)
                 VALUES (?1, ?2, ?3, ?4)",
                params![block_id, media.media_type, media.storage_location, media.caption],
            )?;
        }

        insert_blocks(
            tx,
            BlockParent::Block(block_id),
            &block.children,
            depth + 1,
            max_depth,
        )?;
    }
    Ok(())
}

/// Get path by ID
pub fn get_path(conn: &Connection, id: i64) -> Result<Option<PathRow>, StorageError> {
    let path = conn
        .query_row("SELECT * FROM paths WHERE id = ?1", params![id], PathRow::from_row)
        .optional()?;
    Ok(path)
}

/// Get path with all chapters, steps and blocks, each level in position order
///
/// Rows below `max_depth` (same accounting as [`create_path`]) mean the tree
/// is corrupt or cyclic and fail the read with an integrity error.
pub fn get_path_tree(
    conn: &Connection,
    id: i64,
    max_depth: u32,
) -> Result<Option<PathTree>, StorageError> {
    let path = match get_path(conn, id)? {
        Some(p) => p,
        None => return Ok(None),
    };

    let mut chapters: Vec<ChapterRow> = conn
        .prepare_cached("SELECT * FROM chapters WHERE path_id = ?1 ORDER BY order_index, id")?
        .query_map(params![id], ChapterRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let chapter_depth = TOP_BLOCK_DEPTH - 2;
    if let Some(msg) = depth_violation("chapters", chapter_depth, max_depth, !chapters.is_empty()) {
        return Err(StorageError::Integrity(msg));
    }

    for chapter in &mut chapters {
        chapter.steps = conn
            .prepare_cached("SELECT * FROM steps WHERE chapter_id = ?1 ORDER BY order_index, id")?
            .query_map(params![chapter.id], StepRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(msg) =
            depth_violation("steps", chapter_depth + 1, max_depth, !chapter.steps.is_empty())
        {
            return Err(StorageError::Integrity(msg));
        }

        for step in &mut chapter.steps {
            step.blocks = load_blocks(conn, BlockParent::Step(step.id), TOP_BLOCK_DEPTH, max_depth)?;
        }
    }

    Ok(Some(PathTree { path, chapters }))
}

fn load_blocks(
    conn: &Connection,
    parent: BlockParent,
    depth: u32,
    max_depth: u32,
) -> Result<Vec<BlockRow>, StorageError> {
    let (sql, parent_id) = match parent {
        BlockParent::Step(id) => (
            "SELECT * FROM step_blocks WHERE step_id = ?1 AND parent_block_id IS NULL
             ORDER BY order_index, id",
            id,
        ),
        BlockParent::Block(id) => (
            "SELECT * FROM step_blocks WHERE parent_block_id = ?1 ORDER BY order_index, id",
            id,
        ),
    };
    let mut blocks: Vec<BlockRow> = conn
        .prepare_cached(sql)?
        .query_map(params![parent_id], BlockRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(msg) = depth_violation("blocks", depth, max_depth, !blocks.is_empty()) {
        return Err(StorageError::Integrity(msg));
    }

    for block in &mut blocks {
        block.fields = conn
            .prepare_cached("SELECT id, block_id, name, value FROM block_fields WHERE block_id = ?1 ORDER BY id")?
            .query_map(params![block.id], |row| {
                Ok(FieldRow {
                    id: row.get(0)?,
                    block_id: row.get(1)?,
                    name: row.get(2)?,
                    value: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        block.media = conn
            .prepare_cached(
                "SELECT id, block_id, media_type, storage_location, caption, broken
                 FROM block_media WHERE block_id = ?1 ORDER BY id",
            )?
            .query_map(params![block.id], |row| {
                Ok(MediaRow {
                    id: row.get(0)?,
                    block_id: row.get(1)?,
                    media_type: row.get(2)?,
                    storage_location: row.get(3)?,
                    caption: row.get(4)?,
                    broken: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let leaves = !(block.fields.is_empty() && block.media.is_empty());
        if let Some(msg) = depth_violation("fields and media", depth + 1, max_depth, leaves) {
            return Err(StorageError::Integrity(msg));
        }

        block.children = load_blocks(conn, BlockParent::Block(block.id), depth + 1, max_depth)?;
    }

    Ok(blocks)
}

/// List paths, newest first
pub fn list_paths(conn: &Connection, limit: u32, offset: u32) -> Result<Vec<PathRow>, StorageError> {
    let paths = conn
        .prepare_cached("SELECT * FROM paths ORDER BY id DESC LIMIT ?1 OFFSET ?2")?
        .query_map(params![limit as i64, offset as i64], PathRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(paths)
}

/// Delete path and its whole tree
pub fn delete_path(conn: &Connection, id: i64) -> Result<bool, StorageError> {
    let changes = conn.execute("DELETE FROM paths WHERE id = ?1", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CurriculumDb;
    use crate::duplication::DEFAULT_MAX_DEPTH;

    fn sample() -> CreatePathInput {
        CreatePathInput {
            title: "Rust basics".into(),
            path_type: "guided".into(),
            visibility: "public".into(),
            share_token: Some("secret".into()),
            created_by: Some("author".into()),
            chapters: vec![
                CreateChapterInput {
                    title: "Ownership".into(),
                    steps: vec![CreateStepInput {
                        title: "Moves".into(),
                        step_type: "learn".into(),
                        blocks: vec![CreateBlockInput {
                            block_type: "callout".into(),
                            fields: BTreeMap::from([("tone".to_string(), "warn".to_string())]),
                            media: vec![CreateMediaInput {
                                media_type: "image".into(),
                                storage_location: "uploads/moves.png".into(),
                                caption: None,
                            }],
                            children: vec![CreateBlockInput {
                                block_type: "text".into(),
                                body: Some("nested".into()),
                                ..Default::default()
                            }],
                            ..Default::default()
                        }],
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                CreateChapterInput {
                    title: "Borrowing".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_load_tree() {
        let db = CurriculumDb::open_in_memory().unwrap();
        let id = db.with_conn_mut(|conn| create_path(conn, &sample(), DEFAULT_MAX_DEPTH)).unwrap();

        let tree = db.with_conn(|conn| get_path_tree(conn, id, DEFAULT_MAX_DEPTH)).unwrap().unwrap();
        assert_eq!(tree.path.title, "Rust basics");
        assert_eq!(tree.chapters.len(), 2);
        assert_eq!(tree.chapters[0].title, "Ownership");
        assert_eq!(tree.chapters[1].order_index, 1);

        let step = &tree.chapters[0].steps[0];
        let block = &step.blocks[0];
        assert_eq!(block.step_id, Some(step.id));
        assert_eq!(block.fields[0].name, "tone");
        assert_eq!(block.children.len(), 1);
        assert_eq!(block.children[0].step_id, None);
        assert_eq!(block.children[0].parent_block_id, Some(block.id));
        assert_eq!(tree.media().len(), 1);
        assert!(!tree.media()[0].broken);
    }

    #[test]
    fn test_share_token_not_serialized() {
        let db = CurriculumDb::open_in_memory().unwrap();
        let id = db.with_conn_mut(|conn| create_path(conn, &sample(), DEFAULT_MAX_DEPTH)).unwrap();
        let path = db.with_conn(|conn| get_path(conn, id)).unwrap().unwrap();

        assert_eq!(path.share_token.as_deref(), Some("secret"));
        let json = serde_json::to_string(&path).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_delete_cascades() {
        let db = CurriculumDb::open_in_memory().unwrap();
        let id = db.with_conn_mut(|conn| create_path(conn, &sample(), DEFAULT_MAX_DEPTH)).unwrap();

        assert!(db.with_conn(|conn| delete_path(conn, id)).unwrap());
        assert!(!db.with_conn(|conn| delete_path(conn, id)).unwrap());
        assert_eq!(db.stats().unwrap().entity_count(), 0);
    }

    #[test]
    fn test_import_json_defaults() {
        let input: CreatePathInput = serde_json::from_str(
            r#"{"title": "T", "chapters": [{"title": "C", "steps": [{"title": "S",
                "blocks": [{"media": [{"storage_location": "a/b.png"}]}]}]}]}"#,
        )
        .unwrap();
        assert_eq!(input.visibility, "public");
        assert_eq!(input.chapters[0].steps[0].step_type, "learn");
        assert_eq!(input.chapters[0].steps[0].blocks[0].block_type, "text");
        assert_eq!(input.chapters[0].steps[0].blocks[0].media[0].media_type, "image");
    }

    /// One step holding a chain of `levels` nested blocks, each with a field
    /// except the deepest, which gets one only when `deepest_field` is set
    fn block_chain(levels: usize, deepest_field: bool) -> CreatePathInput {
        let mut block = CreateBlockInput {
            body: Some(format!("level {}", levels)),
            fields: if deepest_field {
                BTreeMap::from([("k".to_string(), "v".to_string())])
            } else {
                BTreeMap::new()
            },
            ..Default::default()
        };
        for level in (1..levels).rev() {
            block = CreateBlockInput {
                body: Some(format!("level {}", level)),
                fields: BTreeMap::from([("k".to_string(), "v".to_string())]),
                children: vec![block],
                ..Default::default()
            };
        }
        CreatePathInput {
            title: "Deep".into(),
            chapters: vec![CreateChapterInput {
                title: "C".into(),
                steps: vec![CreateStepInput {
                    title: "S".into(),
                    blocks: vec![block],
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn chain_depth(tree: &PathTree) -> usize {
        let mut depth = 0;
        let mut blocks = &tree.chapters[0].steps[0].blocks;
        while let Some(block) = blocks.first() {
            depth += 1;
            blocks = &block.children;
        }
        depth
    }

    #[test]
    fn test_block_chain_at_depth_ceiling() {
        let db = CurriculumDb::open_in_memory().unwrap();
        // blocks at depths 3..=10
        let deepest = (DEFAULT_MAX_DEPTH - TOP_BLOCK_DEPTH + 1) as usize;

        let id = db
            .with_conn_mut(|conn| create_path(conn, &block_chain(deepest, false), DEFAULT_MAX_DEPTH))
            .unwrap();
        let tree = db
            .with_conn(|conn| get_path_tree(conn, id, DEFAULT_MAX_DEPTH))
            .unwrap()
            .unwrap();
        assert_eq!(chain_depth(&tree), deepest);
    }

    #[test]
    fn test_import_past_depth_ceiling_rejected() {
        let db = CurriculumDb::open_in_memory().unwrap();
        let deepest = (DEFAULT_MAX_DEPTH - TOP_BLOCK_DEPTH + 1) as usize;

        for input in [block_chain(deepest + 1, false), block_chain(deepest, true)] {
            let err = db
                .with_conn_mut(|conn| create_path(conn, &input, DEFAULT_MAX_DEPTH))
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidInput(_)), "{:?}", err);
        }
        assert_eq!(db.stats().unwrap().entity_count(), 0);

        let err = db
            .with_conn_mut(|conn| create_path(conn, &sample(), 2))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));
    }

    #[test]
    fn test_read_fails_only_when_rows_pass_ceiling() {
        let db = CurriculumDb::open_in_memory().unwrap();
        let deepest = (DEFAULT_MAX_DEPTH - TOP_BLOCK_DEPTH + 1) as usize;
        let id = db
            .with_conn_mut(|conn| create_path(conn, &block_chain(deepest, false), DEFAULT_MAX_DEPTH))
            .unwrap();

        // the deepest block is the only one without a field
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO step_blocks (parent_block_id, block_type, order_index)
                 SELECT id, 'text', 0 FROM step_blocks
                 WHERE id NOT IN (SELECT block_id FROM block_fields)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let err = db
            .with_conn(|conn| get_path_tree(conn, id, DEFAULT_MAX_DEPTH))
            .unwrap_err();
        assert!(matches!(err, StorageError::Integrity(_)));
        assert!(db
            .with_conn(|conn| get_path_tree(conn, id, DEFAULT_MAX_DEPTH + 1))
            .unwrap()
            .is_some());
    }
}
