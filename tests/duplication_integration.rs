//! End-to-end duplication tests over an on-disk database and blob store

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use elohim_curriculum::attachments::{AttachmentCopier, BlobStore, CopierSettings};
use elohim_curriculum::config::RetryPolicy;
use elohim_curriculum::db::{
    paths, CreateBlockInput, CreateChapterInput, CreateMediaInput, CreatePathInput,
    CreateStepInput, CurriculumDb, STEPS,
};
use elohim_curriculum::duplication::{
    DuplicationExecutor, DuplicationRequest, HierarchySchema, HierarchyStore, HierarchyTx,
    DEFAULT_MAX_DEPTH, TOP_BLOCK_DEPTH,
};
use elohim_curriculum::jobs::{
    CancelResult, CoordinatorSettings, InMemoryQueue, JobCoordinator, JobMessage,
    JobOutcome, JobQueue, JobState, JobStatus, JobStore,
};
use elohim_curriculum::services::{EventBus, StorageEvent};
use elohim_curriculum::ordering::OrderingService;
use elohim_curriculum::{ErrorClass, StorageError};
use tempfile::TempDir;

const ACTOR: &str = "alice";
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Hierarchy store that fails its first `failures` transactions with a conflict
struct FlakyStore {
    inner: Arc<CurriculumDb>,
    failures: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: Arc<CurriculumDb>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

impl HierarchyStore for FlakyStore {
    fn transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut dyn HierarchyTx) -> Result<T, StorageError>,
    {
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            return Err(StorageError::Conflict("database is locked".into()));
        }
        self.inner.transaction(f)
    }
}

/// Hierarchy store whose first `slow` transactions sleep before running
struct SlowStore {
    inner: Arc<CurriculumDb>,
    slow: AtomicUsize,
    delay: Duration,
}

impl HierarchyStore for SlowStore {
    fn transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut dyn HierarchyTx) -> Result<T, StorageError>,
    {
        let remaining = self
            .slow
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            std::thread::sleep(self.delay);
        }
        self.inner.transaction(f)
    }
}

struct Harness<H: HierarchyStore + 'static> {
    _dir: TempDir,
    db: Arc<CurriculumDb>,
    blobs: Arc<BlobStore>,
    events: Arc<EventBus>,
    queue: Arc<InMemoryQueue>,
    coordinator: JobCoordinator<CurriculumDb, H, InMemoryQueue>,
    copier: AttachmentCopier<CurriculumDb, BlobStore>,
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff_ms: 1,
        backoff_multiplier: 1.0,
        max_backoff_ms: 2,
    }
}

async fn open_db() -> (TempDir, Arc<CurriculumDb>, Arc<BlobStore>) {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(CurriculumDb::open(dir.path()).unwrap());
    let blobs = Arc::new(BlobStore::new(dir.path().join("blobs")).await.unwrap());
    (dir, db, blobs)
}

fn harness_with<H: HierarchyStore + 'static>(
    dir: TempDir,
    db: Arc<CurriculumDb>,
    blobs: Arc<BlobStore>,
    store: Arc<H>,
    max_depth: u32,
    attempt_timeout: Duration,
) -> Harness<H> {
    let events = Arc::new(EventBus::new());
    let schema = Arc::new(HierarchySchema::curriculum(max_depth));
    let executor = Arc::new(DuplicationExecutor::new(store, schema, "path").unwrap());
    let queue = Arc::new(InMemoryQueue::new());
    let coordinator = JobCoordinator::new(
        db.clone(),
        executor,
        queue.clone(),
        events.clone(),
        CoordinatorSettings {
            worker_count: 1,
            retry: fast_retry(3),
            attempt_timeout,
            poll_interval: Duration::from_millis(20),
        },
    );
    let copier = AttachmentCopier::new(
        db.clone(),
        blobs.clone(),
        events.clone(),
        CopierSettings {
            max_concurrent: 4,
            batch_size: 16,
            retry: fast_retry(1),
            poll_interval: Duration::from_millis(20),
        },
    );
    Harness {
        _dir: dir,
        db,
        blobs,
        events,
        queue,
        coordinator,
        copier,
    }
}

async fn harness(max_depth: u32) -> Harness<CurriculumDb> {
    let (dir, db, blobs) = open_db().await;
    let store = db.clone();
    harness_with(dir, db, blobs, store, max_depth, ATTEMPT_TIMEOUT)
}

/// Handle queued messages until the job reaches a terminal state
async fn drive<H: HierarchyStore + 'static>(h: &Harness<H>, job_id: &str) -> JobStatus {
    for _ in 0..1000 {
        if h.coordinator.process_next().await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
            // retries whose delayed message has not landed yet
            h.coordinator.recover().await.unwrap();
        }
        let status = h.coordinator.status(job_id).unwrap();
        if status.job.state.is_terminal() {
            return status;
        }
    }
    panic!("job {} never finished", job_id);
}

fn block(title: &str, media: Option<&str>, children: Vec<CreateBlockInput>) -> CreateBlockInput {
    CreateBlockInput {
        block_type: "text".into(),
        body: Some(title.into()),
        fields: BTreeMap::from([("label".to_string(), title.to_string())]),
        media: media
            .map(|location| {
                vec![CreateMediaInput {
                    media_type: "image".into(),
                    storage_location: location.into(),
                    caption: Some(format!("{} figure", title)),
                }]
            })
            .unwrap_or_default(),
        children,
    }
}

fn step(title: &str, blocks: Vec<CreateBlockInput>) -> CreateStepInput {
    CreateStepInput {
        title: title.into(),
        step_type: "learn".into(),
        blocks,
        ..Default::default()
    }
}

/// 1 path, 2 chapters, 6 steps; each step has one block with a nested block.
/// Two blocks carry media.
fn course() -> CreatePathInput {
    let chapter = |n: usize| CreateChapterInput {
        title: format!("Chapter {}", n),
        steps: (0..3)
            .map(|s| {
                let name = format!("c{}s{}", n, s);
                let media = match (n, s) {
                    (1, 0) => Some("uploads/ownership.png"),
                    (2, 2) => Some("uploads/lifetimes.png"),
                    _ => None,
                };
                let nested = block(&format!("{} detail", name), None, vec![]);
                step(&name, vec![block(&name, media, vec![nested])])
            })
            .collect(),
        ..Default::default()
    };

    CreatePathInput {
        title: "Rust in depth".into(),
        path_type: "guided".into(),
        visibility: "public".into(),
        share_token: Some("private-link-secret".into()),
        created_by: Some("author".into()),
        chapters: vec![chapter(1), chapter(2)],
        ..Default::default()
    }
}

fn create(db: &CurriculumDb, input: &CreatePathInput) -> i64 {
    db.with_conn_mut(|conn| paths::create_path(conn, input, DEFAULT_MAX_DEPTH))
        .unwrap()
}

fn tree(db: &CurriculumDb, id: i64) -> paths::PathTree {
    db.with_conn(|conn| paths::get_path_tree(conn, id, DEFAULT_MAX_DEPTH))
        .unwrap()
        .unwrap()
}

fn record_count(db: &CurriculumDb) -> i64 {
    db.with_conn(|conn| {
        Ok(conn.query_row("SELECT COUNT(*) FROM duplication_records", [], |r| r.get(0))?)
    })
    .unwrap()
}

fn step_titles(tree: &paths::PathTree) -> Vec<String> {
    tree.steps().map(|s| s.title.clone()).collect()
}

#[tokio::test]
async fn test_duplicate_copies_whole_tree_once() {
    let h = harness(10).await;
    h.blobs.put("uploads/ownership.png", b"png-1").await.unwrap();
    h.blobs.put("uploads/lifetimes.png", b"png-2").await.unwrap();
    let source = create(&h.db, &course());
    let before = h.db.stats().unwrap();
    assert_eq!(before.path_count, 1);
    assert_eq!(before.chapter_count, 2);
    assert_eq!(before.step_count, 6);
    assert_eq!(before.block_count, 12);

    let receipt = h.coordinator.submit(source, ACTOR).await.unwrap();
    assert!(receipt.created);
    assert_eq!(receipt.state, JobState::Queued);

    let status = drive(&h, &receipt.job_id).await;
    assert_eq!(status.job.state, JobState::Succeeded);
    assert_eq!(status.job.attempts, 1);
    let duplicate = status.job.duplicate_root_id.unwrap();
    assert_ne!(duplicate, source);

    let after = h.db.stats().unwrap();
    assert_eq!(after.entity_count(), before.entity_count() * 2);

    let copy = tree(&h.db, duplicate);
    let original = tree(&h.db, source);
    assert_eq!(copy.path.title, original.path.title);
    assert_eq!(copy.path.created_by.as_deref(), Some(ACTOR));
    assert_eq!(copy.path.forked_from_id, Some(source));
    assert_eq!(copy.path.share_token, None);
    assert_eq!(step_titles(&copy), step_titles(&original));

    // every copied child points into the copy, never at the source
    let original_steps: Vec<i64> = original.steps().map(|s| s.id).collect();
    for (chapter, source_chapter) in copy.chapters.iter().zip(&original.chapters) {
        assert_eq!(chapter.path_id, duplicate);
        assert_ne!(chapter.id, source_chapter.id);
        for step in &chapter.steps {
            assert_eq!(step.chapter_id, chapter.id);
            assert!(!original_steps.contains(&step.id));
            let top = &step.blocks[0];
            assert_eq!(top.step_id, Some(step.id));
            assert_eq!(top.fields[0].block_id, top.id);
            assert_eq!(top.children.len(), 1);
            assert_eq!(top.children[0].parent_block_id, Some(top.id));
            assert_eq!(top.children[0].step_id, None);
        }
    }

    // media rows point at fresh locations; blobs arrive after the copier runs
    let media = copy.media();
    assert_eq!(media.len(), 2);
    assert!(media.iter().all(|m| m.storage_location.starts_with("attachments/")));
    assert!(matches!(
        status.outcome(),
        JobOutcome::Succeeded { pending_attachments: 2, .. }
    ));

    let round = h.copier.process_pending().await.unwrap();
    assert_eq!(round.succeeded, 2);
    for m in &media {
        assert!(h.blobs.exists(&m.storage_location).await);
    }
    assert_eq!(
        h.coordinator.status(&receipt.job_id).unwrap().outcome(),
        JobOutcome::Succeeded {
            duplicate_root_id: duplicate,
            pending_attachments: 0
        }
    );

    // same source and actor again: same job, no new rows
    let again = h.coordinator.submit(source, ACTOR).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.job_id, receipt.job_id);
    assert_eq!(again.state, JobState::Succeeded);
    assert_eq!(h.db.stats().unwrap(), after);
    assert_eq!(record_count(&h.db), 1);
}

#[tokio::test]
async fn test_executor_replay_creates_nothing() {
    let h = harness(10).await;
    let source = create(&h.db, &course());
    let executor = DuplicationExecutor::new(
        h.db.clone(),
        Arc::new(HierarchySchema::curriculum(10)),
        "path",
    )
    .unwrap();

    let request = DuplicationRequest::new(source, ACTOR);
    let first = executor.duplicate(&request).unwrap();
    assert!(!first.already_existed);
    assert_eq!(first.entities_created() as u64, h.db.stats().unwrap().entity_count() / 2);
    assert_eq!(first.attachment_copies, 2);

    let stats = h.db.stats().unwrap();
    let second = executor.duplicate(&request).unwrap();
    assert!(second.already_existed);
    assert_eq!(second.duplicate_root_id, first.duplicate_root_id);
    assert_eq!(second.entities_created(), 0);
    assert_eq!(h.db.stats().unwrap(), stats);

    // a different actor gets an independent copy
    let bob = executor.duplicate(&DuplicationRequest::new(source, "bob")).unwrap();
    assert_ne!(bob.duplicate_root_id, first.duplicate_root_id);
    assert_eq!(record_count(&h.db), 2);
}

#[tokio::test]
async fn test_concurrent_requests_for_same_actor_yield_one_copy() {
    let h = harness(10).await;
    let source = create(&h.db, &course());
    let executor = Arc::new(
        DuplicationExecutor::new(h.db.clone(), Arc::new(HierarchySchema::curriculum(10)), "path")
            .unwrap(),
    );

    let roots: Vec<i64> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let executor = executor.clone();
                scope.spawn(move || {
                    executor
                        .duplicate(&DuplicationRequest::new(source, ACTOR))
                        .unwrap()
                        .duplicate_root_id
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(roots.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(h.db.stats().unwrap().path_count, 2);
}

#[tokio::test]
async fn test_duplicate_preserves_reordered_siblings() {
    let h = harness(10).await;
    let source = create(&h.db, &course());
    let chapter_id = tree(&h.db, source).chapters[0].id;

    let ordering = OrderingService::new(h.db.clone(), h.events.clone());
    let last = ordering.positions(&STEPS, chapter_id).unwrap()[2].id;
    assert_eq!(ordering.move_to(&STEPS, last, 0).unwrap(), 0);

    let receipt = h.coordinator.submit(source, ACTOR).await.unwrap();
    let status = drive(&h, &receipt.job_id).await;
    let copy = tree(&h.db, status.job.duplicate_root_id.unwrap());

    let titles: Vec<&str> = copy.chapters[0].steps.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, vec!["c1s2", "c1s0", "c1s1"]);
    let positions: Vec<i64> = copy.chapters[0].steps.iter().map(|s| s.order_index).collect();
    assert_eq!(positions, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_depth_ceiling_fails_without_partial_rows() {
    // path, chapter, step, block, nested block fit in 4 levels; a third block level does not
    let h = harness(4).await;
    let deep = CreatePathInput {
        title: "Deep".into(),
        path_type: "guided".into(),
        visibility: "public".into(),
        chapters: vec![CreateChapterInput {
            title: "Only".into(),
            steps: vec![step(
                "s",
                vec![CreateBlockInput {
                    children: vec![CreateBlockInput {
                        children: vec![CreateBlockInput::default()],
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
            )],
            ..Default::default()
        }],
        ..Default::default()
    };
    let source = create(&h.db, &deep);
    let before = h.db.stats().unwrap();
    let mut events = h.events.subscribe();

    let receipt = h.coordinator.submit(source, ACTOR).await.unwrap();
    let status = drive(&h, &receipt.job_id).await;

    assert_eq!(status.job.state, JobState::DeadLettered);
    assert_eq!(status.job.attempts, 1);
    assert_eq!(status.job.error_class.as_deref(), Some(ErrorClass::Integrity.as_str()));
    assert!(matches!(status.outcome(), JobOutcome::DeadLettered { .. }));
    assert_eq!(h.db.stats().unwrap(), before);
    assert_eq!(record_count(&h.db), 0);

    let mut dead_lettered = false;
    while let Ok(event) = events.try_recv() {
        if let StorageEvent::JobDeadLettered {
            source_root_id,
            actor_id,
            attempts,
            ..
        } = event
        {
            assert_eq!(source_root_id, source);
            assert_eq!(actor_id, ACTOR);
            assert_eq!(attempts, 1);
            dead_lettered = true;
        }
    }
    assert!(dead_lettered);
}

#[tokio::test]
async fn test_cyclic_block_is_integrity_error() {
    let h = harness(10).await;
    // written past the schema's checks, as a damaged or legacy file would be
    h.db.with_conn(|conn| {
        conn.execute_batch(
            "INSERT INTO paths (id, title) VALUES (1, 'Loop');
             INSERT INTO chapters (id, path_id, title) VALUES (1, 1, 'C');
             INSERT INTO steps (id, chapter_id, title) VALUES (1, 1, 'S');
             INSERT INTO step_blocks (id, step_id) VALUES (7, 1);
             PRAGMA ignore_check_constraints = ON;
             UPDATE step_blocks SET parent_block_id = 7 WHERE id = 7;
             PRAGMA ignore_check_constraints = OFF;",
        )?;
        Ok(())
    })
    .unwrap();
    let before = h.db.stats().unwrap();

    let executor = DuplicationExecutor::new(
        h.db.clone(),
        Arc::new(HierarchySchema::curriculum(10)),
        "path",
    )
    .unwrap();
    let err = executor
        .duplicate(&DuplicationRequest::new(1, ACTOR))
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Integrity);
    assert!(!err.is_retryable());
    assert_eq!(h.db.stats().unwrap(), before);
}

#[tokio::test]
async fn test_missing_attachment_flags_one_row_broken() {
    let h = harness(10).await;
    h.blobs.put("uploads/ownership.png", b"png-1").await.unwrap();
    // uploads/lifetimes.png is never stored
    let source = create(&h.db, &course());
    let mut events = h.events.subscribe();

    let receipt = h.coordinator.submit(source, ACTOR).await.unwrap();
    let status = drive(&h, &receipt.job_id).await;
    let duplicate = status.job.duplicate_root_id.unwrap();

    let round = h.copier.process_pending().await.unwrap();
    assert_eq!(round.succeeded, 1);
    assert_eq!(round.failed, 1);

    let copy = tree(&h.db, duplicate);
    let broken: Vec<_> = copy.media().into_iter().filter(|m| m.broken).collect();
    assert_eq!(broken.len(), 1);
    assert_eq!(broken[0].caption.as_deref(), Some("c2s2 figure"));
    // the duplicate itself is untouched
    assert_eq!(copy.steps().count(), 6);
    assert!(tree(&h.db, source).media().iter().all(|m| !m.broken));

    let status = h.coordinator.status(&receipt.job_id).unwrap();
    assert_eq!(status.job.state, JobState::Succeeded);
    assert_eq!(
        status.outcome(),
        JobOutcome::Degraded {
            duplicate_root_id: duplicate,
            broken_attachments: 1
        }
    );

    let mut saw_broken = false;
    while let Ok(event) = events.try_recv() {
        if let StorageEvent::AttachmentBroken { root_id, .. } = event {
            assert_eq!(root_id, duplicate);
            saw_broken = true;
        }
    }
    assert!(saw_broken);

    // once the blob shows up, a repair pass clears the flag
    h.blobs.put("uploads/lifetimes.png", b"png-2").await.unwrap();
    assert_eq!(h.copier.repair(Some(duplicate)).unwrap(), 1);
    let round = h.copier.process_pending().await.unwrap();
    assert_eq!(round.succeeded, 1);
    assert!(tree(&h.db, duplicate).media().iter().all(|m| !m.broken));
    assert!(matches!(
        h.coordinator.status(&receipt.job_id).unwrap().outcome(),
        JobOutcome::Succeeded { .. }
    ));
}

#[tokio::test]
async fn test_conflict_is_retried_then_succeeds() {
    let (dir, db, blobs) = open_db().await;
    let store = Arc::new(FlakyStore::new(db.clone(), 2));
    let h = harness_with(dir, db, blobs, store, 10, ATTEMPT_TIMEOUT);
    let source = create(&h.db, &course());
    let mut events = h.events.subscribe();

    let receipt = h.coordinator.submit(source, ACTOR).await.unwrap();
    let status = drive(&h, &receipt.job_id).await;

    assert_eq!(status.job.state, JobState::Succeeded);
    assert_eq!(status.job.attempts, 3);
    assert_eq!(h.db.stats().unwrap().path_count, 2);

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, StorageEvent::JobRetrying { .. }) {
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_conflicts_past_budget_dead_letter() {
    let (dir, db, blobs) = open_db().await;
    let store = Arc::new(FlakyStore::new(db.clone(), 10));
    let h = harness_with(dir, db, blobs, store, 10, ATTEMPT_TIMEOUT);
    let source = create(&h.db, &course());

    let receipt = h.coordinator.submit(source, ACTOR).await.unwrap();
    let status = drive(&h, &receipt.job_id).await;

    assert_eq!(status.job.state, JobState::DeadLettered);
    assert_eq!(status.job.attempts, 3);
    assert_eq!(status.job.error_class.as_deref(), Some("conflict"));
    assert!(status.job.last_error.unwrap().contains("locked"));
    assert_eq!(h.coordinator.dead_letters(10).unwrap().len(), 1);
    assert_eq!(h.db.stats().unwrap().path_count, 1);
}

#[tokio::test]
async fn test_missing_source_dead_letters_and_revives() {
    let h = harness(10).await;

    let receipt = h.coordinator.submit(4242, ACTOR).await.unwrap();
    let status = drive(&h, &receipt.job_id).await;
    assert_eq!(status.job.state, JobState::DeadLettered);
    assert_eq!(status.job.attempts, 1);
    assert_eq!(status.job.error_class.as_deref(), Some("validation"));

    // the source appears later; an operator revives the job
    h.db.with_conn(|conn| {
        conn.execute("INSERT INTO paths (id, title) VALUES (4242, 'Late')", [])?;
        Ok(())
    })
    .unwrap();
    let revived = h.coordinator.revive(&receipt.job_id).await.unwrap();
    assert_eq!(revived.state, JobState::Queued);
    assert_eq!(revived.attempts, 0);

    let status = drive(&h, &receipt.job_id).await;
    assert_eq!(status.job.state, JobState::Succeeded);
    assert!(h.coordinator.dead_letters(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_rejects_bad_requests() {
    let h = harness(10).await;
    let err = h.coordinator.submit(0, ACTOR).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
    let err = h.coordinator.submit(1, "  ").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
    assert!(h.coordinator.list(None, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_before_attempt() {
    let h = harness(10).await;
    let source = create(&h.db, &course());

    let receipt = h.coordinator.submit(source, ACTOR).await.unwrap();
    assert_eq!(h.coordinator.cancel(&receipt.job_id).unwrap(), CancelResult::Cancelled);

    // the queued message is dropped at claim time
    assert_eq!(h.coordinator.process_next().await.unwrap(), None);
    let status = h.coordinator.status(&receipt.job_id).unwrap();
    assert_eq!(status.outcome(), JobOutcome::Cancelled);
    assert_eq!(h.db.stats().unwrap().path_count, 1);
    assert_eq!(
        h.coordinator.cancel(&receipt.job_id).unwrap(),
        CancelResult::AlreadyFinished(JobState::Cancelled)
    );

    // a cancelled job does not block a fresh request
    let again = h.coordinator.submit(source, ACTOR).await.unwrap();
    assert!(again.created);
    assert_ne!(again.job_id, receipt.job_id);
}

#[tokio::test]
async fn test_cancel_requested_mid_attempt_stops_at_retry() {
    let (dir, db, blobs) = open_db().await;
    let store = Arc::new(FlakyStore::new(db.clone(), 1));
    let h = harness_with(dir, db, blobs, store, 10, ATTEMPT_TIMEOUT);
    let source = create(&h.db, &course());

    let receipt = h.coordinator.submit(source, ACTOR).await.unwrap();
    // simulate a worker holding the job when the cancel arrives
    let now_ms = chrono::Utc::now().timestamp_millis();
    let claimed = h
        .db
        .claim_job(&receipt.job_id, now_ms, now_ms + 60_000)
        .unwrap()
        .unwrap();
    assert_eq!(claimed.state, JobState::Running);
    assert_eq!(h.coordinator.cancel(&receipt.job_id).unwrap(), CancelResult::Requested);

    let state = h
        .db
        .requeue_job(&receipt.job_id, "locked", ErrorClass::Conflict, 0)
        .unwrap();
    assert_eq!(state, JobState::Cancelled);
    assert_eq!(h.coordinator.process_next().await.unwrap(), None);
    assert_eq!(h.db.stats().unwrap().path_count, 1);
}

#[tokio::test]
async fn test_redelivered_message_is_harmless() {
    let h = harness(10).await;
    let source = create(&h.db, &course());

    let receipt = h.coordinator.submit(source, ACTOR).await.unwrap();
    h.queue
        .publish(JobMessage::new(&receipt.job_id), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(
        h.coordinator.process_next().await.unwrap(),
        Some(JobState::Succeeded)
    );
    assert_eq!(h.coordinator.process_next().await.unwrap(), None);

    assert_eq!(h.db.stats().unwrap().path_count, 2);
    assert_eq!(h.coordinator.status(&receipt.job_id).unwrap().job.attempts, 1);
}

#[tokio::test]
async fn test_workers_drain_queue_until_shutdown() {
    let h = harness(10).await;
    let source = create(&h.db, &course());
    let coordinator = Arc::new(h.coordinator);

    let receipts = submit_all(&coordinator, source, &["a", "b", "c"]).await;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let handles = coordinator.spawn_workers(&shutdown_tx);

    for _ in 0..500 {
        let done = receipts
            .iter()
            .all(|id| coordinator.status(id).unwrap().job.state == JobState::Succeeded);
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    shutdown_tx.send(()).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(h.db.stats().unwrap().path_count, 4);
    assert_eq!(coordinator.list(Some(JobState::Succeeded), 10).unwrap().len(), 3);
}

async fn submit_all(
    coordinator: &JobCoordinator<CurriculumDb, CurriculumDb, InMemoryQueue>,
    source: i64,
    actors: &[&str],
) -> Vec<String> {
    let mut ids = Vec::new();
    for actor in actors {
        ids.push(coordinator.submit(source, actor).await.unwrap().job_id);
    }
    ids
}

/// One step holding `levels` nested blocks; every block has a field except
/// the deepest, which gets one only when `deepest_field` is set
fn block_chain(levels: usize, deepest_field: bool) -> CreatePathInput {
    let mut chain = if deepest_field {
        block("level", None, vec![])
    } else {
        CreateBlockInput::default()
    };
    for level in (1..levels).rev() {
        chain = block(&format!("level {}", level), None, vec![chain]);
    }
    CreatePathInput {
        title: "Deep".into(),
        chapters: vec![CreateChapterInput {
            title: "Only".into(),
            steps: vec![step("s", vec![chain])],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn chain_len(tree: &paths::PathTree) -> usize {
    let mut len = 0;
    let mut blocks = &tree.chapters[0].steps[0].blocks;
    while let Some(block) = blocks.first() {
        len += 1;
        blocks = &block.children;
    }
    len
}

#[tokio::test]
async fn test_deepest_importable_tree_duplicates() {
    let h = harness(DEFAULT_MAX_DEPTH).await;
    // blocks at depths 3..=10; fields of the level-10 block would sit at 11
    let deepest = (DEFAULT_MAX_DEPTH - TOP_BLOCK_DEPTH + 1) as usize;

    let source = create(&h.db, &block_chain(deepest, false));
    assert_eq!(chain_len(&tree(&h.db, source)), deepest);

    let receipt = h.coordinator.submit(source, ACTOR).await.unwrap();
    let status = drive(&h, &receipt.job_id).await;
    assert_eq!(status.job.state, JobState::Succeeded);
    let copy = tree(&h.db, status.job.duplicate_root_id.unwrap());
    assert_eq!(chain_len(&copy), deepest);
    assert_eq!(h.db.stats().unwrap().field_count, 2 * (deepest as u64 - 1));

    // one level more, or leaves under the deepest block, is refused at import
    for input in [block_chain(deepest + 1, false), block_chain(deepest, true)] {
        let err = h
            .db
            .with_conn_mut(|conn| paths::create_path(conn, &input, DEFAULT_MAX_DEPTH))
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
    }
    assert_eq!(h.db.stats().unwrap().path_count, 2);
}

#[tokio::test]
async fn test_timed_out_attempt_is_retried_and_its_late_commit_reused() {
    let (dir, db, blobs) = open_db().await;
    let store = Arc::new(SlowStore {
        inner: db.clone(),
        slow: AtomicUsize::new(1),
        delay: Duration::from_millis(300),
    });
    let h = harness_with(dir, db, blobs, store, 10, Duration::from_millis(50));
    let source = create(&h.db, &course());

    let receipt = h.coordinator.submit(source, ACTOR).await.unwrap();
    assert_eq!(
        h.coordinator.process_next().await.unwrap(),
        Some(JobState::Queued)
    );

    let status = h.coordinator.status(&receipt.job_id).unwrap();
    assert_eq!(status.job.state, JobState::Queued);
    assert_eq!(status.job.attempts, 1);
    assert_eq!(status.job.error_class.as_deref(), Some("conflict"));
    assert!(status.job.last_error.unwrap().contains("exceeded"));

    // the abandoned attempt still commits once its store call returns
    for _ in 0..200 {
        if record_count(&h.db) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(record_count(&h.db), 1);
    let committed = h.db.stats().unwrap();
    assert_eq!(committed.path_count, 2);

    let status = drive(&h, &receipt.job_id).await;
    assert_eq!(status.job.state, JobState::Succeeded);
    assert_eq!(status.job.attempts, 2);
    assert_eq!(h.db.stats().unwrap(), committed);
    assert_eq!(record_count(&h.db), 1);
}

#[tokio::test]
async fn test_poller_requeues_job_whose_lease_expired() {
    let h = harness(10).await;
    let source = create(&h.db, &course());
    let receipt = h.coordinator.submit(source, ACTOR).await.unwrap();

    // a worker claimed the job and never recorded the result
    let now_ms = chrono::Utc::now().timestamp_millis();
    h.db.claim_job(&receipt.job_id, now_ms, now_ms).unwrap().unwrap();

    let coordinator = Arc::new(h.coordinator);
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let handles = coordinator.spawn_workers(&shutdown_tx);

    for _ in 0..500 {
        if coordinator.status(&receipt.job_id).unwrap().job.state == JobState::Succeeded {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    shutdown_tx.send(()).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    let job = coordinator.status(&receipt.job_id).unwrap().job;
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 2);
    assert_eq!(h.db.stats().unwrap().path_count, 2);
}
