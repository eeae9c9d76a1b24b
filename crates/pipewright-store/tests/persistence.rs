use std::collections::BTreeMap;

use chrono::Utc;
use pipewright_store::{NewTask, Store, StoreError, TaskFilter};
use pipewright_types::{
    BlockDefinition, BlockKind, PipelineGraph, Step, StepStatus, TaskStatus, VersionStatus,
    DEFAULT_SOCKET,
};
use uuid::Uuid;

fn graph() -> PipelineGraph {
    let mut blocks = BTreeMap::new();
    blocks.insert(
        "start_0".to_string(),
        BlockDefinition::new(BlockKind::Start).with_socket(DEFAULT_SOCKET, &["end_0"]),
    );
    blocks.insert("end_0".to_string(), BlockDefinition::new(BlockKind::End));
    PipelineGraph {
        entrypoint: "start_0".into(),
        blocks,
        inputs: vec![],
        outputs: vec![],
    }
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("pipewright.db");

    let (task_id, step_id) = {
        let store = Store::open(&path).unwrap();
        store
            .transaction(|tx| -> Result<_, StoreError> {
                let p = tx.create_pipeline("onboarding", "author")?;
                let v = tx.create_version(p.id, "author", &graph(), "first")?;
                tx.set_version_status(v.id, VersionStatus::Approved)?;
                let task = tx.create_task(NewTask {
                    version_id: v.id,
                    work_title: "onboarding".into(),
                    author: "u1".into(),
                    initiator: "u1".into(),
                    parameters: serde_json::json!({"name": "Ann"}),
                    is_test: false,
                    parent_work_number: None,
                })?;
                tx.update_task_status(task.id, TaskStatus::Running)?;
                let now = Utc::now();
                let step = Step {
                    id: Uuid::new_v4(),
                    task_id: task.id,
                    name: "start_0".into(),
                    kind: BlockKind::Start,
                    time: now,
                    updated_at: now,
                    status: StepStatus::Finished,
                    has_error: false,
                    is_paused: false,
                    state: Default::default(),
                    storage: serde_json::from_value(serde_json::json!({"onboarding.name": "Ann"}))
                        .unwrap(),
                    steps: vec!["start_0".into()],
                    errors: vec![],
                    stop_points: Default::default(),
                };
                tx.insert_step(&step)?;
                Ok((task.id, step.id))
            })
            .unwrap()
    };

    let store = Store::open(&path).unwrap();
    store.ping().unwrap();
    store
        .read(|tx| -> Result<(), StoreError> {
            let task = tx.get_task(task_id)?;
            assert_eq!(task.status, TaskStatus::Running);
            assert_eq!(task.parameters["name"], "Ann");
            let step = tx.get_step(step_id)?;
            assert_eq!(step.storage["onboarding.name"], "Ann");
            assert_eq!(tx.list_steps(task_id)?.len(), 1);
            assert_eq!(tx.count_tasks(&TaskFilter::default())?, 1);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_missing_rows_are_not_found() {
    let store = Store::open_in_memory().unwrap();
    let err = store.read(|tx| tx.get_task(Uuid::new_v4())).unwrap_err();
    assert!(matches!(err, StoreError::NotFound { kind: "task", .. }));
    let err = store.read(|tx| tx.get_step(Uuid::new_v4())).unwrap_err();
    assert!(matches!(err, StoreError::NotFound { kind: "step", .. }));
}

#[test]
fn test_pooled_readers_see_committed_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_pooled(&dir.path().join("pooled.db"), 3).unwrap();
    assert_eq!(store.reader_count(), 2);

    let id = store
        .transaction(|tx| tx.create_pipeline("pooled", "author"))
        .unwrap()
        .id;
    // Consecutive reads rotate over every reader.
    for _ in 0..3 {
        let name = store.read(|tx| tx.get_pipeline(id)).unwrap().name;
        assert_eq!(name, "pooled");
    }
}

#[test]
fn test_pool_of_one_reads_through_the_writer() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_pooled(&dir.path().join("single.db"), 1).unwrap();
    assert_eq!(store.reader_count(), 0);
    assert_eq!(Store::open_in_memory().unwrap().reader_count(), 0);
}
