// tests/parent_child.rs

mod common;
use crate::common::fakes::{ChildTask, Harness};
use crate::common::{WAIT, init_tracing};

use std::error::Error;
use std::time::Duration;

use serde_json::{Value, json};

use stagehand::engine::poll_until;
use stagehand::errors::EngineError;
use stagehand::store::{SubtaskRecord, TaskStore};
use stagehand::task::{Params, StageMark, TaskLogic};
use stagehand::types::{Outcome, TaskId, TaskStatus};

type TestResult = Result<(), Box<dyn Error>>;

fn bar() -> StageMark {
    StageMark {
        name: "Bar".to_string(),
        seq: 1,
    }
}

async fn wait_children_finished(h: &Harness, parent: TaskId, count: usize) -> Result<Vec<SubtaskRecord>, EngineError> {
    let store = &h.store;
    poll_until(
        "subtasks to finish",
        Duration::from_millis(5),
        WAIT,
        || async move {
            let records = store.subtasks_of(parent, &bar()).await?;
            let done = records.len() == count && records.iter().all(|r| r.is_finished());
            Ok(done.then_some(records))
        },
    )
    .await
}

#[tokio::test]
async fn failed_child_fails_the_awaited_parent_stage() -> TestResult {
    init_tracing();
    let h = Harness::new();

    let parent = h
        .create_scripted(
            Params::new()
                .with("mode", "children")
                .with("children", 1)
                .with("failing", json!([0])),
        )
        .await?;
    let task = h.manager.wait_for_terminal(parent, WAIT).await?;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(h.journal.count("OnBarCompleteFailed"), 1);
    assert_eq!(h.journal.count("OnBarComplete"), 0);

    let (_, data) = h
        .journal
        .entries()
        .into_iter()
        .find(|(handler, _)| handler == "OnBarCompleteFailed")
        .expect("failure handler ran");
    assert_eq!(data, json!("child_work: child 0 failed"));
    assert_eq!(task.failures[0].stage, "Bar");
    assert_eq!(task.failures[0].reason, data);
    Ok(())
}

#[tokio::test]
async fn single_child_result_is_passed_through() -> TestResult {
    init_tracing();
    let h = Harness::new();

    let parent = h
        .create_scripted(Params::new().with("mode", "children").with("children", 1))
        .await?;
    let task = h.manager.wait_for_terminal(parent, WAIT).await?;

    assert_eq!(task.status, TaskStatus::Complete);
    let (_, data) = h
        .journal
        .entries()
        .into_iter()
        .find(|(handler, _)| handler == "OnBarComplete")
        .expect("success handler ran");
    assert_eq!(data, json!({"child": 0}));
    Ok(())
}

#[tokio::test]
async fn parallel_children_report_once_all_are_done() -> TestResult {
    init_tracing();
    let h = Harness::new();

    let parent = h
        .create_scripted(Params::new().with("mode", "children").with("children", 3))
        .await?;
    let task = h.manager.wait_for_terminal(parent, WAIT).await?;
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(h.journal.count("Child.OnWorkComplete"), 3);
    assert_eq!(h.journal.count("OnBarComplete"), 1);

    let records = h.store.subtasks_of(parent, &bar()).await?;
    assert_eq!(records.len(), 3);

    let (_, data) = h
        .journal
        .entries()
        .into_iter()
        .find(|(handler, _)| handler == "OnBarComplete")
        .expect("success handler ran");
    let by_child = data.as_object().expect("map of child results");
    assert_eq!(by_child.len(), 3);
    for record in &records {
        let child = h.manager.get(record.child_id).await?;
        assert_eq!(child.status, TaskStatus::Complete);
        assert_eq!(child.parent_id(), Some(parent));
        assert!(by_child.contains_key(&record.child_id.to_string()));
    }
    let mut ns: Vec<u64> = by_child
        .values()
        .filter_map(|v| v.get("child").and_then(Value::as_u64))
        .collect();
    ns.sort_unstable();
    assert_eq!(ns, vec![0, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn one_failed_sibling_fails_the_stage_with_its_reason() -> TestResult {
    init_tracing();
    let h = Harness::new();

    let parent = h
        .create_scripted(
            Params::new()
                .with("mode", "children")
                .with("children", 3)
                .with("failing", json!([1])),
        )
        .await?;
    let task = h.manager.wait_for_terminal(parent, WAIT).await?;
    assert_eq!(task.status, TaskStatus::Failed);

    let records = wait_children_finished(&h, parent, 3).await?;
    let failed: Vec<&SubtaskRecord> = records
        .iter()
        .filter(|r| r.result.as_ref().is_some_and(|res| res.outcome == Outcome::Failure))
        .collect();
    assert_eq!(failed.len(), 1);

    let reasons = task.failures[0].reason.as_object().expect("map of reasons");
    assert_eq!(reasons.len(), 1);
    assert_eq!(
        reasons.get(&failed[0].child_id.to_string()),
        Some(&json!("child_work: child 1 failed"))
    );
    Ok(())
}

#[tokio::test]
async fn children_finishing_after_the_parent_moved_on_are_recorded_only() -> TestResult {
    init_tracing();
    let h = Harness::new();

    let parent = h
        .create_scripted(
            Params::new()
                .with("mode", "children")
                .with("children", 2)
                .with("child_delay_ms", 150),
        )
        .await?;
    h.wait_for_stage(parent, "Bar").await?;

    h.manager
        .signal(parent, Outcome::Success, json!({"manual": true}))
        .await?;
    let task = h.manager.wait_for_terminal(parent, WAIT).await?;
    assert_eq!(task.status, TaskStatus::Complete);

    wait_children_finished(&h, parent, 2).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.journal.count("OnBarComplete"), 1);
    assert_eq!(h.journal.count("Child.OnWorkComplete"), 2);
    let after = h.manager.get(parent).await?;
    assert_eq!(after.stages, task.stages);
    Ok(())
}

#[tokio::test]
async fn externally_created_child_reports_to_the_awaited_stage() -> TestResult {
    init_tracing();
    let h = Harness::new();

    let parent = h.create_scripted(Params::new()).await?;
    h.wait_for_stage(parent, "Foo").await?;

    let child = h
        .manager
        .create(
            ChildTask::NAME,
            h.target.target(),
            Harness::owner(),
            Params::new().with("n", 7),
            Some(parent),
        )
        .await?;

    let child = h.manager.wait_for_terminal(child, WAIT).await?;
    assert_eq!(child.status, TaskStatus::Complete);
    let parent = h.manager.wait_for_terminal(parent, WAIT).await?;
    assert_eq!(parent.status, TaskStatus::Complete);

    let (_, data) = h
        .journal
        .entries()
        .into_iter()
        .find(|(handler, _)| handler == "OnFooComplete")
        .expect("parent handler ran");
    assert_eq!(data, json!({"child": 7}));
    Ok(())
}

#[tokio::test]
async fn finished_parent_cannot_take_children() -> TestResult {
    init_tracing();
    let h = Harness::new();

    let parent = h.create_scripted(Params::new()).await?;
    h.wait_for_stage(parent, "Foo").await?;
    h.manager.signal(parent, Outcome::Failure, json!("stop")).await?;
    h.manager.wait_for_terminal(parent, WAIT).await?;

    let result = h
        .manager
        .create(
            ChildTask::NAME,
            h.target.target(),
            Harness::owner(),
            Params::new(),
            Some(parent),
        )
        .await;
    assert!(matches!(result, Err(EngineError::NoAwaitedStage(id)) if id == parent));
    Ok(())
}

#[tokio::test]
async fn parent_progress_follows_finished_subtasks() -> TestResult {
    init_tracing();
    let h = Harness::new();

    let parent = h
        .create_scripted(
            Params::new()
                .with("mode", "children")
                .with("children", 2)
                .with("child_delays", json!([5, 800])),
        )
        .await?;
    h.wait_for_stage(parent, "Bar").await?;

    let manager = &h.manager;
    let halfway = poll_until("parent to reach 50%", Duration::from_millis(5), WAIT, || async move {
        let task = manager.get(parent).await?;
        Ok((task.progress == 50.0).then_some(task))
    })
    .await?;
    assert_eq!(halfway.status, TaskStatus::Running);
    assert_eq!(halfway.stage.as_deref(), Some("Bar"));

    let done = h.manager.wait_for_terminal(parent, WAIT).await?;
    assert_eq!(done.status, TaskStatus::Complete);
    assert_eq!(done.progress, 100.0);
    Ok(())
}
