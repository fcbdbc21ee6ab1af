mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use async_trait::async_trait;
use collector_core::task::{ClaimOutcome, EnqueueOutcome, TaskFields, TaskReady};
use collector_core::{SqliteTaskStore, Task, TaskQueue, TaskStatus};
use support::Harness;

fn finish(store: &SqliteTaskStore, task: &Task) {
    store
        .update_status(
            task.id,
            TaskStatus::Completed,
            None,
            Some(TaskStatus::Running),
            &TaskFields::default().progress(100),
        )
        .unwrap();
}

#[test]
fn parallel_claims_never_exceed_the_limit() {
    let harness = Harness::new();
    let tasks: Vec<_> = (0..6)
        .map(|n| harness.insert_pending(&format!("shop-{n}"), &["orders"]))
        .collect();
    let barrier = Arc::new(Barrier::new(tasks.len()));

    let handles: Vec<_> = tasks
        .iter()
        .cloned()
        .map(|task| {
            let store = harness.store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.claim_running(task.id, task.version, TaskStatus::Pending, 2)
            })
        })
        .collect();
    let claimed = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .filter(|outcome| matches!(outcome, ClaimOutcome::Claimed { .. }))
        .count();

    assert_eq!(claimed, 2);
    assert_eq!(harness.store.running_count().unwrap(), 2);
}

#[test]
fn one_account_never_runs_twice() {
    let harness = Harness::new();
    let running = harness.insert_running(harness.new_task("shop-main", &["orders"]));
    let sibling = harness.insert_pending("shop-main", &["products"]);

    let outcome = harness
        .store
        .claim_running(sibling.id, sibling.version, TaskStatus::Pending, 5)
        .unwrap();
    assert_eq!(outcome, ClaimOutcome::AccountBusy);
    assert_eq!(
        harness.store.get(sibling.id).unwrap().status,
        TaskStatus::Pending
    );

    finish(&harness.store, &running);
    let outcome = harness
        .store
        .claim_running(sibling.id, sibling.version, TaskStatus::Pending, 5)
        .unwrap();
    assert!(matches!(outcome, ClaimOutcome::Claimed { .. }));
}

#[tokio::test]
async fn queued_tasks_start_in_creation_order() {
    let harness = Harness::new();
    let queue = TaskQueue::new(harness.store.clone(), 1, 10);

    let first = harness.insert_pending("shop-main", &["orders"]);
    let second = harness.insert_pending("shop-second", &["orders"]);
    let third = harness.insert_pending("shop-third", &["orders"]);

    let first = match queue.enqueue(&first).await.unwrap() {
        EnqueueOutcome::Started(task) => task,
        other => panic!("first task should start, got {other:?}"),
    };
    for task in [&second, &third] {
        let outcome = queue.enqueue(task).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Queued(_)));
        assert_eq!(
            outcome.task().current_step.as_deref(),
            Some("waiting for a free slot")
        );
    }

    finish(&harness.store, &first);
    let next = queue.on_task_complete(first.id).await.unwrap().unwrap();
    assert_eq!(next.id, second.id);
    assert_eq!(next.status, TaskStatus::Running);
    assert!(queue.try_start_next_queued().await.unwrap().is_none());

    finish(&harness.store, &next);
    let last = queue.on_task_complete(next.id).await.unwrap().unwrap();
    assert_eq!(last.id, third.id);
}

#[tokio::test]
async fn busy_account_is_skipped_for_the_next_candidate() {
    let harness = Harness::new();
    let queue = TaskQueue::new(harness.store.clone(), 2, 10);
    let _main = harness.insert_running(harness.new_task("shop-main", &["orders"]));
    let other = harness.insert_running(harness.new_task("shop-third", &["orders"]));

    let blocked = harness.insert_pending("shop-main", &["products"]);
    let free = harness.insert_pending("shop-second", &["orders"]);
    let blocked = queue.enqueue(&blocked).await.unwrap();
    assert_eq!(
        blocked.task().current_step.as_deref(),
        Some("waiting for account")
    );
    assert!(matches!(
        queue.enqueue(&free).await.unwrap(),
        EnqueueOutcome::Queued(_)
    ));

    finish(&harness.store, &other);
    let started = queue.on_task_complete(other.id).await.unwrap().unwrap();
    assert_eq!(started.id, free.id);
    assert_eq!(
        harness.store.get(blocked.task().id).unwrap().status,
        TaskStatus::Queued
    );
}

#[derive(Default)]
struct CountingReady {
    calls: AtomicUsize,
}

#[async_trait]
impl TaskReady for CountingReady {
    async fn ready(&self, task: Task) {
        assert_eq!(task.status, TaskStatus::Running);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn ready_callback_fires_for_every_admission() {
    let harness = Harness::new();
    let ready = Arc::new(CountingReady::default());
    let queue =
        TaskQueue::new(harness.store.clone(), 1, 10).with_ready_callback(ready.clone());

    let first = harness.insert_pending("shop-main", &["orders"]);
    let second = harness.insert_pending("shop-second", &["orders"]);
    let first = queue.enqueue(&first).await.unwrap().task().clone();
    queue.enqueue(&second).await.unwrap();
    assert_eq!(ready.calls.load(Ordering::SeqCst), 1);

    finish(&harness.store, &first);
    queue.on_task_complete(first.id).await.unwrap();
    assert_eq!(ready.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn recovery_frees_slots_held_by_dead_workers() {
    let harness = Harness::new();
    let queue = TaskQueue::new(harness.store.clone(), 1, 10);
    harness.insert_running(harness.new_task("shop-main", &["orders"]));
    let waiting = harness.insert_pending("shop-second", &["orders"]);

    assert_eq!(queue.recover_on_start().unwrap(), 1);
    let outcome = harness
        .store
        .claim_running(waiting.id, waiting.version, TaskStatus::Pending, 1)
        .unwrap();
    assert!(matches!(outcome, ClaimOutcome::Claimed { .. }));
}
