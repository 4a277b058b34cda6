use super::{job, temp_queue};
use crate::db::{NewCheck, Queue};
use crate::types::{CheckStatus, JobId};
use std::path::Path;
use tempfile::TempDir;

async fn completed_job(queue: &Queue, path: &str) -> JobId {
    let id = queue.enqueue(&job(path, 10, 0), false).await.unwrap();
    queue.claim().await.unwrap().unwrap();
    queue.complete(id, Path::new("/nzbs/x.nzb")).await.unwrap();
    id
}

fn check(message_id: &str) -> NewCheck {
    NewCheck {
        message_id: message_id.to_string(),
        groups: vec!["alt.binaries.test".to_string(), "alt.binaries.misc".to_string()],
    }
}

async fn queue_with_checks() -> (Queue, JobId, TempDir) {
    let (queue, dir) = temp_queue().await;
    let id = completed_job(&queue, "/files/a.bin").await;
    queue
        .add_checks(id, &[check("m1@a.bc"), check("m2@a.bc"), check("m3@a.bc")], 100)
        .await
        .unwrap();
    (queue, id, dir)
}

#[tokio::test]
async fn add_and_count_checks() {
    let (queue, id, _dir) = queue_with_checks().await;

    let counts = queue.counts_for_job(id).await.unwrap();
    assert_eq!(counts.total, 3);
    assert_eq!(counts.pending, 3);
    assert_eq!(counts.failed, 0);
}

#[tokio::test]
async fn due_checks_respect_schedule_and_order() {
    let (queue, _id, _dir) = queue_with_checks().await;

    // Nothing due before the first_due_at timestamp
    assert!(queue.due_checks(10, 50).await.unwrap().is_empty());

    let due = queue.due_checks(10, 100).await.unwrap();
    assert_eq!(due.len(), 3);

    // Reschedule one into the future; it drops out of the due set
    let first = due[0].id;
    queue
        .update_check_retry(crate::types::CheckId(first), 1, 1_000_000)
        .await
        .unwrap();

    let due = queue.due_checks(10, 100).await.unwrap();
    assert_eq!(due.len(), 2);
    assert!(due.iter().all(|c| c.id != first));

    // FIFO by next_retry_at: the rescheduled row comes last once due
    let due = queue.due_checks(10, 2_000_000).await.unwrap();
    assert_eq!(due.len(), 3);
    assert_eq!(due[2].id, first);
}

#[tokio::test]
async fn due_checks_honors_limit() {
    let (queue, _id, _dir) = queue_with_checks().await;

    let due = queue.due_checks(2, 100).await.unwrap();
    assert_eq!(due.len(), 2);
}

#[tokio::test]
async fn verify_and_fail_are_terminal() {
    let (queue, id, _dir) = queue_with_checks().await;

    let due = queue.due_checks(10, 100).await.unwrap();
    queue
        .mark_check_verified(crate::types::CheckId(due[0].id))
        .await
        .unwrap();
    queue
        .mark_check_failed(crate::types::CheckId(due[1].id))
        .await
        .unwrap();

    let counts = queue.counts_for_job(id).await.unwrap();
    assert_eq!(counts.total, 3);
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.failed, 1);

    // Resolved checks never come due again
    let due = queue.due_checks(10, i64::MAX).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].status, CheckStatus::Pending.to_i32());
}

#[tokio::test]
async fn update_retry_stamps_first_failure_once() {
    let (queue, _id, _dir) = queue_with_checks().await;

    let due = queue.due_checks(1, 100).await.unwrap();
    let check_id = crate::types::CheckId(due[0].id);

    queue.update_check_retry(check_id, 1, 200).await.unwrap();
    let row = &queue.due_checks(10, 300).await.unwrap()[0];
    assert_eq!(row.retry_count, 1);
    let first = row.first_failure_at.unwrap();
    assert!(row.last_checked_at.is_some());

    queue.update_check_retry(check_id, 2, 400).await.unwrap();
    let rows = queue.due_checks(10, 500).await.unwrap();
    let row = rows.iter().find(|c| c.id == check_id.0).unwrap();
    assert_eq!(row.retry_count, 2);
    assert_eq!(row.first_failure_at.unwrap(), first);
}

#[tokio::test]
async fn groups_roundtrip_as_json() {
    let (queue, _id, _dir) = queue_with_checks().await;

    let due = queue.due_checks(1, 100).await.unwrap();
    assert_eq!(
        due[0].group_list(),
        vec![
            "alt.binaries.test".to_string(),
            "alt.binaries.misc".to_string()
        ]
    );
}

#[tokio::test]
async fn removing_the_job_cascades_to_checks() {
    let (queue, id, _dir) = queue_with_checks().await;

    queue.remove(id).await.unwrap();

    let counts = queue.counts_for_job(id).await.unwrap();
    assert_eq!(counts.total, 0);
}

#[tokio::test]
async fn empty_check_list_is_a_no_op() {
    let (queue, _dir) = temp_queue().await;
    let id = completed_job(&queue, "/files/b.bin").await;

    queue.add_checks(id, &[], 100).await.unwrap();
    assert_eq!(queue.counts_for_job(id).await.unwrap().total, 0);
}
