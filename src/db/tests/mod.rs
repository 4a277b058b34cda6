mod checks;

use crate::db::{NewJob, Queue};
use tempfile::TempDir;

/// Open a queue on a fresh temp database. Returns the TempDir so the file
/// outlives the test body.
pub(super) async fn temp_queue() -> (Queue, TempDir) {
    let dir = TempDir::new().unwrap();
    let queue = Queue::new(&dir.path().join("queue.db")).await.unwrap();
    (queue, dir)
}

/// A NewJob with sensible defaults for tests.
pub(super) fn job(path: &str, size: i64, priority: i32) -> NewJob {
    NewJob {
        path: path.to_string(),
        size_bytes: size,
        priority,
        retry_count: 0,
        payload: format!(r#"{{"path":"{path}","size":{size},"priority":{priority}}}"#),
    }
}
