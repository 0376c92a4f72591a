use crate::db::*;
use crate::registry::Task;
use crate::types::{BackendKind, Source, SubmitRequest, TaskId, TaskState};


pub(super) fn sample_task(id: i64) -> Task {
    let request = SubmitRequest::new(
        Source::DirectUrl {
            url: format!("https://example.com/file{}.bin", id),
            filename: None,
        },
        "alice",
    );
    Task::from_request(TaskId(id), request, BackendKind::Http, 3)
}

pub(super) fn sample_history(id: i64, state: TaskState) -> crate::types::HistoryEntry {
    let mut task = sample_task(id);
    task.state = state;
    task.history_entry()
}

async fn open() -> (Database, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Database::new(&dir.path().join("state/engine.db")).await.unwrap();
    (db, dir)
}
