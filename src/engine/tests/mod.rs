use super::test_helpers::*;
use crate::backend::mock::{Failure, MockBackend};
use crate::error::{Error, ErrorKind};
use crate::types::{BackendKind, Event, Priority, TaskId, TaskState};
use std::time::Duration;
use tokio::sync::broadcast;

mod failures;
mod scenarios;

/// Collect events until `done` matches one, or the timeout passes
async fn collect_until(
    rx: &mut broadcast::Receiver<Event>,
    mut done: impl FnMut(&Event) -> bool,
) -> Vec<Event> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let finished = done(&event);
                    seen.push(event);
                    if finished {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out collecting events: {:?}", seen);
    seen
}

fn states_of(events: &[Event], id: TaskId) -> Vec<TaskState> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StateChanged { id: event_id, new_state, .. } if *event_id == id => Some(*new_state),
            _ => None,
        })
        .collect()
}

/// Submit an HTTP task and wait until its backend job exists
async fn running_http(h: &Harness, name: &str) -> TaskId {
    let id = submit_http(&h.engine, name, 0).await;
    wait_for_job(&h.engine, id).await;
    id
}

/// Finish a task's job and wait for its history entry
async fn finish(h: &Harness, kind: BackendKind, id: TaskId) -> crate::types::HistoryEntry {
    let artifact = h.artifact(&format!("file-{}.bin", id), b"payload");
    h.mock(kind).complete(id, artifact);
    wait_for_history(&h.engine, id).await
}
