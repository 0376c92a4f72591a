use super::*;
use crate::types::HistoryFilter;

#[tokio::test]
async fn submit_failures_stop_at_the_retry_bound() {
    let h = create_test_engine().await;
    let http = h.mock(BackendKind::Http);
    http.fail_submits([Failure::Transient, Failure::Transient, Failure::Transient]);

    let mut request = http_request("never.bin");
    request.max_retries = Some(2);
    let id = h.engine.submit(request).await.unwrap();

    let entry = wait_for_history(&h.engine, id).await;
    assert_eq!(entry.state, TaskState::Failed);
    assert_eq!(entry.retry_count, 2);
    assert_eq!(entry.last_error.unwrap().kind, ErrorKind::Network);
    assert_eq!(http.submit_count(), 3);
    assert_eq!(h.engine.queue_stats().await.active_slots, 0);
}

#[tokio::test]
async fn permanent_submit_failure_is_not_retried() {
    let h = create_test_engine().await;
    let http = h.mock(BackendKind::Http);
    http.fail_submits([Failure::Permanent]);

    let id = submit_http(&h.engine, "rejected.bin", 0).await;
    let entry = wait_for_history(&h.engine, id).await;
    assert_eq!(entry.state, TaskState::Failed);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.last_error.unwrap().kind, ErrorKind::Backend);
    assert_eq!(http.submit_count(), 1);
}

#[tokio::test]
async fn transient_job_error_resubmits() {
    let h = create_test_engine().await;
    let torrent = h.mock(BackendKind::Torrent);
    let id = h.engine.submit(torrent_request("stalled")).await.unwrap();
    let first = wait_for_job(&h.engine, id).await.backend_handle;

    torrent.set_errored(id, "tracker timed out", true);
    wait_until("job resubmitted", || async move { torrent.submit_count() == 2 }).await;
    let engine = &h.engine;
    wait_until("new handle recorded", || {
        let first = first.clone();
        async move {
            engine
                .get_task(id)
                .await
                .is_ok_and(|t| t.backend_handle.is_some() && t.backend_handle != first)
        }
    })
    .await;

    let snapshot = h.engine.get_task(id).await.unwrap();
    assert_eq!(snapshot.state, TaskState::Downloading);
    assert_eq!(snapshot.retry_count, 1);
    assert_eq!(torrent.cancel_count(), 1);

    finish(&h, BackendKind::Torrent, id).await;
}

#[tokio::test]
async fn permanent_job_error_fails_the_task() {
    let h = create_test_engine().await;
    let torrent = h.mock(BackendKind::Torrent);
    let id = h.engine.submit(torrent_request("corrupt")).await.unwrap();
    wait_for_job(&h.engine, id).await;

    torrent.set_errored(id, "missing files", false);
    let entry = wait_for_history(&h.engine, id).await;
    assert_eq!(entry.state, TaskState::Failed);
    let error = entry.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::Backend);
    assert!(error.message.contains("missing files"), "{}", error.message);
    assert_eq!(torrent.submit_count(), 1);
}

#[tokio::test]
async fn vanished_job_fails_the_task() {
    let h = create_test_engine().await;
    let http = h.mock(BackendKind::Http);
    let id = running_http(&h, "gone.bin").await;

    http.remove(id);
    let entry = wait_for_history(&h.engine, id).await;
    assert_eq!(entry.state, TaskState::Failed);
    assert_eq!(entry.last_error.unwrap().kind, ErrorKind::Backend);
}

#[tokio::test]
async fn poll_errors_draw_on_the_retry_budget() {
    let h = create_test_engine().await;
    let http = h.mock(BackendKind::Http);
    let mut request = http_request("flaky-poll.bin");
    request.max_retries = Some(1);
    let id = h.engine.submit(request).await.unwrap();
    wait_for_job(&h.engine, id).await;

    http.fail_polls([Failure::Transient]);
    let engine = &h.engine;
    wait_until("retry consumed", || async move {
        engine.get_task(id).await.is_ok_and(|t| t.retry_count == 1)
    })
    .await;
    assert_eq!(h.engine.get_task(id).await.unwrap().state, TaskState::Downloading);

    http.fail_polls([Failure::Transient]);
    let entry = wait_for_history(&h.engine, id).await;
    assert_eq!(entry.state, TaskState::Failed);
    assert_eq!(entry.last_error.unwrap().kind, ErrorKind::Network);
}

#[tokio::test]
async fn transient_upload_failure_is_retried() {
    let h = create_test_engine().await;
    h.uploader.fail_next([true]);
    let id = running_http(&h, "retry-upload.bin").await;

    let entry = finish(&h, BackendKind::Http, id).await;
    assert_eq!(entry.state, TaskState::Completed);
    assert_eq!(h.uploader.attempts(), 2);
    assert_eq!(entry.retry_count, 1);
}

#[tokio::test]
async fn rejected_upload_keeps_the_artifact() {
    let h = create_test_engine().await;
    h.uploader.fail_next([false]);
    let id = running_http(&h, "rejected-upload.bin").await;

    let entry = finish(&h, BackendKind::Http, id).await;
    assert_eq!(entry.state, TaskState::Failed);
    assert_eq!(entry.last_error.unwrap().kind, ErrorKind::Upload);
    assert_eq!(h.uploader.attempts(), 1);
    let artifact = h.dir.path().join("downloads").join(format!("file-{}.bin", id));
    assert!(artifact.exists());
    assert_eq!(h.mock(BackendKind::Http).release_count(), 0);
}

#[tokio::test]
async fn history_keeps_only_the_newest_entries() {
    let h = create_test_engine_with(|c| c.engine.history_capacity = 3, default_mocks()).await;
    let mut ids = Vec::new();
    for n in 0..5 {
        let id = running_http(&h, &format!("{}.bin", n)).await;
        finish(&h, BackendKind::Http, id).await;
        ids.push(id);
    }

    let kept: Vec<TaskId> = h
        .engine
        .list_history(&HistoryFilter::default())
        .await
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(kept, vec![ids[4], ids[3], ids[2]]);
    assert!(h.engine.get_history(ids[0]).await.is_none());
}

#[tokio::test]
async fn history_filters_by_owner_and_limit() {
    let h = create_test_engine().await;
    let web = running_http(&h, "web.bin").await;
    finish(&h, BackendKind::Http, web).await;
    let mut torrents = Vec::new();
    for name in ["one", "two"] {
        let id = h.engine.submit(torrent_request(name)).await.unwrap();
        wait_for_job(&h.engine, id).await;
        finish(&h, BackendKind::Torrent, id).await;
        torrents.push(id);
    }

    let bob = h
        .engine
        .list_history(&HistoryFilter {
            owner: Some("bob".into()),
            ..Default::default()
        })
        .await;
    assert_eq!(bob.len(), 2);
    assert!(bob.iter().all(|e| e.backend == BackendKind::Torrent));

    let latest = h
        .engine
        .list_history(&HistoryFilter {
            limit: Some(1),
            ..Default::default()
        })
        .await;
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].id, torrents[1]);
}
