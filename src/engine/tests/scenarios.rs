use super::*;
use crate::types::PostProcessStage;

#[tokio::test]
async fn third_task_waits_for_a_free_slot() {
    let h = create_test_engine().await;

    let a = submit_http(&h.engine, "a.bin", 0).await;
    let b = submit_http(&h.engine, "b.bin", 0).await;
    let c = submit_http(&h.engine, "c.bin", 0).await;

    wait_for_state(&h.engine, a, TaskState::Downloading).await;
    wait_for_state(&h.engine, b, TaskState::Downloading).await;
    wait_for_job(&h.engine, a).await;
    assert_eq!(h.engine.get_task(c).await.unwrap().state, TaskState::Queued);

    let stats = h.engine.queue_stats().await;
    assert_eq!(stats.active_slots, 2);
    assert_eq!(stats.queued, 1);

    let entry = finish(&h, BackendKind::Http, a).await;
    assert_eq!(entry.state, TaskState::Completed);
    wait_for_state(&h.engine, c, TaskState::Downloading).await;
}

#[tokio::test]
async fn native_pause_keeps_slot_and_progress() {
    let h = create_test_engine().await;
    let torrent = h.mock(BackendKind::Torrent);

    let id = h.engine.submit(torrent_request("linux.iso")).await.unwrap();
    wait_for_job(&h.engine, id).await;
    torrent.set_progress(id, 400, 1_000);
    let engine = &h.engine;
    wait_until("progress at 400", || async move {
        engine.get_task(id).await.unwrap().progress.bytes_done == 400
    })
    .await;

    let paused = h.engine.pause(id).await.unwrap();
    assert_eq!(paused.state, TaskState::Paused);
    assert!(paused.slot_held);
    assert_eq!(paused.progress.bytes_done, 400);
    assert_eq!(h.engine.queue_stats().await.active_slots, 1);
    assert_eq!(torrent.pause_count(), 1);

    // The poller is halted while paused
    torrent.set_progress(id, 500, 1_000);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.engine.get_task(id).await.unwrap().progress.bytes_done, 400);

    let resumed = h.engine.resume(id).await.unwrap();
    assert_eq!(resumed.state, TaskState::Downloading);
    assert_eq!(resumed.progress.bytes_done, 400);
    assert_eq!(torrent.resume_count(), 1);
    assert_eq!(torrent.submit_count(), 1);

    torrent.set_progress(id, 700, 1_000);
    wait_until("progress continues from the same offset", || async move {
        engine.get_task(id).await.unwrap().progress.bytes_done == 700
    })
    .await;
}

#[tokio::test]
async fn submit_succeeds_on_third_attempt() {
    let h = create_test_engine().await;
    let http = h.mock(BackendKind::Http);
    http.fail_submits([Failure::Transient, Failure::Transient]);
    let mut events = h.engine.subscribe();

    let mut request = http_request("flaky.bin");
    request.max_retries = Some(3);
    let id = h.engine.submit(request).await.unwrap();

    let snapshot = wait_for_job(&h.engine, id).await;
    assert_eq!(snapshot.state, TaskState::Downloading);
    assert_eq!(snapshot.retry_count, 2);
    assert_eq!(http.submit_count(), 3);

    let mut attempts = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::RetryScheduled { id: event_id, attempt, max_retries, .. } = event
            && event_id == id
        {
            assert_eq!(max_retries, 3);
            attempts.push(attempt);
        }
    }
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn failed_extraction_keeps_download_and_records_history() {
    let h = create_test_engine().await;

    let mut request = http_request("bundle.zip");
    request.stages = vec![PostProcessStage::Extract {
        delete_archive: true,
        password: None,
    }];
    let id = h.engine.submit(request).await.unwrap();
    wait_for_job(&h.engine, id).await;

    let archive = h.artifact("bundle.zip", b"this is not a zip archive");
    h.mock(BackendKind::Http).complete(id, archive.clone());

    let entry = wait_for_history(&h.engine, id).await;
    assert_eq!(entry.state, TaskState::Failed);
    let error = entry.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::Processing);

    assert!(archive.exists(), "original download must survive");
    assert!(!archive.with_file_name("bundle.extracted").exists());
    assert!(h.uploader.uploads().is_empty());
    // The finished job is left for inspection
    assert_eq!(h.mock(BackendKind::Http).cancel_count(), 0);
    assert!(matches!(h.engine.get_task(id).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn cancelling_a_queued_task_leaves_slots_alone() {
    let h = create_test_engine().await;
    let a = running_http(&h, "a.bin").await;
    let b = running_http(&h, "b.bin").await;

    let low = submit_http(&h.engine, "low.bin", 10).await;
    assert_eq!(h.engine.get_task(low).await.unwrap().state, TaskState::Queued);

    h.engine.cancel(low).await.unwrap();

    let entry = h.engine.get_history(low).await.unwrap();
    assert_eq!(entry.state, TaskState::Cancelled);
    assert!(matches!(h.engine.get_task(low).await, Err(Error::NotFound(_))));
    assert_eq!(h.engine.queue_stats().await.active_slots, 2);
    for id in [a, b] {
        assert_eq!(h.engine.get_task(id).await.unwrap().state, TaskState::Downloading);
    }
    assert_eq!(h.mock(BackendKind::Http).submit_count(), 2);
}

#[tokio::test]
async fn global_cap_is_shared_and_reallocated_on_join() {
    let h = create_test_engine_with(
        |config| {
            config.engine.max_concurrent = 3;
            config.engine.global_bandwidth_bps = Some(1_000_000);
        },
        default_mocks(),
    )
    .await;
    let http = h.mock(BackendKind::Http);

    let a = running_http(&h, "a.bin").await;
    let b = running_http(&h, "b.bin").await;
    wait_until("two equal shares", || async move {
        http.cap_of(a) == Some(500_000) && http.cap_of(b) == Some(500_000)
    })
    .await;

    let c = running_http(&h, "c.bin").await;
    wait_until("three equal shares", || async move {
        [a, b, c].iter().all(|id| http.cap_of(*id) == Some(333_333))
    })
    .await;
}
