//! Concurrency Tests
//!
//! Runs several transfers at once and checks that each job's progress is
//! reported independently and never moves backwards.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use futures::future::join_all;
use serde_json::Value;

use common::{
    complete_upload, create_test_app, init_upload, payload, upload_chunk, upload_in_order,
    wait_for_job, MB,
};

async fn poll(server: &TestServer, job_id: &str) -> Value {
    let response = server.get(&format!("/upload-progress/{}", job_id)).await;
    response.assert_status_ok();
    response.json::<Value>()
}

#[tokio::test]
async fn test_concurrent_jobs_progress_independently() {
    let app = create_test_app();
    app.store.set_part_delay(Duration::from_millis(20)).await;

    let data_a = payload(3 * MB);
    let data_b = payload(6 * MB + 17);

    upload_in_order(&app.server, "job-a", "a.bin", &data_a, 2 * MB, &[1, 0]).await;
    upload_in_order(&app.server, "job-b", "b.bin", &data_b, 2 * MB, &[3, 0, 2, 1]).await;

    complete_upload(&app.server, "job-a").await.assert_status_ok();
    complete_upload(&app.server, "job-b").await.assert_status_ok();

    let mut last_a = 0;
    let mut last_b = 0;
    let mut done_a = None;
    let mut done_b = None;

    for _ in 0..400 {
        let a = poll(&app.server, "job-a").await;
        let b = poll(&app.server, "job-b").await;

        assert_eq!(a["job_id"], "job-a");
        assert_eq!(a["file_name"], "a.bin");
        assert_eq!(a["size"], data_a.len());
        assert_eq!(b["job_id"], "job-b");
        assert_eq!(b["file_name"], "b.bin");
        assert_eq!(b["size"], data_b.len());

        let percent_a = a["percent"].as_u64().unwrap();
        let percent_b = b["percent"].as_u64().unwrap();
        assert!(percent_a >= last_a, "job-a went from {last_a} to {percent_a}");
        assert!(percent_b >= last_b, "job-b went from {last_b} to {percent_b}");
        last_a = percent_a;
        last_b = percent_b;

        if a["status"] != "uploading" {
            done_a.get_or_insert(a);
        }
        if b["status"] != "uploading" {
            done_b.get_or_insert(b);
        }
        if done_a.is_some() && done_b.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let a = done_a.expect("job-a did not finish");
    let b = done_b.expect("job-b did not finish");
    assert_eq!(a["status"], "completed");
    assert_eq!(b["status"], "completed");
    assert_ne!(a["remote_file_id"], b["remote_file_id"]);

    let stored_a = app
        .store
        .object_bytes(a["remote_file_id"].as_str().unwrap())
        .await
        .unwrap();
    let stored_b = app
        .store
        .object_bytes(b["remote_file_id"].as_str().unwrap())
        .await
        .unwrap();
    assert_eq!(&stored_a[..], &data_a[..]);
    assert_eq!(&stored_b[..], &data_b[..]);
}

#[tokio::test]
async fn test_cancel_one_job_leaves_the_other_running() {
    let app = create_test_app();
    app.store.set_part_delay(Duration::from_millis(50)).await;

    let data = payload(4 * MB);
    upload_in_order(&app.server, "keep", "keep.bin", &data, 2 * MB, &[0, 1]).await;
    upload_in_order(&app.server, "drop", "drop.bin", &data, 2 * MB, &[0, 1]).await;

    complete_upload(&app.server, "keep").await.assert_status_ok();
    complete_upload(&app.server, "drop").await.assert_status_ok();

    let response = app
        .server
        .post("/cancel-upload")
        .json(&serde_json::json!({ "session_id": "drop" }))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["transfer_cancelled"], true);

    let dropped = wait_for_job(&app.server, "drop").await;
    let kept = wait_for_job(&app.server, "keep").await;
    assert_eq!(dropped["status"], "failed");
    assert_eq!(kept["status"], "completed");
    assert_eq!(app.store.object_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_chunks_for_one_session() {
    let app = create_test_app();
    let data = payload(64 * 1024);
    let chunks: Vec<&[u8]> = data.chunks(4096).collect();
    let total = chunks.len() as u32;

    init_upload(&app.server, "burst", "burst.bin", total, data.len())
        .await
        .assert_status_ok();

    // Every chunk twice, all in flight together
    let uploads = (0..total).chain(0..total).map(|index| {
        upload_chunk(&app.server, "burst", "burst.bin", index, total, chunks[index as usize])
    });
    for response in join_all(uploads).await {
        response.assert_status_ok();
    }

    let status = init_upload(&app.server, "burst", "burst.bin", total, data.len()).await;
    assert_eq!(status.json::<Value>()["received_count"], total);

    complete_upload(&app.server, "burst").await.assert_status_ok();
    let job = wait_for_job(&app.server, "burst").await;
    assert_eq!(job["status"], "completed");

    let stored = app
        .store
        .object_bytes(job["remote_file_id"].as_str().unwrap())
        .await
        .unwrap();
    assert_eq!(&stored[..], &data[..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chunks_resent_during_completion() {
    for round in 0..10 {
        let app = create_test_app();
        let session_id = format!("resend-{round}");
        let session_id = session_id.as_str();
        let data = payload(8 * 1024);
        let chunks: Vec<&[u8]> = data.chunks(1024).collect();
        let total = chunks.len() as u32;
        let order: Vec<u32> = (0..total).collect();

        upload_in_order(&app.server, session_id, "r.bin", &data, 1024, &order).await;

        let resends = join_all((0..total).map(|index| {
            upload_chunk(&app.server, session_id, "r.bin", index, total, chunks[index as usize])
        }));
        let (completion, resends) =
            futures::join!(complete_upload(&app.server, session_id), resends);

        completion.assert_status_ok();
        for response in resends {
            let code = response.status_code();
            assert!(
                code == StatusCode::OK
                    || code == StatusCode::CONFLICT
                    || code == StatusCode::UNPROCESSABLE_ENTITY,
                "unexpected status {code}"
            );
        }

        let job = wait_for_job(&app.server, session_id).await;
        assert_eq!(job["status"], "completed", "error: {}", job["error"]);
        let stored = app
            .store
            .object_bytes(job["remote_file_id"].as_str().unwrap())
            .await
            .unwrap();
        assert_eq!(&stored[..], &data[..]);
    }
}

