//! End-to-end runs of the archive pipeline against a mocked upstream.

use std::sync::Arc;
use std::time::Duration;

use post_archiver::pipeline::{
    ArchiverConfig, Cursor, JobStatus, Orchestrator, PipelineState, Producer, StageKind,
    StageOutcome,
};
use post_archiver::scheduler::FanOut;
use post_archiver::storage::{ConfigStore, MemoryConfigStore, MemoryStorage, Storage};
use post_archiver::upstream::{RateLimiter, RetryPolicy, UpstreamClient};
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn submission(id: &str, created_utc: i64, flair: &str) -> Value {
    json!({
        "id": id,
        "created_utc": created_utc,
        "title": format!("post {id}"),
        "author": "someone",
        "score": 10,
        "subreddit": "Superstonk",
        "link_flair_text": flair,
    })
}

fn test_config(server: &MockServer) -> ArchiverConfig {
    ArchiverConfig::default()
        .with_upstream_url(server.uri())
        .with_flair("DD")
        .with_rate_limit(1000.0, 100)
        .with_max_attempts(3, 3)
        .with_backoff_base(Duration::from_millis(1))
        .with_queue_timeout(Duration::from_secs(5))
}

/// Page 1 holds three submissions, two with a matching flair; page 2 is empty.
async fn mount_two_pages(server: &MockServer, page_one: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/search/submission"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": page_one })))
        .up_to_n_times(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search/submission"))
        .and(query_param("after", "300"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(server)
        .await;
}

async fn mount_comments(server: &MockServer, ids: &[&str]) {
    for id in ids {
        Mock::given(method("GET"))
            .and(path(format!("/submission/comment_ids/{id}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "data": [format!("{id}c1"), format!("{id}c2")] })),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search/comment"))
            .and(query_param("ids", format!("{id}c1,{id}c2")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": format!("{id}c1"), "body": "first"},
                    {"id": format!("{id}c2"), "body": "second"},
                ]
            })))
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_two_page_run_archives_matching_items_in_every_stage() {
    let server = MockServer::start().await;
    mount_two_pages(
        &server,
        vec![
            submission("p1", 100, "DD 👨‍🔬"),
            submission("p2", 200, "Meme"),
            submission("p3", 300, "DD 👨‍🔬"),
        ],
    )
    .await;
    mount_comments(&server, &["p1", "p3"]).await;

    let storage = Arc::new(MemoryStorage::new());
    let config_store = Arc::new(MemoryConfigStore::new());
    let orchestrator = Orchestrator::new(test_config(&server), storage.clone(), config_store.clone());

    let report = orchestrator.run().await.expect("run");

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(orchestrator.state(), PipelineState::Completed);
    assert_eq!(
        report.submissions.keys().collect::<Vec<_>>(),
        vec!["p1", "p3"]
    );
    for stages in report.submissions.values() {
        assert_eq!(stages.len(), 3);
        assert!(stages.values().all(|r| r.is_success()));
    }
    assert_eq!(
        config_store.get_config().await.expect("config").cursor,
        Some(Cursor(300))
    );

    let post = storage.read_json("p1/post.json").await.expect("read").expect("post");
    assert_eq!(post["link_flair_text"], "DD 👨‍🔬");
    let comments = storage
        .read_json("p3/comments.json")
        .await
        .expect("read")
        .expect("comments");
    assert_eq!(comments.as_array().map(Vec::len), Some(2));
    assert!(storage.read("p2/post.json").await.expect("read").is_none());

    let comments_result = &report.submissions["p1"][&StageKind::Comments];
    match &comments_result.outcome {
        StageOutcome::Success { fragment } => {
            assert_eq!(fragment["submission_id"], "p1");
            assert_eq!(fragment["comment_count"], 2);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let reports: Vec<String> = storage
        .paths()
        .await
        .into_iter()
        .filter(|p| p.starts_with("report-"))
        .collect();
    assert_eq!(reports, vec![report.file_name()]);
}

#[tokio::test]
async fn test_producer_enqueues_matching_items_to_every_stage() {
    let server = MockServer::start().await;
    mount_two_pages(
        &server,
        vec![
            submission("p1", 100, "DD"),
            submission("p2", 200, "Meme"),
            submission("p3", 300, "DD"),
        ],
    )
    .await;

    let config = test_config(&server);
    let limiter = Arc::new(RateLimiter::new(config.rate_limit, config.burst).expect("limiter"));
    let upstream = UpstreamClient::new(
        &config.upstream_url,
        limiter,
        RetryPolicy::new(2).with_base_delay(Duration::from_millis(1)),
        Duration::from_secs(5),
    )
    .expect("client");
    let config_store = Arc::new(MemoryConfigStore::new());
    let fan_out = FanOut::new(&StageKind::ALL);

    let summary = Producer::new(Arc::new(upstream), config_store.clone(), &config)
        .run(&fan_out)
        .await
        .expect("discovery");

    assert_eq!(summary.pages, 1);
    assert_eq!(summary.published, 2);
    assert_eq!(summary.cursor, Some(Cursor(300)));
    for queue in fan_out.queues() {
        assert_eq!(queue.enqueued_total(), 2, "{}", queue.stage());
        assert!(queue.is_closed());
    }
}

#[tokio::test]
async fn test_broken_image_fails_only_the_media_stage() {
    let server = MockServer::start().await;
    let mut broken = submission("p1", 100, "DD");
    broken["post_hint"] = json!("image");
    broken["url"] = json!(format!("{}/media/broken.png", server.uri()));
    mount_two_pages(
        &server,
        vec![broken, submission("p2", 200, "Meme"), submission("p3", 300, "DD")],
    )
    .await;
    mount_comments(&server, &["p1", "p3"]).await;
    Mock::given(method("GET"))
        .and(path("/media/broken.png"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::new());
    let orchestrator = Orchestrator::new(
        test_config(&server),
        storage.clone(),
        Arc::new(MemoryConfigStore::new()),
    );

    let report = orchestrator.run().await.expect("run");

    // Item failures never fail the job.
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.failure_count(), 1);

    let p1 = &report.submissions["p1"];
    assert!(p1[&StageKind::Submission].is_success());
    assert!(p1[&StageKind::Comments].is_success());
    match &p1[&StageKind::Media].outcome {
        StageOutcome::Failure { error } => assert!(error.contains("3 attempts"), "{error}"),
        other => panic!("expected media failure, got {other:?}"),
    }
    assert!(report.submissions["p3"].values().all(|r| r.is_success()));

    let stored = storage
        .read_json(&report.file_name())
        .await
        .expect("read")
        .expect("report");
    assert_eq!(stored["submissions"]["p1"]["media"]["outcome"]["status"], "failure");
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search/submission"))
        .and(query_param("after", "300"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let config_store = Arc::new(MemoryConfigStore::new());
    let mut saved = config_store.get_config().await.expect("config");
    saved.cursor = Some(Cursor(300));
    config_store.put_config(&saved).await.expect("put");

    // The configured lower bound is older than the saved cursor.
    let config = test_config(&server).with_window(Some(Cursor(50)), None);
    let report = Orchestrator::new(config, Arc::new(MemoryStorage::new()), config_store)
        .run()
        .await
        .expect("run");

    assert_eq!(report.status, JobStatus::Completed);
    assert!(report.submissions.is_empty());
}

#[tokio::test]
async fn test_slow_discovery_page_reaches_every_stage() {
    let server = MockServer::start().await;
    let mut p1 = submission("p1", 100, "DD");
    p1["post_hint"] = json!("image");
    p1["url"] = json!(format!("{}/media/big.png", server.uri()));

    Mock::given(method("GET"))
        .and(path("/search/submission"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [p1] })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    // The second page arrives long after the pull timeout.
    Mock::given(method("GET"))
        .and(path("/search/submission"))
        .and(query_param("after", "100"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": [submission("p2", 200, "DD")] }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search/submission"))
        .and(query_param("after", "200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&server)
        .await;
    mount_comments(&server, &["p1", "p2"]).await;
    // Keeps the single media worker busy while the other pools sit idle.
    Mock::given(method("GET"))
        .and(path("/media/big.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![7u8; 16])
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::new());
    let config_store = Arc::new(MemoryConfigStore::new());
    let config = test_config(&server)
        .with_queue_timeout(Duration::from_secs(1))
        .with_workers(StageKind::Media, 1);
    let report = Orchestrator::new(config, storage.clone(), config_store.clone())
        .run()
        .await
        .expect("run");

    assert_eq!(report.status, JobStatus::Completed);
    for id in ["p1", "p2"] {
        let stages = &report.submissions[id];
        assert_eq!(stages.len(), 3, "{id}");
        assert!(stages.values().all(|r| r.is_success()), "{id}");
    }
    assert!(storage.read("p2/post.json").await.expect("read").is_some());
    assert!(storage.read("p1/big.png").await.expect("read").is_some());
    assert_eq!(
        config_store.get_config().await.expect("config").cursor,
        Some(Cursor(200))
    );
}
