mod common;

use ingest_sdk::model::{DataKind, QueueStatus};
use ingest_sdk::{ClientError, IngestClient, SubmitOutcome};
use serde_json::json;

use sync_ingest::routes::build_router;
use sync_ingest::state::AppState;
use sync_ingest::store::MemoryStore;

use common::{contacts, memory_state, TestResult};

async fn serve(state: AppState) -> Result<String, std::io::Error> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.ok();
    });
    Ok(format!("http://{addr}"))
}

#[tokio::test]
async fn client_follows_a_job_from_receipt_to_completion() -> TestResult {
    let store = MemoryStore::new();
    let state = memory_state(&store);
    let client = IngestClient::new(serve(state.clone()).await?);

    match client.submit(DataKind::Contacts, "D1", contacts(10)).await? {
        SubmitOutcome::Processed(summary) => {
            assert_eq!(summary.processed, 10);
            assert_eq!(summary.inserted, 10);
        }
        other => panic!("expected inline processing, got {other:?}"),
    }

    let receipt = match client.submit(DataKind::Contacts, "D1", contacts(700)).await? {
        SubmitOutcome::Queued(receipt) => receipt,
        other => panic!("expected queued receipt, got {other:?}"),
    };
    assert_eq!(receipt.estimated_batches, 7);

    let view = client.job_status(receipt.queue_id).await?;
    assert_eq!(view.status, QueueStatus::Pending);

    state.worker().run_once().await?;
    let view = client.job_status(receipt.queue_id).await?;
    assert_eq!(view.status, QueueStatus::Completed);
    assert_eq!(view.processed_count, 700);
    assert_eq!(view.progress, 100);

    let status = client.queue_status().await?;
    assert!(!status.queue_status.is_processing);
    assert_eq!(status.queue_status.batch_size, 100);

    assert_eq!(client.clear_failed().await?, 0);
    Ok(())
}

#[tokio::test]
async fn client_surfaces_rejections() -> TestResult {
    let store = MemoryStore::new();
    let client = IngestClient::new(serve(memory_state(&store)).await?);

    let err = client
        .job_status(uuid::Uuid::new_v4())
        .await
        .expect_err("unknown job");
    match err {
        ClientError::UnexpectedStatus { status, body } => {
            assert_eq!(status.as_u16(), 404);
            assert!(body.contains("Queue item not found"));
        }
        other => panic!("unexpected error: {other}"),
    }

    match client
        .submit(DataKind::Whatsapp, "D1", vec![json!({"id": 1})])
        .await
    {
        Err(ClientError::UnexpectedStatus { status, .. }) => assert_eq!(status.as_u16(), 400),
        other => panic!("whatsapp uploads have no inline handler: {other:?}"),
    }
    Ok(())
}
