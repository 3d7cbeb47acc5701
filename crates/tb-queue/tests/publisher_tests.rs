use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tb_common::{QueueEnvelope, TenantId};
use tb_queue::{EnvelopePublisher, MemoryQueue, QueueClient, QueueNaming, QueuePublisher};
use uuid::Uuid;

fn envelope() -> QueueEnvelope {
    QueueEnvelope {
        outbox_id: Uuid::new_v4(),
        tenant_id: TenantId::new(),
        message_type: "note.created".to_string(),
        payload: r#"{"title":"hi"}"#.to_string(),
        correlation_id: Some("c-1".to_string()),
        idempotency_key: Some("k-1".to_string()),
        occurred_at: Utc::now(),
        schema_version: 1,
    }
}

#[tokio::test]
async fn test_publish_uses_prefixed_queue() {
    let queue = Arc::new(MemoryQueue::default());
    let publisher = EnvelopePublisher::new(queue.clone(), QueueNaming::new("prod"));
    let envelope = envelope();

    publisher.publish("Notes", &envelope).await.unwrap();

    let received = queue.receive("prod-notes", 10, Duration::from_secs(30)).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(QueueEnvelope::from_json(&received[0].body).unwrap(), envelope);
}

#[tokio::test(start_paused = true)]
async fn test_poison_publish_applies_retention() {
    let queue = Arc::new(MemoryQueue::default());
    let publisher = EnvelopePublisher::new(queue.clone(), QueueNaming::default())
        .with_poison_ttl(Duration::from_secs(3600));

    publisher.publish_poison("notes", &envelope()).await.unwrap();
    assert_eq!(queue.depth("notes-poison"), 1);
    assert_eq!(queue.depth("notes"), 0);

    tokio::time::advance(Duration::from_secs(3601)).await;
    assert_eq!(queue.depth("notes-poison"), 0);
}

#[tokio::test]
async fn test_blank_queue_name_is_rejected() {
    let queue = Arc::new(MemoryQueue::default());
    let publisher = EnvelopePublisher::new(queue, QueueNaming::default());
    assert!(publisher.publish("  ", &envelope()).await.is_err());
}
