//! 邮局端到端测试：分发器 + JSONL 发件箱

use std::sync::Arc;

use account_polld::{
    default_overflow, AppId, NotificationBackend, NotificationDispatcher, OutboxBackend, PostWatch, PushMessage,
    PushMessageBatch,
};
use tokio::sync::mpsc;

fn app() -> AppId {
    AppId::new("com.example.mail_mail")
}

fn batch(n: usize) -> PushMessageBatch {
    let messages = (0..n)
        .map(|i| PushMessage::standard(format!("sender{}", i), "hello", format!("mail://{}", i), None, 0))
        .collect();
    PushMessageBatch::new("t", 2, messages, Arc::new(default_overflow))
}

#[tokio::test]
async fn test_second_cycle_suppresses_overflow_card() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(OutboxBackend::new(dir.path().join("outbox.jsonl")));
    let dispatcher = NotificationDispatcher::new(backend.clone());

    let first = dispatcher.deliver(&PostWatch::new(app(), vec![batch(5)])).await.unwrap();
    assert_eq!(first.posted, 3);

    let records = backend.store().records_for("com.example.mail_mail");
    let tags: Vec<&str> = records.iter().map(|r| r.tag.as_str()).collect();
    assert_eq!(tags, vec!["t", "t", "t-overflow"]);
    assert!(records.iter().all(|r| r.has_card));
    assert_eq!(
        records[2].message["notification"]["card"]["summary"],
        "3 more notifications"
    );

    // 两条 t 已占满名额，全部消息并入已显示的溢出通知
    let second = dispatcher.deliver(&PostWatch::new(app(), vec![batch(5)])).await.unwrap();
    assert_eq!(second.posted, 1);

    let records = backend.store().records_for("com.example.mail_mail");
    assert_eq!(records.len(), 4);
    let last = &records[3];
    assert_eq!(last.tag, "t-overflow");
    assert!(!last.has_card);
    assert_eq!(last.message["notification"]["sound"], true);

    let persistent = backend.list_persistent(&app()).await.unwrap();
    assert_eq!(persistent.len(), 3);
}

#[tokio::test]
async fn test_dispatcher_loop_drains_queue_then_stops() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(OutboxBackend::new(dir.path().join("outbox.jsonl")));
    let (tx, rx) = mpsc::channel(8);
    let office = tokio::spawn(NotificationDispatcher::new(backend.clone()).run(rx));

    let chat = AppId::new("com.example.chat_chat");
    tx.send(PostWatch::new(app(), vec![batch(1)])).await.unwrap();
    tx.send(PostWatch::new(chat, vec![PushMessageBatch::unlimited("c", Vec::new())]))
        .await
        .unwrap();
    tx.send(PostWatch::new(AppId::new("bogus"), vec![batch(1)])).await.unwrap();
    drop(tx);
    office.await.unwrap();

    let records = backend.store().read_all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].app_id, "com.example.mail_mail");
}
