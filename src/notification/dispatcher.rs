//! 通知分发器（邮局）- 把消息批次转换为限流、去重后的投递调用
//!
//! 每个批次按 tag 限流：当前仍在显示的同 tag 通知占用名额，剩余名额内的消息
//! 单独投递，其余交给批次的溢出处理合并成一条 `<tag>-overflow` 通知。
//! 若溢出通知已在显示，则只投递提醒、不替换卡片，避免界面闪烁。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::backend::{object_path, NotificationBackend};
use crate::click::AppId;
use crate::errors::PostalError;
use crate::plugins::{PushMessage, PushMessageBatch};

/// 溢出通知 tag 后缀
pub const OVERFLOW_SUFFIX: &str = "-overflow";

/// 某应用一轮轮询产出的全部批次
#[derive(Debug, Clone)]
pub struct PostWatch {
    pub app_id: AppId,
    pub batches: Vec<PushMessageBatch>,
}

impl PostWatch {
    pub fn new(app_id: AppId, batches: Vec<PushMessageBatch>) -> Self {
        Self { app_id, batches }
    }
}

/// 一次投递的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub posted: usize,
    pub failed: usize,
}

/// 统计每个 tag 的在显通知数量
pub fn count_tags(tags: &[String]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for tag in tags {
        *counts.entry(tag.clone()).or_insert(0) += 1;
    }
    counts
}

/// 计算一个批次实际要投递的消息（按顺序：单条消息在前，溢出消息最后）
pub fn plan_batch(batch: &PushMessageBatch, presented: &HashMap<String, usize>) -> Vec<PushMessage> {
    let shown = presented.get(&batch.tag).copied().unwrap_or(0);
    let room = batch.limit.saturating_sub(shown);
    let take = room.min(batch.messages.len());

    let mut notifs: Vec<PushMessage> = batch.messages[..take]
        .iter()
        .cloned()
        .map(|mut m| {
            m.set_tag(batch.tag.clone());
            m
        })
        .collect();

    if take < batch.messages.len() {
        let overflow_tag = format!("{}{}", batch.tag, OVERFLOW_SUFFIX);
        let mut overflow = (batch.overflow_handler)(&batch.messages[take..]);
        overflow.set_tag(overflow_tag.clone());
        if presented.get(&overflow_tag).copied().unwrap_or(0) != 0 {
            // 不替换已显示的溢出卡片，只播放提醒
            overflow.suppress_card();
        }
        notifs.push(overflow);
    }

    notifs
}

/// 通知分发器
pub struct NotificationDispatcher {
    backend: Arc<dyn NotificationBackend>,
}

impl NotificationDispatcher {
    pub fn new(backend: Arc<dyn NotificationBackend>) -> Self {
        info!(backend = backend.name(), "Using notification backend");
        Self { backend }
    }

    /// 投递一个应用的全部批次
    ///
    /// 单条消息投递失败只记录日志，不影响其余消息。
    pub async fn deliver(&self, post: &PostWatch) -> Result<DeliveryReport, PostalError> {
        object_path(&post.app_id)?;

        let tags = self.backend.list_persistent(&post.app_id).await?;
        debug!(app_id = %post.app_id, tags = ?tags, "Previous messages");
        let presented = count_tags(&tags);

        let mut report = DeliveryReport::default();
        for batch in &post.batches {
            for notif in plan_batch(batch, &presented) {
                let payload = match serde_json::to_string(&notif) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(app_id = %post.app_id, error = %e, "Cannot serialize push message");
                        report.failed += 1;
                        continue;
                    }
                };

                match self.backend.post(&post.app_id, &payload).await {
                    Ok(()) => report.posted += 1,
                    Err(e) => {
                        warn!(
                            app_id = %post.app_id,
                            error = %e,
                            message = %payload,
                            "Cannot post notification, message missed posting"
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// 消费批次队列直到所有发送端关闭
    pub async fn run(self, mut rx: mpsc::Receiver<PostWatch>) {
        info!("Post office started");
        while let Some(post) = rx.recv().await {
            match self.deliver(&post).await {
                Ok(report) => debug!(
                    app_id = %post.app_id,
                    posted = report.posted,
                    failed = report.failed,
                    "Delivered batches"
                ),
                Err(e) => warn!(app_id = %post.app_id, error = %e, "Dropping batches for app"),
            }
        }
        info!("Post office stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::default_overflow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 测试用的记录型后端
    struct RecordingBackend {
        persistent: Vec<String>,
        posts: Mutex<Vec<PushMessage>>,
        fail_on: Option<usize>,
        calls: AtomicUsize,
    }

    impl RecordingBackend {
        fn new(persistent: &[&str]) -> Self {
            Self {
                persistent: persistent.iter().map(|s| s.to_string()).collect(),
                posts: Mutex::new(Vec::new()),
                fail_on: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing_on(mut self, n: usize) -> Self {
            self.fail_on = Some(n);
            self
        }

        fn posts(&self) -> Vec<PushMessage> {
            self.posts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn list_persistent(&self, _app_id: &AppId) -> Result<Vec<String>, PostalError> {
            Ok(self.persistent.clone())
        }

        async fn post(&self, _app_id: &AppId, message: &str) -> Result<(), PostalError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(n) {
                return Err(PostalError::Backend("bus error".to_string()));
            }
            self.posts.lock().unwrap().push(serde_json::from_str(message)?);
            Ok(())
        }
    }

    fn messages(n: usize) -> Vec<PushMessage> {
        (0..n)
            .map(|i| PushMessage::standard(format!("sender{}", i), "body", format!("act://{}", i), None, 0))
            .collect()
    }

    fn batch(tag: &str, limit: usize, n: usize) -> PushMessageBatch {
        PushMessageBatch::new(tag, limit, messages(n), Arc::new(default_overflow))
    }

    fn app() -> AppId {
        AppId::new("com.example.mail_mail")
    }

    #[test]
    fn test_plan_under_limit_shows_all() {
        let planned = plan_batch(&batch("t", 5, 3), &HashMap::new());
        assert_eq!(planned.len(), 3);
        assert!(planned.iter().all(|m| m.tag() == "t"));
    }

    #[test]
    fn test_plan_overflow_consolidates_remainder() {
        let planned = plan_batch(&batch("t", 2, 5), &HashMap::new());
        assert_eq!(planned.len(), 3);
        assert_eq!(planned[0].tag(), "t");
        assert_eq!(planned[1].tag(), "t");
        assert_eq!(planned[2].tag(), "t-overflow");
        assert_eq!(planned[2].summary(), Some("3 more notifications"));
        assert!(!planned[2].is_card_suppressed());
    }

    #[test]
    fn test_plan_counts_presented() {
        let presented = count_tags(&["t".to_string()]);
        let planned = plan_batch(&batch("t", 2, 5), &presented);
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].summary(), Some("sender0"));
        assert_eq!(planned[1].tag(), "t-overflow");
    }

    #[test]
    fn test_plan_no_room_everything_overflows() {
        let presented = count_tags(&["t".to_string(), "t".to_string(), "t".to_string()]);
        let planned = plan_batch(&batch("t", 2, 4), &presented);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].tag(), "t-overflow");
        assert_eq!(planned[0].summary(), Some("4 more notifications"));
    }

    #[test]
    fn test_plan_empty_batch() {
        assert!(plan_batch(&batch("t", 2, 0), &HashMap::new()).is_empty());
    }

    #[tokio::test]
    async fn test_deliver_limit_and_overflow_order() {
        let backend = Arc::new(RecordingBackend::new(&[]));
        let dispatcher = NotificationDispatcher::new(backend.clone());

        let post = PostWatch::new(app(), vec![batch("t", 2, 5)]);
        let report = dispatcher.deliver(&post).await.unwrap();

        assert_eq!(report, DeliveryReport { posted: 3, failed: 0 });
        let tags: Vec<String> = backend.posts().iter().map(|m| m.tag().to_string()).collect();
        assert_eq!(tags, vec!["t", "t", "t-overflow"]);
    }

    #[tokio::test]
    async fn test_deliver_suppresses_existing_overflow_card() {
        let backend = Arc::new(RecordingBackend::new(&["t-overflow"]));
        let dispatcher = NotificationDispatcher::new(backend.clone());

        let mut b = batch("t", 2, 5);
        let handler: crate::plugins::OverflowHandler = Arc::new(|rest: &[PushMessage]| {
            PushMessage::standard("more", format!("{}", rest.len()), "act://overflow", None, 0)
        });
        b.overflow_handler = handler;
        dispatcher.deliver(&PostWatch::new(app(), vec![b])).await.unwrap();

        let posts = backend.posts();
        assert_eq!(posts.len(), 3);
        assert!(!posts[0].is_card_suppressed());
        let overflow = &posts[2];
        assert_eq!(overflow.tag(), "t-overflow");
        assert!(overflow.is_card_suppressed());
        assert!(overflow.notification.sound);
        assert!(overflow.notification.vibrate);
    }

    #[tokio::test]
    async fn test_deliver_continues_after_post_failure() {
        let backend = Arc::new(RecordingBackend::new(&[]).failing_on(0));
        let dispatcher = NotificationDispatcher::new(backend.clone());

        let post = PostWatch::new(app(), vec![batch("t", 3, 3)]);
        let report = dispatcher.deliver(&post).await.unwrap();

        assert_eq!(report, DeliveryReport { posted: 2, failed: 1 });
        let summaries: Vec<String> = backend
            .posts()
            .iter()
            .filter_map(|m| m.summary().map(str::to_string))
            .collect();
        assert_eq!(summaries, vec!["sender1", "sender2"]);
    }

    #[tokio::test]
    async fn test_deliver_rejects_invalid_app_id() {
        let backend = Arc::new(RecordingBackend::new(&[]));
        let dispatcher = NotificationDispatcher::new(backend.clone());

        let post = PostWatch::new(AppId::new("not-an-app-id"), vec![batch("t", 2, 1)]);
        assert!(matches!(
            dispatcher.deliver(&post).await,
            Err(PostalError::InvalidAppId(_))
        ));
        assert!(backend.posts().is_empty());
    }

    #[tokio::test]
    async fn test_run_processes_queue_in_order() {
        let backend = Arc::new(RecordingBackend::new(&[]));
        let dispatcher = NotificationDispatcher::new(backend.clone());
        let (tx, rx) = mpsc::channel(4);

        tx.send(PostWatch::new(app(), vec![batch("first", 5, 1)])).await.unwrap();
        tx.send(PostWatch::new(app(), vec![batch("second", 5, 1)])).await.unwrap();
        drop(tx);
        dispatcher.run(rx).await;

        let tags: Vec<String> = backend.posts().iter().map(|m| m.tag().to_string()).collect();
        assert_eq!(tags, vec!["first", "second"]);
    }
}
