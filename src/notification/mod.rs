//! 通知层 - 把轮询结果变成投递到邮局的通知
//!
//! # 组成
//! 1. `NotificationBackend`：外部邮局服务的接口（查询在显 tag、投递消息）
//! 2. `NotificationDispatcher`：按批次限流、合并溢出并逐条投递
//! 3. `channels`：后端实现（JSONL 发件箱、dry-run）

pub mod backend;
pub mod channels;
pub mod dispatcher;
pub mod store;

pub use backend::{object_path, NotificationBackend};
pub use channels::{DryRunBackend, OutboxBackend};
pub use dispatcher::{count_tags, plan_batch, DeliveryReport, NotificationDispatcher, PostWatch, OVERFLOW_SUFFIX};
pub use store::{OutboxRecord, OutboxStore};
