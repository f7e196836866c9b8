//! 通知后端实现

pub mod dry_run;
pub mod outbox;

pub use dry_run::DryRunBackend;
pub use outbox::OutboxBackend;
