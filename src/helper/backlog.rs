//! 等待执行的 helper 输入（FIFO，跳过正在运行的应用）

use std::collections::HashSet;
use tracing::debug;

use super::HelperInput;
use crate::click::AppId;

/// 取出的位置留空，活跃条目明显少于容量时才压缩
#[derive(Debug, Default)]
pub(crate) struct Backlog {
    entries: Vec<Option<HelperInput>>,
    live: usize,
}

impl Backlog {
    pub fn push(&mut self, input: HelperInput) {
        self.entries.push(Some(input));
        self.live += 1;
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// 按提交顺序取出第一个应用未在运行的条目
    pub fn take_next(&mut self, running: &HashSet<AppId>) -> Option<HelperInput> {
        let slot = self
            .entries
            .iter_mut()
            .find(|e| matches!(e, Some(input) if !running.contains(&input.app_id)))?;
        let input = slot.take();
        self.live -= 1;
        input
    }

    pub fn compact(&mut self) {
        if self.live == 0 {
            self.entries = Vec::new();
            return;
        }
        if self.entries.capacity() < 2 * self.live {
            return;
        }
        debug!(
            used = self.live,
            capacity = self.entries.capacity(),
            "Copying backlog to avoid wasting space"
        );
        let mut clean = Vec::with_capacity(self.live);
        clean.extend(self.entries.drain(..).filter(Option::is_some));
        self.entries = clean;
    }

    pub fn drain(&mut self) -> Vec<HelperInput> {
        self.live = 0;
        std::mem::take(&mut self.entries).into_iter().flatten().collect()
    }
}
