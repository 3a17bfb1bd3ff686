use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

const SUCCESS_TTL: Duration = Duration::from_secs(3);
const INFO_TTL: Duration = Duration::from_secs(5);
const ERROR_TTL: Duration = Duration::from_secs(8);
const MAX_ACTIVE: usize = 5;

static NEXT_NOTICE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoticeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

/// A transient, non-blocking message for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: NoticeId,
    pub level: NoticeLevel,
    pub message: String,
    pub dismissable: bool,
    pub ttl: Duration,
    pub created_at: Instant,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Success, message, false, SUCCESS_TTL)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Info, message, true, INFO_TTL)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, message, true, ERROR_TTL)
    }

    fn new(level: NoticeLevel, message: impl Into<String>, dismissable: bool, ttl: Duration) -> Self {
        Self {
            id: NoticeId(NEXT_NOTICE_ID.fetch_add(1, Ordering::Relaxed)),
            level,
            message: message.into(),
            dismissable,
            ttl,
            created_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Notices currently on screen, oldest first.
#[derive(Debug, Default)]
pub struct NoticeBoard {
    active: Vec<Notice>,
}

impl NoticeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shows a notice. When the board is full the oldest one is dropped.
    pub fn push(&mut self, notice: Notice) -> NoticeId {
        let id = notice.id;
        if self.active.len() == MAX_ACTIVE {
            self.active.remove(0);
        }
        self.active.push(notice);
        id
    }

    /// Returns false for unknown ids and for notices that only expire.
    pub fn dismiss(&mut self, id: NoticeId) -> bool {
        match self.active.iter().position(|n| n.id == id) {
            Some(index) if self.active[index].dismissable => {
                self.active.remove(index);
                true
            }
            _ => false,
        }
    }

    /// Drops expired notices and returns how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.active.len();
        self.active.retain(|n| !n.is_expired(now));
        before - self.active.len()
    }

    pub fn active(&self) -> &[Notice] {
        &self.active
    }
}

#[cfg(test)]
#[path = "tests/notice_tests.rs"]
mod tests;
