use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

/// How long a toast stays visible
const TOAST_VISIBLE_SECS: u64 = 3;

/// User-visible notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub id: u64,
    pub message: String,
}

/// One toast at a time; a newer toast replaces the visible one and each
/// dismisses itself after a few seconds.
pub struct ToastCenter {
    current: Arc<watch::Sender<Option<Toast>>>,
    next_id: AtomicU64,
    visible_for: Duration,
}

impl Default for ToastCenter {
    fn default() -> Self {
        Self::new()
    }
}

impl ToastCenter {
    pub fn new() -> Self {
        Self::with_duration(Duration::from_secs(TOAST_VISIBLE_SECS))
    }

    pub fn with_duration(visible_for: Duration) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            current: Arc::new(tx),
            next_id: AtomicU64::new(1),
            visible_for,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Toast>> {
        self.current.subscribe()
    }

    pub fn current(&self) -> Option<Toast> {
        self.current.borrow().clone()
    }

    pub fn show(&self, message: &str) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.current.send_replace(Some(Toast {
            id,
            message: message.to_string(),
        }));

        // Without a runtime the toast simply stays until replaced
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime; toast will not auto-dismiss");
            return;
        };
        let current = Arc::clone(&self.current);
        let visible_for = self.visible_for;
        handle.spawn(async move {
            tokio::time::sleep(visible_for).await;
            current.send_if_modified(|toast| match toast {
                Some(t) if t.id == id => {
                    *toast = None;
                    true
                }
                _ => false,
            });
        });
    }
}

impl Notifier for ToastCenter {
    fn notify(&self, message: &str) {
        self.show(message);
    }
}
