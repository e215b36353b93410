use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// Run-wide stop signal. Cloned into the dispatcher, the Ctrl-C handler and
/// anything else that may end a run early.
#[derive(Clone)]
pub struct RunHalt {
    inner: Arc<HaltInner>,
}

struct HaltInner {
    is_halted: AtomicBool,
    tx: watch::Sender<bool>,
}

impl RunHalt {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(HaltInner {
                is_halted: AtomicBool::new(false),
                tx,
            }),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.inner.is_halted.load(Ordering::SeqCst)
    }

    /// Latches the halt. Later calls are no-ops.
    pub fn halt(&self, reason: &str) {
        if !self.inner.is_halted.swap(true, Ordering::SeqCst) {
            warn!("🛑 RUN HALT REQUESTED: {}", reason);
            self.inner.tx.send_replace(true);
        }
    }

    /// Resolves once [`RunHalt::halt`] has been called.
    pub async fn halted(&self) {
        let mut rx = self.inner.tx.subscribe();
        let _ = rx.wait_for(|halted| *halted).await;
    }
}

impl Default for RunHalt {
    fn default() -> Self {
        Self::new()
    }
}
