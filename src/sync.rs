//! Small coordination primitives for the session tasks.

use std::sync::Arc;

use tokio::sync::watch;

/// A settable, clearable flag that tasks can await.
///
/// Used for the player's "flushed" event (cleared on every write, set
/// when the outbound fifo drains) and for the session's data-channel
/// connected gate (set once, when the client opens its channel).
#[derive(Clone)]
pub struct Flag {
    tx: Arc<watch::Sender<bool>>,
}

impl Flag {
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set. Returns immediately if already set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for cannot fail.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new(false)
    }
}

impl std::fmt::Debug for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flag").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_when_set() {
        let flag = Flag::new(false);
        let waiter = flag.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());
        flag.set();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_is_immediate_when_already_set() {
        let flag = Flag::new(true);
        tokio::time::timeout(Duration::from_millis(50), flag.wait())
            .await
            .expect("no wait needed");
    }

    #[tokio::test]
    async fn clear_resets_the_flag() {
        let flag = Flag::new(true);
        flag.clear();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }
}
