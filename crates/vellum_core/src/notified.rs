//! Monotonic watermarks with wakeups.
//!
//! A `Notified` value only moves forward. Tasks gate on `when_at_least`,
//! which resolves once some other task advances the watermark past the
//! requested point. This is the ordering primitive behind the commit
//! pipeline's phase gates and the committed-version guard.

use tokio::sync::watch;

use crate::types::Version;

#[derive(Debug)]
pub struct Notified<T> {
    tx: watch::Sender<T>,
}

impl<T: Copy + PartialOrd + Send + Sync + 'static> Notified<T> {
    pub fn new(initial: T) -> Self {
        Self {
            tx: watch::channel(initial).0,
        }
    }

    pub fn get(&self) -> T {
        *self.tx.borrow()
    }

    /// Advance the watermark. Values at or below the current one are ignored.
    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|current| {
            if value > *current {
                *current = value;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the watermark reaches `at_least`.
    pub async fn when_at_least(&self, at_least: T) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close mid-wait.
        let _ = rx.wait_for(|value| *value >= at_least).await;
    }
}

pub type NotifiedVersion = Notified<Version>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_monotonic() {
        let n = NotifiedVersion::new(5);
        n.set(3);
        assert_eq!(n.get(), 5);
        n.set(9);
        assert_eq!(n.get(), 9);
    }

    #[test]
    fn when_at_least_wakes_waiters() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let n = std::sync::Arc::new(NotifiedVersion::new(0));
            let waiter = {
                let n = n.clone();
                tokio::spawn(async move { n.when_at_least(10).await })
            };
            n.set(4);
            tokio::task::yield_now().await;
            assert!(!waiter.is_finished());
            n.set(10);
            waiter.await.unwrap();
        });
    }
}
