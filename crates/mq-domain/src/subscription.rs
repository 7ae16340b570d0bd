//! Subscription handle and its `starting -> running -> draining -> done`
//! lifecycle, per spec §3 and §4.2.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
    Starting = 0,
    Running = 1,
    Draining = 2,
    Done = 3,
}

impl SubscriptionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Done,
        }
    }
}

struct Inner {
    stop_token: CancellationToken,
    state: AtomicU8,
    done_tx: watch::Sender<bool>,
}

/// Caller-facing handle for a running consumer loop.
///
/// `stop` is non-blocking and idempotent. `done` is a broadcast signal,
/// observable by any number of waiters, that fires exactly once — after the
/// consumer loop has exited `draining` and every in-flight handler
/// invocation has returned.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
    done_rx: watch::Receiver<bool>,
}

impl Subscription {
    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Request the consumer loop to drain and stop. Non-blocking; observers
    /// use `done` to wait for quiescence. Calling this more than once has
    /// no additional effect.
    pub fn stop(&self) {
        self.inner.stop_token.cancel();
        self.transition_to_draining();
    }

    fn transition_to_draining(&self) {
        let _ = self.inner.state.compare_exchange(
            SubscriptionState::Running as u8,
            SubscriptionState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.inner.state.compare_exchange(
            SubscriptionState::Starting as u8,
            SubscriptionState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Resolves once the loop has truly exited and all in-flight handler
    /// invocations have returned. Safe to call from any number of tasks.
    pub async fn done(&self) {
        let mut rx = self.done_rx.clone();
        if *rx.borrow() {
            return;
        }
        // A closed sender (the loop task was dropped without firing) is
        // treated the same as done: there is nothing left to observe.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Internal control surface used by a transport's consumer-loop task. Not
/// exposed to callers of `Client::subscribe`.
pub struct SubscriptionControl {
    inner: Arc<Inner>,
}

impl SubscriptionControl {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.stop_token.clone()
    }

    pub fn mark_running(&self) {
        let _ = self.inner.state.compare_exchange(
            SubscriptionState::Starting as u8,
            SubscriptionState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn mark_draining(&self) {
        self.inner.state.store(SubscriptionState::Draining as u8, Ordering::SeqCst);
    }

    /// Closes `done` exactly once. Subsequent calls are no-ops.
    pub fn mark_done(&self) {
        self.inner.state.store(SubscriptionState::Done as u8, Ordering::SeqCst);
        let _ = self.inner.done_tx.send(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop_token.is_cancelled()
    }
}

/// Build a fresh `Subscription`/`SubscriptionControl` pair. The transport
/// adapter calls this once per `subscribe`, keeps the control half inside
/// its spawned consumer task, and returns the handle half to the caller.
pub fn new_subscription() -> (Subscription, SubscriptionControl) {
    let (done_tx, done_rx) = watch::channel(false);
    let inner = Arc::new(Inner {
        stop_token: CancellationToken::new(),
        state: AtomicU8::new(SubscriptionState::Starting as u8),
        done_tx,
    });
    (
        Subscription {
            inner: inner.clone(),
            done_rx,
        },
        SubscriptionControl { inner },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn done_fires_exactly_once_and_is_observable_by_many_waiters() {
        let (sub, ctrl) = new_subscription();
        let sub2 = sub.clone();

        let waiter1 = tokio::spawn(async move { sub.done().await });
        let waiter2 = tokio::spawn(async move { sub2.done().await });

        // give both waiters a chance to register before firing
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctrl.mark_done();

        tokio::time::timeout(Duration::from_secs(1), waiter1)
            .await
            .expect("waiter1 timed out")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter2)
            .await
            .expect("waiter2 timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_non_blocking() {
        let (sub, ctrl) = new_subscription();
        ctrl.mark_running();
        sub.stop();
        sub.stop();
        assert!(ctrl.is_stop_requested());
        assert_eq!(sub.state(), SubscriptionState::Draining);
    }

    #[tokio::test]
    async fn done_after_already_fired_returns_immediately() {
        let (sub, ctrl) = new_subscription();
        ctrl.mark_done();
        tokio::time::timeout(Duration::from_millis(100), sub.done())
            .await
            .expect("done() should return immediately once already fired");
    }
}
