use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    signal::unix::{Signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

/// Cooperative stop signal shared by every task of a single invocation.
/// Stopping is idempotent and can never be undone.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}
impl StopSignal {
    /// Get a new `Self` which has not been stopped yet.
    pub fn new() -> Self {
        Self::default()
    }
    /// Fire the signal, waking every waiter.
    /// Returns true only for the call which actually fired it.
    pub fn stop(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }
    /// Whether the signal has already fired.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
    /// Returns a future that completes once the signal has fired.
    /// The future does not borrow `self` so it may be moved into streams or tasks.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.token.clone();
        async move { token.cancelled().await }
    }
}

/// Source of process interrupts.
/// Every call to `wait` yields the next interrupt, or None once the source is closed.
#[async_trait::async_trait]
pub trait ShutdownEvent: Send {
    async fn wait(&mut self) -> Option<SignalKind>;
}

/// Shutdown Event when INT | TERM are received.
/// Both signals are treated identically and may be received any number of times.
pub struct IntTermEvent {
    sig_int: Signal,
    sig_term: Signal,
}
impl IntTermEvent {
    /// Register the INT and TERM handlers.
    /// Must be called from within a tokio runtime.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sig_int: tokio::signal::unix::signal(SignalKind::interrupt())?,
            sig_term: tokio::signal::unix::signal(SignalKind::terminate())?,
        })
    }
}

#[async_trait::async_trait]
impl ShutdownEvent for IntTermEvent {
    async fn wait(&mut self) -> Option<SignalKind> {
        tokio::select! {
            received = self.sig_int.recv() => {
                tracing::warn!(signal = ?SignalKind::interrupt(), "Signalled");
                received.map(|_| SignalKind::interrupt())
            },
            received = self.sig_term.recv() => {
                tracing::warn!(signal = ?SignalKind::terminate(), "Signalled");
                received.map(|_| SignalKind::terminate())
            },
        }
    }
}

/// Interrupts delivered over a channel, useful when the caller owns signal delivery.
#[async_trait::async_trait]
impl ShutdownEvent for mpsc::Receiver<SignalKind> {
    async fn wait(&mut self) -> Option<SignalKind> {
        self.recv().await
    }
}

#[cfg(test)]
mod tests {
    use crate::{ShutdownEvent, StopSignal};
    use std::time::Duration;
    use tokio::{signal::unix::SignalKind, sync::mpsc};

    #[tokio::test]
    async fn stop_is_idempotent() {
        let stop = StopSignal::new();
        let waiter = tokio::spawn(stop.wait());

        assert!(!stop.is_stopped());
        assert!(stop.stop());
        assert!(!stop.stop());
        assert!(stop.clone().is_stopped());

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter to be woken")
            .expect("waiter not to panic");
        // waiting after the fact completes immediately
        stop.wait().await;
    }

    #[test]
    fn stop_fires_once_across_threads() {
        let stop = StopSignal::new();
        let threads = (0 .. 8)
            .map(|_| {
                let stop = stop.clone();
                std::thread::spawn(move || stop.stop())
            })
            .collect::<Vec<_>>();
        let fired = threads
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .filter(|fired| *fired)
            .count();
        assert_eq!(fired, 1);
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn channel_event() {
        let (sender, mut receiver) = mpsc::channel(4);
        sender.send(SignalKind::alarm()).await.unwrap();
        sender.send(SignalKind::interrupt()).await.unwrap();
        drop(sender);

        assert_eq!(
            format!("{:?}", receiver.wait().await),
            format!("{:?}", Some(SignalKind::alarm()))
        );
        assert_eq!(
            format!("{:?}", receiver.wait().await),
            format!("{:?}", Some(SignalKind::interrupt()))
        );
        assert!(receiver.wait().await.is_none());
    }
}
