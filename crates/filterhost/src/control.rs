//! Controller-side hooks into a running invocation: cooperative abort and
//! progress observation.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Cooperative abort flag.
///
/// Setting it does not interrupt the helper; the helper only learns about it
/// the next time it sends `AbortCheck`.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once abort has been requested.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }
}

/// Receives progress reports from the helper, in order.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, percent: u8);
}

impl ProgressObserver for mpsc::UnboundedSender<u8> {
    fn on_progress(&self, percent: u8) {
        // Receiver gone means nobody is watching.
        let _ = self.send(percent);
    }
}

impl<F> ProgressObserver for F
where
    F: Fn(u8) + Send + Sync,
{
    fn on_progress(&self, percent: u8) {
        self(percent)
    }
}

/// Abort and progress plumbing for one invocation.
#[derive(Clone, Default)]
pub struct InvocationControl {
    pub abort: AbortSignal,
    progress: Option<Arc<dyn ProgressObserver>>,
}

impl InvocationControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_progress(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.progress = Some(Arc::new(observer));
        self
    }

    pub fn report_progress(&self, percent: u8) {
        if let Some(observer) = &self.progress {
            observer.on_progress(percent);
        }
    }
}

impl fmt::Debug for InvocationControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationControl")
            .field("abort", &self.abort)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn abort_is_shared_between_clones() {
        let signal = AbortSignal::new();
        let control = InvocationControl::new().with_abort(signal.clone());
        assert!(!control.abort.is_aborted());
        signal.abort();
        assert!(control.abort.is_aborted());
    }

    #[test]
    fn channel_observer_receives_reports() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let control = InvocationControl::new().with_progress(tx);
        control.report_progress(50);
        control.report_progress(100);
        assert_eq!(rx.try_recv().unwrap(), 50);
        assert_eq!(rx.try_recv().unwrap(), 100);
    }

    #[test]
    fn closure_observer_receives_reports() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let control = InvocationControl::new().with_progress(move |p: u8| sink.lock().unwrap().push(p));
        control.report_progress(7);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn no_observer_is_fine() {
        InvocationControl::new().report_progress(1);
    }
}
