use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};

use crate::error::TributaryError;
use crate::types::{ProviderEvent, ProviderResponse};

type CompletionFn<T, R> = dyn Fn(&T) -> Option<R> + Send + Sync;

struct EventStreamInner<T, R> {
    sender: mpsc::UnboundedSender<T>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<T>>,
    completion: Arc<CompletionFn<T, R>>,
    final_result: Mutex<Option<R>>,
    event_notify: Notify,
    final_notify: Notify,
    done: AtomicBool,
}

/// Single-producer event channel that records the first terminal result.
///
/// Once a terminal event has been pushed (or `end` called) every later push is
/// dropped, so consumers see at most one terminal event and it is always last.
pub struct EventStream<T, R> {
    inner: Arc<EventStreamInner<T, R>>,
}

impl<T, R> Clone for EventStream<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> EventStream<T, R>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new<F>(completion: F) -> Self
    where
        F: Fn(&T) -> Option<R> + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EventStreamInner {
                sender,
                receiver: AsyncMutex::new(receiver),
                completion: Arc::new(completion),
                final_result: Mutex::new(None),
                event_notify: Notify::new(),
                final_notify: Notify::new(),
                done: AtomicBool::new(false),
            }),
        }
    }

    pub fn push(&self, event: T) {
        if self.inner.done.load(Ordering::SeqCst) {
            return;
        }

        let result = (self.inner.completion)(&event);
        // Enqueue before marking done so a reader never sees done with the
        // terminal event still missing.
        let _ = self.inner.sender.send(event);

        if let Some(result) = result {
            if let Ok(mut guard) = self.inner.final_result.lock() {
                if guard.is_none() {
                    *guard = Some(result);
                }
            }
            self.inner.done.store(true, Ordering::SeqCst);
            self.inner.final_notify.notify_waiters();
        }

        self.inner.event_notify.notify_waiters();
    }

    /// Closes the stream. Idempotent: only the first close has any effect.
    pub fn end(&self, result: Option<R>) {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(result) = result {
            if let Ok(mut guard) = self.inner.final_result.lock() {
                if guard.is_none() {
                    *guard = Some(result);
                }
            }
        }

        self.inner.event_notify.notify_waiters();
        self.inner.final_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.inner.event_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut receiver = self.inner.receiver.lock().await;
                match receiver.try_recv() {
                    Ok(event) => return Some(event),
                    Err(mpsc::error::TryRecvError::Disconnected) => return None,
                    Err(mpsc::error::TryRecvError::Empty) => {
                        if self.inner.done.load(Ordering::SeqCst) {
                            return None;
                        }
                    }
                }
            }

            notified.await;
        }
    }

    pub async fn result(&self) -> Option<R> {
        loop {
            let notified = self.inner.final_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self
                .inner
                .final_result
                .lock()
                .ok()
                .and_then(|guard| guard.clone())
            {
                return Some(result);
            }

            if self.inner.done.load(Ordering::SeqCst) {
                return None;
            }

            notified.await;
        }
    }
}

pub type ProviderResult = Result<ProviderResponse, TributaryError>;

/// The caller-facing side of one aggregation run.
pub struct ProviderEventStream {
    inner: EventStream<ProviderEvent, ProviderResult>,
}

impl ProviderEventStream {
    pub fn new() -> Self {
        let inner = EventStream::new(|event| match event {
            ProviderEvent::Complete { response } => Some(Ok(response.clone())),
            ProviderEvent::Error { error } => Some(Err(error.clone())),
            _ => None,
        });
        Self { inner }
    }

    pub fn push(&self, event: ProviderEvent) {
        self.inner.push(event);
    }

    pub fn end(&self) {
        self.inner.end(None);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub async fn next(&self) -> Option<ProviderEvent> {
        self.inner.next().await
    }

    /// Waits for the terminal result. `None` means the run closed without one,
    /// which only happens when a local endpoint answered 429.
    pub async fn result(&self) -> Option<ProviderResult> {
        self.inner.result().await
    }

    pub async fn collect(&self) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

impl Clone for ProviderEventStream {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Default for ProviderEventStream {
    fn default() -> Self {
        Self::new()
    }
}
