//! Device streams and completion events.
//!
//! A [`Stream`] accepts tasks together with the [`Event`]s they must wait
//! for and returns an event that completes when the task has run. Two
//! queue models are provided:
//!
//! - [`ImmediateStream`]: the task runs on the submitting thread before
//!   `enqueue` returns.
//! - [`InOrderQueue`]: tasks run in submission order on a dedicated worker
//!   thread, so `enqueue` returns while the work is still pending.
//!
//! A task whose dependency failed is not run; its event fails with the
//! dependency's error instead.

use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use loopnet_core::id::PrimitiveId;

use crate::config::QueueKind;
use crate::error::ExecutionError;

/// Work submitted to a stream.
pub type Task = Box<dyn FnOnce() -> Result<(), ExecutionError> + Send + 'static>;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum EventStatus {
    Pending,
    Complete,
    Failed(ExecutionError),
}

struct EventInner {
    status: Mutex<EventStatus>,
    ready: Condvar,
}

/// Completion handle of one submitted task. Cloning shares the handle.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    fn with_status(status: EventStatus) -> Self {
        Event {
            inner: Arc::new(EventInner {
                status: Mutex::new(status),
                ready: Condvar::new(),
            }),
        }
    }

    /// An event that has already completed successfully.
    pub fn completed() -> Self {
        Event::with_status(EventStatus::Complete)
    }

    /// An event that has already failed with `error`.
    pub fn failed(error: ExecutionError) -> Self {
        Event::with_status(EventStatus::Failed(error))
    }

    pub(crate) fn pending() -> Self {
        Event::with_status(EventStatus::Pending)
    }

    pub(crate) fn resolve(&self, result: Result<(), ExecutionError>) {
        let mut status = self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *status = match result {
            Ok(()) => EventStatus::Complete,
            Err(err) => EventStatus::Failed(err),
        };
        self.inner.ready.notify_all();
    }

    /// Whether the task has finished, successfully or not.
    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        let status = self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        !matches!(*status, EventStatus::Pending)
    }

    /// Blocks until the task has finished and returns its outcome.
    pub fn wait(&self) -> Result<(), ExecutionError> {
        let mut status = self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while matches!(*status, EventStatus::Pending) {
            status = self
                .inner
                .ready
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &*status {
            EventStatus::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Waits for every event and returns the first failure, if any.
    pub fn wait_all(events: &[Event]) -> Result<(), ExecutionError> {
        let mut first = None;
        for event in events {
            if let Err(err) = event.wait() {
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether both handles refer to the same submission.
    #[cfg(test)]
    pub(crate) fn same_event(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        f.debug_struct("Event").field("status", &status).finish()
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// A device queue.
pub trait Stream: Send + Sync {
    /// Submits `task` to run once every event in `dependencies` completed.
    fn enqueue(&self, dependencies: &[Event], task: Task) -> Event;

    /// Blocks until everything submitted so far has run.
    fn finish(&self);

    fn kind(&self) -> QueueKind;
}

fn run_task(dependencies: &[Event], task: Task) -> Result<(), ExecutionError> {
    Event::wait_all(dependencies)?;
    task()
}

/// Runs every task synchronously inside `enqueue`.
#[derive(Debug, Default)]
pub struct ImmediateStream;

impl Stream for ImmediateStream {
    fn enqueue(&self, dependencies: &[Event], task: Task) -> Event {
        match run_task(dependencies, task) {
            Ok(()) => Event::completed(),
            Err(err) => Event::failed(err),
        }
    }

    fn finish(&self) {}

    fn kind(&self) -> QueueKind {
        QueueKind::Immediate
    }
}

struct Job {
    dependencies: Vec<Event>,
    task: Task,
    event: Event,
}

/// Runs tasks in submission order on one worker thread.
pub struct InOrderQueue {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    last: Mutex<Event>,
}

impl InOrderQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = std::thread::spawn(move || {
            tracing::debug!("in-order queue worker started");
            for job in receiver {
                let result = run_task(&job.dependencies, job.task);
                job.event.resolve(result);
            }
            tracing::debug!("in-order queue worker stopped");
        });
        InOrderQueue {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            last: Mutex::new(Event::completed()),
        }
    }
}

impl Default for InOrderQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for InOrderQueue {
    fn enqueue(&self, dependencies: &[Event], task: Task) -> Event {
        let event = Event::pending();
        let job = Job {
            dependencies: dependencies.to_vec(),
            task,
            event: event.clone(),
        };

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = match sender.as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        drop(sender);
        if !sent {
            event.resolve(Err(ExecutionError::Kernel {
                primitive: PrimitiveId::new("<queue>"),
                message: "in-order queue worker is not running".to_string(),
            }));
        }

        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = event.clone();
        event
    }

    fn finish(&self) {
        let last = self
            .last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // Failures are reported through the events of the failed tasks.
        let _ = last.wait();
    }

    fn kind(&self) -> QueueKind {
        QueueKind::InOrder
    }
}

impl Drop for InOrderQueue {
    fn drop(&mut self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for InOrderQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InOrderQueue").finish_non_exhaustive()
    }
}

/// Creates the stream selected by `kind`.
pub fn create_stream(kind: QueueKind) -> Arc<dyn Stream> {
    match kind {
        QueueKind::Immediate => Arc::new(ImmediateStream),
        QueueKind::InOrder => Arc::new(InOrderQueue::new()),
    }
}
