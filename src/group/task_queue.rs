use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use tracing::{debug, error};

use crate::fatal::{self, FatalError};

pub const DEFAULT_CAPACITY: usize = 256;
pub const DEFAULT_POST_TIMEOUT: Duration = Duration::from_secs(10);

/// A unit of work run against the state owned by the executor.
pub type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Bounded FIFO of tasks drained by a single executor.
///
/// Tasks run one at a time in the order they were enqueued, so everything
/// they touch in `S` needs no further synchronization. Producers on any
/// thread post through cheap [`TaskPoster`] handles.
pub struct TaskQueue<S> {
    poster: TaskPoster<S>,
    receiver: Receiver<Task<S>>,
}

/// Cloneable sending side of a [`TaskQueue`].
pub struct TaskPoster<S> {
    name: Arc<str>,
    sender: Sender<Task<S>>,
    running: Arc<AtomicBool>,
    post_timeout: Duration,
}

impl<S> Clone for TaskPoster<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
            running: self.running.clone(),
            post_timeout: self.post_timeout,
        }
    }
}

impl<S: 'static> TaskPoster<S> {
    /// Enqueues a task. Blocks while the queue is full, and aborts the process
    /// if the executor has not made room within the post timeout.
    pub fn post_task<F>(&self, task: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.send_blocking(Box::new(task));
    }

    /// Enqueues a task from async code. A full queue is waited on from the
    /// blocking pool, so runtime workers keep serving other connections.
    /// Tasks from one caller still arrive in the order they were posted.
    pub async fn post_task_async<F>(&self, task: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let task = match self.sender.try_send(Box::new(task)) {
            Ok(()) => return,
            Err(TrySendError::Disconnected(_)) => {
                debug!(queue = %self.name, "Dropping task posted after the executor exited");
                return;
            }
            Err(TrySendError::Full(task)) => task,
        };
        let poster = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || poster.send_blocking(task)).await {
            error!(queue = %self.name, "Posting task failed: {}", e);
        }
    }

    fn send_blocking(&self, task: Task<S>) {
        match self.sender.send_timeout(task, self.post_timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => fatal::abort(FatalError::TaskQueueUnresponsive {
                queue: self.name.to_string(),
                timeout: self.post_timeout,
            }),
            Err(SendTimeoutError::Disconnected(_)) => {
                debug!(queue = %self.name, "Dropping task posted after the executor exited");
            }
        }
    }

    /// Stops the executor after the task it is currently running. Tasks
    /// still queued behind it are dropped.
    pub fn quit(&self) {
        self.running.store(false, Ordering::SeqCst);
        // Wakes an executor parked on an empty queue.
        self.post_task(|_| {});
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<S: 'static> TaskQueue<S> {
    pub fn new(name: &str) -> Self {
        Self::with_capacity(name, DEFAULT_CAPACITY, DEFAULT_POST_TIMEOUT)
    }

    pub fn with_capacity(name: &str, capacity: usize, post_timeout: Duration) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self {
            poster: TaskPoster {
                name: Arc::from(name),
                sender,
                running: Arc::new(AtomicBool::new(true)),
                post_timeout,
            },
            receiver,
        }
    }

    pub fn poster(&self) -> TaskPoster<S> {
        self.poster.clone()
    }

    pub fn post_task<F>(&self, task: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.poster.post_task(task);
    }

    /// Runs tasks until [`TaskPoster::quit`] is called.
    pub fn run(&self, state: &mut S) {
        while self.poster.running.load(Ordering::SeqCst) {
            match self.receiver.recv() {
                Ok(task) => task(state),
                Err(_) => break,
            }
        }
        debug!(queue = %self.poster.name, "Task queue stopped");
    }

    /// Runs whatever is queued right now without waiting for more.
    /// Returns the number of tasks executed.
    pub fn run_until_idle(&self, state: &mut S) -> usize {
        let mut executed = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task(state);
            executed += 1;
        }
        executed
    }
}
