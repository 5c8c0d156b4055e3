//! Background tasks running on a bounded pool of worker threads.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, trace, warn};

use super::{
    TransportError,
    backend::{UsbBackend, UsbHandle},
};
use crate::trace::TraceSink;

/// Invoked with every frame a polling task reads.
pub type FrameCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Pause after a failed poll iteration, so a persistently failing endpoint
/// does not spin.
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Interval in which the context event task checks its stop flag.
pub const EVENT_HANDLING_INTERVAL: Duration = Duration::from_millis(100);

/// Limits the amount of concurrently running worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    max_threads: usize,
    active: Arc<AtomicUsize>,
}

/// Frees a pool slot when the worker ends.
struct WorkerSlot(Arc<AtomicUsize>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// The amount of workers currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn spawn(&self, name: String, work: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>, TransportError> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_threads).then_some(n + 1)
            })
            .map_err(|_| TransportError::WorkerPoolExhausted {
                max_threads: self.max_threads,
            })?;

        let slot = WorkerSlot(Arc::clone(&self.active));
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                let _slot = slot;
                work();
            })
            .map_err(|err| TransportError::Other(err.to_string()))
    }
}

/// How a task ended.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaskExit {
    /// The stop flag was set.
    Stopped,

    /// The device disappeared.
    Lost,
}

/// Describes what a polling task reads and where the frames go.
pub(crate) struct InterruptReader {
    pub handle: Arc<dyn UsbHandle>,
    pub endpoint: u8,
    pub length: usize,
    pub timeout: Duration,
    pub queue: Option<flume::Sender<Vec<u8>>>,
    pub callback: Option<FrameCallback>,
    pub on_lost: Box<dyn FnOnce() + Send>,
}

/// A cooperative background task obeying a stop flag between iterations.
pub struct PollingTask {
    name: String,
    stop: Arc<AtomicBool>,
    exited: flume::Receiver<TaskExit>,
    thread: Option<JoinHandle<()>>,
}

impl PollingTask {
    fn spawn(
        pool: &WorkerPool,
        name: String,
        trace: TraceSink,
        body: impl FnOnce(&AtomicBool) -> TaskExit + Send + 'static,
    ) -> Result<Self, TransportError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited) = flume::bounded(1);

        let thread = pool.spawn(name.clone(), {
            let stop = Arc::clone(&stop);
            move || {
                let exit = trace.in_scope(|| body(&stop));
                let _ = exited_tx.send(exit);
            }
        })?;

        Ok(Self {
            name,
            stop,
            exited,
            thread: Some(thread),
        })
    }

    /// Starts reading an interrupt endpoint in a loop.
    pub(crate) fn interrupt_reader(
        pool: &WorkerPool,
        name: String,
        trace: TraceSink,
        reader: InterruptReader,
    ) -> Result<Self, TransportError> {
        Self::spawn(pool, name, trace, move |stop| read_loop(reader, stop))
    }

    /// Starts handling the events of a USB backend, such as hot-plug
    /// notifications.
    pub(crate) fn context_events(
        pool: &WorkerPool,
        trace: TraceSink,
        backend: Arc<dyn UsbBackend>,
    ) -> Result<Self, TransportError> {
        Self::spawn(pool, "usb-context-events".to_string(), trace, move |stop| {
            while !stop.load(Ordering::Acquire) {
                if let Err(err) = backend.handle_events(EVENT_HANDLING_INTERVAL) {
                    warn!("could not handle USB context events: {err}");
                    thread::sleep(ERROR_BACKOFF);
                }
            }
            TaskExit::Stopped
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asks the task to end after its current iteration.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the task to end until the deadline passes.
    ///
    /// A task still running at the deadline is leaked and [`None`] is
    /// returned.
    pub fn join_until(mut self, deadline: Instant) -> Option<TaskExit> {
        match self.exited.recv_deadline(deadline) {
            Ok(exit) => {
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        error!(task = %self.name, "task panicked");
                    }
                }
                Some(exit)
            },
            Err(flume::RecvTimeoutError::Disconnected) => {
                error!(task = %self.name, "task ended without reporting its exit");
                None
            },
            Err(flume::RecvTimeoutError::Timeout) => {
                warn!(task = %self.name, "task did not stop in time, leaking it");
                None
            },
        }
    }

    /// Stops the task and waits for it to end.
    pub fn stop(self, timeout: Duration) -> Option<TaskExit> {
        self.signal_stop();
        self.join_until(Instant::now() + timeout)
    }
}

impl fmt::Debug for PollingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingTask")
            .field("name", &self.name)
            .field("stopping", &self.stop.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn read_loop(reader: InterruptReader, stop: &AtomicBool) -> TaskExit {
    let InterruptReader {
        handle,
        endpoint,
        length,
        timeout,
        queue,
        callback,
        on_lost,
    } = reader;

    debug!(endpoint, length, "starting interrupt polling");
    let mut buf = vec![0u8; length];

    while !stop.load(Ordering::Acquire) {
        match handle.read_interrupt(endpoint, &mut buf, timeout) {
            Ok(0) | Err(TransportError::Timeout) => {},
            Ok(len) => {
                let frame = &buf[..len];
                trace!(endpoint, ?frame, "received frame");

                if let Some(queue) = &queue {
                    let _ = queue.send(frame.to_vec());
                }
                if let Some(callback) = &callback {
                    callback(frame);
                }
            },
            Err(TransportError::NoDevice) => {
                if !stop.load(Ordering::Acquire) {
                    error!(endpoint, "device disappeared while polling");
                    on_lost();
                }
                return TaskExit::Lost;
            },
            Err(err) => {
                warn!(endpoint, "poll iteration failed: {err}");
                thread::sleep(ERROR_BACKOFF);
            },
        }
    }

    debug!(endpoint, "stopped interrupt polling");
    TaskExit::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_bounded() {
        let pool = WorkerPool::new(1);
        let (release_tx, release_rx) = flume::bounded::<()>(0);

        let first = PollingTask::spawn(&pool, "first".into(), TraceSink::default(), move |_| {
            let _ = release_rx.recv();
            TaskExit::Stopped
        })
        .unwrap();

        let second = PollingTask::spawn(&pool, "second".into(), TraceSink::default(), |_| TaskExit::Stopped);
        assert!(matches!(
            second,
            Err(TransportError::WorkerPoolExhausted { max_threads: 1 })
        ));

        drop(release_tx);
        assert_eq!(first.stop(Duration::from_secs(1)), Some(TaskExit::Stopped));
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn stop_flag_ends_task() {
        let pool = WorkerPool::new(2);
        let task = PollingTask::spawn(&pool, "loop".into(), TraceSink::default(), |stop| {
            while !stop.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
            TaskExit::Stopped
        })
        .unwrap();

        assert!(!task.is_finished());
        assert_eq!(task.stop(Duration::from_secs(1)), Some(TaskExit::Stopped));
    }
}
