//! # Render Thread
//!
//! Owns the render-thread state and runs commands enqueued by the update
//! thread, in order. Enqueuing never blocks; [`RenderThread::flush`] waits until
//! every command enqueued before it has run.
//!
//! The state `W` never leaves the render thread while it runs. Commands get
//! mutable access to it one at a time, so it needs no locking of its own.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Sender};

/// Errors talking to the render thread
#[derive(thiserror::Error, Debug)]
pub enum RenderThreadError {
    /// The thread could not be started
    #[error("Failed to spawn the render thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The thread stopped or panicked
    #[error("Render thread is gone")]
    Disconnected,
}

/// Work executed on the render thread
pub type RenderTask<W> = Box<dyn FnOnce(&mut W) + Send>;

enum RenderCommand<W> {
    Run(RenderTask<W>),
    Flush(Sender<()>),
    Shutdown,
}

/// Handle on a thread owning render state `W`
pub struct RenderThread<W: Send + 'static> {
    sender: Sender<RenderCommand<W>>,
    handle: Option<JoinHandle<W>>,
}

impl<W: Send + 'static> std::fmt::Debug for RenderThread<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderThread")
            .field("queued", &self.sender.len())
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl<W: Send + 'static> RenderThread<W> {
    /// Start a thread named `name` owning `world`
    pub fn spawn(name: &str, mut world: W) -> Result<Self, RenderThreadError> {
        let (sender, receiver) = unbounded::<RenderCommand<W>>();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            log::debug!("Render thread started");
            for command in receiver {
                match command {
                    RenderCommand::Run(task) => task(&mut world),
                    RenderCommand::Flush(done) => {
                        // The flusher may have given up waiting
                        let _ = done.send(());
                    }
                    RenderCommand::Shutdown => break,
                }
            }
            log::debug!("Render thread stopped");
            world
        })?;

        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Queue a task without waiting for it
    pub fn enqueue(&self, task: impl FnOnce(&mut W) + Send + 'static) -> Result<(), RenderThreadError> {
        self.sender
            .send(RenderCommand::Run(Box::new(task)))
            .map_err(|_| RenderThreadError::Disconnected)
    }

    /// Wait until every task queued so far has run
    pub fn flush(&self) -> Result<(), RenderThreadError> {
        let (done, wait) = bounded(1);
        self.sender
            .send(RenderCommand::Flush(done))
            .map_err(|_| RenderThreadError::Disconnected)?;
        wait.recv().map_err(|_| RenderThreadError::Disconnected)
    }

    /// Run a task and wait for its result
    pub fn query<R, F>(&self, task: F) -> Result<R, RenderThreadError>
    where
        R: Send + 'static,
        F: FnOnce(&mut W) -> R + Send + 'static,
    {
        let (result, wait) = bounded(1);
        self.enqueue(move |world| {
            let _ = result.send(task(world));
        })?;
        wait.recv().map_err(|_| RenderThreadError::Disconnected)
    }

    /// Tasks waiting to run
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Run what is queued, stop the thread and hand the state back
    pub fn shutdown(mut self) -> Result<W, RenderThreadError> {
        self.stop().ok_or(RenderThreadError::Disconnected)
    }

    fn stop(&mut self) -> Option<W> {
        let handle = self.handle.take()?;
        // A dead thread already dropped its receiver
        let _ = self.sender.send(RenderCommand::Shutdown);
        match handle.join() {
            Ok(world) => Some(world),
            Err(_) => {
                log::error!("Render thread panicked");
                None
            }
        }
    }
}

impl<W: Send + 'static> Drop for RenderThread<W> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_run_in_order() {
        let thread = RenderThread::spawn("render-test", Vec::new()).expect("Should spawn");
        for i in 0..10 {
            thread.enqueue(move |log: &mut Vec<u32>| log.push(i)).expect("Should enqueue");
        }
        thread.flush().expect("Should flush");
        let log = thread.shutdown().expect("Should shut down");
        assert_eq!(log, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_query_returns_a_value() {
        let thread = RenderThread::spawn("render-test", 41_u32).expect("Should spawn");
        thread.enqueue(|value| *value += 1).expect("Should enqueue");
        assert_eq!(thread.query(|value| *value).expect("Should answer"), 42);
    }

    #[test]
    fn test_shutdown_runs_pending_tasks() {
        let thread = RenderThread::spawn("render-test", 0_u32).expect("Should spawn");
        thread.enqueue(|value| *value = 7).expect("Should enqueue");
        assert_eq!(thread.shutdown().expect("Should shut down"), 7);
    }

    #[test]
    fn test_panicking_task_disconnects() {
        let thread = RenderThread::spawn("render-test", 0_u32).expect("Should spawn");
        thread
            .enqueue(|_| panic!("render task failure"))
            .expect("Should enqueue");
        assert!(matches!(thread.flush(), Err(RenderThreadError::Disconnected)));
    }
}
