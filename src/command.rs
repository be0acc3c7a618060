//! Command buffers and the queue that executes them.
//!
//! Work is never executed while it is being encoded. A [`CommandBuffer`]
//! collects commands (boxed closures over shared [`Buffer`](crate::buffer::Buffer)s)
//! and hands them to a [`CommandQueue`], whose dedicated worker thread runs
//! submissions strictly in the order they were committed.
//!
//! # Chains
//!
//! A command buffer belongs to a *chain*. Calling
//! [`CommandBuffer::commit_and_continue`] submits what has been encoded so
//! far and lets the host keep encoding into the same chain while the worker
//! is already busy. [`CommandBuffer::commit`] closes the chain and returns a
//! [`CommandChain`] whose [`wait_until_completed`](CommandChain::wait_until_completed)
//! is the only blocking call in the whole execution model.
//!
//! # Failures
//!
//! A command returning an error, or panicking, poisons its chain: the rest of
//! that submission and every later submission of the same chain are skipped,
//! and the first failure is returned from the blocking wait.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};

/// A deferred unit of work.
pub type Command = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

#[derive(Default)]
struct ChainStatus {
    pending: usize,
    submitted: usize,
    error: Option<Error>,
}

#[derive(Default)]
struct ChainState {
    status: Mutex<ChainStatus>,
    done: Condvar,
}

impl ChainState {
    fn lock(&self) -> std::sync::MutexGuard<'_, ChainStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_failed(&self) -> bool {
        self.lock().error.is_some()
    }

    fn finish(&self, failure: Option<Error>) {
        let mut status = self.lock();
        if status.error.is_none() {
            status.error = failure;
        }
        status.pending = status.pending.saturating_sub(1);
        if status.pending == 0 {
            self.done.notify_all();
        }
    }
}

struct Submission {
    commands: Vec<Command>,
    chain: Arc<ChainState>,
}

struct QueueShared {
    label: String,
    sender: Option<Sender<Submission>>,
    worker: Option<JoinHandle<()>>,
}

impl QueueShared {
    fn submit(&self, commands: Vec<Command>, chain: &Arc<ChainState>) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(Error::QueueClosed)?;
        {
            let mut status = chain.lock();
            status.pending += 1;
            status.submitted += 1;
        }
        let count = commands.len();
        let submission = Submission {
            commands,
            chain: Arc::clone(chain),
        };
        if sender.send(submission).is_err() {
            let mut status = chain.lock();
            status.pending -= 1;
            status.submitted -= 1;
            return Err(Error::QueueClosed);
        }
        log::trace!("{}: committed {count} commands", self.label);
        Ok(())
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                log::error!("{}: queue worker panicked", self.label);
            }
        }
    }
}

fn run_worker(receiver: Receiver<Submission>) {
    for Submission { commands, chain } in receiver {
        if chain.is_failed() {
            chain.finish(None);
            continue;
        }
        let mut failure = None;
        for command in commands {
            match catch_unwind(AssertUnwindSafe(command)) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failure = Some(err);
                    break;
                }
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "command panicked".to_string());
                    failure = Some(Error::Submission(message));
                    break;
                }
            }
        }
        chain.finish(failure);
    }
}

/// In-order executor for committed command buffers.
///
/// Clones share the same worker thread. The worker exits once the last
/// handle (including those held by command buffers) is dropped, after
/// draining everything already committed.
#[derive(Clone)]
pub struct CommandQueue {
    shared: Arc<QueueShared>,
}

impl CommandQueue {
    /// Spawns the worker thread.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the thread cannot be spawned.
    pub fn new(label: &str) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(format!("{label}-queue"))
            .spawn(move || run_worker(receiver))?;
        Ok(Self {
            shared: Arc::new(QueueShared {
                label: label.to_string(),
                sender: Some(sender),
                worker: Some(worker),
            }),
        })
    }

    /// Starts a new, empty chain.
    pub fn command_buffer(&self) -> CommandBuffer {
        CommandBuffer {
            queue: Arc::clone(&self.shared),
            commands: Vec::new(),
            chain: Arc::new(ChainState::default()),
        }
    }

    /// Queue label, used as the worker thread name prefix.
    pub fn label(&self) -> &str {
        &self.shared.label
    }
}

/// An encoder for one chain of submissions.
pub struct CommandBuffer {
    queue: Arc<QueueShared>,
    commands: Vec<Command>,
    chain: Arc<ChainState>,
}

impl CommandBuffer {
    /// Appends a command. Nothing runs until the buffer is committed.
    pub fn encode<F>(&mut self, command: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.commands.push(Box::new(command));
    }

    /// Commands encoded since the last commit.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns `true` if nothing has been encoded since the last commit.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Number of submissions already handed to the queue for this chain.
    pub fn submitted(&self) -> usize {
        self.chain.lock().submitted
    }

    /// Submits the encoded commands without waiting and keeps the chain open.
    ///
    /// # Errors
    /// Returns [`Error::QueueClosed`] if the worker is gone.
    pub fn commit_and_continue(&mut self) -> Result<()> {
        if self.commands.is_empty() {
            return Ok(());
        }
        let commands = std::mem::take(&mut self.commands);
        self.queue.submit(commands, &self.chain)
    }

    /// Submits whatever is left and closes the chain.
    ///
    /// # Errors
    /// Returns [`Error::QueueClosed`] if the worker is gone.
    pub fn commit(mut self) -> Result<CommandChain> {
        self.commit_and_continue()?;
        Ok(CommandChain {
            chain: Arc::clone(&self.chain),
        })
    }

    /// Commits and blocks until the whole chain has executed.
    ///
    /// # Errors
    /// Returns the first failure of any command in the chain.
    pub fn commit_and_wait(self) -> Result<()> {
        self.commit()?.wait_until_completed()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if !self.commands.is_empty() {
            log::warn!(
                "{}: dropping {} uncommitted commands",
                self.queue.label,
                self.commands.len()
            );
        }
    }
}

/// Handle to a committed chain.
#[must_use = "a committed chain should be waited on"]
pub struct CommandChain {
    chain: Arc<ChainState>,
}

impl CommandChain {
    /// Blocks until every submission of the chain has executed or been skipped.
    ///
    /// # Errors
    /// Returns the first command failure of the chain.
    pub fn wait_until_completed(self) -> Result<()> {
        let mut status = self.chain.lock();
        while status.pending > 0 {
            status = self
                .chain
                .done
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match status.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn commands_run_in_encoding_order_across_commits() {
        let queue = CommandQueue::new("test").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut cmd = queue.command_buffer();
        for i in 0..10 {
            let log = Arc::clone(&log);
            cmd.encode(move || {
                log.lock().unwrap().push(i);
                Ok(())
            });
            if i % 3 == 0 {
                cmd.commit_and_continue().unwrap();
            }
        }
        assert_eq!(cmd.submitted(), 4);
        cmd.commit_and_wait().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn failure_skips_rest_of_chain() {
        let queue = CommandQueue::new("test").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let mut cmd = queue.command_buffer();
        cmd.encode(|| Err(Error::Submission("boom".into())));
        cmd.commit_and_continue().unwrap();
        let counter = Arc::clone(&ran);
        cmd.encode(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let err = cmd.commit_and_wait().unwrap_err();
        assert!(matches!(err, Error::Submission(ref m) if m == "boom"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // the queue itself stays usable
        let mut next = queue.command_buffer();
        let counter = Arc::clone(&ran);
        next.encode(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        next.commit_and_wait().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panics_become_errors() {
        let queue = CommandQueue::new("test").unwrap();
        let mut cmd = queue.command_buffer();
        cmd.encode(|| panic!("kernel exploded"));
        let err = cmd.commit_and_wait().unwrap_err();
        assert!(matches!(err, Error::Submission(ref m) if m.contains("kernel exploded")));
    }

    #[test]
    fn empty_chain_completes_immediately() {
        let queue = CommandQueue::new("test").unwrap();
        let cmd = queue.command_buffer();
        assert!(cmd.is_empty());
        cmd.commit_and_wait().unwrap();
    }
}
