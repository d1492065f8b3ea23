//! The bridge that lets a blocking caller drive the real-time state
//! machines.
//!
//! A caller enqueues a procedure; the dispatch task pops and invokes it.
//! The procedure either completes the call synchronously or parks its
//! [`CallToken`] inside a state machine and reports [`Verdict::Pending`];
//! the state machine completes the token when the awaited event arrives.
//! Completion happens exactly once: a caller that times out wins the race
//! against a late completion, which then becomes a no-op.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::trace;

use crate::error::{Error, Result};
use crate::time::{Instant, Timeout};

/// What a dispatched procedure reports back to the dispatcher.
pub enum Verdict {
    Complete(Result<()>),
    /// The call token was parked; completion comes later.
    Pending,
}

enum CallState {
    Waiting,
    Done(Result<()>),
    Reaped,
}

struct CallShared {
    state: Mutex<CallState>,
    cond: Condvar,
}

/// A handle for completing a parked call.
#[derive(Clone)]
pub struct CallToken {
    shared: Arc<CallShared>,
}

impl CallToken {
    /// A token with no caller behind it; completing it only updates its
    /// own state. Used as a placeholder before a real caller arrives.
    pub fn detached() -> CallToken {
        CallToken {
            shared: Arc::new(CallShared {
                state: Mutex::new(CallState::Waiting),
                cond: Condvar::new(),
            }),
        }
    }

    /// Complete the call. The first completion wins; any further one is
    /// ignored.
    pub fn complete(&self, result: Result<()>) {
        let mut state = self.shared.state.lock().unwrap();
        if matches!(*state, CallState::Waiting) {
            *state = CallState::Done(result);
            self.shared.cond.notify_all();
        }
    }
}

type Proc = Box<dyn FnOnce(CallToken) -> Verdict + Send>;

struct Job {
    proc: Proc,
    token: CallToken,
}

/// The dispatch task and its submission queue.
pub struct Rtpc {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Rtpc {
    pub fn new() -> Rtpc {
        let (tx, rx) = mpsc::channel::<Job>();
        let task = std::thread::Builder::new()
            .name("rtnet-rtpc".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let token = job.token.clone();
                    match (job.proc)(token) {
                        Verdict::Complete(result) => job.token.complete(result),
                        Verdict::Pending => trace!("rtpc call parked"),
                    }
                }
            })
            .expect("failed to spawn rtpc dispatcher");
        Rtpc {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Run `proc` on the dispatch task and block until it completes, the
    /// timeout expires, or the dispatcher shuts down.
    pub fn call(&self, proc: Proc, timeout: Timeout) -> Result<()> {
        let shared = Arc::new(CallShared {
            state: Mutex::new(CallState::Waiting),
            cond: Condvar::new(),
        });
        let token = CallToken {
            shared: shared.clone(),
        };

        {
            let tx = self.tx.lock().unwrap();
            let tx = tx.as_ref().ok_or(Error::Closed)?;
            tx.send(Job { proc, token }).map_err(|_| Error::Closed)?;
        }

        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Relative(delta) => Some(Instant::now() + delta),
            Timeout::NonBlocking => Some(Instant::now()),
        };

        let mut state = shared.state.lock().unwrap();
        loop {
            match &*state {
                CallState::Done(result) => {
                    let result = *result;
                    *state = CallState::Reaped;
                    return result;
                }
                CallState::Reaped => return Err(Error::Busy),
                CallState::Waiting => {}
            }
            match deadline {
                None => state = shared.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        // Claim the call so a late completion is ignored.
                        *state = CallState::Done(Err(Error::Timeout));
                        return Err(Error::Timeout);
                    }
                    let left = (deadline - now).total_nanos();
                    let (next, _) = shared
                        .cond
                        .wait_timeout(state, std::time::Duration::from_nanos(left as u64))
                        .unwrap();
                    state = next;
                }
            }
        }
    }

    /// Stop accepting calls and join the dispatcher.
    pub fn shutdown(&self) {
        self.tx.lock().unwrap().take();
        if let Some(task) = self.task.lock().unwrap().take() {
            let _ = task.join();
        }
    }
}

impl Default for Rtpc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Rtpc {
    fn drop(&mut self) {
        self.shutdown();
    }
}
