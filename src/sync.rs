//! Task synchronization primitives.
//!
//! `Event` is the wake-up channel between interrupt-like producers and the
//! stack's service tasks: the stack manager sleeps on one, drivers signal
//! it; the TDMA worker sleeps on the sync event, the frame handler signals
//! it. A signal raised while no one waits is latched and satisfies the
//! next waiter, so producer-before-consumer races never lose a wake-up;
//! a signal raised while tasks wait releases all of them. `close`
//! unblocks every waiter with an error for teardown.

use std::sync::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::time::{Instant, Timeout};

#[derive(Debug)]
struct EventState {
    /// Incremented on every signal; waiters present before the signal
    /// observe the change.
    ticket: u64,
    /// One pending signal for a waiter that arrives late.
    latched: bool,
    closed: bool,
}

/// A latching wake-up event with close semantics.
#[derive(Debug)]
pub struct Event {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Event {
        Event {
            state: Mutex::new(EventState {
                ticket: 0,
                latched: false,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Wake every current waiter and latch one wake-up for the next.
    pub fn signal(&self) {
        let mut state = self.state.lock().unwrap();
        state.ticket = state.ticket.wrapping_add(1);
        state.latched = true;
        self.cond.notify_all();
    }

    /// Unblock all waiters with [`Error::Closed`], now and forever.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Wait until the event is signalled, consuming a latched signal if
    /// one is pending. Fails on timeout or when the event is closed.
    pub fn wait(&self, timeout: Timeout) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.latched {
            state.latched = false;
            return Ok(());
        }
        if matches!(timeout, Timeout::NonBlocking) {
            return Err(Error::WouldBlock);
        }

        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Relative(delta) => Some(Instant::now() + delta),
            Timeout::NonBlocking => unreachable!(),
        };

        let entry_ticket = state.ticket;
        loop {
            if state.closed {
                return Err(Error::Closed);
            }
            if state.ticket != entry_ticket {
                // Signalled while we were waiting; the latch belongs to
                // the next late arriver only if no one consumed it.
                return Ok(());
            }
            match deadline {
                None => state = self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        return Err(Error::Timeout);
                    }
                    let left = (deadline - now).total_nanos();
                    let (next, _) = self
                        .cond
                        .wait_timeout(state, std::time::Duration::from_nanos(left as u64))
                        .unwrap();
                    state = next;
                }
            }
        }
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Duration;
    use std::sync::Arc;

    #[test]
    fn signal_before_wait_is_latched() {
        let ev = Event::new();
        ev.signal();
        assert_eq!(ev.wait(Timeout::NonBlocking), Ok(()));
        // The latch was consumed.
        assert_eq!(ev.wait(Timeout::NonBlocking), Err(Error::WouldBlock));
    }

    #[test]
    fn waiter_is_woken_by_signal() {
        let ev = Arc::new(Event::new());
        let waiter = {
            let ev = ev.clone();
            std::thread::spawn(move || ev.wait(Timeout::Infinite))
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        ev.signal();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn timeout_expires() {
        let ev = Event::new();
        assert_eq!(
            ev.wait(Timeout::Relative(Duration::from_millis(5))),
            Err(Error::Timeout)
        );
    }

    #[test]
    fn close_unblocks_waiters() {
        let ev = Arc::new(Event::new());
        let waiter = {
            let ev = ev.clone();
            std::thread::spawn(move || ev.wait(Timeout::Infinite))
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        ev.close();
        assert_eq!(waiter.join().unwrap(), Err(Error::Closed));
        assert_eq!(ev.wait(Timeout::Infinite), Err(Error::Closed));
    }
}
