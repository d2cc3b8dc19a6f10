//! Pause/resume/reset/terminate handshake for the background stages.
//!
//! Requests are flags set by the coordinator; the stage's loop polls them at
//! its suspension points and acknowledges by fulfilling one-shot completion
//! channels once the target state is actually observed. A paused stage parks
//! on the condvar holding no database locks.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

/// What the stage loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCommand {
    Continue,
    /// Park until resumed (acknowledge via `acknowledge_pause`).
    Pause,
    /// Drain queues and clear state (acknowledge via `acknowledge_reset`).
    Reset,
    /// Exit the loop (acknowledge via `acknowledge_terminate`).
    Terminate,
}

#[derive(Default)]
struct LifecycleState {
    pause_requested: bool,
    reset_requested: bool,
    terminate_requested: bool,
    is_paused: bool,
    is_terminated: bool,
    pause_promises: Vec<Sender<()>>,
    reset_promises: Vec<Sender<()>>,
    terminate_promises: Vec<Sender<()>>,
}

/// One stage's lifecycle handle, shared between the coordinator and the
/// stage loop.
#[derive(Default)]
pub struct LifecycleControl {
    state: Mutex<LifecycleState>,
    condvar: Condvar,
}

impl LifecycleControl {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Coordinator side ────────────────────────────────────────────────

    /// Request a pause; the returned channel fulfills once the stage parks.
    pub fn async_pause(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        let mut state = self.state.lock();
        if state.is_paused || state.is_terminated {
            let _ = tx.send(());
        } else {
            state.pause_requested = true;
            state.pause_promises.push(tx);
        }
        rx
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.pause_requested = false;
        state.is_paused = false;
        self.condvar.notify_all();
    }

    /// Request a reset; fulfills once the stage has cleared its state.
    pub fn async_reset(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        let mut state = self.state.lock();
        if state.is_terminated {
            let _ = tx.send(());
        } else {
            state.reset_requested = true;
            state.reset_promises.push(tx);
        }
        self.condvar.notify_all();
        rx
    }

    /// Request termination; fulfills once the stage loop has exited.
    pub fn async_terminate(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        let mut state = self.state.lock();
        if state.is_terminated {
            let _ = tx.send(());
        } else {
            state.terminate_requested = true;
            state.terminate_promises.push(tx);
        }
        self.condvar.notify_all();
        rx
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().is_paused
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().is_terminated
    }

    pub fn pause_is_requested(&self) -> bool {
        let state = self.state.lock();
        state.pause_requested && !state.is_paused
    }

    // ── Stage side ──────────────────────────────────────────────────────

    /// Poll at a suspension point.
    pub fn poll(&self) -> LoopCommand {
        let state = self.state.lock();
        if state.terminate_requested {
            LoopCommand::Terminate
        } else if state.reset_requested {
            LoopCommand::Reset
        } else if state.pause_requested {
            LoopCommand::Pause
        } else {
            LoopCommand::Continue
        }
    }

    /// Park until resume/reset/terminate. Fulfills the pause promises first;
    /// the stage must hold no locks when calling this.
    pub fn acknowledge_pause(&self) {
        let mut state = self.state.lock();
        state.is_paused = true;
        for promise in state.pause_promises.drain(..) {
            let _ = promise.send(());
        }
        while state.is_paused
            && state.pause_requested
            && !state.terminate_requested
            && !state.reset_requested
        {
            self.condvar.wait(&mut state);
        }
        state.is_paused = false;
    }

    /// The stage has finished clearing its state.
    pub fn acknowledge_reset(&self) {
        let mut state = self.state.lock();
        state.reset_requested = false;
        for promise in state.reset_promises.drain(..) {
            let _ = promise.send(());
        }
    }

    /// The stage loop is exiting.
    pub fn acknowledge_terminate(&self) {
        let mut state = self.state.lock();
        state.is_terminated = true;
        for promise in state.pause_promises.drain(..) {
            let _ = promise.send(());
        }
        for promise in state.reset_promises.drain(..) {
            let _ = promise.send(());
        }
        for promise in state.terminate_promises.drain(..) {
            let _ = promise.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_pause_handshake() {
        let control = Arc::new(LifecycleControl::new());
        let worker = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || loop {
                match control.poll() {
                    LoopCommand::Continue => std::thread::sleep(Duration::from_millis(1)),
                    LoopCommand::Pause => control.acknowledge_pause(),
                    LoopCommand::Reset => control.acknowledge_reset(),
                    LoopCommand::Terminate => {
                        control.acknowledge_terminate();
                        break;
                    }
                }
            })
        };

        let paused = control.async_pause();
        assert!(paused.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(control.is_paused());

        control.resume();
        let done = control.async_terminate();
        assert!(done.recv_timeout(Duration::from_secs(1)).is_ok());
        worker.join().unwrap();
        assert!(control.is_terminated());
    }

    #[test]
    fn test_pause_after_terminate_fulfills_immediately() {
        let control = LifecycleControl::new();
        control.state.lock().is_terminated = true;
        let rx = control.async_pause();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_reset_wakes_paused_stage() {
        let control = Arc::new(LifecycleControl::new());
        let worker = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || {
                let mut resets = 0;
                loop {
                    match control.poll() {
                        LoopCommand::Continue => std::thread::sleep(Duration::from_millis(1)),
                        LoopCommand::Pause => control.acknowledge_pause(),
                        LoopCommand::Reset => {
                            resets += 1;
                            control.acknowledge_reset();
                        }
                        LoopCommand::Terminate => {
                            control.acknowledge_terminate();
                            return resets;
                        }
                    }
                }
            })
        };

        let paused = control.async_pause();
        paused.recv_timeout(Duration::from_secs(1)).unwrap();
        // Reset must get through even while paused.
        let reset_done = control.async_reset();
        assert!(reset_done.recv_timeout(Duration::from_secs(1)).is_ok());

        control.resume();
        control.async_terminate().recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(worker.join().unwrap(), 1);
    }
}
