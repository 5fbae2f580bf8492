// This file is part of gpadcd, the Basin Cove GPADC sampler daemon
// Copyright (C) 2024 Pengutronix e.K.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use async_std::channel::{bounded, Receiver, Sender, TrySendError};
use async_std::sync::Arc;
use async_std::task::block_on;
use log::{debug, warn};

use super::sampler::Sampler;

#[cfg(any(test, feature = "demo_mode"))]
mod prio {
    use anyhow::Result;

    pub fn realtime_priority() -> Result<()> {
        Ok(())
    }
}

#[cfg(not(any(test, feature = "demo_mode")))]
mod prio {
    use std::convert::TryFrom;

    use anyhow::{anyhow, Result};
    use thread_priority::*;

    pub fn realtime_priority() -> Result<()> {
        let prio = ThreadPriorityValue::try_from(10u8)
            .map_err(|e| anyhow!("Failed to create thread priority value: {e:?}"))?;

        set_thread_priority_and_policy(
            thread_native_id(),
            ThreadPriority::Crossplatform(prio),
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        )
        .map_err(|e| anyhow!("Failed to set up realtime priority {e:?}"))
    }
}

use prio::realtime_priority;

pub(super) const WORKER_THREAD_NAME: &str = "gpadc-irq";

/// What the fast interrupt handler did with an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The interrupt was noted, nothing else is left to do
    Handled,
    /// The deferred handler has to acknowledge the interrupt at the PMIC
    WakeThread,
}

struct State {
    done: bool,
    acks_pending: u32,
}

/// The "sample done" flag and the wait queue readers sleep on.
///
/// Also counts the acknowledgements queued for the deferred worker, so that
/// a new request does not unmask the interrupt just before a late
/// acknowledgement masks it again.
pub(super) struct Completion {
    state: Mutex<State>,
    wake: Condvar,
}

impl Completion {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                done: false,
                acks_pending: 0,
            }),
            wake: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn clear(&self) {
        self.state().done = false;
    }

    pub(super) fn complete(&self) {
        self.state().done = true;
        self.wake.notify_all();
    }

    /// Sleep until `complete()` is called or `timeout` passes.
    /// Returns whether the completion was seen.
    pub(super) fn wait(&self, timeout: Duration) -> bool {
        let (state, _) = self
            .wake
            .wait_timeout_while(self.state(), timeout, |state| !state.done)
            .unwrap_or_else(PoisonError::into_inner);

        state.done
    }

    fn ack_queued(&self) {
        self.state().acks_pending += 1;
    }

    pub(super) fn ack_finished(&self) {
        let mut state = self.state();
        state.acks_pending = state.acks_pending.saturating_sub(1);
        self.wake.notify_all();
    }

    /// Sleep until no acknowledgement is pending or `timeout` passes.
    /// Returns whether all acknowledgements were done.
    pub(super) fn wait_acked(&self, timeout: Duration) -> bool {
        let (state, _) = self
            .wake
            .wait_timeout_while(self.state(), timeout, |state| state.acks_pending > 0)
            .unwrap_or_else(PoisonError::into_inner);

        state.acks_pending == 0
    }
}

/// The two stage handler an InterruptLine calls into.
///
/// `fire()` is safe to call from contexts that must not block on the
/// PMIC: it only flips the completion flag and queues the acknowledgement
/// for the deferred worker, which is the one doing register accesses.
#[derive(Clone)]
pub struct IrqAction {
    completion: Arc<Completion>,
    deferred: Sender<()>,
}

impl IrqAction {
    pub(super) fn new(completion: Arc<Completion>, deferred: Sender<()>) -> Self {
        Self {
            completion,
            deferred,
        }
    }

    pub fn fire(&self) -> IrqReturn {
        // Account for the acknowledgement before the reader wakes up
        self.completion.ack_queued();
        self.completion.complete();

        // The queue holds a single element. If an acknowledgement is already
        // pending this interrupt is covered by it.
        match self.deferred.try_send(()) {
            Ok(()) => IrqReturn::WakeThread,
            Err(TrySendError::Full(_)) => {
                self.completion.ack_finished();
                IrqReturn::WakeThread
            }
            Err(TrySendError::Closed(_)) => {
                self.completion.ack_finished();
                IrqReturn::Handled
            }
        }
    }
}

/// The thread running the deferred half of the interrupt handler.
pub(super) struct DeferredWorker {
    queue: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DeferredWorker {
    pub(super) fn spawn(sampler: Arc<Sampler>) -> Result<Self> {
        let (queue, rx) = bounded(1);

        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || Self::run(sampler, rx))?;

        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    fn run(sampler: Arc<Sampler>, rx: Receiver<()>) {
        if let Err(e) = realtime_priority() {
            warn!("GPADC interrupt worker runs without realtime priority: {e}");
        }

        // recv() only fails once the queue is closed and drained
        let completion = sampler.completion();

        while block_on(rx.recv()).is_ok() {
            if let Err(e) = sampler.acknowledge_irq() {
                warn!("Failed to acknowledge GPADC interrupt: {e}");
            }

            completion.ack_finished();
        }

        debug!("GPADC interrupt worker exiting");
    }

    pub(super) fn queue(&self) -> Sender<()> {
        self.queue.clone()
    }

    /// Stop accepting work, finish what is queued and wait for the thread.
    pub(super) fn stop(&mut self) {
        self.queue.close();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("GPADC interrupt worker panicked");
            }
        }
    }
}

impl Drop for DeferredWorker {
    fn drop(&mut self) {
        self.stop()
    }
}
