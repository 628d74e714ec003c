// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt handling for user-mode device drivers.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;
use std::time::Instant;

/// A mapped device interrupt.
///
/// This interrupt can be cloned multiple times. Each clone will be separately
/// waitable. Initially, the clone is in the not-signaled state, even if the
/// original instance is signaled.
pub struct DeviceInterrupt {
    slot: Arc<DeviceInterruptSlot>,
    inner: Arc<DeviceInterruptInner>,
}

impl Clone for DeviceInterrupt {
    fn clone(&self) -> Self {
        self.inner.new_interrupt()
    }
}

impl Drop for DeviceInterrupt {
    fn drop(&mut self) {
        let mut slots = self.inner.slots.lock();
        if let Some(i) = slots.iter().position(|s| Arc::ptr_eq(s, &self.slot)) {
            slots.swap_remove(i);
        }
    }
}

impl DeviceInterrupt {
    /// Polls the interrupt, returning `Poll::Ready` if the interrupt is
    /// signaled.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.slot.poll(cx)
    }

    /// Waits for the interrupt to be signaled.
    pub async fn wait(&mut self) {
        poll_fn(|cx| self.poll(cx)).await
    }

    /// Blocks the calling thread until the interrupt is signaled or `deadline`
    /// passes. Returns true if the interrupt was signaled.
    pub fn wait_until(&mut self, deadline: Instant) -> bool {
        self.slot.wait_until(deadline)
    }

    /// Consumes a pending signal without waiting.
    pub fn try_consume(&mut self) -> bool {
        std::mem::take(&mut self.slot.state.lock().signaled)
    }
}

#[derive(Default)]
struct SlotState {
    signaled: bool,
    waker: Option<Waker>,
}

struct DeviceInterruptSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl DeviceInterruptSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            cond: Condvar::new(),
        }
    }

    fn poll(&self, cx: &mut Context<'_>) -> Poll<()> {
        let _old_waker;
        let mut state = self.state.lock();
        if std::mem::take(&mut state.signaled) {
            Poll::Ready(())
        } else {
            if state.waker.as_ref().is_none_or(|w| !w.will_wake(cx.waker())) {
                _old_waker = state.waker.replace(cx.waker().clone());
            }
            Poll::Pending
        }
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        while !state.signaled {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        std::mem::take(&mut state.signaled)
    }

    fn signal(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.signaled = true;
            self.cond.notify_all();
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

struct DeviceInterruptInner {
    slots: Mutex<Vec<Arc<DeviceInterruptSlot>>>,
}

impl DeviceInterruptInner {
    fn new_interrupt(self: &Arc<Self>) -> DeviceInterrupt {
        let slot = Arc::new(DeviceInterruptSlot::new());
        self.slots.lock().push(slot.clone());
        DeviceInterrupt {
            slot,
            inner: self.clone(),
        }
    }
}

/// A source of device interrupts.
///
/// This is intended to be used by the device backends to signal the
/// [`DeviceInterrupt`] instances used by the drivers.
pub struct DeviceInterruptSource {
    inner: Arc<DeviceInterruptInner>,
}

impl Default for DeviceInterruptSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceInterruptSource {
    /// Creates a new interrupt source.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DeviceInterruptInner {
                slots: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a new interrupt target, each of which is notified when `signal`
    /// is called.
    pub fn new_target(&self) -> DeviceInterrupt {
        self.inner.new_interrupt()
    }

    /// Signals all interrupt targets.
    pub fn signal(&self) {
        for slot in &*self.inner.slots.lock() {
            slot.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DeviceInterruptSource;
    use std::time::Duration;
    use std::time::Instant;

    #[test]
    fn test_interrupt() {
        let source = DeviceInterruptSource::new();
        let mut target = source.new_target();
        source.signal();
        futures::executor::block_on(target.wait());
        let mut target_clone = target.clone();
        let thread = std::thread::spawn(move || {
            futures::executor::block_on(target_clone.wait());
        });
        source.signal();
        thread.join().unwrap();
        assert!(target.try_consume());
        assert!(!target.try_consume());
    }

    #[test]
    fn wait_until_times_out_without_signal() {
        let source = DeviceInterruptSource::new();
        let mut target = source.new_target();
        let start = Instant::now();
        assert!(!target.wait_until(start + Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_until_wakes_on_signal_from_other_thread() {
        let source = DeviceInterruptSource::new();
        let mut target = source.new_target();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            source.signal();
        });
        assert!(target.wait_until(Instant::now() + Duration::from_secs(10)));
        thread.join().unwrap();
    }
}
