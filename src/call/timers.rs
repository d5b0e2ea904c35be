//! Named, owned timer slots
//!
//! Each slot holds at most one armed timer. Arming cancels the previous
//! one first, cancelling an empty slot is a no-op, and every arm bumps a
//! generation so an expiry already queued by a cancelled timer can be told
//! apart from a live one.

use std::future::Future;

use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct TimerSlot {
    name: &'static str,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            generation: 0,
            handle: None,
        }
    }

    /// Arm the slot with the task built from the new generation
    pub fn arm<F, Fut>(&mut self, start: F) -> u64
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        self.handle = Some(tokio::spawn(start(generation)));
        tracing::trace!("Timer {} armed (generation {})", self.name, generation);
        generation
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::trace!("Timer {} cancelled", self.name);
        }
        self.generation += 1;
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Whether an expiry carrying `generation` still belongs to the armed timer
    pub fn is_current(&self, generation: u64) -> bool {
        self.handle.is_some() && self.generation == generation
    }

    /// Forget the timer after its expiry was handled
    pub fn clear(&mut self) {
        self.handle = None;
        self.generation += 1;
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Per-call timers
#[derive(Debug)]
pub struct CallTimers {
    pub ringing: TimerSlot,
    pub duration: TimerSlot,
}

impl CallTimers {
    pub fn new() -> Self {
        Self {
            ringing: TimerSlot::new("ringing-watchdog"),
            duration: TimerSlot::new("duration-ticker"),
        }
    }

    pub fn cancel_all(&mut self) {
        self.ringing.cancel();
        self.duration.cancel();
    }
}

impl Default for CallTimers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimerSlot::new("test");

        let first = slot.arm(|generation| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let _ = tx.send(generation);
            }
        });
        let second = slot.arm(|generation| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let _ = tx.send(generation);
            }
        });
        assert_ne!(first, second);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rx.recv().await, Some(second));
        assert!(rx.try_recv().is_err());
        assert!(slot.is_current(second));
        assert!(!slot.is_current(first));
    }

    #[tokio::test]
    async fn test_cancel_empty_slot_is_noop() {
        let mut slot = TimerSlot::new("test");
        slot.cancel();
        slot.cancel();
        assert!(!slot.is_armed());
        assert!(!slot.is_current(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_generation_is_stale() {
        let mut slot = TimerSlot::new("test");
        let generation = slot.arm(|_| async {});
        slot.cancel();
        assert!(!slot.is_current(generation));
    }
}
