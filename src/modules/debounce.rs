// Cancel-and-reschedule write coalescing.
//
// One pending timer per debouncer. Every `schedule` aborts the previous timer
// and merges the new payload into the pending one, so a burst of edits ends in
// a single write carrying the latest value of every touched field.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Payloads that can absorb a newer payload of the same kind.
pub trait Coalesce {
    /// Fields present in `newer` replace the ones in `self`.
    fn coalesce(&mut self, newer: Self);
}

type Writer<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Slot<T> {
    pending: Option<T>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

pub struct Debouncer<T> {
    delay: Duration,
    runtime: Handle,
    writer: Writer<T>,
    slot: Arc<Mutex<Slot<T>>>,
    // Held across take-and-write so writes land in the order they were taken.
    write_lock: Arc<Mutex<()>>,
}

impl<T> Debouncer<T>
where
    T: Coalesce + Send + 'static,
{
    pub fn new<F>(runtime: Handle, delay: Duration, writer: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            delay,
            runtime,
            writer: Arc::new(writer),
            slot: Arc::new(Mutex::new(Slot {
                pending: None,
                generation: 0,
                timer: None,
            })),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Merges `payload` into the pending write and restarts the idle window.
    pub fn schedule(&self, payload: T) {
        let mut slot = self.slot.lock();
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        match slot.pending.as_mut() {
            Some(pending) => pending.coalesce(payload),
            None => slot.pending = Some(payload),
        }
        slot.generation += 1;

        let generation = slot.generation;
        let delay = self.delay;
        let slot_ref = Arc::clone(&self.slot);
        let writer = Arc::clone(&self.writer);
        let write_lock = Arc::clone(&self.write_lock);

        slot.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            let _write = write_lock.lock();
            let payload = {
                let mut slot = slot_ref.lock();
                // A newer schedule or a flush already owns the payload.
                if slot.generation != generation {
                    return;
                }
                slot.timer = None;
                slot.pending.take()
            };
            if let Some(payload) = payload {
                writer(payload);
            }
        }));
    }

    /// Writes the pending payload now, on the calling thread.
    /// Returns whether anything was written.
    pub fn flush(&self) -> bool {
        let _write = self.write_lock.lock();
        let payload = self.take_pending();
        match payload {
            Some(payload) => {
                (self.writer)(payload);
                true
            }
            None => false,
        }
    }

    /// Drops the pending payload without writing it.
    pub fn cancel(&self) -> Option<T> {
        self.take_pending()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().pending.is_some()
    }

    fn take_pending(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.generation += 1;
        slot.pending.take()
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.slot.lock().timer.take() {
            timer.abort();
        }
    }
}
