// ===============================
// src/debounce.rs
// ===============================
//
// Trailing-edge debounce over a latest-value cell (`watch`):
// - every `call` overwrites the cell and restarts the quiet window
// - when the window elapses the current value goes to the sink
// - dropping the handle closes the cell; a value still waiting is discarded
//   (a sink call already running is left to finish)
//
use std::future::Future;

use tokio::{
    sync::watch,
    time::{sleep, Duration},
};
use tracing::debug;

use crate::metrics::DEBOUNCE_DISCARDED;

pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);

pub struct Debounced<T> {
    name: &'static str,
    cell: watch::Sender<Option<T>>,
}

impl<T> Debounced<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn spawn<F, Fut>(name: &'static str, delay: Duration, sink: F) -> Self
    where
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (cell, mut rx) = watch::channel::<Option<T>>(None);
        tokio::spawn(async move {
            loop {
                // wait for the first value of a new window
                if rx.changed().await.is_err() {
                    return;
                }
                loop {
                    tokio::select! {
                        res = rx.changed() => {
                            if res.is_err() {
                                debug!(debouncer = name, "cancelled, pending value dropped");
                                return;
                            }
                            DEBOUNCE_DISCARDED.with_label_values(&[name]).inc();
                        }
                        _ = sleep(delay) => break,
                    }
                }
                let value = rx.borrow_and_update().clone();
                if let Some(v) = value {
                    sink(v).await;
                }
            }
        });
        Self { name, cell }
    }

    pub fn call(&self, value: T) {
        self.cell.send_replace(Some(value));
    }

    /// Explicit unmount. Same as dropping the handle.
    pub fn cancel(self) {
        debug!(debouncer = self.name, "cancel");
    }
}
