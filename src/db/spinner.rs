//! Progress indicator shown on stderr while a connect is in flight.
//!
//! The spinner is a tokio task owned by a [`Spinner`] handle. `stop()` signals
//! it and joins it; dropping the handle without stopping aborts the task, so
//! the indicator never outlives the connect attempt.

use std::io::Write;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];

pub struct Spinner {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<u32>>,
}

impl Spinner {
    /// Starts ticking every `interval`. Frames are only drawn when `visible`;
    /// the task still runs so the lifecycle is identical either way.
    pub fn start(label: impl Into<String>, visible: bool, interval: Duration) -> Self {
        let label = label.into();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut ticks: u32 = 0;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if visible {
                            let frame = FRAMES[ticks as usize % FRAMES.len()];
                            let mut err = std::io::stderr();
                            let _ = write!(err, "\r{frame} {label}");
                            let _ = err.flush();
                        }
                        ticks = ticks.wrapping_add(1);
                    }
                }
            }
            if visible {
                let mut err = std::io::stderr();
                let _ = write!(err, "\r{}\r", " ".repeat(label.chars().count() + 2));
                let _ = err.flush();
            }
            ticks
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Stops the indicator and waits for its task. Returns the number of
    /// frames ticked.
    pub async fn stop(mut self) -> u32 {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                debug!("spinner task ended abnormally: {e}");
                0
            }),
            None => 0,
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
