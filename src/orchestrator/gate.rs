//! Decides, after each completed pass, whether the run goes on.

use async_trait::async_trait;
#[cfg(any(test, feature = "interactive"))]
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[async_trait]
pub(crate) trait PassGate: Send {
    /// Polled once per completed pass. `false` ends the loop.
    async fn should_continue(&mut self) -> bool;

    /// Line shown to the operator before the gate is polled.
    fn prompt(&self) -> Option<&str> {
        None
    }

    /// Whether the terminal is in raw mode while this gate is alive.
    fn uses_raw_terminal(&self) -> bool {
        false
    }
}

/// No operator attached: every pass is followed by another.
pub(crate) struct Unattended;

#[async_trait]
impl PassGate for Unattended {
    async fn should_continue(&mut self) -> bool {
        true
    }
}

/// Continues until someone raises the shared flag.
#[cfg(any(test, feature = "interactive"))]
#[derive(Clone, Default)]
pub(crate) struct StopFlag {
    flag: Arc<AtomicBool>,
}

#[cfg(any(test, feature = "interactive"))]
impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "interactive"))]
#[async_trait]
impl PassGate for StopFlag {
    async fn should_continue(&mut self) -> bool {
        !self.is_raised()
    }
}

/// Operator-attended gate. Any key pressed while a pass is running ends the
/// loop once that pass completes.
#[cfg(feature = "interactive")]
pub(crate) struct KeypressGate {
    stop: StopFlag,
    listener: tokio::task::JoinHandle<()>,
}

#[cfg(feature = "interactive")]
impl KeypressGate {
    pub fn start() -> std::io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        let stop = StopFlag::new();
        let listener = tokio::spawn(listen_for_key(stop.clone()));
        Ok(Self { stop, listener })
    }
}

#[cfg(feature = "interactive")]
async fn listen_for_key(stop: StopFlag) {
    use crossterm::event::{Event, EventStream, KeyEventKind};
    use futures::StreamExt;

    let mut events = EventStream::new();
    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                tracing::debug!(code = ?key.code, "stop key pressed");
                stop.raise();
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "terminal event stream failed, run continues unattended");
                return;
            }
        }
    }
}

#[cfg(feature = "interactive")]
#[async_trait]
impl PassGate for KeypressGate {
    async fn should_continue(&mut self) -> bool {
        // Let the listener drain any key already queued.
        tokio::task::yield_now().await;
        !self.stop.is_raised()
    }

    fn prompt(&self) -> Option<&str> {
        Some("Press any key to stop after the current pass.")
    }

    fn uses_raw_terminal(&self) -> bool {
        true
    }
}

#[cfg(feature = "interactive")]
impl Drop for KeypressGate {
    fn drop(&mut self) {
        self.listener.abort();
        crossterm::terminal::disable_raw_mode().ok();
    }
}

/// Pick the gate for this process: keypress-driven on a terminal, unattended otherwise.
pub(crate) fn open() -> Box<dyn PassGate> {
    #[cfg(feature = "interactive")]
    {
        use crossterm::tty::IsTty;
        if std::io::stdin().is_tty() {
            match KeypressGate::start() {
                Ok(gate) => return Box::new(gate),
                Err(e) => tracing::warn!(error = %e, "cannot enable raw mode, running unattended"),
            }
        }
    }
    Box::new(Unattended)
}
