//! The reactor: module registry, readiness multiplexing, signal delivery.

mod core;
mod module;
mod signal;

pub use self::core::{Reactor, CORE_NAME};
pub use module::Module;
pub use signal::{sig, ChangeFlags, ChatMessage, Payload, Signal, UserChange};

use std::collections::VecDeque;

/// Per-iteration context handed to every module call.
///
/// Replaces process-wide shared state: the current tick and a reusable
/// scratch buffer travel explicitly, and signals are queued here for FIFO
/// delivery at the end of the reactor iteration.
#[derive(Debug, Default)]
pub struct Context {
    /// Monotonic tick counter (one tick per reactor timeout interval).
    pub tick: u64,
    /// Reusable output scratch space for packet assembly.
    pub scratch: String,
    queue: VecDeque<Signal>,
}

impl Context {
    /// Queue a signal for delivery after the current iteration.
    pub fn emit(&mut self, signal: Signal) {
        self.queue.push_back(signal);
    }

    /// Queue a `/ui/msg/*` line.
    pub fn emit_line(&mut self, kind: &'static str, sender: &str, text: impl Into<String>) {
        self.emit(
            Signal::new(kind, sender, "/ui/").with_payload(Payload::Str(text.into())),
        );
    }

    fn next_queued(&mut self) -> Option<Signal> {
        self.queue.pop_front()
    }

    #[cfg(test)]
    pub(crate) fn drain_queued(&mut self) -> Vec<Signal> {
        self.queue.drain(..).collect()
    }
}
