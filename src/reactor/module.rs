//! The contract every component implements to plug into the reactor.

use async_trait::async_trait;

use crate::reactor::signal::Signal;
use crate::reactor::Context;

/// A reactor module.
///
/// The reactor multiplexes every registered module's [`ready`](Module::ready)
/// future with a one-second timeout; when a module wakes, its
/// [`service`](Module::service) runs on the reactor thread. No method may
/// block: `ready` is the only suspension point, and `service` must do purely
/// non-blocking work (`try_read`/`try_write` and the like).
#[async_trait(?Send)]
pub trait Module {
    /// Unique slash-prefixed module name (`/net/ppcp`, `/ui/term`).
    fn name(&self) -> &str;

    /// Resolve when the module has I/O to service. Must be cancel-safe:
    /// the reactor drops and re-creates this future every iteration.
    ///
    /// Modules without I/O sources keep the default, which never resolves.
    async fn ready(&mut self) {
        std::future::pending::<()>().await
    }

    /// Service whatever [`ready`](Module::ready) observed.
    fn service(&mut self, _ctx: &mut Context) {}

    /// Handle a signal delivered to this module.
    fn handle_signal(&mut self, ctx: &mut Context, signal: &Signal);
}
