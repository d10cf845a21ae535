//! The reactor core: registry, run loop, signal routing, shutdown.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;

use anyhow::Context as _;
use futures_util::future::select_all;
use tracing::{debug, info, warn};

use crate::reactor::module::Module;
use crate::reactor::signal::{sig, Payload, Signal};
use crate::reactor::Context;

/// The core's own module name.
pub const CORE_NAME: &str = "/core";

/// Prefix identifying UI-class modules; when none remain, shutdown begins.
const UI_PREFIX: &str = "/ui/";

/// One reactor timeout interval.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Ticks between the quit broadcast and forcible module removal.
const DEATH_TICKS: u64 = 60;

/// The synthetic module occupying the core's registry slot.
///
/// Core-addressed traffic is interpreted by the reactor itself; this entry
/// exists so the registry order and the "more than one module" run condition
/// see the core like any other module.
struct CoreModule;

#[async_trait::async_trait(?Send)]
impl Module for CoreModule {
    fn name(&self) -> &str {
        CORE_NAME
    }

    fn handle_signal(&mut self, _ctx: &mut Context, signal: &Signal) {
        debug!(kind = signal.kind, sender = %signal.sender, "core signal");
    }
}

/// The readiness-multiplexing event loop and signal bus.
pub struct Reactor {
    modules: BTreeMap<String, Box<dyn Module>>,
    ctx: Context,
    quit_sent: bool,
    death_at: Option<u64>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    /// Create a reactor with only the core registered.
    pub fn new() -> Self {
        let mut modules: BTreeMap<String, Box<dyn Module>> = BTreeMap::new();
        modules.insert(CORE_NAME.to_string(), Box::new(CoreModule));
        Self {
            modules,
            ctx: Context::default(),
            quit_sent: false,
            death_at: None,
        }
    }

    /// Register a module. Fails (returns `false`) if the name is taken.
    ///
    /// On success `/core/module/new` is broadcast with the module's name.
    pub fn register(&mut self, module: Box<dyn Module>) -> bool {
        let name = module.name().to_string();
        if self.modules.contains_key(&name) {
            warn!(module = %name, "duplicate module name rejected");
            return false;
        }
        info!(module = %name, "module registered");
        self.modules.insert(name.clone(), module);
        self.ctx.emit(
            Signal::new(sig::MODULE_NEW, CORE_NAME, "/").with_payload(Payload::Str(name)),
        );
        true
    }

    /// Queue a signal as if a module had emitted it.
    pub fn emit(&mut self, signal: Signal) {
        self.ctx.emit(signal);
    }

    /// Run until only the core remains registered.
    ///
    /// Each iteration waits (with a one-tick timeout) on every module's
    /// readiness future; a timeout increments the tick counter and
    /// broadcasts `/core/tick`, a wake services the woken module. All
    /// signals queued during the iteration are then delivered FIFO before
    /// the next wait.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        // Deliver registration broadcasts queued before the loop started.
        self.deliver_queued();

        while self.modules.len() > 1 {
            let names: Vec<String> = self.modules.keys().cloned().collect();
            let woken = {
                let waits: Vec<_> = self.modules.values_mut().map(|m| m.ready()).collect();
                match tokio::time::timeout(TICK_INTERVAL, select_all(waits)).await {
                    Ok(((), idx, rest)) => {
                        drop(rest);
                        Some(idx)
                    }
                    Err(_elapsed) => None,
                }
            };

            match woken {
                Some(idx) => {
                    let name = names
                        .get(idx)
                        .context("readiness index out of range")?
                        .clone();
                    if let Some(module) = self.modules.get_mut(&name) {
                        module.service(&mut self.ctx);
                    }
                }
                None => {
                    self.ctx.tick += 1;
                    self.ctx
                        .emit(Signal::new(sig::TICK, CORE_NAME, "/"));
                }
            }

            self.deliver_queued();
            self.check_shutdown();
            self.deliver_queued();
        }

        info!(ticks = self.ctx.tick, "reactor stopped");
        Ok(())
    }

    /// Deliver all queued signals in FIFO order, including any queued by
    /// the deliveries themselves.
    fn deliver_queued(&mut self) {
        while let Some(signal) = self.ctx.next_queued() {
            self.deliver(signal);
        }
    }

    fn deliver(&mut self, signal: Signal) {
        // Core honors an exit request no matter how it was addressed.
        if signal.kind == sig::MODULE_EXITS {
            let name = signal.sender.clone();
            self.remove_module(&name);
            return;
        }

        if signal.receiver.is_empty() {
            return;
        }

        if signal.receiver.ends_with('/') {
            // Prefix delivery: the registry is ordered by name, so modules
            // matching the prefix form a contiguous range starting at its
            // lower bound.
            let prefix = signal.receiver.as_str();
            for (name, module) in self
                .modules
                .range_mut::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            {
                if !name.starts_with(prefix) {
                    break;
                }
                module.handle_signal(&mut self.ctx, &signal);
            }
        } else if let Some(module) = self.modules.get_mut(&signal.receiver) {
            module.handle_signal(&mut self.ctx, &signal);
        }
    }

    fn remove_module(&mut self, name: &str) {
        if name == CORE_NAME {
            return;
        }
        if self.modules.remove(name).is_some() {
            info!(module = %name, "module removed");
            self.ctx.emit(
                Signal::new(sig::MODULE_REMOVE, CORE_NAME, "/")
                    .with_payload(Payload::Str(name.to_string())),
            );
        }
    }

    /// Begin shutdown once no UI-class module remains; after the death
    /// timer, forcibly destroy whatever is still registered.
    fn check_shutdown(&mut self) {
        let ui_alive = self.modules.keys().any(|n| n.starts_with(UI_PREFIX));
        if !ui_alive && !self.quit_sent && self.modules.len() > 1 {
            info!("no UI module left, broadcasting quit");
            self.quit_sent = true;
            self.death_at = Some(self.ctx.tick + DEATH_TICKS);
            self.ctx
                .emit(Signal::new(sig::MODULE_QUIT, CORE_NAME, "/"));
        }

        if let Some(at) = self.death_at {
            if self.ctx.tick >= at && self.modules.len() > 1 {
                let stragglers: Vec<String> = self
                    .modules
                    .keys()
                    .filter(|n| n.as_str() != CORE_NAME)
                    .cloned()
                    .collect();
                for name in stragglers {
                    warn!(module = %name, "death timer expired, destroying module");
                    self.remove_module(&name);
                }
                self.deliver_queued();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn module_names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn flush(&mut self) {
        self.deliver_queued();
    }

    #[cfg(test)]
    pub(crate) fn tick_once(&mut self) {
        self.ctx.tick += 1;
        self.ctx.emit(Signal::new(sig::TICK, CORE_NAME, "/"));
        self.deliver_queued();
        self.check_shutdown();
        self.deliver_queued();
    }
}
