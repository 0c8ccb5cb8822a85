//! The round-robin polling worker.
//!
//! One background thread owns the transport for the whole polling
//! session and walks the active sensor set in insertion order. Each
//! rotation step visits one sensor; whether the sensor actually gets
//! the bus is decided by its frequency divider. Decode and timeout
//! failures are per-iteration noise; a closed link ends the session.

use log::{error, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::error::TransportError;
use crate::events::Dispatcher;
use crate::rule::RuleEngine;
use crate::sensor::{Registry, SensorUpdate};
use crate::session::StateCell;
use crate::transport::Transport;

/// Per-command deadline while polling.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(2500);

/// Handle to the running poller thread.
pub(crate) struct Poller {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Poller {
    /// Spawn the worker. It takes the transport lock immediately and
    /// holds it until it exits.
    pub(crate) fn spawn(
        transport: Arc<Mutex<Transport>>,
        registry: Arc<Mutex<Registry>>,
        rules: Arc<Mutex<RuleEngine>>,
        dispatcher: Arc<Dispatcher>,
        state: Arc<StateCell>,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("obdmon-poller".to_owned())
            .spawn(move || run(transport, registry, rules, dispatcher, state, stop_flag))?;

        Ok(Poller { stop, handle })
    }

    /// Cooperative stop: raise the flag and wait for the worker to hand
    /// the transport back. Worst case one transport deadline.
    pub(crate) fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

fn run(
    transport: Arc<Mutex<Transport>>,
    registry: Arc<Mutex<Registry>>,
    rules: Arc<Mutex<RuleEngine>>,
    dispatcher: Arc<Dispatcher>,
    state: Arc<StateCell>,
    stop: Arc<AtomicBool>,
) {
    // the whole polling session holds the transport
    let Ok(mut link) = transport.lock() else {
        error!("transport lock poisoned, abandoning polling");
        state.settle(true);
        return;
    };

    info!("polling started");
    let mut index = 0usize;
    let mut failed = false;

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        // pick the next sensor under the registry lock, then release it
        // before touching the bus so the kernel can mutate the set
        let job = {
            let Ok(mut reg) = registry.lock() else {
                failed = true;
                break;
            };
            let active = reg.active();
            if active.is_empty() {
                info!("active set empty, polling ends");
                break;
            }
            if index >= active.len() {
                index = 0;
            }
            let pid = active[index];
            index += 1;

            match reg.get_mut(pid) {
                Some(sensor) => {
                    if sensor.is_turn() {
                        Some((pid, sensor.request_text()))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        let Some((pid, request)) = job else {
            continue;
        };

        let raw = match link.send_and_read(&request, POLL_TIMEOUT) {
            Ok(raw) => raw,
            Err(TransportError::Timeout) => {
                warn!("timeout servicing {pid}, moving on");
                continue;
            }
            Err(e) => {
                error!("transport failed while polling: {e}");
                dispatcher.error(&format!("serial link lost: {e}"));
                failed = true;
                break;
            }
        };

        // the sensor may have been deactivated while we were on the bus
        let update = {
            let Ok(mut reg) = registry.lock() else {
                failed = true;
                break;
            };
            match reg.get_mut(pid) {
                Some(sensor) => sensor.accept(&raw),
                None => continue,
            }
        };

        match update {
            Ok(SensorUpdate::Changed(value)) => {
                dispatcher.value_changed(pid, value);
                let fired = match rules.lock() {
                    Ok(mut engine) => engine.on_value(pid, value),
                    Err(_) => Vec::new(),
                };
                for name in fired {
                    dispatcher.rule_satisfied(&name);
                }
            }
            Ok(SensorUpdate::OutOfRange { message, .. }) => {
                dispatcher.error(&message);
            }
            Ok(SensorUpdate::Unchanged) => {}
            Err(e) => {
                warn!("could not decode response for {pid}: {e}");
            }
        }
    }

    info!("polling stopped");
    state.settle(failed);
}
