//! The single point of entry to the engine.
//!
//! The kernel owns the transport, the adapter session, the sensor
//! registry, the DTC service, and the rules, and enforces that exactly
//! one of introspection, DTC operations, or polling uses the serial
//! link at any moment.

use log::{info, warn};
use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::dtc::{Dtc, DtcDictionary, DtcService};
use crate::error::{KernelError, SessionError, TransportError};
use crate::events::{Dispatcher, ErrorHandler, RuleHandler, ValueHandler};
use crate::poller::Poller;
use crate::rule::{self, Rule, RuleEngine};
use crate::sensor::{Pid, Registry, SensorSnapshot};
use crate::session::{Session, SessionState, StateCell};
use crate::transport::{Link, Transport};

type Result<T> = std::result::Result<T, KernelError>;

/// Facade over the whole diagnostic engine.
pub struct Kernel {
    state: Arc<StateCell>,
    session: Session,
    transport: Option<Arc<Mutex<Transport>>>,
    registry: Arc<Mutex<Registry>>,
    rules: Arc<Mutex<RuleEngine>>,
    dispatcher: Arc<Dispatcher>,
    dtc: DtcService,
    poller: Option<Poller>,
    grace: Duration,
}

impl Kernel {
    /// A kernel with an empty DTC dictionary.
    pub fn new() -> Self {
        Kernel::with_dictionary(DtcDictionary::new())
    }

    /// A kernel resolving trouble codes against `dictionary`.
    pub fn with_dictionary(dictionary: DtcDictionary) -> Self {
        Kernel {
            state: Arc::new(StateCell::new()),
            session: Session::new(),
            transport: None,
            registry: Arc::new(Mutex::new(Registry::with_builtin())),
            rules: Arc::new(Mutex::new(RuleEngine::new())),
            dispatcher: Arc::new(Dispatcher::new()),
            dtc: DtcService::new(dictionary),
            poller: None,
            grace: Duration::from_secs(1),
        }
    }

    /// Shorten the init-sequence grace sleeps, for simulated adapters
    /// that need no settling time.
    pub fn set_init_grace(&mut self, grace: Duration) {
        self.grace = grace;
        self.session.set_grace(grace);
    }

    /// Where the session currently is.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Establish a session over `link`: probe the adapter, run the init
    /// sequence, discover capabilities, and take stock of stored codes.
    pub fn connect(&mut self, link: Box<dyn Link>) -> Result<()> {
        if !self.state.move_to(SessionState::Connecting) {
            return Err(KernelError::Busy);
        }

        let mut transport = Transport::new(link);
        match self.bring_up(&mut transport) {
            Ok(()) => {
                self.transport = Some(Arc::new(Mutex::new(transport)));
                self.state.move_to(SessionState::Ready);
                info!("session ready");
                Ok(())
            }
            Err(e) => {
                self.state.move_to(SessionState::Failed);
                self.dispatcher.error(&format!("session failed: {e}"));
                Err(e)
            }
        }
    }

    /// Open the named serial port and connect through it.
    #[cfg(feature = "serialport_comm")]
    pub fn connect_port(&mut self, path: &str) -> Result<()> {
        let link = crate::transport::SerialPortLink::open(path)
            .map_err(KernelError::Transport)?;
        self.connect(Box::new(link))
    }

    fn bring_up(&mut self, transport: &mut Transport) -> Result<()> {
        if !self.session.ping(transport)? {
            return Err(SessionError::AdapterUnresponsive("ATPC").into());
        }
        self.session.initialise(transport)?;

        let capabilities = crate::capability::CapabilityMap::query(transport)?;
        capabilities.apply(&mut *self.registry()?);

        self.dtc.refresh(transport)?;
        Ok(())
    }

    /// Tear the session down from any state: stop the poller, forget
    /// everything session-scoped, and drop the transport.
    pub fn disconnect(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        if let Ok(mut registry) = self.registry.lock() {
            registry.clear_active();
        }
        if let Ok(mut rules) = self.rules.lock() {
            rules.deactivate_all();
        }
        self.dtc.clear();
        self.session = Session::new();
        self.session.set_grace(self.grace);
        self.transport = None;
        self.state.move_to(SessionState::Idle);
        info!("session closed");
    }

    // ---- sensor inventory --------------------------------------------

    /// Snapshots of every sensor in the inventory.
    pub fn sensors(&self) -> Result<Vec<SensorSnapshot>> {
        let registry = self.registry()?;
        Ok(registry
            .sensors()
            .iter()
            .map(|s| s.snapshot(registry.is_active(s.pid())))
            .collect())
    }

    /// Snapshot of one sensor.
    pub fn sensor(&self, pid: Pid) -> Result<SensorSnapshot> {
        let registry = self.registry()?;
        registry
            .get(pid)
            .map(|s| s.snapshot(registry.is_active(pid)))
            .ok_or_else(|| KernelError::UnknownPid(pid.to_string()))
    }

    /// Service the sensor once every `divider` poller rotations.
    pub fn set_frequency(&self, pid: Pid, divider: u32) -> Result<()> {
        let mut registry = self.registry()?;
        registry
            .get_mut(pid)
            .ok_or_else(|| KernelError::UnknownPid(pid.to_string()))?
            .set_divider(divider);
        Ok(())
    }

    /// Add a sensor to the active set. The vehicle must support it.
    pub fn activate(&self, pid: Pid) -> Result<()> {
        if matches!(
            self.state.get(),
            SessionState::Idle | SessionState::Connecting | SessionState::Failed
        ) {
            return Err(KernelError::NotConnected);
        }
        self.registry()?.activate(pid)
    }

    /// Remove a sensor from the active set. Rules referencing it are
    /// deactivated and reported through the error stream.
    pub fn deactivate(&self, pid: Pid) -> Result<()> {
        self.registry()?.deactivate(pid)?;
        let dropped = match self.rules.lock() {
            Ok(mut rules) => rules.on_sensor_deactivated(pid),
            Err(_) => Vec::new(),
        };
        for name in dropped {
            warn!("rule `{name}` lost sensor {pid}");
            self.dispatcher
                .error(&format!("rule `{name}` deactivated: {}", crate::error::RuleError::MissingSensor(pid)));
        }
        Ok(())
    }

    // ---- polling ------------------------------------------------------

    /// Hand the transport to the poller and start servicing the active
    /// set.
    pub fn start_polling(&mut self) -> Result<()> {
        match self.state.get() {
            SessionState::Ready => {}
            SessionState::Polling => return Err(KernelError::Busy),
            _ => return Err(KernelError::NotConnected),
        }
        let transport = self.transport.clone().ok_or(KernelError::NotConnected)?;
        if !self.state.move_to(SessionState::Polling) {
            return Err(KernelError::Busy);
        }

        match Poller::spawn(
            transport,
            Arc::clone(&self.registry),
            Arc::clone(&self.rules),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.state),
        ) {
            Ok(poller) => {
                self.poller = Some(poller);
                Ok(())
            }
            Err(e) => {
                self.state.settle(false);
                Err(e.into())
            }
        }
    }

    /// Ask the poller to finish its current step and hand the transport
    /// back. Blocks for at most one transport deadline.
    pub fn stop_polling(&mut self) -> Result<()> {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        Ok(())
    }

    // ---- introspection ------------------------------------------------

    /// The vehicle identification number.
    pub fn vin(&mut self) -> Result<String> {
        let transport = self.exclusive_transport()?;
        let mut guard = transport.try_lock().map_err(|_| TransportError::Busy)?;
        Ok(self.session.vin(&mut guard)?)
    }

    /// The bus protocol the adapter negotiated.
    pub fn protocol(&mut self) -> Result<String> {
        let transport = self.exclusive_transport()?;
        let mut guard = transport.try_lock().map_err(|_| TransportError::Busy)?;
        Ok(self.session.protocol(&mut guard)?)
    }

    /// The OBD standard the vehicle declares.
    pub fn standard(&mut self) -> Result<String> {
        let transport = self.exclusive_transport()?;
        let mut guard = transport.try_lock().map_err(|_| TransportError::Busy)?;
        Ok(self.session.obd_standard(&mut guard)?)
    }

    /// The adapter's identification string.
    pub fn adapter_version(&mut self) -> Result<String> {
        let transport = self.exclusive_transport()?;
        let mut guard = transport.try_lock().map_err(|_| TransportError::Busy)?;
        Ok(self.session.adapter_version(&mut guard)?)
    }

    /// Battery voltage as seen by the adapter.
    pub fn voltage(&mut self) -> Result<String> {
        let transport = self.exclusive_transport()?;
        let mut guard = transport.try_lock().map_err(|_| TransportError::Busy)?;
        Ok(self.session.voltage(&mut guard)?)
    }

    // ---- diagnostic trouble codes ------------------------------------

    /// Re-enumerate and return the stored codes.
    pub fn dtcs(&mut self) -> Result<Vec<Dtc>> {
        let transport = self.exclusive_transport()?;
        let mut guard = transport.try_lock().map_err(|_| TransportError::Busy)?;
        self.dtc.refresh(&mut guard)?;
        Ok(self.dtc.codes().to_vec())
    }

    /// Whether the malfunction indicator lamp is lit.
    pub fn mil_on(&mut self) -> Result<bool> {
        let transport = self.exclusive_transport()?;
        let mut guard = transport.try_lock().map_err(|_| TransportError::Busy)?;
        self.dtc.read_status(&mut guard)?;
        Ok(self.dtc.mil_on())
    }

    /// How many codes the ECU reports stored.
    pub fn dtc_count(&mut self) -> Result<u8> {
        let transport = self.exclusive_transport()?;
        let mut guard = transport.try_lock().map_err(|_| TransportError::Busy)?;
        self.dtc.read_status(&mut guard)?;
        Ok(self.dtc.count())
    }

    /// Clear stored codes and the MIL. Returns false when the ECU had
    /// nothing stored.
    pub fn reset_codes(&mut self) -> Result<bool> {
        let transport = self.exclusive_transport()?;
        let mut guard = transport.try_lock().map_err(|_| TransportError::Busy)?;
        self.dtc.reset(&mut guard)
    }

    // ---- rules --------------------------------------------------------

    /// Parse, register, and activate a rule. Every referenced sensor
    /// must already be in the active set.
    pub fn add_rule(&self, source: &str) -> Result<()> {
        let source = source.trim();
        let name = self.render_rule(source)?;
        let mut rule = Rule::parse(name, source)?;
        {
            let registry = self.registry()?;
            rule.activate(registry.active())?;
        }
        self.rule_engine()?.add(rule);
        Ok(())
    }

    /// Remove a rule by its source text or rendered name.
    pub fn remove_rule(&self, source_or_name: &str) -> Result<()> {
        let mut rules = self.rule_engine()?;
        match rules.remove(source_or_name) {
            Some(mut rule) => {
                rule.deactivate();
                Ok(())
            }
            None => Err(KernelError::RuleNotActive(source_or_name.to_owned())),
        }
    }

    /// The source text of every registered rule.
    pub fn rules(&self) -> Result<Vec<String>> {
        Ok(self.rule_engine()?.sources())
    }

    /// Render a rule for humans: sensor names instead of references,
    /// `AND`/`OR` instead of the connectors.
    pub fn render_rule(&self, source: &str) -> Result<String> {
        let registry = self.registry()?;
        Ok(rule::render_english(source, |pid| {
            registry.get(pid).map(|s| s.name())
        }))
    }

    /// Read the rule file, registering every line that parses. Rules
    /// whose sensors are all active are activated right away. Returns
    /// how many rules were registered.
    pub fn load_rules(&self, path: &Path) -> Result<usize> {
        let sources = rule::load_rule_file(path)?;
        let mut added = 0;
        for source in sources {
            let name = self.render_rule(&source)?;
            let mut parsed = match Rule::parse(name, &source) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("skipping rule `{source}`: {e}");
                    continue;
                }
            };
            {
                // a rule whose sensors are not all active stays
                // registered but dormant
                let registry = self.registry()?;
                let _ = parsed.activate(registry.active());
            }
            if self.rule_engine()?.add(parsed) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Rewrite the rule file from the registered rules.
    pub fn save_rules(&self, path: &Path) -> Result<()> {
        let sources = self.rule_engine()?.sources();
        rule::save_rule_file(path, &sources)?;
        Ok(())
    }

    // ---- events -------------------------------------------------------

    /// Be called with each new value of one sensor.
    pub fn subscribe_value(&self, pid: Pid, handler: ValueHandler) {
        self.dispatcher.subscribe_value(pid, handler);
    }

    /// Be called with the rule name on each rising edge.
    pub fn subscribe_rule(&self, handler: RuleHandler) {
        self.dispatcher.subscribe_rule(handler);
    }

    /// Be called with every broadcast error message.
    pub fn subscribe_error(&self, handler: ErrorHandler) {
        self.dispatcher.subscribe_error(handler);
    }

    // ---- shared plumbing ---------------------------------------------

    fn registry(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| KernelError::Busy)
    }

    fn rule_engine(&self) -> Result<MutexGuard<'_, RuleEngine>> {
        self.rules.lock().map_err(|_| KernelError::Busy)
    }

    /// The transport, provided nothing else is using it.
    fn exclusive_transport(&self) -> Result<Arc<Mutex<Transport>>> {
        match self.state.get() {
            SessionState::Ready => {}
            SessionState::Polling => return Err(KernelError::Busy),
            _ => return Err(KernelError::NotConnected),
        }
        self.transport.clone().ok_or(KernelError::NotConnected)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::new()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
    }
}
