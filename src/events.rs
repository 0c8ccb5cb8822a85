//! Typed publish/subscribe fan-out for sensor, rule, and error events.
//!
//! Handlers run synchronously on whichever thread produced the event
//! (the poller, for everything that happens mid-session), so events for
//! a given sensor arrive in production order and a rule alert is always
//! observed after the sensor change that caused it. Handlers must not
//! block.

use std::sync::Mutex;

use crate::sensor::Pid;

/// Called with each new in-range value of a subscribed sensor.
pub type ValueHandler = Box<dyn Fn(Pid, f64) + Send>;

/// Called with the rule name on each rising edge.
pub type RuleHandler = Box<dyn Fn(&str) + Send>;

/// Called with a human-readable message for every broadcast error.
pub type ErrorHandler = Box<dyn Fn(&str) + Send>;

/// The kernel's subscription table.
#[derive(Default)]
pub struct Dispatcher {
    value: Mutex<Vec<(Pid, ValueHandler)>>,
    rule: Mutex<Vec<RuleHandler>>,
    error: Mutex<Vec<ErrorHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher::default()
    }

    pub fn subscribe_value(&self, pid: Pid, handler: ValueHandler) {
        if let Ok(mut handlers) = self.value.lock() {
            handlers.push((pid, handler));
        }
    }

    pub fn subscribe_rule(&self, handler: RuleHandler) {
        if let Ok(mut handlers) = self.rule.lock() {
            handlers.push(handler);
        }
    }

    pub fn subscribe_error(&self, handler: ErrorHandler) {
        if let Ok(mut handlers) = self.error.lock() {
            handlers.push(handler);
        }
    }

    pub(crate) fn value_changed(&self, pid: Pid, value: f64) {
        let Ok(handlers) = self.value.lock() else {
            return;
        };
        for (subscribed, handler) in handlers.iter() {
            if *subscribed == pid {
                handler(pid, value);
            }
        }
    }

    pub(crate) fn rule_satisfied(&self, name: &str) {
        let Ok(handlers) = self.rule.lock() else {
            return;
        };
        for handler in handlers.iter() {
            handler(name);
        }
    }

    pub(crate) fn error(&self, message: &str) {
        let Ok(handlers) = self.error.lock() else {
            return;
        };
        for handler in handlers.iter() {
            handler(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn value_events_filter_by_pid() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        dispatcher.subscribe_value(
            Pid::new(0x01, 0x0C),
            Box::new(move |pid, value| sink.lock().unwrap().push((pid, value))),
        );

        dispatcher.value_changed(Pid::new(0x01, 0x0C), 1726.0);
        dispatcher.value_changed(Pid::new(0x01, 0x0D), 80.0);

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [(Pid::new(0x01, 0x0C), 1726.0)]
        );
    }

    #[test]
    fn rule_and_error_events_fan_out() {
        let dispatcher = Dispatcher::new();
        let fired = Arc::new(Mutex::new(Vec::<String>::new()));

        for _ in 0..2 {
            let sink = Arc::clone(&fired);
            dispatcher.subscribe_rule(Box::new(move |name| {
                sink.lock().unwrap().push(name.to_owned());
            }));
        }
        dispatcher.rule_satisfied("overspeed");
        assert_eq!(fired.lock().unwrap().len(), 2);
    }
}
