#![allow(dead_code)]

//! Test doubles shared by the integration suites.

use chutney::{
    AlertMessage, AlertSink, BoxFuture, Clock, Delayer, Diagnostic, DiagnosticReporter,
    MemoryPressure, MemoryPressureSource, Notification, NotificationSource, Subscription,
};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A clock that only moves when told to.
#[derive(Clone, Debug)]
pub struct TestClock {
    now: Arc<Mutex<Instant>>,
}

impl TestClock {
    pub fn new() -> Self {
        TestClock {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn current(&self) -> Instant {
        *self.now.lock()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// A delayer that records every requested pause and resolves immediately.
#[derive(Clone, Debug, Default)]
pub struct RecordingDelayer {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingDelayer {
    pub fn new() -> Self {
        RecordingDelayer::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

impl Delayer for RecordingDelayer {
    fn delay(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.delays.lock().push(duration);
        async {}.boxed()
    }
}

type PressureHandler = Box<dyn Fn(MemoryPressure) + Send + Sync>;

/// A memory-pressure source driven by the test.
#[derive(Clone, Default)]
pub struct TestPressureSource {
    handlers: Arc<Mutex<Vec<PressureHandler>>>,
}

impl TestPressureSource {
    pub fn new() -> Self {
        TestPressureSource::default()
    }

    pub fn emit(&self, level: MemoryPressure) {
        let handlers = self.handlers.lock();
        for handler in handlers.iter() {
            handler(level);
        }
    }
}

impl MemoryPressureSource for TestPressureSource {
    fn subscribe(&self, on_pressure: PressureHandler) -> Subscription {
        self.handlers.lock().push(on_pressure);
        Subscription::empty()
    }
}

type NotificationHandler = Box<dyn Fn(&Notification) + Send + Sync>;

/// A notification bus driven by the test.
#[derive(Clone, Default)]
pub struct TestNotificationSource {
    handlers: Arc<Mutex<Vec<(String, NotificationHandler)>>>,
}

impl TestNotificationSource {
    pub fn new() -> Self {
        TestNotificationSource::default()
    }

    pub fn post(&self, name: &str) {
        let notification = Notification {
            name: Arc::from(name),
        };
        let handlers = self.handlers.lock();
        for (registered, handler) in handlers.iter() {
            if registered == name {
                handler(&notification);
            }
        }
    }
}

impl NotificationSource for TestNotificationSource {
    fn subscribe(&self, name: &str, on_post: NotificationHandler) -> Subscription {
        self.handlers.lock().push((name.to_owned(), on_post));
        Subscription::empty()
    }
}

/// An alert sink that collects everything posted to it.
#[derive(Clone, Default)]
pub struct CollectingAlertSink {
    messages: Arc<Mutex<Vec<AlertMessage>>>,
}

impl CollectingAlertSink {
    pub fn new() -> Self {
        CollectingAlertSink::default()
    }

    pub fn posted(&self) -> Vec<AlertMessage> {
        self.messages.lock().clone()
    }
}

impl AlertSink for CollectingAlertSink {
    fn post(&self, message: AlertMessage) {
        self.messages.lock().push(message);
    }
}

/// A diagnostic reporter that collects rendered diagnostics.
#[derive(Clone, Default)]
pub struct CollectingReporter {
    diagnostics: Arc<Mutex<Vec<String>>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        CollectingReporter::default()
    }

    pub fn reported(&self) -> Vec<String> {
        self.diagnostics.lock().clone()
    }
}

impl std::fmt::Debug for CollectingReporter {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "CollectingReporter")
    }
}

impl DiagnosticReporter for CollectingReporter {
    fn report(&self, diagnostic: &Diagnostic) {
        self.diagnostics.lock().push(diagnostic.to_string());
    }
}

/// Polls `predicate` until it holds or the deadline passes.
pub async fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
