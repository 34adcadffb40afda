//! Transport lifecycle: start/stop, running state and the sampling loop.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::config::{PropertySource, RecordFormat, SampleConfig, SharedProperties};
use crate::encoder::{RecordEncoder, encoder_for};
use crate::error::{Result, TransportError};
use crate::identity::IdentityResolver;
use crate::provider::SysinfoProvider;
use crate::sampler::{MetricsProvider, sample};
use crate::sink::{ByteSink, Emission, SinkAdapter};
use crate::state::{RunningState, StateCell};

/// Creates a fresh metrics provider for each run.
pub type ProviderFactory = Arc<dyn Fn() -> Box<dyn MetricsProvider> + Send + Sync>;

/// Builder for [`SystemInfoTransport`].
pub struct TransportBuilder {
    sink: Arc<dyn ByteSink>,
    properties: Arc<dyn PropertySource>,
    provider_factory: ProviderFactory,
    resolver: IdentityResolver,
    encoder: Arc<dyn RecordEncoder>,
}

impl TransportBuilder {
    /// Property source read at every start (default: empty [`SharedProperties`]).
    pub fn properties(mut self, properties: Arc<dyn PropertySource>) -> Self {
        self.properties = properties;
        self
    }

    /// Metrics provider used by each run (default: [`SysinfoProvider`]).
    pub fn provider_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn MetricsProvider> + Send + Sync + 'static,
    {
        self.provider_factory = Arc::new(factory);
        self
    }

    /// Host identity resolver (default: [`IdentityResolver::new`]).
    pub fn resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Record encoder (default: the text format).
    pub fn encoder(mut self, encoder: Arc<dyn RecordEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Shorthand for [`encoder`](Self::encoder) with a built-in format.
    pub fn format(self, format: RecordFormat) -> Self {
        self.encoder(encoder_for(format))
    }

    pub fn build(self) -> SystemInfoTransport {
        SystemInfoTransport {
            shared: Arc::new(Shared {
                state: StateCell::new(),
                config: Mutex::new(SampleConfig::default()),
                properties: self.properties,
                provider_factory: self.provider_factory,
                resolver: self.resolver,
                encoder: self.encoder,
                sink: SinkAdapter::new(self.sink),
            }),
            worker: Mutex::new(None),
        }
    }
}

/// Inbound transport emitting one host metrics record per tick.
///
/// `start`, `stop`, `is_running` and `running_state` may be called
/// concurrently from any thread. Failures inside a run never surface as
/// errors to the caller; the state moves to [`RunningState::Error`] instead.
pub struct SystemInfoTransport {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SystemInfoTransport {
    /// Start building a transport that delivers records to `sink`.
    pub fn builder(sink: Arc<dyn ByteSink>) -> TransportBuilder {
        TransportBuilder {
            sink,
            properties: Arc::new(SharedProperties::new()),
            provider_factory: Arc::new(|| -> Box<dyn MetricsProvider> {
                Box::new(SysinfoProvider::new())
            }),
            resolver: IdentityResolver::new(),
            encoder: encoder_for(RecordFormat::default()),
        }
    }

    /// Launch the sampling loop on a background thread.
    ///
    /// Does nothing while the state is `Starting`, `Started` or `Stopping`.
    /// A loop left over from a previous run is joined by the new thread
    /// before setup, so ticks of two runs never overlap.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(generation) = self.shared.state.begin_start() else {
            debug!(state = %self.running_state(), "Start ignored, transport already active");
            return;
        };

        info!(generation, "Starting system information transport");

        let previous = worker.take();
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("systeminfo-sampler".to_string())
            .spawn(move || {
                if let Some(previous) = previous {
                    debug!(generation, "Waiting for previous sampling loop to exit");
                    if previous.join().is_err() {
                        warn!("Previous sampling thread terminated abnormally");
                    }
                }
                shared.run(generation)
            });

        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(e) => {
                let e = TransportError::Spawn(e);
                error!(error = %e, "Unexpected error starting transport");
                drop(worker);
                self.stop();
            }
        }
    }

    /// Move to `Stopped`. The loop exits at its next tick boundary and an
    /// end-of-tick sleep is cut short.
    pub fn stop(&self) {
        if let Some(previous) = self.shared.state.stop() {
            info!(%previous, "Stopped system information transport");
        }
    }

    /// True while records are being produced.
    pub fn is_running(&self) -> bool {
        self.shared.state.get() == RunningState::Started
    }

    pub fn running_state(&self) -> RunningState {
        self.shared.state.get()
    }

    /// Block until `predicate` accepts the state or `timeout` elapses.
    /// Returns the last observed state.
    pub fn wait_for_state<F>(&self, timeout: Duration, predicate: F) -> RunningState
    where
        F: FnMut(RunningState) -> bool,
    {
        self.shared.state.wait_until(timeout, predicate)
    }

    /// Wait for the most recently started sampling thread to exit.
    ///
    /// Call after [`stop`](Self::stop) (or once the state is `Error`);
    /// otherwise this blocks for as long as the run lasts.
    pub fn join(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Sampling thread terminated abnormally");
            }
        }
    }

    /// Tick interval applied at the last start.
    pub fn update_interval(&self) -> Duration {
        self.shared
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update_interval()
    }

    /// Records are host-local; instances must not be spread across a cluster.
    pub fn is_clusterable(&self) -> bool {
        false
    }
}

impl Drop for SystemInfoTransport {
    fn drop(&mut self) {
        self.shared.state.stop();
    }
}

struct Shared {
    state: StateCell,
    config: Mutex<SampleConfig>,
    properties: Arc<dyn PropertySource>,
    provider_factory: ProviderFactory,
    resolver: IdentityResolver,
    encoder: Arc<dyn RecordEncoder>,
    sink: SinkAdapter,
}

impl Shared {
    /// Thread body. Everything inside is guarded so any fault ends in `Error`.
    fn run(&self, generation: u64) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_loop(generation)));

        let fault = match outcome {
            Ok(Ok(())) => {
                debug!(generation, "Sampling loop finished");
                return;
            }
            Ok(Err(e)) => e,
            Err(payload) => TransportError::from_panic(payload),
        };

        error!(generation, error = %fault, "Unexpected error in sampling loop");
        self.state.fail(generation);
    }

    fn run_loop(&self, generation: u64) -> Result<()> {
        let interval = {
            let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
            if config.apply_properties(self.properties.as_ref()) {
                info!(
                    interval_secs = config.update_interval_secs(),
                    "Applied update interval"
                );
            }
            config.update_interval()
        };

        let mut provider = (self.provider_factory)();
        let identity = self.resolver.resolve();

        if !self.state.mark_started(generation) {
            debug!(generation, "Run stopped during setup");
            return Ok(());
        }

        info!(
            hostname = %identity.hostname,
            ip = %identity.address,
            interval_ms = interval.as_millis() as u64,
            "System information transport started"
        );

        while self.state.is_current(generation) {
            let snapshot = sample(provider.as_mut());
            let record = self.encoder.encode(&snapshot, &identity)?;
            trace!(
                record = %String::from_utf8_lossy(record.as_bytes()).trim_end(),
                "Encoded record"
            );

            match self.sink.emit(&record) {
                Emission::Delivered | Emission::Rejected => {}
                Emission::Overflow(_) => {
                    self.state.fail(generation);
                    return Ok(());
                }
                Emission::Failed(_) => {
                    if let Some(previous) = self.state.stop_run(generation) {
                        info!(%previous, "Stopped system information transport");
                    }
                    self.state.fail(generation);
                    return Ok(());
                }
            }

            if !self.state.sleep(generation, interval) {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UPDATE_INTERVAL_PROPERTY;
    use crate::error::{SampleError, SinkError};
    use crate::identity::NetworkProbe;
    use crate::sampler::MetricValue;
    use crate::sink::ChannelSink;
    use std::io;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::Receiver;
    use std::time::Instant;

    struct NoNetwork;

    impl NetworkProbe for NoNetwork {
        fn local_address(&self) -> io::Result<IpAddr> {
            Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "offline"))
        }
    }

    struct FakeProvider {
        fail_field: Option<&'static str>,
        panic_on_read: bool,
    }

    impl MetricsProvider for FakeProvider {
        fn available_fields(&mut self) -> Vec<String> {
            vec!["SystemCpuLoad".into(), "FreeSwapSpaceSize".into()]
        }

        fn read_field(&mut self, name: &str) -> std::result::Result<MetricValue, SampleError> {
            if self.panic_on_read {
                panic!("provider exploded");
            }
            if self.fail_field == Some(name) {
                return Err(SampleError::Os("denied".into()));
            }
            Ok(match name {
                "SystemCpuLoad" => MetricValue::Float(0.5),
                _ => MetricValue::Integer(1024),
            })
        }

        fn thread_count(&mut self) -> std::result::Result<u64, SampleError> {
            Ok(3)
        }
    }

    fn fake(fail_field: Option<&'static str>, panic_on_read: bool) -> Box<dyn MetricsProvider> {
        Box::new(FakeProvider {
            fail_field,
            panic_on_read,
        })
    }

    fn props(interval: f64) -> Arc<SharedProperties> {
        let props = SharedProperties::new();
        props.set(UPDATE_INTERVAL_PROPERTY, interval);
        Arc::new(props)
    }

    fn builder(sink: Arc<dyn ByteSink>) -> TransportBuilder {
        SystemInfoTransport::builder(sink)
            .properties(props(0.05))
            .resolver(
                IdentityResolver::new()
                    .with_env(|name| (name == "HOSTNAME").then(|| "test-host".to_string()))
                    .with_probe(NoNetwork),
            )
            .provider_factory(|| fake(None, false))
    }

    fn channel_transport() -> (SystemInfoTransport, Receiver<Vec<u8>>) {
        let (sink, rx) = ChannelSink::new();
        (builder(Arc::new(sink)).build(), rx)
    }

    fn parse(bytes: &[u8]) -> serde_json::Value {
        let value: serde_json::Value = serde_json::from_slice(bytes).unwrap();
        value["OperatingSystemInformation"].clone()
    }

    fn wait_started(transport: &SystemInfoTransport) {
        let state = transport.wait_for_state(Duration::from_secs(5), |s| s == RunningState::Started);
        assert_eq!(state, RunningState::Started);
    }

    #[test]
    fn test_start_emits_and_stop_halts() {
        let (transport, rx) = channel_transport();
        assert_eq!(transport.running_state(), RunningState::Stopped);

        transport.start();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(transport.is_running());

        let body = parse(&first);
        assert_eq!(body["hostname"], "test-host");
        assert_eq!(body["ip"], "127.0.0.1");
        assert_eq!(body["SystemCpuLoad"], 0.5);
        assert_eq!(body["threads"], 3);
        assert!(body["DatetimeStamp"].is_i64());

        transport.stop();
        transport.join();
        assert_eq!(transport.running_state(), RunningState::Stopped);

        while rx.try_recv().is_ok() {}
        std::thread::sleep(Duration::from_millis(150));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_start_while_active_is_noop() {
        let (transport, rx) = channel_transport();
        transport.start();
        wait_started(&transport);

        transport.start();
        transport.start();
        assert_eq!(transport.running_state(), RunningState::Started);

        // Only one loop: records arrive roughly one interval apart.
        let a = parse(&rx.recv_timeout(Duration::from_secs(5)).unwrap());
        let b = parse(&rx.recv_timeout(Duration::from_secs(5)).unwrap());
        let gap = b["DatetimeStamp"].as_i64().unwrap() - a["DatetimeStamp"].as_i64().unwrap();
        assert!(gap >= 50, "gap {}ms", gap);

        transport.stop();
        transport.join();
    }

    #[test]
    fn test_stop_interrupts_sleep() {
        let (sink, rx) = ChannelSink::new();
        let transport = builder(Arc::new(sink)).properties(props(30.0)).build();

        transport.start();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let begun = Instant::now();
        transport.stop();
        transport.join();
        assert!(begun.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_field_failure_yields_null_only_for_that_field() {
        let (sink, rx) = ChannelSink::new();
        let transport = builder(Arc::new(sink))
            .provider_factory(|| fake(Some("FreeSwapSpaceSize"), false))
            .build();

        transport.start();
        let body = parse(&rx.recv_timeout(Duration::from_secs(5)).unwrap());
        transport.stop();

        assert!(body["FreeSwapSpaceSize"].is_null());
        assert_eq!(body["SystemCpuLoad"], 0.5);
        assert_eq!(body["threads"], 3);
        assert!(transport.running_state() != RunningState::Error);
    }

    #[test]
    fn test_fatal_sink_error_enters_error_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = {
            let calls = calls.clone();
            move |_: &[u8], _: &str| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SinkError::other("consumer crashed"))
            }
        };
        let transport = builder(Arc::new(sink)).build();

        transport.start();
        let state = transport.wait_for_state(Duration::from_secs(5), |s| s == RunningState::Error);
        assert_eq!(state, RunningState::Error);
        transport.join();

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!transport.is_running());
    }

    #[test]
    fn test_overflow_enters_error() {
        let sink = |_: &[u8], _: &str| {
            Err(SinkError::Overflow {
                capacity: 0,
                needed: 1,
            })
        };
        let transport = builder(Arc::new(sink)).build();

        transport.start();
        let state = transport.wait_for_state(Duration::from_secs(5), |s| s == RunningState::Error);
        assert_eq!(state, RunningState::Error);
        transport.join();
    }

    #[test]
    fn test_rejected_records_do_not_stop_the_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = {
            let calls = calls.clone();
            move |_: &[u8], _: &str| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SinkError::rejected("malformed"))
            }
        };
        let transport = builder(Arc::new(sink)).build();

        transport.start();
        let deadline = Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert!(transport.is_running());

        transport.stop();
        transport.join();
    }

    #[test]
    fn test_panicking_provider_enters_error() {
        let (sink, rx) = ChannelSink::new();
        let transport = builder(Arc::new(sink))
            .provider_factory(|| fake(None, true))
            .build();

        transport.start();
        let state = transport.wait_for_state(Duration::from_secs(5), |s| s == RunningState::Error);
        assert_eq!(state, RunningState::Error);
        transport.join();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_restart_from_error() {
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (sink, rx) = ChannelSink::new();
        let sink = {
            let fail = fail.clone();
            move |buf: &[u8], channel: &str| {
                if fail.load(Ordering::SeqCst) {
                    Err(SinkError::Closed)
                } else {
                    sink.receive(buf, channel)
                }
            }
        };
        let transport = builder(Arc::new(sink)).build();

        transport.start();
        transport.wait_for_state(Duration::from_secs(5), |s| s == RunningState::Error);
        transport.join();

        fail.store(false, Ordering::SeqCst);
        transport.start();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(transport.is_running());

        transport.stop();
        transport.join();
    }

    #[test]
    fn test_properties_reread_only_at_start() {
        let (sink, _rx) = ChannelSink::new();
        let properties = props(0.05);
        let transport = builder(Arc::new(sink))
            .properties(properties.clone())
            .build();

        transport.start();
        wait_started(&transport);
        assert_eq!(transport.update_interval(), Duration::from_millis(50));

        properties.set(UPDATE_INTERVAL_PROPERTY, 0.2);
        assert_eq!(transport.update_interval(), Duration::from_millis(50));

        transport.stop();
        transport.join();

        properties.set(UPDATE_INTERVAL_PROPERTY, "-3");
        transport.start();
        wait_started(&transport);
        // Invalid value keeps the previous setting
        assert_eq!(transport.update_interval(), Duration::from_millis(50));
        transport.stop();
        transport.join();

        properties.set(UPDATE_INTERVAL_PROPERTY, 0.2);
        transport.start();
        wait_started(&transport);
        assert_eq!(transport.update_interval(), Duration::from_millis(200));
        transport.stop();
        transport.join();
    }

    #[test]
    fn test_concurrent_start_stop() {
        let (transport, _rx) = channel_transport();
        let transport = Arc::new(transport);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let transport = transport.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if i % 2 == 0 {
                            transport.start();
                        } else {
                            transport.stop();
                        }
                        let _ = transport.is_running();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        transport.stop();
        let state = transport.running_state();
        assert_eq!(state, RunningState::Stopped);
    }

    #[test]
    fn test_quick_restart_never_overlaps_ticks() {
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink = {
            let (inside, peak, delivered) = (inside.clone(), peak.clone(), delivered.clone());
            move |_: &[u8], _: &str| {
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
                inside.fetch_sub(1, Ordering::SeqCst);
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        };
        let transport = builder(Arc::new(sink)).build();

        transport.start();
        wait_started(&transport);
        std::thread::sleep(Duration::from_millis(50));

        // First tick is still inside the sink.
        transport.stop();
        transport.start();
        assert_eq!(transport.running_state(), RunningState::Starting);

        wait_started(&transport);
        let deadline = Instant::now() + Duration::from_secs(5);
        while delivered.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        transport.stop();
        transport.join();

        assert!(delivered.load(Ordering::SeqCst) >= 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(inside.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_join_waits_for_every_started_loop() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink = {
            let delivered = delivered.clone();
            move |_: &[u8], _: &str| {
                std::thread::sleep(Duration::from_millis(200));
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        };
        let transport = builder(Arc::new(sink)).build();

        transport.start();
        wait_started(&transport);
        transport.stop();
        transport.start();
        transport.stop();
        transport.join();

        // Both threads have exited: nothing is left to deliver.
        let settled = delivered.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(delivered.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn test_not_clusterable() {
        let (transport, _rx) = channel_transport();
        assert!(!transport.is_clusterable());
    }
}
