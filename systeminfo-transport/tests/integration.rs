//! End-to-end runs of the transport against the real host provider.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

use systeminfo_transport::encoder::RECORD_KEY;
use systeminfo_transport::identity::LOOPBACK_ADDRESS;
use systeminfo_transport::{
    ChannelSink, IdentityResolver, NetworkProbe, RecordFormat, RunningState, SharedProperties,
    SystemInfoTransport, UPDATE_INTERVAL_PROPERTY,
};

struct Offline;

impl NetworkProbe for Offline {
    fn local_address(&self) -> io::Result<IpAddr> {
        Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "offline"))
    }
}

fn transport(interval_secs: f64) -> (SystemInfoTransport, Receiver<Vec<u8>>) {
    let (sink, rx) = ChannelSink::new();
    let properties = SharedProperties::new();
    properties.set(UPDATE_INTERVAL_PROPERTY, interval_secs);

    let resolver = IdentityResolver::new()
        .with_env(|name| (name == "HOSTNAME").then(|| "itest-host".to_string()))
        .with_probe(Offline);

    let transport = SystemInfoTransport::builder(Arc::new(sink))
        .properties(Arc::new(properties))
        .resolver(resolver)
        .build();
    (transport, rx)
}

fn body(bytes: &[u8]) -> serde_json::Map<String, serde_json::Value> {
    assert_eq!(bytes.last(), Some(&b'\n'));
    let value: serde_json::Value = serde_json::from_slice(bytes).unwrap();
    value[RECORD_KEY].as_object().unwrap().clone()
}

#[test]
fn test_emits_records_until_stopped() {
    let (transport, rx) = transport(0.2);

    transport.start();
    let state = transport.wait_for_state(Duration::from_secs(5), |s| s == RunningState::Started);
    assert_eq!(state, RunningState::Started);
    thread::sleep(Duration::from_millis(500));

    transport.stop();
    transport.join();
    assert_eq!(transport.running_state(), RunningState::Stopped);

    let records: Vec<Vec<u8>> = rx.try_iter().collect();
    assert!(
        (2..=3).contains(&records.len()),
        "expected 2 to 3 records, got {}",
        records.len()
    );

    for record in &records {
        let line = std::str::from_utf8(record).unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.starts_with("{\"OperatingSystemInformation\": {\"hostname\": "));
        let body = body(record);
        assert_eq!(body["hostname"], "itest-host");
        assert_eq!(body["ip"], LOOPBACK_ADDRESS);
        assert!(body.contains_key("threads"));
        assert!(body["DatetimeStamp"].is_i64());
        assert!(body.contains_key("AvailableProcessors"));
    }

    thread::sleep(Duration::from_millis(300));
    assert!(rx.try_recv().is_err(), "record emitted after stop");
}

#[test]
fn test_timestamps_follow_interval() {
    let (transport, rx) = transport(0.1);

    transport.start();
    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    transport.stop();
    transport.join();

    let a = body(&first)["DatetimeStamp"].as_i64().unwrap();
    let b = body(&second)["DatetimeStamp"].as_i64().unwrap();
    assert!(b - a >= 100, "ticks {} ms apart", b - a);
}

#[test]
fn test_dropped_receiver_moves_to_error() {
    let (transport, rx) = transport(0.05);
    drop(rx);

    transport.start();
    let state = transport.wait_for_state(Duration::from_secs(5), |s| s == RunningState::Error);
    assert_eq!(state, RunningState::Error);
    assert!(!transport.is_running());
    transport.join();
}

#[test]
fn test_sample_host_config_loads() {
    use systeminfo_transport::{HostConfig, SampleConfig, SinkKind};

    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../configs/systeminfo.json5");
    let config = HostConfig::load_from_file(path).unwrap();
    assert_eq!(config.sink.kind, SinkKind::Stdout);
    assert_eq!(config.transport.encoding, RecordFormat::Text);

    let mut sample = SampleConfig::default();
    sample.apply_properties(&config.transport.properties);
    assert_eq!(sample.update_interval(), Duration::from_secs(1));
}
