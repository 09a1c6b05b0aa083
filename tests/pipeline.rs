//! End-to-end runs of the acquisition pipeline against the mock counter

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pulse_link::acquisition::{IngestionQueue, MockDevice, MockLink, Transport};
use pulse_link::config::{AppConfig, MockConfig, ReconnectConfig};
use pulse_link::connection::{
    ConnectionManager, ConnectionState, Connector, StatusKind, Target,
};
use pulse_link::error::ConnectionError;
use pulse_link::pipeline::Pipeline;
use pulse_link::render::Renderer;
use pulse_link::storage::export::{
    export_auto, FileNamer, MeasurementLabel, CSV_HEADER, CSV_HEADER_SEPARATOR,
};

#[derive(Default)]
struct CountingRenderer {
    redraws: usize,
    widest: usize,
}

impl Renderer for CountingRenderer {
    fn redraw(&mut self, xs: &[f64], _ys: &[f64]) {
        self.redraws += 1;
        self.widest = self.widest.max(xs.len());
    }
}

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.mock = MockConfig {
        min_interval_us: 200,
        max_interval_us: 800,
        seed: Some(21),
    };
    config.storage.max_history = 50;
    config.storage.render_capacity = 50;
    config.storage.drain_interval_ms = 10;
    config.reconnect = ReconnectConfig {
        max_attempts: 3,
        delay_ms: 20,
    };
    config
}

fn setup(config: &AppConfig) -> (ConnectionManager, Pipeline<CountingRenderer>) {
    let queue = IngestionQueue::new(
        config.storage.queue_capacity,
        config.storage.high_water_mark,
    );
    let manager = ConnectionManager::new(config, queue.clone());
    let pipeline = Pipeline::new(queue, &config.storage, CountingRenderer::default());
    (manager, pipeline)
}

fn tick_until(
    manager: &mut ConnectionManager,
    pipeline: &mut Pipeline<CountingRenderer>,
    done: impl Fn(&Pipeline<CountingRenderer>) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(pipeline) {
        assert!(Instant::now() < deadline, "pipeline did not reach condition");
        manager.poll();
        pipeline.tick();
        thread::sleep(Duration::from_millis(5));
    }
}

fn assert_strictly_increasing(indices: &[u64]) {
    for pair in indices.windows(2) {
        assert!(pair[0] < pair[1], "{} then {}", pair[0], pair[1]);
    }
}

#[test]
fn test_mock_session_end_to_end() {
    let config = fast_config();
    let (mut manager, mut pipeline) = setup(&config);

    manager.connect("mock").unwrap();
    assert_eq!(manager.state(), ConnectionState::ConnectedIdle);
    assert!(manager.device_info().is_some());

    manager.start_acquisition().unwrap();
    tick_until(&mut manager, &mut pipeline, |p| p.store().len() >= 200);
    manager.stop_acquisition();
    pipeline.tick();

    let store = pipeline.store();
    let indices: Vec<u64> = store.samples().iter().map(|s| s.index).collect();
    assert_eq!(indices[0], 0);
    assert!(indices.windows(2).all(|w| w[1] == w[0] + 1));
    assert!(store
        .samples()
        .iter()
        .all(|s| (200.0..=800.0).contains(&s.value)));
    assert_eq!(store.window().len(), 50);
    assert_eq!(store.counters().rejected, 0);
    assert_eq!(pipeline.batcher().renderer().widest, 50);

    let dir = tempfile::tempdir().unwrap();
    let label = MeasurementLabel {
        name: "background".to_string(),
        group: "c".to_string(),
        subterm: String::new(),
    };
    let summary = export_auto(
        store,
        dir.path(),
        &mut FileNamer::new(),
        &label,
        "",
        manager.target().map(|t| t.to_string()),
        manager.device_info().cloned(),
    )
    .unwrap();
    assert_eq!(summary.rows, store.len());
    assert!(summary.csv_path.starts_with(dir.path().join("C")));

    let text = std::fs::read_to_string(&summary.csv_path).unwrap();
    assert_eq!(text.lines().next().unwrap(), CSV_HEADER.join(CSV_HEADER_SEPARATOR));
    assert_eq!(text.lines().count(), store.len() + 1);

    let meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&summary.metadata_path).unwrap()).unwrap();
    assert_eq!(meta["sample_count"], store.len());
    assert_eq!(meta["target"], "mock");
}

#[test]
fn test_run_returns_when_stopped() {
    let config = fast_config();
    let (mut manager, mut pipeline) = setup(&config);
    manager.connect("mock").unwrap();
    manager.start_acquisition().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let stopper = {
        let stop = stop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            stop.store(true, Ordering::SeqCst);
        })
    };
    pipeline.run(&mut manager, &stop);
    stopper.join().unwrap();

    assert!(!pipeline.store().is_empty());
    assert!(pipeline.batcher().redraws() > 0);
    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[test]
fn test_reset_session_restarts_numbering() {
    let config = fast_config();
    let (mut manager, mut pipeline) = setup(&config);
    manager.connect("mock").unwrap();
    manager.start_acquisition().unwrap();
    tick_until(&mut manager, &mut pipeline, |p| p.store().len() >= 20);

    manager.stop_acquisition();
    let old_session = pipeline.store().session_id();
    pipeline.reset_session(&manager);
    assert!(pipeline.store().is_empty());
    assert_ne!(pipeline.store().session_id(), old_session);

    manager.start_acquisition().unwrap();
    tick_until(&mut manager, &mut pipeline, |p| p.store().len() >= 5);
    assert_eq!(pipeline.store().samples()[0].index, 0);
}

/// Opens mock devices and keeps their link handles
struct SeverableConnector {
    mock: MockConfig,
    links: Arc<Mutex<Vec<MockLink>>>,
}

impl Connector for SeverableConnector {
    fn open(&mut self, _target: &Target) -> Result<Box<dyn Transport>, ConnectionError> {
        let device = MockDevice::new(&self.mock, Duration::from_millis(2));
        self.links.lock().push(device.link());
        Ok(Box::new(device))
    }
}

#[test]
fn test_reconnect_keeps_store_ordered() {
    let config = fast_config();
    let queue = IngestionQueue::unbounded(config.storage.high_water_mark);
    let links = Arc::new(Mutex::new(Vec::new()));
    let connector = SeverableConnector {
        mock: config.mock.clone(),
        links: links.clone(),
    };
    let mut manager = ConnectionManager::with_connector(&config, queue.clone(), Box::new(connector));
    let mut pipeline = Pipeline::new(queue, &config.storage, CountingRenderer::default());
    let status = manager.status_hub().subscribe();

    manager.connect("mock").unwrap();
    manager.start_acquisition().unwrap();
    tick_until(&mut manager, &mut pipeline, |p| p.store().len() >= 30);

    links.lock()[0].sever();
    let before = pipeline.store().len();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut reconnected = false;
    while !reconnected {
        assert!(Instant::now() < deadline, "no reconnect");
        manager.poll();
        pipeline.tick();
        reconnected = status
            .try_iter()
            .any(|event| event.kind == StatusKind::Reconnected);
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(manager.state(), ConnectionState::Acquiring);

    tick_until(&mut manager, &mut pipeline, |p| p.store().len() >= before + 30);
    let indices: Vec<u64> = pipeline.store().samples().iter().map(|s| s.index).collect();
    assert_strictly_increasing(&indices);
    assert_eq!(pipeline.store().counters().rejected, 0);
    assert_eq!(links.lock().len(), 2);
}
