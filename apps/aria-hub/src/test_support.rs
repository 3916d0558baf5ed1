use std::path::Path;
use std::sync::Arc;

use aria_events::Bus;
use aria_kernel::Kernel;
use once_cell::sync::OnceCell;

use crate::config::HubConfig;
use crate::hub::Hub;

static TRACING: OnceCell<()> = OnceCell::new();

pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Hub over a fresh store in `dir` with default configuration.
pub fn hub_in(dir: &Path) -> Hub {
    hub_with(dir, HubConfig::default())
}

pub fn hub_with(dir: &Path, config: HubConfig) -> Hub {
    init_tracing();
    let kernel = Kernel::open(dir).expect("open test store");
    Hub::new(Arc::new(config), kernel, Bus::new(128))
}

/// Recorder that tallies counters by `name[label=value]...`. Install with
/// `metrics::with_local_recorder` around a current-thread runtime.
#[derive(Default)]
pub struct CountingRecorder {
    counters: parking_lot::Mutex<std::collections::BTreeMap<String, Arc<Tally>>>,
}

pub struct Tally(std::sync::atomic::AtomicU64);

impl metrics::CounterFn for Tally {
    fn increment(&self, value: u64) {
        self.0.fetch_add(value, std::sync::atomic::Ordering::SeqCst);
    }

    fn absolute(&self, value: u64) {
        self.0.fetch_max(value, std::sync::atomic::Ordering::SeqCst);
    }
}

impl CountingRecorder {
    pub fn count(&self, key: &str) -> u64 {
        self.counters
            .lock()
            .get(key)
            .map_or(0, |t| t.0.load(std::sync::atomic::Ordering::SeqCst))
    }
}

impl metrics::Recorder for CountingRecorder {
    fn describe_counter(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
    fn describe_gauge(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
    fn describe_histogram(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

    fn register_counter(&self, key: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Counter {
        let labels: String = key
            .labels()
            .map(|l| format!("[{}={}]", l.key(), l.value()))
            .collect();
        let tally = self
            .counters
            .lock()
            .entry(format!("{}{labels}", key.name()))
            .or_insert_with(|| Arc::new(Tally(Default::default())))
            .clone();
        metrics::Counter::from_arc(tally)
    }

    fn register_gauge(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Gauge {
        metrics::Gauge::noop()
    }

    fn register_histogram(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Histogram {
        metrics::Histogram::noop()
    }
}
