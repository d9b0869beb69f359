use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use featurizer::{
    log_logging_ready, Block, BlockMeta, BlockStore, Column, DefinitionRegistry, Featurizer,
    FeaturizerConfig, InMemoryBlockStore, InMemoryDataCatalog, InMemoryFeatureCatalog,
    InlineExecutor, LogFormat, LoggingConfig, L2_BOOK_SNAPSHOT,
};
use serde_json::json;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .expect("writer lock should not be poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn book(first: u32) -> Block {
    let timestamps: Vec<f64> = (first..first + 5).map(f64::from).collect();
    let bids = timestamps.iter().map(|ts| ts + 10.0).collect();
    let asks = timestamps.iter().map(|ts| ts + 12.0).collect();
    Block::new(
        timestamps,
        vec![Column::new("bid", bids), Column::new("ask", asks)],
    )
    .expect("book block should be valid")
}

fn run_labeled() {
    let store = InMemoryBlockStore::new()
        .with_block("l2/0.csv", book(0))
        .with_block("l2/1.csv", book(5));
    let data_catalog = InMemoryDataCatalog::new().with_blocks(
        L2_BOOK_SNAPSHOT,
        vec![
            BlockMeta::new(0.0, 5.0).with_path("l2/0.csv"),
            BlockMeta::new(5.0, 10.0).with_path("l2/1.csv"),
        ],
    );
    let config = FeaturizerConfig::from_json_str(
        &json!({
            "feature_configs": [
                {"feature_definition": "mid_price"},
                {"feature_definition": "rolling_mean", "feature_params": {"0": {"lookback": "1s"}}}
            ],
            "label_feature": 0,
            "label_lookahead": "1s",
            "features_to_store": [1],
            "max_concurrent": 1
        })
        .to_string(),
    )
    .expect("config should parse");

    let store: Arc<dyn BlockStore> = Arc::new(store);
    Featurizer::run(
        &config,
        &DefinitionRegistry::with_builtins(),
        &data_catalog,
        Arc::clone(&store),
        Arc::new(InMemoryFeatureCatalog::new()),
        &InlineExecutor,
    )
    .expect("run should succeed");
}

#[test]
fn run_emits_lifecycle_events() {
    let logs = capture_logs(Level::INFO, run_labeled);

    for event in [
        "run.start",
        "graph.built",
        "join.planned",
        "executor.start",
        "executor.finish",
        "task.store.finish",
        "run.finish",
    ] {
        assert!(
            logs.contains(&format!("\"event\":\"{event}\"")),
            "missing {event} in {logs}"
        );
    }
    assert!(logs.contains("\"component\":\"featurizer\""));
    assert!(logs.contains("\"labeled\":true"));
    assert!(!logs.contains("\"event\":\"cache.hit\""));
}

#[test]
fn debug_level_shows_cache_and_task_events() {
    let logs = capture_logs(Level::DEBUG, run_labeled);

    assert!(logs.contains("\"event\":\"cache.hit\""));
    assert!(logs.contains("\"event\":\"task.load.finish\""));
    assert!(logs.contains("\"event\":\"task.compute.finish\""));
    assert!(logs.contains("\"event\":\"cache.shutdown\""));
}

#[test]
fn logging_ready_reports_config() {
    let config = LoggingConfig {
        level: "debug".to_string(),
        format: LogFormat::Json,
        include_target: false,
    };
    let logs = capture_logs(Level::INFO, || log_logging_ready(&config));

    assert!(logs.contains("\"event\":\"logging.ready\""));
    assert!(logs.contains("\"log_level\":\"debug\""));
    assert!(logs.contains("\"include_target\":false"));
}
