use std::sync::Once;
use std::time::{Duration, Instant};

use kafka_streamer::test_utils::{MockConsumer, MockHandle};
use kafka_streamer::{ReadStream, StreamOptions};

static TRACING: Once = Once::new();

/// Honors `RUST_LOG` so a failing test can be re-run with the stream's
/// internal logging visible.
fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

pub fn mock_stream(options: StreamOptions) -> (ReadStream<MockConsumer>, MockHandle) {
    init_tracing();
    let (consumer, handle) = MockConsumer::new();
    let rx = handle.take_rebalance_rx();
    (ReadStream::wrap(consumer, rx, options), handle)
}

/// Poll `condition` until it holds, failing the test after ten seconds.
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {description}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
