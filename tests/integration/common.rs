//! Shared helpers for integration tests.

use db_relay::engine::{EngineClient, EngineContext, EngineRegistry, MockEngine};
use db_relay::executor::{Executor, ExecutorSettings};
use db_relay::store::ResultStore;
use std::sync::Arc;
use std::time::Duration;

/// Executor settings that poll quickly.
pub fn fast_settings() -> ExecutorSettings {
    ExecutorSettings {
        poll_interval: Duration::from_millis(5),
        fetch_batch_size: 3,
        ..ExecutorSettings::default()
    }
}

/// Built-in engines plus `mock` served by `engine`.
pub fn executor_with_mock(engine: MockEngine) -> Executor {
    let mut registry = EngineRegistry::builtin();
    registry.register("mock", move |_config, _context| {
        Ok(Arc::new(engine.clone()) as Arc<dyn EngineClient>)
    });
    Executor::new(registry, EngineContext::default(), fast_settings())
}

/// Built-in engines only.
pub fn builtin_executor() -> Executor {
    Executor::new(
        EngineRegistry::builtin(),
        EngineContext::default(),
        fast_settings(),
    )
}

/// Reads a whole stored result as text.
pub async fn stored_text(store: &Arc<dyn ResultStore>, key: &str) -> String {
    let mut source = store.open_source(key).await.unwrap();
    let mut out = Vec::new();
    while let Some(chunk) = source.next_chunk().await.unwrap() {
        out.extend_from_slice(&chunk);
    }
    String::from_utf8(out).unwrap()
}
