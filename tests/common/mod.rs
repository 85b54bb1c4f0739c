#![allow(dead_code)]

use std::sync::Arc;

use starberry_token::{
    Clock, InMemoryCache, InMemoryNonceStore, ManualClock, Registry, SchemeBuilder, SchemeSpec, TokenScheme,
};
use tracing_subscriber::EnvFilter;

pub const NOW: u64 = 1_700_000_000;

/// Routes engine logs to the test output; `RUST_LOG=debug` shows resolution details.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn bindings() -> Vec<String> {
    ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect()
}

/// A cache, nonce store and builder all driven by `clock`.
pub fn builder(spec: SchemeSpec, clock: &ManualClock) -> (SchemeBuilder, InMemoryCache) {
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let cache = InMemoryCache::with_clock(shared.clone());
    let builder = SchemeBuilder::new(spec)
        .clock(shared.clone())
        .cache(Arc::new(cache.clone()))
        .nonce_store(Arc::new(InMemoryNonceStore::with_clock(shared)));
    (builder, cache)
}

pub fn compose(spec: SchemeSpec, clock: &ManualClock) -> Arc<TokenScheme> {
    builder(spec, clock).0.compose(&Registry::standard()).unwrap()
}
