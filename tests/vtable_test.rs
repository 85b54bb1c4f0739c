mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use common::{NOW, bindings, builder, init_tracing};
use starberry_token::{
    AuthorizationServerOps, FormatSpec, LoopbackPull, LoopbackPush, ManualClock, Registry, ResourceServerOps,
    SchemeSpec, TokenError, UsedToken, VtableError, VtableMode, VtablePull, VtablePush,
};

struct FailingPush;

#[async_trait]
impl VtablePush for FailingPush {
    async fn push(&self, _entry: Vec<String>) -> Result<(), VtableError> {
        Err("resource server unreachable".into())
    }
}

struct CountingPull {
    inner: LoopbackPull,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl VtablePull for CountingPull {
    async fn pull(&self, query: Vec<String>) -> Result<Vec<String>, VtableError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.pull(query).await
    }
}

#[tokio::test]
async fn test_push_reaches_resource_server() {
    init_tracing();
    let clock = ManualClock::new(NOW);
    let spec = SchemeSpec::new(FormatSpec::bearer_handle()).vtable(VtableMode::AuthservPush);

    let (rs_builder, rs_cache) = builder(spec.clone(), &clock);
    let resource = rs_builder.compose(&Registry::standard()).unwrap().resource_server().unwrap();
    let (as_builder, _) = builder(spec, &clock);
    let authserv = as_builder
        .push_handler(Arc::new(LoopbackPush::new(resource.clone())))
        .compose(&Registry::standard())
        .unwrap()
        .authorization_server()
        .unwrap();

    let issued = authserv.token_create(NOW, 100, bindings()).await.unwrap();
    assert_eq!(rs_cache.len(), 1);
    let info = resource.token_validate(&UsedToken::bare(&issued.access_token)).await.unwrap();
    assert_eq!(info.bindings, bindings());
}

#[tokio::test]
async fn test_failed_push_issues_nothing() {
    init_tracing();
    let clock = ManualClock::new(NOW);
    let spec = SchemeSpec::new(FormatSpec::bearer_handle()).vtable(VtableMode::AuthservPush);
    let (as_builder, as_cache) = builder(spec, &clock);
    let authserv = as_builder
        .push_handler(Arc::new(FailingPush))
        .compose(&Registry::standard())
        .unwrap()
        .authorization_server()
        .unwrap();

    let err = authserv.token_create(NOW, 100, bindings()).await.unwrap_err();
    assert!(matches!(err, TokenError::VtableUnavailable(_)));
    assert_eq!(err.http_status(), 503);
    assert!(as_cache.is_empty());
}

#[tokio::test]
async fn test_pull_caches_until_expiry() {
    init_tracing();
    let clock = ManualClock::new(NOW);
    let spec = SchemeSpec::new(FormatSpec::bearer_handle()).vtable(VtableMode::ResourcePull);

    let (as_builder, _) = builder(spec.clone(), &clock);
    let authserv = as_builder.compose(&Registry::standard()).unwrap().authorization_server().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let (rs_builder, rs_cache) = builder(spec, &clock);
    let resource = rs_builder
        .pull_handler(Arc::new(CountingPull { inner: LoopbackPull::new(authserv.clone()), calls: calls.clone() }))
        .compose(&Registry::standard())
        .unwrap()
        .resource_server()
        .unwrap();

    let issued = authserv.token_create(NOW, 100, bindings()).await.unwrap();
    let used = UsedToken::bare(&issued.access_token);
    for _ in 0..3 {
        assert_eq!(resource.token_validate(&used).await.unwrap().bindings, bindings());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(rs_cache.len(), 1);

    clock.advance(100);
    let err = resource.token_validate(&used).await.unwrap_err();
    assert!(matches!(err, TokenError::UnknownHandle));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_pulled_single_use_code_is_consumed_by_authserv() {
    init_tracing();
    let clock = ManualClock::new(NOW);
    let spec = SchemeSpec::new(FormatSpec::single_use_handle()).vtable(VtableMode::ResourcePull);

    let (as_builder, _) = builder(spec.clone(), &clock);
    let authserv = as_builder.compose(&Registry::standard()).unwrap().authorization_server().unwrap();
    let (rs_builder, rs_cache) = builder(spec, &clock);
    let resource = rs_builder
        .pull_handler(Arc::new(LoopbackPull::new(authserv.clone())))
        .compose(&Registry::standard())
        .unwrap()
        .resource_server()
        .unwrap();

    let code = authserv.token_create(NOW, 60, bindings()).await.unwrap();
    let used = UsedToken::bare(&code.access_token);
    assert!(resource.token_validate(&used).await.is_ok());
    assert!(rs_cache.is_empty());
    assert!(matches!(resource.token_validate(&used).await, Err(TokenError::AlreadyUsed)));
    assert!(matches!(authserv.token_validate(&used).await, Err(TokenError::AlreadyUsed)));
}

#[tokio::test]
async fn test_receive_push_rejects_garbage() {
    let clock = ManualClock::new(NOW);
    let spec = SchemeSpec::new(FormatSpec::bearer_handle()).vtable(VtableMode::AuthservPush);
    let resource = builder(spec, &clock).0.compose(&Registry::standard()).unwrap().resource_server().unwrap();
    let err = resource.receive_push(&["pull".to_string(), "x".to_string()]).await.unwrap_err();
    assert!(matches!(err, TokenError::Malformed(_)));
}

#[tokio::test]
async fn test_pull_transport_failure() {
    struct DownPull;

    #[async_trait]
    impl VtablePull for DownPull {
        async fn pull(&self, _query: Vec<String>) -> Result<Vec<String>, VtableError> {
            Err("timeout".into())
        }
    }

    let clock = ManualClock::new(NOW);
    let spec = SchemeSpec::new(FormatSpec::bearer_handle()).vtable(VtableMode::ResourcePull);
    let resource = builder(spec, &clock)
        .0
        .pull_handler(Arc::new(DownPull))
        .compose(&Registry::standard())
        .unwrap()
        .resource_server()
        .unwrap();
    let err = resource.token_validate(&UsedToken::bare("whatever")).await.unwrap_err();
    assert!(matches!(err, TokenError::VtableUnavailable(ref msg) if msg == "timeout"));
}
