mod common;

use common::{NOW, bindings, compose, init_tracing};
use starberry_token::{
    AuthorizationServerOps, ClientOps, Clock, FormatSpec, HashAlgorithm, HeaderSpec, HttpRequest, IssuedToken,
    ManualClock, ParamLocation, ResourceServerOps, SchemeSpec, TokenError, TransportSpec, UsedToken,
};
use starberry_token::token_core::request::FORM_CONTENT_TYPE;

async fn round_trip(spec: SchemeSpec, request: HttpRequest) -> HttpRequest {
    let clock = ManualClock::new(NOW);
    let scheme = compose(spec, &clock);
    let authserv = scheme.authorization_server().unwrap();
    let client = scheme.client().unwrap();
    let resource = scheme.resource_server().unwrap();

    let issued = authserv.token_create(NOW, 100, bindings()).await.unwrap();
    assert_eq!(issued.expires_in, 100);
    let saved = client.token_accept(&issued, &issued.to_params()).unwrap();

    let mut request = request;
    client.http_insert(&mut request, &saved).unwrap();
    let used = resource.extract_one(&request).unwrap();
    let info = resource.token_validate(&used).await.unwrap();
    assert_eq!(info.issue_time, NOW);
    assert_eq!(info.expires_in, 100);
    assert_eq!(info.bindings, bindings());
    request
}

#[tokio::test]
async fn test_bearer_handle_in_header() {
    init_tracing();
    let req = round_trip(SchemeSpec::new(FormatSpec::bearer_handle()), HttpRequest::get("http://example.com/gmap?x=1")).await;
    assert!(req.header("Authorization").unwrap().starts_with("Bearer "));
    assert_eq!(req.uri, "http://example.com/gmap?x=1");
}

#[tokio::test]
async fn test_bearer_signed_in_header() {
    init_tracing();
    let spec = SchemeSpec::new(FormatSpec::bearer_signed("server-key", HashAlgorithm::Sha224));
    round_trip(spec, HttpRequest::get("http://example.com/gmap?x=1")).await;
}

#[tokio::test]
async fn test_http_hmac_round_trip() {
    init_tracing();
    let spec = SchemeSpec::new(FormatSpec::http_hmac(HashAlgorithm::Sha512, 300));
    let req = round_trip(spec, HttpRequest::get("http://example.com/gmap?x=1")).await;
    let header = req.header("authorization").unwrap();
    assert!(header.starts_with("MAC id=\""));
    assert!(header.contains("nonce=\""));
}

#[tokio::test]
async fn test_param_transport_query_and_body() {
    init_tracing();
    let spec = SchemeSpec::new(FormatSpec::bearer_handle()).transport(TransportSpec::param(ParamLocation::Either));
    let req = round_trip(spec.clone(), HttpRequest::get("http://example.com/gmap?x=1")).await;
    assert!(req.uri.starts_with("http://example.com/gmap?x=1&access_token="));

    let form = HttpRequest::post("http://example.com/gmap").with_body(FORM_CONTENT_TYPE, "x=1");
    let req = round_trip(spec, form).await;
    assert!(String::from_utf8(req.body).unwrap().starts_with("x=1&access_token="));
}

#[tokio::test]
async fn test_custom_header_without_scheme() {
    let spec = SchemeSpec::new(FormatSpec::bearer_handle())
        .header(HeaderSpec { synthesize: false, ..HeaderSpec::named("X-Api-Token") });
    let req = round_trip(spec, HttpRequest::get("http://example.com/")).await;
    assert!(req.header("authorization").is_none());
    assert!(!req.header("x-api-token").unwrap().contains(' '));
}

#[tokio::test]
async fn test_accept_rejects_other_token_type() {
    let clock = ManualClock::new(NOW);
    let scheme = compose(SchemeSpec::new(FormatSpec::bearer_handle()), &clock);
    let issued = IssuedToken {
        token_type: "mac".into(),
        access_token: "x".into(),
        expires_in: 10,
        secret: None,
        algorithm: None,
    };
    let err = scheme.client().unwrap().token_accept(&issued, &[]).unwrap_err();
    assert!(matches!(err, TokenError::TypeMismatch { .. }));
    assert_eq!(err.error_code(), "type_mismatch");
}

#[tokio::test]
async fn test_accept_filter_keeps_named_params() {
    let clock = ManualClock::new(NOW);
    let scheme = compose(SchemeSpec::new(FormatSpec::bearer_handle()).accept_keep(["scope"]), &clock);
    let issued = scheme.authorization_server().unwrap().token_create(NOW, 100, vec![]).await.unwrap();
    let mut params = issued.to_params();
    params.push(("scope".into(), "read".into()));
    params.push(("state".into(), "xyz".into()));
    let saved = scheme.client().unwrap().token_accept(&issued, &params).unwrap();
    assert_eq!(saved.params, vec![("scope".to_string(), "read".to_string())]);
    assert_eq!(saved.param("scope"), Some("read"));
}

#[tokio::test]
async fn test_handle_expires_and_revokes() {
    let clock = ManualClock::new(NOW);
    let scheme = compose(SchemeSpec::new(FormatSpec::bearer_handle()), &clock);
    let authserv = scheme.authorization_server().unwrap();
    let resource = scheme.resource_server().unwrap();

    let short = authserv.token_create(NOW, 100, bindings()).await.unwrap();
    clock.advance(99);
    assert!(resource.token_validate(&UsedToken::bare(&short.access_token)).await.is_ok());
    clock.advance(1);
    let err = resource.token_validate(&UsedToken::bare(&short.access_token)).await.unwrap_err();
    assert!(matches!(err, TokenError::UnknownHandle));

    let revoked = authserv.token_create(clock.now(), 100, bindings()).await.unwrap();
    scheme.entries().unwrap().revoke(&revoked.access_token).await.unwrap();
    let err = resource.token_validate(&UsedToken::bare(&revoked.access_token)).await.unwrap_err();
    assert!(matches!(err, TokenError::UnknownHandle));
}

#[tokio::test]
async fn test_signed_token_expires() {
    let clock = ManualClock::new(NOW);
    let scheme = compose(SchemeSpec::new(FormatSpec::bearer_signed("k", HashAlgorithm::Sha256)), &clock);
    let issued = scheme.authorization_server().unwrap().token_create(NOW, 100, bindings()).await.unwrap();
    clock.advance(100);
    let err = scheme
        .resource_server()
        .unwrap()
        .token_validate(&UsedToken::bare(&issued.access_token))
        .await
        .unwrap_err();
    assert!(matches!(err, TokenError::Expired { expired_at } if expired_at == NOW + 100));
}

#[tokio::test]
async fn test_signed_token_tamper_fails_everywhere() {
    let clock = ManualClock::new(NOW);
    let scheme = compose(SchemeSpec::new(FormatSpec::bearer_signed("k", HashAlgorithm::Sha256)), &clock);
    let issued = scheme.authorization_server().unwrap().token_create(NOW, 100, bindings()).await.unwrap();
    let resource = scheme.resource_server().unwrap();
    let original: Vec<char> = issued.access_token.chars().collect();
    for i in 0..original.len() {
        let mut tampered = original.clone();
        tampered[i] = if tampered[i] == 'A' { 'B' } else { 'A' };
        let token: String = tampered.into_iter().collect();
        let err = resource.token_validate(&UsedToken::bare(token)).await.unwrap_err();
        assert!(matches!(err, TokenError::InvalidSignature), "position {}", i);
    }
}

#[tokio::test]
async fn test_extract_one_needs_exactly_one_candidate() {
    let clock = ManualClock::new(NOW);
    let spec = SchemeSpec::new(FormatSpec::bearer_handle()).transport(TransportSpec::Bearer {
        allow_uri: true,
        allow_body: false,
        param_name: "access_token".into(),
    });
    let resource = compose(spec, &clock).resource_server().unwrap();

    let none = HttpRequest::get("http://example.com/");
    assert!(matches!(resource.extract_one(&none), Err(TokenError::TransportMismatch { found: 0 })));

    let both = HttpRequest::get("http://example.com/?access_token=one").with_header("Authorization", "Bearer two");
    assert_eq!(resource.http_extract(&both).len(), 2);
    let err = resource.extract_one(&both).unwrap_err();
    assert!(matches!(err, TokenError::TransportMismatch { found: 2 }));
    assert_eq!(err.http_status(), 400);

    let query_only = HttpRequest::get("http://example.com/?access_token=one");
    assert_eq!(resource.extract_one(&query_only).unwrap().token, "one");
}

#[tokio::test]
async fn test_token_params_round_trip_through_client() {
    let clock = ManualClock::new(NOW);
    let scheme = compose(SchemeSpec::new(FormatSpec::http_hmac(HashAlgorithm::Sha256, 60)), &clock);
    let issued = scheme.authorization_server().unwrap().token_create(NOW, 100, bindings()).await.unwrap();
    let parsed = IssuedToken::from_params(&issued.to_params()).unwrap();
    assert_eq!(parsed, issued);
    let saved = scheme.client().unwrap().token_accept(&parsed, &[]).unwrap();
    assert_eq!(saved.secret, issued.secret);
    assert_eq!(saved.received_at, Some(NOW));
}
