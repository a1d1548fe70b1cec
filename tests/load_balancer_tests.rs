// tests/load_balancer_tests.rs
//
// Drives the full dispatch path against real local listeners: well-behaved
// upstreams are small hyper servers, failing upstreams accept the connection
// and drop it before answering, which surfaces as a forwarding error.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use rotor_lb::config::RetryConfig;
use rotor_lb::proxy::{Backend, BackendPool, Proxy};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use url::Url;

/// Upstream that answers 200, names itself, echoes the body and the
/// x-request-id header, and counts requests.
async fn spawn_ok_backend(name: &'static str) -> (Url, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let requests = counter.clone();

    let make_service = make_service_fn(move |_| {
        let requests = requests.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let requests = requests.clone();
                async move {
                    requests.fetch_add(1, Ordering::SeqCst);
                    let request_id = req.headers().get("x-request-id").cloned();
                    let body = hyper::body::to_bytes(req.into_body()).await.unwrap();

                    let mut response = Response::builder()
                        .status(StatusCode::OK)
                        .header("x-backend-name", name);
                    if let Some(id) = request_id {
                        response = response.header("x-echoed-request-id", id);
                    }
                    Ok::<_, Infallible>(response.body(Body::from(body)).unwrap())
                }
            }))
        }
    });

    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_service);
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });

    (Url::parse(&format!("http://{}", addr)).unwrap(), counter)
}

/// Upstream that accepts each connection and immediately closes it, so every
/// forward fails deterministically. The counter records accepted connects,
/// i.e. forwarding attempts.
async fn spawn_failing_backend() -> (Url, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let accepts = counter.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepts.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    (Url::parse(&format!("http://{}", addr)).unwrap(), counter)
}

fn pool_of(urls: &[&Url]) -> Arc<BackendPool> {
    let mut pool = BackendPool::empty();
    for url in urls {
        pool.add_backend(Arc::new(Backend::new((*url).clone())));
    }
    Arc::new(pool)
}

fn proxy_with_defaults(pool: Arc<BackendPool>) -> Proxy {
    Proxy::new(RetryConfig::default(), pool, None)
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// Rotation starts one past the cursor, so with a two-backend pool the backend
// at index 1 is selected first. Tests below order their pools accordingly.

#[tokio::test]
async fn failing_backend_is_retried_then_demoted_then_failover_succeeds() {
    let (ok_url, ok_requests) = spawn_ok_backend("survivor").await;
    let (fail_url, fail_accepts) = spawn_failing_backend().await;

    let pool = pool_of(&[&ok_url, &fail_url]);
    let proxy = proxy_with_defaults(pool.clone());

    let request = Request::builder()
        .uri("/work")
        .body(Body::empty())
        .unwrap();
    let response = proxy.dispatch(request, None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-backend-name"], "survivor");

    // Exactly max_retries forwards hit the failing backend before demotion.
    assert_eq!(fail_accepts.load(Ordering::SeqCst), 3);
    assert_eq!(ok_requests.load(Ordering::SeqCst), 1);

    // The failing backend stays dead until a health check says otherwise.
    assert!(!pool.backends()[1].is_alive().await);
    assert!(pool.backends()[0].is_alive().await);
}

#[tokio::test]
async fn all_backends_dead_returns_503_without_forwarding() {
    let (ok_url, ok_requests) = spawn_ok_backend("idle").await;

    let pool = pool_of(&[&ok_url]);
    pool.mark_backend_status(pool.backends()[0].address(), false)
        .await;
    let proxy = proxy_with_defaults(pool);

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = proxy.dispatch(request, None).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_text(response).await, "Service not available");
    assert_eq!(ok_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn attempts_are_bounded_even_with_backends_to_spare() {
    let mut urls = Vec::new();
    let mut accepts = Vec::new();
    for _ in 0..4 {
        let (url, counter) = spawn_failing_backend().await;
        urls.push(url);
        accepts.push(counter);
    }

    let pool = pool_of(&urls.iter().collect::<Vec<_>>());
    let proxy = proxy_with_defaults(pool.clone());

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = proxy.dispatch(request, None).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_text(response).await, "Service not available");

    // Selection starts at index 1, so attempts 1..=3 burn backends 1..=3
    // with a full retry budget each; backend 0 is never touched because the
    // attempt limit trips first.
    assert_eq!(accepts[0].load(Ordering::SeqCst), 0);
    for counter in &accepts[1..] {
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
    assert!(pool.backends()[0].is_alive().await);
    for backend in &pool.backends()[1..] {
        assert!(!backend.is_alive().await);
    }
}

#[tokio::test]
async fn pool_exhaustion_mid_request_returns_503() {
    let (fail_a, accepts_a) = spawn_failing_backend().await;
    let (fail_b, accepts_b) = spawn_failing_backend().await;

    let pool = pool_of(&[&fail_a, &fail_b]);
    let proxy = proxy_with_defaults(pool.clone());

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = proxy.dispatch(request, None).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(accepts_a.load(Ordering::SeqCst), 3);
    assert_eq!(accepts_b.load(Ordering::SeqCst), 3);
    for backend in pool.backends() {
        assert!(!backend.is_alive().await);
    }
}

#[tokio::test]
async fn body_and_request_id_are_forwarded() {
    let (ok_url, _) = spawn_ok_backend("echo").await;

    let proxy = proxy_with_defaults(pool_of(&[&ok_url]));

    let request = Request::builder()
        .method("POST")
        .uri("/submit")
        .body(Body::from("payload-bytes"))
        .unwrap();
    let response = proxy.dispatch(request, None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-echoed-request-id"));
    assert_eq!(body_text(response).await, "payload-bytes");
}

#[tokio::test]
async fn consecutive_requests_rotate_across_backends() {
    let (url_a, requests_a) = spawn_ok_backend("a").await;
    let (url_b, requests_b) = spawn_ok_backend("b").await;

    let proxy = proxy_with_defaults(pool_of(&[&url_a, &url_b]));

    for _ in 0..4 {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = proxy.dispatch(request, None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(requests_a.load(Ordering::SeqCst), 2);
    assert_eq!(requests_b.load(Ordering::SeqCst), 2);
}
