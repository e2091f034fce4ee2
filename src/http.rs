//! `/metrics` and `/healthz` for a long-running archiver.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics;

/// Route one request.
///
/// `/metrics` must carry `text/plain; version=0.0.4; charset=utf-8`,
/// otherwise Prometheus (v3+) rejects the scrape.
pub async fn route(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let mut resp = Response::new(Body::from(metrics::gather_metrics()));
            if let Ok(mime) = encoder.format_type().parse() {
                resp.headers_mut().insert(hyper::header::CONTENT_TYPE, mime);
            }
            resp
        }
        (&Method::GET, "/healthz") => Response::new(Body::from("OK")),
        _ => {
            let mut not_found = Response::new(Body::empty());
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    };
    Ok(resp)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) {
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(route)) });

    info!(%addr, "Starting metrics & health server");
    let server = Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = server.await {
        error!(error = %e, "Metrics server failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get(path: &str) -> Response<Body> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        route(req).await.unwrap()
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let resp = get("/healthz").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn metrics_exposes_archiver_counters() {
        metrics::RECORDS_APPENDED.inc();
        let resp = get("/metrics").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[hyper::header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("rust_feed_archiver_records_appended_total"));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        assert_eq!(get("/nope").await.status(), StatusCode::NOT_FOUND);
    }
}
