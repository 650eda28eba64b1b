use std::net::SocketAddr;

use anyhow::Context;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use prometheus::{Encoder, TextEncoder};
use tracing::{error, info};

use super::exporter_metrics::AGENT_REGISTRY;

fn render(path: &str, request: &Request<Body>) -> Response<Body> {
    if request.uri().path() != path {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap_or_default();
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&AGENT_REGISTRY.gather(), &mut buffer) {
        error!("(Metrics) Could not encode metrics: {}", e);
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap_or_default();
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap_or_default()
}

///
/// Serves agent metrics with Prometheus format.
///
pub async fn serve_metrics(address: String, port: u16, path: String) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", address, port)
        .parse()
        .context("Unable to parse metrics address and port")?;

    let make_svc = make_service_fn(move |_| {
        let path = path.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |request| {
                let response = render(&path, &request);
                async move { Ok::<_, hyper::Error>(response) }
            }))
        }
    });

    info!("(Metrics) Serving metrics on {}", addr);
    Server::try_bind(&addr)
        .context("Could not bind metrics server")?
        .serve(make_svc)
        .await
        .context("Metrics server failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_only_serves_configured_path() {
        let request = Request::builder().uri("/other").body(Body::empty()).unwrap();
        assert_eq!(render("/metrics", &request).status(), StatusCode::NOT_FOUND);

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = render("/metrics", &request);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("Content-Type"));
    }
}
