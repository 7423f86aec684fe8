use http_body_util::Full;
use hyper::{Request, Response, body::Bytes, body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use owo_colors::OwoColorize;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use tokio::net::TcpListener;

lazy_static! {
    /// Process-wide registry all controller metrics are registered into.
    pub static ref REGISTRY: Registry = Registry::new();
}

/// Per-controller reconcile instrumentation.
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = IntCounterVec::new(
            Opts::new(
                format!("hibernator_{controller}_reconciles_total"),
                "Total reconcile invocations per resource",
            ),
            &["name", "namespace"],
        )
        .unwrap();
        let action_counter = IntCounterVec::new(
            Opts::new(
                format!("hibernator_{controller}_actions_total"),
                "Actions decided by the read phase",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let read_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("hibernator_{controller}_read_phase_seconds"),
                "Duration of the read phase of reconciliation",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let write_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("hibernator_{controller}_write_phase_seconds"),
                "Duration of the write phase of reconciliation",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();

        REGISTRY
            .register(Box::new(reconcile_counter.clone()))
            .unwrap();
        REGISTRY.register(Box::new(action_counter.clone())).unwrap();
        REGISTRY.register(Box::new(read_histogram.clone())).unwrap();
        REGISTRY
            .register(Box::new(write_histogram.clone()))
            .unwrap();

        Self {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let mut buf = String::new();
            match TextEncoder::new().encode_utf8(&REGISTRY.gather(), &mut buf) {
                Ok(()) => Response::builder()
                    .header("content-type", "text/plain; version=0.0.4")
                    .body(Full::new(Bytes::from(buf)))
                    .unwrap(),
                Err(e) => Response::builder()
                    .status(500)
                    .body(Full::new(Bytes::from(format!("encode error: {e}"))))
                    .unwrap(),
            }
        }
        "/healthz" | "/readyz" => Response::new(Full::new(Bytes::from_static(b"ok"))),
        _ => Response::builder()
            .status(404)
            .body(Full::new(Bytes::from_static(b"not found")))
            .unwrap(),
    };
    Ok(response)
}

/// Serves `/metrics`, `/healthz`, and `/readyz` until the process exits.
pub async fn run_metrics_server(port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("🛑 Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                eprintln!("metrics accept failed: {e}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service_fn(handle))
                .await;
        });
    }
}
