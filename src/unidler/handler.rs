//! The traffic-facing HTTP surface.
//!
//! The ingress controller sends requests for idled environments here as its
//! default backend for the sentinel code. The handler decides whether the
//! caller may wake the environment, kicks off at most one unidle per
//! namespace in the background, and always responds immediately with a page.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{Request, StatusCode, Version};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use kube::ResourceExt;
use log::info;

use crate::unidler::pages::{self, PageData};
use crate::unidler::{restrictions, verify, Unidler};

pub const FORMAT_HEADER: &str = "x-format";
pub const CODE_HEADER: &str = "x-code";
pub const ORIGINAL_URI_HEADER: &str = "x-original-uri";
pub const NAMESPACE_HEADER: &str = "x-namespace";
pub const INGRESS_NAME_HEADER: &str = "x-ingress-name";
pub const SERVICE_NAME_HEADER: &str = "x-service-name";
pub const SERVICE_PORT_HEADER: &str = "x-service-port";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Marker identifying responses produced by this backend.
pub const SNOOZE_HEADER: &str = "x-snooze";
pub const ALLOWED_HEADER: &str = "x-snooze-allowed";
pub const VERIFICATION_REQUIRED_HEADER: &str = "x-snooze-verification-required";
pub const DENIED_HEADER: &str = "x-snooze-denied";
pub const NO_NAMESPACE_HEADER: &str = "x-snooze-no-namespace";

const FAVICON: &str = "data:image/x-icon;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk+M9QDwADhgGAWjR9awAAAABJRU5ErkJggg==";

pub fn router(unidler: Arc<Unidler>) -> Router {
    Router::new()
        .route("/favicon.ico", get(favicon))
        .route("/metrics", get(metrics))
        .fallback(ingress_handler)
        .with_state(unidler)
}

async fn favicon() -> impl IntoResponse {
    (
        [
            (HeaderName::from_static(SNOOZE_HEADER), HeaderValue::from_static("true")),
            (CONTENT_TYPE, HeaderValue::from_static("image/x-icon")),
            (CACHE_CONTROL, HeaderValue::from_static("public, max-age=7776000")),
        ],
        format!("{}\n", FAVICON),
    )
}

async fn metrics(State(unidler): State<Arc<Unidler>>) -> impl IntoResponse {
    unidler.metrics.gather()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

fn page_data(headers: &HeaderMap, unidler: &Unidler, code: u16) -> PageData {
    PageData {
        error_code: code.to_string(),
        error_message: StatusCode::from_u16(code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
            .to_string(),
        original_uri: header(headers, ORIGINAL_URI_HEADER).to_string(),
        namespace: header(headers, NAMESPACE_HEADER).to_string(),
        ingress_name: header(headers, INGRESS_NAME_HEADER).to_string(),
        service_name: header(headers, SERVICE_NAME_HEADER).to_string(),
        service_port: header(headers, SERVICE_PORT_HEADER).to_string(),
        request_id: header(headers, REQUEST_ID_HEADER).to_string(),
        refresh_interval: unidler.refresh_interval,
        verifier: String::new(),
    }
}

struct Reply {
    status: u16,
    format: String,
    markers: Vec<&'static str>,
    body: String,
}

impl Reply {
    fn render(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static(SNOOZE_HEADER), HeaderValue::from_static("true"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("private,no-store"));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(&self.format)
                .unwrap_or(HeaderValue::from_static("text/html")),
        );
        for marker in self.markers {
            headers.insert(
                HeaderName::from_static(marker),
                HeaderValue::from_static("true"),
            );
        }
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::NOT_FOUND);
        (status, headers, Html(self.body)).into_response()
    }
}

async fn ingress_handler(
    State(unidler): State<Arc<Unidler>>,
    Query(query): Query<HashMap<String, String>>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();
    let proto = proto_label(request.version());
    let headers = request.headers();

    let response = decide(&unidler, headers, &query).await.render();

    unidler.metrics.request_count.with_label_values(&[proto]).inc();
    unidler
        .metrics
        .request_duration
        .with_label_values(&[proto])
        .observe(start.elapsed().as_secs_f64());
    response
}

async fn decide(unidler: &Arc<Unidler>, headers: &HeaderMap, query: &HashMap<String, String>) -> Reply {
    let format = match header(headers, FORMAT_HEADER) {
        "" => "text/html".to_string(),
        f => f.to_string(),
    };
    let code: u16 = header(headers, CODE_HEADER)
        .parse()
        .unwrap_or(unidler.default_response_code);

    let namespace_name = header(headers, NAMESPACE_HEADER).to_string();
    if namespace_name.is_empty() {
        unidler.metrics.no_namespace_requests.inc();
        let data = page_data(headers, unidler, code);
        return Reply {
            status: code,
            format,
            markers: vec![DENIED_HEADER, NO_NAMESPACE_HEADER],
            body: pages::error_page(&data),
        };
    }

    // the namespace has to exist for this to be a legitimate request
    let namespace = match unidler.store.get_namespace(&namespace_name).await {
        Ok(namespace) => namespace,
        Err(e) => {
            info!(target: "handler", "unable to get namespace {}: {}", namespace_name, e);
            unidler.metrics.no_namespace_requests.inc();
            let data = page_data(headers, unidler, 400);
            return Reply {
                status: 400,
                format,
                markers: vec![DENIED_HEADER, NO_NAMESPACE_HEADER],
                body: pages::error_page(&data),
            };
        }
    };
    let ingress_name = header(headers, INGRESS_NAME_HEADER);
    let ingress = match unidler.store.get_ingress(&namespace_name, ingress_name).await {
        Ok(ingress) => ingress,
        Err(e) => {
            info!(target: "handler", "unable to get ingress {} in {}: {}", ingress_name, namespace_name, e);
            let data = page_data(headers, unidler, 400);
            return Reply { status: 400, format, markers: vec![], body: pages::error_page(&data) };
        }
    };

    let supplied_verifier = query.get("verifier").map(String::as_str);
    let (expected_verifier, verified) = verify::verify_request(
        unidler.verified_unidling,
        &unidler.verified_secret,
        &namespace_name,
        ingress.annotations(),
        namespace.annotations(),
        supplied_verifier,
    );
    // an empty expected verifier means verification did not apply, either
    // globally or through a disable annotation
    if !expected_verifier.is_empty() {
        unidler.metrics.verification_requests.inc();
    }

    let true_client_ip = header(headers, "true-client-ip");
    let user_agent = header(headers, "user-agent");
    let x_forwarded_for: Vec<String> = header(headers, "x-forwarded-for")
        .split(',')
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .collect();

    let allowed = restrictions::check_access(
        ingress.annotations(),
        namespace.annotations(),
        &unidler.global_lists,
        user_agent,
        true_client_ip,
        &x_forwarded_for,
    );
    if !allowed {
        unidler.metrics.blocked_requests.inc();
        let data = page_data(headers, unidler, 403);
        return Reply {
            status: 403,
            format,
            markers: vec![DENIED_HEADER],
            body: pages::error_page(&data),
        };
    }

    if unidler.debug {
        info!(
            target: "handler",
            "request for {} verified: {} from xff:{:?}; tcip:{}; ua: {}",
            namespace_name, verified, x_forwarded_for, true_client_ip, user_agent
        );
    }

    let mut data = page_data(headers, unidler, code);
    data.verifier = expected_verifier;

    // force-scaled environments render the administrative page and are
    // never unidled automatically
    if unidler.is_force_scaled(&namespace_name).await {
        return Reply { status: code, format, markers: vec![], body: pages::forced_page(&data) };
    }

    let mut markers = Vec::new();
    if verified {
        unidler.metrics.allowed_requests.inc();
        markers.push(ALLOWED_HEADER);
        if let Some(guard) = unidler.locks.try_acquire(&namespace_name) {
            let background = Arc::clone(unidler);
            let ns = namespace_name.clone();
            tokio::spawn(async move {
                background.unidle(&ns, guard).await;
            });
        }
        // a held lock means an unidle is already in flight; the response is
        // the same waiting page either way
    } else {
        unidler.metrics.verification_required.inc();
        markers.push(VERIFICATION_REQUIRED_HEADER);
    }

    Reply { status: code, format, markers, body: pages::unidle_page(&data) }
}

fn proto_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "unknown",
    }
}

/// Serves the router until shutdown.
pub async fn run(unidler: Arc<Unidler>, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(target: "handler", "unidler listening on port {}", port);
    axum::serve(listener, router(unidler)).await?;
    Ok(())
}
