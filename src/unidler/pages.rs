//! Response pages served by the traffic-facing handler.

/// Everything a page render may interpolate; lifted straight from the
/// headers the ingress controller passes to its default backend.
#[derive(Debug, Clone, Default)]
pub struct PageData {
    pub error_code: String,
    pub error_message: String,
    pub original_uri: String,
    pub namespace: String,
    pub ingress_name: String,
    pub service_name: String,
    pub service_port: String,
    pub request_id: String,
    pub refresh_interval: u32,
    pub verifier: String,
}

const STYLE: &str = "body{font-family:sans-serif;background:#fafafa;color:#333;\
display:flex;align-items:center;justify-content:center;height:100vh;margin:0}\
.card{text-align:center;max-width:40em}h1{font-weight:300}";

fn page(title: &str, heading: &str, body: &str, head_extra: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n\
{head_extra}<style>{STYLE}</style>\n</head>\n<body>\n<div class=\"card\">\n\
<h1>{heading}</h1>\n{body}\n</div>\n</body>\n</html>\n"
    )
}

/// The environment-waking page. Refreshes itself with the verifier attached
/// so a verification-gated request passes on the next round trip.
pub fn unidle_page(data: &PageData) -> String {
    let refresh = data.refresh_interval.max(1);
    let script = format!(
        "<script>setTimeout(function(){{\
var u=new URL(window.location.href);\
if({has_verifier}&&!u.searchParams.has('verifier')){{u.searchParams.set('verifier','{verifier}');}}\
window.location.replace(u.toString());}},{ms});</script>\n",
        has_verifier = !data.verifier.is_empty(),
        verifier = data.verifier,
        ms = refresh * 1000,
    );
    page(
        "Please wait while the environment starts",
        "Starting environment&hellip;",
        &format!(
            "<p>This environment was put to sleep due to inactivity and is being \
woken up. This page will refresh every {refresh} seconds until the \
environment is ready.</p>\n<p><small>{namespace} {request_id}</small></p>",
            refresh = refresh,
            namespace = html_escape(&data.namespace),
            request_id = html_escape(&data.request_id),
        ),
        &script,
    )
}

/// Served when an administrator force-scaled the environment down.
pub fn forced_page(data: &PageData) -> String {
    page(
        "Environment unavailable",
        "Environment stopped",
        &format!(
            "<p>This environment has been stopped by an administrator and will \
not start automatically. Contact your administrator to start it again.</p>\n\
<p><small>{namespace} {request_id}</small></p>",
            namespace = html_escape(&data.namespace),
            request_id = html_escape(&data.request_id),
        ),
        "",
    )
}

/// Generic error page for denied or unresolvable requests.
pub fn error_page(data: &PageData) -> String {
    page(
        &format!("{} {}", data.error_code, data.error_message),
        &html_escape(&data.error_code),
        &format!(
            "<p>{message}</p>\n<p><small>{request_id}</small></p>",
            message = html_escape(&data.error_message),
            request_id = html_escape(&data.request_id),
        ),
        "",
    )
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}
