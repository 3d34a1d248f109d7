//! Fetch interception types and the offline fallbacks.

use http::{header, HeaderValue, Method, StatusCode};
use pwakit_net::{Request, Response};

use crate::clients::ClientId;
use crate::config::OfflinePage;

/// Body of the generic offline response.
pub const UNAVAILABLE_BODY: &str = "Offline - Resource not available";

/// A fetch event.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The intercepted request.
    pub request: Request,

    /// Page that issued the request, if known.
    pub client_id: Option<ClientId>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }

    pub fn from_client(request: Request, client_id: ClientId) -> Self {
        Self {
            request,
            client_id: Some(client_id),
        }
    }
}

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// A cache generation.
    Cache,
    /// The network.
    Network,
    /// Cached root document served for an offline navigation.
    RootDocument,
    /// Synthesized offline page.
    OfflinePage,
    /// Synthesized 503.
    Unavailable,
}

/// A response produced by the worker.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

/// Outcome of dispatching a fetch event.
#[derive(Debug, Clone)]
pub enum FetchDisposition {
    /// Not intercepted; the host performs the request itself.
    Passthrough,
    /// The worker answered.
    Respond(FetchResponse),
}

impl FetchDisposition {
    pub(crate) fn respond(response: Response, source: ResponseSource) -> Self {
        Self::Respond(FetchResponse { response, source })
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, FetchDisposition::Passthrough)
    }

    /// The response, if the worker answered.
    pub fn response(&self) -> Option<&FetchResponse> {
        match self {
            FetchDisposition::Respond(r) => Some(r),
            FetchDisposition::Passthrough => None,
        }
    }

    pub fn into_response(self) -> Option<FetchResponse> {
        match self {
            FetchDisposition::Respond(r) => Some(r),
            FetchDisposition::Passthrough => None,
        }
    }
}

/// Only GET over http(s) is intercepted.
pub fn should_intercept(request: &Request) -> bool {
    request.method == Method::GET && request.is_http()
}

/// Only plain same-origin 200s are worth persisting.
pub fn is_cacheable(response: &Response) -> bool {
    response.status == StatusCode::OK && response.is_basic()
}

/// The synthesized offline page for navigations.
pub fn offline_document(page: &OfflinePage) -> Response {
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>{title}</title>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <style>
    body {{
      font-family: system-ui, -apple-system, sans-serif;
      background: #111827;
      color: white;
      display: flex;
      align-items: center;
      justify-content: center;
      min-height: 100vh;
      margin: 0;
      text-align: center;
    }}
    .container {{ max-width: 400px; padding: 2rem; }}
    button {{
      background: #1C2534;
      color: white;
      border: none;
      padding: 0.75rem 1.5rem;
      border-radius: 0.5rem;
      cursor: pointer;
      margin-top: 1rem;
    }}
  </style>
</head>
<body>
  <div class="container">
    <h1>{heading}</h1>
    <p>{message}</p>
    <p>{detail}</p>
    <button onclick="window.location.reload()">{retry}</button>
  </div>
</body>
</html>
"#,
        title = escape_html(&page.title),
        heading = escape_html(&page.heading),
        message = escape_html(&page.message),
        detail = escape_html(&page.detail),
        retry = escape_html(&page.retry_label),
    );

    Response::new(StatusCode::OK, html)
        .with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/html"))
}

/// The synthesized 503 for everything that is not a navigation.
pub fn service_unavailable() -> Response {
    Response::new(StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_BODY)
        .with_status_text("Service Unavailable")
        .with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
