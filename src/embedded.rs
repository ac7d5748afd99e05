// Serves the static UI from bytes embedded at compile time. Grounded in
// the teacher's `embedded.rs` (RustEmbed + mime_guess), adapted to serve
// `index.html` at `/` directly instead of redirecting to a login page.
use axum::body::Body;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;
use std::borrow::Cow;

#[derive(RustEmbed)]
#[folder = "static"]
struct StaticAssets;

fn build_response(content: Cow<'static, [u8]>, path: &str) -> Response {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime.as_ref())
        .body(Body::from(content.into_owned()))
        .expect("embedded asset response is well-formed")
}

pub async fn serve_embedded(uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };

    match <StaticAssets as RustEmbed>::get(path) {
        Some(content) => build_response(content.data, path),
        None => (StatusCode::NOT_FOUND, "404 Not Found").into_response(),
    }
}
