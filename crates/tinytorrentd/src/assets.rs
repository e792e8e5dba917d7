//! Static UI asset serving (part of C8) — spec section 4.5.
//!
//! Ported directly from `Dastari-librarian`'s `static_assets.rs`: a
//! `rust_embed` folder plus an index.html fallback for client-side routing.
//! Adds query-string stripping (clients cache-bust with `?v=...`) and an
//! `X-Content-Type-Options: nosniff` header, both spec requirements this
//! daemon adds on top of the pattern it borrows.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use mime_guess::MimeGuess;
use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "web"]
struct UiAssets;

fn content_type_for(path: &str) -> HeaderValue {
    let mime: MimeGuess = mime_guess::from_path(path);
    let value = mime.first_or_octet_stream().to_string();
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

fn asset_response(path: &str) -> Option<Response> {
    UiAssets::get(path).map(|asset| {
        let mut response = Response::new(Body::from(asset.data.into_owned()));
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type_for(path));
        response
            .headers_mut()
            .insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        response
    })
}

pub async fn serve_ui(uri: Uri) -> impl IntoResponse {
    let raw_path = uri.path().trim_start_matches('/');
    // Strip a `?v=...` cache-busting query string clients may append; `Uri::path()`
    // already excludes the query, but a client-supplied literal `?` embedded in
    // the path segment itself should not defeat the lookup either.
    let path = raw_path.split('?').next().unwrap_or(raw_path);
    let path = if path.is_empty() { "index.html" } else { path };

    if let Some(response) = asset_response(path) {
        return response;
    }

    let is_asset_request = path.contains('.');
    if !is_asset_request {
        if let Some(response) = asset_response("index.html") {
            return response;
        }
    }

    StatusCode::NOT_FOUND.into_response()
}
