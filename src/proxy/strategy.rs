//! Request classification and the strategy each class gets.

use serde::Serialize;

use super::cache::CacheClass;
use crate::api::{Destination, HttpRequest, Method};

const STATIC_EXTENSIONS: &[&str] = &[".js", ".mjs", ".css", ".woff", ".woff2", ".ttf", ".webmanifest"];
const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico"];

/// Resource class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    StaticAsset,
    Image,
    Api,
    Navigation,
    /// Never cached: non-GET requests and the collaboration/editor paths
    Passthrough,
}

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Serve from cache when present and refresh in the background
    CacheFirst(CacheClass),
    /// Try the network, fall back to the cache
    NetworkFirst(CacheClass),
    NetworkOnly,
}

impl RequestClass {
    pub fn strategy(self) -> Strategy {
        match self {
            RequestClass::StaticAsset => Strategy::CacheFirst(CacheClass::Static),
            RequestClass::Image => Strategy::CacheFirst(CacheClass::Images),
            RequestClass::Api | RequestClass::Navigation => {
                Strategy::NetworkFirst(CacheClass::Runtime)
            }
            RequestClass::Passthrough => Strategy::NetworkOnly,
        }
    }
}

/// Classify a request. `passthrough` lists path prefixes that bypass the
/// cache entirely.
pub fn classify(request: &HttpRequest, passthrough: &[String]) -> RequestClass {
    if request.method != Method::Get {
        return RequestClass::Passthrough;
    }

    let path = request.path();
    if passthrough
        .iter()
        .any(|prefix| !prefix.is_empty() && path.starts_with(prefix.as_str()))
    {
        return RequestClass::Passthrough;
    }

    match request.destination {
        Destination::Document => RequestClass::Navigation,
        Destination::Image => RequestClass::Image,
        Destination::Script | Destination::Style | Destination::Font | Destination::Manifest => {
            RequestClass::StaticAsset
        }
        Destination::Empty => {
            let lower = path.to_ascii_lowercase();
            if IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
                RequestClass::Image
            } else if STATIC_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
                RequestClass::StaticAsset
            } else {
                RequestClass::Api
            }
        }
    }
}
