//! Show-events: what the rendering surface is told to display.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::asset::{Asset, Fit, MediaType};

/// Display-channel target carrying a [`ShowEvent`].
pub const SHOW_TARGET: &str = "show";

/// Sentinel pages substituted when nothing in the playlist is eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    NoAssets,
    FirstBoot,
}

impl Fallback {
    /// URL path segment under `/fallback/`.
    pub fn slug(self) -> &'static str {
        match self {
            Fallback::NoAssets => "no-assets",
            Fallback::FirstBoot => "first-boot",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "no-assets" => Some(Fallback::NoAssets),
            "first-boot" => Some(Fallback::FirstBoot),
            _ => None,
        }
    }

    pub fn page(self) -> &'static str {
        match self {
            Fallback::NoAssets => concat!(
                "<!doctype html><html><head><meta charset=\"utf-8\"><title>No assets</title></head>",
                "<body style=\"background:#000;color:#ccc;font-family:sans-serif;display:flex;",
                "align-items:center;justify-content:center;height:100vh;margin:0\">",
                "<h1>No assets to show</h1></body></html>"
            ),
            Fallback::FirstBoot => concat!(
                "<!doctype html><html><head><meta charset=\"utf-8\"><title>Welcome</title></head>",
                "<body style=\"background:#000;color:#ccc;font-family:sans-serif;display:flex;",
                "align-items:center;justify-content:center;height:100vh;margin:0\">",
                "<h1>Open the admin panel to configure this display</h1></body></html>"
            ),
        }
    }
}

/// Who is going to load a show-event's `src`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// The renderer on this device.
    Local,
    /// Paired secondaries on the network.
    Remote,
}

/// Turns internal asset URLs into something the renderer can fetch.
#[derive(Debug, Clone)]
pub struct UrlResolver {
    local_base: String,
    public_base: String,
}

impl UrlResolver {
    pub fn new(local_base: impl Into<String>, public_base: Option<String>) -> Self {
        let local_base = local_base.into();
        let public_base = public_base.unwrap_or_else(|| local_base.clone());
        Self {
            local_base,
            public_base,
        }
    }

    fn base(&self, audience: Audience) -> &str {
        match audience {
            Audience::Local => &self.local_base,
            Audience::Remote => &self.public_base,
        }
    }

    /// `file:<name>` becomes `<base>/uploaded/<name>`; anything else passes
    /// through untouched.
    pub fn resolve(&self, url: &str, audience: Audience) -> String {
        match url.strip_prefix(crate::asset::FILE_SCHEME) {
            Some(name) => join_path(self.base(audience), &["uploaded", name]),
            None => url.to_string(),
        }
    }

    pub fn fallback(&self, fallback: Fallback, audience: Audience) -> String {
        join_path(self.base(audience), &["fallback", fallback.slug()])
    }
}

fn join_path(base: &str, segments: &[&str]) -> String {
    match url::Url::parse(base) {
        Ok(mut u) => {
            if let Ok(mut path) = u.path_segments_mut() {
                path.pop_if_empty().extend(segments);
            }
            u.to_string()
        }
        Err(_) => format!("{}/{}", base.trim_end_matches('/'), segments.join("/")),
    }
}

/// Minimal payload needed to render one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowEvent {
    pub src: String,
    #[serde(default)]
    pub container: MediaType,
    #[serde(default)]
    pub fit: Fit,
    #[serde(default)]
    pub background_color: Option<String>,
}

impl ShowEvent {
    pub fn for_asset(asset: &Asset, urls: &UrlResolver, audience: Audience) -> Self {
        Self {
            src: urls.resolve(&asset.url, audience),
            container: asset.media_type,
            fit: asset.fit,
            background_color: asset.background_color.clone(),
        }
    }

    pub fn for_fallback(fallback: Fallback, urls: &UrlResolver, audience: Audience) -> Self {
        Self {
            src: urls.fallback(fallback, audience),
            container: MediaType::Web,
            fit: Fit::default(),
            background_color: None,
        }
    }

    /// Fields of the event without the `target` envelope.
    pub fn payload(&self) -> Value {
        json!({
            "src": self.src,
            "container": self.container,
            "fit": self.fit,
            "background_color": self.background_color,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uploaded_files_resolve_per_audience() {
        let urls = UrlResolver::new(
            "http://localhost:8080",
            Some("https://kiosk-1.lan".to_string()),
        );
        assert_eq!(
            urls.resolve("file:promo video.mp4", Audience::Local),
            "http://localhost:8080/uploaded/promo%20video.mp4"
        );
        assert_eq!(
            urls.resolve("file:a.png", Audience::Remote),
            "https://kiosk-1.lan/uploaded/a.png"
        );
        assert_eq!(
            urls.resolve("https://example.com/x", Audience::Remote),
            "https://example.com/x"
        );
    }

    #[test]
    fn fallback_pages_are_web_content() {
        let urls = UrlResolver::new("http://localhost:8080/", None);
        let ev = ShowEvent::for_fallback(Fallback::FirstBoot, &urls, Audience::Remote);
        assert_eq!(ev.src, "http://localhost:8080/fallback/first-boot");
        assert_eq!(ev.container, MediaType::Web);
        assert_eq!(Fallback::from_slug("no-assets"), Some(Fallback::NoAssets));
        assert_eq!(Fallback::from_slug("other"), None);
    }
}
