use crate::fetch::Fetcher;
use crate::storage::{KeyValueStore, read_or_miss, write_best_effort};
use crate::tenant::TenantIdentity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};
use url::Url;

pub const ICON_SESSION_KEY: &str = "widget.chat.icon";
pub const BUTTON_COLOR_SESSION_KEY: &str = "widget.chat.btnColor";
pub const DEFAULT_RADIUS: f64 = 50.0;
pub const DEFAULT_ICON_COLOR: &str = "#FFFFFF";

pub const DEFAULT_GLYPH_SVG: &str = r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 24 24" fill="none" stroke="currentColor" stroke-width="2" stroke-linecap="round" stroke-linejoin="round"><path d="M21 15a2 2 0 0 1-2 2H7l-4 4V5a2 2 0 0 1 2-2h14a2 2 0 0 1 2 2z"></path></svg>"#;

/// Anchor of the launcher, frame and bubble along the bottom edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Center,
    #[default]
    Right,
}

impl Position {
    /// Unknown or empty values anchor right.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "left" => Position::Left,
            "center" => Position::Center,
            _ => Position::Right,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Position::Left => "left",
            Position::Center => "center",
            Position::Right => "right",
        }
    }
}

/// Launcher visibility as far as the widget knows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Unknown,
    Visible,
    Hidden,
}

impl Visibility {
    /// Only an explicit `false` hides the launcher.
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(false) => Visibility::Hidden,
            _ => Visibility::Visible,
        }
    }

    pub fn is_hidden(&self) -> bool {
        matches!(self, Visibility::Hidden)
    }
}

/// Launcher icon: an image URL or inline SVG markup, plus corner radius in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IconPayload {
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub svg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
}

impl IconPayload {
    pub fn default_glyph(radius: f64) -> Self {
        Self {
            image_url: String::new(),
            svg: DEFAULT_GLYPH_SVG.to_string(),
            radius: Some(radius),
        }
    }

    /// Whether there is anything the launcher could draw.
    pub fn is_renderable(&self) -> bool {
        !self.image_url.trim().is_empty() || self.svg.contains("<svg")
    }

    /// Color for the close glyph drawn while the chat is open: the icon's
    /// own fill or color attribute, else the button's text color.
    pub fn derived_color(&self) -> String {
        static FILL: OnceLock<Regex> = OnceLock::new();
        static COLOR: OnceLock<Regex> = OnceLock::new();
        let fill = FILL.get_or_init(|| Regex::new(r#"<svg[^>]*\sfill="([^"]+)""#).unwrap());
        let color = COLOR.get_or_init(|| Regex::new(r#"<svg[^>]*\scolor="([^"]+)""#).unwrap());
        [fill, color]
            .iter()
            .filter_map(|re| re.captures(&self.svg))
            .map(|caps| caps[1].to_string())
            .find(|value| value != "none" && value != "currentColor")
            .unwrap_or_else(|| "currentColor".to_string())
    }
}

/// Sets the root fill/color and every non-`none` stroke of an SVG document
/// to `color`.
pub fn colorize_svg(svg: &str, color: &str) -> String {
    static STROKE: OnceLock<Regex> = OnceLock::new();
    let stroke = STROKE.get_or_init(|| Regex::new(r#"stroke="([^"]*)""#).unwrap());
    let rooted = svg.replacen("<svg", &format!("<svg fill=\"{color}\" color=\"{color}\""), 1);
    stroke
        .replace_all(&rooted, |caps: &regex::Captures<'_>| {
            if &caps[1] == "none" {
                caps[0].to_string()
            } else {
                format!("stroke=\"{color}\"")
            }
        })
        .into_owned()
}

/// Launcher appearance as currently rendered.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Appearance {
    pub visible: Visibility,
    pub position: Position,
    pub position_resolved: bool,
    pub button_color: Option<String>,
    pub icon: Option<IconPayload>,
}

/// Remote settings document, one per bot. Each field is read on its own;
/// a mistyped field falls back to its default without affecting the rest.
#[derive(Debug, Default)]
struct RemoteAppearance {
    widget_position: Option<String>,
    chat_button_color: Option<String>,
    widget_radius: Option<f64>,
    widget_icon: Value,
    widget_icon_color: Option<String>,
}

impl RemoteAppearance {
    fn from_value(doc: &Value) -> Self {
        let text = |name: &str| doc.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            widget_position: text("widgetPosition"),
            chat_button_color: text("chatButtonColor"),
            widget_radius: doc.get("widgetRadius").and_then(Value::as_f64),
            widget_icon: doc.get("widgetIcon").cloned().unwrap_or(Value::Null),
            widget_icon_color: text("widgetIconColor"),
        }
    }
}

/// Result of one remote appearance fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum AppearanceOutcome {
    /// Remote says `chatVisible: false`; nothing else was read.
    Hidden,
    Resolved(ResolvedAppearance),
    /// Fetch failed or the document was unusable.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAppearance {
    pub position: Position,
    pub button_color: Option<String>,
    pub radius: f64,
    /// `None` when icon resolution was skipped or nothing resolved.
    pub icon: Option<IconPayload>,
}

/// Fetches remote launcher settings and owns the session-scoped icon and
/// color cache.
pub struct AppearanceLoader {
    fetcher: Arc<dyn Fetcher>,
    session: Arc<dyn KeyValueStore>,
    asset_base: Url,
    database: Url,
}

impl AppearanceLoader {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        session: Arc<dyn KeyValueStore>,
        asset_base: Url,
        database: Url,
    ) -> Self {
        Self {
            fetcher,
            session,
            asset_base,
            database,
        }
    }

    pub fn cached_icon(&self) -> Option<IconPayload> {
        let raw = read_or_miss(self.session.as_ref(), ICON_SESSION_KEY)?;
        serde_json::from_str::<IconPayload>(&raw)
            .ok()
            .filter(IconPayload::is_renderable)
    }

    pub fn cached_color(&self) -> Option<String> {
        read_or_miss(self.session.as_ref(), BUTTON_COLOR_SESSION_KEY).filter(|c| !c.is_empty())
    }

    pub fn persist_icon(&self, icon: &IconPayload) {
        match serde_json::to_string(icon) {
            Ok(json) => write_best_effort(self.session.as_ref(), ICON_SESSION_KEY, &json),
            Err(err) => debug!(?err, "failed to encode launcher icon"),
        }
    }

    pub fn persist_color(&self, color: &str) {
        write_best_effort(self.session.as_ref(), BUTTON_COLOR_SESSION_KEY, color);
    }

    /// One fetch of the tenant's appearance document. With `resolve_icon`
    /// false (icon already restored from the session) only visibility,
    /// position and color are read.
    pub async fn fetch(&self, tenant: &TenantIdentity, resolve_icon: bool) -> AppearanceOutcome {
        let Some(url) = tenant.appearance_url(&self.database) else {
            warn!(db = %self.database, "cannot build appearance url");
            return AppearanceOutcome::Unavailable;
        };
        let doc = match self.fetcher.get_json(&url).await {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%url, %err, "appearance fetch failed; keeping defaults");
                return AppearanceOutcome::Unavailable;
            }
        };
        if !doc.is_object() {
            debug!(%url, "no appearance stored for tenant");
            return AppearanceOutcome::Unavailable;
        }
        if doc.get("chatVisible").and_then(Value::as_bool) == Some(false) {
            return AppearanceOutcome::Hidden;
        }
        let remote = RemoteAppearance::from_value(&doc);

        let radius = remote.widget_radius.unwrap_or(DEFAULT_RADIUS);
        let icon = if resolve_icon {
            self.resolve_icon(&remote, radius).await
        } else {
            None
        };

        AppearanceOutcome::Resolved(ResolvedAppearance {
            position: Position::parse_lenient(remote.widget_position.as_deref().unwrap_or("")),
            button_color: remote.chat_button_color.filter(|c| !c.trim().is_empty()),
            radius,
            icon,
        })
    }

    /// Asset path first, then inline payload.
    async fn resolve_icon(&self, remote: &RemoteAppearance, radius: f64) -> Option<IconPayload> {
        match &remote.widget_icon {
            Value::String(path) if !path.trim().is_empty() => {
                let url = match self.asset_base.join(path.trim()) {
                    Ok(url) => url,
                    Err(err) => {
                        warn!(%path, %err, "invalid icon asset path");
                        return None;
                    }
                };
                match self.fetcher.get_text(&url).await {
                    Ok(svg) => {
                        let color = remote
                            .widget_icon_color
                            .as_deref()
                            .filter(|c| !c.trim().is_empty())
                            .unwrap_or(DEFAULT_ICON_COLOR);
                        Some(IconPayload {
                            image_url: String::new(),
                            svg: colorize_svg(&svg, color),
                            radius: Some(radius),
                        })
                        .filter(IconPayload::is_renderable)
                    }
                    Err(err) => {
                        warn!(%url, %err, "icon asset fetch failed");
                        None
                    }
                }
            }
            Value::Object(map) => {
                let field = |name: &str| {
                    map.get(name)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                Some(IconPayload {
                    image_url: field("imageUrl"),
                    svg: field("svg"),
                    radius: Some(radius),
                })
                .filter(IconPayload::is_renderable)
            }
            _ => None,
        }
    }
}
