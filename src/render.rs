use crate::appearance::{IconPayload, Position};
use serde::Serialize;
use std::sync::Mutex;
use tracing::debug;
use url::Url;

pub const AVAILABLE_FONTS: [&str; 6] = [
    "Manrope",
    "Inter",
    "Poppins",
    "Roboto",
    "Playfair Display",
    "Merriweather",
];
const FONT_FALLBACK: &str = "system-ui, -apple-system, Segoe UI, Roboto, sans-serif";

/// What the launcher button currently draws.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ButtonGlyph {
    Icon(IconPayload),
    /// Shown while the chat is open.
    Close { color: String },
}

/// Font settings for the widget's isolated style scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FontSpec {
    pub stack: String,
    /// Stylesheet to load for fonts the widget knows how to fetch.
    pub stylesheet: Option<String>,
}

impl FontSpec {
    pub fn for_family(family: &str) -> Self {
        let family = family.trim();
        if family.is_empty() {
            return Self {
                stack: format!("'Manrope', {FONT_FALLBACK}"),
                stylesheet: None,
            };
        }
        let stylesheet = AVAILABLE_FONTS.contains(&family).then(|| {
            let mut url = Url::parse("https://fonts.googleapis.com/css2").expect("static url");
            url.query_pairs_mut()
                .append_pair("family", &format!("{family}:wght@400;500;600;700"))
                .append_pair("display", "swap");
            url.to_string()
        });
        Self {
            stack: format!("'{family}', {FONT_FALLBACK}"),
            stylesheet,
        }
    }
}

/// Any UI surface that can host the widget: it creates elements inside an
/// isolated style scope and forwards clicks back to the widget.
///
/// Calls are synchronous and must not call back into the widget.
pub trait RenderSurface: Send + Sync {
    /// Creates the isolated root. Nothing else is called before this.
    fn mount(&self);
    fn set_font(&self, font: &FontSpec);
    fn set_button_displayed(&self, displayed: bool);
    fn set_button_glyph(&self, glyph: &ButtonGlyph);
    fn set_button_color(&self, color: &str);
    /// Moves launcher, frame and bubble together.
    fn apply_position(&self, position: Position);
    fn show_bubble(&self, text: &str);
    fn hide_bubble(&self);
    fn set_frame_source(&self, url: &Url);
    /// Whether the frame participates in layout.
    fn set_frame_displayed(&self, displayed: bool);
    /// Whether the frame is scaled/faded in.
    fn set_frame_revealed(&self, revealed: bool);
}

/// Everything a [`HeadlessSurface`] has been told so far.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SurfaceSnapshot {
    pub mounted: bool,
    pub font: Option<FontSpec>,
    pub button_displayed: bool,
    pub glyph: Option<ButtonGlyph>,
    pub button_color: Option<String>,
    pub button_position: Option<Position>,
    pub frame_position: Option<Position>,
    pub bubble_position: Option<Position>,
    pub bubble_text: Option<String>,
    pub frame_source: Option<String>,
    pub frame_source_sets: usize,
    pub frame_displayed: bool,
    pub frame_revealed: bool,
    pub mutations: usize,
}

/// In-memory surface that records state and traces every mutation.
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    state: Mutex<SurfaceSnapshot>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SurfaceSnapshot {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn mutate(&self, op: &str, f: impl FnOnce(&mut SurfaceSnapshot)) {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
            state.mutations += 1;
            debug!(op, mutations = state.mutations, "surface mutation");
        }
    }
}

impl RenderSurface for HeadlessSurface {
    fn mount(&self) {
        self.mutate("mount", |s| s.mounted = true);
    }

    fn set_font(&self, font: &FontSpec) {
        self.mutate("set_font", |s| s.font = Some(font.clone()));
    }

    fn set_button_displayed(&self, displayed: bool) {
        self.mutate("set_button_displayed", |s| s.button_displayed = displayed);
    }

    fn set_button_glyph(&self, glyph: &ButtonGlyph) {
        self.mutate("set_button_glyph", |s| s.glyph = Some(glyph.clone()));
    }

    fn set_button_color(&self, color: &str) {
        self.mutate("set_button_color", |s| s.button_color = Some(color.to_string()));
    }

    fn apply_position(&self, position: Position) {
        self.mutate("apply_position", |s| {
            s.button_position = Some(position);
            s.frame_position = Some(position);
            s.bubble_position = Some(position);
        });
    }

    fn show_bubble(&self, text: &str) {
        self.mutate("show_bubble", |s| s.bubble_text = Some(text.to_string()));
    }

    fn hide_bubble(&self) {
        self.mutate("hide_bubble", |s| s.bubble_text = None);
    }

    fn set_frame_source(&self, url: &Url) {
        self.mutate("set_frame_source", |s| {
            s.frame_source = Some(url.to_string());
            s.frame_source_sets += 1;
        });
    }

    fn set_frame_displayed(&self, displayed: bool) {
        self.mutate("set_frame_displayed", |s| s.frame_displayed = displayed);
    }

    fn set_frame_revealed(&self, revealed: bool) {
        self.mutate("set_frame_revealed", |s| s.frame_revealed = revealed);
    }
}
