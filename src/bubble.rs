//! Promotional bubble anchored to the launcher.
//!
//! The controller decides *whether* and *what* to show; the widget applies
//! the decision to the render surface. Dismissal is kept in the persistent
//! store so it survives reloads for 24 hours.

use crate::clock::{Clock, ONE_DAY_MS};
use crate::storage::{KeyValueStore, read_or_miss, remove_best_effort, write_best_effort};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const BUBBLE_DISMISSED_KEY: &str = "widget.bubble.dismissedAt";
pub const SUPPORTED_LANGUAGES: [&str; 5] = ["es", "en", "fr", "de", "pt"];

/// Lowercased primary subtag if it is a supported language.
pub fn normalize_language(raw: &str) -> Option<String> {
    let primary = raw
        .trim()
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    SUPPORTED_LANGUAGES
        .contains(&primary.as_str())
        .then_some(primary)
}

/// Exact language first, then the fallback language.
pub fn resolve_localized_text(
    labels: &HashMap<String, String>,
    preferred: Option<&str>,
    fallback: Option<&str>,
) -> Option<String> {
    [preferred, fallback]
        .into_iter()
        .flatten()
        .filter_map(|lang| labels.get(lang))
        .map(|text| text.trim())
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

/// What the surface should do with the bubble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BubbleDecision {
    Show(String),
    Hide,
    /// Eligible except that the launcher position is not known yet.
    Defer,
}

/// Launcher state the bubble depends on.
#[derive(Debug, Clone, Copy)]
pub struct ShowContext {
    pub frame_open: bool,
    pub position_resolved: bool,
    pub launcher_visible: bool,
}

#[derive(Debug, Default)]
struct BubbleContent {
    base_text: String,
    labels: HashMap<String, String>,
    source_language: Option<String>,
}

pub struct BubbleController {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    content: Option<BubbleContent>,
    language: Option<String>,
    text: String,
    pending: bool,
}

impl BubbleController {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, language: Option<String>) -> Self {
        Self {
            store,
            clock,
            content: None,
            language: language.as_deref().and_then(normalize_language),
            text: String::new(),
            pending: false,
        }
    }

    /// Sets the base content. Empty welcome text leaves the bubble disabled.
    pub fn configure(
        &mut self,
        welcome_text: &str,
        labels: HashMap<String, String>,
        source_language: Option<&str>,
    ) -> bool {
        let welcome_text = welcome_text.trim();
        if welcome_text.is_empty() {
            return false;
        }
        let labels = labels
            .into_iter()
            .filter_map(|(lang, text)| normalize_language(&lang).map(|lang| (lang, text)))
            .collect();
        self.content = Some(BubbleContent {
            base_text: welcome_text.to_string(),
            labels,
            source_language: source_language.and_then(normalize_language),
        });
        self.recompute();
        true
    }

    /// Switches language and returns the text now in effect (empty = hide).
    /// Unsupported codes keep the current language.
    pub fn set_language(&mut self, lang: &str) -> &str {
        if let Some(lang) = normalize_language(lang) {
            self.language = Some(lang);
        }
        self.recompute();
        &self.text
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    fn recompute(&mut self) {
        self.text = match &self.content {
            None => String::new(),
            Some(content) => {
                let source = content.source_language.as_deref();
                let base = source
                    .and_then(|lang| content.labels.get(lang))
                    .map(|t| t.trim())
                    .filter(|t| !t.is_empty())
                    .unwrap_or(content.base_text.as_str());
                resolve_localized_text(&content.labels, self.language.as_deref(), source)
                    .unwrap_or_else(|| base.to_string())
            }
        };
    }

    /// Whether a dismissal within the last 24 hours is on record. Expired or
    /// unreadable markers are cleared.
    pub fn is_dismissed(&self) -> bool {
        let Some(raw) = read_or_miss(self.store.as_ref(), BUBBLE_DISMISSED_KEY) else {
            return false;
        };
        let Ok(dismissed_at) = raw.trim().parse::<i64>() else {
            remove_best_effort(self.store.as_ref(), BUBBLE_DISMISSED_KEY);
            return false;
        };
        if self.clock.now_ms() - dismissed_at > ONE_DAY_MS {
            debug!(dismissed_at, "bubble dismissal expired");
            remove_best_effort(self.store.as_ref(), BUBBLE_DISMISSED_KEY);
            return false;
        }
        true
    }

    pub fn maybe_show(&mut self, ctx: ShowContext) -> BubbleDecision {
        if self.text.is_empty() || ctx.frame_open || !ctx.launcher_visible || self.is_dismissed() {
            return BubbleDecision::Hide;
        }
        if !ctx.position_resolved {
            self.pending = true;
            return BubbleDecision::Defer;
        }
        self.pending = false;
        BubbleDecision::Show(self.text.clone())
    }

    /// Whether a show was deferred waiting for the position.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn dismiss(&mut self) {
        self.pending = false;
        write_best_effort(
            self.store.as_ref(),
            BUBBLE_DISMISSED_KEY,
            &self.clock.now_ms().to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;
    const HOUR: Duration = Duration::from_secs(3600);

    fn ready() -> ShowContext {
        ShowContext {
            frame_open: false,
            position_resolved: true,
            launcher_visible: true,
        }
    }

    fn controller() -> (BubbleController, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::new());
        let bubble = BubbleController::new(store.clone(), clock.clone(), Some("en-US".into()));
        (bubble, clock, store)
    }

    #[test]
    fn empty_welcome_disables() {
        let (mut bubble, _, _) = controller();
        assert!(!bubble.configure("   ", HashMap::new(), None));
        assert_eq!(bubble.maybe_show(ready()), BubbleDecision::Hide);
    }

    #[test]
    fn dismissal_lasts_a_day() {
        let (mut bubble, clock, store) = controller();
        bubble.configure("Need help?", HashMap::new(), None);
        assert_eq!(bubble.maybe_show(ready()), BubbleDecision::Show("Need help?".into()));

        bubble.dismiss();
        clock.advance(23 * HOUR);
        assert_eq!(bubble.maybe_show(ready()), BubbleDecision::Hide);
        assert!(store.get(BUBBLE_DISMISSED_KEY).unwrap().is_some());

        clock.advance(2 * HOUR);
        assert_eq!(bubble.maybe_show(ready()), BubbleDecision::Show("Need help?".into()));
        assert_eq!(store.get(BUBBLE_DISMISSED_KEY).unwrap(), None);
    }

    #[test]
    fn garbage_marker_is_cleared() {
        let (mut bubble, _, store) = controller();
        store.set(BUBBLE_DISMISSED_KEY, "yesterday").unwrap();
        bubble.configure("Hi", HashMap::new(), None);
        assert!(matches!(bubble.maybe_show(ready()), BubbleDecision::Show(_)));
        assert_eq!(store.get(BUBBLE_DISMISSED_KEY).unwrap(), None);
    }

    #[test]
    fn blocked_by_open_frame_hidden_launcher_and_unresolved_position() {
        let (mut bubble, _, _) = controller();
        bubble.configure("Hi", HashMap::new(), None);
        let open = ShowContext {
            frame_open: true,
            ..ready()
        };
        assert_eq!(bubble.maybe_show(open), BubbleDecision::Hide);
        let hidden = ShowContext {
            launcher_visible: false,
            ..ready()
        };
        assert_eq!(bubble.maybe_show(hidden), BubbleDecision::Hide);
        let unresolved = ShowContext {
            position_resolved: false,
            ..ready()
        };
        assert_eq!(bubble.maybe_show(unresolved), BubbleDecision::Defer);
        assert!(bubble.is_pending());
        assert!(matches!(bubble.maybe_show(ready()), BubbleDecision::Show(_)));
        assert!(!bubble.is_pending());
    }

    #[test]
    fn language_lookup_order() {
        let (mut bubble, _, _) = controller();
        let labels = HashMap::from([
            ("es".to_string(), "Hola".to_string()),
            ("FR".to_string(), "Bonjour".to_string()),
        ]);
        bubble.configure("Hola base", labels, Some("es"));
        // en has no label: falls back to the source language label
        assert_eq!(bubble.text(), "Hola");
        assert_eq!(bubble.set_language("fr-CA"), "Bonjour");
        // unsupported code keeps French
        assert_eq!(bubble.set_language("xx"), "Bonjour");
        assert_eq!(bubble.language(), Some("fr"));
        assert_eq!(bubble.set_language("de"), "Hola");
    }

    #[test]
    fn base_text_without_labels() {
        let (mut bubble, _, _) = controller();
        bubble.configure("Welcome", HashMap::new(), None);
        assert_eq!(bubble.set_language("pt"), "Welcome");
    }

    #[test]
    fn normalizes_languages() {
        assert_eq!(normalize_language(" EN-gb "), Some("en".to_string()));
        assert_eq!(normalize_language("pt_BR"), Some("pt".to_string()));
        assert_eq!(normalize_language("it"), None);
        assert_eq!(normalize_language(""), None);
    }
}
