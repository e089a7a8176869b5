//! Installation and lifecycle of one widget on one page.
//!
//! [`install`] runs the origin gate and builds a [`Widget`]; from then on
//! every input (launcher clicks, bubble clicks, frame events, sub-application
//! messages) is a method on the widget. All mutable launcher state lives in
//! a single [`WidgetState`] record.

use crate::appearance::{
    Appearance, AppearanceLoader, AppearanceOutcome, DEFAULT_RADIUS, IconPayload, Position,
    Visibility,
};
use crate::bubble::{BubbleController, BubbleDecision, ShowContext};
use crate::bus::{HostMessage, MessageBus, SubAppChannel, SubAppMessage};
use crate::clock::Clock;
use crate::config::LoaderConfig;
use crate::config_loader::{ConfigLoader, WidgetConfig};
use crate::fetch::Fetcher;
use crate::frame::FrameController;
use crate::origin::{GateDecision, OriginGate};
use crate::render::{ButtonGlyph, FontSpec, RenderSurface};
use crate::storage::KeyValueStore;
use crate::tenant::{ScriptTag, TenantIdentity};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum WidgetError {
    #[error("page origin {origin} is not allowed to embed this widget")]
    OriginBlocked { origin: String },
    #[error("widget refused to install inside a nested frame")]
    NotTopLevel,
    #[error("cannot build the sub-application address from {base}")]
    InvalidBaseUrl { base: String },
}

/// What the loader knows about the embedding page.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub url: Url,
    pub script: ScriptTag,
    /// False when the page itself is inside another frame.
    pub top_level: bool,
    /// Browser language, e.g. `en-US`.
    pub language: Option<String>,
}

impl PageContext {
    /// Serialized page origin; opaque origins such as `file://` read as
    /// `"null"`, like a browser reports them.
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }
}

/// External collaborators the widget runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    /// Survives reloads: config cache, bubble dismissal.
    pub persistent: Arc<dyn KeyValueStore>,
    /// Cleared with the browsing session: launcher icon and color.
    pub session: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub surface: Arc<dyn RenderSurface>,
    pub channel: Arc<dyn SubAppChannel>,
}

/// Launcher-level state shared by every input handler.
pub struct WidgetState {
    pub appearance: Appearance,
    pub bubble: BubbleController,
    /// Icon the launcher shows while closed.
    pub original_icon: Option<IconPayload>,
    pub icon_ready: bool,
    pub auto_open_enabled: bool,
    pub auto_open_triggered: bool,
}

/// Read-only view for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct WidgetSnapshot {
    pub tenant: TenantIdentity,
    pub page_origin: String,
    pub appearance: Appearance,
    pub bubble_text: String,
    pub frame_open: bool,
    pub frame_loaded: bool,
    pub handshake_ready: bool,
}

/// A successfully installed widget and the task resolving its appearance.
pub struct Installation {
    pub widget: Widget,
    pub appearance_task: JoinHandle<()>,
}

/// Resolves the tenant, loads config, applies the origin gate and, if it
/// passes, builds the launcher and starts the appearance fetch. On any
/// refusal the surface is left untouched.
pub async fn install(
    settings: &LoaderConfig,
    page: PageContext,
    deps: Collaborators,
) -> Result<Installation, WidgetError> {
    if !page.top_level {
        warn!(page = %page.url, "widget loader disabled inside nested frames");
        return Err(WidgetError::NotTopLevel);
    }

    let tenant = TenantIdentity::resolve(&page.script, Some(&page.url), &settings.default_company);
    let span = info_span!("widget_install", company = %tenant.company_id, bot = %tenant.bot_id);

    async move {
        let config = ConfigLoader::new(
            deps.fetcher.clone(),
            deps.persistent.clone(),
            deps.clock.clone(),
            settings.base_url.clone(),
        )
        .load(&tenant)
        .await;

        let page_origin = page.origin();
        if OriginGate::new(&config.allowed_origins).check(&page_origin) == GateDecision::Blocked {
            warn!(origin = %page_origin, "chat widget is blocked for this site");
            return Err(WidgetError::OriginBlocked {
                origin: page_origin,
            });
        }

        let sub_app = tenant
            .sub_app_url(&settings.base_url)
            .ok_or_else(|| WidgetError::InvalidBaseUrl {
                base: settings.base_url.to_string(),
            })?;

        let widget = Widget::build(settings, &page, tenant, page_origin, sub_app, deps);
        widget.mount(&config);
        info!("chat widget installed");

        let appearance_task = {
            let widget = widget.clone();
            tokio::spawn(async move { widget.load_appearance().await }.in_current_span())
        };
        Ok(Installation {
            widget,
            appearance_task,
        })
    }
    .instrument(span)
    .await
}

struct WidgetInner {
    tenant: TenantIdentity,
    page_origin: String,
    surface: Arc<dyn RenderSurface>,
    appearance: AppearanceLoader,
    frame: FrameController,
    bus: Arc<MessageBus>,
    state: Mutex<WidgetState>,
}

/// Handle to an installed widget; cheap to clone.
#[derive(Clone)]
pub struct Widget {
    inner: Arc<WidgetInner>,
}

impl Widget {
    fn build(
        settings: &LoaderConfig,
        page: &PageContext,
        tenant: TenantIdentity,
        page_origin: String,
        sub_app: Url,
        deps: Collaborators,
    ) -> Self {
        let appearance = AppearanceLoader::new(
            deps.fetcher.clone(),
            deps.session.clone(),
            settings.base_url.clone(),
            settings.appearance_url.clone(),
        );
        let frame = FrameController::new(
            deps.surface.clone(),
            sub_app,
            settings.frame_load_timeout,
            settings.close_fallback,
        );
        let bus = MessageBus::new(
            settings.trusted_origin(),
            deps.channel.clone(),
            settings.handshake_timeout,
        );
        let state = WidgetState {
            appearance: Appearance::default(),
            bubble: BubbleController::new(
                deps.persistent.clone(),
                deps.clock.clone(),
                page.language.clone(),
            ),
            original_icon: None,
            icon_ready: false,
            auto_open_enabled: false,
            auto_open_triggered: false,
        };
        Self {
            inner: Arc::new(WidgetInner {
                tenant,
                page_origin,
                surface: deps.surface,
                appearance,
                frame,
                bus,
                state: Mutex::new(state),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, WidgetState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates the shell and paints the launcher from session cache or the
    /// default glyph, before any appearance fetch.
    fn mount(&self, config: &WidgetConfig) {
        let surface = &self.inner.surface;
        surface.mount();
        surface.set_font(&FontSpec::for_family(&config.font_family));

        let mut state = self.state();
        self.apply_position_locked(&mut state, Position::default(), false);

        if let Some(color) = self.inner.appearance.cached_color() {
            surface.set_button_color(&color);
            state.appearance.button_color = Some(color);
        }
        match self.inner.appearance.cached_icon() {
            Some(icon) => {
                debug!("launcher icon restored from session");
                self.apply_icon_locked(&mut state, icon, false);
            }
            None => {
                self.apply_icon_locked(&mut state, IconPayload::default_glyph(DEFAULT_RADIUS), false)
            }
        }

        state.bubble.configure(
            &config.welcome_text,
            config.welcome_labels.clone(),
            config.source_language.as_deref(),
        );
        self.maybe_show_bubble_locked(&mut state);
    }

    /// Fetches remote appearance and applies it. The icon is only resolved
    /// when none was restored from the session.
    pub async fn load_appearance(&self) {
        let resolve_icon = self.inner.appearance.cached_icon().is_none();
        let outcome = self
            .inner
            .appearance
            .fetch(&self.inner.tenant, resolve_icon)
            .await;

        let mut state = self.state();
        match outcome {
            AppearanceOutcome::Hidden => {
                info!("launcher hidden by remote configuration");
                state.appearance.visible = Visibility::Hidden;
                self.sync_visibility_locked(&mut state);
            }
            AppearanceOutcome::Resolved(resolved) => {
                state.appearance.visible = Visibility::Visible;
                self.apply_position_locked(&mut state, resolved.position, true);
                if let Some(color) = &resolved.button_color {
                    self.inner.surface.set_button_color(color);
                    self.inner.appearance.persist_color(color);
                    state.appearance.button_color = Some(color.clone());
                }
                match resolved.icon {
                    Some(icon) => self.apply_icon_locked(&mut state, icon, true),
                    None if resolve_icon => self.apply_icon_locked(
                        &mut state,
                        IconPayload::default_glyph(resolved.radius),
                        false,
                    ),
                    None => {}
                }
            }
            AppearanceOutcome::Unavailable => {
                state.appearance.position_resolved = true;
                self.sync_visibility_locked(&mut state);
            }
        }
    }

    fn apply_icon_locked(&self, state: &mut WidgetState, icon: IconPayload, persist: bool) {
        if !icon.is_renderable() {
            debug!("ignoring launcher icon with nothing to draw");
            return;
        }
        if persist {
            self.inner.appearance.persist_icon(&icon);
        }
        state.appearance.icon = Some(icon.clone());
        state.original_icon = Some(icon);
        state.icon_ready = true;
        self.render_glyph_locked(state);
        self.sync_visibility_locked(state);
    }

    fn render_glyph_locked(&self, state: &WidgetState) {
        let Some(icon) = &state.original_icon else {
            return;
        };
        let glyph = if self.inner.frame.is_open() {
            ButtonGlyph::Close {
                color: icon.derived_color(),
            }
        } else {
            ButtonGlyph::Icon(icon.clone())
        };
        self.inner.surface.set_button_glyph(&glyph);
    }

    /// Sets the anchor on launcher, frame and bubble in a single surface call.
    fn apply_position_locked(&self, state: &mut WidgetState, position: Position, resolved: bool) {
        state.appearance.position = position;
        self.inner.surface.apply_position(position);
        if resolved {
            state.appearance.position_resolved = true;
            self.sync_visibility_locked(state);
        }
    }

    fn sync_visibility_locked(&self, state: &mut WidgetState) {
        if !state.icon_ready {
            return;
        }
        let shown = !state.appearance.visible.is_hidden();
        self.inner.surface.set_button_displayed(shown);
        if !shown {
            self.inner.frame.suppress();
            self.inner.surface.hide_bubble();
            return;
        }
        self.maybe_show_bubble_locked(state);
    }

    fn maybe_show_bubble_locked(&self, state: &mut WidgetState) {
        let ctx = ShowContext {
            frame_open: self.inner.frame.is_open(),
            position_resolved: state.appearance.position_resolved,
            launcher_visible: state.icon_ready && !state.appearance.visible.is_hidden(),
        };
        match state.bubble.maybe_show(ctx) {
            BubbleDecision::Show(text) => self.inner.surface.show_bubble(&text),
            BubbleDecision::Hide => self.inner.surface.hide_bubble(),
            BubbleDecision::Defer => {}
        }
    }

    /// Synchronous half of opening: bubble hidden, frame into layout, close
    /// glyph drawn, open commands queued for the sub-application.
    fn begin_open_locked(&self, state: &mut WidgetState) -> u64 {
        self.inner.surface.hide_bubble();
        let generation = self.inner.frame.begin_open();
        self.render_glyph_locked(state);
        self.inner.bus.send_when_ready(HostMessage::OpenChatWindow);
        self.inner.bus.send_when_ready(HostMessage::ChatOpened);
        generation
    }

    fn begin_close_locked(&self, state: &mut WidgetState) -> u64 {
        let generation = self.inner.frame.begin_close();
        self.render_glyph_locked(state);
        self.maybe_show_bubble_locked(state);
        generation
    }

    /// Opens the chat and waits for the deferred load and reveal.
    pub async fn open_chat(&self) {
        let generation = {
            let mut state = self.state();
            self.begin_open_locked(&mut state)
        };
        self.inner.frame.finish_open(generation).await;
    }

    pub async fn close_chat(&self) {
        let generation = {
            let mut state = self.state();
            self.begin_close_locked(&mut state)
        };
        self.inner.frame.finish_close(generation).await;
    }

    /// Opens synchronously and leaves load and reveal to a task.
    fn start_open(&self) -> JoinHandle<()> {
        let generation = {
            let mut state = self.state();
            self.begin_open_locked(&mut state)
        };
        let widget = self.clone();
        tokio::spawn(async move { widget.inner.frame.finish_open(generation).await })
    }

    /// Closes synchronously and leaves the transition out to a task.
    fn start_close(&self) -> JoinHandle<()> {
        let generation = {
            let mut state = self.state();
            self.begin_close_locked(&mut state)
        };
        let widget = self.clone();
        tokio::spawn(async move { widget.inner.frame.finish_close(generation).await })
    }

    /// Launcher click: toggles the chat. The open flag changes before this
    /// returns; the returned task only finishes the transition.
    pub fn on_launcher_click(&self) -> JoinHandle<()> {
        let (opening, generation) = {
            let mut state = self.state();
            if self.inner.frame.is_open() {
                (false, self.begin_close_locked(&mut state))
            } else {
                (true, self.begin_open_locked(&mut state))
            }
        };
        let widget = self.clone();
        if opening {
            tokio::spawn(async move { widget.inner.frame.finish_open(generation).await })
        } else {
            tokio::spawn(async move { widget.inner.frame.finish_close(generation).await })
        }
    }

    /// Click on the bubble body (not its close control).
    pub fn on_bubble_click(&self) -> JoinHandle<()> {
        self.start_open()
    }

    /// Click on the bubble's close control.
    pub fn on_bubble_close_click(&self) {
        let mut state = self.state();
        state.bubble.dismiss();
        self.inner.surface.hide_bubble();
    }

    /// The frame document fired its load event.
    pub fn on_frame_loaded(&self) {
        self.inner.frame.notify_loaded();
    }

    /// The frame's CSS transition finished.
    pub fn on_frame_transition_end(&self) {
        self.inner.frame.notify_transition_end();
    }

    /// Entry point for `message` events from any origin.
    pub fn handle_message(&self, origin: &str, data: &Value) {
        let Some(message) = self.inner.bus.receive(origin, data) else {
            return;
        };
        debug!(?message, "sub-application message");
        match message {
            SubAppMessage::ChatReady => {
                self.inner.bus.complete_handshake();
                let mut state = self.state();
                if !state.appearance.position_resolved {
                    state.appearance.position_resolved = true;
                    self.sync_visibility_locked(&mut state);
                }
            }
            SubAppMessage::ChatButtonIcon {
                image_url,
                svg,
                radius,
            } => {
                let mut state = self.state();
                self.apply_icon_locked(
                    &mut state,
                    IconPayload {
                        image_url,
                        svg,
                        radius,
                    },
                    true,
                );
            }
            SubAppMessage::ChatButtonStatus { visible } => {
                let mut state = self.state();
                state.appearance.visible = Visibility::from_flag(visible);
                self.sync_visibility_locked(&mut state);
            }
            SubAppMessage::AutoOpenChat { enabled } => {
                let open = {
                    let mut state = self.state();
                    state.auto_open_enabled = enabled == Some(true);
                    if !state.auto_open_enabled {
                        state.auto_open_triggered = false;
                    }
                    let open = state.auto_open_enabled
                        && !state.auto_open_triggered
                        && !state.appearance.visible.is_hidden();
                    if open {
                        state.auto_open_triggered = true;
                    }
                    open
                };
                if open {
                    info!("auto-opening chat");
                    self.start_open();
                }
            }
            SubAppMessage::ChatLanguageChanged { language } => {
                let Some(language) = language else {
                    return;
                };
                let mut state = self.state();
                state.bubble.set_language(&language);
                self.maybe_show_bubble_locked(&mut state);
            }
            SubAppMessage::UpdateChatButtonColor { color } => {
                let Some(color) = color.filter(|c| !c.trim().is_empty()) else {
                    return;
                };
                let mut state = self.state();
                self.inner.surface.set_button_color(&color);
                state.appearance.button_color = Some(color);
            }
            SubAppMessage::UpdateWidgetPosition { position } => {
                let position = Position::parse_lenient(position.as_deref().unwrap_or(""));
                let mut state = self.state();
                self.apply_position_locked(&mut state, position, true);
            }
            SubAppMessage::CloseChatWindow => {
                self.start_close();
            }
            SubAppMessage::RequestExternalOrigin => {
                if !self.inner.bus.reply_external_origin(&self.inner.page_origin) {
                    debug!("external origin already sent");
                }
            }
        }
    }

    /// Cancels the pending handshake wait. The widget stays on the page.
    pub fn teardown(&self) {
        self.inner.bus.close();
    }

    pub fn tenant(&self) -> &TenantIdentity {
        &self.inner.tenant
    }

    pub fn is_open(&self) -> bool {
        self.inner.frame.is_open()
    }

    pub fn snapshot(&self) -> WidgetSnapshot {
        let state = self.state();
        WidgetSnapshot {
            tenant: self.inner.tenant.clone(),
            page_origin: self.inner.page_origin.clone(),
            appearance: state.appearance.clone(),
            bubble_text: state.bubble.text().to_string(),
            frame_open: self.inner.frame.is_open(),
            frame_loaded: self.inner.frame.is_loaded(),
            handshake_ready: self.inner.bus.is_ready(),
        }
    }
}
