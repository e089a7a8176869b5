//! Loader core for an embeddable chat widget.
//!
//! A host page installs the widget with [`widget::install`]; the loader
//! resolves the tenant, loads (and caches) its config, enforces the origin
//! allow-list, draws a launcher through a [`render::RenderSurface`] and talks
//! to the chat sub-application over a [`bus::MessageBus`].

pub mod appearance;
pub mod bubble;
pub mod bus;
pub mod clock;
pub mod config;
pub mod config_loader;
pub mod fetch;
pub mod frame;
pub mod origin;
pub mod render;
pub mod server;
pub mod storage;
pub mod tenant;
pub mod widget;

pub use config::{HostConfig, LoaderConfig};
pub use widget::{Collaborators, Installation, PageContext, Widget, WidgetError, install};
