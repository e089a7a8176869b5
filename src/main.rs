use anyhow::Context;
use chat_widget_loader::bus::TracingChannel;
use chat_widget_loader::clock::SystemClock;
use chat_widget_loader::fetch::HttpFetcher;
use chat_widget_loader::render::HeadlessSurface;
use chat_widget_loader::server::{self, AppState};
use chat_widget_loader::storage::{FileStore, MemoryStore};
use chat_widget_loader::tenant::ScriptTag;
use chat_widget_loader::{Collaborators, HostConfig, LoaderConfig, PageContext, install};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "chat-widget-host", version, about = "Chat widget dev host and probe")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve widget config, appearance and icon assets over HTTP.
    Serve,
    /// Install the widget headlessly for a page and print the launcher state.
    Probe {
        /// URL of the embedding page.
        #[arg(long)]
        page_url: Url,
        /// `data-empresa` attribute of the script tag.
        #[arg(long)]
        company: Option<String>,
        /// `data-bot` attribute of the script tag.
        #[arg(long)]
        bot: Option<String>,
        /// `src` attribute of the script tag.
        #[arg(long)]
        script_src: Option<String>,
        /// Browser language, e.g. `en-US`.
        #[arg(long)]
        language: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve => {
            let config = HostConfig::from_env()?;
            let addr = config.bind_addr;
            tracing::info!(%addr, "starting chat widget host");
            server::run(addr, AppState::new(config)).await?;
        }
        Command::Probe {
            page_url,
            company,
            bot,
            script_src,
            language,
        } => {
            let page = PageContext {
                url: page_url,
                script: ScriptTag {
                    src: script_src,
                    data_company: company,
                    data_bot: bot,
                },
                top_level: true,
                language,
            };
            probe(page).await?;
        }
    }
    Ok(())
}

async fn probe(page: PageContext) -> anyhow::Result<()> {
    let settings = LoaderConfig::from_env()?;
    let persistent = FileStore::open(settings.cache_dir.join("persistent.json"))
        .context("failed to open persistent widget store")?;
    let surface = Arc::new(HeadlessSurface::new());
    let deps = Collaborators {
        fetcher: Arc::new(HttpFetcher::new(settings.fetch_timeout)?),
        persistent: Arc::new(persistent),
        session: Arc::new(MemoryStore::new()),
        clock: Arc::new(SystemClock),
        surface: surface.clone(),
        channel: Arc::new(TracingChannel),
    };

    let installed = install(&settings, page, deps).await?;
    if let Err(err) = installed.appearance_task.await {
        tracing::warn!(?err, "appearance task did not complete");
    }
    let widget = installed.widget;
    let report = json!({
        "widget": widget.snapshot(),
        "surface": surface.snapshot(),
    });
    widget.teardown();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
