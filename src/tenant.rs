use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_BOT: &str = "default";

/// Attributes of the `<script>` element that installed the widget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptTag {
    /// Raw `src` attribute, possibly relative to the page.
    pub src: Option<String>,
    /// `data-empresa`
    pub data_company: Option<String>,
    /// `data-bot`
    pub data_bot: Option<String>,
}

/// The `(company, bot)` pair that selects config and appearance. Fixed for
/// the lifetime of the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantIdentity {
    pub company_id: String,
    pub bot_id: String,
    /// Whether the bot id came from the installation rather than the default.
    pub explicit_bot: bool,
}

impl TenantIdentity {
    /// Resolution order per field: script data attribute, script URL query,
    /// page URL query, default.
    pub fn resolve(script: &ScriptTag, page_url: Option<&Url>, default_company: &str) -> Self {
        let script_url = script.src.as_deref().and_then(|src| match page_url {
            Some(base) => base.join(src).ok(),
            None => Url::parse(src).ok(),
        });

        let pick = |attr: Option<&String>, param: &str| -> String {
            attr.map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .or_else(|| query_param(script_url.as_ref(), param))
                .or_else(|| query_param(page_url, param))
                .unwrap_or_default()
        };

        let company = pick(script.data_company.as_ref(), "empresa");
        let bot = pick(script.data_bot.as_ref(), "bot");

        Self {
            company_id: if company.is_empty() {
                default_company.to_string()
            } else {
                company
            },
            explicit_bot: !bot.is_empty(),
            bot_id: if bot.is_empty() {
                DEFAULT_BOT.to_string()
            } else {
                bot
            },
        }
    }

    pub fn new(company_id: impl Into<String>, bot_id: impl Into<String>) -> Self {
        Self {
            company_id: company_id.into(),
            bot_id: bot_id.into(),
            explicit_bot: true,
        }
    }

    /// Persistent cache key for this tenant's widget config.
    pub fn config_cache_key(&self) -> String {
        format!("bot-config-{}-{}", self.company_id, self.bot_id)
    }

    /// `{base}/config/{company}/{bot}.json`
    pub fn config_url(&self, base: &Url) -> Option<Url> {
        let file = format!("{}.json", self.bot_id);
        with_segments(base, &["config", &self.company_id, &file])
    }

    /// `{db}/empresas/{company}/bots/{bot}/config.json?shallow=false`
    pub fn appearance_url(&self, db: &Url) -> Option<Url> {
        let mut url = with_segments(
            db,
            &["empresas", &self.company_id, "bots", &self.bot_id, "config.json"],
        )?;
        url.set_query(Some("shallow=false"));
        Some(url)
    }

    /// Address of the embedded chat document.
    pub fn sub_app_url(&self, base: &Url) -> Option<Url> {
        let mut url = with_segments(base, &["chat.html"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("empresa", &self.company_id);
            if self.explicit_bot {
                query.append_pair("bot", &self.bot_id);
            }
            query.append_pair("hideLocation", "1");
        }
        Some(url)
    }
}

fn query_param(url: Option<&Url>, name: &str) -> Option<String> {
    url?.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Appends percent-encoded path segments to `base`, keeping any base path.
fn with_segments(base: &Url, segments: &[&str]) -> Option<Url> {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    {
        let mut path = url.path_segments_mut().ok()?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    Some(url)
}
