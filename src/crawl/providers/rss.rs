use async_trait::async_trait;
use once_cell::sync::OnceCell;
use quick_xml::de::from_str;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use crate::crawl::types::{FetchError, Payload, SourceFetcher};

/// Items kept per poll when no limit is configured.
pub const DEFAULT_ITEM_LIMIT: usize = 50;
const TEXT_MAX_CHARS: usize = 1500;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    title: Option<String>,
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

fn parse_rfc2822_to_unix(ts: &str) -> Option<i64> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
}

/// Normalize text: decode entities, strip tags, collapse whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("static regex"));
    out = re_tags.replace_all(&out, "").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("static regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > TEXT_MAX_CHARS {
        out = out.chars().take(TEXT_MAX_CHARS).collect();
    }
    out
}

// quick-xml only knows the five XML entities
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

/// Parse an RSS 2.0 document into `{ feed, items: [...] }`.
pub fn parse_feed(xml: &str, limit: usize) -> Result<Payload, FetchError> {
    let xml_clean = scrub_html_entities_for_xml(xml);
    let rss: Rss =
        from_str(&xml_clean).map_err(|e| FetchError::Parse(format!("rss xml: {e}")))?;

    let items = rss
        .channel
        .item
        .into_iter()
        .filter_map(|it| {
            let title = normalize_text(it.title.as_deref().unwrap_or_default());
            let text = normalize_text(it.description.as_deref().unwrap_or_default());
            if title.is_empty() && text.is_empty() {
                return None;
            }
            Some(json!({
                "title": title,
                "link": it.link.map(|l| l.trim().to_string()),
                "published_at": it.pub_date.as_deref().and_then(parse_rfc2822_to_unix),
                "text": text,
            }))
        })
        .take(limit)
        .collect::<Vec<_>>();

    Ok(json!({
        "feed": rss.channel.title.map(|t| normalize_text(&t)),
        "count": items.len(),
        "items": items,
    }))
}

enum Mode {
    Fixture(String),
    Http { url: String, client: Client },
}

pub struct RssSource {
    mode: Mode,
    limit: usize,
}

impl RssSource {
    pub fn from_url(url: impl Into<String>, client: Client) -> Self {
        Self {
            mode: Mode::Http {
                url: url.into(),
                client,
            },
            limit: DEFAULT_ITEM_LIMIT,
        }
    }

    /// Serve a fixed document instead of hitting the network.
    pub fn from_fixture(xml: &str) -> Self {
        Self {
            mode: Mode::Fixture(xml.to_string()),
            limit: DEFAULT_ITEM_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        if let Some(n) = limit {
            self.limit = n;
        }
        self
    }
}

#[async_trait]
impl SourceFetcher for RssSource {
    async fn fetch(&self) -> Result<Payload, FetchError> {
        match &self.mode {
            Mode::Fixture(s) => parse_feed(s, self.limit),
            Mode::Http { url, client } => {
                let body = client
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                parse_feed(&body, self.limit)
            }
        }
    }
}
