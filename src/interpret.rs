use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::models::MatchStatus;

// ── Constants ────────────────────────────────────────────────────────────────

/// Garment keywords in priority order. The first one found in a reply wins,
/// regardless of where it appears in the text.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "blazer",
    "shoes",
    "jeans",
    "jacket",
    "dress",
    "hat",
    "shirt",
    "coat",
    "sneakers",
    "turtleneck",
];
pub const DEFAULT_KEYWORD: &str = "jacket";
pub const DEFAULT_NEGATION_MARKERS: &[&str] = &["don\u{2019}t"];
pub const DEFAULT_MARKETPLACE: &str = "amazon.com";
pub const DEFAULT_TRACKING_ID: &str = "stylesyncapp-20";

const MATCH_NEEDLE: &str = "match";
const SENTENCE_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];
const HORIZONTAL_SPACE: &[char] = &[' ', '\t'];

// Characters that end a URL embedded in prose or markdown.
const URL_BODY: &str = r#"[^\s()\[\]{}<>"'`*]"#;

// ── Lazy static regexes ──────────────────────────────────────────────────────

static MARKDOWN_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]\n]*\]\([^)\s]*\)").unwrap());

static BARE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)\b(?:https?://|www\.){}+", URL_BODY)).unwrap());

static TRAILING_PUNCT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s.:;,\-\x{2013}\x{2014}]+$").unwrap());

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum InterpreterError {
    #[error("invalid marketplace search URL: {0}")]
    SearchUrl(#[from] url::ParseError),
    #[error("invalid marketplace domain: {0}")]
    Domain(#[from] regex::Error),
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    pub marketplace_domain: String,
    pub search_url: String,
    pub search_key: String,
    pub tracking_key: String,
    pub tracking_id: String,
    pub keywords: Vec<String>,
    pub default_keyword: String,
    pub negation_markers: Vec<String>,
}

impl InterpreterConfig {
    pub fn for_marketplace(domain: &str, tracking_id: &str) -> Self {
        let domain = domain.trim().trim_start_matches("www.").to_lowercase();
        Self {
            search_url: format!("https://www.{}/s", domain),
            marketplace_domain: domain,
            search_key: "k".to_string(),
            tracking_key: "tag".to_string(),
            tracking_id: tracking_id.to_string(),
            keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            default_keyword: DEFAULT_KEYWORD.to_string(),
            negation_markers: DEFAULT_NEGATION_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self::for_marketplace(DEFAULT_MARKETPLACE, DEFAULT_TRACKING_ID)
    }
}

// ── Public result type ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSource {
    /// Product URL found in the analysis reply.
    Reply,
    /// Product URL found by a follow-up lookup request.
    Lookup,
    /// Marketplace search for the highlighted item.
    SearchFallback,
}

#[derive(Debug, Clone)]
pub struct ParsedResult {
    pub display_text: String,
    pub match_status: MatchStatus,
    pub highlighted_item: String,
    pub affiliate_url: String,
    pub link_source: LinkSource,
}

// ── Interpreter ──────────────────────────────────────────────────────────────

/// Turns a free-text styling reply into a [`ParsedResult`].
///
/// Every operation is a pure function of its input and the configuration
/// captured at construction; none of them fail. Anything that cannot be
/// parsed degrades to a documented fallback.
#[derive(Debug, Clone)]
pub struct Interpreter {
    config: InterpreterConfig,
    product_url_re: Regex,
    search_url: Url,
    keywords: Vec<String>,
    negation_markers: Vec<String>,
}

impl Interpreter {
    pub fn new(config: InterpreterConfig) -> Result<Self, InterpreterError> {
        let product_url_re = Regex::new(&format!(
            r"(?i)https?://(?:[a-z0-9-]+\.)*{}/{}*",
            regex::escape(&config.marketplace_domain),
            URL_BODY
        ))?;
        let search_url = Url::parse(&config.search_url)?;
        let keywords = config.keywords.iter().map(|k| k.to_lowercase()).collect();
        let negation_markers = config
            .negation_markers
            .iter()
            .map(|m| m.to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();

        Ok(Self {
            config,
            product_url_re,
            search_url,
            keywords,
            negation_markers,
        })
    }

    pub fn extract_result(&self, reply: &str) -> ParsedResult {
        let match_status = self.classify_match(reply);
        let highlighted_item = self.extract_highlighted_item(reply).to_string();

        let (affiliate_url, link_source) = match self.resolve_product_link(reply) {
            Some(url) => (url, LinkSource::Reply),
            None => (
                self.build_fallback_search_url(&highlighted_item),
                LinkSource::SearchFallback,
            ),
        };

        ParsedResult {
            display_text: strip_embedded_links(reply),
            match_status,
            highlighted_item,
            affiliate_url,
            link_source,
        }
    }

    /// `Matched` when the reply mentions "match" and carries no negation marker.
    pub fn classify_match(&self, text: &str) -> MatchStatus {
        let lower = text.to_lowercase();
        let negated = self
            .negation_markers
            .iter()
            .any(|marker| lower.contains(marker.as_str()));

        if lower.contains(MATCH_NEEDLE) && !negated {
            MatchStatus::Matched
        } else {
            MatchStatus::NotMatched
        }
    }

    pub fn extract_highlighted_item(&self, text: &str) -> &str {
        let lower = text.to_lowercase();
        self.keywords
            .iter()
            .find(|keyword| lower.contains(keyword.as_str()))
            .map(String::as_str)
            .unwrap_or(self.config.default_keyword.as_str())
    }

    /// First marketplace URL in `text`, without markdown closers or trailing
    /// sentence punctuation.
    pub fn extract_product_url<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.product_url_re
            .find(text)
            .map(|m| m.as_str().trim_end_matches(SENTENCE_PUNCTUATION))
            .filter(|url| !url.is_empty())
    }

    /// Tagged marketplace product link from `text`, if it has one.
    pub fn resolve_product_link(&self, text: &str) -> Option<String> {
        self.extract_product_url(text)
            .filter(|url| self.is_marketplace_url(url))
            .map(|url| self.add_tracking_tag(url))
    }

    pub fn is_marketplace_url(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(|h| self.is_marketplace_host(h)))
            .unwrap_or(false)
    }

    fn is_marketplace_host(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        let domain = self.config.marketplace_domain.as_str();
        host == domain
            || host
                .strip_suffix(domain)
                .map_or(false, |prefix| prefix.ends_with('.'))
    }

    /// Sets the tracking parameter on marketplace URLs. Any other input,
    /// including strings that do not parse as URLs, is returned unchanged.
    pub fn add_tracking_tag(&self, url: &str) -> String {
        let mut parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(_) => return url.to_string(),
        };
        match parsed.host_str() {
            Some(host) if self.is_marketplace_host(host) => {}
            _ => return url.to_string(),
        }

        let key = self.config.tracking_key.as_str();
        let mut tagged = false;
        let mut pairs: Vec<(String, String)> = Vec::new();
        for (k, v) in parsed.query_pairs().into_owned() {
            if k != key {
                pairs.push((k, v));
            } else if !tagged {
                pairs.push((k, self.config.tracking_id.clone()));
                tagged = true;
            }
        }
        if !tagged {
            pairs.push((key.to_string(), self.config.tracking_id.clone()));
        }

        parsed.query_pairs_mut().clear().extend_pairs(pairs.iter());
        parsed.into()
    }

    pub fn build_fallback_search_url(&self, keyword: &str) -> String {
        let term = keyword.split_whitespace().collect::<Vec<_>>().join(" ");
        let term = if term.is_empty() {
            self.config.default_keyword.as_str()
        } else {
            term.as_str()
        };

        let mut url = self.search_url.clone();
        url.query_pairs_mut()
            .append_pair(&self.config.search_key, term)
            .append_pair(&self.config.tracking_key, &self.config.tracking_id);
        url.into()
    }
}

// ── Display text ─────────────────────────────────────────────────────────────

/// Removes markdown links and bare URLs, drops dangling colons/dashes at the
/// end and closes the text with a single period. The period is appended even
/// after `!` or `?`, so "Great fit!" becomes "Great fit!.".
pub fn strip_embedded_links(text: &str) -> String {
    let without_markdown = remove_links(&MARKDOWN_LINK_RE, text);
    let without_urls = remove_links(&BARE_URL_RE, &without_markdown);
    let stripped = TRAILING_PUNCT_RE.replace(&without_urls, "");
    let stripped = stripped.trim();

    if stripped.is_empty() {
        return String::new();
    }
    format!("{}.", stripped)
}

/// Deletes every match of `re`, keeping sentence punctuation that trails a
/// match and collapsing the pair of spaces a mid-text removal leaves behind.
fn remove_links(re: &Regex, text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for m in re.find_iter(text) {
        let link = m.as_str().trim_end_matches(SENTENCE_PUNCTUATION);
        let resume = m.start() + link.len();
        let before = &text[last..m.start()];

        if text[resume..].starts_with(HORIZONTAL_SPACE) {
            out.push_str(before.trim_end_matches(HORIZONTAL_SPACE));
        } else {
            out.push_str(before);
        }
        last = resume;
    }
    out.push_str(&text[last..]);
    out
}
