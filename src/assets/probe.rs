//! CDN metadata probes
//!
//! Some video CDNs publish a page URL in the article while the playable HLS
//! manifest is only available from a metadata endpoint. A probe rule maps a
//! source URL to that endpoint; the JSON answer's first non-empty `hls`,
//! `mhls` or `url` field replaces the source URL. Any probe failure falls back
//! to the original URL.

use crate::config::ProbeRule;
use crate::{Error, Result};
use regex::Regex;
use url::Url;

const PROBE_FIELDS: [&str; 3] = ["hls", "mhls", "url"];

/// Compiled probe rules
#[derive(Clone, Debug, Default)]
pub struct ProbeRules {
    rules: Vec<(Regex, String)>,
}

impl ProbeRules {
    /// Compile rules, rejecting invalid patterns
    pub fn compile(rules: &[ProbeRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.pattern).map_err(|e| {
                    Error::config(
                        "download.probe_rules",
                        format!("invalid pattern {:?}: {e}", rule.pattern),
                    )
                })?;
                Ok((pattern, rule.probe_template.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Whether no rules are configured
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Probe URL for `source_url`, if a rule matches
    pub fn probe_url(&self, source_url: &str) -> Option<String> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(source_url))
            .map(|(_, template)| template.replace("{url}", &urlencoding::encode(source_url)))
    }

    /// Resolve `source_url` through its probe, or `None` to keep it as is
    pub async fn resolve(&self, client: &reqwest::Client, source_url: &str) -> Option<String> {
        let probe_url = self.probe_url(source_url)?;
        match fetch_probe(client, &probe_url).await {
            Ok(Some(resolved)) => {
                tracing::debug!(source = %source_url, resolved = %resolved, "Probe resolved stream");
                Some(resolved)
            }
            Ok(None) => {
                tracing::debug!(source = %source_url, probe = %probe_url, "Probe returned no stream");
                None
            }
            Err(e) => {
                tracing::warn!(source = %source_url, probe = %probe_url, error = %e, "Probe failed, using original URL");
                None
            }
        }
    }
}

async fn fetch_probe(client: &reqwest::Client, probe_url: &str) -> Result<Option<String>> {
    let response = client.get(probe_url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Http {
            url: probe_url.to_string(),
            status: status.as_u16(),
        });
    }
    let body: serde_json::Value = response.json().await?;
    let Some(candidate) = PROBE_FIELDS.iter().find_map(|field| {
        body.get(field)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }) else {
        return Ok(None);
    };

    let base = Url::parse(probe_url).map_err(|e| Error::Parse {
        url: probe_url.to_string(),
        reason: e.to_string(),
    })?;
    Ok(base.join(candidate).ok().map(String::from))
}
