//! Request header policy and asset blacklist

use crate::config::BlacklistConfig;
use crate::types::AssetRef;
use url::Url;

/// Extra request headers for an asset download
///
/// Some CDNs refuse hot-linked media unless the request looks like it came
/// from the embedding page. Implementations decide which headers to send; the
/// same headers are passed to the transcoder for HLS streams.
pub trait RequestHeaderPolicy: Send + Sync {
    /// Headers for `asset`
    fn headers(&self, asset: &AssetRef) -> Vec<(String, String)>;
}

/// Sends `Referer` and `Origin` derived from the asset's referrer
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferrerPolicy;

impl RequestHeaderPolicy for ReferrerPolicy {
    fn headers(&self, asset: &AssetRef) -> Vec<(String, String)> {
        let Some(referrer) = asset.referrer.as_deref().filter(|r| !r.trim().is_empty()) else {
            return Vec::new();
        };
        let mut headers = vec![("Referer".to_string(), referrer.to_string())];
        if let Ok(url) = Url::parse(referrer) {
            let origin = url.origin();
            if origin.is_tuple() {
                headers.push(("Origin".to_string(), origin.ascii_serialization()));
            }
        }
        headers
    }
}

/// Sends nothing extra
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHeaders;

impl RequestHeaderPolicy for NoHeaders {
    fn headers(&self, _asset: &AssetRef) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Domains and URL fragments that are never downloaded
#[derive(Clone, Debug, Default)]
pub struct AssetBlacklist {
    domains: Vec<String>,
    substrings: Vec<String>,
}

impl AssetBlacklist {
    /// Build from configuration; entries are matched case-insensitively
    pub fn new(config: &BlacklistConfig) -> Self {
        let normalize = |values: &[String]| {
            values
                .iter()
                .map(|v| v.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|v| !v.is_empty())
                .collect()
        };
        Self {
            domains: normalize(&config.domains),
            substrings: normalize(&config.url_substrings),
        }
    }

    /// Whether `url` is blocked; decided without any network access
    pub fn is_blocked(&self, url: &str) -> bool {
        let lowered = url.to_ascii_lowercase();
        if self.substrings.iter().any(|s| lowered.contains(s.as_str())) {
            return true;
        }
        let Some(host) = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        else {
            return false;
        };
        self.domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetKind;

    #[test]
    fn referrer_policy_sends_referer_and_origin() {
        let mut asset = AssetRef::new("https://cdn.example.com/a.jpg", AssetKind::Image, 1);
        assert!(ReferrerPolicy.headers(&asset).is_empty());

        asset.referrer = Some("https://news.example.com:8443/a-1.htm?x=1".to_string());
        assert_eq!(
            ReferrerPolicy.headers(&asset),
            vec![
                (
                    "Referer".to_string(),
                    "https://news.example.com:8443/a-1.htm?x=1".to_string()
                ),
                ("Origin".to_string(), "https://news.example.com:8443".to_string()),
            ]
        );
    }

    #[test]
    fn blacklist_matches_subdomains_and_substrings_only() {
        let blacklist = AssetBlacklist::new(&BlacklistConfig {
            domains: vec!["doubleclick.net".to_string(), ".Ads.Example".to_string()],
            url_substrings: vec!["/widgets/".to_string()],
        });

        assert!(blacklist.is_blocked("https://doubleclick.net/pixel.gif"));
        assert!(blacklist.is_blocked("https://static.doubleclick.net/x.png"));
        assert!(blacklist.is_blocked("https://ads.example/banner.jpg"));
        assert!(blacklist.is_blocked("https://cdn.example.com/Widgets/poll.png"));
        assert!(!blacklist.is_blocked("https://notdoubleclick.net/x.png"));
        assert!(!blacklist.is_blocked("https://cdn.example.com/a.jpg"));
        assert!(!blacklist.is_blocked("not a url"));
    }
}
