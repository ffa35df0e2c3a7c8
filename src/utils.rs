//! Utility functions for URLs, hashing, HTTP clients and disk usage

use crate::config::ProxyConfig;
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Longest file extension taken from a URL path
const MAX_EXTENSION_LEN: usize = 5;

/// Canonical form of an article URL used for dedupe keys
///
/// Host is lowercased and the default port dropped (both done by [`Url`]),
/// the fragment is removed and a missing scheme defaults to `https`.
/// Returns `None` for anything that is not an absolute http(s) URL with a host.
pub fn canonicalize_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut url = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let prefixed = match trimmed.strip_prefix("//") {
                Some(rest) => format!("https://{rest}"),
                None => format!("https://{trimmed}"),
            };
            Url::parse(&prefixed).ok()?
        }
        Err(_) => return None,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str().filter(|h| !h.is_empty())?;
    url.set_fragment(None);
    Some(url.to_string())
}

/// Hex sha256 of a string
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Resolve `href` against `base`, dropping fragments
pub fn resolve_url(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let mut url = base.join(href).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

/// File extension from the URL path, or `default`
///
/// Query strings and fragments are ignored. Extensions that are not short
/// alphanumeric strings fall back to `default`.
pub fn extension_from_url(raw: &str, default: &str) -> String {
    let path = match Url::parse(raw) {
        Ok(url) => url.path().to_string(),
        Err(_) => raw.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => default.to_string(),
    }
}

/// Whether a URL points at an HLS manifest
pub fn is_hls_url(raw: &str) -> bool {
    let path = match Url::parse(raw) {
        Ok(url) => url.path().to_ascii_lowercase(),
        Err(_) => raw.to_ascii_lowercase(),
    };
    path.ends_with(".m3u8") || path.contains(".m3u8/")
}

/// Build an HTTP client with the crate's common settings
pub fn build_http_client(
    user_agent: &str,
    timeout: Duration,
    proxy: Option<&ProxyConfig>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(15)));
    if let Some(proxy) = proxy {
        tracing::debug!(proxy = %proxy.masked_url(), "Using HTTP proxy");
        builder = builder.proxy(proxy.to_reqwest()?);
    }
    Ok(builder.build()?)
}

/// Mask all but the last four characters of a secret
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), visible)
}

/// Capacity of a storage volume in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeUsage {
    /// Total size of the filesystem
    pub total_bytes: u64,
    /// Bytes available to unprivileged users
    pub free_bytes: u64,
}

impl VolumeUsage {
    /// Fraction of the volume in use, `(total - free) / total`
    pub fn used_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.total_bytes.saturating_sub(self.free_bytes) as f64 / self.total_bytes as f64
    }
}

/// Read total and available space for the filesystem containing `path`
pub fn get_volume_usage(path: &Path) -> std::io::Result<VolumeUsage> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid null-terminated string, stat is zeroed
        // before the call and only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            #[allow(clippy::useless_conversion)]
            let frsize = u64::from(stat.f_frsize);
            #[allow(clippy::useless_conversion)]
            let total_bytes = u64::from(stat.f_blocks).saturating_mul(frsize);
            #[allow(clippy::useless_conversion)]
            let free_bytes = u64::from(stat.f_bavail).saturating_mul(frsize);
            Ok(VolumeUsage {
                total_bytes,
                free_bytes,
            })
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is null-terminated and every output pointer refers
        // to a live, aligned u64 that is only read after a successful call.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(VolumeUsage {
                total_bytes,
                free_bytes: free_bytes_available,
            })
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "disk usage is not supported on this platform",
        ))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn canonical_url_lowercases_host_and_drops_fragment() {
        assert_eq!(
            canonicalize_url("HTTPS://Example.COM:443/News/a.htm#comments").as_deref(),
            Some("https://example.com/News/a.htm")
        );
    }

    #[test]
    fn canonical_url_defaults_missing_scheme_to_https() {
        assert_eq!(
            canonicalize_url("example.com/a.htm").as_deref(),
            Some("https://example.com/a.htm")
        );
        assert_eq!(
            canonicalize_url("//cdn.example.com/x").as_deref(),
            Some("https://cdn.example.com/x")
        );
    }

    #[test]
    fn canonical_url_rejects_garbage() {
        assert_eq!(canonicalize_url(""), None);
        assert_eq!(canonicalize_url("   "), None);
        assert_eq!(canonicalize_url("mailto:desk@example.com"), None);
        assert_eq!(canonicalize_url("ftp://example.com/file"), None);
    }

    #[test]
    fn hash_is_stable_hex_sha256() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn extension_ignores_query_and_rejects_odd_suffixes() {
        assert_eq!(extension_from_url("https://cdn.x/a/b.PNG?w=300#f", "jpg"), "png");
        assert_eq!(extension_from_url("https://cdn.x/a/b", "jpg"), "jpg");
        assert_eq!(extension_from_url("https://cdn.x/a/b.aspx-thing", "jpg"), "jpg");
        assert_eq!(extension_from_url("https://cdn.x/a/.hidden", "mp4"), "mp4");
    }

    #[test]
    fn hls_detection_looks_at_the_path() {
        assert!(is_hls_url("https://cdn.x/v/master.m3u8?token=1"));
        assert!(!is_hls_url("https://cdn.x/v/file.mp4?m3u8=1"));
    }

    #[test]
    fn resolve_url_skips_fragments_and_scripts() {
        let base = Url::parse("https://example.com/section/").unwrap();
        assert_eq!(
            resolve_url(&base, "../a-1.htm#top").unwrap().as_str(),
            "https://example.com/a-1.htm"
        );
        assert!(resolve_url(&base, "#top").is_none());
        assert!(resolve_url(&base, "javascript:void(0)").is_none());
    }

    #[test]
    fn secrets_keep_only_last_four_characters() {
        assert_eq!(mask_secret("123456:ABCdef"), "*********Cdef");
        assert_eq!(mask_secret("abc"), "***");
    }

    #[test]
    fn used_fraction_handles_empty_volume() {
        let usage = VolumeUsage {
            total_bytes: 0,
            free_bytes: 0,
        };
        assert_eq!(usage.used_fraction(), 0.0);

        let usage = VolumeUsage {
            total_bytes: 100,
            free_bytes: 5,
        };
        assert!((usage.used_fraction() - 0.95).abs() < 1e-9);
    }

    #[test]
    fn volume_usage_of_temp_dir_is_plausible() {
        let temp_dir = TempDir::new().unwrap();
        let usage = get_volume_usage(temp_dir.path()).unwrap();
        assert!(usage.total_bytes > 0, "total size should be positive");
        assert!(usage.free_bytes <= usage.total_bytes);
    }

    #[test]
    fn volume_usage_of_missing_path_is_an_error() {
        assert!(get_volume_usage(Path::new("/nonexistent/path/that/should/not/exist")).is_err());
    }
}
