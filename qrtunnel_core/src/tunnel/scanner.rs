//! Text matching on tunnel process output.

use std::sync::Arc;
use url::Url;

use crate::config::TunnelConfig;

/// Pure function from one output line to the public URL it announces, if any.
pub type UrlExtractor = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// What a single output line means for the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Url(String),
    Fatal,
    Other,
}

pub struct LineScanner {
    extractor: UrlExtractor,
    fatal_patterns: Vec<String>,
}

impl LineScanner {
    pub fn new(extractor: UrlExtractor, fatal_patterns: Vec<String>) -> Self {
        Self {
            extractor,
            fatal_patterns: fatal_patterns
                .into_iter()
                .map(|p| p.to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new(
            provider_url_extractor(&config.provider_domain),
            config.fatal_patterns.clone(),
        )
    }

    /// Classify a cleaned line. URL matches win over fatal patterns.
    pub fn scan(&self, line: &str) -> LineEvent {
        if let Some(url) = (self.extractor)(line) {
            return LineEvent::Url(url);
        }
        let lower = line.to_lowercase();
        if self.fatal_patterns.iter().any(|p| lower.contains(p)) {
            return LineEvent::Fatal;
        }
        LineEvent::Other
    }
}

/// Extractor accepting `https://` URLs hosted under `domain` (any https URL when empty).
pub fn provider_url_extractor(domain: &str) -> UrlExtractor {
    let domain = domain.trim().trim_start_matches('.').to_lowercase();
    Arc::new(move |line: &str| extract_https_url(line, &domain))
}

/// First `https://` token in `line` whose host is `domain` or a subdomain of it.
///
/// The URL is returned as written, minus trailing punctuation.
pub fn extract_https_url(line: &str, domain: &str) -> Option<String> {
    line.split_whitespace()
        .filter_map(|token| {
            let start = token.find("https://")?;
            let candidate = token[start..]
                .trim_end_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '/'));
            let parsed = Url::parse(candidate).ok()?;
            let host = parsed.host_str()?.to_lowercase();
            let matches = domain.is_empty()
                || host == domain
                || host.ends_with(&format!(".{}", domain));
            matches.then(|| candidate.to_string())
        })
        .next()
}

/// Decode raw output bytes into a single printable line.
///
/// Invalid UTF-8 is replaced, ANSI escape sequences and control
/// characters are dropped, surrounding whitespace is trimmed.
pub fn clean_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            // CSI: ESC [ params final-byte
            if chars.peek() == Some(&'[') {
                chars.next();
                for next in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&next) {
                        break;
                    }
                }
            }
            continue;
        }
        if c == '\t' {
            out.push(' ');
        } else if !c.is_control() {
            out.push(c);
        }
    }

    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_localhost_run_announcement() {
        let line = "abc123def.lhr.life tunneled with tls termination, https://abc123def.lhr.life";
        assert_eq!(
            extract_https_url(line, "lhr.life"),
            Some("https://abc123def.lhr.life".to_string())
        );
    }

    #[test]
    fn test_ignores_other_domains() {
        let line = "To set up a custom domain see https://admin.localhost.run/";
        assert_eq!(extract_https_url(line, "lhr.life"), None);
        assert_eq!(
            extract_https_url(line, ""),
            Some("https://admin.localhost.run/".to_string())
        );
    }

    #[test]
    fn test_trims_trailing_punctuation() {
        assert_eq!(
            extract_https_url("visit (https://x.lhr.life).", "lhr.life"),
            Some("https://x.lhr.life".to_string())
        );
    }

    #[test]
    fn test_rejects_lookalike_hosts() {
        assert_eq!(extract_https_url("https://evil-lhr.life", "lhr.life"), None);
        assert_eq!(extract_https_url("http://x.lhr.life", "lhr.life"), None);
    }

    #[test]
    fn test_clean_line_strips_controls_and_ansi() {
        let raw = b"\x1b[32mhttps://x.lhr.life\x1b[0m\r\n";
        assert_eq!(clean_line(raw), "https://x.lhr.life");
        assert_eq!(clean_line(b"bad \xff byte"), "bad \u{fffd} byte");
    }

    #[test]
    fn test_scanner_classifies_lines() {
        let scanner = LineScanner::from_config(&TunnelConfig::default());
        assert_eq!(
            scanner.scan("https://q1.lhr.life"),
            LineEvent::Url("https://q1.lhr.life".to_string())
        );
        assert_eq!(
            scanner.scan("nokey@localhost.run: Permission denied (publickey)."),
            LineEvent::Fatal
        );
        assert_eq!(scanner.scan("Welcome to localhost.run!"), LineEvent::Other);
    }

    #[test]
    fn test_custom_extractor() {
        let extractor: UrlExtractor = Arc::new(|line: &str| {
            line.strip_prefix("URL=").map(|u| u.to_string())
        });
        let scanner = LineScanner::new(extractor, vec![]);
        assert_eq!(
            scanner.scan("URL=https://custom.example"),
            LineEvent::Url("https://custom.example".to_string())
        );
    }
}
