//! HTML pages and header values for the share server.

use url::Url;
use url::form_urlencoded::byte_serialize;

use crate::manifest::{Manifest, format_size};

/// Static HTML for the listing page
const INDEX_HTML: &str = include_str!("static/index.html");

/// Static HTML for the 404 / error page
const MESSAGE_HTML: &str = include_str!("static/404.html");

/// Render the listing page: every entry with its size, plus the archive link.
pub fn listing_page(manifest: &Manifest) -> String {
    let rows: String = manifest
        .iter()
        .map(|entry| {
            format!(
                "                <li><a href=\"{}\" download>{}</a><span class=\"size\">{}</span></li>\n",
                escape_html(&file_href(&entry.display_name)),
                escape_html(&entry.display_name),
                format_size(entry.size_bytes)
            )
        })
        .collect();

    INDEX_HTML
        .replace("{{FILE_COUNT}}", &manifest.len().to_string())
        .replace("{{TOTAL_SIZE}}", &format_size(manifest.total_size()))
        .replace("{{FILE_ROWS}}", rows.trim_end())
}

pub fn not_found_page() -> String {
    message_page("Not Found", "This file is not part of the share.")
}

pub fn error_page(message: &str) -> String {
    message_page("Download Failed", message)
}

fn message_page(title: &str, message: &str) -> String {
    MESSAGE_HTML
        .replace("{{TITLE}}", &escape_html(title))
        .replace("{{MESSAGE}}", &escape_html(message))
}

/// Percent-encoded `/files/{name}` path for a display name
pub fn file_href(display_name: &str) -> String {
    match Url::parse("http://localhost/files/") {
        Ok(mut url) => {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().push(display_name);
            }
            url.path().to_string()
        }
        Err(_) => format!("/files/{}", display_name),
    }
}

/// `Content-Disposition` value with an ASCII fallback and an RFC 5987 UTF-8 name
pub fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();

    // byte_serialize writes spaces as '+', which is not valid in ext-value
    let encoded = byte_serialize(file_name.as_bytes())
        .collect::<String>()
        .replace('+', "%20");

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    )
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
