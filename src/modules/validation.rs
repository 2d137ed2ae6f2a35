// Pure validation and normalization helpers - no Tauri imports allowed.
// Everything here is string manipulation that can be unit tested directly.

use std::net::Ipv4Addr;
use url::Url;

use crate::modules::model::AccessMode;

/// Longest display name stored for layouts and cards.
pub const MAX_NAME_LEN: usize = 32;

pub const DEFAULT_LAYOUT_NAME: &str = "Untitled Layout";
pub const DEFAULT_CARD_NAME: &str = "Untitled Card";

/// Seconds between scheduled reloads when a card does not say otherwise.
pub const DEFAULT_REFRESH_SECS: u64 = 300;
/// Longest refresh period honored; larger values come from hand-edited files.
pub const MAX_REFRESH_SECS: u64 = 86_400;

pub const MIN_ZOOM: f64 = 0.5;
pub const MAX_ZOOM: f64 = 3.0;

pub const UA_PC: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";
pub const UA_MOBILE: &str = "Mozilla/5.0 (Linux; Android 10; Pixel 4) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Mobile Safari/537.36";

/// Checks whether `input` is something a card can load directly.
///
/// Accepted forms:
/// 1. `http://` or `https://` followed by anything the URL parser accepts.
/// 2. A bare domain (`example.com`, `sub.example.co.uk:8080/path`).
/// 3. `localhost` or `127.0.0.1`, with optional port and path.
/// 4. A dotted IPv4 address, with optional port and path.
///
/// Anything else (free text, other schemes) is routed to a search instead.
pub fn is_valid_url(input: &str) -> bool {
    let input = input.trim();

    if has_http_scheme(input) {
        return match Url::parse(input) {
            Ok(u) => u.scheme() == "http" || u.scheme() == "https",
            Err(_) => false,
        };
    }

    let (host_port, path) = match input.find('/') {
        Some(idx) => (&input[..idx], Some(&input[idx..])),
        None => (input, None),
    };

    if let Some(path) = path {
        if path.chars().any(char::is_whitespace) {
            return false;
        }
    }

    let host = match host_port.split_once(':') {
        Some((host, port)) => {
            if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
                return false;
            }
            host
        }
        None => host_port,
    };

    host == "localhost" || is_ipv4(host) || is_domain(host)
}

fn has_http_scheme(input: &str) -> bool {
    let lower = input.get(..8).unwrap_or(input).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

// Octets of one to three digits, three-digit ones starting with 1 or 2.
fn is_ipv4(host: &str) -> bool {
    let octets: Vec<&str> = host.split('.').collect();
    if octets.len() != 4 {
        return false;
    }
    let well_formed = octets.iter().all(|o| {
        !o.is_empty()
            && o.len() <= 3
            && o.chars().all(|c| c.is_ascii_digit())
            && (o.len() < 3 || o.starts_with('1') || o.starts_with('2'))
    });
    well_formed && host.parse::<Ipv4Addr>().is_ok()
}

fn is_domain(host: &str) -> bool {
    let labels: Vec<&str> = host.split('.').collect();
    let Some((tld, rest)) = labels.split_last() else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }
    let labels_ok = rest
        .iter()
        .all(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    labels_ok && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// Prefixes `https://` onto bare domains; explicit http(s) URLs pass through.
pub fn normalize_url(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// Search fallback for card addresses that are not URLs.
pub fn search_url(keyword: &str) -> String {
    format!("https://www.google.com/search?q={}", urlencoding::encode(keyword))
}

/// The address a card actually loads. Stored values are never rewritten;
/// invalid ones become a search at render time.
pub fn resolve_card_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if is_valid_url(trimmed) {
        normalize_url(trimmed)
    } else {
        search_url(trimmed)
    }
}

pub fn user_agent_for(mode: AccessMode) -> &'static str {
    match mode {
        AccessMode::Pc => UA_PC,
        AccessMode::Mobile => UA_MOBILE,
    }
}

/// Script that strips a page down to the first element matching `selector`.
pub fn isolate_selector_script(selector: &str) -> String {
    // JSON string literals are valid JS string literals.
    let literal = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"
        try {{
            const el = document.querySelector({literal});
            if (el) {{
                document.body.innerHTML = '';
                document.body.appendChild(el);
            }}
        }} catch (e) {{ /* ignore */ }}
        "#
    )
}

/// Truncates to [`MAX_NAME_LEN`] characters, or returns `fallback` when the
/// name is blank.
pub fn sanitize_name(name: &str, fallback: &str) -> String {
    if name.trim().is_empty() {
        return fallback.to_string();
    }
    name.chars().take(MAX_NAME_LEN).collect()
}

pub fn normalize_font_scale(scale: f64) -> f64 {
    if scale.is_finite() && scale > 0.0 {
        scale
    } else {
        1.0
    }
}

/// Root font size as a whole percentage, e.g. `1.25` -> `125`.
pub fn font_scale_percent(scale: f64) -> u32 {
    (normalize_font_scale(scale) * 100.0).round() as u32
}

pub fn effective_zoom(zoom: Option<f64>) -> f64 {
    match zoom {
        Some(z) if z.is_finite() => z.clamp(MIN_ZOOM, MAX_ZOOM),
        _ => 1.0,
    }
}

pub fn effective_refresh_secs(secs: u64) -> u64 {
    if secs == 0 {
        DEFAULT_REFRESH_SECS
    } else {
        secs.min(MAX_REFRESH_SECS)
    }
}
