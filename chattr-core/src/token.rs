//! Session token: one random secret shared by the browser, the MCP bridge,
//! and the wrappers. Persisted so browser tabs survive hub restarts.

use std::path::Path;

use rand::Rng;

use crate::error::Result;

pub const TOKEN_FILE: &str = "session_token";

/// Load the persisted token, or generate and persist a fresh one.
/// `ACCESS_TOKEN` in the environment wins over the persisted value.
pub fn load_or_generate(data_dir: &Path) -> Result<String> {
    if let Ok(token) = std::env::var("ACCESS_TOKEN") {
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    let path = data_dir.join(TOKEN_FILE);
    if let Ok(saved) = std::fs::read_to_string(&path) {
        let saved = saved.trim();
        if !saved.is_empty() {
            return Ok(saved.to_string());
        }
    }

    let token = generate();
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, &token)?;
    Ok(token)
}

pub fn generate() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Browser requests must come from the page we served. A missing Origin
/// header is allowed: non-browser clients (wrappers, curl) carry the token
/// but no Origin.
pub fn origin_allowed(origin: Option<&str>) -> bool {
    match origin {
        None => true,
        Some(origin) => {
            let rest = match origin.strip_prefix("http://") {
                Some(rest) => rest,
                None => return false,
            };
            let host = rest.split(':').next().unwrap_or("");
            matches!(host, "localhost" | "127.0.0.1")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_is_64_hex_chars() {
        let token = generate();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate());
    }

    #[test]
    fn token_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate(dir.path()).unwrap();
        let second = load_or_generate(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn origin_check_accepts_loopback_any_port() {
        assert!(origin_allowed(None));
        assert!(origin_allowed(Some("http://localhost:8300")));
        assert!(origin_allowed(Some("http://127.0.0.1:9999")));
        assert!(origin_allowed(Some("http://localhost")));
    }

    #[test]
    fn origin_check_rejects_remote_and_https() {
        assert!(!origin_allowed(Some("http://evil.example:8300")));
        assert!(!origin_allowed(Some("https://localhost:8300")));
        assert!(!origin_allowed(Some("http://localhost.evil.com:8300")));
    }
}
