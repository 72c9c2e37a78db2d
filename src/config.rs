use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_FILES_BASE_URL: &str = "https://www.googleapis.com/drive/v3/files";
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Client id / secret / refresh credential triple used against the identity provider.
#[derive(Clone, Deserialize)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"****")
            .field("refresh_token", &"****")
            .finish()
    }
}

/// Subset of the credentials file written by the consent helper.
#[derive(Debug, Default, Deserialize)]
struct TokensFile {
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// None when neither env vars nor the tokens file supply the full triple.
    pub oauth: Option<OAuthCredentials>,
    pub token_endpoint: String,
    pub files_base_url: String,
    pub admin_key: Option<String>,
    /// 64 hex chars. Seals the cached access token at rest when set.
    pub master_key: Option<String>,
    pub link_retention: Duration,
    pub sweep_interval: Duration,
    pub chunk_size: usize,
}

impl Config {
    /// OAuth triple, or an error naming the variables to set.
    pub fn oauth(&self) -> anyhow::Result<&OAuthCredentials> {
        self.oauth.as_ref().context(
            "upstream credentials missing: set REELGATE_CLIENT_ID, REELGATE_CLIENT_SECRET \
             and REELGATE_REFRESH_TOKEN, or provide REELGATE_TOKENS_FILE",
        )
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    load_from(|key| std::env::var(key).ok())
}

/// Builds the configuration from an arbitrary variable lookup.
pub fn load_from(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
    let tokens_path = env("REELGATE_TOKENS_FILE").unwrap_or_else(|| "tokens.json".into());
    let tokens_file = read_tokens_file(Path::new(&tokens_path))?;

    let client_id = env("REELGATE_CLIENT_ID").or(tokens_file.client_id);
    let client_secret = env("REELGATE_CLIENT_SECRET").or(tokens_file.client_secret);
    let refresh_token = env("REELGATE_REFRESH_TOKEN").or(tokens_file.refresh_token);
    let oauth = match (client_id, client_secret, refresh_token) {
        (Some(client_id), Some(client_secret), Some(refresh_token)) => Some(OAuthCredentials {
            client_id,
            client_secret,
            refresh_token,
        }),
        _ => None,
    };

    let master_key = env("REELGATE_MASTER_KEY").filter(|k| !k.is_empty());
    if let Some(key) = &master_key {
        crate::vault::parse_master_key(key)?;
    }

    let chunk_size = env("REELGATE_CHUNK_SIZE")
        .and_then(|v| v.parse().ok())
        .filter(|&n: &usize| n > 0)
        .unwrap_or(DEFAULT_CHUNK_SIZE);

    Ok(Config {
        port: env("REELGATE_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000),
        database_url: env("DATABASE_URL")
            .unwrap_or_else(|| "sqlite://reelgate.sqlite3?mode=rwc".into()),
        oauth,
        token_endpoint: env("REELGATE_TOKEN_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_TOKEN_ENDPOINT.into()),
        files_base_url: env("REELGATE_FILES_BASE_URL")
            .unwrap_or_else(|| DEFAULT_FILES_BASE_URL.into()),
        admin_key: env("REELGATE_ADMIN_KEY").filter(|k| !k.is_empty()),
        master_key,
        link_retention: Duration::from_secs(
            env("REELGATE_LINK_RETENTION_HOURS")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(24)
                .saturating_mul(3600),
        ),
        sweep_interval: Duration::from_secs(
            env("REELGATE_SWEEP_INTERVAL_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|&s| s > 0)
                .unwrap_or(3600),
        ),
        chunk_size,
    })
}

fn read_tokens_file(path: &Path) -> anyhow::Result<TokensFile> {
    if !path.exists() {
        return Ok(TokensFile::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.entry("REELGATE_TOKENS_FILE".into())
            .or_insert_with(|| "/nonexistent/reelgate-tokens.json".into());
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = load_from(lookup(&[])).unwrap();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.chunk_size, 2 * 1024 * 1024);
        assert_eq!(cfg.link_retention, Duration::from_secs(24 * 3600));
        assert_eq!(cfg.token_endpoint, DEFAULT_TOKEN_ENDPOINT);
        assert!(cfg.oauth.is_none());
        assert!(cfg.oauth().is_err());
    }

    #[test]
    fn test_oauth_triple_requires_all_parts() {
        let cfg = load_from(lookup(&[
            ("REELGATE_CLIENT_ID", "id"),
            ("REELGATE_CLIENT_SECRET", "secret"),
        ]))
        .unwrap();
        assert!(cfg.oauth.is_none());

        let cfg = load_from(lookup(&[
            ("REELGATE_CLIENT_ID", "id"),
            ("REELGATE_CLIENT_SECRET", "secret"),
            ("REELGATE_REFRESH_TOKEN", "refresh"),
        ]))
        .unwrap();
        let oauth = cfg.oauth().unwrap();
        assert_eq!(oauth.client_id, "id");
        assert_eq!(oauth.refresh_token, "refresh");
    }

    #[test]
    fn test_tokens_file_fills_missing_credentials() {
        let dir = std::env::temp_dir().join(format!("reelgate-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.json");
        std::fs::write(
            &path,
            r#"{"client_id":"file-id","client_secret":"file-secret","refresh_token":"file-refresh","user_password":"ignored"}"#,
        )
        .unwrap();

        let path_str = path.to_string_lossy().to_string();
        let cfg = load_from(lookup(&[
            ("REELGATE_TOKENS_FILE", path_str.as_str()),
            ("REELGATE_CLIENT_ID", "env-id"),
        ]))
        .unwrap();
        let oauth = cfg.oauth().unwrap();
        assert_eq!(oauth.client_id, "env-id");
        assert_eq!(oauth.client_secret, "file-secret");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_bad_master_key_is_rejected() {
        assert!(load_from(lookup(&[("REELGATE_MASTER_KEY", "abc")])).is_err());
    }

    #[test]
    fn test_zero_chunk_size_falls_back_to_default() {
        let cfg = load_from(lookup(&[("REELGATE_CHUNK_SIZE", "0")])).unwrap();
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_huge_retention_saturates() {
        let cfg = load_from(lookup(&[(
            "REELGATE_LINK_RETENTION_HOURS",
            "18446744073709551615",
        )]))
        .unwrap();
        assert_eq!(cfg.link_retention, Duration::from_secs(u64::MAX));

        let cfg = load_from(lookup(&[("REELGATE_LINK_RETENTION_HOURS", "48")])).unwrap();
        assert_eq!(cfg.link_retention, Duration::from_secs(48 * 3600));
    }

    #[test]
    fn test_debug_masks_secrets() {
        let creds = OAuthCredentials {
            client_id: "id".into(),
            client_secret: "very-secret".into(),
            refresh_token: "very-refresh".into(),
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("very-secret"));
        assert!(!printed.contains("very-refresh"));
    }
}
