//! Handshake token resolution

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::AuthConfig;
use crate::Result;

pub const AUTH_TOKEN_ENV: &str = "MAXBRIDGE_AUTH_TOKEN";
pub const AUTH_HEADER: &str = "x-maxbridge-token";

/// Where the active token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenSource {
    Override,
    Env,
    File,
    Generated,
    None,
}

#[derive(Clone)]
pub struct ResolvedAuth {
    pub token: Option<String>,
    pub source: TokenSource,
    pub token_file: PathBuf,
    pub required: bool,
}

impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAuth")
            .field("configured", &self.token.is_some())
            .field("source", &self.source)
            .field("token_file", &self.token_file)
            .field("required", &self.required)
            .finish()
    }
}

impl ResolvedAuth {
    /// Auth summary for diagnostics; never includes the token.
    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "required": self.required,
            "configured": self.token.is_some(),
            "source": self.source,
            "token_file": self.token_file.display().to_string(),
        })
    }
}

/// Resolve the handshake token: explicit override, then the environment, then the
/// token file, then a freshly generated token persisted to the file.
pub fn resolve_auth_token(config: &AuthConfig, token_file: &Path) -> Result<ResolvedAuth> {
    resolve_with_env(config, token_file, std::env::var(AUTH_TOKEN_ENV).ok())
}

fn resolve_with_env(
    config: &AuthConfig,
    token_file: &Path,
    env_token: Option<String>,
) -> Result<ResolvedAuth> {
    let resolved = |token: String, source: TokenSource| ResolvedAuth {
        token: Some(token),
        source,
        token_file: token_file.to_path_buf(),
        required: config.require_handshake_auth,
    };

    if let Some(token) = non_empty(config.token.clone()) {
        return Ok(resolved(token, TokenSource::Override));
    }
    if let Some(token) = non_empty(env_token) {
        return Ok(resolved(token, TokenSource::Env));
    }
    if token_file.exists() {
        match std::fs::read_to_string(token_file) {
            Ok(content) => {
                if let Some(token) = non_empty(Some(content)) {
                    return Ok(resolved(token, TokenSource::File));
                }
            }
            Err(e) => tracing::warn!("Failed to read auth token file {:?}: {}", token_file, e),
        }
    }

    if config.generate_if_missing {
        let token = generate_token();
        if let Some(parent) = token_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(token_file, format!("{token}\n"))?;
        restrict_permissions(token_file);
        tracing::info!("Generated new bridge auth token at {:?}", token_file);
        return Ok(resolved(token, TokenSource::Generated));
    }

    Ok(ResolvedAuth {
        token: None,
        source: TokenSource::None,
        token_file: token_file.to_path_buf(),
        required: config.require_handshake_auth,
    })
}

/// 64 hex characters
pub fn generate_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Failed to restrict permissions on {:?}: {}", path, e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("auth_token");
        std::fs::write(&file, "from-file\n").unwrap();

        let mut config = AuthConfig::default();
        config.token = Some("override".into());
        let auth = resolve_with_env(&config, &file, Some("from-env".into())).unwrap();
        assert_eq!(auth.token.as_deref(), Some("override"));
        assert_eq!(auth.source, TokenSource::Override);

        config.token = None;
        let auth = resolve_with_env(&config, &file, Some("from-env".into())).unwrap();
        assert_eq!(auth.source, TokenSource::Env);

        let auth = resolve_with_env(&config, &file, Some("  ".into())).unwrap();
        assert_eq!(auth.token.as_deref(), Some("from-file"));
        assert_eq!(auth.source, TokenSource::File);
    }

    #[test]
    fn test_generates_and_persists_token() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("state").join("auth_token");

        let auth = resolve_with_env(&AuthConfig::default(), &file, None).unwrap();
        let token = auth.token.unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(std::fs::read_to_string(&file).unwrap().trim(), token);
        assert_eq!(auth.source, TokenSource::Generated);
    }

    #[test]
    fn test_no_token_when_generation_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuthConfig {
            generate_if_missing: false,
            ..AuthConfig::default()
        };
        let auth = resolve_with_env(&config, &dir.path().join("missing"), None).unwrap();
        assert!(auth.token.is_none());
        assert_eq!(auth.source, TokenSource::None);
        assert!(auth.required);
        assert_eq!(auth.info()["configured"], false);
    }
}
