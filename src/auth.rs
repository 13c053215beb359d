//! Auth & request validator.
//!
//! Single entry point used by every protected handler. Mirrors the policy
//! verbatim: missing env, unknown env, no token configured, missing token,
//! wrong token — in that order, each failing with a status class the caller
//! maps directly onto the response.

use crate::config::{Config, EnvironmentConfig};
use crate::error::{Error, Result};
use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

/// Pull the bearer-ish token out of the `Authorization` header. The wire
/// protocol sends the raw token, not a `Bearer <token>` scheme.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Validate `(env, token)` against the resolved config and return the
/// environment's config on success.
pub fn validate<'a>(
    config: &'a Config,
    env: Option<&str>,
    token: Option<&str>,
) -> Result<&'a EnvironmentConfig> {
    let env_name = env.ok_or_else(|| Error::MissingParameter {
        name: "env".to_string(),
    })?;

    let env_config = config
        .environments
        .get(env_name)
        .ok_or_else(|| Error::UnknownEnvironment {
            env: env_name.to_string(),
        })?;

    let effective_token = env_config
        .effective_token(config)
        .ok_or_else(|| Error::BadRequest {
            msg: "no token configured".to_string(),
        })?;

    let provided = token.ok_or_else(|| Error::Forbidden {
        reason: "missing authorization".to_string(),
    })?;

    if !constant_time_eq(effective_token.as_bytes(), provided.as_bytes()) {
        return Err(Error::Forbidden {
            reason: "invalid token".to_string(),
        });
    }

    Ok(env_config)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with_env(token: Option<&str>, top_level_token: Option<&str>) -> Config {
        let mut environments = HashMap::new();
        environments.insert(
            "prod".to_string(),
            EnvironmentConfig {
                token: token.map(|t| t.to_string()),
                deploy_command: Some("./deploy.sh".to_string()),
                ..Default::default()
            },
        );
        Config {
            server: crate::config::ServerConfig::default(),
            token: top_level_token.map(|t| t.to_string()),
            server_url: None,
            environments,
        }
    }

    #[test]
    fn missing_env_is_bad_request() {
        let config = config_with_env(Some("secret"), None);
        let err = validate(&config, None, Some("secret")).unwrap_err();
        assert!(matches!(err, Error::MissingParameter { .. }));
    }

    #[test]
    fn unknown_env_is_bad_request() {
        let config = config_with_env(Some("secret"), None);
        let err = validate(&config, Some("staging"), Some("secret")).unwrap_err();
        assert!(matches!(err, Error::UnknownEnvironment { .. }));
    }

    #[test]
    fn no_token_configured_is_bad_request() {
        let config = config_with_env(None, None);
        let err = validate(&config, Some("prod"), Some("anything")).unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[test]
    fn missing_auth_token_is_forbidden() {
        let config = config_with_env(Some("secret"), None);
        let err = validate(&config, Some("prod"), None).unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }));
    }

    #[test]
    fn wrong_token_is_forbidden() {
        let config = config_with_env(Some("secret"), None);
        let err = validate(&config, Some("prod"), Some("wrong")).unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }));
    }

    #[test]
    fn correct_token_succeeds() {
        let config = config_with_env(Some("secret"), None);
        assert!(validate(&config, Some("prod"), Some("secret")).is_ok());
    }

    #[test]
    fn falls_back_to_top_level_token() {
        let config = config_with_env(None, Some("top-secret"));
        assert!(validate(&config, Some("prod"), Some("top-secret")).is_ok());
    }
}
