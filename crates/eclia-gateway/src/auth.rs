//! Bearer-token auth for the loopback/LAN HTTP API (spec §6).

use eclia_core::{AuthConfig, AuthMode, Error, Result};

#[derive(Clone, Debug)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    pub token: Option<String>,
}

impl ResolvedAuth {
    pub fn from_config(config: &AuthConfig, env_token: Option<String>) -> Self {
        let token = config.token.clone().or(env_token);
        Self {
            mode: config.mode.clone(),
            token,
        }
    }

    pub fn verify_token(&self, provided: Option<&str>) -> Result<()> {
        match self.mode {
            AuthMode::None => Ok(()),
            AuthMode::Token => {
                let expected = self
                    .token
                    .as_deref()
                    .ok_or_else(|| Error::invalid_request("no token configured"))?;
                let provided =
                    provided.ok_or_else(|| Error::invalid_request("authorization token required"))?;
                if !constant_time_eq::constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
                    return Err(Error::invalid_request("invalid token"));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_auth_accepts_matching_and_rejects_mismatched() {
        let auth = ResolvedAuth {
            mode: AuthMode::Token,
            token: Some("test-token-123".into()),
        };
        assert!(auth.verify_token(Some("test-token-123")).is_ok());
        assert!(auth.verify_token(Some("wrong-token")).is_err());
        assert!(auth.verify_token(None).is_err());
    }

    #[test]
    fn no_auth_accepts_anything() {
        let auth = ResolvedAuth {
            mode: AuthMode::None,
            token: None,
        };
        assert!(auth.verify_token(None).is_ok());
        assert!(auth.verify_token(Some("anything")).is_ok());
    }
}
