use convoy_core::config::{AuthMode, ConvoyConfig, CLOSE_INVALID_TOKEN, CLOSE_MISSING_PROJECT};
use convoy_core::{ConversationKey, ConvoyError};
use convoy_protocol::handshake::ConnectParams;

/// Why an upgrade was refused, and the close code that tells the client.
#[derive(Debug)]
pub struct Rejection {
    pub code: u16,
    pub error: ConvoyError,
}

/// Resolve and authorize the upgrade request's parameters.
pub fn admit(params: &ConnectParams, config: &ConvoyConfig) -> Result<ConversationKey, Rejection> {
    let key = params.conversation_key().map_err(|e| Rejection {
        code: CLOSE_MISSING_PROJECT,
        error: ConvoyError::MissingContext(match e {
            convoy_protocol::ProtocolError::MissingParam(name) => name,
            _ => "projectId",
        }),
    })?;
    verify_auth(params, config).map_err(|error| Rejection {
        code: CLOSE_INVALID_TOKEN,
        error,
    })?;
    Ok(key)
}

/// Verify the query-string token against server config.
pub fn verify_auth(params: &ConnectParams, config: &ConvoyConfig) -> Result<(), ConvoyError> {
    match config.gateway.auth.mode {
        AuthMode::None => Ok(()),
        AuthMode::Token => match (&params.token, &config.gateway.auth.token) {
            (Some(given), Some(expected)) if given == expected => Ok(()),
            (_, None) => Err(ConvoyError::AuthFailed(
                "token auth enabled but no token configured".to_string(),
            )),
            _ => Err(ConvoyError::AuthFailed("invalid token".to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(project: Option<&str>, token: Option<&str>) -> ConnectParams {
        ConnectParams {
            conversation_id: Some("c1".into()),
            project_id: project.map(Into::into),
            token: token.map(Into::into),
        }
    }

    fn token_config() -> ConvoyConfig {
        let mut config = ConvoyConfig::default();
        config.gateway.auth.mode = AuthMode::Token;
        config.gateway.auth.token = Some("s3cret".into());
        config
    }

    #[test]
    fn missing_project_closes_with_4400() {
        let rejection = admit(&params(None, None), &ConvoyConfig::default()).unwrap_err();
        assert_eq!(rejection.code, 4400);
        assert!(!rejection.error.recoverable());
    }

    #[test]
    fn wrong_token_closes_with_4401() {
        let config = token_config();
        assert_eq!(admit(&params(Some("p"), Some("nope")), &config).unwrap_err().code, 4401);
        assert_eq!(admit(&params(Some("p"), None), &config).unwrap_err().code, 4401);
        let key = admit(&params(Some("p"), Some("s3cret")), &config).unwrap();
        assert_eq!(key, ConversationKey::new("p", "c1"));
    }

    #[test]
    fn open_mode_ignores_token() {
        assert!(admit(&params(Some("p"), Some("anything")), &ConvoyConfig::default()).is_ok());
    }
}
