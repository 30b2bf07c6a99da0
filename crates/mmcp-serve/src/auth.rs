use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mmcp_session::AuthMethod;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or invalid credentials")]
    Unauthorized,
}

/// Identity attached to an accepted upstream request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub auth_method: AuthMethod,
}

/// External authentication seam. The OAuth/API-key service implements this;
/// the gateway only consumes the resolved identity.
#[async_trait]
pub trait AuthResolver: Send + Sync {
    /// `bearer` is the token from `Authorization: Bearer ...`, `api_key` the
    /// `X-API-Key` header value.
    async fn resolve(
        &self,
        bearer: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<AuthContext, AuthError>;
}

/// Accepts everything; for deployments that terminate auth upstream.
pub struct OpenResolver;

#[async_trait]
impl AuthResolver for OpenResolver {
    async fn resolve(
        &self,
        _bearer: Option<&str>,
        _api_key: Option<&str>,
    ) -> Result<AuthContext, AuthError> {
        Ok(AuthContext {
            client_id: None,
            user_id: None,
            auth_method: AuthMethod::None,
        })
    }
}

/// Static key table: API keys and bearer tokens mapped to client ids.
pub struct StaticKeyResolver {
    api_keys: HashMap<String, String>,
    bearer_tokens: HashMap<String, String>,
}

impl StaticKeyResolver {
    pub fn new(
        api_keys: HashMap<String, String>,
        bearer_tokens: HashMap<String, String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            api_keys,
            bearer_tokens,
        })
    }
}

#[async_trait]
impl AuthResolver for StaticKeyResolver {
    async fn resolve(
        &self,
        bearer: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<AuthContext, AuthError> {
        if let Some(token) = bearer {
            if let Some(client_id) = self.bearer_tokens.get(token) {
                return Ok(AuthContext {
                    client_id: Some(client_id.clone()),
                    user_id: Some(client_id.clone()),
                    auth_method: AuthMethod::Oauth,
                });
            }
        }
        if let Some(key) = api_key {
            if let Some(client_id) = self.api_keys.get(key) {
                return Ok(AuthContext {
                    client_id: Some(client_id.clone()),
                    user_id: None,
                    auth_method: AuthMethod::ApiKey,
                });
            }
        }
        Err(AuthError::Unauthorized)
    }
}
