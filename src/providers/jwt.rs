//! User provider backed by gateway-issued JWTs.

use gateway_core::{JwtError, JwtValidator};
use tracing::debug;

use super::{ProviderError, UserProvider};
use crate::principal::UserPrincipal;

/// Resolves users from HS256 tokens issued for the calling app.
#[derive(Clone)]
pub struct JwtUserProvider {
    validator: JwtValidator,
}

impl JwtUserProvider {
    #[must_use]
    pub const fn new(validator: JwtValidator) -> Self {
        Self { validator }
    }
}

#[tonic::async_trait]
impl UserProvider for JwtUserProvider {
    async fn get_token_user(
        &self,
        request_id: &str,
        app_id: &str,
        token: &str,
    ) -> Result<UserPrincipal, ProviderError> {
        let app = (!app_id.is_empty()).then_some(app_id);

        let info = self
            .validator
            .validate(token, app)
            .map_err(|e: JwtError| ProviderError::rejected(e.to_string()))?;

        debug!(request_id, user_id = %info.id, "Token accepted");

        Ok(UserPrincipal {
            id: info.id.parse().unwrap_or_default(),
            user_id: info.id,
            name: info.name,
            backend: false,
            attrs: info.attrs,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration;
    use gateway_core::UserInfo;
    use secrecy::SecretString;

    use super::*;

    fn validator() -> JwtValidator {
        JwtValidator::new(&SecretString::from("test_secret_key_minimum_32_chars!"), "gateway")
    }

    #[tokio::test]
    async fn resolves_tokens_for_the_issuing_app() {
        let validator = validator();
        let user = UserInfo {
            id: "42".to_string(),
            name: "Ada".to_string(),
            attrs: BTreeMap::new(),
        };
        let token = validator.issue("app-1", &user, Duration::minutes(5)).unwrap();
        let provider = JwtUserProvider::new(validator);

        let principal = provider
            .get_token_user("rq_1", "app-1", &token)
            .await
            .unwrap();
        assert_eq!(principal.id, 42);
        assert_eq!(principal.user_id, "42");
        assert_eq!(principal.name, "Ada");

        let err = provider.get_token_user("rq_1", "app-2", &token).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }
}
