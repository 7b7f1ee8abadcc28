//! FHIR HTTP client sender (§4.9): per-server `reqwest::Client`, with none/basic/bearer/OAuth2
//! client-credentials auth and a cached, auto-refreshed access token.
//!
//! Retries are stage-local (§7): `send()` makes exactly one HTTP request per call and returns a
//! retryable `Http429`/`Server5xx` error to the caller rather than retrying internally. It is the
//! orchestrator's per-message retry loop that requeues with an incremented `retry_count`.

use interop_core::envelope::Envelope;
use interop_core::error::{EngineError, EngineResult, ErrorKind};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;

const TOKEN_REFRESH_SKEW: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub enum FhirAuth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
    },
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Sends one envelope per call to a FHIR base URL, with `$process-message` used when the body is
/// a `Bundle` and plain resource CRUD otherwise (§4.9).
pub struct FhirSender {
    base_url: String,
    http: reqwest::Client,
    auth: FhirAuth,
    cached_token: Mutex<Option<CachedToken>>,
}

impl FhirSender {
    pub fn new(base_url: impl Into<String>, auth: FhirAuth) -> Arc<Self> {
        Arc::new(FhirSender {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            auth,
            cached_token: Mutex::new(None),
        })
    }

    async fn auth_header(&self) -> EngineResult<Option<String>> {
        match &self.auth {
            FhirAuth::None => Ok(None),
            FhirAuth::Bearer { token } => Ok(Some(format!("Bearer {token}"))),
            FhirAuth::Basic { username, password } => {
                let encoded = interop_core::strings::base64_encode(format!("{username}:{password}").as_bytes());
                Ok(Some(format!("Basic {encoded}")))
            }
            FhirAuth::ClientCredentials { .. } => {
                let token = self.client_credentials_token().await?;
                Ok(Some(format!("Bearer {token}")))
            }
        }
    }

    async fn client_credentials_token(&self) -> EngineResult<String> {
        let FhirAuth::ClientCredentials { token_url, client_id, client_secret, scope } = &self.auth else {
            unreachable!("caller checked the auth variant");
        };

        {
            let cached = self.cached_token.lock().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() + TOKEN_REFRESH_SKEW {
                    return Ok(token.value.clone());
                }
            }
        }

        let mut params = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ];
        if let Some(scope) = scope {
            params.push(("scope", scope.as_str()));
        }

        let response = self
            .http
            .post(token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| EngineError::new(ErrorKind::AuthError, format!("token request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::new(
                ErrorKind::AuthError,
                format!("token endpoint returned {}", response.status()),
            ));
        }
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| EngineError::new(ErrorKind::AuthError, format!("malformed token response: {e}")))?;
        let ttl = Duration::from_secs(parsed.expires_in.unwrap_or(300));

        let mut cached = self.cached_token.lock().await;
        *cached = Some(CachedToken {
            value: parsed.access_token.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(parsed.access_token)
    }

    fn target_url(&self, body: &serde_json::Value) -> String {
        let is_bundle = body.get("resourceType").and_then(|v| v.as_str()) == Some("Bundle");
        if is_bundle {
            return format!("{}/$process-message", self.base_url.trim_end_matches('/'));
        }
        let resource_type = body.get("resourceType").and_then(|v| v.as_str()).unwrap_or("Resource");
        match body.get("id").and_then(|v| v.as_str()) {
            Some(id) => format!("{}/{}/{}", self.base_url.trim_end_matches('/'), resource_type, id),
            None => format!("{}/{}", self.base_url.trim_end_matches('/'), resource_type),
        }
    }

    /// Posts `envelope`'s FHIR resource once. A `5xx`/`429` response comes back as a retryable
    /// `EngineError`; any other non-2xx status is terminal (§4.9/§7).
    pub async fn send(&self, envelope: &Envelope) -> EngineResult<()> {
        let body = fhir_body(envelope)?;
        let url = self.target_url(body);

        let mut request = self.http.post(&url).json(body);
        if let Some(header) = self.auth_header().await? {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::new(ErrorKind::TransportError, format!("request failed: {e}")))?;
        let status = response.status();

        if status.is_success() {
            info!(url = %url, status = %status, "FHIR send succeeded");
            return Ok(());
        }

        let body_text = response.text().await.unwrap_or_default();
        let kind = if status.as_u16() == 429 {
            ErrorKind::Http429
        } else if status.is_server_error() {
            ErrorKind::Server5xx
        } else {
            ErrorKind::ApplicationReject
        };
        Err(EngineError::new(kind, format!("FHIR server returned {status}: {body_text}")))
    }
}

fn fhir_body(envelope: &Envelope) -> EngineResult<&serde_json::Value> {
    match &envelope.body.content {
        interop_core::envelope::BodyContent::Fhir(value) => Ok(value),
        _ => Err(EngineError::validation("FHIR sender requires a parsed FHIR body")),
    }
}
