// Async HTTP client for the provisioning provider.
//
// Auth: X-API-KEY header
// Every response is wrapped in `{"success", "data", "error"}`; failures carry
// free-text messages which are classified by `crate::classify`.

use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};
use url::Url;

use crate::error::Error;
use crate::models::{
    CreateEndpointRequest, CreatedEndpoint, Envelope, FreezeRequest, ImeiLockRequest,
    LineDetails, NetworkPreferenceRequest, PackageRequest,
};
use crate::transport::TransportConfig;

/// Fallback error body when neither an envelope nor plain text is returned.
#[derive(serde::Deserialize)]
struct MessageBody {
    message: Option<String>,
}

/// Async client for the provisioning provider API.
pub struct ProvisioningClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ProvisioningClient {
    // ── Constructors ─────────────────────────────────────────────────

    /// Build from an API key and transport config.
    ///
    /// Injects `X-API-KEY` as a default header on every request.
    pub fn from_api_key(
        base_url: &str,
        api_key: &SecretString,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        let mut key_value =
            HeaderValue::from_str(api_key.expose_secret()).map_err(|e| Error::Authentication {
                message: format!("invalid API key header value: {e}"),
            })?;
        key_value.set_sensitive(true);
        headers.insert("X-API-KEY", key_value);

        let http = transport.build_client(headers)?;
        let base_url = Self::normalize_base_url(base_url)?;
        Ok(Self { http, base_url })
    }

    /// Wrap an existing `reqwest::Client` (caller manages auth headers).
    pub fn from_reqwest(base_url: &str, http: reqwest::Client) -> Result<Self, Error> {
        let base_url = Self::normalize_base_url(base_url)?;
        Ok(Self { http, base_url })
    }

    /// The provider base URL, always ending in `/`.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn normalize_base_url(raw: &str) -> Result<Url, Error> {
        let mut url = Url::parse(raw)?;
        if url.cannot_be_a_base() {
            return Err(Error::InvalidUrl(
                url::ParseError::RelativeUrlWithCannotBeABaseBase,
            ));
        }
        let path = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{path}/"));
        Ok(url)
    }

    // ── URL builder ──────────────────────────────────────────────────

    /// Append percent-encoded path segments to the base URL.
    fn url(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    // ── HTTP verbs ───────────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, Error> {
        let url = self.url(segments)?;
        debug!("GET {url}");

        let resp = self.http.get(url).send().await?;
        self.handle_data(resp).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<T, Error> {
        let url = self.url(segments)?;
        debug!("POST {url}");

        let resp = self.http.post(url).json(body).send().await?;
        self.handle_data(resp).await
    }

    async fn put<B: Serialize + Sync>(&self, segments: &[&str], body: &B) -> Result<(), Error> {
        let url = self.url(segments)?;
        debug!("PUT {url}");

        let resp = self.http.put(url).json(body).send().await?;
        self.handle_empty(resp).await
    }

    async fn delete(&self, segments: &[&str]) -> Result<(), Error> {
        let url = self.url(segments)?;
        debug!("DELETE {url}");

        let resp = self.http.delete(url).send().await?;
        self.handle_empty(resp).await
    }

    // ── Response handling ────────────────────────────────────────────

    async fn handle_data<T: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T, Error> {
        let envelope: Envelope<T> = self.unwrap_envelope(resp).await?;
        envelope.data.ok_or_else(|| Error::Deserialization {
            message: "successful response without a data payload".into(),
            body: String::new(),
        })
    }

    async fn handle_empty(&self, resp: reqwest::Response) -> Result<(), Error> {
        self.unwrap_envelope::<serde_json::Value>(resp).await?;
        Ok(())
    }

    #[allow(clippy::unused_self)]
    async fn unwrap_envelope<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<Envelope<T>, Error> {
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: "provider rejected the API key".into(),
            });
        }

        let body = resp.text().await?;
        trace!(status = status.as_u16(), len = body.len(), "provider response");

        if !status.is_success() {
            return Err(Error::provider(
                error_text(&body).unwrap_or_else(|| status.to_string()),
                Some(status.as_u16()),
            ));
        }

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(200).collect();
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body: body.clone(),
            }
        })?;

        if envelope.success {
            Ok(envelope)
        } else {
            Err(Error::provider(
                envelope
                    .error
                    .unwrap_or_else(|| "provider reported failure without a message".into()),
                Some(status.as_u16()),
            ))
        }
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Fetch the provider's full view of a line by SIM number.
    pub async fn fetch_line_details(&self, sim_number: &str) -> Result<LineDetails, Error> {
        self.get(&["lines", sim_number]).await
    }

    /// Terminate a provisioned endpoint. One-shot; not idempotent.
    pub async fn terminate_endpoint(&self, endpoint_id: &str) -> Result<(), Error> {
        self.delete(&["endpoints", endpoint_id]).await
    }

    /// Provision a new endpoint for the given binding. One-shot; not idempotent.
    pub async fn create_endpoint(
        &self,
        request: &CreateEndpointRequest,
    ) -> Result<CreatedEndpoint, Error> {
        self.post(&["endpoints"], request).await
    }

    pub async fn set_freeze(&self, endpoint_id: &str, freeze: bool) -> Result<(), Error> {
        self.put(&["endpoints", endpoint_id, "freeze"], &FreezeRequest { freeze })
            .await
    }

    pub async fn set_imei_lock(
        &self,
        endpoint_id: &str,
        iccid: &str,
        lock: bool,
    ) -> Result<(), Error> {
        self.put(
            &["endpoints", endpoint_id, "imei-lock"],
            &ImeiLockRequest { iccid, lock },
        )
        .await
    }

    pub async fn set_network_preference(
        &self,
        endpoint_id: &str,
        preference: &str,
    ) -> Result<(), Error> {
        self.put(
            &["endpoints", endpoint_id, "network-preference"],
            &NetworkPreferenceRequest { preference },
        )
        .await
    }

    pub async fn change_package(&self, endpoint_id: &str, package_id: u32) -> Result<(), Error> {
        self.put(
            &["endpoints", endpoint_id, "package"],
            &PackageRequest { package_id },
        )
        .await
    }
}

/// Pull the provider's message out of an error body: envelope `error`,
/// then `{"message"}`, then the raw text.
fn error_text(body: &str) -> Option<String> {
    if let Ok(envelope) = serde_json::from_str::<Envelope<serde_json::Value>>(body) {
        if let Some(error) = envelope.error {
            return Some(error);
        }
    }
    if let Ok(MessageBody {
        message: Some(message),
    }) = serde_json::from_str::<MessageBody>(body)
    {
        return Some(message);
    }
    let trimmed = body.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}
