// ── HTTP gateway ──
//
// `CommandGateway` over `simsync_api::ProvisioningClient`, plus the
// wire-to-domain conversion of line details.

use async_trait::async_trait;
use chrono::Utc;
use simsync_api::{CreateEndpointRequest, LineDetails, ProvisioningClient, TlsMode, TransportConfig};
use tracing::debug;

use super::{CommandGateway, GatewayError};
use crate::config::{ProviderConfig, TlsVerification};
use crate::error::CoreError;
use crate::model::{
    BindingInfo, EndpointId, LineAttributes, LineId, LineSnapshot, NetworkPreference,
};

/// Gateway backed by the provider's HTTP API.
pub struct HttpGateway {
    client: ProvisioningClient,
}

impl HttpGateway {
    pub fn new(config: &ProviderConfig) -> Result<Self, CoreError> {
        let transport = TransportConfig {
            tls: tls_mode(&config.tls),
            timeout: config.request_timeout,
        };
        let client = ProvisioningClient::from_api_key(config.url.as_str(), &config.api_key, &transport)
            .map_err(|e| CoreError::Config {
                message: format!("cannot build provider client: {e}"),
            })?;
        Ok(Self { client })
    }

    pub fn from_client(client: ProvisioningClient) -> Self {
        Self { client }
    }
}

fn tls_mode(tls: &TlsVerification) -> TlsMode {
    match tls {
        TlsVerification::SystemDefaults => TlsMode::System,
        TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
        TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
    }
}

/// Convert provider line details into a snapshot keyed by `line`.
fn snapshot(line: &LineId, details: LineDetails) -> Result<LineSnapshot, GatewayError> {
    let network_preference = details
        .network_preference
        .parse::<NetworkPreference>()
        .map_err(|_| {
            GatewayError::Decode(format!(
                "unknown network preference '{}'",
                details.network_preference
            ))
        })?;

    Ok(LineSnapshot {
        line_id: line.clone(),
        endpoint_id: details
            .endpoint_id
            .filter(|id| !id.is_empty())
            .map(EndpointId::from),
        binding: BindingInfo {
            iccid: details.iccid,
            imei: details.imei.filter(|imei| !imei.is_empty()),
        },
        attributes: LineAttributes {
            suspended: details.suspended,
            imei_locked: details.imei_locked,
            network_preference,
            package_id: details.package_id,
            data_usage_gb: details.data_usage_gb,
            max_data_gb: details.max_data_gb,
            status: details.status,
        },
        fetched_at: Utc::now(),
    })
}

#[async_trait]
impl CommandGateway for HttpGateway {
    async fn fetch_line_details(&self, line: &LineId) -> Result<LineSnapshot, GatewayError> {
        let details = self.client.fetch_line_details(line.as_str()).await?;
        debug!(line = %line, endpoint = ?details.endpoint_id, "fetched line details");
        snapshot(line, details)
    }

    async fn terminate_endpoint(&self, endpoint: &EndpointId) -> Result<(), GatewayError> {
        Ok(self.client.terminate_endpoint(endpoint.as_str()).await?)
    }

    async fn create_endpoint(
        &self,
        binding: &BindingInfo,
        display_name: &str,
    ) -> Result<EndpointId, GatewayError> {
        let created = self
            .client
            .create_endpoint(&CreateEndpointRequest {
                iccid: binding.iccid.clone(),
                imei: binding.imei.clone(),
                display_name: display_name.to_owned(),
            })
            .await?;
        if created.endpoint_id.is_empty() {
            return Err(GatewayError::Decode(
                "create_endpoint returned an empty endpoint id".into(),
            ));
        }
        Ok(EndpointId::from(created.endpoint_id))
    }

    async fn set_freeze(&self, endpoint: &EndpointId, freeze: bool) -> Result<(), GatewayError> {
        Ok(self.client.set_freeze(endpoint.as_str(), freeze).await?)
    }

    async fn set_imei_lock(
        &self,
        endpoint: &EndpointId,
        iccid: &str,
        lock: bool,
    ) -> Result<(), GatewayError> {
        Ok(self
            .client
            .set_imei_lock(endpoint.as_str(), iccid, lock)
            .await?)
    }

    async fn set_network_preference(
        &self,
        endpoint: &EndpointId,
        preference: NetworkPreference,
    ) -> Result<(), GatewayError> {
        let preference: &'static str = preference.into();
        Ok(self
            .client
            .set_network_preference(endpoint.as_str(), preference)
            .await?)
    }

    async fn change_package(
        &self,
        endpoint: &EndpointId,
        package_id: u32,
    ) -> Result<(), GatewayError> {
        Ok(self
            .client
            .change_package(endpoint.as_str(), package_id)
            .await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn details() -> LineDetails {
        LineDetails {
            sim_number: "8944500102198304826".into(),
            endpoint_id: Some("ep-001".into()),
            iccid: "8944500102198304826".into(),
            imei: Some(String::new()),
            status: "Active".into(),
            suspended: true,
            imei_locked: false,
            network_preference: "LTE".into(),
            package_id: 4,
            data_usage_gb: 0.25,
            max_data_gb: 5.0,
        }
    }

    #[test]
    fn snapshot_normalizes_wire_values() {
        let line = LineId::new("8944500102198304826");
        let snap = snapshot(&line, details()).unwrap();

        assert_eq!(snap.endpoint_id, Some(EndpointId::from("ep-001")));
        assert_eq!(snap.binding.imei, None);
        assert_eq!(snap.attributes.network_preference, NetworkPreference::Lte);
        assert!(snap.attributes.suspended);
    }

    #[test]
    fn empty_endpoint_means_no_identity() {
        let line = LineId::new("1");
        let mut d = details();
        d.endpoint_id = Some(String::new());
        assert_eq!(snapshot(&line, d).unwrap().endpoint_id, None);
    }

    #[test]
    fn unknown_network_preference_is_a_decode_error() {
        let mut d = details();
        d.network_preference = "satellite".into();
        assert!(matches!(
            snapshot(&LineId::new("1"), d),
            Err(GatewayError::Decode(_))
        ));
    }

    #[test]
    fn tls_modes_map_one_to_one() {
        assert!(matches!(
            tls_mode(&TlsVerification::SystemDefaults),
            TlsMode::System
        ));
        assert!(matches!(
            tls_mode(&TlsVerification::DangerAcceptInvalid),
            TlsMode::DangerAcceptInvalid
        ));
    }
}
