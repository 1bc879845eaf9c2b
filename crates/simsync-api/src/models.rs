// Wire types for the provisioning provider API.
//
// Field names follow the provider's camelCase JSON. Enums stay strings and
// identities stay optional here; the core crate converts them into its
// canonical domain model.

use serde::{Deserialize, Serialize};

/// Response envelope: `{"success": bool, "data": ..., "error": "text"}`.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Full provider-side view of a single line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineDetails {
    pub sim_number: String,
    /// Absent when the line currently has no provisioned identity.
    #[serde(default)]
    pub endpoint_id: Option<String>,
    pub iccid: String,
    #[serde(default)]
    pub imei: Option<String>,
    pub status: String,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub imei_locked: bool,
    /// e.g. `"auto"`, `"lte"`, `"5g"`, `"3g"`.
    pub network_preference: String,
    pub package_id: u32,
    #[serde(default)]
    pub data_usage_gb: f64,
    #[serde(default)]
    pub max_data_gb: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEndpointRequest {
    pub iccid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imei: Option<String>,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedEndpoint {
    pub endpoint_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct FreezeRequest {
    pub freeze: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct ImeiLockRequest<'a> {
    pub iccid: &'a str,
    pub lock: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct NetworkPreferenceRequest<'a> {
    pub preference: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PackageRequest {
    pub package_id: u32,
}
