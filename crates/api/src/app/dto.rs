use serde::Deserialize;

/// Body of `POST /leads/{lead_id}/takeover`.
#[derive(Debug, Deserialize)]
pub struct TakeoverRequest {
    /// Acting user; defaults to the system actor when omitted.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Query string of `GET /queue/export`.
#[derive(Debug, Deserialize, Default)]
pub struct ExportQuery {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}
