use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for diagnostics information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct DiagnosticsResponse {
    pub n_workspaces: u32,
    pub n_conn: u32,
    pub n_present_users: u32,
    pub n_pending_alarms: u32,
    pub n_identity_cache: u32,
}
