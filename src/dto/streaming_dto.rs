use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct StartStreamingPayload {
    #[serde(default)]
    pub project_id: Option<String>,
}

/// Credentials to test; falls back to the stored ones when omitted.
#[derive(Debug, Default, Deserialize)]
pub struct TestConnectionPayload {
    pub server_url: Option<String>,
    pub api_token: Option<String>,
}
