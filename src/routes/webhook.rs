use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use bytes::Bytes;
use std::net::SocketAddr;

use crate::{
    dto::log_dto::AcceptedResponse,
    error::Result,
    services::webhook_service::InboundWebhook,
    utils::signature::KOBO_SIGNATURE_HEADER,
    AppState,
};

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// First hop of X-Forwarded-For when behind a proxy, else the socket peer.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|p| p.ip().to_string()))
}

pub async fn kobo_webhook(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>)> {
    let inbound = InboundWebhook {
        body: &body,
        signature: header_str(&headers, KOBO_SIGNATURE_HEADER),
        source_ip: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
        user_agent: header_str(&headers, "user-agent").map(str::to_string),
    };

    let accepted = state.receiver.receive(inbound).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            record_id: accepted.record_id,
            payload_size: accepted.payload_size,
        }),
    ))
}
