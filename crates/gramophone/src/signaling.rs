//! Join tickets for signaling endpoints.
//!
//! The browser joins the call as a hidden participant. The signaling endpoint
//! only admits it when the join url carries a ticket proving the request came
//! from this orchestrator: a nonce plus an HMAC-SHA256 of `nonce + token`
//! computed with the endpoint's internal secret. The internal secret is
//! distinct from the backend secret used on the control surface.

use crate::auth;
use gramoconf::Registry;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SignalingError {
    #[error("signaling endpoint {0} is not configured")]
    UnknownEndpoint(String),
}

/// Proof of identity appended to the call join url.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinTicket {
    pub random: String,
    pub checksum: String,
}

/// Issue a join ticket for a conversation on the given signaling endpoint.
pub fn issue_ticket(
    registry: &Registry,
    endpoint_url: &str,
    token: &str,
) -> Result<JoinTicket, SignalingError> {
    let signaling = registry
        .signaling_for_url(endpoint_url)
        .ok_or_else(|| SignalingError::UnknownEndpoint(endpoint_url.to_string()))?;

    let random = auth::new_random();
    let checksum = auth::checksum(&signaling.internal_secret, &random, token.as_bytes());

    Ok(JoinTicket { random, checksum })
}

/// Build the url the browser opens to join the call.
///
/// The recording view lives on the origin server; without a ticket the url is
/// left bare and the endpoint decides whether to admit an unauthenticated
/// recording participant.
pub fn join_url(backend_url: &str, token: &str, ticket: Option<&JoinTicket>) -> String {
    let base = backend_url.trim_end_matches('/');
    match ticket {
        Some(ticket) => format!(
            "{}/call/{}/recording?random={}&checksum={}",
            base, token, ticket.random, ticket.checksum
        ),
        None => format!("{}/call/{}/recording", base, token),
    }
}
