//! Handshake policy: origin and subprotocol authorization.
//!
//! Everything in this module is pure. The engine hands over the handshake
//! fields it parsed and receives either the negotiated subprotocol or a
//! [`HandshakeRejection`] it must turn into a refusal.

use crate::error::HandshakeRejection;

/// Header carrying the client's requested subprotocols.
pub const PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Header carrying the client's origin.
pub const ORIGIN_HEADER: &str = "Origin";

/// Picks the first protocol, in client order, that the server allows.
///
/// The order of `allowed` does not matter: the client's listing order is the
/// preference order.
pub fn select_protocol(requested: &[String], allowed: &[String]) -> Option<String> {
    requested
        .iter()
        .find(|protocol| allowed.contains(*protocol))
        .cloned()
}

/// Checks the handshake origin against the allow-list.
///
/// Without an allow-list every origin, including a missing one, is accepted.
/// With an allow-list the origin must be present and match an entry exactly.
pub fn authorize_origin(
    origin: Option<&str>,
    allowed: Option<&[String]>,
) -> Result<(), HandshakeRejection> {
    let Some(allowed) = allowed else {
        return Ok(());
    };

    match origin {
        Some(origin) if allowed.iter().any(|entry| entry == origin) => Ok(()),
        _ => Err(HandshakeRejection::OriginDenied {
            origin: origin.map(str::to_string),
        }),
    }
}

/// Negotiates the subprotocol for a handshake.
///
/// Returns `Ok(None)` when negotiation is disabled, `Ok(Some(_))` with the
/// selected protocol, or a rejection when an allow-list is configured and
/// nothing the client offered is on it.
pub fn authorize_protocol(
    requested: &[String],
    allowed: Option<&[String]>,
) -> Result<Option<String>, HandshakeRejection> {
    let Some(allowed) = allowed else {
        return Ok(None);
    };

    match select_protocol(requested, allowed) {
        Some(protocol) => Ok(Some(protocol)),
        None => Err(HandshakeRejection::ProtocolDenied {
            requested: requested.to_vec(),
        }),
    }
}

/// Splits `Sec-WebSocket-Protocol` header values into individual protocols.
///
/// Each value may hold a comma separated list; entries are trimmed and empty
/// entries dropped.
pub fn parse_protocol_header<'a, I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    values
        .into_iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|protocol| !protocol.is_empty())
        .map(str::to_string)
        .collect()
}
