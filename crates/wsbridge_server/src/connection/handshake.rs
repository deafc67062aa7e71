//! Handshake fields captured from the HTTP upgrade request.

use crate::error::HandshakeRejection;
use crate::policy::{parse_protocol_header, ORIGIN_HEADER, PROTOCOL_HEADER};
use std::collections::BTreeMap;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};

/// The parts of a client handshake the server keeps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandshakeRequest {
    /// Value of the `Origin` header, if sent
    pub origin: Option<String>,
    /// Requested subprotocols in client order
    pub protocols: Vec<String>,
    /// Every header, keyed by lowercase name
    pub http_fields: BTreeMap<String, String>,
    /// Requested path and query
    pub resource: String,
}

impl HandshakeRequest {
    /// Extracts handshake fields from an upgrade request.
    ///
    /// Headers that repeat are joined with `", "`. Values that are not valid
    /// UTF-8 are skipped.
    pub fn from_http(request: &Request) -> Self {
        let headers = request.headers();

        let origin = headers
            .get(ORIGIN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let protocols = parse_protocol_header(
            headers
                .get_all(PROTOCOL_HEADER)
                .iter()
                .filter_map(|value| value.to_str().ok()),
        );

        let mut http_fields = BTreeMap::new();
        for name in headers.keys() {
            let joined = headers
                .get_all(name)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect::<Vec<_>>()
                .join(", ");
            http_fields.insert(name.as_str().to_string(), joined);
        }

        let resource = request
            .uri()
            .path_and_query()
            .map(|path| path.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self {
            origin,
            protocols,
            http_fields,
            resource,
        }
    }
}

/// Renders a rejection as the HTTP response refusing the upgrade.
///
/// The body carries the WebSocket close code followed by the reason.
pub fn rejection_response(rejection: &HandshakeRejection) -> ErrorResponse {
    let body = format!("{} {}", u16::from(rejection.close_code()), rejection);
    let mut response = ErrorResponse::new(Some(body));
    *response.status_mut() = rejection.http_status();
    response
}
