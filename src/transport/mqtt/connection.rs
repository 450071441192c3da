//! Pure connection configuration for the MQTT transport
//!
//! This module contains pure functions for building client options from a
//! session URL and classifying connection errors.

use crate::config::SessionSection;
use crate::error::SessionError;
use rumqttc::Transport as RumqttcTransport;
use rumqttc::v5::mqttbytes::v5::ConnectReturnCode;
use rumqttc::v5::{ConnectionError, MqttOptions};
use url::Url;

/// Default broker port for plain MQTT
pub const DEFAULT_MQTT_PORT: u16 = 1883;
/// Default broker port for MQTT over TLS
pub const DEFAULT_MQTTS_PORT: u16 = 8883;

/// How the session is carried to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    WebSocket,
    SecureWebSocket,
}

impl TransportKind {
    /// Transport selected by a URL scheme
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "mqtt" | "tcp" => Some(Self::Tcp),
            "mqtts" | "ssl" => Some(Self::Tls),
            "ws" => Some(Self::WebSocket),
            "wss" => Some(Self::SecureWebSocket),
            _ => None,
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Tcp => DEFAULT_MQTT_PORT,
            Self::Tls => DEFAULT_MQTTS_PORT,
            Self::WebSocket => 80,
            Self::SecureWebSocket => 443,
        }
    }

    fn is_websocket(self) -> bool {
        matches!(self, Self::WebSocket | Self::SecureWebSocket)
    }
}

/// Why the connection failed, from the session's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// Retrying with the same credentials cannot succeed
    Security(String),
    /// Network-level loss; eligible for reconnection
    Recoverable(String),
}

/// Build client options for `url`.
///
/// A fresh client id is generated for every session so a lingering
/// server-side session never collides with a new one. Clean start is forced:
/// subscription continuity is owned by the client-side registry.
pub fn configure_mqtt_options(
    url: &Url,
    config: &SessionSection,
) -> Result<MqttOptions, SessionError> {
    let kind = TransportKind::from_scheme(url.scheme()).ok_or_else(|| {
        SessionError::InvalidUrl(format!("unsupported scheme '{}' in {url}", url.scheme()))
    })?;
    let host = url
        .host_str()
        .ok_or_else(|| SessionError::InvalidUrl(format!("{url}: missing host")))?;
    let port = url.port().unwrap_or(kind.default_port());

    let client_id = format!("{}-{}", config.client_id_prefix, uuid::Uuid::new_v4().simple());

    // Websocket transports take the full URL in place of the host
    let mut mqtt_options = if kind.is_websocket() {
        MqttOptions::new(client_id, url.as_str(), port)
    } else {
        MqttOptions::new(client_id, host, port)
    };

    match kind {
        TransportKind::Tcp => {}
        TransportKind::Tls => {
            mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
        }
        TransportKind::WebSocket => {
            mqtt_options.set_transport(RumqttcTransport::Ws);
        }
        TransportKind::SecureWebSocket => {
            mqtt_options.set_transport(RumqttcTransport::wss_with_default_config());
        }
    }

    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(config.keep_alive());
    mqtt_options.set_clean_start(true);

    Ok(mqtt_options)
}

/// Refusal codes meaning the principal itself was rejected
pub fn is_security_refusal(code: &ConnectReturnCode) -> bool {
    matches!(
        code,
        ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized
            | ConnectReturnCode::Banned
            | ConnectReturnCode::BadAuthenticationMethod
    )
}

/// Classify an event-loop error
pub fn classify_connection_error(error: &ConnectionError) -> ConnectionFailure {
    match error {
        ConnectionError::ConnectionRefused(code) if is_security_refusal(code) => {
            ConnectionFailure::Security(format!("connection refused: {code:?}"))
        }
        other => ConnectionFailure::Recoverable(other.to_string()),
    }
}

impl ConnectionFailure {
    /// Error reported when this failure happens during establishment
    pub fn into_establishment_error(self) -> SessionError {
        match self {
            ConnectionFailure::Security(message) => SessionError::Security(message),
            ConnectionFailure::Recoverable(message) => SessionError::Establishment(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_for(url: &str) -> Result<MqttOptions, SessionError> {
        let url = Url::parse(url).unwrap();
        configure_mqtt_options(&url, &SessionSection::for_url(url.as_str()))
    }

    #[test]
    fn test_tcp_defaults() {
        let options = options_for("mqtt://localhost").unwrap();
        assert_eq!(
            options.broker_address(),
            ("localhost".to_string(), DEFAULT_MQTT_PORT)
        );
        assert!(options.clean_start());
    }

    #[test]
    fn test_explicit_port_wins() {
        let options = options_for("mqtts://broker.example:9999").unwrap();
        assert_eq!(options.broker_address().1, 9999);
    }

    #[test]
    fn test_tls_default_port() {
        let options = options_for("mqtts://broker.example").unwrap();
        assert_eq!(options.broker_address().1, DEFAULT_MQTTS_PORT);
    }

    #[test]
    fn test_websocket_uses_full_url() {
        let options = options_for("wss://example/server").unwrap();
        let (host, port) = options.broker_address();
        assert_eq!(host, "wss://example/server");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_client_ids_are_unique() {
        let first = options_for("mqtt://localhost").unwrap();
        let second = options_for("mqtt://localhost").unwrap();
        assert!(first.client_id().starts_with("resilient-session-"));
        assert_ne!(first.client_id(), second.client_id());
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let result = options_for("http://localhost:1883");
        assert!(matches!(result, Err(SessionError::InvalidUrl(_))));
    }

    #[test]
    fn test_auth_refusals_are_security_failures() {
        for code in [
            ConnectReturnCode::BadUserNamePassword,
            ConnectReturnCode::NotAuthorized,
            ConnectReturnCode::Banned,
        ] {
            let description = format!("{code:?}");
            let failure = classify_connection_error(&ConnectionError::ConnectionRefused(code));
            assert!(matches!(failure, ConnectionFailure::Security(_)), "{description}");
        }
    }

    #[test]
    fn test_other_failures_are_recoverable() {
        let busy = ConnectionError::ConnectionRefused(ConnectReturnCode::ServerBusy);
        let failure = classify_connection_error(&busy);
        assert!(matches!(failure, ConnectionFailure::Recoverable(_)));

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let failure = classify_connection_error(&ConnectionError::Io(io));
        assert!(matches!(failure, ConnectionFailure::Recoverable(ref m) if m.contains("reset")));
    }

    #[test]
    fn test_establishment_error_mapping() {
        assert!(matches!(
            ConnectionFailure::Security("denied".to_string()).into_establishment_error(),
            SessionError::Security(_)
        ));
        assert!(matches!(
            ConnectionFailure::Recoverable("dns".to_string()).into_establishment_error(),
            SessionError::Establishment(_)
        ));
    }
}
