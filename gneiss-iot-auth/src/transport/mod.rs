/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The MQTT transport contract consumed by the connection authenticator, plus a tokio-based
implementation that talks MQTT 3.1.1 to AWS IoT Core over websockets or mutual TLS.
 */

pub(crate) mod codec;
pub mod stream;
mod tokio_client;

pub use tokio_client::TokioMqttTransport;

use crate::error::{AuthError, AuthResult, TransportErrorKind};
use crate::vault::ClientIdentity;

use aws_credential_types::Credentials;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Broker-driven state of a transport connection
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {

    /// the stream is being opened or the CONNECT is outstanding
    Connecting,

    /// the broker accepted the connection
    Connected,

    /// the connection was closed, by either side
    Disconnected,

    /// the broker rejected the CONNECT
    ConnectionRefused,

    /// the stream could not be opened or failed
    ConnectionError,

    /// the broker violated the protocol
    ProtocolError,

    /// a status the transport could not classify
    Unknown,
}

impl ConnectionStatus {

    /// True for statuses that end a connection attempt
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Unknown)
    }

    /// True for statuses that report a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, ConnectionStatus::ConnectionRefused | ConnectionStatus::ConnectionError | ConnectionStatus::ProtocolError)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => { write!(f, "Connecting...") }
            ConnectionStatus::Connected => { write!(f, "Connected") }
            ConnectionStatus::Disconnected => { write!(f, "Disconnected") }
            ConnectionStatus::ConnectionRefused => { write!(f, "Connection Refused") }
            ConnectionStatus::ConnectionError => { write!(f, "Connection Error") }
            ConnectionStatus::ProtocolError => { write!(f, "Protocol Error") }
            ConnectionStatus::Unknown => { write!(f, "Unknown State") }
        }
    }
}

impl From<TransportErrorKind> for ConnectionStatus {
    fn from(kind: TransportErrorKind) -> Self {
        match kind {
            TransportErrorKind::Refused => { ConnectionStatus::ConnectionRefused }
            TransportErrorKind::ConnectionError => { ConnectionStatus::ConnectionError }
            TransportErrorKind::ProtocolError => { ConnectionStatus::ProtocolError }
        }
    }
}

/// A status change reported by a transport, with the failure that caused it, if any
#[derive(Debug)]
pub struct StatusEvent {

    /// new status
    pub status: ConnectionStatus,

    /// failure details for failure statuses
    pub error: Option<AuthError>,
}

impl StatusEvent {

    /// Creates a status event without failure details
    pub fn new(status: ConnectionStatus) -> Self {
        StatusEvent {
            status,
            error: None,
        }
    }

    /// Creates a status event from a transport failure
    pub fn from_error(error: AuthError) -> Self {
        let status = error.transport_error_kind()
            .map(ConnectionStatus::from)
            .unwrap_or(ConnectionStatus::ConnectionError);

        StatusEvent {
            status,
            error: Some(error),
        }
    }
}

/// Channel on which a transport reports every status change of a connection
pub type StatusSender = mpsc::UnboundedSender<StatusEvent>;

/// MQTT delivery guarantee
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, PartialOrd, Ord)]
pub enum QualityOfService {

    /// fire and forget
    #[default]
    AtMostOnce = 0,

    /// acknowledged delivery
    AtLeastOnce = 1,
}

impl TryFrom<u8> for QualityOfService {
    type Error = AuthError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => { Ok(QualityOfService::AtMostOnce) }
            1 => { Ok(QualityOfService::AtLeastOnce) }
            _ => { Err(AuthError::new_decoding_failure(format!("unsupported quality of service {}", value))) }
        }
    }
}

/// A message delivered to a subscription
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundMessage {

    /// topic the message was published to
    pub topic: String,

    /// message payload
    pub payload: Vec<u8>,
}

/// How a transport connection authenticates with the broker.  Each variant carries only the
/// data it needs.
#[derive(Clone)]
pub enum TransportAuth {

    /// SigV4-signed websocket upgrade using temporary credentials
    Credentials {

        /// signing region
        region: String,

        /// credentials to sign with
        credentials: Credentials,
    },

    /// mutual TLS presenting a client certificate
    Certificate {

        /// TLS client material
        identity: ClientIdentity,
    },

    /// websocket upgrade carrying a signed custom-authorizer token
    CustomAuthorizer {

        /// name of the authorizer
        authorizer_name: String,

        /// name of the header that carries the token
        token_key_name: String,

        /// the token
        token_value: String,

        /// base64 signature of the token
        token_signature: String,
    },
}

impl fmt::Debug for TransportAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAuth::Credentials { region, .. } => {
                write!(f, "TransportAuth::Credentials {{ region: {} }}", region)
            }
            TransportAuth::Certificate { identity } => {
                write!(f, "TransportAuth::Certificate {{ identity: {:?} }}", identity)
            }
            TransportAuth::CustomAuthorizer { authorizer_name, token_key_name, token_value, token_signature } => {
                write!(f, "TransportAuth::CustomAuthorizer {{ authorizer_name: {}, token_key_name: {}, token_value: {}, token_signature: {} }}", authorizer_name, token_key_name, token_value, token_signature)
            }
        }
    }
}

/// Everything a transport needs to open a connection
#[derive(Clone, Debug)]
pub struct ConnectRequest {

    /// MQTT client id
    pub client_id: String,

    /// MQTT clean session flag
    pub clean_session: bool,

    /// authentication material
    pub auth: TransportAuth,
}

/// Result of a publish; completes on write (QoS 0) or on acknowledgement (QoS 1)
pub type PublishFuture = dyn Future<Output = AuthResult<()>> + Send;

/// Result of a subscribe; yields the stream of matching messages once acknowledged
pub type SubscribeFuture = dyn Future<Output = AuthResult<mpsc::UnboundedReceiver<InboundMessage>>> + Send;

/// Contract of the underlying MQTT transport.  No method blocks: connection progress is reported
/// through the status channel and operations complete through the returned futures.
pub trait MqttTransport : Send + Sync {

    /// Starts opening a connection.  Every status change of the connection is sent to `status`.
    fn connect(&self, request: ConnectRequest, status: StatusSender) -> AuthResult<()>;

    /// Publishes a message on the current connection
    fn publish(&self, topic: &str, payload: &[u8], qos: QualityOfService) -> Pin<Box<PublishFuture>>;

    /// Subscribes to a topic filter on the current connection
    fn subscribe(&self, topic_filter: &str) -> Pin<Box<SubscribeFuture>>;

    /// Requests teardown of the current connection, if any
    fn disconnect(&self) -> AuthResult<()>;
}

/// Checks a topic against an MQTT topic filter, honoring the `+` and `#` wildcards
pub fn topic_matches_filter(topic_filter: &str, topic: &str) -> bool {
    let mut filter_levels = topic_filter.split('/');
    let mut topic_levels = topic.split('/');

    // wildcards never match topics beginning with '$'
    if topic.starts_with('$') && (topic_filter.starts_with('+') || topic_filter.starts_with('#')) {
        return false;
    }

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => { return true; }
            (Some("+"), Some(_)) => {}
            (Some(filter_level), Some(topic_level)) => {
                if filter_level != topic_level {
                    return false;
                }
            }
            (None, None) => { return true; }
            _ => { return false; }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_matches_log_lines() {
        assert_eq!("Connecting...", ConnectionStatus::Connecting.to_string());
        assert_eq!("Connected", ConnectionStatus::Connected.to_string());
        assert_eq!("Connection Refused", ConnectionStatus::ConnectionRefused.to_string());
        assert_eq!("Unknown State", ConnectionStatus::Unknown.to_string());
    }

    #[test]
    fn status_classification() {
        assert!(!ConnectionStatus::Connecting.is_terminal());
        assert!(ConnectionStatus::Disconnected.is_terminal());
        assert!(!ConnectionStatus::Disconnected.is_failure());
        assert!(ConnectionStatus::ProtocolError.is_failure());
    }

    #[test]
    fn status_event_from_transport_error() {
        let event = StatusEvent::from_error(AuthError::new_transport_error(TransportErrorKind::Refused, "return code 5"));
        assert_eq!(ConnectionStatus::ConnectionRefused, event.status);

        let event = StatusEvent::from_error(AuthError::new_timeout("connack"));
        assert_eq!(ConnectionStatus::ConnectionError, event.status);
    }

    #[test]
    fn topic_filter_matching() {
        assert!(topic_matches_filter("a/b/c", "a/b/c"));
        assert!(!topic_matches_filter("a/b/c", "a/b"));
        assert!(!topic_matches_filter("a/b", "a/b/c"));
        assert!(topic_matches_filter("a/+/c", "a/b/c"));
        assert!(!topic_matches_filter("a/+/c", "a/b/d"));
        assert!(topic_matches_filter("a/#", "a/b/c"));
        assert!(topic_matches_filter("a/#", "a"));
        assert!(topic_matches_filter("#", "device/telemetry"));
        assert!(topic_matches_filter("+/+", "/finance"));
        assert!(!topic_matches_filter("#", "$aws/things/thing/shadow"));
        assert!(topic_matches_filter("$aws/things/+/shadow", "$aws/things/thing/shadow"));
    }
}
