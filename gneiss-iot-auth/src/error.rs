/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the core crate error enumeration, context structures, and conversion
definitions.
 */

use std::error::Error;
use std::fmt;

/// Additional details about an IdentityError error variant
#[derive(Debug)]
pub struct IdentityErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ProvisioningError error variant
#[derive(Debug)]
pub struct ProvisioningErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a SigningError error variant
#[derive(Debug)]
pub struct SigningErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Broker-reported reason a transport failed
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportErrorKind {

    /// The broker rejected the connection (non-zero connack return code)
    Refused,

    /// The stream could not be established or failed while in use
    ConnectionError,

    /// The broker sent something that violates the MQTT protocol
    ProtocolError,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Refused => { write!(f, "connection refused") }
            TransportErrorKind::ConnectionError => { write!(f, "connection error") }
            TransportErrorKind::ProtocolError => { write!(f, "protocol error") }
        }
    }
}

/// Additional details about a TransportError error variant
#[derive(Debug)]
pub struct TransportErrorContext {

    /// what category of transport failure occurred
    pub kind: TransportErrorKind,

    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an AlreadyConnecting error variant
#[derive(Debug)]
pub struct AlreadyConnectingContext {
}

/// Additional details about a NoIdentityAvailable error variant
#[derive(Debug)]
pub struct NoIdentityAvailableContext {
}

/// Additional details about a NotConnected error variant
#[derive(Debug)]
pub struct NotConnectedContext {
}

/// Additional details about a StorageError error variant
#[derive(Debug)]
pub struct StorageErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a TlsError error variant
#[derive(Debug)]
pub struct TlsErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a StdIoError error variant
#[derive(Debug)]
pub struct StdIoErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an EncodingFailure error variant
#[derive(Debug)]
pub struct EncodingFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a DecodingFailure error variant
#[derive(Debug)]
pub struct DecodingFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an OperationChannelFailure error variant
#[derive(Debug)]
pub struct OperationChannelFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a Timeout error variant
#[derive(Debug)]
pub struct TimeoutContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Basic error type for the entire gneiss-iot-auth crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum AuthError {

    /// The identity service failed to produce an identity or credentials.  The service's
    /// failure is kept verbatim as the source.
    IdentityError(IdentityErrorContext),

    /// Certificate creation or policy attachment failed.
    ProvisioningError(ProvisioningErrorContext),

    /// Token signing failed: no key material, unparseable key material, or a signature
    /// generation failure.
    SigningError(SigningErrorContext),

    /// Broker-reported or stream-level failure while connecting or connected.
    TransportError(TransportErrorContext),

    /// A connect was requested while another attempt is in flight or a session is already
    /// established.
    AlreadyConnecting(AlreadyConnectingContext),

    /// A certificate-based operation was requested but no certificate identity is available.
    NoIdentityAvailable(NoIdentityAvailableContext),

    /// An operation that requires an established session was invoked without one.
    NotConnected(NotConnectedContext),

    /// Durable key-value storage or the credential vault failed.
    StorageError(StorageErrorContext),

    /// Generic error associated with building or applying TLS configuration
    TlsError(TlsErrorContext),

    /// Generic error wrapper for std::io::Error
    StdIoError(StdIoErrorContext),

    /// Error encountered while encoding an outbound MQTT packet
    EncodingFailure(EncodingFailureContext),

    /// Error encountered while decoding an inbound MQTT packet
    DecodingFailure(DecodingFailureContext),

    /// Failure encountered while sending/receiving on an internal channel
    OperationChannelFailure(OperationChannelFailureContext),

    /// A bounded step did not complete within its configured interval
    Timeout(TimeoutContext),
}

impl AuthError {

    /// Constructs an IdentityError variant from an identity-service failure
    pub fn new_identity_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        AuthError::IdentityError(
            IdentityErrorContext {
                source : source.into()
            }
        )
    }

    /// Constructs a ProvisioningError variant from a registration-service failure
    pub fn new_provisioning_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        AuthError::ProvisioningError(
            ProvisioningErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_signing_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        AuthError::SigningError(
            SigningErrorContext {
                source : source.into()
            }
        )
    }

    /// Constructs a TransportError variant of the given kind
    pub fn new_transport_error(kind: TransportErrorKind, source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        AuthError::TransportError(
            TransportErrorContext {
                kind,
                source : source.into()
            }
        )
    }

    pub(crate) fn new_already_connecting() -> Self {
        AuthError::AlreadyConnecting(
            AlreadyConnectingContext {
            }
        )
    }

    pub(crate) fn new_no_identity_available() -> Self {
        AuthError::NoIdentityAvailable(
            NoIdentityAvailableContext {
            }
        )
    }

    pub(crate) fn new_not_connected() -> Self {
        AuthError::NotConnected(
            NotConnectedContext {
            }
        )
    }

    /// Constructs a StorageError variant from an existing error
    pub fn new_storage_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        AuthError::StorageError(
            StorageErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_tls_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        AuthError::TlsError(
            TlsErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_std_io_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        AuthError::StdIoError(
            StdIoErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_encoding_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        AuthError::EncodingFailure(
            EncodingFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_decoding_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        AuthError::DecodingFailure(
            DecodingFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_operation_channel_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        AuthError::OperationChannelFailure(
            OperationChannelFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_timeout(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        AuthError::Timeout(
            TimeoutContext {
                source : source.into()
            }
        )
    }

    /// Returns the transport failure category if this is a TransportError
    pub fn transport_error_kind(&self) -> Option<TransportErrorKind> {
        match self {
            AuthError::TransportError(context) => { Some(context.kind) }
            _ => { None }
        }
    }
}

impl Error for AuthError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AuthError::IdentityError(context) => {
                Some(context.source.as_ref())
            }
            AuthError::ProvisioningError(context) => {
                Some(context.source.as_ref())
            }
            AuthError::SigningError(context) => {
                Some(context.source.as_ref())
            }
            AuthError::TransportError(context) => {
                Some(context.source.as_ref())
            }
            AuthError::StorageError(context) => {
                Some(context.source.as_ref())
            }
            AuthError::TlsError(context) => {
                Some(context.source.as_ref())
            }
            AuthError::StdIoError(context) => {
                Some(context.source.as_ref())
            }
            AuthError::EncodingFailure(context) => {
                Some(context.source.as_ref())
            }
            AuthError::DecodingFailure(context) => {
                Some(context.source.as_ref())
            }
            AuthError::OperationChannelFailure(context) => {
                Some(context.source.as_ref())
            }
            AuthError::Timeout(context) => {
                Some(context.source.as_ref())
            }
            _ => { None }
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::IdentityError(context) => {
                write!(f, "identity service failure: {}", context.source)
            }
            AuthError::ProvisioningError(context) => {
                write!(f, "certificate provisioning failure: {}", context.source)
            }
            AuthError::SigningError(context) => {
                write!(f, "token signing failure: {}", context.source)
            }
            AuthError::TransportError(context) => {
                write!(f, "{}: {}", context.kind, context.source)
            }
            AuthError::AlreadyConnecting(_) => {
                write!(f, "a connection attempt is already in progress or established")
            }
            AuthError::NoIdentityAvailable(_) => {
                write!(f, "no certificate identity is available; provision one first")
            }
            AuthError::NotConnected(_) => {
                write!(f, "operation requires an established session")
            }
            AuthError::StorageError(context) => {
                write!(f, "durable storage failure: {}", context.source)
            }
            AuthError::TlsError(_) => {
                write!(f, "generic error when setting up a tls context")
            }
            AuthError::StdIoError(_) => {
                write!(f, "generic error wrapper for std::io::Error when no more specialized error is appropriate; source contains further details")
            }
            AuthError::EncodingFailure(_) => {
                write!(f, "failure encountered while encoding an outbound MQTT packet")
            }
            AuthError::DecodingFailure(_) => {
                write!(f, "failure encountered while decoding an incoming MQTT packet")
            }
            AuthError::OperationChannelFailure(_) => {
                write!(f, "failure encountered while sending/receiving on an internal channel")
            }
            AuthError::Timeout(context) => {
                write!(f, "timed out: {}", context.source)
            }
        }
    }
}

impl From<std::io::Error> for AuthError {
    fn from(error: std::io::Error) -> Self {
        AuthError::new_std_io_error(error)
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(error: serde_json::Error) -> Self {
        AuthError::new_storage_error(error)
    }
}

impl From<core::str::Utf8Error> for AuthError {
    fn from(err: core::str::Utf8Error) -> Self {
        AuthError::new_decoding_failure(err)
    }
}

impl From<rustls_pki_types::InvalidDnsNameError> for AuthError {
    fn from(err: rustls_pki_types::InvalidDnsNameError) -> Self {
        AuthError::new_transport_error(TransportErrorKind::ConnectionError, err)
    }
}

impl From<rustls::Error> for AuthError {
    fn from(err: rustls::Error) -> Self {
        AuthError::new_tls_error(err)
    }
}

impl From<native_tls::Error> for AuthError {
    fn from(err: native_tls::Error) -> Self {
        AuthError::new_tls_error(err)
    }
}

impl From<tungstenite::error::Error> for AuthError {
    fn from(err: tungstenite::error::Error) -> Self {
        AuthError::new_transport_error(TransportErrorKind::ConnectionError, err)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for AuthError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        AuthError::new_operation_channel_failure(err)
    }
}

impl <T> From<tokio::sync::mpsc::error::SendError<T>> for AuthError
where T : Send + Sync + 'static {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AuthError::new_operation_channel_failure("operation channel receiver dropped")
    }
}

impl From<tokio::time::error::Elapsed> for AuthError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        AuthError::new_timeout(err)
    }
}

/// Crate-wide result type for functions that can fail
pub type AuthResult<T> = Result<T, AuthError>;

/// Renders an AWS service error together with its source chain.  An SDK error's own Display
/// stops at its category ("service error") and drops the service's message.
#[cfg(feature = "aws-services")]
pub(crate) fn describe_service_failure<E>(error: E) -> String where E : Error {
    aws_sdk_cognitoidentity::error::DisplayErrorContext(error).to_string()
}
