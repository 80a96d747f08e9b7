/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Construction of the byte streams an MQTT session runs over: TCP, TLS via rustls or native-tls,
and websockets with either a SigV4-presigned or a custom-authorizer upgrade request.
 */

use crate::error::{AuthError, AuthResult, TransportErrorKind};
use crate::transport::{ConnectRequest, TransportAuth};
use crate::vault::ClientIdentity;

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{sign, PayloadChecksumKind, PercentEncodingMode, SessionTokenMode, SignableBody, SignableRequest, SignatureLocation, SigningSettings};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use http::{Uri, Version};
use log::*;
use std::error::Error;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use stream_ws::{tungstenite::WsMessageHandler, WsMessageHandle};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::client_async;
use tungstenite::handshake::client::generate_key;

/// Port AWS IoT Core accepts both websocket and ALPN-negotiated mutual TLS connections on
pub const IOT_CORE_PORT: u16 = 443;

/// ALPN protocol that lets AWS IoT Core accept direct MQTT on port 443
pub const IOT_CORE_MQTT_ALPN: &str = "x-amzn-mqtt-ca";

const IOT_CORE_SIGNING_SERVICE_NAME: &str = "iotdevicegateway";
const PRESIGNED_URL_LIFETIME: Duration = Duration::from_secs(3600);
const SESSION_TOKEN_QUERY_PARAM_NAME: &str = "X-Amz-Security-Token";

const CUSTOM_AUTH_AUTHORIZER_NAME_HEADER: &str = "x-amz-customauthorizer-name";
const CUSTOM_AUTH_SIGNATURE_HEADER: &str = "x-amz-customauthorizer-signature";

/// A bidirectional async byte stream an MQTT session can run over
pub trait AsyncStream : AsyncRead + AsyncWrite + Send {}

impl<T> AsyncStream for T where T : AsyncRead + AsyncWrite + Send {}

/// A type-erased, heap-pinned stream
pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Result of opening a stream for a connect request
pub type ConnectionFactoryFuture = dyn Future<Output = AuthResult<BoxedStream>> + Send;

/// Opens a fresh stream for a connect request, applying the request's authentication to the
/// stream setup
pub type ConnectionFactory = Arc<dyn Fn(&ConnectRequest) -> Pin<Box<ConnectionFactoryFuture>> + Send + Sync>;

fn connection_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> AuthError {
    AuthError::new_transport_error(TransportErrorKind::ConnectionError, source)
}

/// Creates a connection factory for AWS IoT Core.  Credential and custom-authorizer requests use
/// websockets over rustls on port 443; certificate requests use native-tls mutual TLS on port
/// 443 with the `x-amzn-mqtt-ca` ALPN protocol.
pub fn create_aws_iot_connection_factory(endpoint: &str, root_ca_path: Option<PathBuf>) -> ConnectionFactory {
    let endpoint = endpoint.to_string();

    Arc::new(move |request: &ConnectRequest| {
        let endpoint = endpoint.clone();
        let root_ca_path = root_ca_path.clone();
        let auth = request.auth.clone();

        Box::pin(async move {
            let root_ca_pem =
                match &root_ca_path {
                    Some(path) => { Some(tokio::fs::read(path).await.map_err(AuthError::new_tls_error)?) }
                    None => { None }
                };

            match auth {
                TransportAuth::Credentials { region, credentials } => {
                    let url = presign_websocket_url(&endpoint, &region, &credentials, SystemTime::now())?;
                    let handshake_request = create_websocket_handshake_request(&url, &[])?;
                    let tls_config = build_rustls_config(root_ca_pem.as_deref())?;

                    let stream = make_leaf_stream(&endpoint, IOT_CORE_PORT).await?;
                    let tls_stream = wrap_stream_with_tls_rustls(stream, &endpoint, tls_config).await?;
                    wrap_stream_with_websockets(tls_stream, handshake_request).await
                }
                TransportAuth::Certificate { identity } => {
                    let connector = build_native_tls_connector(&identity, root_ca_pem.as_deref())?;

                    let stream = make_leaf_stream(&endpoint, IOT_CORE_PORT).await?;
                    let tls_stream = wrap_stream_with_tls_native_tls(stream, &endpoint, connector).await?;
                    Ok(Box::pin(tls_stream) as BoxedStream)
                }
                TransportAuth::CustomAuthorizer { authorizer_name, token_key_name, token_value, token_signature } => {
                    let url = format!("wss://{}/mqtt", endpoint);
                    let headers = vec![
                        (CUSTOM_AUTH_AUTHORIZER_NAME_HEADER.to_string(), authorizer_name),
                        (CUSTOM_AUTH_SIGNATURE_HEADER.to_string(), token_signature),
                        (token_key_name, token_value),
                    ];
                    let handshake_request = create_websocket_handshake_request(&url, &headers)?;
                    let tls_config = build_rustls_config(root_ca_pem.as_deref())?;

                    let stream = make_leaf_stream(&endpoint, IOT_CORE_PORT).await?;
                    let tls_stream = wrap_stream_with_tls_rustls(stream, &endpoint, tls_config).await?;
                    wrap_stream_with_websockets(tls_stream, handshake_request).await
                }
            }
        }) as Pin<Box<ConnectionFactoryFuture>>
    })
}

/// Creates a connection factory that opens unencrypted TCP connections to `host:port` and
/// ignores request authentication.  Intended for local brokers.
pub fn create_direct_connection_factory(host: &str, port: u16) -> ConnectionFactory {
    let host = host.to_string();

    Arc::new(move |_: &ConnectRequest| {
        let host = host.clone();

        Box::pin(async move {
            let stream = make_leaf_stream(&host, port).await?;
            Ok(Box::pin(stream) as BoxedStream)
        }) as Pin<Box<ConnectionFactoryFuture>>
    })
}

async fn make_leaf_stream(endpoint: &str, port: u16) -> AuthResult<TcpStream> {
    debug!("make_leaf_stream - opening TCP stream to {}:{}", endpoint, port);
    let stream = TcpStream::connect((endpoint, port)).await.map_err(connection_error)?;
    debug!("make_leaf_stream - TCP stream successfully established");

    Ok(stream)
}

fn build_rustls_config(root_ca_pem: Option<&[u8]>) -> AuthResult<Arc<rustls::ClientConfig>> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    if let Some(root_ca_pem) = root_ca_pem {
        let mut pem = std::io::BufReader::new(root_ca_pem);
        for cert in rustls_pemfile::certs(&mut pem) {
            root_cert_store.add(cert.map_err(AuthError::new_tls_error)?)?;
        }
    } else {
        for cert in rustls_native_certs::load_native_certs().map_err(AuthError::new_tls_error)? {
            if let Err(error) = root_cert_store.add(cert) {
                warn!("build_rustls_config - skipping unusable system root certificate: {}", error);
            }
        }
    }

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

fn build_native_tls_connector(identity: &ClientIdentity, root_ca_pem: Option<&[u8]>) -> AuthResult<tokio_native_tls::TlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if let Some(root_ca_pem) = root_ca_pem {
        builder.disable_built_in_roots(true);
        builder.add_root_certificate(native_tls::Certificate::from_pem(root_ca_pem)?);
    }

    builder.identity(identity.to_native_tls_identity()?);
    builder.request_alpns(&[IOT_CORE_MQTT_ALPN]);

    Ok(tokio_native_tls::TlsConnector::from(builder.build()?))
}

async fn wrap_stream_with_tls_rustls<S>(stream: S, endpoint: &str, config: Arc<rustls::ClientConfig>) -> AuthResult<tokio_rustls::client::TlsStream<S>> where S : AsyncRead + AsyncWrite + Unpin {
    let domain = rustls_pki_types::ServerName::try_from(endpoint.to_string())?;
    let connector = tokio_rustls::TlsConnector::from(config);

    debug!("wrap_stream_with_tls_rustls - performing tls handshake");
    let tls_stream = connector.connect(domain, stream).await.map_err(connection_error)?;
    debug!("wrap_stream_with_tls_rustls - tls handshake successfully completed");

    Ok(tls_stream)
}

async fn wrap_stream_with_tls_native_tls<S>(stream: S, endpoint: &str, connector: tokio_native_tls::TlsConnector) -> AuthResult<tokio_native_tls::TlsStream<S>> where S : AsyncRead + AsyncWrite + Unpin {
    debug!("wrap_stream_with_tls_native_tls - performing tls handshake");
    let tls_stream = connector.connect(endpoint, stream).await.map_err(connection_error)?;
    debug!("wrap_stream_with_tls_native_tls - tls handshake successfully completed");

    Ok(tls_stream)
}

async fn wrap_stream_with_websockets<S>(stream: S, handshake_request: http::Request<()>) -> AuthResult<BoxedStream> where S : AsyncRead + AsyncWrite + Send + Unpin + 'static {
    debug!("wrap_stream_with_websockets - upgrading stream to websockets");
    let (message_stream, _) = client_async(handshake_request, stream).await?;
    let byte_stream = WsMessageHandler::wrap_stream(message_stream);
    debug!("wrap_stream_with_websockets - successfully upgraded stream to websockets");

    Ok(Box::pin(byte_stream))
}

/// Builds the websocket upgrade request for an MQTT-over-websockets connection, adding any
/// extra headers
pub(crate) fn create_websocket_handshake_request(url: &str, extra_headers: &[(String, String)]) -> AuthResult<http::Request<()>> {
    let uri = Uri::from_str(url).map_err(connection_error)?;
    let host = uri.host()
        .ok_or_else(|| connection_error(format!("websocket url {} has no host", url)))?
        .to_string();

    let mut builder = http::Request::builder()
        .uri(url)
        .version(Version::HTTP_11)
        .header("Sec-WebSocket-Protocol", "mqtt")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", 13)
        .header("Host", host);

    for (name, value) in extra_headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder.body(()).map_err(connection_error)
}

/// Produces a `wss://<endpoint>/mqtt` url presigned with SigV4 query parameters.  The session
/// token is appended after signing, as AWS IoT Core expects.
pub(crate) fn presign_websocket_url(endpoint: &str, region: &str, credentials: &Credentials, signing_time: SystemTime) -> AuthResult<String> {
    let url = format!("wss://{}/mqtt", endpoint);
    let identity: Identity = credentials.clone().into();

    let mut signing_settings = SigningSettings::default();
    signing_settings.signature_location = SignatureLocation::QueryParams;
    signing_settings.expires_in = Some(PRESIGNED_URL_LIFETIME);
    signing_settings.percent_encoding_mode = PercentEncodingMode::Single;
    signing_settings.payload_checksum_kind = PayloadChecksumKind::NoHeader;
    signing_settings.session_token_mode = SessionTokenMode::Exclude;

    let signing_params: aws_sigv4::http_request::SigningParams = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name(IOT_CORE_SIGNING_SERVICE_NAME)
        .time(signing_time)
        .settings(signing_settings)
        .build()
        .map_err(connection_error)?
        .into();

    let signable_request = SignableRequest::new("GET", url.as_str(), std::iter::empty(), SignableBody::Bytes(&[]))
        .map_err(connection_error)?;
    let (signing_instructions, _) = sign(signable_request, &signing_params)
        .map_err(connection_error)?
        .into_parts();

    let mut query_params = Vec::new();
    for (name, value) in signing_instructions.params().iter() {
        query_params.push(format!("{}={}", name, urlencoding::encode(value)));
    }

    if let Some(session_token) = credentials.session_token() {
        query_params.push(format!("{}={}", SESSION_TOKEN_QUERY_PARAM_NAME, urlencoding::encode(session_token)));
    }

    Ok(format!("{}?{}", url, query_params.join("&")))
}
