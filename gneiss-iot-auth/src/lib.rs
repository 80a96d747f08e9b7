/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Connection establishment for MQTT clients of AWS IoT Core.

A [`ConnectionAuthenticator`] connects using one of three strategies:

* **Credentials** - an identity pool id is exchanged for a caller identity and temporary
  credentials, and the websocket upgrade is SigV4-signed with them.
* **Certificate** - a client certificate, taken from durable storage, imported from a bundled
  PKCS12 file, or explicitly provisioned through the registration service, is presented over
  mutual TLS.
* **Custom authorizer** - a token is signed with a bundled RSA key and passed to the broker's
  custom authorizer in the websocket upgrade.

Every status change is written to an [`EventLog`], and each connection attempt reports exactly one
terminal outcome.

The identity service and the registration service are traits; the `aws-services` feature adds
implementations backed by Amazon Cognito and the AWS IoT control plane.
 */

#![cfg_attr(feature = "strict", deny(warnings))]
#![warn(missing_docs)]

pub mod authenticator;
pub mod certificate;
pub mod config;
pub mod credentials;
pub mod error;
pub mod event_log;
pub mod resources;
pub mod signer;
pub mod storage;
pub mod transport;
pub mod vault;

#[cfg(test)]
mod testing;

pub use authenticator::{AuthStrategy, AuthenticatorState, ConnectOutcome, ConnectionAttemptHandle, ConnectionAuthenticator};
pub use certificate::{CertificateIdentity, CertificateSource, CertificateStore, RegistrationService};
pub use config::{CsrSubject, CustomAuthToken, IotAuthConfig, IotAuthConfigBuilder};
pub use credentials::{CredentialProvider, Identity, IdentityService};
pub use error::{AuthError, AuthResult};
pub use event_log::{EventLog, LogEntry};
pub use resources::ResourceBundle;
pub use signer::TokenSigner;
pub use storage::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use transport::{ConnectionStatus, InboundMessage, MqttTransport, QualityOfService, TokioMqttTransport};
pub use vault::{ClientIdentity, CredentialVault, FileCredentialVault, MemoryCredentialVault};
