/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Configuration for the connection authenticator and the components it owns.
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Subject fields used when requesting a new certificate from the registration service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CsrSubject {

    /// certificate common name (CN)
    pub common_name: String,

    /// two letter country code (C)
    pub country_name: String,

    /// organization (O)
    pub organization_name: String,

    /// organizational unit (OU)
    pub organizational_unit_name: String,
}

impl Default for CsrSubject {
    fn default() -> Self {
        CsrSubject {
            common_name: "IoT Device".to_string(),
            country_name: "US".to_string(),
            organization_name: "Gneiss".to_string(),
            organizational_unit_name: "Devices".to_string(),
        }
    }
}

/// Custom authorizer settings used for custom-authorizer connections.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CustomAuthToken {

    /// name of the authorizer registered with the broker
    pub authorizer_name: String,

    /// name of the header carrying the token value
    pub token_key_name: String,

    /// token value; this is what gets signed
    pub token_value: String,
}

impl CustomAuthToken {

    /// Creates a new set of custom authorizer settings
    pub fn new(authorizer_name: &str, token_key_name: &str, token_value: &str) -> Self {
        CustomAuthToken {
            authorizer_name: authorizer_name.to_string(),
            token_key_name: token_key_name.to_string(),
            token_value: token_value.to_string(),
        }
    }
}

/// Complete configuration consumed when assembling a connection authenticator.
#[derive(Clone, Debug)]
pub struct IotAuthConfig {
    pub(crate) region: String,
    pub(crate) identity_pool_id: String,
    pub(crate) endpoint: String,
    pub(crate) policy_name: String,
    pub(crate) custom_auth: CustomAuthToken,
    pub(crate) csr_subject: CsrSubject,
    pub(crate) resource_directory: PathBuf,
    pub(crate) root_ca_path: Option<PathBuf>,
    pub(crate) service_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) keep_alive_interval: Duration,
}

impl IotAuthConfig {

    /// AWS region the identity pool and IoT endpoint live in
    pub fn region(&self) -> &str { &self.region }

    /// identity pool used to obtain identities and temporary credentials
    pub fn identity_pool_id(&self) -> &str { &self.identity_pool_id }

    /// broker host name, with any scheme or path removed
    pub fn endpoint(&self) -> &str { &self.endpoint }

    /// policy attached to newly provisioned certificates
    pub fn policy_name(&self) -> &str { &self.policy_name }

    /// custom authorizer settings
    pub fn custom_auth(&self) -> &CustomAuthToken { &self.custom_auth }

    /// subject used for new certificate signing requests
    pub fn csr_subject(&self) -> &CsrSubject { &self.csr_subject }

    /// directory scanned for bundled `.p12` and `.pem` resources
    pub fn resource_directory(&self) -> &Path { self.resource_directory.as_path() }

    /// optional root CA override; system trust is used otherwise
    pub fn root_ca_path(&self) -> Option<&Path> { self.root_ca_path.as_deref() }

    /// upper bound on any single identity/registration service call
    pub fn service_timeout(&self) -> Duration { self.service_timeout }

    /// upper bound on stream establishment plus connack
    pub fn connect_timeout(&self) -> Duration { self.connect_timeout }

    /// MQTT keep alive interval
    pub fn keep_alive_interval(&self) -> Duration { self.keep_alive_interval }
}

/// Builder type for IotAuthConfig
#[derive(Clone)]
pub struct IotAuthConfigBuilder {
    config: IotAuthConfig
}

impl IotAuthConfigBuilder {

    /// Creates a new builder from the three values that have no sensible default
    pub fn new(region: &str, identity_pool_id: &str, endpoint: &str) -> Self {
        IotAuthConfigBuilder {
            config: IotAuthConfig {
                region: region.to_string(),
                identity_pool_id: identity_pool_id.to_string(),
                endpoint: normalize_endpoint(endpoint),
                policy_name: "myIOTPolicy".to_string(),
                custom_auth: CustomAuthToken::new("testJWTAuth", "token-key-name", "allow"),
                csr_subject: CsrSubject::default(),
                resource_directory: PathBuf::from("resources"),
                root_ca_path: None,
                service_timeout: DEFAULT_SERVICE_TIMEOUT,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            }
        }
    }

    /// Sets the policy attached to newly provisioned certificates
    pub fn with_policy_name(mut self, policy_name: &str) -> Self {
        self.config.policy_name = policy_name.to_string();
        self
    }

    /// Sets the custom authorizer settings
    pub fn with_custom_auth(mut self, custom_auth: CustomAuthToken) -> Self {
        self.config.custom_auth = custom_auth;
        self
    }

    /// Sets the certificate signing request subject
    pub fn with_csr_subject(mut self, csr_subject: CsrSubject) -> Self {
        self.config.csr_subject = csr_subject;
        self
    }

    /// Sets the directory scanned for bundled resources
    pub fn with_resource_directory(mut self, resource_directory: impl Into<PathBuf>) -> Self {
        self.config.resource_directory = resource_directory.into();
        self
    }

    /// Sets a root CA override
    pub fn with_root_ca_path(mut self, root_ca_path: impl Into<PathBuf>) -> Self {
        self.config.root_ca_path = Some(root_ca_path.into());
        self
    }

    /// Bounds each identity/registration service call
    pub fn with_service_timeout(mut self, timeout: Duration) -> Self {
        self.config.service_timeout = timeout;
        self
    }

    /// Bounds stream establishment plus connack
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the MQTT keep alive interval
    pub fn with_keep_alive_interval(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive_interval = keep_alive;
        self
    }

    /// Builds the final configuration
    pub fn build(self) -> IotAuthConfig {
        self.config
    }
}

// accepts "https://host/", "host:443" or "host"
fn normalize_endpoint(endpoint: &str) -> String {
    let without_scheme =
        match endpoint.find("://") {
            Some(index) => { &endpoint[(index + 3)..] }
            None => { endpoint }
        };

    let host_and_port = without_scheme.split('/').next().unwrap_or("");
    let host = host_and_port.split(':').next().unwrap_or("");

    host.to_string()
}
