/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Exchange of an identity pool id for a caller identity and short-lived, scoped credentials.
 */

use crate::error::{AuthError, AuthResult};

use aws_credential_types::Credentials;
use log::*;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Caller identity issued by the identity service.  Held for the duration of one connect
/// attempt; never persisted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {

    /// identity id, used as the MQTT client id for credential-based connections
    pub identity_id: String,
}

/// Result of an identity id request
pub type IdentityIdFuture = dyn Future<Output = AuthResult<String>> + Send;

/// Result of a credentials request
pub type CredentialsFuture = dyn Future<Output = AuthResult<Credentials>> + Send;

/// Contract required from the external identity service.
///
/// Implementations should report failures as `IdentityError` with the service's own error as
/// the source; the provider forwards it verbatim.
pub trait IdentityService : Send + Sync {

    /// Resolves the identity id associated with an identity pool
    fn get_identity_id(&self, identity_pool_id: &str) -> Pin<Box<IdentityIdFuture>>;

    /// Issues temporary credentials for an identity id
    fn get_credentials_for_identity(&self, identity_id: &str) -> Pin<Box<CredentialsFuture>>;
}

/// Wraps the identity service with a fixed pool id, region, and timeout.  Each call invokes the
/// service exactly once; retries are left to the caller.
#[derive(Clone)]
pub struct CredentialProvider {
    service: Arc<dyn IdentityService>,
    identity_pool_id: String,
    region: String,
    timeout: Duration,
}

impl CredentialProvider {

    /// Creates a new provider
    pub fn new(service: Arc<dyn IdentityService>, identity_pool_id: &str, region: &str, timeout: Duration) -> Self {
        CredentialProvider {
            service,
            identity_pool_id: identity_pool_id.to_string(),
            region: region.to_string(),
            timeout,
        }
    }

    /// Identity pool this provider resolves against
    pub fn identity_pool_id(&self) -> &str {
        &self.identity_pool_id
    }

    /// Region the identity pool lives in
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Obtains the caller identity for the configured pool
    pub async fn get_identity(&self) -> AuthResult<Identity> {
        debug!("get_identity - requesting identity id from pool {} in {}", self.identity_pool_id, self.region);

        let request = self.service.get_identity_id(&self.identity_pool_id);
        let identity_id = tokio::time::timeout(self.timeout, request).await
            .map_err(AuthError::new_identity_error)?
            .map_err(into_identity_error)?;

        Ok(Identity {
            identity_id
        })
    }

    /// Obtains temporary credentials for a previously resolved identity
    pub async fn get_credentials(&self, identity: &Identity) -> AuthResult<Credentials> {
        debug!("get_credentials - requesting credentials for identity {}", identity.identity_id);

        let request = self.service.get_credentials_for_identity(&identity.identity_id);
        tokio::time::timeout(self.timeout, request).await
            .map_err(AuthError::new_identity_error)?
            .map_err(into_identity_error)
    }
}

fn into_identity_error(error: AuthError) -> AuthError {
    match error {
        AuthError::IdentityError(_) => { error }
        other => { AuthError::new_identity_error(other) }
    }
}

#[cfg(feature = "aws-services")]
pub use cognito::*;

#[cfg(feature = "aws-services")]
mod cognito {
    use super::*;
    use crate::error::describe_service_failure;

    use aws_credential_types::provider::{self, error::CredentialsError, future, ProvideCredentials};
    use std::time::SystemTime;

    const COGNITO_PROVIDER_NAME: &str = "CognitoIdentity";

    /// Identity service backed by Amazon Cognito identity pools
    #[derive(Clone, Debug)]
    pub struct CognitoIdentityService {
        client: aws_sdk_cognitoidentity::Client,
    }

    impl CognitoIdentityService {

        /// Creates a service from a loaded SDK configuration.  GetId and
        /// GetCredentialsForIdentity do not require caller credentials for unauthenticated
        /// identities.
        pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
            CognitoIdentityService {
                client: aws_sdk_cognitoidentity::Client::new(sdk_config)
            }
        }

        /// Loads a default SDK configuration for `region` and creates a service from it
        pub async fn from_region(region: &str) -> Self {
            let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_config::Region::new(region.to_string()))
                .no_credentials()
                .load()
                .await;

            CognitoIdentityService::new(&sdk_config)
        }
    }

    impl IdentityService for CognitoIdentityService {
        fn get_identity_id(&self, identity_pool_id: &str) -> Pin<Box<IdentityIdFuture>> {
            let client = self.client.clone();
            let identity_pool_id = identity_pool_id.to_string();

            Box::pin(async move {
                let response = client.get_id()
                    .identity_pool_id(identity_pool_id)
                    .send()
                    .await
                    .map_err(|error| AuthError::new_identity_error(describe_service_failure(error)))?;

                response.identity_id()
                    .map(str::to_string)
                    .ok_or_else(|| AuthError::new_identity_error("GetId response did not contain an identity id"))
            })
        }

        fn get_credentials_for_identity(&self, identity_id: &str) -> Pin<Box<CredentialsFuture>> {
            let client = self.client.clone();
            let identity_id = identity_id.to_string();

            Box::pin(async move {
                let response = client.get_credentials_for_identity()
                    .identity_id(identity_id)
                    .send()
                    .await
                    .map_err(|error| AuthError::new_identity_error(describe_service_failure(error)))?;

                let credentials = response.credentials()
                    .ok_or_else(|| AuthError::new_identity_error("GetCredentialsForIdentity response did not contain credentials"))?;

                let access_key_id = credentials.access_key_id()
                    .ok_or_else(|| AuthError::new_identity_error("credentials are missing an access key id"))?;
                let secret_key = credentials.secret_key()
                    .ok_or_else(|| AuthError::new_identity_error("credentials are missing a secret key"))?;
                let expiry = credentials.expiration()
                    .and_then(|expiration| SystemTime::try_from(*expiration).ok());

                Ok(Credentials::new(
                    access_key_id,
                    secret_key,
                    credentials.session_token().map(str::to_string),
                    expiry,
                    COGNITO_PROVIDER_NAME))
            })
        }
    }

    /// Adapts a credential provider into the SDK's credentials-provider interface so the same
    /// Cognito identity can sign control-plane requests.
    #[derive(Clone)]
    pub struct CognitoCredentialsProvider {
        provider: CredentialProvider,
    }

    impl CognitoCredentialsProvider {

        /// Creates a new SDK credentials provider
        pub fn new(provider: CredentialProvider) -> Self {
            CognitoCredentialsProvider {
                provider
            }
        }

        async fn resolve(&self) -> provider::Result {
            let identity = self.provider.get_identity().await.map_err(CredentialsError::provider_error)?;
            self.provider.get_credentials(&identity).await.map_err(CredentialsError::provider_error)
        }
    }

    impl std::fmt::Debug for CognitoCredentialsProvider {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "CognitoCredentialsProvider {{ identity_pool_id: {} }}", self.provider.identity_pool_id())
        }
    }

    impl ProvideCredentials for CognitoCredentialsProvider {
        fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
        where
            Self: 'a,
        {
            future::ProvideCredentials::new(self.resolve())
        }
    }
}
