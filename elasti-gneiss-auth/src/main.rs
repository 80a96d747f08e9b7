/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

mod console;

use argh::FromArgs;
use console::{Console, ElastiResult, main_loop};
use gneiss_iot_auth::*;
use gneiss_iot_auth::certificate::IotRegistrationService;
use gneiss_iot_auth::credentials::{CognitoCredentialsProvider, CognitoIdentityService};
use simplelog::*;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

const DEFAULT_DATA_DIRECTORY: &str = ".elasti-gneiss-auth";

#[derive(FromArgs, Debug, PartialEq)]
/// elasti-gneiss-auth - an interactive AWS IoT Core connection console
struct CommandLineArgs {

    /// AWS region of the identity pool and the IoT endpoint
    #[argh(option)]
    region: String,

    /// cognito identity pool id used by credentials connections and certificate provisioning
    #[argh(option)]
    identity_pool_id: String,

    /// the IoT Core data endpoint, as a host or an https:// URL
    #[argh(option)]
    endpoint: String,

    /// policy attached to newly provisioned certificates
    #[argh(option)]
    policy_name: Option<String>,

    /// name of the custom authorizer to invoke
    #[argh(option)]
    authorizer: Option<String>,

    /// name of the header carrying the custom authorizer token
    #[argh(option)]
    token_key_name: Option<String>,

    /// custom authorizer token value; signed with the bundled key
    #[argh(option)]
    token_value: Option<String>,

    /// common name of provisioned certificates
    #[argh(option)]
    csr_common_name: Option<String>,

    /// country of provisioned certificates
    #[argh(option)]
    csr_country: Option<String>,

    /// organization of provisioned certificates
    #[argh(option)]
    csr_organization: Option<String>,

    /// organizational unit of provisioned certificates
    #[argh(option)]
    csr_organizational_unit: Option<String>,

    /// directory holding bundled .p12 identities and .pem signing keys
    #[argh(option)]
    resources: Option<PathBuf>,

    /// directory for persisted settings and certificate material
    #[argh(option)]
    data_dir: Option<PathBuf>,

    /// path to the root CA to use when connecting.  If not set, the default system trust store
    /// will be used instead.
    #[argh(option)]
    capath: Option<PathBuf>,

    /// timeout, in seconds, for each connection attempt
    #[argh(option)]
    connect_timeout: Option<u64>,

    /// path to a log file that should be written
    #[argh(option)]
    logpath: Option<PathBuf>,
}

fn build_config(args: &CommandLineArgs) -> IotAuthConfig {
    let mut builder = IotAuthConfigBuilder::new(&args.region, &args.identity_pool_id, &args.endpoint);

    if let Some(policy_name) = &args.policy_name {
        builder = builder.with_policy_name(policy_name);
    }

    let defaults = builder.clone().build();
    let default_custom_auth = defaults.custom_auth();
    builder = builder.with_custom_auth(CustomAuthToken::new(
        args.authorizer.as_deref().unwrap_or(&default_custom_auth.authorizer_name),
        args.token_key_name.as_deref().unwrap_or(&default_custom_auth.token_key_name),
        args.token_value.as_deref().unwrap_or(&default_custom_auth.token_value)));

    let mut csr_subject = CsrSubject::default();
    if let Some(common_name) = &args.csr_common_name {
        csr_subject.common_name = common_name.clone();
    }
    if let Some(country) = &args.csr_country {
        csr_subject.country_name = country.clone();
    }
    if let Some(organization) = &args.csr_organization {
        csr_subject.organization_name = organization.clone();
    }
    if let Some(organizational_unit) = &args.csr_organizational_unit {
        csr_subject.organizational_unit_name = organizational_unit.clone();
    }
    builder = builder.with_csr_subject(csr_subject);

    if let Some(resources) = &args.resources {
        builder = builder.with_resource_directory(resources.clone());
    }

    if let Some(capath) = &args.capath {
        builder = builder.with_root_ca_path(capath.clone());
    }

    if let Some(connect_timeout) = args.connect_timeout {
        builder = builder.with_connect_timeout(Duration::from_secs(connect_timeout));
    }

    builder.build()
}

async fn build_console(args: &CommandLineArgs, runtime: &Handle) -> ElastiResult<Console> {
    let config = build_config(args);

    let data_directory = args.data_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIRECTORY));
    std::fs::create_dir_all(&data_directory).map_err(AuthError::from)?;

    let storage = Arc::new(FileKeyValueStore::open(data_directory.join("settings.json"))?);
    let vault = Arc::new(FileCredentialVault::open(data_directory.join("identities"))?);
    let bundle = ResourceBundle::new(config.resource_directory());
    let event_log = EventLog::new();

    let identity_service = Arc::new(CognitoIdentityService::from_region(config.region()).await);
    let credential_provider = CredentialProvider::new(identity_service, config.identity_pool_id(), config.region(), config.service_timeout());

    let registration = Arc::new(IotRegistrationService::from_cognito_credentials(config.region(), CognitoCredentialsProvider::new(credential_provider.clone())).await);
    let certificate_store = CertificateStore::new(
        storage.clone(),
        vault,
        bundle.clone(),
        registration,
        config.policy_name(),
        config.csr_subject().clone(),
        config.service_timeout(),
        event_log.clone());

    let token_signer = TokenSigner::new(bundle, storage);
    let transport = Arc::new(TokioMqttTransport::new_aws_iot(&config, runtime));

    Ok(Console {
        authenticator: ConnectionAuthenticator::new(credential_provider, certificate_store, token_signer, transport, event_log, runtime),
        custom_auth: config.custom_auth().clone(),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli_args: CommandLineArgs = argh::from_env();

    if let Some(log_file_path) = &cli_args.logpath {
        let log_file_result = File::create(log_file_path);
        if log_file_result.is_err() {
            println!("Could not create log file");
            return Ok(());
        }

        let mut log_config_builder = simplelog::ConfigBuilder::new();
        let log_config = log_config_builder.build();
        WriteLogger::init(LevelFilter::Debug, log_config, log_file_result.unwrap())?;
    }

    let console = build_console(&cli_args, &Handle::current()).await?;

    println!("elasti-gneiss-auth - an interactive AWS IoT Core connection console\n");
    println!(" `help` for command assistance\n");

    main_loop(console).await;

    Ok(())
}
