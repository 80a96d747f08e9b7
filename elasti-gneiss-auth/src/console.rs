/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use argh::FromArgs;
use gneiss_iot_auth::*;
use std::fmt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "connect")]
/// connects using an authentication strategy
struct ConnectArgs {

    /// authentication strategy: credentials, cert, or custom
    #[argh(positional)]
    strategy: String,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "disconnect")]
/// disconnects from the gateway
struct DisconnectArgs {
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "provision")]
/// finds or provisions the client certificate used by cert connections
struct ProvisionArgs {
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "publish")]
/// publishes a message
struct PublishArgs {

    /// topic to publish a message to
    #[argh(positional)]
    topic: String,

    /// message payload
    #[argh(positional)]
    payload: Option<String>,

    /// quality of service (0, 1)
    #[argh(option, default = "0")]
    qos: u8,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "subscribe")]
/// subscribes to a topic filter and prints received messages
struct SubscribeArgs {

    /// topic filter to subscribe to
    #[argh(positional)]
    topic_filter: String,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "log")]
/// prints the event log
struct LogArgs {
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "quit")]
/// causes the program to quit
struct QuitArgs {
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand)]
enum SubCommandEnum {
    Connect(ConnectArgs),
    Disconnect(DisconnectArgs),
    Provision(ProvisionArgs),
    Publish(PublishArgs),
    Subscribe(SubscribeArgs),
    Log(LogArgs),
    Quit(QuitArgs),
}

#[derive(FromArgs, Debug, PartialEq)]
/// elasti-gneiss-auth - an interactive AWS IoT connection console
struct CommandArgs {
    #[argh(subcommand)]
    nested: SubCommandEnum,
}

#[derive(Debug)]
pub enum ElastiError {
    AuthError(AuthError),
    InvalidStrategy(String),
}

impl fmt::Display for ElastiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElastiError::AuthError(inner) => {
                write!(f, "authentication error - {}", inner)
            }
            ElastiError::InvalidStrategy(strategy) => {
                write!(f, "invalid strategy - `{}`; expected credentials, cert, or custom", strategy)
            }
        }
    }
}

impl std::error::Error for ElastiError {
}

impl From<AuthError> for ElastiError {
    fn from(value: AuthError) -> Self {
        ElastiError::AuthError(value)
    }
}

pub type ElastiResult<T> = Result<T, ElastiError>;

/// Everything the command loop operates on
pub struct Console {
    pub authenticator: ConnectionAuthenticator,
    pub custom_auth: CustomAuthToken,
}

fn parse_strategy(strategy: &str, custom_auth: &CustomAuthToken) -> ElastiResult<AuthStrategy> {
    match strategy.to_lowercase().as_str() {
        "credentials" => { Ok(AuthStrategy::CredentialsBased) }
        "cert" => { Ok(AuthStrategy::CertBased) }
        "custom" => { Ok(AuthStrategy::CustomBased(custom_auth.clone())) }
        _ => { Err(ElastiError::InvalidStrategy(strategy.to_string())) }
    }
}

fn print_entry(entry: &LogEntry) {
    println!("[{}] {} {}", entry.id, entry.timestamp, entry.body);
}

fn handle_connect(console: &Console, args: ConnectArgs) {
    let strategy =
        match parse_strategy(&args.strategy, &console.custom_auth) {
            Ok(strategy) => { strategy }
            Err(err) => {
                println!("{}\n", err);
                return;
            }
        };

    let result = console.authenticator.connect_with_callback(strategy, |connected, reason| {
        if connected {
            println!("Connect Result: Connected\n");
        } else {
            println!("Connect Result: Not Connected ( {} )\n", reason.unwrap_or_default());
        }
    });

    if let Err(err) = result {
        println!("Connect Result: Err( {} )\n", err);
    }
}

fn handle_disconnect(console: &Console, _: DisconnectArgs) {
    if let Err(err) = console.authenticator.disconnect() {
        println!("Disconnect Result: Err( {} )\n", err);
    }
}

async fn handle_provision(console: &Console, _: ProvisionArgs) {
    match console.authenticator.provision_certificate().await {
        Ok(certificate) => {
            println!("Provision Result: Ok( {} - {} )\n", certificate.certificate_id, certificate.certificate_arn);
        }
        Err(err) => {
            println!("Provision Result: Err( {} )\n", err);
        }
    }
}

async fn handle_publish(console: &Console, args: PublishArgs) {
    let qos =
        match QualityOfService::try_from(args.qos) {
            Ok(qos) => { qos }
            Err(_) => {
                println!("Invalid input!  Qos must be 0 or 1");
                return;
            }
        };

    let payload = args.payload.unwrap_or_default();
    match console.authenticator.publish(&args.topic, payload.as_bytes(), qos).await {
        Ok(()) => {
            println!("Publish Result: Ok\n");
        }
        Err(err) => {
            println!("Publish Result: Err( {} )\n", err);
        }
    }
}

async fn handle_subscribe(console: &Console, args: SubscribeArgs) {
    match console.authenticator.subscribe(&args.topic_filter).await {
        Ok(mut messages) => {
            println!("Subscribe Result: Ok\n");
            tokio::spawn(async move {
                while let Some(message) = messages.recv().await {
                    println!("Publish Received!");
                    println!("{} => {}\n", message.topic, String::from_utf8_lossy(&message.payload));
                }
            });
        }
        Err(err) => {
            println!("Subscribe Result: Err( {} )\n", err);
        }
    }
}

fn handle_log(console: &Console, _: LogArgs) {
    for entry in console.authenticator.event_log().entries() {
        print_entry(&entry);
    }

    println!();
}

async fn handle_input(value: String, console: &Console) -> bool {
    let args : Vec<&str> = value.split_whitespace().collect();
    if args.is_empty() {
        println!("Invalid input!");
        return false;
    }

    let parsed_result = CommandArgs::from_args(&[], &args[0..]);
    if let Err(err) = parsed_result {
        println!("{}", err.output);

        return false;
    }

    match parsed_result.unwrap().nested {
        SubCommandEnum::Connect(args) => { handle_connect(console, args) }
        SubCommandEnum::Disconnect(args) => { handle_disconnect(console, args) }
        SubCommandEnum::Provision(args) => { handle_provision(console, args).await }
        SubCommandEnum::Publish(args) => { handle_publish(console, args).await }
        SubCommandEnum::Subscribe(args) => { handle_subscribe(console, args).await }
        SubCommandEnum::Log(args) => { handle_log(console, args) }
        SubCommandEnum::Quit(_) => { return true; }
    }

    false
}

async fn echo_log_entries<F>(mut log_listener: broadcast::Receiver<LogEntry>, mut echo: F) where F : FnMut(&LogEntry) {
    loop {
        match log_listener.recv().await {
            Ok(entry) => { echo(&entry); }
            Err(RecvError::Lagged(skipped)) => {
                println!("({} log entries skipped; `log` prints the full log)", skipped);
            }
            Err(RecvError::Closed) => { break; }
        }
    }
}

pub async fn main_loop(console: Console) {
    let log_listener = console.authenticator.event_log().subscribe();
    tokio::spawn(echo_log_entries(log_listener, print_entry));

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if handle_input(line, &console).await {
            break;
        }
    }

    let _ = console.authenticator.disconnect();

    println!("Done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn strategy_names() {
        let custom_auth = CustomAuthToken::new("authorizer", "token-key-name", "allow");

        assert_matches!(parse_strategy("credentials", &custom_auth), Ok(AuthStrategy::CredentialsBased));
        assert_matches!(parse_strategy("CERT", &custom_auth), Ok(AuthStrategy::CertBased));
        assert_eq!(AuthStrategy::CustomBased(custom_auth.clone()), parse_strategy("custom", &custom_auth).unwrap());
        assert_matches!(parse_strategy("password", &custom_auth), Err(ElastiError::InvalidStrategy(_)));
    }

    #[test]
    fn commands_parse() {
        assert_eq!(SubCommandEnum::Connect(ConnectArgs { strategy: "custom".to_string() }), CommandArgs::from_args(&[], &["connect", "custom"]).unwrap().nested);
        assert_eq!(SubCommandEnum::Publish(PublishArgs { topic: "a/b".to_string(), payload: Some("hi".to_string()), qos: 1 }), CommandArgs::from_args(&[], &["publish", "a/b", "hi", "--qos", "1"]).unwrap().nested);
        assert!(CommandArgs::from_args(&[], &["connect"]).is_err());
    }

    #[tokio::test]
    async fn log_echo_survives_lag() {
        let event_log = EventLog::new();
        let log_listener = event_log.subscribe();
        for index in 0..300 {
            event_log.append(format!("entry {}", index));
        }
        drop(event_log);

        let mut echoed = Vec::new();
        echo_log_entries(log_listener, |entry| echoed.push(entry.body.clone())).await;

        assert!(!echoed.is_empty());
        assert_eq!(Some(&"entry 299".to_string()), echoed.last());
    }
}
