/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The connection authenticator: selects an authentication strategy, acquires whatever the strategy
needs, opens the transport connection, and reports the attempt's single terminal outcome.

Every transport status change is written to the event log.  Exactly one terminal outcome is
reported per attempt, either through the [`ConnectionAttemptHandle`] returned by
[`ConnectionAuthenticator::connect`] or through the callback given to
[`ConnectionAuthenticator::connect_with_callback`].
 */

use crate::certificate::{CertificateIdentity, CertificateStore};
use crate::config::CustomAuthToken;
use crate::credentials::CredentialProvider;
use crate::error::{AuthError, AuthResult};
use crate::event_log::EventLog;
use crate::signer::TokenSigner;
use crate::transport::*;

use log::*;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CANCELLED_REASON: &str = "cancelled";

/// How a connection authenticates with the broker
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuthStrategy {

    /// temporary credentials from the identity pool; websocket transport
    CredentialsBased,

    /// client certificate from durable storage or the resource bundle; mutual TLS transport
    CertBased,

    /// signed custom-authorizer token; websocket transport
    CustomBased(CustomAuthToken),
}

impl fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStrategy::CredentialsBased => { write!(f, "credentials") }
            AuthStrategy::CertBased => { write!(f, "certificate") }
            AuthStrategy::CustomBased(_) => { write!(f, "custom authorizer") }
        }
    }
}

/// Terminal result of a connection attempt
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectOutcome {

    /// true if the broker accepted the connection
    pub connected: bool,

    /// failure reason when not connected
    pub reason: Option<String>,
}

impl ConnectOutcome {
    fn connected() -> Self {
        ConnectOutcome {
            connected: true,
            reason: None,
        }
    }

    fn failed(reason: String) -> Self {
        ConnectOutcome {
            connected: false,
            reason: Some(reason),
        }
    }

    fn cancelled() -> Self {
        ConnectOutcome::failed(CANCELLED_REASON.to_string())
    }
}

/// Lifecycle state of the authenticator's single session
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuthenticatorState {

    /// no attempt in progress and no session
    Idle,

    /// acquiring credentials, a certificate, or a token signature
    Resolving,

    /// the transport is establishing the connection
    Connecting,

    /// the broker accepted the connection
    Connected,

    /// the last attempt failed
    Failed,

    /// a user-requested teardown is in progress
    Disconnecting,
}

/// Handle to an in-flight connection attempt
#[derive(Debug)]
pub struct ConnectionAttemptHandle {
    outcome_receiver: oneshot::Receiver<ConnectOutcome>,
    cancel: CancellationToken,
}

impl ConnectionAttemptHandle {

    /// Waits for the attempt's terminal outcome.  A cancelled attempt reports
    /// `connected = false` with the reason "cancelled".
    pub async fn outcome(self) -> ConnectOutcome {
        self.wait().await.unwrap_or_else(ConnectOutcome::cancelled)
    }

    /// Cancels the attempt.  No terminal outcome is delivered afterwards and an in-flight
    /// transport connection is torn down.  Has no effect once the outcome has been delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this attempt when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn wait(self) -> Option<ConnectOutcome> {
        self.outcome_receiver.await.ok()
    }
}

struct SessionTracking {
    state: AuthenticatorState,
    status: ConnectionStatus,
    attempt_id: u64,
    abort: Option<CancellationToken>,
}

struct AuthenticatorInner {
    credential_provider: CredentialProvider,
    certificate_store: CertificateStore,
    token_signer: TokenSigner,
    transport: Arc<dyn MqttTransport>,
    event_log: EventLog,
    runtime: Handle,
    tracking: Mutex<SessionTracking>,
}

/// Establishes and tracks the single MQTT session of this installation.
///
/// All network work runs on the runtime the authenticator was created with; no method blocks
/// on the network.
#[derive(Clone)]
pub struct ConnectionAuthenticator {
    inner: Arc<AuthenticatorInner>,
}

impl ConnectionAuthenticator {

    /// Creates a new authenticator that runs its work on `runtime`
    pub fn new(credential_provider: CredentialProvider, certificate_store: CertificateStore, token_signer: TokenSigner, transport: Arc<dyn MqttTransport>, event_log: EventLog, runtime: &Handle) -> Self {
        ConnectionAuthenticator {
            inner: Arc::new(AuthenticatorInner {
                credential_provider,
                certificate_store,
                token_signer,
                transport,
                event_log,
                runtime: runtime.clone(),
                tracking: Mutex::new(SessionTracking {
                    state: AuthenticatorState::Idle,
                    status: ConnectionStatus::Disconnected,
                    attempt_id: 0,
                    abort: None,
                }),
            })
        }
    }

    /// Starts a connection attempt and returns immediately.
    ///
    /// Fails with `AlreadyConnecting` while another attempt is resolving or connecting, while
    /// a session is connected, or while a disconnect is still tearing the transport down.
    pub fn connect(&self, strategy: AuthStrategy) -> AuthResult<ConnectionAttemptHandle> {
        let (attempt_id, abort) = {
            let mut tracking = self.inner.tracking.lock().unwrap();
            let state = tracking.state;
            match state {
                AuthenticatorState::Resolving | AuthenticatorState::Connecting | AuthenticatorState::Connected | AuthenticatorState::Disconnecting => {
                    drop(tracking);
                    let error = AuthError::new_already_connecting();
                    self.inner.event_log.append(error.to_string());
                    return Err(error);
                }
                _ => {}
            }

            let abort = CancellationToken::new();
            tracking.attempt_id += 1;
            tracking.state = AuthenticatorState::Resolving;
            tracking.abort = Some(abort.clone());

            (tracking.attempt_id, abort)
        };

        info!("connect - starting attempt {} using {} authentication", attempt_id, strategy);

        let (outcome_sender, outcome_receiver) = oneshot::channel();
        let cancel = CancellationToken::new();

        let attempt = ConnectionAttempt {
            inner: self.inner.clone(),
            attempt_id,
            cancel: cancel.clone(),
            abort,
            outcome_sender: Some(outcome_sender),
        };

        self.inner.runtime.spawn(attempt.run(strategy));

        Ok(ConnectionAttemptHandle {
            outcome_receiver,
            cancel,
        })
    }

    /// Starts a connection attempt and invokes `callback` with `(connected, reason)` once its
    /// terminal outcome is known.  The callback runs on its own task and is never invoked for
    /// a cancelled attempt.
    pub fn connect_with_callback<F>(&self, strategy: AuthStrategy, callback: F) -> AuthResult<CancellationToken> where F : FnOnce(bool, Option<String>) + Send + 'static {
        let handle = self.connect(strategy)?;
        let cancel = handle.cancellation_token();

        self.inner.runtime.spawn(async move {
            if let Some(outcome) = handle.wait().await {
                callback(outcome.connected, outcome.reason);
            }
        });

        Ok(cancel)
    }

    /// Requests teardown of the current session or attempt and resets the status to
    /// `Disconnected`.  Safe to call when already disconnected.
    pub fn disconnect(&self) -> AuthResult<()> {
        let (disconnect_id, abort) = {
            let mut tracking = self.inner.tracking.lock().unwrap();
            tracking.attempt_id += 1;
            tracking.state = AuthenticatorState::Disconnecting;
            (tracking.attempt_id, tracking.abort.take())
        };

        self.inner.event_log.append("Attempting to disconnect from IoT Core gateway");
        if let Some(abort) = abort {
            abort.cancel();
        }

        let result = self.inner.transport.disconnect();

        let mut tracking = self.inner.tracking.lock().unwrap();
        if tracking.attempt_id == disconnect_id {
            tracking.state = AuthenticatorState::Idle;
            tracking.status = ConnectionStatus::Disconnected;
        }

        result
    }

    /// Explicit provisioning action: returns the active certificate identity, creating and
    /// registering a new certificate when neither durable storage nor the resource bundle
    /// provides one.
    pub async fn provision_certificate(&self) -> AuthResult<CertificateIdentity> {
        let certificate_store = self.inner.certificate_store.clone();
        let event_log = self.inner.event_log.clone();

        let task = self.inner.runtime.spawn(async move {
            let result = certificate_store.resolve_certificate().await;
            if let Err(error) = &result {
                event_log.append(format!("Certificate provisioning failed => {}", error));
            }

            result
        });

        task.await.map_err(AuthError::new_operation_channel_failure)?
    }

    /// Publishes a message on the current session
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: QualityOfService) -> AuthResult<()> {
        self.inner.transport.publish(topic, payload, qos).await
    }

    /// Subscribes to a topic filter on the current session
    pub async fn subscribe(&self, topic_filter: &str) -> AuthResult<mpsc::UnboundedReceiver<InboundMessage>> {
        self.inner.transport.subscribe(topic_filter).await
    }

    /// Current lifecycle state
    pub fn state(&self) -> AuthenticatorState {
        self.inner.tracking.lock().unwrap().state
    }

    /// Last connection status reported for the current session
    pub fn status(&self) -> ConnectionStatus {
        self.inner.tracking.lock().unwrap().status
    }

    /// The event log this authenticator writes to
    pub fn event_log(&self) -> &EventLog {
        &self.inner.event_log
    }
}

struct ConnectionAttempt {
    inner: Arc<AuthenticatorInner>,
    attempt_id: u64,
    cancel: CancellationToken,
    abort: CancellationToken,
    outcome_sender: Option<oneshot::Sender<ConnectOutcome>>,
}

impl ConnectionAttempt {

    async fn run(mut self, strategy: AuthStrategy) {
        let prepare_result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.on_cancelled();
                return;
            }
            () = self.abort.cancelled() => {
                self.deliver(ConnectOutcome::failed(ConnectionStatus::Disconnected.to_string()));
                return;
            }
            prepare_result = self.prepare_request(&strategy) => { prepare_result }
        };

        let request =
            match prepare_result {
                Ok(request) => { request }
                Err(error) => {
                    self.on_preparation_failure(error);
                    return;
                }
            };

        let (status_sender, status_receiver) = mpsc::unbounded_channel();
        {
            let mut tracking = self.inner.tracking.lock().unwrap();
            if tracking.attempt_id != self.attempt_id {
                drop(tracking);
                debug!("run - attempt {} superseded before transport connect", self.attempt_id);
                self.deliver(ConnectOutcome::failed(ConnectionStatus::Disconnected.to_string()));
                return;
            }

            tracking.state = AuthenticatorState::Connecting;
            self.inner.event_log.append(format!("Attempting to connect to IoT device gateway with ID = {}", request.client_id));

            if let Err(error) = self.inner.transport.connect(request, status_sender) {
                tracking.state = AuthenticatorState::Failed;
                tracking.status = ConnectionStatus::ConnectionError;
                drop(tracking);

                self.inner.event_log.append(format!("Unable to start connection => {}", error));
                self.deliver(ConnectOutcome::failed(error.to_string()));
                return;
            }
        }

        self.process_status_events(status_receiver).await;
    }

    async fn prepare_request(&self, strategy: &AuthStrategy) -> AuthResult<ConnectRequest> {
        match strategy {
            AuthStrategy::CredentialsBased => { self.prepare_credentials_request().await }
            AuthStrategy::CertBased => { self.prepare_certificate_request() }
            AuthStrategy::CustomBased(custom_auth) => { self.prepare_custom_authorizer_request(custom_auth) }
        }
    }

    async fn prepare_credentials_request(&self) -> AuthResult<ConnectRequest> {
        let provider = &self.inner.credential_provider;
        let event_log = &self.inner.event_log;

        event_log.append(format!("Connecting to AWS IoT in region -> {}", provider.region()));
        event_log.append(format!("Using Cognito Identity Pool Id -> {}", provider.identity_pool_id()));

        let identity =
            match provider.get_identity().await {
                Ok(identity) => { identity }
                Err(error) => {
                    event_log.append(format!("Failed to get client ID => {}", error));
                    return Err(error);
                }
            };

        event_log.append(format!("Got client ID => {}", identity.identity_id));

        let credentials =
            match provider.get_credentials(&identity).await {
                Ok(credentials) => { credentials }
                Err(error) => {
                    event_log.append(format!("Failed to get credentials => {}", error));
                    return Err(error);
                }
            };

        event_log.append(format!("Connecting to AWS IoT with clientId -> {}", identity.identity_id));

        Ok(ConnectRequest {
            client_id: identity.identity_id,
            clean_session: true,
            auth: TransportAuth::Credentials {
                region: provider.region().to_string(),
                credentials,
            },
        })
    }

    fn prepare_certificate_request(&self) -> AuthResult<ConnectRequest> {
        let store = &self.inner.certificate_store;

        let certificate =
            match store.find_certificate()? {
                Some(certificate) => { certificate }
                None => {
                    self.inner.event_log.append("No certificate identity available; run certificate provisioning first");
                    return Err(AuthError::new_no_identity_available());
                }
            };

        let identity = store.client_identity(&certificate)?;
        let client_id = Uuid::new_v4().to_string();
        self.inner.event_log.append(format!("Connecting to AWS IoT with clientId -> {}", client_id));

        Ok(ConnectRequest {
            client_id,
            clean_session: true,
            auth: TransportAuth::Certificate {
                identity,
            },
        })
    }

    fn prepare_custom_authorizer_request(&self, custom_auth: &CustomAuthToken) -> AuthResult<ConnectRequest> {
        let token_signature =
            match self.inner.token_signer.sign(&custom_auth.token_value) {
                Ok(signature) => { signature }
                Err(error) => {
                    self.inner.event_log.append(format!("Unable to sign custom authorizer token => {}", error));
                    return Err(error);
                }
            };

        let client_id = Uuid::new_v4().to_string();
        self.inner.event_log.append(format!("Connecting to AWS IoT with clientId -> {}", client_id));

        Ok(ConnectRequest {
            client_id,
            clean_session: true,
            auth: TransportAuth::CustomAuthorizer {
                authorizer_name: custom_auth.authorizer_name.clone(),
                token_key_name: custom_auth.token_key_name.clone(),
                token_value: custom_auth.token_value.clone(),
                token_signature,
            },
        })
    }

    fn on_preparation_failure(&mut self, error: AuthError) {
        info!("on_preparation_failure - attempt {} failed: {}", self.attempt_id, error);

        let refused = matches!(error, AuthError::NoIdentityAvailable(_));
        {
            let mut tracking = self.inner.tracking.lock().unwrap();
            if tracking.attempt_id == self.attempt_id {
                tracking.state = AuthenticatorState::Failed;
                tracking.abort = None;
                if refused {
                    tracking.status = ConnectionStatus::ConnectionRefused;
                }
            }
        }

        if refused {
            self.inner.event_log.append(ConnectionStatus::ConnectionRefused.to_string());
        }

        self.deliver(ConnectOutcome::failed(error.to_string()));
    }

    fn on_cancelled(&mut self) {
        self.inner.event_log.append("Connection attempt cancelled");
        self.outcome_sender = None;

        let mut tracking = self.inner.tracking.lock().unwrap();
        if tracking.attempt_id == self.attempt_id {
            tracking.state = AuthenticatorState::Idle;
            tracking.status = ConnectionStatus::Disconnected;
            tracking.abort = None;
        }
    }

    async fn process_status_events(mut self, mut status_receiver: mpsc::UnboundedReceiver<StatusEvent>) {
        loop {
            let event =
                if self.outcome_sender.is_some() {
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => {
                            self.on_cancelled();
                            if let Err(error) = self.inner.transport.disconnect() {
                                warn!("process_status_events - transport teardown failed: {}", error);
                            }
                            continue;
                        }
                        () = self.abort.cancelled() => {
                            self.deliver(ConnectOutcome::failed(ConnectionStatus::Disconnected.to_string()));
                            continue;
                        }
                        event = status_receiver.recv() => { event }
                    }
                } else {
                    status_receiver.recv().await
                };

            match event {
                Some(event) => { self.handle_status_event(event); }
                None => { break; }
            }
        }

        if self.outcome_sender.is_some() {
            self.deliver(ConnectOutcome::failed(ConnectionStatus::Unknown.to_string()));
        }

        debug!("process_status_events - attempt {} status channel closed", self.attempt_id);
    }

    fn handle_status_event(&mut self, event: StatusEvent) {
        let status = event.status;
        self.inner.event_log.append(status.to_string());
        if let Some(error) = &event.error {
            self.inner.event_log.append(format!("{} => {}", status, error));
        }

        let applied = {
            let mut tracking = self.inner.tracking.lock().unwrap();
            let applied = tracking.attempt_id == self.attempt_id && accepts_status(tracking.state, status);
            if applied {
                tracking.status = status;
                match status {
                    ConnectionStatus::Connected => {
                        tracking.state = AuthenticatorState::Connected;
                    }
                    ConnectionStatus::Disconnected => {
                        tracking.state =
                            if tracking.state == AuthenticatorState::Connected {
                                AuthenticatorState::Idle
                            } else {
                                AuthenticatorState::Failed
                            };
                    }
                    ConnectionStatus::ConnectionRefused | ConnectionStatus::ConnectionError | ConnectionStatus::ProtocolError => {
                        tracking.state = AuthenticatorState::Failed;
                    }
                    ConnectionStatus::Connecting | ConnectionStatus::Unknown => {}
                }
            } else {
                debug!("handle_status_event - attempt {} ignoring {:?} status", self.attempt_id, status);
            }

            applied
        };

        if applied && status == ConnectionStatus::ConnectionError {
            debug!("handle_status_event - tearing down transport after connection error");
            if let Err(error) = self.inner.transport.disconnect() {
                warn!("handle_status_event - transport teardown failed: {}", error);
            }
        }

        if status.is_terminal() {
            let outcome =
                if status == ConnectionStatus::Connected {
                    ConnectOutcome::connected()
                } else {
                    let reason = event.error.map(|error| error.to_string()).unwrap_or_else(|| status.to_string());
                    ConnectOutcome::failed(reason)
                };

            self.deliver(outcome);
        }
    }

    fn deliver(&mut self, outcome: ConnectOutcome) {
        if let Some(outcome_sender) = self.outcome_sender.take() {
            debug!("deliver - attempt {} outcome: {:?}", self.attempt_id, outcome);
            let _ = outcome_sender.send(outcome);
        }
    }
}

// An attempt's status never moves backwards: nothing follows a failure, and a connected
// session can only drop or fail.  Idle and Disconnecting mean the attempt has already ended.
fn accepts_status(state: AuthenticatorState, status: ConnectionStatus) -> bool {
    match state {
        AuthenticatorState::Resolving | AuthenticatorState::Connecting => { true }
        AuthenticatorState::Connected => { status == ConnectionStatus::Disconnected || status.is_failure() }
        AuthenticatorState::Idle | AuthenticatorState::Failed | AuthenticatorState::Disconnecting => { false }
    }
}
