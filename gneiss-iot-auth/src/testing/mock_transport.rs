/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::error::{AuthError, AuthResult, TransportErrorKind};
use crate::transport::*;

use std::pin::Pin;
use std::sync::Mutex;
use std::sync::mpsc as std_mpsc;
use tokio::sync::mpsc;

/// Transport double that records connect requests and answers each one with a fixed script of
/// status changes.  Further statuses can be pushed with `emit`.
pub(crate) struct MockTransport {
    script: Vec<ConnectionStatus>,
    requests: Mutex<Vec<ConnectRequest>>,
    status_sender: Mutex<Option<StatusSender>>,
    disconnect_calls: Mutex<usize>,
    published: Mutex<Vec<(String, Vec<u8>, QualityOfService)>>,
    subscriptions: Mutex<Vec<(String, mpsc::UnboundedSender<InboundMessage>)>>,
    disconnect_gate: Mutex<Option<(std_mpsc::Sender<()>, std_mpsc::Receiver<()>)>>,
}

/// Controls a transport whose next `disconnect` blocks: `entered` signals that the call has
/// started and sending on `release` lets it return.
pub(crate) struct DisconnectGate {
    pub(crate) entered: std_mpsc::Receiver<()>,
    pub(crate) release: std_mpsc::Sender<()>,
}

fn create_status_event(status: ConnectionStatus) -> StatusEvent {
    match status {
        ConnectionStatus::ConnectionRefused => {
            StatusEvent::from_error(AuthError::new_transport_error(TransportErrorKind::Refused, "connack return code 5 (not authorized)"))
        }
        ConnectionStatus::ConnectionError => {
            StatusEvent::from_error(AuthError::new_transport_error(TransportErrorKind::ConnectionError, "connection reset by peer"))
        }
        ConnectionStatus::ProtocolError => {
            StatusEvent::from_error(AuthError::new_transport_error(TransportErrorKind::ProtocolError, "unexpected Suback packet from broker"))
        }
        _ => { StatusEvent::new(status) }
    }
}

impl MockTransport {
    pub(crate) fn new(script: Vec<ConnectionStatus>) -> Self {
        MockTransport {
            script,
            requests: Mutex::new(Vec::new()),
            status_sender: Mutex::new(None),
            disconnect_calls: Mutex::new(0),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            disconnect_gate: Mutex::new(None),
        }
    }

    pub(crate) fn with_blocking_disconnect(self) -> (Self, DisconnectGate) {
        let (entered_sender, entered_receiver) = std_mpsc::channel();
        let (release_sender, release_receiver) = std_mpsc::channel();
        *self.disconnect_gate.lock().unwrap() = Some((entered_sender, release_receiver));

        (self, DisconnectGate { entered: entered_receiver, release: release_sender })
    }

    pub(crate) fn new_connected() -> Self {
        MockTransport::new(vec![ConnectionStatus::Connecting, ConnectionStatus::Connected])
    }

    pub(crate) fn new_connecting() -> Self {
        MockTransport::new(vec![ConnectionStatus::Connecting])
    }

    pub(crate) fn emit(&self, status: ConnectionStatus) {
        if let Some(sender) = &*self.status_sender.lock().unwrap() {
            let _ = sender.send(create_status_event(status));
        }
    }

    pub(crate) fn deliver(&self, topic: &str, payload: &[u8]) {
        let subscriptions = self.subscriptions.lock().unwrap();
        for (topic_filter, sender) in subscriptions.iter() {
            if topic_matches_filter(topic_filter, topic) {
                let _ = sender.send(InboundMessage { topic: topic.to_string(), payload: payload.to_vec() });
            }
        }
    }

    pub(crate) fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn disconnect_calls(&self) -> usize {
        *self.disconnect_calls.lock().unwrap()
    }

    pub(crate) fn published(&self) -> Vec<(String, Vec<u8>, QualityOfService)> {
        self.published.lock().unwrap().clone()
    }
}

impl MqttTransport for MockTransport {
    fn connect(&self, request: ConnectRequest, status: StatusSender) -> AuthResult<()> {
        self.requests.lock().unwrap().push(request);

        for scripted_status in &self.script {
            let _ = status.send(create_status_event(*scripted_status));
        }

        *self.status_sender.lock().unwrap() = Some(status);
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QualityOfService) -> Pin<Box<PublishFuture>> {
        self.published.lock().unwrap().push((topic.to_string(), payload.to_vec(), qos));
        Box::pin(async move { Ok(()) })
    }

    fn subscribe(&self, topic_filter: &str) -> Pin<Box<SubscribeFuture>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscriptions.lock().unwrap().push((topic_filter.to_string(), sender));
        Box::pin(async move { Ok(receiver) })
    }

    fn disconnect(&self) -> AuthResult<()> {
        *self.disconnect_calls.lock().unwrap() += 1;

        let gate = self.disconnect_gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }

        self.status_sender.lock().unwrap().take();
        Ok(())
    }
}
