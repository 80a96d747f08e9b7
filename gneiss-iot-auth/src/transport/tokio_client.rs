/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::config::IotAuthConfig;
use crate::error::{AuthError, AuthResult, TransportErrorKind};
use crate::transport::*;
use crate::transport::codec::*;
use crate::transport::stream::{BoxedStream, ConnectionFactory, create_aws_iot_connection_factory};

use log::*;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, split};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, Instant};

const CONNACK_ACCEPTED: u8 = 0;

type PublishResponder = oneshot::Sender<AuthResult<()>>;
type SubscribeResponder = oneshot::Sender<AuthResult<mpsc::UnboundedReceiver<InboundMessage>>>;

enum SessionOperation {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QualityOfService,
        response: PublishResponder,
    },
    Subscribe {
        topic_filter: String,
        response: SubscribeResponder,
    },
    Disconnect,
}

impl SessionOperation {
    fn fail_not_connected(self) {
        match self {
            SessionOperation::Publish { response, .. } => {
                let _ = response.send(Err(AuthError::new_not_connected()));
            }
            SessionOperation::Subscribe { response, .. } => {
                let _ = response.send(Err(AuthError::new_not_connected()));
            }
            SessionOperation::Disconnect => {}
        }
    }
}

/// MQTT 3.1.1 transport running each connection as a task on a tokio runtime.
///
/// Streams are opened by a connection factory, which decides how the connect request's
/// authentication is applied (websocket upgrade, mutual TLS, or nothing at all).
pub struct TokioMqttTransport {
    connection_factory: ConnectionFactory,
    keep_alive_interval: Duration,
    connect_timeout: Duration,
    runtime: Handle,
    session: Mutex<Option<mpsc::UnboundedSender<SessionOperation>>>,
}

impl TokioMqttTransport {

    /// Creates a transport that opens streams with `connection_factory`
    pub fn new(connection_factory: ConnectionFactory, keep_alive_interval: Duration, connect_timeout: Duration, runtime: &Handle) -> Self {
        TokioMqttTransport {
            connection_factory,
            keep_alive_interval: keep_alive_interval.max(Duration::from_secs(1)),
            connect_timeout,
            runtime: runtime.clone(),
            session: Mutex::new(None),
        }
    }

    /// Creates a transport that connects to the AWS IoT Core endpoint of a configuration
    pub fn new_aws_iot(config: &IotAuthConfig, runtime: &Handle) -> Self {
        let factory = create_aws_iot_connection_factory(config.endpoint(), config.root_ca_path().map(|path| path.to_path_buf()));

        TokioMqttTransport::new(factory, config.keep_alive_interval(), config.connect_timeout(), runtime)
    }

    fn submit(&self, operation: SessionOperation) {
        let session = self.session.lock().unwrap();
        match &*session {
            Some(sender) => {
                if let Err(mpsc::error::SendError(operation)) = sender.send(operation) {
                    operation.fail_not_connected();
                }
            }
            None => {
                operation.fail_not_connected();
            }
        }
    }
}

impl MqttTransport for TokioMqttTransport {
    fn connect(&self, request: ConnectRequest, status: StatusSender) -> AuthResult<()> {
        let (operation_sender, operation_receiver) = mpsc::unbounded_channel();

        {
            let mut session = self.session.lock().unwrap();
            if let Some(previous) = session.take() {
                debug!("connect - replacing previous session");
                let _ = previous.send(SessionOperation::Disconnect);
            }
            *session = Some(operation_sender);
        }

        let connection_factory = self.connection_factory.clone();
        let keep_alive_interval = self.keep_alive_interval;
        let connect_timeout = self.connect_timeout;

        self.runtime.spawn(async move {
            run_session(connection_factory, request, status, operation_receiver, keep_alive_interval, connect_timeout).await;
        });

        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QualityOfService) -> Pin<Box<PublishFuture>> {
        let (response_sender, response_receiver) = oneshot::channel();
        self.submit(SessionOperation::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            response: response_sender,
        });

        Box::pin(async move {
            response_receiver.await?
        })
    }

    fn subscribe(&self, topic_filter: &str) -> Pin<Box<SubscribeFuture>> {
        let (response_sender, response_receiver) = oneshot::channel();
        self.submit(SessionOperation::Subscribe {
            topic_filter: topic_filter.to_string(),
            response: response_sender,
        });

        Box::pin(async move {
            response_receiver.await?
        })
    }

    fn disconnect(&self) -> AuthResult<()> {
        let mut session = self.session.lock().unwrap();
        if let Some(sender) = session.take() {
            debug!("disconnect - requesting session teardown");
            let _ = sender.send(SessionOperation::Disconnect);
        }

        Ok(())
    }
}

fn connection_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> AuthError {
    AuthError::new_transport_error(TransportErrorKind::ConnectionError, source)
}

fn protocol_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> AuthError {
    AuthError::new_transport_error(TransportErrorKind::ProtocolError, source)
}

fn describe_connack_return_code(return_code: u8) -> &'static str {
    match return_code {
        1 => { "unacceptable protocol version" }
        2 => { "identifier rejected" }
        3 => { "server unavailable" }
        4 => { "bad user name or password" }
        5 => { "not authorized" }
        _ => { "unknown return code" }
    }
}

fn keep_alive_seconds(keep_alive_interval: Duration) -> u16 {
    u16::try_from(keep_alive_interval.as_secs()).unwrap_or(u16::MAX)
}

async fn write_packet<W>(writer: &mut W, packet: &MqttPacket) -> AuthResult<()> where W : AsyncWrite + Unpin {
    let mut bytes = Vec::with_capacity(128);
    encode_packet(packet, &mut bytes)?;

    trace!("write_packet - writing {} packet ({} bytes)", packet_type_name(packet), bytes.len());
    writer.write_all(&bytes).await.map_err(connection_error)?;
    writer.flush().await.map_err(connection_error)?;

    Ok(())
}

async fn run_session(connection_factory: ConnectionFactory, request: ConnectRequest, status: StatusSender, mut operation_receiver: mpsc::UnboundedReceiver<SessionOperation>, keep_alive_interval: Duration, connect_timeout: Duration) {
    info!("run_session - connecting with client id {}", request.client_id);
    let _ = status.send(StatusEvent::new(ConnectionStatus::Connecting));

    let establish = establish_session(connection_factory, &request, keep_alive_interval);
    tokio::pin!(establish);

    let timeout = sleep(connect_timeout);
    tokio::pin!(timeout);

    let (stream, session_state) = loop {
        tokio::select! {
            operation = operation_receiver.recv() => {
                match operation {
                    Some(SessionOperation::Disconnect) | None => {
                        info!("run_session - disconnect requested while connecting");
                        let _ = status.send(StatusEvent::new(ConnectionStatus::Disconnected));
                        return;
                    }
                    Some(operation) => {
                        debug!("run_session - rejecting operation submitted while connecting");
                        operation.fail_not_connected();
                    }
                }
            }
            () = &mut timeout => {
                info!("run_session - connection establishment timeout exceeded");
                let _ = status.send(StatusEvent::from_error(connection_error("connection establishment timeout reached")));
                return;
            }
            establish_result = &mut establish => {
                match establish_result {
                    Ok(established) => { break established; }
                    Err(error) => {
                        info!("run_session - connection establishment failed: {}", error);
                        let _ = status.send(StatusEvent::from_error(error));
                        return;
                    }
                }
            }
        }
    };

    info!("run_session - connection established");
    let _ = status.send(StatusEvent::new(ConnectionStatus::Connected));

    match run_connected(stream, session_state, &mut operation_receiver, keep_alive_interval).await {
        Ok(()) => {
            info!("run_session - session closed");
            let _ = status.send(StatusEvent::new(ConnectionStatus::Disconnected));
        }
        Err(error) => {
            info!("run_session - session failed: {}", error);
            let _ = status.send(StatusEvent::from_error(error));
        }
    }

    while let Ok(operation) = operation_receiver.try_recv() {
        operation.fail_not_connected();
    }
}

async fn establish_session(connection_factory: ConnectionFactory, request: &ConnectRequest, keep_alive_interval: Duration) -> AuthResult<(BoxedStream, SessionState)> {
    let mut stream = (connection_factory)(request).await?;

    let connect = MqttPacket::Connect(ConnectPacket {
        client_id: request.client_id.clone(),
        clean_session: request.clean_session,
        keep_alive_seconds: keep_alive_seconds(keep_alive_interval),
        username: None,
        password: None,
    });
    write_packet(&mut stream, &connect).await?;

    let mut decoder = Decoder::new();
    let mut packets = VecDeque::new();
    let mut inbound_data: [u8; 4096] = [0; 4096];

    loop {
        let bytes_read = stream.read(inbound_data.as_mut_slice()).await.map_err(connection_error)?;
        if bytes_read == 0 {
            return Err(connection_error("connection closed before connack was received"));
        }

        decoder.decode_bytes(&inbound_data[..bytes_read], &mut packets).map_err(protocol_error)?;

        if let Some(packet) = packets.pop_front() {
            return match packet {
                MqttPacket::Connack(connack) => {
                    if connack.return_code != CONNACK_ACCEPTED {
                        let reason = format!("connack return code {} ({})", connack.return_code, describe_connack_return_code(connack.return_code));
                        Err(AuthError::new_transport_error(TransportErrorKind::Refused, reason))
                    } else {
                        Ok((stream, SessionState::new(decoder, packets)))
                    }
                }
                other => {
                    Err(protocol_error(format!("expected Connack, received {}", packet_type_name(&other))))
                }
            };
        }
    }
}

struct SessionState {
    decoder: Decoder,
    unprocessed_packets: VecDeque<MqttPacket>,
    subscriptions: Vec<(String, mpsc::UnboundedSender<InboundMessage>)>,
    pending_publishes: HashMap<u16, PublishResponder>,
    pending_subscribes: HashMap<u16, (String, SubscribeResponder)>,
    next_packet_id: u16,
    ping_outstanding: bool,
}

impl SessionState {
    fn new(decoder: Decoder, unprocessed_packets: VecDeque<MqttPacket>) -> Self {
        SessionState {
            decoder,
            unprocessed_packets,
            subscriptions: Vec::new(),
            pending_publishes: HashMap::new(),
            pending_subscribes: HashMap::new(),
            next_packet_id: 1,
            ping_outstanding: false,
        }
    }

    fn allocate_packet_id(&mut self) -> u16 {
        let packet_id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }

        packet_id
    }

    async fn handle_operation<W>(&mut self, operation: SessionOperation, writer: &mut W) -> AuthResult<()> where W : AsyncWrite + Unpin {
        match operation {
            SessionOperation::Publish { topic, payload, qos, response } => {
                let packet_id =
                    if qos == QualityOfService::AtLeastOnce {
                        self.allocate_packet_id()
                    } else {
                        0
                    };

                let publish = MqttPacket::Publish(PublishPacket {
                    packet_id,
                    topic,
                    qos,
                    retain: false,
                    duplicate: false,
                    payload,
                });

                if let Err(error) = write_packet(writer, &publish).await {
                    let _ = response.send(Err(AuthError::new_not_connected()));
                    return Err(error);
                }

                if qos == QualityOfService::AtLeastOnce {
                    self.pending_publishes.insert(packet_id, response);
                } else {
                    let _ = response.send(Ok(()));
                }
            }
            SessionOperation::Subscribe { topic_filter, response } => {
                let packet_id = self.allocate_packet_id();
                let subscribe = MqttPacket::Subscribe(SubscribePacket {
                    packet_id,
                    subscriptions: vec![(topic_filter.clone(), QualityOfService::AtLeastOnce)],
                });

                if let Err(error) = write_packet(writer, &subscribe).await {
                    let _ = response.send(Err(AuthError::new_not_connected()));
                    return Err(error);
                }

                self.pending_subscribes.insert(packet_id, (topic_filter, response));
            }
            SessionOperation::Disconnect => {}
        }

        Ok(())
    }

    async fn handle_packets<W>(&mut self, packets: VecDeque<MqttPacket>, writer: &mut W) -> AuthResult<()> where W : AsyncWrite + Unpin {
        for packet in packets {
            match packet {
                MqttPacket::Publish(publish) => {
                    if publish.qos == QualityOfService::AtLeastOnce {
                        write_packet(writer, &MqttPacket::Puback(publish.packet_id)).await?;
                    }

                    let topic = publish.topic;
                    let payload = publish.payload;
                    self.subscriptions.retain(|(topic_filter, sender)| {
                        !topic_matches_filter(topic_filter, &topic) || sender.send(InboundMessage { topic: topic.clone(), payload: payload.clone() }).is_ok()
                    });
                }
                MqttPacket::Puback(packet_id) => {
                    match self.pending_publishes.remove(&packet_id) {
                        Some(response) => { let _ = response.send(Ok(())); }
                        None => { warn!("handle_packets - puback for unknown packet id {}", packet_id); }
                    }
                }
                MqttPacket::Suback(suback) => {
                    match self.pending_subscribes.remove(&suback.packet_id) {
                        Some((topic_filter, response)) => {
                            match suback.return_codes.first() {
                                Some(return_code) if *return_code != SUBACK_FAILURE => {
                                    let (message_sender, message_receiver) = mpsc::unbounded_channel();
                                    self.subscriptions.push((topic_filter, message_sender));
                                    let _ = response.send(Ok(message_receiver));
                                }
                                _ => {
                                    let reason = format!("subscription to {} rejected", topic_filter);
                                    let _ = response.send(Err(AuthError::new_transport_error(TransportErrorKind::Refused, reason)));
                                }
                            }
                        }
                        None => { warn!("handle_packets - suback for unknown packet id {}", suback.packet_id); }
                    }
                }
                MqttPacket::Pingresp => {
                    self.ping_outstanding = false;
                }
                other => {
                    return Err(protocol_error(format!("unexpected {} packet from broker", packet_type_name(&other))));
                }
            }
        }

        Ok(())
    }

    fn fail_pending_operations(&mut self) {
        for (_, response) in self.pending_publishes.drain() {
            let _ = response.send(Err(AuthError::new_not_connected()));
        }

        for (_, (_, response)) in self.pending_subscribes.drain() {
            let _ = response.send(Err(AuthError::new_not_connected()));
        }
    }
}

async fn run_connected(stream: BoxedStream, mut state: SessionState, operation_receiver: &mut mpsc::UnboundedReceiver<SessionOperation>, keep_alive_interval: Duration) -> AuthResult<()> {
    let (mut stream_reader, mut stream_writer) = split(stream);

    let mut inbound_data: [u8; 4096] = [0; 4096];
    let mut keep_alive = interval_at(Instant::now() + keep_alive_interval, keep_alive_interval);

    let unprocessed_packets = std::mem::take(&mut state.unprocessed_packets);
    let mut result = state.handle_packets(unprocessed_packets, &mut stream_writer).await;

    while result.is_ok() {
        trace!("run_connected loop");

        tokio::select! {
            operation = operation_receiver.recv() => {
                match operation {
                    Some(SessionOperation::Disconnect) | None => {
                        debug!("run_connected - disconnect requested");
                        let _ = write_packet(&mut stream_writer, &MqttPacket::Disconnect).await;
                        break;
                    }
                    Some(operation) => {
                        result = state.handle_operation(operation, &mut stream_writer).await;
                    }
                }
            }
            read_result = stream_reader.read(inbound_data.as_mut_slice()) => {
                match read_result {
                    Ok(0) => {
                        info!("run_connected - connection closed for read (0 bytes)");
                        break;
                    }
                    Ok(bytes_read) => {
                        debug!("run_connected - read {} bytes from connection stream", bytes_read);
                        let mut packets = VecDeque::new();
                        result = match state.decoder.decode_bytes(&inbound_data[..bytes_read], &mut packets) {
                            Ok(()) => { state.handle_packets(packets, &mut stream_writer).await }
                            Err(error) => { Err(protocol_error(error)) }
                        };
                    }
                    Err(error) => {
                        info!("run_connected - connection stream read failed: {:?}", error);
                        result = Err(connection_error(error));
                    }
                }
            }
            _ = keep_alive.tick() => {
                if state.ping_outstanding {
                    result = Err(connection_error("no pingresp received within the keep alive interval"));
                } else {
                    debug!("run_connected - sending pingreq");
                    state.ping_outstanding = true;
                    result = write_packet(&mut stream_writer, &MqttPacket::Pingreq).await;
                }
            }
        }
    }

    info!("run_connected - shutting down stream");
    let _ = stream_writer.shutdown().await;
    state.fail_pending_operations();

    result
}
