/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::transport::*;
use crate::transport::codec::*;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub(crate) struct MockBrokerOptions {
    pub(crate) connack_return_code: u8,
    pub(crate) respond_to_connect: bool,
    pub(crate) close_after_connack: bool,
    pub(crate) rejected_topic_filter: Option<String>,
}

impl Default for MockBrokerOptions {
    fn default() -> Self {
        MockBrokerOptions {
            connack_return_code: 0,
            respond_to_connect: true,
            close_after_connack: false,
            rejected_topic_filter: None,
        }
    }
}

/// Minimal MQTT 3.1.1 broker listening on a loopback port.  Every packet received from any
/// client is recorded; publishes are echoed to the publishing connection's matching subscriptions.
pub(crate) struct MockBroker {
    port: u16,
    received_packets: Arc<Mutex<Vec<MqttPacket>>>,
    accept_task: JoinHandle<()>,
}

impl MockBroker {
    pub(crate) async fn start(options: MockBrokerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind mock broker listener");
        let port = listener.local_addr().unwrap().port();
        let received_packets = Arc::new(Mutex::new(Vec::new()));

        let task_packets = received_packets.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection = MockBrokerConnection::new(stream, options.clone(), task_packets.clone());
                tokio::spawn(connection.run());
            }
        });

        MockBroker {
            port,
            received_packets,
            accept_task,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn received_packets(&self) -> Vec<MqttPacket> {
        self.received_packets.lock().unwrap().clone()
    }

    pub(crate) fn received_connects(&self) -> Vec<ConnectPacket> {
        self.received_packets().into_iter().filter_map(|packet| {
            match packet {
                MqttPacket::Connect(connect) => { Some(connect) }
                _ => { None }
            }
        }).collect()
    }

    /// Waits up to five seconds for a received packet matching `predicate`
    pub(crate) async fn wait_for_packet<F>(&self, predicate: F) -> bool where F : Fn(&MqttPacket) -> bool {
        for _ in 0..500 {
            if self.received_packets.lock().unwrap().iter().any(&predicate) {
                return true;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        false
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

struct MockBrokerConnection {
    stream: TcpStream,
    options: MockBrokerOptions,
    received_packets: Arc<Mutex<Vec<MqttPacket>>>,
    decoder: Decoder,
    subscriptions: Vec<String>,
    next_packet_id: u16,
}

impl MockBrokerConnection {
    fn new(stream: TcpStream, options: MockBrokerOptions, received_packets: Arc<Mutex<Vec<MqttPacket>>>) -> Self {
        MockBrokerConnection {
            stream,
            options,
            received_packets,
            decoder: Decoder::new(),
            subscriptions: Vec::new(),
            next_packet_id: 1,
        }
    }

    async fn run(mut self) {
        let mut read_buffer: [u8; 4096] = [0; 4096];
        let mut packets = VecDeque::new();

        loop {
            let bytes_read =
                match self.stream.read(&mut read_buffer).await {
                    Ok(0) | Err(_) => { return; }
                    Ok(bytes_read) => { bytes_read }
                };

            if self.decoder.decode_bytes(&read_buffer[..bytes_read], &mut packets).is_err() {
                panic!("Test triggered broker decode failure");
            }

            while let Some(packet) = packets.pop_front() {
                self.received_packets.lock().unwrap().push(packet.clone());

                let (responses, close) = self.handle_packet(packet);

                let mut response_bytes = Vec::new();
                for response in &responses {
                    encode_packet(response, &mut response_bytes).expect("Failed to encode broker response");
                }

                if !response_bytes.is_empty() && self.stream.write_all(&response_bytes).await.is_err() {
                    return;
                }

                if close {
                    let _ = self.stream.shutdown().await;
                    return;
                }
            }
        }
    }

    fn handle_packet(&mut self, packet: MqttPacket) -> (Vec<MqttPacket>, bool) {
        let mut responses = Vec::new();
        let mut close = false;

        match packet {
            MqttPacket::Connect(_) => {
                if self.options.respond_to_connect {
                    responses.push(MqttPacket::Connack(ConnackPacket {
                        session_present: false,
                        return_code: self.options.connack_return_code,
                    }));
                    close = self.options.close_after_connack || self.options.connack_return_code != 0;
                }
            }
            MqttPacket::Subscribe(subscribe) => {
                let mut return_codes = Vec::new();
                for (topic_filter, qos) in subscribe.subscriptions {
                    if self.options.rejected_topic_filter.as_deref() == Some(topic_filter.as_str()) {
                        return_codes.push(SUBACK_FAILURE);
                    } else {
                        return_codes.push(qos as u8);
                        self.subscriptions.push(topic_filter);
                    }
                }

                responses.push(MqttPacket::Suback(SubackPacket {
                    packet_id: subscribe.packet_id,
                    return_codes,
                }));
            }
            MqttPacket::Publish(publish) => {
                if publish.qos == QualityOfService::AtLeastOnce {
                    responses.push(MqttPacket::Puback(publish.packet_id));
                }

                if self.subscriptions.iter().any(|topic_filter| topic_matches_filter(topic_filter, &publish.topic)) {
                    let packet_id =
                        if publish.qos == QualityOfService::AtLeastOnce {
                            let packet_id = self.next_packet_id;
                            self.next_packet_id += 1;
                            packet_id
                        } else {
                            0
                        };

                    responses.push(MqttPacket::Publish(PublishPacket {
                        packet_id,
                        retain: false,
                        duplicate: false,
                        ..publish
                    }));
                }
            }
            MqttPacket::Pingreq => {
                responses.push(MqttPacket::Pingresp);
            }
            MqttPacket::Disconnect => {
                close = true;
            }
            _ => {}
        }

        (responses, close)
    }
}
