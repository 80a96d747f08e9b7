/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Encoding and incremental decoding of the MQTT 3.1.1 packets the transport needs.
 */

use crate::error::{AuthError, AuthResult};
use crate::transport::QualityOfService;

use log::*;
use std::collections::VecDeque;

const PACKET_TYPE_CONNECT: u8 = 1;
const PACKET_TYPE_CONNACK: u8 = 2;
const PACKET_TYPE_PUBLISH: u8 = 3;
const PACKET_TYPE_PUBACK: u8 = 4;
const PACKET_TYPE_SUBSCRIBE: u8 = 8;
const PACKET_TYPE_SUBACK: u8 = 9;
const PACKET_TYPE_PINGREQ: u8 = 12;
const PACKET_TYPE_PINGRESP: u8 = 13;
const PACKET_TYPE_DISCONNECT: u8 = 14;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL_311: u8 = 4;

const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
const CONNECT_FLAG_PASSWORD: u8 = 0x40;
const CONNECT_FLAG_USERNAME: u8 = 0x80;

const PUBLISH_FLAG_RETAIN: u8 = 0x01;
const PUBLISH_FLAG_DUPLICATE: u8 = 0x08;

pub(crate) const MAXIMUM_VARIABLE_LENGTH_INTEGER: usize = (1 << 28) - 1;

/// Return code a broker uses in a SUBACK to reject a subscription
pub(crate) const SUBACK_FAILURE: u8 = 0x80;

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ConnectPacket {
    pub(crate) client_id: String,
    pub(crate) clean_session: bool,
    pub(crate) keep_alive_seconds: u16,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ConnackPacket {
    pub(crate) session_present: bool,
    pub(crate) return_code: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct PublishPacket {
    pub(crate) packet_id: u16,
    pub(crate) topic: String,
    pub(crate) qos: QualityOfService,
    pub(crate) retain: bool,
    pub(crate) duplicate: bool,
    pub(crate) payload: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SubscribePacket {
    pub(crate) packet_id: u16,
    pub(crate) subscriptions: Vec<(String, QualityOfService)>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SubackPacket {
    pub(crate) packet_id: u16,
    pub(crate) return_codes: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum MqttPacket {
    Connect(ConnectPacket),
    Connack(ConnackPacket),
    Publish(PublishPacket),
    Puback(u16),
    Subscribe(SubscribePacket),
    Suback(SubackPacket),
    Pingreq,
    Pingresp,
    Disconnect,
}

pub(crate) fn packet_type_name(packet: &MqttPacket) -> &'static str {
    match packet {
        MqttPacket::Connect(_) => { "Connect" }
        MqttPacket::Connack(_) => { "Connack" }
        MqttPacket::Publish(_) => { "Publish" }
        MqttPacket::Puback(_) => { "Puback" }
        MqttPacket::Subscribe(_) => { "Subscribe" }
        MqttPacket::Suback(_) => { "Suback" }
        MqttPacket::Pingreq => { "Pingreq" }
        MqttPacket::Pingresp => { "Pingresp" }
        MqttPacket::Disconnect => { "Disconnect" }
    }
}

fn encode_vli(value: usize, dest: &mut Vec<u8>) -> AuthResult<()> {
    if value > MAXIMUM_VARIABLE_LENGTH_INTEGER {
        return Err(AuthError::new_encoding_failure("variable length integer maximum exceeded"));
    }

    let mut done = false;
    let mut val = value;
    while !done {
        let mut byte: u8 = (val & 0x7F) as u8;
        val /= 128;

        if val != 0 {
            byte |= 128;
        }

        dest.push(byte);

        done = val == 0;
    }

    Ok(())
}

fn encode_length_prefixed_bytes(bytes: &[u8], dest: &mut Vec<u8>) -> AuthResult<()> {
    let length = u16::try_from(bytes.len()).map_err(|_| AuthError::new_encoding_failure("length-prefixed field exceeds 65535 bytes"))?;

    dest.extend_from_slice(&length.to_be_bytes());
    dest.extend_from_slice(bytes);
    Ok(())
}

fn encode_string(value: &str, dest: &mut Vec<u8>) -> AuthResult<()> {
    encode_length_prefixed_bytes(value.as_bytes(), dest)
}

fn encode_body(packet: &MqttPacket, body: &mut Vec<u8>) -> AuthResult<u8> {
    match packet {
        MqttPacket::Connect(connect) => {
            encode_string(PROTOCOL_NAME, body)?;
            body.push(PROTOCOL_LEVEL_311);

            let mut flags = 0u8;
            if connect.clean_session {
                flags |= CONNECT_FLAG_CLEAN_SESSION;
            }
            if connect.username.is_some() {
                flags |= CONNECT_FLAG_USERNAME;
            }
            if connect.password.is_some() {
                flags |= CONNECT_FLAG_PASSWORD;
            }
            body.push(flags);
            body.extend_from_slice(&connect.keep_alive_seconds.to_be_bytes());

            encode_string(&connect.client_id, body)?;
            if let Some(username) = &connect.username {
                encode_string(username, body)?;
            }
            if let Some(password) = &connect.password {
                encode_length_prefixed_bytes(password, body)?;
            }

            Ok(PACKET_TYPE_CONNECT << 4)
        }
        MqttPacket::Connack(connack) => {
            body.push(if connack.session_present { 1 } else { 0 });
            body.push(connack.return_code);

            Ok(PACKET_TYPE_CONNACK << 4)
        }
        MqttPacket::Publish(publish) => {
            encode_string(&publish.topic, body)?;
            if publish.qos != QualityOfService::AtMostOnce {
                body.extend_from_slice(&publish.packet_id.to_be_bytes());
            }
            body.extend_from_slice(&publish.payload);

            let mut first_byte = (PACKET_TYPE_PUBLISH << 4) | ((publish.qos as u8) << 1);
            if publish.retain {
                first_byte |= PUBLISH_FLAG_RETAIN;
            }
            if publish.duplicate {
                first_byte |= PUBLISH_FLAG_DUPLICATE;
            }

            Ok(first_byte)
        }
        MqttPacket::Puback(packet_id) => {
            body.extend_from_slice(&packet_id.to_be_bytes());

            Ok(PACKET_TYPE_PUBACK << 4)
        }
        MqttPacket::Subscribe(subscribe) => {
            if subscribe.subscriptions.is_empty() {
                return Err(AuthError::new_encoding_failure("subscribe packet must contain at least one subscription"));
            }

            body.extend_from_slice(&subscribe.packet_id.to_be_bytes());
            for (topic_filter, qos) in &subscribe.subscriptions {
                encode_string(topic_filter, body)?;
                body.push(*qos as u8);
            }

            Ok((PACKET_TYPE_SUBSCRIBE << 4) | 0x02)
        }
        MqttPacket::Suback(suback) => {
            body.extend_from_slice(&suback.packet_id.to_be_bytes());
            body.extend_from_slice(&suback.return_codes);

            Ok(PACKET_TYPE_SUBACK << 4)
        }
        MqttPacket::Pingreq => { Ok(PACKET_TYPE_PINGREQ << 4) }
        MqttPacket::Pingresp => { Ok(PACKET_TYPE_PINGRESP << 4) }
        MqttPacket::Disconnect => { Ok(PACKET_TYPE_DISCONNECT << 4) }
    }
}

/// Appends the complete wire encoding of a packet to `dest`
pub(crate) fn encode_packet(packet: &MqttPacket, dest: &mut Vec<u8>) -> AuthResult<()> {
    let mut body = Vec::new();
    let first_byte = encode_body(packet, &mut body)?;

    dest.push(first_byte);
    encode_vli(body.len(), dest)?;
    dest.extend_from_slice(&body);

    Ok(())
}

#[derive(Debug)]
enum DecodeVliResult {
    InsufficientData,
    Value(usize, usize),
}

fn decode_vli(buffer: &[u8]) -> AuthResult<DecodeVliResult> {
    let mut value: usize = 0;
    let mut shift: u32 = 0;

    for i in 0..4 {
        if i >= buffer.len() {
            return Ok(DecodeVliResult::InsufficientData);
        }

        let byte = buffer[i];
        value |= ((byte & 0x7F) as usize) << shift;
        shift += 7;

        if (byte & 0x80) == 0 {
            return Ok(DecodeVliResult::Value(value, i + 1));
        }
    }

    error!("decode_vli - invalid variable length integer");
    Err(AuthError::new_decoding_failure("invalid variable length integer"))
}

fn decode_u8<'a>(bytes: &'a[u8], value: &mut u8) -> AuthResult<&'a[u8]> {
    if bytes.is_empty() {
        return Err(AuthError::new_decoding_failure("packet too short"));
    }

    *value = bytes[0];
    Ok(&bytes[1..])
}

fn decode_u16<'a>(bytes: &'a[u8], value: &mut u16) -> AuthResult<&'a[u8]> {
    if bytes.len() < 2 {
        return Err(AuthError::new_decoding_failure("packet too short"));
    }

    *value = u16::from_be_bytes([bytes[0], bytes[1]]);
    Ok(&bytes[2..])
}

fn decode_length_prefixed_bytes<'a>(bytes: &'a[u8], value: &mut Vec<u8>) -> AuthResult<&'a[u8]> {
    let mut length: u16 = 0;
    let remaining = decode_u16(bytes, &mut length)?;
    let length = length as usize;
    if remaining.len() < length {
        return Err(AuthError::new_decoding_failure("length-prefixed field exceeds packet"));
    }

    *value = remaining[..length].to_vec();
    Ok(&remaining[length..])
}

fn decode_string<'a>(bytes: &'a[u8], value: &mut String) -> AuthResult<&'a[u8]> {
    let mut raw = Vec::new();
    let remaining = decode_length_prefixed_bytes(bytes, &mut raw)?;
    *value = std::str::from_utf8(&raw)?.to_string();

    Ok(remaining)
}

fn require_empty(remaining: &[u8], packet_name: &str) -> AuthResult<()> {
    if !remaining.is_empty() {
        error!("decode_packet - {} packet has {} trailing bytes", packet_name, remaining.len());
        return Err(AuthError::new_decoding_failure(format!("{} packet has trailing bytes", packet_name)));
    }

    Ok(())
}

fn decode_connect(body: &[u8]) -> AuthResult<MqttPacket> {
    let mut protocol_name = String::new();
    let mut remaining = decode_string(body, &mut protocol_name)?;
    if protocol_name != PROTOCOL_NAME {
        return Err(AuthError::new_decoding_failure("unknown protocol name"));
    }

    let mut level = 0;
    remaining = decode_u8(remaining, &mut level)?;
    if level != PROTOCOL_LEVEL_311 {
        return Err(AuthError::new_decoding_failure("unsupported protocol level"));
    }

    let mut flags = 0;
    remaining = decode_u8(remaining, &mut flags)?;

    let mut keep_alive_seconds = 0;
    remaining = decode_u16(remaining, &mut keep_alive_seconds)?;

    let mut client_id = String::new();
    remaining = decode_string(remaining, &mut client_id)?;

    let mut username = None;
    if (flags & CONNECT_FLAG_USERNAME) != 0 {
        let mut value = String::new();
        remaining = decode_string(remaining, &mut value)?;
        username = Some(value);
    }

    let mut password = None;
    if (flags & CONNECT_FLAG_PASSWORD) != 0 {
        let mut value = Vec::new();
        remaining = decode_length_prefixed_bytes(remaining, &mut value)?;
        password = Some(value);
    }

    require_empty(remaining, "Connect")?;

    Ok(MqttPacket::Connect(ConnectPacket {
        client_id,
        clean_session: (flags & CONNECT_FLAG_CLEAN_SESSION) != 0,
        keep_alive_seconds,
        username,
        password,
    }))
}

fn decode_connack(body: &[u8]) -> AuthResult<MqttPacket> {
    let mut acknowledge_flags = 0;
    let mut remaining = decode_u8(body, &mut acknowledge_flags)?;

    let mut return_code = 0;
    remaining = decode_u8(remaining, &mut return_code)?;
    require_empty(remaining, "Connack")?;

    Ok(MqttPacket::Connack(ConnackPacket {
        session_present: (acknowledge_flags & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(first_byte: u8, body: &[u8]) -> AuthResult<MqttPacket> {
    let qos = QualityOfService::try_from((first_byte >> 1) & 0x03)?;

    let mut topic = String::new();
    let mut remaining = decode_string(body, &mut topic)?;

    let mut packet_id = 0;
    if qos != QualityOfService::AtMostOnce {
        remaining = decode_u16(remaining, &mut packet_id)?;
    }

    Ok(MqttPacket::Publish(PublishPacket {
        packet_id,
        topic,
        qos,
        retain: (first_byte & PUBLISH_FLAG_RETAIN) != 0,
        duplicate: (first_byte & PUBLISH_FLAG_DUPLICATE) != 0,
        payload: remaining.to_vec(),
    }))
}

fn decode_subscribe(body: &[u8]) -> AuthResult<MqttPacket> {
    let mut packet_id = 0;
    let mut remaining = decode_u16(body, &mut packet_id)?;

    let mut subscriptions = Vec::new();
    while !remaining.is_empty() {
        let mut topic_filter = String::new();
        remaining = decode_string(remaining, &mut topic_filter)?;

        let mut qos = 0;
        remaining = decode_u8(remaining, &mut qos)?;
        subscriptions.push((topic_filter, QualityOfService::try_from(qos)?));
    }

    if subscriptions.is_empty() {
        return Err(AuthError::new_decoding_failure("subscribe packet contains no subscriptions"));
    }

    Ok(MqttPacket::Subscribe(SubscribePacket {
        packet_id,
        subscriptions,
    }))
}

fn decode_packet(first_byte: u8, body: &[u8]) -> AuthResult<MqttPacket> {
    let packet_type = first_byte >> 4;
    let flags = first_byte & 0x0F;

    match packet_type {
        PACKET_TYPE_CONNECT => { decode_connect(body) }
        PACKET_TYPE_CONNACK => { decode_connack(body) }
        PACKET_TYPE_PUBLISH => { decode_publish(first_byte, body) }
        PACKET_TYPE_PUBACK => {
            let mut packet_id = 0;
            let remaining = decode_u16(body, &mut packet_id)?;
            require_empty(remaining, "Puback")?;
            Ok(MqttPacket::Puback(packet_id))
        }
        PACKET_TYPE_SUBSCRIBE => {
            if flags != 0x02 {
                return Err(AuthError::new_decoding_failure("invalid subscribe packet flags"));
            }
            decode_subscribe(body)
        }
        PACKET_TYPE_SUBACK => {
            let mut packet_id = 0;
            let remaining = decode_u16(body, &mut packet_id)?;
            Ok(MqttPacket::Suback(SubackPacket {
                packet_id,
                return_codes: remaining.to_vec(),
            }))
        }
        PACKET_TYPE_PINGREQ => {
            require_empty(body, "Pingreq")?;
            Ok(MqttPacket::Pingreq)
        }
        PACKET_TYPE_PINGRESP => {
            require_empty(body, "Pingresp")?;
            Ok(MqttPacket::Pingresp)
        }
        PACKET_TYPE_DISCONNECT => {
            require_empty(body, "Disconnect")?;
            Ok(MqttPacket::Disconnect)
        }
        _ => {
            error!("decode_packet - unsupported packet type {}", packet_type);
            Err(AuthError::new_decoding_failure(format!("unsupported packet type {}", packet_type)))
        }
    }
}

/// Incremental packet decoder.  Bytes may arrive split at arbitrary boundaries; complete packets
/// are emitted as soon as their last byte is seen.
#[derive(Default)]
pub(crate) struct Decoder {
    pending: Vec<u8>,
}

impl Decoder {
    pub(crate) fn new() -> Self {
        Decoder::default()
    }

    pub(crate) fn decode_bytes(&mut self, bytes: &[u8], decoded_packets: &mut VecDeque<MqttPacket>) -> AuthResult<()> {
        self.pending.extend_from_slice(bytes);

        let mut consumed = 0;
        loop {
            let available = &self.pending[consumed..];
            if available.is_empty() {
                break;
            }

            let (remaining_length, vli_size) =
                match decode_vli(&available[1..])? {
                    DecodeVliResult::InsufficientData => { break; }
                    DecodeVliResult::Value(remaining_length, vli_size) => { (remaining_length, vli_size) }
                };

            let header_size = 1 + vli_size;
            if available.len() < header_size + remaining_length {
                break;
            }

            let packet = decode_packet(available[0], &available[header_size..(header_size + remaining_length)])?;
            trace!("decode_bytes - decoded {} packet", packet_type_name(&packet));
            decoded_packets.push_back(packet);
            consumed += header_size + remaining_length;
        }

        self.pending.drain(..consumed);
        Ok(())
    }
}
