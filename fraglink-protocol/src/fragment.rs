//! Fragment Protocol Packets
//!
//! Control and payload packets for the fragmentation protocol (major tag
//! 254). A message is negotiated with `Allocate`/`Allocation`, carried by
//! `Message` fragments, acknowledged per fragment with `MessageResponse`,
//! and terminated by `SendComplete`, `RetrySend`, `SendStop`, or
//! `VerifyComplete` signalling.
//!
//! Fields are optional so a factory-built packet starts unset and becomes
//! valid once its payload loads; packet and fragment ids are non-negative
//! 32-bit integers, fragment counts are at least 1.

use crate::packet::{bool_from_byte, bool_to_byte, PacketError};
use crate::wire;
use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

fn save_packet_id(packet_id: Option<i32>) -> Result<[u8; 4], PacketError> {
    let id = packet_id.ok_or(PacketError::MissingField("packet-id"))?;
    Ok(wire::i32_to_bytes(id))
}

fn expect_len(data: &[u8], expected: usize) -> Result<(), PacketError> {
    if data.len() != expected {
        return Err(PacketError::WrongLength {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Requests allocation of a packet-id for a message of `fragment_count`
/// fragments, keyed by a sender-chosen allocation handle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocatePacket {
    pub fragment_count: Option<i32>,
    pub allocation_id: Option<Uuid>,
}

impl AllocatePacket {
    /// # Panics
    /// Panics if `fragment_count` is less than 1.
    pub fn new(fragment_count: i32, allocation_id: Uuid) -> Self {
        assert!(fragment_count >= 1, "fragment count {fragment_count} is less than 1");
        AllocatePacket {
            fragment_count: Some(fragment_count),
            allocation_id: Some(allocation_id),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.fragment_count.is_some() && self.allocation_id.is_some()
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        let count = self
            .fragment_count
            .ok_or(PacketError::MissingField("fragment-count"))?;
        let allocation_id = self
            .allocation_id
            .ok_or(PacketError::MissingField("allocation-uuid"))?;
        let mut buf = BytesMut::with_capacity(20);
        buf.put_i32(count);
        buf.put_slice(allocation_id.as_bytes());
        Ok(buf.to_vec())
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        expect_len(data, 20)?;
        let mut buf = data;
        self.fragment_count = Some(buf.get_i32());
        self.allocation_id = Some(Uuid::from_slice(buf).map_err(|_| PacketError::Malformed("allocation-uuid"))?);
        Ok(())
    }
}

/// Answers an `Allocate` with the receiver-chosen packet-id, echoing the
/// allocation handle, and whether an id could be granted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocationPacket {
    pub packet_id: Option<i32>,
    pub success: Option<bool>,
    pub allocation_id: Option<Uuid>,
}

impl AllocationPacket {
    /// # Panics
    /// Panics if `packet_id` is negative.
    pub fn new(packet_id: i32, allocation_id: Uuid, success: bool) -> Self {
        assert!(packet_id >= 0, "packet id {packet_id} is negative");
        AllocationPacket {
            packet_id: Some(packet_id),
            success: Some(success),
            allocation_id: Some(allocation_id),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.packet_id.is_some() && self.success.is_some() && self.allocation_id.is_some()
    }

    /// Whether the peer granted a packet-id.
    pub fn successful(&self) -> bool {
        self.success == Some(true)
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        let id = save_packet_id(self.packet_id)?;
        let success = self.success.ok_or(PacketError::MissingField("success"))?;
        let allocation_id = self
            .allocation_id
            .ok_or(PacketError::MissingField("allocation-uuid"))?;
        let mut buf = BytesMut::with_capacity(21);
        buf.put_slice(&id);
        buf.put_u8(bool_to_byte(success));
        buf.put_slice(allocation_id.as_bytes());
        Ok(buf.to_vec())
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        expect_len(data, 21)?;
        let mut buf = data;
        self.packet_id = Some(buf.get_i32());
        self.success = bool_from_byte(buf.get_u8());
        self.allocation_id = Some(Uuid::from_slice(buf).map_err(|_| PacketError::Malformed("allocation-uuid"))?);
        Ok(())
    }
}

fn save_id_frag_body(
    packet_id: Option<i32>,
    fragment_id: Option<i32>,
    body: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let id = save_packet_id(packet_id)?;
    let frag = fragment_id.ok_or(PacketError::MissingField("fragment-id"))?;
    let mut buf = BytesMut::with_capacity(8 + body.len());
    buf.put_slice(&id);
    buf.put_i32(frag);
    buf.put_slice(body);
    Ok(buf.to_vec())
}

fn load_id_frag_body(data: &[u8]) -> Result<(i32, i32, Vec<u8>), PacketError> {
    if data.len() < 8 {
        return Err(PacketError::Malformed("fragment payload shorter than 8 bytes"));
    }
    let mut buf = data;
    let packet_id = buf.get_i32();
    let fragment_id = buf.get_i32();
    Ok((packet_id, fragment_id, buf.to_vec()))
}

/// Carries one fragment of a message's serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePacket {
    pub packet_id: Option<i32>,
    pub fragment_id: Option<i32>,
    pub payload: Option<Vec<u8>>,
}

impl MessagePacket {
    /// # Panics
    /// Panics if `packet_id` or `fragment_id` is negative.
    pub fn new(packet_id: i32, fragment_id: i32, payload: Vec<u8>) -> Self {
        assert!(packet_id >= 0, "packet id {packet_id} is negative");
        assert!(fragment_id >= 0, "fragment id {fragment_id} is negative");
        MessagePacket {
            packet_id: Some(packet_id),
            fragment_id: Some(fragment_id),
            payload: Some(payload),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.packet_id.is_some() && self.fragment_id.is_some() && self.payload.is_some()
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        let body = self.payload.as_ref().ok_or(PacketError::MissingField("payload"))?;
        save_id_frag_body(self.packet_id, self.fragment_id, body)
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        let (packet_id, fragment_id, body) = load_id_frag_body(data)?;
        self.packet_id = Some(packet_id);
        self.fragment_id = Some(fragment_id);
        self.payload = Some(body);
        Ok(())
    }
}

/// Acknowledges one fragment, optionally echoing its body for
/// verification; an empty body acknowledges without echoing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageResponsePacket {
    pub packet_id: Option<i32>,
    pub fragment_id: Option<i32>,
    pub payload: Option<Vec<u8>>,
}

impl MessageResponsePacket {
    /// # Panics
    /// Panics if `packet_id` or `fragment_id` is negative.
    pub fn new(packet_id: i32, fragment_id: i32, payload: Option<Vec<u8>>) -> Self {
        assert!(packet_id >= 0, "packet id {packet_id} is negative");
        assert!(fragment_id >= 0, "fragment id {fragment_id} is negative");
        MessageResponsePacket {
            packet_id: Some(packet_id),
            fragment_id: Some(fragment_id),
            payload,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.packet_id.is_some() && self.fragment_id.is_some()
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        let body = self.payload.as_deref().unwrap_or_default();
        save_id_frag_body(self.packet_id, self.fragment_id, body)
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        let (packet_id, fragment_id, body) = load_id_frag_body(data)?;
        self.packet_id = Some(packet_id);
        self.fragment_id = Some(fragment_id);
        self.payload = Some(body);
        Ok(())
    }
}

fn save_id_ack(packet_id: Option<i32>, ack: Option<bool>) -> Result<Vec<u8>, PacketError> {
    let id = save_packet_id(packet_id)?;
    let ack = ack.ok_or(PacketError::MissingField("acknowledgement"))?;
    let mut buf = BytesMut::with_capacity(5);
    buf.put_slice(&id);
    buf.put_u8(bool_to_byte(ack));
    Ok(buf.to_vec())
}

fn load_id_ack(data: &[u8]) -> Result<(i32, Option<bool>), PacketError> {
    expect_len(data, 5)?;
    let mut buf = data;
    let packet_id = buf.get_i32();
    Ok((packet_id, bool_from_byte(buf.get_u8())))
}

/// Signals a completed transfer; the receiver's acknowledged form tears
/// the sender entry down.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendCompletePacket {
    pub packet_id: Option<i32>,
    pub acknowledgement: Option<bool>,
}

impl SendCompletePacket {
    /// # Panics
    /// Panics if `packet_id` is negative.
    pub fn new(packet_id: i32, acknowledgement: bool) -> Self {
        assert!(packet_id >= 0, "packet id {packet_id} is negative");
        SendCompletePacket {
            packet_id: Some(packet_id),
            acknowledgement: Some(acknowledgement),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.packet_id.is_some() && self.acknowledgement.is_some()
    }

    pub fn is_acknowledgement(&self) -> bool {
        self.acknowledgement == Some(true)
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        save_id_ack(self.packet_id, self.acknowledgement)
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        let (packet_id, ack) = load_id_ack(data)?;
        self.packet_id = Some(packet_id);
        self.acknowledgement = ack;
        Ok(())
    }
}

/// Asks the sender to enter a re-send pass; the sender's acknowledged
/// form marks the start of one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetrySendPacket {
    pub packet_id: Option<i32>,
    pub acknowledgement: Option<bool>,
}

impl RetrySendPacket {
    /// # Panics
    /// Panics if `packet_id` is negative.
    pub fn new(packet_id: i32, acknowledgement: bool) -> Self {
        assert!(packet_id >= 0, "packet id {packet_id} is negative");
        RetrySendPacket {
            packet_id: Some(packet_id),
            acknowledgement: Some(acknowledgement),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.packet_id.is_some() && self.acknowledgement.is_some()
    }

    pub fn is_acknowledgement(&self) -> bool {
        self.acknowledgement == Some(true)
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        save_id_ack(self.packet_id, self.acknowledgement)
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        let (packet_id, ack) = load_id_ack(data)?;
        self.packet_id = Some(packet_id);
        self.acknowledgement = ack;
        Ok(())
    }
}

fn save_id_only(packet_id: Option<i32>) -> Result<Vec<u8>, PacketError> {
    Ok(save_packet_id(packet_id)?.to_vec())
}

fn load_id_only(data: &[u8]) -> Result<i32, PacketError> {
    expect_len(data, 4)?;
    wire::i32_from_slice(data)
}

/// Tells the peer to abandon a message and drop its entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendStopPacket {
    pub packet_id: Option<i32>,
}

impl SendStopPacket {
    /// # Panics
    /// Panics if `packet_id` is negative.
    pub fn new(packet_id: i32) -> Self {
        assert!(packet_id >= 0, "packet id {packet_id} is negative");
        SendStopPacket {
            packet_id: Some(packet_id),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.packet_id.is_some()
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        save_id_only(self.packet_id)
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        self.packet_id = Some(load_id_only(data)?);
        Ok(())
    }
}

/// Terminates the equality-verification loop for a message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerifyCompletePacket {
    pub packet_id: Option<i32>,
}

impl VerifyCompletePacket {
    /// # Panics
    /// Panics if `packet_id` is negative.
    pub fn new(packet_id: i32) -> Self {
        assert!(packet_id >= 0, "packet id {packet_id} is negative");
        VerifyCompletePacket {
            packet_id: Some(packet_id),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.packet_id.is_some()
    }

    pub fn save_payload(&self) -> Result<Vec<u8>, PacketError> {
        save_id_only(self.packet_id)
    }

    pub fn load_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        self.packet_id = Some(load_id_only(data)?);
        Ok(())
    }
}
