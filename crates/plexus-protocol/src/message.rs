//! Messages exchanged over the overlay and their framed codec
//!
//! Format: [action:1][length:4][payload:N][crc32:4]

use crate::{
    Action, Elements, NotificationSet, PeerId, ProtocolError, Result, ServiceKey,
    TransactionHeader, TransactionState,
};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame overhead: action(1) + length(4) + crc(4)
const FRAME_OVERHEAD: usize = 9;

/// A message between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version of the sender
    pub version: u32,
    /// Sending peer
    pub source: PeerId,
    /// Target service
    pub service: ServiceKey,
    /// Requested action
    pub action: Action,
    /// Payload
    pub elements: Elements,
    /// Notification being delivered (`Notify`)
    pub notification: Option<NotificationSet>,
    /// Transaction header for transactional data actions
    pub transaction: Option<TransactionHeader>,
    /// Set when a delivery to the receiver previously failed
    pub fail_message: Option<String>,
}

impl Message {
    /// New message with an empty payload
    pub fn new(source: PeerId, service: ServiceKey, action: Action) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            source,
            service,
            action,
            elements: Elements::empty(),
            notification: None,
            transaction: None,
            fail_message: None,
        }
    }

    /// Attach a payload
    pub fn with_elements(mut self, elements: Elements) -> Self {
        self.elements = elements;
        self
    }

    /// Attach a transaction header
    pub fn with_transaction(mut self, header: TransactionHeader) -> Self {
        self.transaction = Some(header);
        self
    }

    /// Attach a notification
    pub fn with_notification(mut self, set: NotificationSet) -> Self {
        self.notification = Some(set);
        self
    }

    /// Reply from `source` carrying the same service and action
    pub fn reply(&self, source: PeerId) -> Self {
        let mut reply = Self::new(source, self.service.clone(), self.action);
        reply.transaction = self.transaction.clone();
        reply
    }

    /// Transaction state, `Empty` when the message is not transactional
    pub fn tr_state(&self) -> TransactionState {
        self.transaction
            .as_ref()
            .map(|t| t.state)
            .unwrap_or(TransactionState::Empty)
    }

    /// Copy moved to another transaction state, optionally without records
    pub fn with_tr_state(&self, state: TransactionState, keep_data: bool) -> Self {
        let mut msg = self.clone();
        if let Some(header) = msg.transaction.as_mut() {
            header.state = state;
        }
        if !keep_data {
            msg.elements = msg.elements.stripped();
        }
        msg
    }

    /// Error text carried by a reply, from the transaction header or the payload
    pub fn error_text(&self) -> Option<String> {
        if let Some(header) = &self.transaction {
            if !header.err_msg.is_empty() {
                return Some(header.err_msg.clone());
            }
        }
        self.elements.error.clone()
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = rmp_serde::to_vec_named(self)?;

        let mut buf = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
        buf.push(self.action as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of action + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(ProtocolError::truncated(format!(
                "{} bytes, need at least {FRAME_OVERHEAD}",
                buf.len()
            )));
        }

        let crc_offset = buf.len() - 4;
        let stored_crc = read_u32(&buf[crc_offset..])?;

        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(ProtocolError::Checksum {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let action = Action::try_from(buf[0])?;
        let length = read_u32(&buf[1..5])? as usize;
        if buf.len() != FRAME_OVERHEAD + length {
            return Err(ProtocolError::truncated(format!(
                "declared payload {length} bytes, frame holds {}",
                buf.len() - FRAME_OVERHEAD
            )));
        }

        let message: Message = rmp_serde::from_slice(&buf[5..5 + length])?;
        if message.action != action {
            return Err(ProtocolError::truncated(format!(
                "header action {action} does not match payload action {}",
                message.action
            )));
        }
        Ok(message)
    }
}

fn read_u32(bytes: &[u8]) -> Result<u32> {
    let arr: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ProtocolError::truncated("u32 field"))?;
    Ok(u32::from_le_bytes(arr))
}
