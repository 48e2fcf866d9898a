//! Plexus Protocol - wire types shared by every peer
//!
//! This crate holds everything that crosses the overlay between peers:
//!
//! - Identifiers: [`PeerId`], [`ServiceKey`], [`TransactionId`]
//! - [`Action`]: data, control, election and registry verbs
//! - [`TransactionHeader`] and its [`TransactionState`] machine
//! - [`Elements`]: the type-erased payload handed to service handlers
//! - [`Query`]: paged, filtered, sorted reads
//! - [`NotificationSet`]: structured change records
//! - [`Message`] and its framed codec
//!
//! # Wire Format
//!
//! ```text
//! [action:1][length:4][payload:N][crc32:4]
//! ```
//!
//! The payload is MessagePack; the checksum covers action, length and payload.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod elements;
pub mod error;
pub mod ids;
pub mod message;
pub mod notification;
pub mod query;
pub mod transaction;

pub use action::Action;
pub use elements::{Elements, TOTAL_STAT};
pub use error::{ProtocolError, Result};
pub use ids::{MAX_SERVICE_NAME_LEN, PeerId, ServiceKey, TransactionId};
pub use message::{Message, PROTOCOL_VERSION};
pub use notification::{NotificationChange, NotificationSet, NotificationType};
pub use query::{Condition, Criteria, Operator, Query};
pub use transaction::{TransactionHeader, TransactionState};

/// Milliseconds since the Unix epoch, the clock every header timestamp uses.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
