//! Message bus adapter.
//!
//! Topics are split into a fixed number of partitions. A message is routed
//! to a partition by hashing its key, so every message published with the
//! same key is delivered in publish order. Delivery is at-least-once:
//! consumers acknowledge each message explicitly, and anything not acked is
//! delivered again.
//!
//! - [`MessageBus`], [`Publisher`] and [`Consumer`] are the seams the rest
//!   of the system is written against.
//! - [`InMemoryBus`] is an in-process implementation with consumer groups and
//!   committed offsets.
//! - [`codec`] turns payload structs into bytes (bincode).

pub mod bus;
pub mod codec;
pub mod error;
pub mod memory;

pub use bus::{Assignment, Consumer, DeadLetter, Delivery, MessageBus, Publisher, DEAD_LETTER_TOPIC};
pub use codec::{decode, encode};
pub use error::{BusError, Result};
pub use memory::{InMemoryBus, Record};
