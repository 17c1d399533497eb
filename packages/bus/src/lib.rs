//! # archway-bus
//!
//! A small in-process publish/subscribe broker.
//!
//! Producers [`publish`](Broker::publish) payloads on string topics; consumers
//! [`attach`](Broker::attach) a [`Subscriber`], add topics to it, and pull
//! messages with [`Subscriber::next_message`]. One subscriber can listen on
//! several topics at once and receives them interleaved on a single queue,
//! in the order they were published.
//!
//! The broker is payload-agnostic: the scheduler runs it over a tagged
//! message enum so control and data traffic share a subscription without
//! being told apart by topic name.

pub mod broker;

pub use broker::{Broker, Message, Subscriber, SubscriberId};
