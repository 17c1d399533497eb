//! Payloads carried on the bus.
//!
//! Data and control traffic travel as one enum so a handler's single
//! subscription can multiplex both and dispatch on the variant.

use bytes::Bytes;

/// An application event published on a data topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub payload: Bytes,
}

impl Event {
    pub fn new(id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }
}

/// A request to start a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateHandler {
    /// Handler id, unique among live handlers.
    pub id: String,
    /// Data topic the handler consumes.
    pub topic: String,
    /// Guest module, in wasm binary or text form.
    pub module: Bytes,
}

/// Lifecycle requests published on the control topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Create(CreateHandler),
    Destroy { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    Event(Event),
    Control(ControlMessage),
}

impl From<Event> for BusMessage {
    fn from(event: Event) -> Self {
        BusMessage::Event(event)
    }
}

impl From<ControlMessage> for BusMessage {
    fn from(control: ControlMessage) -> Self {
        BusMessage::Control(control)
    }
}
