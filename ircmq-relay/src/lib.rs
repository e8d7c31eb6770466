//! Relay between chat channels and MQTT topics.
//!
//! Each configured connection logs into the chat service, joins its
//! channels, publishes every chat event to its publish topic and turns
//! deliveries on its subscribe topic into chat messages.
//!
//! - [`config`]: arguments, config file, validation
//! - [`broker`]: the [`Broker`](broker::Broker) seam and its rumqttc implementation
//! - [`envelope`]: subscribe payloads → chat messages
//! - [`relay`]: the per-connection relay loop
//! - [`shutdown`]: stop signal and waiting for every relay
//! - [`supervisor`]: restart / fatal escalation for the whole process

pub mod broker;
pub mod config;
pub mod envelope;
pub mod relay;
pub mod shutdown;
pub mod supervisor;
