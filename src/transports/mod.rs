//! Broker transports implementing [Broker](crate::Broker).

pub mod mqtt;

pub use mqtt::{Delivery, MqttBroker, MqttConfig, MqttConnection, MqttSubscription};
