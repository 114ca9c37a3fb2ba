//! Outbound transports for alert notifications.

pub mod mqtt;

pub use mqtt::{alert_topic, parse_mqtt_endpoint, MqttAlertSink, MqttEndpoint};
