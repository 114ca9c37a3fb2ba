//! MQTT alert notifications.
//!
//! Alerts are published as JSON with QoS 1 to `<topic_prefix>/<source>`.
//! The connection event loop runs on its own thread and keeps reconnecting
//! with backoff until the sink is disconnected; `notify` only enqueues into
//! rumqttc's request channel and fails instead of blocking when it is full.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{
    mqttbytes::QoS, Client, Connection, ConnectionError, Event, Incoming, MqttOptions,
};
use rumqttc::Transport;

use crate::alert::{AlertEvent, AlertSink};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse a broker address.
///
/// Supports formats:
/// - `host:port`
/// - `mqtt://host:port` / `tcp://host:port` (plain TCP)
/// - `mqtts://host:port` / `ssl://host:port` (TLS with system roots)
/// - `[ipv6]:port`
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

/// Topic for one alert. Characters MQTT treats specially are replaced.
pub fn alert_topic(prefix: &str, event: &AlertEvent) -> String {
    let source: String = event
        .source
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' => '_',
            _ => c,
        })
        .collect();
    format!("{}/{}", prefix.trim_end_matches('/'), source)
}

const REQUEST_CAPACITY: usize = 10;
const RECONNECT_MIN: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

pub struct MqttAlertSink {
    client: Client,
    topic_prefix: String,
    stop: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttAlertSink {
    pub fn connect(broker: &str, topic_prefix: &str, client_id: &str) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(broker)?;
        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_event_loop(connection, stop.clone())?;
        log::info!(
            "MQTT alerts -> {}:{} ({}), topic prefix {}",
            endpoint.host,
            endpoint.port,
            if endpoint.use_tls { "tls" } else { "tcp" },
            topic_prefix
        );

        Ok(Self {
            client,
            topic_prefix: topic_prefix.to_string(),
            stop,
            connection_handle: Some(handle),
        })
    }

    /// True while the background connection loop is alive.
    pub fn event_loop_running(&self) -> bool {
        self.connection_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect not queued: {}", e);
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for MqttAlertSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if self.connection_handle.is_some() {
            let _ = self.client.try_disconnect();
        }
    }
}

fn spawn_event_loop(mut connection: Connection, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-alerts".to_string())
        .spawn(move || {
            let mut backoff = RECONNECT_MIN;
            for event in connection.iter() {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(..))) => {
                        log::info!("MQTT alerts connected");
                        backoff = RECONNECT_MIN;
                    }
                    Ok(_) => {}
                    Err(ConnectionError::RequestsDone) => break,
                    Err(e) => {
                        log::warn!("MQTT connection error: {}; retrying in {:?}", e, backoff);
                        sleep_unless_stopped(backoff, &stop);
                        backoff = (backoff * 2).min(RECONNECT_MAX);
                    }
                }
            }
        })
        .map_err(|e| anyhow!("failed to spawn MQTT event loop: {}", e))
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(50);
    let mut slept = Duration::ZERO;
    while slept < total && !stop.load(Ordering::SeqCst) {
        std::thread::sleep(step);
        slept += step;
    }
}

impl AlertSink for MqttAlertSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn notify(&mut self, event: &AlertEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        let topic = alert_topic(&self.topic_prefix, event);
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .context("failed to queue MQTT alert")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoundingBox, Detection};

    #[test]
    fn parses_broker_addresses() {
        let plain = parse_mqtt_endpoint("127.0.0.1:1883").unwrap();
        assert_eq!(plain.host, "127.0.0.1");
        assert_eq!(plain.port, 1883);
        assert!(!plain.use_tls);

        let tls = parse_mqtt_endpoint("mqtts://broker.school.local:8883").unwrap();
        assert!(tls.use_tls);
        assert_eq!(tls.host, "broker.school.local");

        let v6 = parse_mqtt_endpoint("[::1]:1883").unwrap();
        assert_eq!(v6.host, "::1");

        assert!(parse_mqtt_endpoint("ws://host:80").is_err());
        assert!(parse_mqtt_endpoint("host").is_err());
        assert!(parse_mqtt_endpoint(":1883").is_err());
    }

    #[test]
    fn topic_escapes_wildcards() {
        let det = Detection::new(
            "Violence",
            0.9,
            BoundingBox::default(),
            None,
            "cam/1#",
        )
        .unwrap();
        let event = AlertEvent::from_detection(&det);
        assert_eq!(alert_topic("vwatch/alerts/", &event), "vwatch/alerts/cam_1_");
    }

    #[test]
    fn keeps_queueing_while_the_broker_is_unreachable() {
        let det = Detection::new("Violence", 0.9, BoundingBox::default(), None, "gym").unwrap();
        let event = AlertEvent::from_detection(&det);

        // Nothing listens on port 1, so every connection attempt is refused.
        let mut sink =
            MqttAlertSink::connect("127.0.0.1:1", "vwatch/alerts", "vwatch-test").unwrap();
        std::thread::sleep(Duration::from_millis(300));
        sink.notify(&event).unwrap();
        std::thread::sleep(Duration::from_millis(700));
        assert!(sink.event_loop_running());
        sink.notify(&event).unwrap();

        sink.disconnect().unwrap();
    }
}
