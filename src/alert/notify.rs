//! Alert transports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;

use super::Alert;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound notification transport. Failures are reported, never retried here.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, alert: &Alert) -> Result<()>;
}

/// Used when no transport is configured: the alert is only logged.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&self, alert: &Alert) -> Result<()> {
        log::warn!(
            "ALERT (no transport configured): {} detected with {:.2} confidence at {} on {}",
            alert.label,
            alert.confidence,
            alert.timestamp,
            alert.stream
        );
        Ok(())
    }
}

/// POSTs each alert as JSON.
pub struct WebhookNotifier {
    url: String,
    agent: ureq::Agent,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url).with_context(|| format!("parse webhook url '{}'", url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("webhook url must be http(s): {}", url));
        }
        let agent = ureq::AgentBuilder::new().timeout(WEBHOOK_TIMEOUT).build();
        Ok(Self {
            url: url.to_string(),
            agent,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send(&self, alert: &Alert) -> Result<()> {
        let payload = serde_json::json!({
            "stream": alert.stream,
            "label": alert.label,
            "confidence": alert.confidence,
            "timestamp": alert.timestamp,
            "message": alert.message(),
        });
        self.agent
            .post(&self.url)
            .send_json(payload)
            .with_context(|| format!("POST alert to {}", self.url))?;
        Ok(())
    }
}

/// Publishes each alert as JSON with QoS 1.
pub struct MqttNotifier {
    client: Client,
    topic: String,
    shutdown: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttNotifier {
    /// Connect to `broker` (`host:port`, optionally prefixed with `mqtt://` or
    /// `mqtts://`).
    pub fn connect(broker: &str, topic: &str) -> Result<Self> {
        let (host, port, use_tls) = parse_mqtt_endpoint(broker)?;
        let client_id = format!("gunwatchd-{}", hex::encode(rand::random::<[u8; 4]>()));
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 10);
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection_loop(connection, shutdown.clone());
        log::info!("MQTT alerts -> {} on {} (TLS: {})", topic, broker, use_tls);
        Ok(Self {
            client,
            topic: topic.to_string(),
            shutdown,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.client.disconnect()?;
        let handle = self
            .connection_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Notifier for MqttNotifier {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn send(&self, alert: &Alert) -> Result<()> {
        let payload = serde_json::to_vec(alert).context("serialize alert")?;
        self.client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, payload)
            .context("queue mqtt alert")?;
        Ok(())
    }
}

impl Drop for MqttNotifier {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::SeqCst) {
            if let Err(err) = self.disconnect() {
                log::debug!("mqtt disconnect on drop: {}", err);
            }
        }
    }
}

/// Drives the MQTT event loop; reconnects after errors until shutdown.
fn spawn_connection_loop(mut connection: Connection, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match event {
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    log::warn!("MQTT connection error: {}", e);
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    })
}

fn parse_mqtt_endpoint(addr: &str) -> Result<(String, u16, bool)> {
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
    let (host, port) = remainder
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port.parse().context("invalid MQTT port")?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok((host.to_string(), port, use_tls))
}

/// Delivers to every transport. Succeeds if at least one transport succeeds.
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

impl Notifier for FanoutNotifier {
    fn name(&self) -> &str {
        "fanout"
    }

    fn send(&self, alert: &Alert) -> Result<()> {
        let mut failures = Vec::new();
        for notifier in &self.notifiers {
            if let Err(err) = notifier.send(alert) {
                log::warn!("alert transport {} failed: {:#}", notifier.name(), err);
                failures.push(format!("{}: {:#}", notifier.name(), err));
            }
        }
        if !self.notifiers.is_empty() && failures.len() == self.notifiers.len() {
            return Err(anyhow!("all alert transports failed: {}", failures.join("; ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamSource;

    struct Fixed(bool);

    impl Notifier for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn send(&self, _alert: &Alert) -> Result<()> {
            if self.0 {
                Ok(())
            } else {
                Err(anyhow!("nope"))
            }
        }
    }

    fn alert() -> Alert {
        Alert::new(
            StreamSource::Device(0).key(),
            "rifle".into(),
            0.8,
            "2024-01-01 00:00:00".into(),
        )
    }

    #[test]
    fn fanout_fails_only_when_every_transport_fails() {
        let mixed = FanoutNotifier::new(vec![Arc::new(Fixed(false)), Arc::new(Fixed(true))]);
        assert!(mixed.send(&alert()).is_ok());

        let broken = FanoutNotifier::new(vec![Arc::new(Fixed(false)), Arc::new(Fixed(false))]);
        assert!(broken.send(&alert()).is_err());

        assert!(FanoutNotifier::new(Vec::new()).send(&alert()).is_ok());
    }

    #[test]
    fn mqtt_endpoints_parse() {
        assert_eq!(
            parse_mqtt_endpoint("127.0.0.1:1883").unwrap(),
            ("127.0.0.1".to_string(), 1883, false)
        );
        assert_eq!(
            parse_mqtt_endpoint("mqtts://broker.local:8883").unwrap(),
            ("broker.local".to_string(), 8883, true)
        );
        assert!(parse_mqtt_endpoint("ws://broker:80").is_err());
        assert!(parse_mqtt_endpoint("broker").is_err());
    }

    #[test]
    fn webhook_requires_http_url() {
        assert!(WebhookNotifier::new("ftp://x/y").is_err());
        assert!(WebhookNotifier::new("http://127.0.0.1:9/hook").is_ok());
    }

    #[test]
    fn webhook_delivery_errors_are_reported() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook").unwrap();
        assert!(notifier.send(&alert()).is_err());
    }
}
