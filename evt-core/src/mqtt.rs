//! MQTT implementation of [`MessageBus`]
//!
//! Wraps a rumqttc client. The event loop runs in a background task which
//! routes incoming publishes through the shared [`Router`], tracks the
//! connection state and re-issues every active subscription after each
//! (re)connect. Publishing while the broker is unreachable fails with
//! [`BusError::Disconnected`] instead of queueing.

use crate::bus::{BusError, Handler, MessageBus, Router, SubscriptionId};
use crate::topic;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default broker port
pub const DEFAULT_PORT: u16 = 1883;

/// Connection settings for [`MqttBus`]
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    /// Capacity of the client request channel
    pub request_capacity: usize,
    pub max_packet_size: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            client_id: format!("evt-{}", uuid::Uuid::new_v4().simple()),
            keep_alive: Duration::from_secs(10),
            reconnect_delay: Duration::from_millis(500),
            request_capacity: 256,
            max_packet_size: 4 * 1024 * 1024,
        }
    }
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// MQTT-backed message bus
pub struct MqttBus {
    client: AsyncClient,
    router: Arc<Router>,
    connected: watch::Sender<bool>,
    event_task: JoinHandle<()>,
}

impl MqttBus {
    /// Create the client and start polling. Must be called inside a tokio runtime.
    ///
    /// The connection is established asynchronously; use
    /// [`MqttBus::wait_connected`] to block until the first CONNACK.
    pub fn connect(settings: MqttSettings) -> Arc<Self> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(settings.max_packet_size, settings.max_packet_size);

        let (client, eventloop) = AsyncClient::new(options, settings.request_capacity);
        let router = Arc::new(Router::new());
        let (connected, _) = watch::channel(false);

        info!(
            "Connecting to MQTT broker at {}:{} as {}",
            settings.host, settings.port, settings.client_id
        );

        let event_task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            router.clone(),
            connected.clone(),
            settings.reconnect_delay,
        ));

        Arc::new(Self {
            client,
            router,
            connected,
            event_task,
        })
    }

    /// Wait until the broker has acknowledged the connection
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), BusError> {
        let mut rx = self.connected.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|c| *c)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(BusError::Disconnected),
        };
        result
    }

    /// Disconnect from the broker and stop the event loop
    pub fn shutdown(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect request failed: {}", e);
        }
        self.event_task.abort();
        self.connected.send_replace(false);
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

impl MessageBus for MqttBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if !*self.connected.borrow() {
            return Err(BusError::Disconnected);
        }
        if !topic::is_valid_topic(topic) {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| BusError::Client(e.to_string()))
    }

    fn subscribe(&self, pattern: &str, handler: Handler) -> Result<SubscriptionId, BusError> {
        let already_subscribed = self.router.has_pattern(pattern);
        let id = self.router.add(pattern, handler)?;

        // Subscriptions made while offline are issued on the next CONNACK
        if !already_subscribed && *self.connected.borrow() {
            self.client
                .try_subscribe(pattern, QoS::AtMostOnce)
                .map_err(|e| BusError::Client(e.to_string()))?;
        }
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        let pattern = self
            .router
            .remove(id)
            .ok_or(BusError::UnknownSubscription(id))?;

        if !self.router.has_pattern(&pattern) && *self.connected.borrow() {
            self.client
                .try_unsubscribe(pattern)
                .map_err(|e| BusError::Client(e.to_string()))?;
        }
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    router: Arc<Router>,
    connected: watch::Sender<bool>,
    reconnect_delay: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connection established");
                // Flag first so concurrent subscribers are not lost; a pattern
                // may end up subscribed twice, which the broker tolerates
                connected.send_replace(true);
                for pattern in router.patterns() {
                    if let Err(e) = client.try_subscribe(pattern.clone(), QoS::AtMostOnce) {
                        warn!("Failed to restore subscription {}: {}", pattern, e);
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                router.route(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                if connected.send_replace(false) {
                    warn!("MQTT connection lost: {}", e);
                } else {
                    debug!("MQTT connection attempt failed: {}", e);
                }
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}
