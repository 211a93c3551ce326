//! Shared broker connection.
//!
//! One [`MqttLink`] serves every device. rumqttc queues requests while the
//! broker is unreachable and reconnects on its own; the event loop task only
//! logs and re-publishes the birth message after each reconnect.

use std::sync::Mutex;
use std::time::Duration;

use rumqttc::{
    AsyncClient, Event, LastWill, MqttOptions, Outgoing, Packet, TlsConfiguration, Transport,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flora_core::PublishError;

use crate::config::MqttConfig;

use super::Message;

/// Requests buffered before `publish` starts waiting.
const REQUEST_CAPACITY: usize = 100;

/// Pause before the event loop retries after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long [`MqttLink::disconnect`] waits for queued messages to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS settings for the broker connection, `None` for plain TCP.
///
/// Without a client certificate the platform TLS stack is used, trusting
/// `tls_ca_cert` or the system roots. Mutual TLS loads the PEM certificate,
/// key and CA through rustls.
pub fn tls_configuration(config: &MqttConfig) -> Result<Option<TlsConfiguration>, PublishError> {
    if !config.tls {
        return Ok(None);
    }
    let ca = config.tls_ca_cert.as_ref().map(std::fs::read).transpose()?;
    let tls = match (&config.tls_certfile, &config.tls_keyfile, ca) {
        (Some(cert), Some(key), Some(ca)) => TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: Some((std::fs::read(cert)?, std::fs::read(key)?)),
        },
        (Some(_), Some(_), None) => {
            return Err(PublishError::Broker(
                "MQTT client certificates need tls_ca_cert".to_string(),
            ));
        }
        (_, _, Some(ca)) => TlsConfiguration::SimpleNative {
            ca,
            client_auth: None,
        },
        (_, _, None) => TlsConfiguration::Native,
    };
    Ok(Some(tls))
}

/// A broker connection with its event loop task.
pub struct MqttLink {
    client: AsyncClient,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    /// Configure the client and start the event loop.
    ///
    /// `will` is registered as the last will; `birth` is published after every
    /// successful (re)connect.
    pub fn connect(
        config: &MqttConfig,
        will: Option<Message>,
        birth: Option<Message>,
    ) -> Result<Self, PublishError> {
        let mut options = MqttOptions::new(&config.client_id, &config.hostname, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive));

        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        if let Some(tls) = tls_configuration(config)? {
            options.set_transport(Transport::tls_with_config(tls));
        }

        if let Some(will) = will {
            options.set_last_will(LastWill::new(will.topic, will.payload, will.qos, will.retain));
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        info!(
            "Connecting to MQTT broker {}:{}",
            config.hostname, config.port
        );

        let birth_client = client.clone();
        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!("MQTT connected: {:?}", ack.code);
                        if let Some(birth) = &birth {
                            if let Err(e) = birth_client.try_publish(
                                birth.topic.clone(),
                                birth.qos,
                                birth.retain,
                                birth.payload.clone(),
                            ) {
                                warn!("Failed to queue {}: {}", birth.topic, e);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::PingResp)) => {
                        debug!("MQTT ping response received");
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("MQTT disconnect sent");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}. Reconnecting...", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            event_loop: Mutex::new(Some(event_loop)),
        })
    }

    /// Queue one message.
    pub async fn send(&self, message: Message) -> Result<(), PublishError> {
        debug!(topic = %message.topic, "Publishing");
        self.client
            .publish(message.topic, message.qos, message.retain, message.payload)
            .await
            .map_err(|e| PublishError::Broker(e.to_string()))
    }

    /// Queue messages in order, stopping at the first failure.
    pub async fn send_all(&self, messages: Vec<Message>) -> Result<(), PublishError> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    /// Flush queued messages, disconnect and stop the event loop.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Error disconnecting MQTT client: {}", e);
        }
        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
                warn!("MQTT event loop did not stop in time");
                handle.abort();
            }
        }
        info!("MQTT link closed");
    }
}
