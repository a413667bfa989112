//! MQTT tunnel transport
//!
//! Session setup is a rendezvous through the broker: the dialer
//! subscribes to a unique per-client topic `{base}/uniq/{nonce}` and
//! publishes its nonce to `{base}/listener`; the listener assigns a
//! tunnel id and answers on the unique topic. Data then flows on
//! `{base}/srv/{id}` (listener to dialer) and `{base}/cli/{id}`
//! (dialer to listener), one publish per tunnel write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{TunnelConn, TunnelError, TunnelHandler, TunnelListener};
use crate::tunnel::TunnelDialer;

const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(30);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(10);

/// In-memory pipe capacity between the broker pump and the protocol
/// layer.
const PUMP_BUFFER: usize = 256 * 1024;

/// Outbound chunk ceiling; one chunk becomes one publish.
const CHUNK_SIZE: usize = 64 * 1024;

/// Inbound publishes queued per session before the broker pump stalls.
const SESSION_QUEUE: usize = 256;

struct MqttAddr {
    host: String,
    port: u16,
    base: String,
    username: String,
    password: String,
}

impl MqttAddr {
    fn parse(addr: &str) -> Result<Self, TunnelError> {
        let url = super::parse_url(addr)?;
        let host = url
            .host_str()
            .ok_or_else(|| TunnelError::Address {
                addr: addr.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_string();
        let port = url.port().unwrap_or(1883);
        let base = url.path().trim_end_matches('/').to_string();
        Ok(Self {
            host,
            port,
            base,
            username: url.username().to_string(),
            password: url.password().unwrap_or("").to_string(),
        })
    }

    fn options(&self, id_prefix: &str) -> MqttOptions {
        let client_id = format!("{}-{:032x}", id_prefix, rand::random::<u128>());
        let mut opts = MqttOptions::new(client_id, self.host.clone(), self.port);
        opts.set_keep_alive(MQTT_KEEP_ALIVE);
        if !self.username.is_empty() {
            opts.set_credentials(self.username.clone(), self.password.clone());
        }
        opts
    }

    fn listener_topic(&self) -> String {
        format!("{}/listener", self.base)
    }

    fn uniq_topic(&self, nonce: &str) -> String {
        format!("{}/uniq/{}", self.base, nonce)
    }

    /// Listener-to-dialer data topic.
    fn srv_topic(&self, tunnel_id: i64) -> String {
        format!("{}/srv/{}", self.base, tunnel_id)
    }

    /// Dialer-to-listener data topic.
    fn cli_topic(&self, tunnel_id: i64) -> String {
        format!("{}/cli/{}", self.base, tunnel_id)
    }
}

/// MQTT tunnel dialer.
pub struct MqttDialer {
    url: String,
}

impl MqttDialer {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl TunnelDialer for MqttDialer {
    async fn dial_and_serve(&self, handler: Arc<dyn TunnelHandler>) -> crate::Result<()> {
        let addr = MqttAddr::parse(&self.url)?;
        let (client, mut eventloop) = AsyncClient::new(addr.options("tnet_tun_cli"), 64);

        let nonce = format!("{:032x}", rand::random::<u128>());
        let uniq_topic = addr.uniq_topic(&nonce);
        client
            .subscribe(&uniq_topic, QoS::AtMostOnce)
            .await
            .map_err(|e| TunnelError::Connect(e.to_string()))?;
        client
            .publish(addr.listener_topic(), QoS::AtMostOnce, false, nonce)
            .await
            .map_err(|e| TunnelError::Connect(e.to_string()))?;

        // Wait for the listener to assign us a tunnel id.
        let rendezvous = async {
            loop {
                let event = eventloop
                    .poll()
                    .await
                    .map_err(|e| TunnelError::Connect(e.to_string()))?;
                if let Event::Incoming(Packet::Publish(p)) = event {
                    if p.topic == uniq_topic {
                        let raw = String::from_utf8_lossy(&p.payload).into_owned();
                        return raw.parse::<i64>().map_err(|_| {
                            TunnelError::Connect(format!("bad tunnel id: {:?}", raw))
                        });
                    }
                }
            }
        };
        let tunnel_id = tokio::time::timeout(RENDEZVOUS_TIMEOUT, rendezvous)
            .await
            .map_err(|_| TunnelError::Connect("rendezvous timed out".to_string()))??;
        let _ = client.unsubscribe(&uniq_topic).await;
        debug!("mqtt rendezvous complete, tunID {}", tunnel_id);

        let read_topic = addr.srv_topic(tunnel_id);
        client
            .subscribe(&read_topic, QoS::AtMostOnce)
            .await
            .map_err(|e| TunnelError::Connect(e.to_string()))?;

        let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(SESSION_QUEUE);
        let dispatch = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        if p.topic == read_topic && inbound_tx.send(p.payload).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("mqtt event loop ended: {}", e);
                        return;
                    }
                }
            }
        });

        let result = serve_session(
            client,
            addr.cli_topic(tunnel_id),
            inbound_rx,
            tunnel_id,
            false,
            handler,
        )
        .await;
        dispatch.abort();
        result
    }
}

/// MQTT tunnel listener.
pub struct MqttListener {
    url: String,
}

impl MqttListener {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl TunnelListener for MqttListener {
    async fn listen_and_serve(&self, handler: Arc<dyn TunnelHandler>) -> crate::Result<()> {
        let addr = MqttAddr::parse(&self.url)?;
        let (client, mut eventloop) = AsyncClient::new(addr.options("tnet_tun_srv"), 64);

        let listener_topic = addr.listener_topic();
        client
            .subscribe(&listener_topic, QoS::AtMostOnce)
            .await
            .map_err(|e| TunnelError::Bind(e.to_string()))?;
        info!("tunnel listening on {}", self.url);

        let mut next_tunnel_id: i64 = 0;
        // Read topic -> inbound queue of the session it belongs to.
        let mut sessions: HashMap<String, mpsc::Sender<Bytes>> = HashMap::new();

        loop {
            let event = eventloop
                .poll()
                .await
                .map_err(|e| TunnelError::Transport(e.to_string()))?;
            let publish = match event {
                Event::Incoming(Packet::Publish(p)) => p,
                _ => continue,
            };

            if publish.topic == listener_topic {
                let nonce = String::from_utf8_lossy(&publish.payload).into_owned();
                next_tunnel_id += 1;
                let tunnel_id = next_tunnel_id;

                let read_topic = addr.cli_topic(tunnel_id);
                if let Err(e) = client.subscribe(&read_topic, QoS::AtMostOnce).await {
                    warn!("subscribe for tunID {} failed: {}", tunnel_id, e);
                    continue;
                }
                let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(SESSION_QUEUE);
                sessions.insert(read_topic.clone(), inbound_tx);

                let session_client = client.clone();
                let write_topic = addr.srv_topic(tunnel_id);
                let session_handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    info!("new tun connection, tunID {}", tunnel_id);
                    if let Err(e) = serve_session(
                        session_client,
                        write_topic,
                        inbound_rx,
                        tunnel_id,
                        true,
                        session_handler,
                    )
                    .await
                    {
                        warn!("tun connection failed, tunID {}: {}", tunnel_id, e);
                    }
                    info!("tun connection closed, tunID {}", tunnel_id);
                });

                if let Err(e) = client
                    .publish(
                        addr.uniq_topic(&nonce),
                        QoS::AtMostOnce,
                        false,
                        tunnel_id.to_string(),
                    )
                    .await
                {
                    warn!("rendezvous reply for tunID {} failed: {}", tunnel_id, e);
                }
            } else if let Some(tx) = sessions.get(&publish.topic).cloned() {
                if tx.send(publish.payload).await.is_err() {
                    // Session ended; stop routing its topic.
                    sessions.remove(&publish.topic);
                    let _ = client.unsubscribe(&publish.topic).await;
                }
            } else {
                debug!("publish on unknown topic {}", publish.topic);
            }
        }
    }
}

/// Bridge one topic pair to an in-memory byte pipe and run the
/// protocol handler over the pipe's other end.
async fn serve_session(
    client: AsyncClient,
    write_topic: String,
    mut inbound: mpsc::Receiver<Bytes>,
    tunnel_id: i64,
    is_listener: bool,
    handler: Arc<dyn TunnelHandler>,
) -> crate::Result<()> {
    let (near, far) = tokio::io::duplex(PUMP_BUFFER);
    let (reader, writer) = tokio::io::split(near);
    let (mut pump_read, mut pump_write) = tokio::io::split(far);

    let conn = TunnelConn {
        tunnel_id,
        is_listener,
        reader: Box::new(reader),
        writer: Box::new(writer),
    };
    let handler_task = tokio::spawn(async move { handler.serve_tunnel(conn).await });

    let pump = async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            tokio::select! {
                payload = inbound.recv() => match payload {
                    Some(payload) => {
                        if pump_write.write_all(&payload).await.is_err() {
                            break;
                        }
                    }
                    // Broker connection is gone.
                    None => break,
                },
                res = pump_read.read(&mut buf) => {
                    let n = res.map_err(TunnelError::Io)?;
                    if n == 0 {
                        break;
                    }
                    client
                        .publish(&write_topic, QoS::AtMostOnce, false, buf[..n].to_vec())
                        .await
                        .map_err(|e| TunnelError::Transport(e.to_string()))?;
                }
            }
        }
        Ok(())
    };

    let pump_result: crate::Result<()> = pump.await;
    let handler_result = match handler_task.await {
        Ok(res) => res,
        Err(e) => Err(crate::Error::Io(std::io::Error::other(e))),
    };
    pump_result?;
    handler_result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing() {
        let addr = MqttAddr::parse("mqtt://user:pw@broker.local:2883/topic/tnet").unwrap();
        assert_eq!(addr.host, "broker.local");
        assert_eq!(addr.port, 2883);
        assert_eq!(addr.base, "/topic/tnet");
        assert_eq!(addr.username, "user");
        assert_eq!(addr.password, "pw");
        assert_eq!(addr.listener_topic(), "/topic/tnet/listener");
        assert_eq!(addr.srv_topic(3), "/topic/tnet/srv/3");
        assert_eq!(addr.cli_topic(3), "/topic/tnet/cli/3");
    }

    #[test]
    fn default_port_applies() {
        let addr = MqttAddr::parse("mqtt://broker.local/tnet").unwrap();
        assert_eq!(addr.port, 1883);
        assert!(addr.username.is_empty());
    }
}
