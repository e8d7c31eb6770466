//! MQTT side of the relay.
//!
//! [`Broker`] is the seam the relay loop talks to; [`MqttBroker`] backs it
//! with rumqttc. One broker is shared by every connection: each relay
//! publishes on its own topic and gets its own receiver for the topic it
//! subscribes to.
//!
//! rumqttc only makes progress while its event loop is polled, so
//! [`MqttBroker::connect`] waits for the first CONNACK and then hands the
//! event loop to a dispatcher task. The dispatcher routes incoming
//! publications to subscribers by topic filter and keeps polling through
//! connection errors, which is what drives rumqttc's reconnect.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use rand::Rng;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use tokio::sync::mpsc;

/// Publish/subscribe operations the relay needs from a broker.
pub trait Broker: Send + Sync + 'static {
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Register interest in `topic`. Every matching publication's payload
    /// is delivered on the returned receiver until it is dropped.
    fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
    ) -> impl Future<Output = Result<mpsc::UnboundedReceiver<Vec<u8>>>> + Send;
}

/// Delivery level from its config byte.
pub fn qos(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        n => bail!("invalid QOS {n}"),
    }
}

/// MQTT topic filter match, supporting `+` and `#`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // Wildcards never match system topics at the first level.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Route {
    filter: String,
    qos: QoS,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

type Routes = Arc<Mutex<Vec<Route>>>;

pub struct MqttBroker {
    client: AsyncClient,
    routes: Routes,
}

impl MqttBroker {
    /// Connect and wait for the broker to accept us.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = mqtt_options(url, &client_id())?;
        let (client, mut eventloop) = AsyncClient::new(options, 100);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    tracing::info!(
                        broker = %url,
                        session_present = ack.session_present,
                        "MQTT connected",
                    );
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(anyhow!("MQTT connect to {url} failed: {e}")),
            }
        }

        let routes: Routes = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(dispatch(eventloop, client.clone(), routes.clone()));

        Ok(Self { client, routes })
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "MQTT disconnect");
        }
    }
}

impl Broker for MqttBroker {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .with_context(|| format!("publish to {topic} failed"))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().push(Route {
            filter: topic.to_string(),
            qos,
            tx,
        });
        self.client
            .subscribe(topic, qos)
            .await
            .with_context(|| format!("subscribe to {topic} failed"))?;
        Ok(rx)
    }
}

async fn dispatch(mut eventloop: EventLoop, client: AsyncClient, routes: Routes) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => deliver(&routes, &p.topic, &p.payload),
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::info!(session_present = ack.session_present, "MQTT reconnected");
                if !ack.session_present {
                    resubscribe(&client, &routes);
                }
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => {
                tracing::debug!("MQTT client dropped, dispatcher exiting");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "MQTT connection error, retrying in 1s");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn deliver(routes: &Routes, topic: &str, payload: &[u8]) {
    let mut routes = routes.lock();
    routes.retain(|r| {
        if !topic_matches(&r.filter, topic) {
            return !r.tx.is_closed();
        }
        r.tx.send(payload.to_vec()).is_ok()
    });
}

fn resubscribe(client: &AsyncClient, routes: &Routes) {
    let mut routes = routes.lock();
    routes.retain(|r| !r.tx.is_closed());
    for r in routes.iter() {
        // Runs inside the event loop task; must not await the request queue.
        if let Err(e) = client.try_subscribe(r.filter.clone(), r.qos) {
            tracing::warn!(topic = %r.filter, error = %e, "MQTT resubscribe failed");
        }
    }
}

fn client_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{nanos}{}", rand::thread_rng().gen_range(0..10))
}

/// Build options from `scheme://[user:pass@]host[:port]`.
///
/// `tcp`/`mqtt` are plain (default port 1883), `ssl`/`tls`/`mqtts` use TLS
/// (default port 8883). A URL without a scheme is plain TCP.
fn mqtt_options(url: &str, client_id: &str) -> Result<MqttOptions> {
    let (scheme, rest) = url.split_once("://").unwrap_or(("tcp", url));
    let tls = match scheme {
        "tcp" | "mqtt" => false,
        "ssl" | "tls" | "mqtts" => true,
        other => bail!("unsupported MQTT broker scheme {other:?} in {url}"),
    };

    let rest = rest.trim_end_matches('/');
    let (credentials, addr) = match rest.rsplit_once('@') {
        Some((creds, addr)) => (Some(creds), addr),
        None => (None, rest),
    };
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .with_context(|| format!("bad MQTT broker port in {url}"))?,
        ),
        None => (addr, if tls { 8883 } else { 1883 }),
    };
    if host.is_empty() {
        bail!("missing MQTT broker host in {url}");
    }

    let mut options = MqttOptions::new(client_id, host, port);
    options
        .set_clean_session(false)
        .set_keep_alive(Duration::from_secs(30));
    if let Some(creds) = credentials {
        let (user, pass) = creds.split_once(':').unwrap_or((creds, ""));
        options.set_credentials(user, pass);
    }
    if tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    Ok(options)
}
