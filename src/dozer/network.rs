// Dozer - Duty-cycled temperature and humidity reporter
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::sensor::{DecodedReading, Humidity, TemperatureCelsius};
use hyper::client::HttpConnector;
use hyper::header::{CONNECTION, USER_AGENT};
use hyper::{Body, Client, Request, Uri};
use std::error::Error;
use std::fmt::{self, Formatter};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{Instrument, Level};
use url::Url;

pub const DEFAULT_COLLECTOR_URL: &str = "http://api.thingspeak.com/update";
pub const DEFAULT_NETWORK_TIMEOUT_MS: u64 = 10_000;

const USER_AGENT_VALUE: &str = concat!("dozer/", env!("CARGO_PKG_VERSION"));

/// Averaged values sent to the collector at the end of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payload {
    temperature: TemperatureCelsius,
    humidity: Humidity,
}

impl Payload {
    pub fn new(reading: DecodedReading) -> Self {
        Self {
            temperature: reading.temperature,
            humidity: reading.humidity,
        }
    }

    pub fn temperature(&self) -> TemperatureCelsius {
        self.temperature
    }

    pub fn humidity(&self) -> Humidity {
        self.humidity
    }

    /// Both values as query parameter pairs with exactly two fraction digits.
    pub fn fields(&self) -> [(&'static str, String); 2] {
        [
            ("field1", self.temperature().hundredths().to_string()),
            ("field2", self.humidity().hundredths().to_string()),
        ]
    }

    /// Both values as a `key=value` query string.
    pub fn query(&self) -> String {
        self.fields()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query())
    }
}

#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum NetworkErrorKind {
    Request,
    Connect,
    Timeout,
    Body,
}

impl NetworkErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            NetworkErrorKind::Request => "request",
            NetworkErrorKind::Connect => "connect",
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Body => "body",
        }
    }
}

/// Error sending a payload to the collector.
#[derive(Debug)]
pub enum NetworkError {
    KindMsg(NetworkErrorKind, &'static str),
    KindMsgCause(NetworkErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl NetworkError {
    pub fn kind(&self) -> NetworkErrorKind {
        match self {
            NetworkError::KindMsg(kind, _) => *kind,
            NetworkError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::KindMsg(_, msg) => msg.fmt(f),
            NetworkError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for NetworkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NetworkError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Progress of a send, reported back by a `NetworkSend` implementation.
#[derive(Debug)]
pub enum NetworkEvent {
    /// The collector answered with this HTTP status.
    Response { status: u16 },
    /// The exchange is over and the connection is closed.
    Disconnected,
    /// The payload could not be delivered.
    Failed(NetworkError),
}

/// Sending half of the channel `NetworkEvent`s are reported on.
#[derive(Debug, Clone)]
pub struct NetworkNotifier {
    tx: UnboundedSender<NetworkEvent>,
}

impl NetworkNotifier {
    pub fn notify(&self, event: NetworkEvent) {
        // The receiving side is gone once the cycle is over, nobody cares anymore.
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(message = "dropping network event after end of cycle", event = ?e.0);
        }
    }
}

/// Receiving half of the channel `NetworkEvent`s are reported on.
#[derive(Debug)]
pub struct NetworkEvents {
    rx: UnboundedReceiver<NetworkEvent>,
}

impl NetworkEvents {
    /// Next event if one is ready, without blocking.
    pub fn try_next(&mut self) -> Option<NetworkEvent> {
        self.rx.try_recv().ok()
    }

    pub async fn next(&mut self) -> Option<NetworkEvent> {
        self.rx.recv().await
    }
}

pub fn event_channel() -> (NetworkNotifier, NetworkEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NetworkNotifier { tx }, NetworkEvents { rx })
}

/// Hands a payload to the network for delivery.
///
/// Delivery happens in the background. Progress and the outcome are reported
/// through `notifier`, `send` itself must not block.
pub trait NetworkSend {
    fn send(&mut self, payload: Payload, notifier: NetworkNotifier);
}

/// Deliver payloads to an HTTP collector as a `GET` request with the values and
/// an API key in the query string.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: Client<HttpConnector>,
    endpoint: Url,
    api_key: String,
    timeout: Duration,
    runtime: Handle,
}

impl HttpCollector {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration, runtime: Handle) -> Result<Self, NetworkError> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            NetworkError::KindMsgCause(NetworkErrorKind::Request, "invalid collector URL", Box::new(e))
        })?;

        Ok(Self {
            client: Client::new(),
            endpoint,
            api_key: api_key.to_owned(),
            timeout,
            runtime,
        })
    }

    fn request_uri(&self, payload: &Payload) -> Result<Uri, NetworkError> {
        // Appends to any query the endpoint already has, encoding keys and values.
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api_key", &self.api_key);
            for (key, value) in payload.fields().iter() {
                query.append_pair(key, value);
            }
        }

        url.as_str()
            .parse::<Uri>()
            .map_err(|e| NetworkError::KindMsgCause(NetworkErrorKind::Request, "invalid request URL", Box::new(e)))
    }

    async fn request(client: Client<HttpConnector>, uri: Uri) -> Result<u16, NetworkError> {
        let req = Request::get(uri)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header(CONNECTION, "close")
            .body(Body::empty())
            .map_err(|e| {
                NetworkError::KindMsgCause(NetworkErrorKind::Request, "unable to build request", Box::new(e))
            })?;

        let res = client.request(req).await.map_err(|e| {
            NetworkError::KindMsgCause(NetworkErrorKind::Connect, "unable to reach collector", Box::new(e))
        })?;

        let status = res.status();
        let body = hyper::body::to_bytes(res.into_body()).await.map_err(|e| {
            NetworkError::KindMsgCause(NetworkErrorKind::Body, "unable to read collector response", Box::new(e))
        })?;

        tracing::debug!(
            message = "collector response",
            status = status.as_u16(),
            body = %String::from_utf8_lossy(&body),
        );

        if !status.is_success() {
            tracing::warn!(message = "collector rejected payload", status = status.as_u16());
        }

        Ok(status.as_u16())
    }
}

impl NetworkSend for HttpCollector {
    fn send(&mut self, payload: Payload, notifier: NetworkNotifier) {
        let uri = match self.request_uri(&payload) {
            Ok(uri) => uri,
            Err(e) => {
                notifier.notify(NetworkEvent::Failed(e));
                return;
            }
        };

        let client = self.client.clone();
        let timeout = self.timeout;

        self.runtime.spawn(
            async move {
                tracing::debug!(message = "sending payload to collector", payload = %payload);

                match tokio::time::timeout(timeout, Self::request(client, uri)).await {
                    Ok(Ok(status)) => {
                        notifier.notify(NetworkEvent::Response { status });
                        notifier.notify(NetworkEvent::Disconnected);
                    }
                    Ok(Err(e)) => notifier.notify(NetworkEvent::Failed(e)),
                    Err(_) => notifier.notify(NetworkEvent::Failed(NetworkError::KindMsg(
                        NetworkErrorKind::Timeout,
                        "timeout waiting for collector response",
                    ))),
                }
            }
            .instrument(tracing::span!(Level::DEBUG, "collector_send")),
        );
    }
}
