//! WebSocket transport for the signaling channel.

use async_trait::async_trait;
use calllink_core::{ConnectionError, FrameSink, FrameStream, Transport};
use futures_util::{SinkExt, StreamExt, future};
use secrecy::{ExposeSecret, SecretString};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, info, warn};

/// Connects to signaling endpoints over `ws://` or `wss://`.
#[derive(Default)]
pub struct WsTransport {
    token: Option<SecretString>,
}

impl WsTransport {
    /// With a `token`, every handshake carries it as a bearer credential.
    pub fn new(token: Option<SecretString>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, endpoint: &str) -> Result<(FrameSink, FrameStream), ConnectionError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| connect_error(endpoint, e))?;
        if let Some(token) = &self.token {
            let value = format!("Bearer {}", token.expose_secret())
                .parse()
                .map_err(|_| ConnectionError::Handshake {
                    endpoint: endpoint.to_owned(),
                    reason: "token is not a valid header value".into(),
                })?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| connect_error(endpoint, e))?;
        info!(%endpoint, status = %response.status(), "Connected to signaling WebSocket.");
        let (ws_tx, ws_rx) = ws_stream.split();

        let sink = ws_tx
            .sink_map_err(|e| ConnectionError::Lost(e.to_string()))
            .with(|text: String| future::ok::<_, ConnectionError>(WsMessage::Text(text.into())));

        let stream = ws_rx
            .take_while(|message| future::ready(!matches!(message, Ok(WsMessage::Close(_)))))
            .filter_map(|message| {
                future::ready(match message {
                    Ok(WsMessage::Text(text)) => Some(Ok(text.to_string())),
                    Ok(WsMessage::Binary(data)) => {
                        warn!(len = data.len(), "Ignoring binary signaling frame.");
                        None
                    }
                    Ok(other) => {
                        debug!(?other, "Ignoring control frame.");
                        None
                    }
                    Err(e) => Some(Err(ConnectionError::Lost(e.to_string()))),
                })
            });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn connect_error(endpoint: &str, error: tungstenite::Error) -> ConnectionError {
    let endpoint = endpoint.to_owned();
    match error {
        tungstenite::Error::Io(e) => ConnectionError::Unreachable {
            endpoint,
            reason: e.to_string(),
        },
        tungstenite::Error::Url(e) => ConnectionError::Unreachable {
            endpoint,
            reason: e.to_string(),
        },
        tungstenite::Error::Http(response) => ConnectionError::Handshake {
            endpoint,
            reason: format!("server answered {}", response.status()),
        },
        other => ConnectionError::Handshake {
            endpoint,
            reason: other.to_string(),
        },
    }
}
