use super::Transport;
use crate::error::GatewayError;
use crate::wrapper::{empty_body, ApiWrapper, BoxBody};
use futures_util::{SinkExt, StreamExt};
use http::header::{
    HeaderName, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    UPGRADE,
};
use http::StatusCode;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, warn};

/// Headers that belong to the handshake itself and must not be copied to
/// the upstream dial.
fn control_headers() -> [HeaderName; 7] {
    [
        CONNECTION,
        UPGRADE,
        SEC_WEBSOCKET_KEY,
        SEC_WEBSOCKET_ACCEPT,
        HeaderName::from_static("sec-websocket-version"),
        HeaderName::from_static("sec-websocket-extensions"),
        HeaderName::from_static("host"),
    ]
}

/// Upgrades the inbound connection and bridges it to a `ws://`/`wss://`
/// origin. The connection is hijacked: the returned 101 response is the
/// last write the engine performs, and the response pipeline never runs.
pub async fn trip(
    transport: &Transport,
    wrapper: &mut ApiWrapper,
) -> Result<hyper::Response<BoxBody>, GatewayError> {
    let key = wrapper
        .request
        .headers
        .get(SEC_WEBSOCKET_KEY)
        .cloned()
        .ok_or_else(|| GatewayError::Upstream("missing Sec-WebSocket-Key".into()))?;
    let on_upgrade = wrapper
        .request
        .on_upgrade
        .take()
        .ok_or_else(|| GatewayError::Upstream("connection cannot be upgraded".into()))?;

    // Dial the origin first so a refused upgrade surfaces as a normal
    // error instead of a half-upgraded client.
    let mut upstream_request = tokio_tungstenite::tungstenite::client::IntoClientRequest::
        into_client_request(wrapper.request.url.as_str())
        .map_err(|e| GatewayError::Upstream(format!("invalid websocket origin: {e}")))?;
    for (name, value) in &wrapper.request.headers {
        if control_headers().contains(name) {
            continue;
        }
        upstream_request.headers_mut().insert(name, value.clone());
    }

    let connect = tokio::time::timeout(transport.upstream_timeout, connect_async(upstream_request));
    let (upstream_ws, upstream_response) = match connect.await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(GatewayError::Upstream(format!("websocket dial failed: {e}"))),
        Err(_) => return Err(GatewayError::Upstream("websocket dial timed out".into())),
    };

    // From here on the connection belongs to the bridge.
    wrapper.hijacked = true;

    let accept = derive_accept_key(key.as_bytes());
    let mut response = hyper::Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = upstream_response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        response = response.header(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }
    let response = response
        .body(empty_body())
        .map_err(|e| GatewayError::Internal(format!("could not build 101 response: {e}")))?;

    let id = wrapper.id;
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("ws: client upgrade failed, id={}, error={}", id, e);
                return;
            }
        };
        let client_ws =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

        let (mut client_tx, mut client_rx) = client_ws.split();
        let (mut upstream_tx, mut upstream_rx) = upstream_ws.split();

        let client_to_upstream = async {
            while let Some(Ok(message)) = client_rx.next().await {
                if upstream_tx.send(message).await.is_err() {
                    break;
                }
            }
        };
        let upstream_to_client = async {
            while let Some(Ok(message)) = upstream_rx.next().await {
                if client_tx.send(message).await.is_err() {
                    break;
                }
            }
        };

        tokio::select! {
            _ = client_to_upstream => {}
            _ = upstream_to_client => {}
        }
        debug!("ws: bridge closed, id={}", id);
    });

    Ok(response)
}
