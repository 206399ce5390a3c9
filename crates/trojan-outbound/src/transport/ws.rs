//! WebSocket upgrade over an established TLS stream.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::client_async_with_config;
use tokio_tungstenite::tungstenite::handshake::client::{Request, generate_key};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, header};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::debug;
use trojan_core::defaults::DEFAULT_WS_MAX_FRAME_BYTES;
use trojan_core::transport::WsIo;

use crate::context::DialContext;
use crate::conn::BoxedStream;
use crate::endpoint::WsOptions;
use crate::error::{OutboundError, Stage};

use super::upgrade::UpgradeStream;

/// Upgrades `stream` to the configured WebSocket flavour.
///
/// `host` is the Host header value unless the extra headers carry one.
pub(crate) async fn connect<S>(
    ctx: &DialContext,
    stream: S,
    host: &str,
    opts: &WsOptions,
    peer: &str,
) -> Result<BoxedStream, OutboundError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let path = normalize_path(&opts.path);
    if opts.http_upgrade {
        let mut upgrade = UpgradeStream::new(stream, host, &path, &opts.headers, peer)?;
        if opts.fast_open {
            debug!(peer, %path, "HTTP upgrade sent without waiting for 101");
        } else {
            ctx.run(Stage::Handshake, upgrade.wait_response()).await?;
            debug!(peer, %path, "HTTP upgrade complete");
        }
        return Ok(Box::new(upgrade));
    }

    let request = build_request(host, &path, &opts.headers)?;
    let ws_cfg = WebSocketConfig {
        max_frame_size: Some(DEFAULT_WS_MAX_FRAME_BYTES),
        max_message_size: Some(DEFAULT_WS_MAX_FRAME_BYTES),
        ..WebSocketConfig::default()
    };
    let (ws, response) = ctx
        .run(Stage::Handshake, async {
            client_async_with_config(request, stream, Some(ws_cfg))
                .await
                .map_err(|e| OutboundError::handshake(peer, e))
        })
        .await?;
    debug!(peer, %path, status = %response.status(), "websocket established");
    Ok(Box::new(WsIo::new(ws)))
}

pub(crate) fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

pub(crate) fn host_authority(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

fn build_request(
    host: &str,
    path: &str,
    extra: &[(String, String)],
) -> Result<Request, OutboundError> {
    let authority = host_authority(host);
    let mut request = Request::builder()
        .method("GET")
        .uri(format!("ws://{authority}{path}"))
        .body(())
        .map_err(|e| OutboundError::Config(format!("invalid websocket request: {e}")))?;

    let headers = request.headers_mut();
    headers.insert(header::HOST, header_value(&authority)?);
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    headers.insert(header::SEC_WEBSOCKET_KEY, header_value(&generate_key())?);
    for (name, v) in extra {
        headers.insert(header_name(name)?, header_value(v)?);
    }
    Ok(request)
}

pub(super) fn header_name(name: &str) -> Result<HeaderName, OutboundError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| OutboundError::Config(format!("invalid header name {name:?}: {e}")))
}

/// Rejects control characters, so a value can never start a new header line.
pub(super) fn header_value(value: &str) -> Result<HeaderValue, OutboundError> {
    HeaderValue::from_str(value)
        .map_err(|e| OutboundError::Config(format!("invalid header value {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_host_and_extras() {
        let req = build_request(
            "cdn.example",
            "/tunnel",
            &[("X-Token".into(), "abc".into())],
        )
        .unwrap();
        assert_eq!(req.uri(), "ws://cdn.example/tunnel");
        assert_eq!(req.headers()[header::HOST], "cdn.example");
        assert_eq!(req.headers()["x-token"], "abc");
        assert_eq!(req.headers()[header::UPGRADE], "websocket");
    }

    #[test]
    fn explicit_host_header_wins() {
        let req = build_request("10.0.0.1", "/", &[("Host".into(), "front.example".into())]).unwrap();
        assert_eq!(req.headers()[header::HOST], "front.example");
        assert_eq!(req.headers().get_all(header::HOST).iter().count(), 1);
    }

    #[test]
    fn ipv6_host_is_bracketed() {
        let req = build_request("2001:db8::1", "/ws", &[]).unwrap();
        assert_eq!(req.headers()[header::HOST], "[2001:db8::1]");
    }

    #[test]
    fn bad_header_is_config_error() {
        let err = build_request("h", "/", &[("bad name".into(), "v".into())]).unwrap_err();
        assert!(matches!(err, OutboundError::Config(_)));
        assert_eq!(normalize_path("tunnel"), "/tunnel");
    }
}
