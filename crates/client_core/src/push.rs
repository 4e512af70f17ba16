use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ClientError;

const FRAME_BUFFER: usize = 256;

/// `http(s)://host[/path]` to `ws(s)://host/ws?access_token=..`. An explicit
/// path on the base URL is kept.
pub fn ws_url(base: &str, access_token: &str) -> Result<Url, ClientError> {
    let mut url = Url::parse(base)
        .map_err(|err| ClientError::Validation(format!("invalid push url {base}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ClientError::Validation(format!(
                "push url must be http(s) or ws(s), got {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Validation(format!("cannot use {scheme} for {base}")))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    url.query_pairs_mut().append_pair("access_token", access_token);
    Ok(url)
}

pub async fn connect(base: &str, access_token: &str) -> Result<ReceiverStream<String>, ClientError> {
    let url = ws_url(base, access_token)?;
    let (mut socket, _) = connect_async(url.as_str())
        .await
        .map_err(|err| ClientError::Network(format!("push connect failed: {err}")))?;
    info!(host = url.host_str().unwrap_or_default(), path = url.path(), "push: connected");

    let (frames, rx) = mpsc::channel(FRAME_BUFFER);
    tokio::spawn(async move {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if frames.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("push: receive failed: {err}");
                    break;
                }
            }
        }
        debug!("push: reader finished");
    });

    Ok(ReceiverStream::new(rx))
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
