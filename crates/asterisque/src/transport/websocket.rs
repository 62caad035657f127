use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use asterisque_core::{FrameDecoder, Wire, encode};

use super::pump_decoder;

/// Bind a wire to an established WebSocket. Every outbound message travels
/// as one binary WS message; inbound binary payloads feed the restartable
/// decoder, so fragmentation or coalescing on the carrier is harmless.
pub fn spawn_ws_driver<S>(wire: &Wire, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    tokio::spawn(read_loop(wire.clone(), stream));
    tokio::spawn(write_loop(wire.clone(), sink));
}

async fn read_loop<S>(wire: Wire, mut stream: SplitStream<WebSocketStream<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut decoder = FrameDecoder::new();
    let mut magic_checked = false;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Binary(data)) => {
                decoder.feed(&data);
                if pump_decoder(&wire, &mut decoder, &mut magic_checked).await.is_err() {
                    break;
                }
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => {}
            Ok(WsMessage::Text(_)) => {
                tracing::warn!("unexpected text frame on asterisque carrier");
                break;
            }
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::debug!(error = %e, "websocket read failed");
                break;
            }
        }
    }
    wire.close();
}

async fn write_loop<S>(wire: Wire, mut sink: SplitSink<WebSocketStream<S>, WsMessage>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(msg) = wire.outbound().pop().await {
        let bytes = match encode(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "outbound encode failed");
                break;
            }
        };
        if sink.send(WsMessage::Binary(bytes.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
    wire.close();
}
