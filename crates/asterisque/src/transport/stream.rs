use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use asterisque_core::{DEFAULT_QUEUE_CAPACITY, FrameDecoder, Wire, encode};

use super::pump_decoder;

const READ_BUF_SIZE: usize = 8 * 1024;

/// Bind a wire to any `AsyncRead + AsyncWrite` byte channel (a TCP stream, a
/// TLS stream, a duplex pair) by spawning its read and write tasks.
pub fn spawn_stream_driver<S>(wire: &Wire, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    tokio::spawn(read_loop(wire.clone(), reader));
    tokio::spawn(write_loop(wire.clone(), writer));
}

/// An in-process wire pair wired through a duplex byte channel; the first
/// wire is the primary. Intended for tests and local composition.
pub fn mem_pair(capacity: usize) -> (Wire, Wire) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let primary = Wire::new(true, capacity, capacity);
    spawn_stream_driver(&primary, a);
    let secondary = Wire::new(false, capacity, capacity);
    spawn_stream_driver(&secondary, b);
    (primary, secondary)
}

/// `mem_pair` with the default queue capacity.
pub fn mem_pair_default() -> (Wire, Wire) {
    mem_pair(DEFAULT_QUEUE_CAPACITY)
}

async fn read_loop<R>(wire: Wire, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut magic_checked = false;
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                decoder.feed(&buf[..n]);
                if pump_decoder(&wire, &mut decoder, &mut magic_checked).await.is_err() {
                    break;
                }
            }
        }
    }
    wire.close();
}

async fn write_loop<W>(wire: Wire, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = wire.outbound().pop().await {
        let bytes = match encode(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "outbound encode failed");
                break;
            }
        };
        if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
    wire.close();
}
