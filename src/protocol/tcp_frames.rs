use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
};

use crate::protocol::wire_protocol::FrameChannel;

const CHANNEL_BUFFER_SIZE: usize = 64;
pub const MAX_FRAME_SIZE_B: usize = 16 * 1024 * 1024;

/// Turns a TCP stream into a `FrameChannel`, one JSON frame per line.
/// The returned channel is closed when the remote end closes the stream or an I/O error occurs;
/// dropping the returned sender shuts down the write half of the stream.
pub fn bridge(stream: TcpStream, label: String) -> FrameChannel {
    let (read, mut write) = stream.into_split();
    let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_BUFFER_SIZE);
    let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_BUFFER_SIZE);

    let rcv_label = label.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(read);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            // the line is read through a limit, a frame without newline is never buffered whole
            let limit = MAX_FRAME_SIZE_B as u64 + 1;
            match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    log::debug!("{rcv_label}: stream closed by remote");
                    return;
                }
                Ok(_) => {
                    if buf.last() != Some(&b'\n') && buf.len() as u64 == limit {
                        log::warn!(
                            "{rcv_label}: frame over the {MAX_FRAME_SIZE_B} bytes limit, closing the stream"
                        );
                        return;
                    }
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    if buf.is_empty() {
                        continue;
                    }
                    let line = match String::from_utf8(std::mem::take(&mut buf)) {
                        Ok(l) => l,
                        Err(e) => {
                            log::debug!("{rcv_label}: dropping frame that is not valid utf-8: {e}");
                            continue;
                        }
                    };
                    if in_tx.send(line).await.is_err() {
                        log::trace!("{rcv_label}: frame receiver dropped, stopping reader");
                        return;
                    }
                }
                Err(e) => {
                    log::debug!("{rcv_label}: error reading from stream: {e}");
                    return;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(mut frame) = out_rx.recv().await {
            frame.push('\n');
            if let Err(e) = write.write_all(frame.as_bytes()).await {
                log::debug!("{label}: error writing to stream: {e}");
                return;
            }
        }
        let _ = write.shutdown().await;
        log::trace!("{label}: frame sender dropped, write half closed");
    });

    FrameChannel {
        tx: out_tx,
        rx: in_rx,
    }
}
