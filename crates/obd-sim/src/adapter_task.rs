//! Virtual adapter actor task
//!
//! Owns one end of a duplex stream and answers every carriage-return
//! terminated command through a shared [`VirtualElm327`]. The adapter is
//! shared so tests can inspect its history or silence it while connected.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::adapter::VirtualElm327;

/// Adapter state shared between the task and its owner
pub type SharedAdapter = Arc<Mutex<VirtualElm327>>;

/// Commands that can be sent to a running virtual adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualAdapterCommand {
    /// Drop the link as if the adapter lost power
    Disconnect,
}

/// Run the virtual adapter until the stream closes or it is told to disconnect
pub async fn run_virtual_adapter_task<S>(
    mut stream: S,
    adapter: SharedAdapter,
    mut cmd_rx: mpsc::Receiver<VirtualAdapterCommand>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 512];
    let mut line: Vec<u8> = Vec::with_capacity(64);
    let mut control_open = true;

    info!("Starting virtual ELM327 task");

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("Virtual ELM327 stream closed");
                        break;
                    }
                    Ok(n) => {
                        for byte in &buf[..n] {
                            match byte {
                                b'\r' => {
                                    let text = String::from_utf8_lossy(&line).into_owned();
                                    line.clear();
                                    let (reply, delay) = {
                                        let mut adapter = adapter.lock().await;
                                        (adapter.process_line(&text), adapter.response_delay())
                                    };
                                    if let Some(reply) = reply {
                                        if !delay.is_zero() {
                                            tokio::time::sleep(delay).await;
                                        }
                                        stream.write_all(reply.as_bytes()).await?;
                                        stream.flush().await?;
                                    }
                                }
                                b'\n' => {}
                                other => line.push(*other),
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Virtual ELM327 stream error: {}", e);
                        return Err(e);
                    }
                }
            }

            cmd = cmd_rx.recv(), if control_open => {
                match cmd {
                    Some(VirtualAdapterCommand::Disconnect) => {
                        info!("Virtual ELM327 dropping link");
                        break;
                    }
                    None => control_open = false,
                }
            }
        }
    }

    info!("Virtual ELM327 task ended");
    Ok(())
}
