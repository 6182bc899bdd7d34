//! Command pipeline
//!
//! Serializes text commands onto the adapter channel. Callers submit
//! concurrently; a single worker task writes one command at a time, waits for
//! the prompt or the command's deadline, and completes callers in
//! submission order. Nothing is retried here.
//!
//! A timed-out command never blocks the next one, and its late answer never
//! completes the next one:
//!
//! - the channel is marked dirty, and before the next write the worker reads
//!   up to the late answer's prompt, for at most the recovery window
//! - bytes that arrive during the inter-command gap are discarded
//! - an OBD answer whose mode or PID does not match the request in flight is
//!   dropped and the worker keeps reading until the deadline

use std::time::Duration;

use obd_protocol::elm::LINE_TERMINATOR;
use obd_protocol::{clean_response, ResponseFramer, ResponseParser};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::CommandError;
use crate::events::LinkEvent;

/// A submitted command waiting for its turn
struct PendingCommand {
    text: String,
    timeout: Duration,
    created_at: Instant,
    reply: oneshot::Sender<Result<String, CommandError>>,
}

/// Whether the worker still owns a live channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    Open,
    /// Shut down on request
    Closed,
    /// The channel reported EOF or an I/O error
    Lost(String),
}

impl PipelineStatus {
    fn error(&self) -> CommandError {
        match self {
            PipelineStatus::Lost(reason) => CommandError::ConnectionLost(reason.clone()),
            _ => CommandError::ConnectionClosed,
        }
    }
}

/// Handle to a running pipeline worker
pub struct CommandPipeline {
    tx: mpsc::Sender<PendingCommand>,
    shutdown_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<PipelineStatus>,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: PipelineConfig,
}

impl CommandPipeline {
    /// Start a worker that owns `stream` until shutdown or link loss
    pub fn spawn<S>(stream: S, config: PipelineConfig, events: broadcast::Sender<LinkEvent>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(PipelineStatus::Open);

        let worker = Worker {
            stream,
            framer: ResponseFramer::new(),
            buf: [0u8; 256],
            shutdown_rx,
            events,
            inter_command_delay: config.inter_command_delay(),
            recovery_window: config.recovery_window(),
            dirty: false,
        };
        let handle = tokio::spawn(worker.run(rx, status_tx));

        Self {
            tx,
            shutdown_tx,
            status_rx,
            worker: Mutex::new(Some(handle)),
            config,
        }
    }

    /// Submit a command and wait for its cleaned response
    pub async fn submit(&self, text: &str, timeout: Duration) -> Result<String, CommandError> {
        let (reply, rx) = oneshot::channel();
        let pending = PendingCommand {
            text: text.trim().to_string(),
            timeout,
            created_at: Instant::now(),
            reply,
        };
        self.tx
            .send(pending)
            .await
            .map_err(|_| CommandError::ConnectionClosed)?;
        rx.await.map_err(|_| CommandError::ConnectionClosed)?
    }

    /// Submit with the configured default timeout
    pub async fn submit_default(&self, text: &str) -> Result<String, CommandError> {
        self.submit(text, self.config.default_timeout()).await
    }

    pub fn status(&self) -> PipelineStatus {
        self.status_rx.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.status() != PipelineStatus::Open
    }

    /// Resolves once the worker has stopped
    pub async fn closed(&self) -> PipelineStatus {
        let mut rx = self.status_rx.clone();
        let waited = rx
            .wait_for(|status| *status != PipelineStatus::Open)
            .await
            .map(|status| status.clone());
        match waited {
            Ok(status) => status,
            Err(_) => self.status_rx.borrow().clone(),
        }
    }

    /// Stop the worker, reject everything pending and close the channel
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Pipeline worker ended abnormally: {}", e);
            }
        }
    }
}

enum Step {
    Done(Result<String, CommandError>),
    Stop(PipelineStatus),
}

struct Worker<S> {
    stream: S,
    framer: ResponseFramer,
    buf: [u8; 256],
    shutdown_rx: watch::Receiver<bool>,
    events: broadcast::Sender<LinkEvent>,
    inter_command_delay: Duration,
    recovery_window: Duration,
    /// A timed-out command's answer may still be on its way
    dirty: bool,
}

impl<S> Worker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<PendingCommand>,
        status_tx: watch::Sender<PipelineStatus>,
    ) {
        debug!("Command pipeline started");
        let mut last_done: Option<Instant> = None;

        let status = loop {
            let pending = tokio::select! {
                biased;
                _ = self.shutdown_rx.wait_for(|stop| *stop) => break PipelineStatus::Closed,
                pending = rx.recv() => match pending {
                    Some(pending) => pending,
                    None => break PipelineStatus::Closed,
                },
                result = self.stream.read(&mut self.buf) => match result {
                    Ok(0) => break PipelineStatus::Lost("adapter closed the channel".into()),
                    Ok(n) => {
                        if self.dirty {
                            self.framer.push_bytes(&self.buf[..n]);
                            if self.framer.next_response().is_some() {
                                debug!("Late answer arrived while idle; discarded");
                                self.framer.clear();
                                self.dirty = false;
                            }
                        } else {
                            debug!("Discarding {} unsolicited bytes", n);
                        }
                        continue;
                    }
                    Err(e) => break PipelineStatus::Lost(e.to_string()),
                },
            };

            if pending.reply.is_closed() {
                debug!("Skipping {}: caller gave up", pending.text);
                continue;
            }

            if self.dirty {
                if let Err(status) = self.recover().await {
                    let _ = pending.reply.send(Err(status.error()));
                    break status;
                }
            }
            if let Some(done) = last_done {
                if let Err(status) = self.drain_until(done + self.inter_command_delay).await {
                    let _ = pending.reply.send(Err(status.error()));
                    break status;
                }
            }

            debug!(
                "Dispatching {} after {:?} in queue",
                pending.text,
                pending.created_at.elapsed()
            );
            let step = self.execute(&pending).await;
            last_done = Some(Instant::now());

            match step {
                Step::Done(result) => {
                    let _ = pending.reply.send(result);
                }
                Step::Stop(status) => {
                    let _ = pending.reply.send(Err(status.error()));
                    break status;
                }
            }
        };

        match &status {
            PipelineStatus::Lost(reason) => warn!("Adapter channel lost: {}", reason),
            _ => info!("Command pipeline shutting down"),
        }
        status_tx.send_replace(status);

        rx.close();
        let mut rejected = 0;
        while let Ok(pending) = rx.try_recv() {
            let _ = pending.reply.send(Err(CommandError::ConnectionClosed));
            rejected += 1;
        }
        if rejected > 0 {
            debug!("Rejected {} pending command(s)", rejected);
        }

        if let Err(e) = self.stream.shutdown().await {
            debug!("Channel shutdown: {}", e);
        }
    }

    /// Read up to the prompt that ends a timed-out command's answer
    ///
    /// Gives up after the recovery window. An answer that shows up even later
    /// is still caught by the request check in [`exchange`].
    async fn recover(&mut self) -> Result<(), PipelineStatus> {
        let until = Instant::now() + self.recovery_window;
        while self.framer.next_response().is_none() {
            let read = tokio::select! {
                biased;
                _ = self.shutdown_rx.wait_for(|stop| *stop) => return Err(PipelineStatus::Closed),
                read = timeout_at(until, self.stream.read(&mut self.buf)) => read,
            };
            match read {
                Err(_) => {
                    debug!("No prompt within {:?} after a timeout", self.recovery_window);
                    break;
                }
                Ok(Ok(0)) => return Err(PipelineStatus::Lost("adapter closed the channel".into())),
                Ok(Ok(n)) => self.framer.push_bytes(&self.buf[..n]),
                Ok(Err(e)) => return Err(PipelineStatus::Lost(e.to_string())),
            }
        }
        self.framer.clear();
        self.dirty = false;
        Ok(())
    }

    /// Read and discard until `until`, keeping the adapter's pace
    async fn drain_until(&mut self, until: Instant) -> Result<(), PipelineStatus> {
        loop {
            let read = tokio::select! {
                biased;
                _ = self.shutdown_rx.wait_for(|stop| *stop) => return Err(PipelineStatus::Closed),
                read = timeout_at(until, self.stream.read(&mut self.buf)) => read,
            };
            match read {
                Err(_) => return Ok(()),
                Ok(Ok(0)) => return Err(PipelineStatus::Lost("adapter closed the channel".into())),
                Ok(Ok(n)) => debug!("Discarding {} stale bytes", n),
                Ok(Err(e)) => return Err(PipelineStatus::Lost(e.to_string())),
            }
        }
    }

    async fn execute(&mut self, pending: &PendingCommand) -> Step {
        self.framer.clear();
        let deadline = Instant::now() + pending.timeout;
        let line = format!("{}{}", pending.text, LINE_TERMINATOR);
        let _ = self.events.send(LinkEvent::DataOut {
            text: pending.text.clone(),
        });

        let io = exchange(
            &mut self.stream,
            &mut self.framer,
            &mut self.buf,
            &self.events,
            &pending.text,
            &line,
        );
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown_rx.wait_for(|stop| *stop) => None,
            result = timeout_at(deadline, io) => Some(result),
        };

        match outcome {
            None => Step::Stop(PipelineStatus::Closed),
            Some(Err(_)) => {
                // Keep partial bytes; recovery reads on to their prompt
                self.dirty = true;
                let timeout_ms = pending.timeout.as_millis() as u64;
                debug!("{} timed out after {}ms", pending.text, timeout_ms);
                Step::Done(Err(CommandError::Timeout {
                    command: pending.text.clone(),
                    timeout_ms,
                }))
            }
            Some(Ok(Ok(Some(response)))) => {
                debug!("{} -> {:?}", pending.text, response);
                Step::Done(Ok(response))
            }
            Some(Ok(Ok(None))) => Step::Stop(PipelineStatus::Lost("adapter closed the channel".into())),
            Some(Ok(Err(e))) => Step::Stop(PipelineStatus::Lost(e.to_string())),
        }
    }
}

/// Write one command line and read until its answer arrives
///
/// Returns the cleaned answer. Frames that answer a different OBD request
/// are reported as traffic and skipped. `Ok(None)` means the channel hit EOF.
async fn exchange<S>(
    stream: &mut S,
    framer: &mut ResponseFramer,
    buf: &mut [u8],
    events: &broadcast::Sender<LinkEvent>,
    request: &str,
    line: &str,
) -> std::io::Result<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    loop {
        while let Some(frame) = framer.next_response() {
            let _ = events.send(LinkEvent::DataIn {
                text: frame.clone(),
            });
            let response = clean_response(&frame, request);
            if ResponseParser::answers_request(request, &response) {
                return Ok(Some(response));
            }
            warn!("Dropping a stale answer while waiting for {}: {:?}", request, response);
        }
        let n = stream.read(buf).await?;
        if n == 0 {
            return Ok(None);
        }
        framer.push_bytes(&buf[..n]);
    }
}
