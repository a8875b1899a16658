use std::{collections::VecDeque, pin::Pin, time::Duration};

use bytes::Bytes;
use russh::{Channel, ChannelId, ChannelMsg, client, server};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{
        mpsc::{self, Receiver, Sender},
        oneshot,
    },
    task::JoinSet,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::ServerError,
    fault::FaultReporter,
    ssh::request::{Chunk, ControlRequest, RequestPolicy},
};

// Fixed delay before the data pumps start, so that early requests are handled first.
pub(crate) const STARTUP_GRACE: Duration = Duration::from_millis(50);

// Chunks buffered between reading one channel and writing the other.
pub(crate) const CHUNK_QUEUE_SIZE: usize = 32;

const COMMAND_QUEUE_SIZE: usize = 16;

// Extended data type for stderr.
const STDERR: u32 = 1;

// Instructions for the task that owns the upstream channel.
#[derive(Debug)]
enum Command {
    Eof,
    // A request to send, with an optional sender for the peer's answer.
    Request(ControlRequest, Option<oneshot::Sender<bool>>),
    Close,
}

// Control access to one of the channels in a pair.
#[derive(Clone)]
enum Outlet {
    // Downstream channel, controlled through the session handle.
    Session {
        handle: server::Handle,
        id: ChannelId,
    },
    // Channel owned by an endpoint task.
    Endpoint(Sender<Command>),
}

impl Outlet {
    async fn eof(&self) {
        match self {
            Outlet::Session { handle, id } => {
                let _ = handle.eof(*id).await;
            }
            Outlet::Endpoint(tx) => {
                let _ = tx.send(Command::Eof).await;
            }
        }
    }

    async fn close(&self) {
        match self {
            Outlet::Session { handle, id } => {
                let _ = handle.close(*id).await;
            }
            Outlet::Endpoint(tx) => {
                let _ = tx.send(Command::Close).await;
            }
        }
    }

    // Send a request, returning the peer's answer when one was wanted and can be awaited.
    async fn forward(&self, request: ControlRequest) -> color_eyre::Result<Option<bool>> {
        match self {
            Outlet::Session { handle, id } => {
                request.send_on_session(handle, *id).await?;
                Ok(None)
            }
            Outlet::Endpoint(tx) => {
                if request.want_reply() {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    tx.send(Command::Request(request, Some(reply_tx)))
                        .await
                        .map_err(|_| ServerError::ChannelClosed)?;
                    // A dropped sender means that the channel closed before answering.
                    Ok(Some(reply_rx.await.unwrap_or(false)))
                } else {
                    tx.send(Command::Request(request, None))
                        .await
                        .map_err(|_| ServerError::ChannelClosed)?;
                    Ok(None)
                }
            }
        }
    }
}

// Where a pump writes: byte streams for the data, and an outlet for EOF and close.
struct DataSink {
    stdout: Pin<Box<dyn AsyncWrite + Send>>,
    stderr: Pin<Box<dyn AsyncWrite + Send>>,
    control: Outlet,
}

impl DataSink {
    // Writers wait for the channel's window, so a slow reader slows down the pump.
    fn new<S>(channel: &Channel<S>, control: Outlet) -> Self
    where
        S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
    {
        DataSink {
            stdout: Box::pin(channel.make_writer()),
            stderr: Box::pin(channel.make_writer_ext(Some(STDERR))),
            control,
        }
    }

    // Returns false once the channel can't take any more data.
    async fn write(&mut self, chunk: Chunk) -> bool {
        match chunk {
            Chunk::Data(data) => self.stdout.write_all(&data).await.is_ok(),
            Chunk::Extended(STDERR, data) => self.stderr.write_all(&data).await.is_ok(),
            Chunk::Extended(ext, data) => {
                #[cfg(not(coverage_nightly))]
                tracing::debug!(ext, len = data.len(), "Dropping unknown extended data.");
                true
            }
        }
    }
}

// Forwards the client's requests to the upstream channel of a relay.
#[derive(Clone)]
pub(crate) struct UpstreamRequests(Outlet);

impl UpstreamRequests {
    // Returns whether the backend accepted the request.
    pub(crate) async fn forward(&self, request: ControlRequest) -> bool {
        let kind = request.kind();
        match self.0.forward(request).await {
            Ok(reply) => reply.unwrap_or(false),
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::debug!(kind, %error, "Unable to forward request.");
                false
            }
        }
    }
}

// Relay between a downstream session channel and its upstream counterpart.
pub(crate) struct ChannelRelay {
    cancellation_token: CancellationToken,
    tasks: JoinSet<()>,
    upstream: Outlet,
    faults: FaultReporter,
}

impl ChannelRelay {
    pub(crate) fn spawn(
        downstream: Channel<server::Msg>,
        handle: server::Handle,
        upstream: Channel<client::Msg>,
        parent_token: &CancellationToken,
        faults: FaultReporter,
    ) -> Self {
        let cancellation_token = parent_token.child_token();
        let mut tasks = JoinSet::new();
        let downstream_outlet = Outlet::Session {
            handle,
            id: downstream.id(),
        };
        let (upstream_command_tx, upstream_command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let upstream_outlet = Outlet::Endpoint(upstream_command_tx);
        let downstream_sink = DataSink::new(&downstream, downstream_outlet.clone());
        let upstream_sink = DataSink::new(&upstream, upstream_outlet.clone());
        let (downstream_data_tx, downstream_data_rx) = mpsc::channel(CHUNK_QUEUE_SIZE);
        let (upstream_data_tx, upstream_data_rx) = mpsc::channel(CHUNK_QUEUE_SIZE);
        let (upstream_request_tx, upstream_request_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        // Cancelled once a side's channel closed and everything it sent has been handled.
        let downstream_drained = CancellationToken::new();
        let upstream_drained = CancellationToken::new();

        tasks.spawn(relay_upstream_requests(
            upstream_request_rx,
            downstream_outlet,
            upstream_drained.clone(),
            cancellation_token.clone(),
        ));
        tasks.spawn(read_downstream(
            downstream,
            downstream_data_tx,
            downstream_drained.clone(),
            cancellation_token.clone(),
        ));
        tasks.spawn(run_endpoint(
            upstream,
            upstream_data_tx,
            upstream_request_tx,
            upstream_command_rx,
            cancellation_token.clone(),
        ));
        tasks.spawn(pump(
            downstream_data_rx,
            upstream_sink,
            downstream_drained,
            cancellation_token.clone(),
        ));
        tasks.spawn(pump(
            upstream_data_rx,
            downstream_sink,
            upstream_drained,
            cancellation_token.clone(),
        ));
        ChannelRelay {
            cancellation_token,
            tasks,
            upstream: upstream_outlet,
            faults,
        }
    }

    pub(crate) fn upstream_requests(&self) -> UpstreamRequests {
        UpstreamRequests(self.upstream.clone())
    }

    // Wait until every task of this relay has finished.
    pub(crate) async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(error) = result {
                self.cancellation_token.cancel();
                self.faults.report_join_error(error);
            }
        }
        self.cancellation_token.cancel();
    }
}

// Read data from the downstream channel into its queue.
// Requests from the client are answered by the session handler instead.
async fn read_downstream(
    mut channel: Channel<server::Msg>,
    data_tx: Sender<Chunk>,
    drained: CancellationToken,
    cancellation_token: CancellationToken,
) {
    let _drained = drained.drop_guard();
    let mut data_tx = Some(data_tx);
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                let _ = channel.close().await;
                break;
            }
            message = channel.wait() => {
                let chunk = match message {
                    None | Some(ChannelMsg::Close) => break,
                    Some(ChannelMsg::Data { data }) => Chunk::Data(Bytes::copy_from_slice(&data)),
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        Chunk::Extended(ext, Bytes::copy_from_slice(&data))
                    }
                    Some(ChannelMsg::Eof) => {
                        data_tx = None;
                        continue;
                    }
                    Some(_) => continue,
                };
                if let Some(tx) = data_tx.as_ref() {
                    if tx.send(chunk).await.is_err() {
                        data_tx = None;
                    }
                }
            }
        }
    }
}

// Own the upstream channel: route its messages into queues, and execute the commands meant for it.
async fn run_endpoint<S>(
    mut channel: Channel<S>,
    data_tx: Sender<Chunk>,
    request_tx: Sender<ControlRequest>,
    mut command_rx: Receiver<Command>,
    cancellation_token: CancellationToken,
) where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    let mut data_tx = Some(data_tx);
    // Senders for the answers to our requests, in the order that they were sent.
    let mut pending_replies: VecDeque<oneshot::Sender<bool>> = VecDeque::new();
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                let _ = channel.close().await;
                break;
            }
            message = channel.wait() => {
                match message {
                    None | Some(ChannelMsg::Close) => break,
                    Some(ChannelMsg::Data { data }) => {
                        if let Some(tx) = data_tx.as_ref() {
                            let _ = tx.send(Chunk::Data(Bytes::copy_from_slice(&data))).await;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if let Some(tx) = data_tx.as_ref() {
                            let _ = tx.send(Chunk::Extended(ext, Bytes::copy_from_slice(&data))).await;
                        }
                    }
                    Some(ChannelMsg::Eof) => data_tx = None,
                    Some(ChannelMsg::Success) => {
                        if let Some(tx) = pending_replies.pop_front() {
                            let _ = tx.send(true);
                        }
                    }
                    Some(ChannelMsg::Failure) => {
                        if let Some(tx) = pending_replies.pop_front() {
                            let _ = tx.send(false);
                        }
                    }
                    Some(message) => {
                        if let Some(request) = ControlRequest::from_message(message) {
                            let _ = request_tx.send(request).await;
                        }
                    }
                }
            }
            Some(command) = command_rx.recv() => {
                let result = match command {
                    Command::Eof => channel.eof().await,
                    Command::Close => channel.close().await,
                    Command::Request(request, reply_tx) => {
                        match request.send_on_channel(&channel).await {
                            Ok(()) => {
                                if let Some(reply_tx) = reply_tx {
                                    pending_replies.push_back(reply_tx);
                                }
                            }
                            Err(error) => {
                                #[cfg(not(coverage_nightly))]
                                tracing::debug!(%error, kind = request.kind(), "Unable to send request.");
                                if let Some(reply_tx) = reply_tx {
                                    let _ = reply_tx.send(false);
                                }
                            }
                        }
                        Ok(())
                    }
                };
                if let Err(error) = result {
                    #[cfg(not(coverage_nightly))]
                    tracing::debug!(%error, "Unable to write to upstream channel.");
                }
            }
        }
    }
}

// Move data from one side to the other, then half-close and finally close the destination.
async fn pump(
    mut source: Receiver<Chunk>,
    mut destination: DataSink,
    source_drained: CancellationToken,
    cancellation_token: CancellationToken,
) {
    tokio::select! {
        _ = cancellation_token.cancelled() => return,
        _ = sleep(STARTUP_GRACE) => (),
    }
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => return,
            chunk = source.recv() => {
                match chunk {
                    Some(chunk) => {
                        if !destination.write(chunk).await {
                            return;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    destination.control.eof().await;
    // Only close once the source side closed and its pending requests went through.
    tokio::select! {
        _ = cancellation_token.cancelled() => return,
        _ = source_drained.cancelled() => (),
    }
    destination.control.close().await;
}

// Hand requests from the backend to the client, one at a time.
async fn relay_upstream_requests(
    mut requests: Receiver<ControlRequest>,
    downstream: Outlet,
    drained: CancellationToken,
    cancellation_token: CancellationToken,
) {
    let _drained = drained.drop_guard();
    loop {
        let request = tokio::select! {
            _ = cancellation_token.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let kind = request.kind();
        match request.policy() {
            RequestPolicy::Forward => {
                #[cfg(not(coverage_nightly))]
                tracing::debug!(kind, "Forwarding request from upstream.");
                if let Err(error) = downstream.forward(request).await {
                    #[cfg(not(coverage_nightly))]
                    tracing::debug!(kind, %error, "Unable to forward request from upstream.");
                }
            }
            RequestPolicy::DeclineQuietly => (),
            RequestPolicy::Decline => {
                #[cfg(not(coverage_nightly))]
                tracing::debug!(kind, "Ignoring unsupported request type from upstream.");
            }
        }
    }
}
