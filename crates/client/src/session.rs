//! Connection session: drives the framed stream, gates on the
//! cluster-config exchange, and dispatches decoded messages to the
//! catalog and the request scheduler.
//!
//! Ordering contract: nothing is delivered to the catalog or scheduler
//! until both sides have exchanged cluster configurations. The peer
//! speaks first; our reply is derived from the store and carries the
//! stored index id and sequence high-water mark per folder.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bex_catalog::{CachedState, Store};
use bex_deviceid::DeviceId;
use bex_protocol::wire::Hello;
use bex_protocol::{BepCodec, Frame, Message, shape_index};
use bex_transport::{IDLE_TIMEOUT, PeerStream, TlsConnection};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use crate::cache::BlockCache;
use crate::scheduler::{Priority, RequestScheduler};
use crate::{Event, client_version};

/// Keepalive interval while connected.
const PING_INTERVAL: Duration = Duration::from_secs(90);

pub(crate) struct SessionContext {
    pub store: Arc<Store>,
    pub cache: BlockCache,
    pub scheduler: RequestScheduler,
    pub events: broadcast::Sender<Event>,
    pub connected: Arc<AtomicBool>,
    pub peer: DeviceId,
    pub device_name: String,
    pub refill_batch: usize,
}

/// Runs one connection to completion.
///
/// `ready` resolves once the cluster-config exchange finishes, or with
/// an error description if the session dies before that.
pub(crate) async fn run_session(
    connection: TlsConnection,
    ctx: SessionContext,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);
    let outcome = drive(connection, &ctx, &mut ready).await;

    ctx.connected.store(false, Ordering::SeqCst);
    ctx.scheduler.shutdown();

    match outcome {
        Ok(()) => {
            let _ = ctx.events.send(Event::Closed);
        }
        Err(message) => {
            error!(%message, "session failed");
            if let Some(ready) = ready.take() {
                let _ = ready.send(Err(message.clone()));
            }
            let _ = ctx.events.send(Event::Error(message));
            let _ = ctx.events.send(Event::Closed);
        }
    }
}

async fn drive(
    connection: TlsConnection,
    ctx: &SessionContext,
    ready: &mut Option<oneshot::Sender<Result<(), String>>>,
) -> Result<(), String> {
    let mut framed = Framed::new(connection.stream, BepCodec::new());

    framed
        .send(Frame::Hello(Hello {
            device_name: ctx.device_name.clone(),
            client_name: "bex".to_owned(),
            client_version: client_version().to_owned(),
        }))
        .await
        .map_err(|error| format!("sending hello: {error}"))?;

    match tokio::time::timeout(IDLE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(Frame::Hello(hello)))) => {
            info!(
                device = %hello.device_name,
                client = %hello.client_name,
                version = %hello.client_version,
                "peer hello received"
            );
        }
        Ok(Some(Ok(Frame::Message(_)))) => {
            return Err("peer sent a message before its hello".to_owned());
        }
        Ok(Some(Err(error))) => return Err(format!("reading hello: {error}")),
        Ok(None) => return Err("connection closed before hello".to_owned()),
        Err(_) => return Err("timed out waiting for hello".to_owned()),
    }

    let (request_tx, mut outbound) = mpsc::unbounded_channel();
    ctx.scheduler.attach(request_tx);

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // the first tick fires immediately

    let idle = tokio::time::sleep(IDLE_TIMEOUT);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            () = &mut idle => {
                return Err("connection idle timeout".to_owned());
            }
            frame = framed.next() => {
                idle.as_mut().reset(Instant::now() + IDLE_TIMEOUT);
                match frame {
                    None => {
                        info!("connection closed by peer");
                        return Ok(());
                    }
                    Some(Err(error)) => return Err(format!("framing error: {error}")),
                    Some(Ok(Frame::Hello(_))) => {
                        warn!("dropping unexpected second hello");
                    }
                    Some(Ok(Frame::Message(message))) => {
                        match dispatch(message, ctx, &mut framed, ready).await? {
                            Flow::Continue => {}
                            Flow::Close => return Ok(()),
                        }
                    }
                }
            }
            _ = ping.tick() => {
                trace!("sending keepalive ping");
                framed
                    .send(Frame::Message(Message::Ping(bex_protocol::wire::Ping {})))
                    .await
                    .map_err(|error| format!("sending ping: {error}"))?;
            }
            Some(request) = outbound.recv() => {
                framed
                    .send(Frame::Message(Message::Request(request)))
                    .await
                    .map_err(|error| format!("sending request: {error}"))?;
            }
        }
    }
}

enum Flow {
    Continue,
    Close,
}

async fn dispatch(
    message: Message,
    ctx: &SessionContext,
    framed: &mut Framed<PeerStream, BepCodec>,
    ready: &mut Option<oneshot::Sender<Result<(), String>>>,
) -> Result<Flow, String> {
    let connected = ctx.connected.load(Ordering::SeqCst);
    match message {
        Message::ClusterConfig(config) => {
            ctx.store
                .update_cluster_config(&config)
                .map_err(|error| format!("applying cluster config: {error}"))?;
            let ours = ctx
                .store
                .cluster_config_for(&ctx.peer)
                .map_err(|error| format!("building cluster config: {error}"))?;
            framed
                .send(Frame::Message(Message::ClusterConfig(ours)))
                .await
                .map_err(|error| format!("sending cluster config: {error}"))?;
            if !connected {
                ctx.connected.store(true, Ordering::SeqCst);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                let _ = ctx.events.send(Event::Connected);
                info!("cluster configuration exchanged");
            }
        }
        Message::Index(index) | Message::IndexUpdate(index) => {
            if !connected {
                warn!("dropping index received before cluster config exchange");
                return Ok(Flow::Continue);
            }
            let shaped = shape_index(index);
            let folder = shaped.folder.clone();
            match ctx.store.update_index(&shaped) {
                Ok(true) => {
                    debug!(%folder, "index applied with material changes");
                    let _ = ctx.events.send(Event::Updated);
                    maintain(ctx).await;
                }
                Ok(false) => debug!(%folder, "index applied"),
                Err(error) => warn!(%folder, %error, "index application failed"),
            }
        }
        Message::Response(response) => {
            if !connected {
                warn!("dropping response received before cluster config exchange");
                return Ok(Flow::Continue);
            }
            if response.code != 0 {
                ctx.scheduler.refused(response.id, response.code);
            } else if let Some(request) = ctx.scheduler.received(response.id, &response.data) {
                if let Err(error) = ctx
                    .cache
                    .write_block(&request.folder, request.file_id, request.offset, &response.data)
                    .await
                {
                    warn!(%error, name = %request.name, "cache write failed");
                } else if let Err(error) =
                    ctx.store
                        .mark_block(request.file_id, request.offset, CachedState::Present)
                {
                    warn!(%error, name = %request.name, "marking block cached failed");
                }
            }
        }
        Message::Request(request) => {
            warn!(name = %request.name, "ignoring inbound block request; this client never serves data");
        }
        Message::DownloadProgress(_) => trace!("ignoring download progress"),
        Message::Ping(_) => trace!("keepalive received"),
        Message::Close(close) => {
            info!(reason = %close.reason, "peer closed the connection");
            return Ok(Flow::Close);
        }
    }
    Ok(Flow::Continue)
}

/// Post-update maintenance: prune stale cached blocks and refill
/// uncached blocks of fully-synced files at background priority.
async fn maintain(ctx: &SessionContext) {
    match ctx.store.stale_blocks() {
        Ok(stale) => {
            for block in stale {
                if let Err(error) = ctx
                    .cache
                    .remove_block(&block.folder, block.file_id, block.offset)
                    .await
                {
                    warn!(%error, "stale block removal failed");
                    continue;
                }
                if let Err(error) = ctx.store.resolve_stale(&block) {
                    warn!(%error, "stale block resolution failed");
                }
            }
        }
        Err(error) => warn!(%error, "stale block query failed"),
    }

    match ctx.store.refill_candidates(ctx.refill_batch) {
        Ok(candidates) => {
            for request in candidates {
                ctx.scheduler.add(request, Priority::Background);
            }
        }
        Err(error) => warn!(%error, "refill query failed"),
    }
}
