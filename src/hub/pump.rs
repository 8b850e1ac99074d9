use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::errors::{AppError, AppResult};
use crate::hub::messages::{ClientRequest, INVALID_REQUEST, PONG};
use crate::hub::{
    CloseReason, ConnectionControl, ConnectionHub, HubConfig, PairFilter, Registration,
    SubscribeOutcome,
};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Drives one subscriber socket: drains its outbound queue, keeps it alive
/// with pings and answers its control messages.
pub struct ConnectionPump {
    hub: Arc<ConnectionHub>,
    registration: Registration,
}

impl ConnectionPump {
    pub fn new(hub: Arc<ConnectionHub>, registration: Registration) -> Self {
        Self { hub, registration }
    }

    /// Registers a fresh socket with the hub and pumps it until it closes.
    pub async fn serve(hub: Arc<ConnectionHub>, mut socket: WebSocket) {
        match hub.register(PairFilter::All) {
            Ok(registration) => ConnectionPump::new(hub, registration).run(socket).await,
            Err(e) => {
                debug!(error = %e, "rejecting connection");
                let frame = CloseReason::Shutdown.close_frame();
                if let Err(e) = socket.send(Message::Close(frame)).await {
                    debug!(error = %e, "failed to send close frame");
                }
            }
        }
    }

    #[instrument(skip_all, fields(conn = %self.registration.control.id()))]
    pub async fn run(self, socket: WebSocket) {
        let Registration {
            control,
            outbound,
            replies,
        } = self.registration;
        let config = self.hub.config().clone();
        let (sink, stream) = socket.split();
        info!("subscriber connected");

        let mut writer = tokio::spawn(write_loop(
            sink,
            outbound,
            Arc::clone(&control),
            config.clone(),
        ));
        let mut reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&self.hub),
            Arc::clone(&control),
            replies,
        ));

        tokio::select! {
            _ = &mut writer => reader.abort(),
            _ = &mut reader => {
                // give the writer a chance to finish the close handshake
                let flush = config.write_timeout + Duration::from_millis(100);
                if tokio::time::timeout(flush, &mut writer).await.is_err() {
                    writer.abort();
                }
            }
        }

        self.hub.unregister(control.id());
        let reason = control
            .close_reason()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".into());
        info!(reason = %reason, "subscriber disconnected");
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Arc<str>>,
    control: Arc<ConnectionControl>,
    config: HubConfig,
) {
    let keepalive = config.keepalive_timeout();
    let mut ping = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let pong_deadline = control.last_pong() + keepalive;
        let sent = tokio::select! {
            biased;
            _ = control.terminated() => return,
            _ = control.closing() => break,
            _ = tokio::time::sleep_until(pong_deadline) => {
                warn!(?keepalive, "no pong received in time");
                control.request_close(CloseReason::KeepaliveTimeout);
                break;
            }
            next = outbound.recv() => match next {
                Some(text) => send(&mut sink, Message::Text(text.to_string()), config.write_timeout).await,
                None => break,
            },
            _ = ping.tick() => send(&mut sink, Message::Ping(Vec::new()), config.write_timeout).await,
        };

        if let Err(e) = sent {
            debug!(error = %e, "socket write failed");
            control.request_close(CloseReason::WriteFailed);
            return;
        }
    }

    if let Some(frame) = control.close_reason().and_then(CloseReason::close_frame) {
        let closing = send(&mut sink, Message::Close(Some(frame)), config.write_timeout);
        tokio::select! {
            _ = control.terminated() => return,
            result = closing => if let Err(e) = result {
                debug!(error = %e, "failed to send close frame");
            },
        }
    }
    let _ = tokio::time::timeout(config.write_timeout, sink.close()).await;
}

async fn read_loop(
    mut stream: WsStream,
    hub: Arc<ConnectionHub>,
    control: Arc<ConnectionControl>,
    replies: mpsc::Sender<Arc<str>>,
) {
    let pong: Arc<str> = Arc::from(PONG);
    let invalid: Arc<str> = Arc::from(INVALID_REQUEST);

    loop {
        let frame = tokio::select! {
            _ = control.closing() => return,
            frame = stream.next() => frame,
        };

        let payload = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    if replies.send(Arc::clone(&invalid)).await.is_err() {
                        return;
                    }
                    continue;
                }
            },
            Some(Ok(Message::Pong(_))) => {
                control.record_pong();
                continue;
            }
            Some(Ok(Message::Ping(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                control.request_close(CloseReason::PeerClosed);
                return;
            }
            Some(Err(e)) => {
                debug!(error = %e, "socket read failed");
                control.request_close(CloseReason::ReadFailed);
                return;
            }
        };

        let reply = match ClientRequest::parse(&payload) {
            ClientRequest::Ping => Some(Arc::clone(&pong)),
            ClientRequest::Pong => {
                control.record_pong();
                None
            }
            ClientRequest::Subscribe(pairs) => match hub.resubscribe(control.id(), pairs) {
                SubscribeOutcome::Applied => None,
                SubscribeOutcome::UnknownPairs(unknown) => {
                    debug!(?unknown, "subscription to unknown pairs rejected");
                    Some(Arc::clone(&invalid))
                }
                SubscribeOutcome::NotRegistered => return,
            },
            ClientRequest::Invalid => Some(Arc::clone(&invalid)),
        };

        if let Some(reply) = reply {
            // only ever waits on this connection's own queue
            if replies.send(reply).await.is_err() {
                return;
            }
        }
    }
}

async fn send(sink: &mut WsSink, message: Message, timeout: Duration) -> AppResult<()> {
    tokio::time::timeout(timeout, sink.send(message))
        .await
        .map_err(|_| AppError::Timeout(timeout))?
        .map_err(|e| AppError::Server(e.to_string()))
}
