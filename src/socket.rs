use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use crate::socketio::{
    self, EnginePacket, JOIN_ORDER_EVENT, SEND_LOCATION_EVENT, SocketPacket,
};
use crate::types::{LocationUpdate, OrderId};

/// Emits issued before the namespace handshake completes are buffered up to this bound.
pub const MAX_BUFFERED_EMITS: usize = 1_024;
const CLOSE_GRACE_MS: u64 = 1_000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SocketEvent {
    Connected,
    Disconnected { reason: String },
    ConnectError { reason: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Handshaking,
    Connected,
    Down,
}

/// Handle to the single persistent Socket.IO connection of a run.
///
/// Reconnection is disabled: once the connection drops it stays down and later
/// emits are discarded.
pub struct SocketSession {
    emits: mpsc::UnboundedSender<LocationUpdate>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SocketSession {
    #[must_use]
    pub fn spawn(url: Url, order_id: OrderId, connect_timeout: Duration) -> Self {
        let (emit_tx, emit_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = SessionTask {
            order_id,
            emits: emit_rx,
            events: event_tx,
            shutdown: shutdown_rx,
            phase: Phase::Handshaking,
            buffered: Vec::new(),
        };
        let handle = tokio::spawn(task.run(url, connect_timeout));

        Self {
            emits: emit_tx,
            events: event_rx,
            shutdown: shutdown_tx,
            handle,
        }
    }

    /// Queues a fire-and-forget `sendLocation` emit.
    pub fn emit(&self, update: LocationUpdate) {
        let _ = self.emits.send(update);
    }

    /// Waits for the next lifecycle event. Pends forever once the task has exited.
    pub async fn next_event(&mut self) -> SocketEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    /// Signals shutdown, waits briefly for the task to close the connection, and
    /// returns any lifecycle events still queued.
    pub async fn close(mut self) -> Vec<SocketEvent> {
        let _ = self.shutdown.send(true);
        let grace = Duration::from_millis(CLOSE_GRACE_MS);
        if time::timeout(grace, &mut self.handle).await.is_err() {
            self.handle.abort();
        }

        let mut remaining = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            remaining.push(event);
        }
        remaining
    }
}

struct SessionTask {
    order_id: OrderId,
    emits: mpsc::UnboundedReceiver<LocationUpdate>,
    events: mpsc::UnboundedSender<SocketEvent>,
    shutdown: watch::Receiver<bool>,
    phase: Phase,
    buffered: Vec<LocationUpdate>,
}

impl SessionTask {
    async fn run(mut self, url: Url, connect_timeout: Duration) {
        let connect = time::timeout(connect_timeout, connect_async(url.as_str()));
        let stream = select! {
            changed = self.shutdown.changed() => {
                if changed.is_err() || *self.shutdown.borrow() {
                    return;
                }
                None
            }
            connected = connect => match connected {
                Ok(Ok((stream, _))) => Some(stream),
                Ok(Err(error)) => {
                    self.lost(error.to_string());
                    None
                }
                Err(_) => {
                    self.lost(format!("connect timed out after {}ms", connect_timeout.as_millis()));
                    None
                }
            },
        };

        if let Some(stream) = stream {
            debug!(url = %url, "websocket transport open");
            self.drive(stream).await;
        }
        self.idle_until_shutdown().await;
    }

    async fn drive(&mut self, stream: WsStream) {
        let (mut sink, mut source) = stream.split();

        while self.phase != Phase::Down {
            select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        if self.phase == Phase::Connected {
                            let _ = sink.send(Message::text(socketio::encode_disconnect())).await;
                        }
                        let _ = sink.close().await;
                        return;
                    }
                }
                update = self.emits.recv() => {
                    let Some(update) = update else {
                        let _ = sink.close().await;
                        return;
                    };
                    match self.phase {
                        Phase::Connected => {
                            if let Err(reason) = send_location(&mut sink, update).await {
                                self.lost(reason);
                            }
                        }
                        Phase::Handshaking => {
                            if self.buffered.len() < MAX_BUFFERED_EMITS {
                                self.buffered.push(update);
                            }
                        }
                        Phase::Down => {}
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(reason) = self.on_text(&mut sink, text.as_str()).await {
                            self.lost(reason);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "server closed the connection".to_owned(),
                            |frame| format!("server closed the connection: {}", frame.reason.as_str()),
                        );
                        self.lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => self.lost(error.to_string()),
                    None => self.lost("transport stream ended".to_owned()),
                },
            }
        }
    }

    async fn on_text<S>(&mut self, sink: &mut S, text: &str) -> Result<(), String>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        let packet = match socketio::decode(text) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(%error, frame = text, "ignoring undecodable socket.io frame");
                return Ok(());
            }
        };

        match packet {
            EnginePacket::Open(_) => send_text(sink, socketio::encode_connect()).await,
            EnginePacket::Ping => send_text(sink, socketio::encode_pong()).await,
            EnginePacket::Close => Err("engine.io close packet".to_owned()),
            EnginePacket::Message(SocketPacket::Connect(_)) => self.on_connected(sink).await,
            EnginePacket::Message(SocketPacket::ConnectError(detail)) => {
                self.refused(&detail);
                Ok(())
            }
            EnginePacket::Message(SocketPacket::Disconnect) => {
                Err("server disconnected the namespace".to_owned())
            }
            EnginePacket::Message(SocketPacket::Event { name, .. }) => {
                debug!(event = %name, "ignoring inbound socket event");
                Ok(())
            }
            EnginePacket::Message(SocketPacket::Ack { .. })
            | EnginePacket::Pong
            | EnginePacket::Upgrade
            | EnginePacket::Noop => Ok(()),
        }
    }

    async fn on_connected<S>(&mut self, sink: &mut S) -> Result<(), String>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        if self.phase != Phase::Handshaking {
            return Ok(());
        }

        let join = socketio::encode_event(
            JOIN_ORDER_EVENT,
            &[Value::String(self.order_id.as_str().to_owned())],
        )
        .map_err(|error| error.to_string())?;
        send_text(sink, join).await?;

        self.phase = Phase::Connected;
        info!(order_id = %self.order_id, "socket connected and joined order room");
        let _ = self.events.send(SocketEvent::Connected);

        for update in std::mem::take(&mut self.buffered) {
            send_location(sink, update).await?;
        }
        Ok(())
    }

    fn refused(&mut self, detail: &Value) {
        let reason = format!("connect_error: {detail}");
        warn!(%reason, "socket namespace connect refused");
        self.phase = Phase::Down;
        let _ = self.events.send(SocketEvent::ConnectError { reason });
    }

    fn lost(&mut self, reason: String) {
        let event = match self.phase {
            Phase::Connected => {
                warn!(%reason, "socket disconnected; reconnection disabled");
                SocketEvent::Disconnected { reason }
            }
            Phase::Handshaking => {
                warn!(%reason, "socket connect error");
                SocketEvent::ConnectError { reason }
            }
            Phase::Down => return,
        };
        self.phase = Phase::Down;
        self.buffered.clear();
        let _ = self.events.send(event);
    }

    async fn idle_until_shutdown(&mut self) {
        if *self.shutdown.borrow() {
            return;
        }
        loop {
            select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return;
                    }
                }
                update = self.emits.recv() => {
                    if update.is_none() {
                        return;
                    }
                }
            }
        }
    }
}

async fn send_location<S>(sink: &mut S, update: LocationUpdate) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let payload = serde_json::to_value(&update).map_err(|error| error.to_string())?;
    let frame = socketio::encode_event(SEND_LOCATION_EVENT, &[payload])
        .map_err(|error| error.to_string())?;
    send_text(sink, frame).await
}

async fn send_text<S>(sink: &mut S, frame: String) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(Message::text(frame))
        .await
        .map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use futures_util::{SinkExt, Stream, StreamExt};
    use tokio::net::TcpListener;
    use tokio::time::{self, Duration, Instant};
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;
    use url::Url;

    use super::{CLOSE_GRACE_MS, SocketEvent, SocketSession};
    use crate::types::{Location, LocationUpdate, OrderId};

    async fn next_text<S>(source: &mut S) -> Option<String>
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        while let Some(Ok(message)) = source.next().await {
            if let Message::Text(text) = message {
                return Some(text.as_str().to_owned());
            }
        }
        None
    }

    #[tokio::test]
    async fn connect_failure_reports_connect_error() -> Result<(), Box<dyn Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}/socket.io/?EIO=4&transport=websocket"))?;
        let mut session = SocketSession::spawn(url, OrderId::from("o1"), Duration::from_secs(2));

        let event = time::timeout(Duration::from_secs(5), session.next_event()).await?;
        assert!(matches!(event, SocketEvent::ConnectError { .. }));
        session.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn joins_room_flushes_buffer_and_reports_drop() -> Result<(), Box<dyn Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let mut frames = Vec::new();
            let Ok((stream, _)) = listener.accept().await else {
                return frames;
            };
            let Ok(ws) = accept_async(stream).await else {
                return frames;
            };
            let (mut sink, mut source) = ws.split();
            let _ = sink
                .send(Message::text(r#"0{"sid":"s1","pingInterval":25000,"pingTimeout":20000}"#))
                .await;
            if let Some(connect) = next_text(&mut source).await {
                frames.push(connect);
            }
            let _ = sink.send(Message::text(r#"40{"sid":"n1"}"#)).await;
            for _ in 0..2 {
                if let Some(frame) = next_text(&mut source).await {
                    frames.push(frame);
                }
            }
            let _ = sink.send(Message::text("41")).await;
            frames
        });

        let url = Url::parse(&format!("ws://{addr}/socket.io/?EIO=4&transport=websocket"))?;
        let mut session = SocketSession::spawn(url, OrderId::from("o1"), Duration::from_secs(2));
        session.emit(LocationUpdate::new(OrderId::from("o1"), Location::new(1.0, 2.0)));

        let first = time::timeout(Duration::from_secs(5), session.next_event()).await?;
        assert_eq!(first, SocketEvent::Connected);
        let second = time::timeout(Duration::from_secs(5), session.next_event()).await?;
        assert!(matches!(second, SocketEvent::Disconnected { .. }));

        let frames = server.await?;
        assert_eq!(frames.first().map(String::as_str), Some("40"));
        assert_eq!(frames.get(1).map(String::as_str), Some(r#"42["joinOrder","o1"]"#));
        assert!(frames.get(2).is_some_and(|frame| frame.starts_with(r#"42["sendLocation""#)));

        assert!(session.close().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn close_after_connect_does_not_wait_out_grace() -> Result<(), Box<dyn Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(ws) = accept_async(stream).await else {
                return;
            };
            let (mut sink, mut source) = ws.split();
            let _ = sink
                .send(Message::text(r#"0{"sid":"s2","pingInterval":25000,"pingTimeout":20000}"#))
                .await;
            if next_text(&mut source).await.as_deref() == Some("40") {
                let _ = sink.send(Message::text(r#"40{"sid":"n2"}"#)).await;
            }
            while next_text(&mut source).await.is_some() {}
        });

        let url = Url::parse(&format!("ws://{addr}/socket.io/?EIO=4&transport=websocket"))?;
        let mut session = SocketSession::spawn(url, OrderId::from("o2"), Duration::from_secs(2));
        let event = time::timeout(Duration::from_secs(5), session.next_event()).await?;
        assert_eq!(event, SocketEvent::Connected);

        let started = Instant::now();
        let remaining = session.close().await;
        let took = started.elapsed();

        assert!(remaining.is_empty());
        assert!(
            took < Duration::from_millis(CLOSE_GRACE_MS / 2),
            "close took {took:?}"
        );
        Ok(())
    }
}
