use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use enclose::enc;
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SignalingConfig,
    error::{Error, RoomErrorKind, SignalingErrorKind},
    protocol::{
        CallMode, ClientEnvelope, ClientMessage, ErrorCategory, Identity, MediaState,
        RtpCapabilities, ServerMessage, SfuResponse,
    },
};

pub mod websocket;

/// One live connection to the signaling service, as a pair of text frame queues.
#[derive(Debug)]
pub struct SignalingLink {
    pub sender: mpsc::UnboundedSender<String>,
    pub receiver: mpsc::UnboundedReceiver<String>,
}

/// Opens links to the signaling service. Called again for every reconnect.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<SignalingLink, Error>;
}

#[derive(Debug, Clone)]
pub enum SignalEvent {
    Message(ServerMessage),
    Disconnected,
    /// The link is back and the last join has been replayed.
    Reconnected,
}

/// The last room this client asked to join. Replayed after every reconnect.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub room_id: String,
    pub identity: Identity,
    pub mode: CallMode,
    pub media: MediaState,
    pub create: bool,
    pub rtp_capabilities: Option<RtpCapabilities>,
}

impl JoinRequest {
    fn to_message(&self) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: self.room_id.clone(),
            identity: self.identity.clone(),
            mode: self.mode,
            media: self.media,
            create: self.create,
            rtp_capabilities: self.rtp_capabilities.clone(),
        }
    }
}

type PendingRequests = HashMap<u64, oneshot::Sender<Result<SfuResponse, Error>>>;

enum PumpOutcome {
    Closed(Option<ClientEnvelope>),
    Cancelled,
}

struct Inner {
    outbox: mpsc::UnboundedSender<ClientEnvelope>,
    events: broadcast::Sender<SignalEvent>,
    pending: Mutex<PendingRequests>,
    last_join: Mutex<Option<JoinRequest>>,
    next_request_id: AtomicU64,
    config: SignalingConfig,
    cancel: CancellationToken,
}

/// Typed client of the signaling channel.
///
/// A single supervisor task owns the live link. Outgoing messages are queued in order, so
/// anything emitted while the link is down is flushed after the join has been replayed.
#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<Inner>,
}

impl SignalingClient {
    pub async fn connect(
        connector: Arc<dyn SignalingConnector>,
        config: SignalingConfig,
    ) -> Result<Self, Error> {
        let link = connector.connect().await?;
        let (outbox, outbox_receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);

        let inner = Arc::new(Inner {
            outbox,
            events,
            pending: Mutex::new(HashMap::new()),
            last_join: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
            config,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(enc!((inner) async move {
            Self::supervise(inner, connector, link, outbox_receiver).await;
        }));

        tracing::debug!("SignalingClient is connected");

        Ok(Self { inner })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.inner.events.subscribe()
    }

    pub fn emit(&self, message: ClientMessage) -> Result<(), Error> {
        tracing::trace!("emit {}", message.action());
        self.inner
            .outbox
            .send(ClientEnvelope {
                request_id: None,
                message,
            })
            .map_err(|_| {
                Error::new_signaling(
                    "signaling client is closed".to_string(),
                    SignalingErrorKind::DisconnectedError,
                )
            })
    }

    /// Sends a message and waits for its acknowledgment.
    pub async fn request(&self, message: ClientMessage) -> Result<SfuResponse, Error> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let action = message.action();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(request_id, tx);

        let sent = self.inner.outbox.send(ClientEnvelope {
            request_id: Some(request_id),
            message,
        });
        if sent.is_err() {
            self.inner.pending.lock().await.remove(&request_id);
            return Err(Error::new_signaling(
                "signaling client is closed".to_string(),
                SignalingErrorKind::DisconnectedError,
            ));
        }

        match timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::new_signaling(
                format!("{} request {} was dropped", action, request_id),
                SignalingErrorKind::DisconnectedError,
            )),
            Err(_) => {
                self.inner.pending.lock().await.remove(&request_id);
                Err(Error::new_signaling(
                    format!("{} request {} timed out", action, request_id),
                    SignalingErrorKind::TimeoutError,
                ))
            }
        }
    }

    pub async fn join_room(&self, join: JoinRequest) -> Result<(), Error> {
        let message = join.to_message();
        *self.inner.last_join.lock().await = Some(join);
        self.emit(message)
    }

    /// Joins with an acknowledgment, used by the SFU path to receive transport parameters.
    pub async fn join_room_request(&self, join: JoinRequest) -> Result<SfuResponse, Error> {
        let message = join.to_message();
        *self.inner.last_join.lock().await = Some(join);
        self.request(message).await
    }

    pub async fn leave_room(&self) -> Result<(), Error> {
        let join = self.inner.last_join.lock().await.take();
        match join {
            Some(join) => self.emit(ClientMessage::LeaveRoom {
                room_id: join.room_id,
            }),
            None => Ok(()),
        }
    }

    pub async fn current_join(&self) -> Option<JoinRequest> {
        self.inner.last_join.lock().await.clone()
    }

    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    async fn supervise(
        inner: Arc<Inner>,
        connector: Arc<dyn SignalingConnector>,
        mut link: SignalingLink,
        mut outbox: mpsc::UnboundedReceiver<ClientEnvelope>,
    ) {
        let mut backlog: VecDeque<ClientEnvelope> = VecDeque::new();

        loop {
            match Self::pump(&inner, &mut link, &mut outbox, &mut backlog).await {
                PumpOutcome::Cancelled => break,
                PumpOutcome::Closed(unsent) => {
                    // Requests that were never written cannot be answered any more.
                    if let Some(envelope) = unsent.filter(|e| e.request_id.is_none()) {
                        backlog.push_front(envelope);
                    }
                }
            }

            Self::fail_pending(&inner).await;
            let _ = inner.events.send(SignalEvent::Disconnected);
            tracing::warn!("signaling link lost, reconnecting");

            match Self::reconnect(&inner, connector.as_ref()).await {
                Some(new_link) => {
                    link = new_link;
                    let join = inner.last_join.lock().await.clone();
                    if let Some(join) = join {
                        tracing::info!("replaying join-room for {}", join.room_id);
                        backlog.retain(|e| !matches!(e.message, ClientMessage::JoinRoom { .. }));
                        backlog.push_front(ClientEnvelope {
                            request_id: None,
                            message: join.to_message(),
                        });
                    }
                    let _ = inner.events.send(SignalEvent::Reconnected);
                }
                None => break,
            }
        }

        Self::fail_pending(&inner).await;
        tracing::info!("SignalingClient supervisor finished");
    }

    async fn pump(
        inner: &Arc<Inner>,
        link: &mut SignalingLink,
        outbox: &mut mpsc::UnboundedReceiver<ClientEnvelope>,
        backlog: &mut VecDeque<ClientEnvelope>,
    ) -> PumpOutcome {
        while let Some(envelope) = backlog.pop_front() {
            if let Err(unsent) = Self::write(link, envelope) {
                return PumpOutcome::Closed(Some(unsent));
            }
        }

        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => {
                    return PumpOutcome::Cancelled;
                }
                envelope = outbox.recv() => {
                    match envelope {
                        Some(envelope) => {
                            if let Err(unsent) = Self::write(link, envelope) {
                                return PumpOutcome::Closed(Some(unsent));
                            }
                        }
                        None => return PumpOutcome::Cancelled,
                    }
                }
                text = link.receiver.recv() => {
                    match text {
                        Some(text) => Self::dispatch(inner, text).await,
                        None => return PumpOutcome::Closed(None),
                    }
                }
            }
        }
    }

    fn write(link: &SignalingLink, envelope: ClientEnvelope) -> Result<(), ClientEnvelope> {
        match serde_json::to_string(&envelope) {
            Ok(text) => link.sender.send(text).map_err(|_| envelope),
            Err(err) => {
                tracing::error!(
                    "failed to serialize {}: {}",
                    envelope.message.action(),
                    err
                );
                Ok(())
            }
        }
    }

    async fn dispatch(inner: &Arc<Inner>, text: String) {
        let message = match serde_json::from_str::<ServerMessage>(&text) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!("failed to parse server message: {}\n{}", err, text);
                return;
            }
        };

        match message {
            ServerMessage::Response {
                request_id,
                payload,
            } => {
                Self::resolve(inner, request_id, Ok(payload)).await;
            }
            ServerMessage::Failure {
                request_id,
                category,
                message,
            } => {
                let err = match category {
                    ErrorCategory::RoomNotFound => {
                        Error::new_room(message, RoomErrorKind::NotFoundError)
                    }
                    ErrorCategory::Room => Error::new_room(message, RoomErrorKind::RejectedError),
                    ErrorCategory::ResourceNotFound => {
                        Error::new_signaling(message, SignalingErrorKind::ResourceNotFoundError)
                    }
                    _ => Error::new_signaling(
                        format!("{}: {}", category, message),
                        SignalingErrorKind::RejectedError,
                    ),
                };
                Self::resolve(inner, request_id, Err(err)).await;
            }
            ServerMessage::Pong => {
                tracing::trace!("pong received");
            }
            message => {
                let _ = inner.events.send(SignalEvent::Message(message));
            }
        }
    }

    async fn resolve(inner: &Arc<Inner>, request_id: u64, result: Result<SfuResponse, Error>) {
        match inner.pending.lock().await.remove(&request_id) {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => {
                tracing::debug!("response for unknown request {}", request_id);
            }
        }
    }

    async fn fail_pending(inner: &Arc<Inner>) {
        let pending: Vec<_> = inner.pending.lock().await.drain().collect();
        for (request_id, sender) in pending {
            let _ = sender.send(Err(Error::new_signaling(
                format!("request {} lost with the signaling link", request_id),
                SignalingErrorKind::DisconnectedError,
            )));
        }
    }

    async fn reconnect(inner: &Arc<Inner>, connector: &dyn SignalingConnector) -> Option<SignalingLink> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if let Some(limit) = inner.config.reconnect_attempts {
                if attempt > limit {
                    tracing::error!("signaling reconnect gave up after {} attempts", limit);
                    return None;
                }
            }

            tokio::select! {
                _ = inner.cancel.cancelled() => return None,
                _ = sleep(inner.config.reconnect_delay) => {}
            }

            match connector.connect().await {
                Ok(link) => {
                    tracing::info!("signaling reconnected after {} attempts", attempt);
                    return Some(link);
                }
                Err(err) => {
                    tracing::warn!("signaling reconnect attempt {} failed: {}", attempt, err);
                }
            }
        }
    }
}
