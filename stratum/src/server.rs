//! Stratum Server
//!
//! Listens for TCP or TLS miner connections, frames and validates
//! their requests, and dispatches the protocol: subscription with
//! version and address checks, submission routing into the share
//! validator, status reports, and the broadcast fan-out that pushes
//! new work to every live subscriber. A single session type works
//! over any byte stream; TLS is just a different stream fed into it.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;

use lodepool_consensus::Target;
use lodepool_core::GRAFFITI_LEN;
use lodepool_database::ShareStore;

use crate::codec::MessageBuffer;
use crate::distributor::{WorkBroadcast, WorkDistributor};
use crate::messages::{
    self, ClientMessage, DisconnectBody, GetStatusBody, NotifyBody, RequestEnvelope,
    SetTargetBody, StatusBody, StratumMethod, SubmitBody, SubmittedBody, SubscribeBody,
    SubscribedBody,
};
use crate::peers::{PeerPolicy, PolicyAction, SCORE_DRAIN_INTERVAL};
use crate::validator::{SubmissionOutcome, SubmissionProcessor};
use crate::{PoolConfig, StratumError};

/// Protocol version this server speaks
pub const CURRENT_VERSION: u32 = 3;

/// Oldest protocol version still served
pub const MIN_VERSION: u32 = 2;

/// Outbound lines queued per session before it counts as stalled
const SESSION_SEND_BUFFER: usize = 256;

/// Socket read chunk size
const READ_CHUNK: usize = 4096;

/// Randomness values remembered per session within one work unit
const RECENT_SUBMISSIONS_LIMIT: usize = 4096;

enum Flow {
    Continue,
    Close,
}

#[derive(Debug)]
struct SessionState {
    subscribed: bool,
    version: Option<u32>,
    name: Option<String>,
    public_address: Option<String>,
    graffiti: Option<String>,
    recent_submissions: (u32, HashSet<String>),
}

/// One connected miner session
#[derive(Debug)]
pub struct ClientSession {
    id: u64,
    remote_addr: SocketAddr,
    xn: String,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    closed: AtomicBool,
    close_notify: Notify,
    state: Mutex<SessionState>,
}

impl ClientSession {
    pub fn new(id: u64, remote_addr: SocketAddr, tx: mpsc::Sender<String>) -> Self {
        ClientSession {
            id,
            remote_addr,
            xn: format!("{:08x}", rand::random::<u32>()),
            tx,
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            state: Mutex::new(SessionState {
                subscribed: false,
                version: None,
                name: None,
                public_address: None,
                graffiti: None,
                recent_submissions: (0, HashSet::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Per-client extranonce reported at subscription
    pub fn xn(&self) -> String {
        self.xn.clone()
    }

    /// Record a successful subscription
    pub fn subscribe(
        &self,
        version: u32,
        public_address: String,
        name: Option<String>,
        graffiti: String,
    ) {
        let mut state = self.state.lock().unwrap();
        state.subscribed = true;
        state.version = Some(version);
        state.name = name;
        state.public_address = Some(public_address);
        state.graffiti = Some(graffiti);
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().unwrap().subscribed
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Protocol version negotiated at subscription
    pub fn version(&self) -> Option<u32> {
        self.state.lock().unwrap().version
    }

    /// Worker name advertised at subscription
    pub fn name(&self) -> Option<String> {
        self.state.lock().unwrap().name.clone()
    }

    pub fn graffiti(&self) -> Option<String> {
        self.state.lock().unwrap().graffiti.clone()
    }

    pub fn public_address(&self) -> Option<String> {
        self.state.lock().unwrap().public_address.clone()
    }

    /// Remember a randomness value for the given work unit. Returns
    /// false for a repeat. The window resets whenever the work unit
    /// changes and is bounded against flooding.
    pub fn register_submission(&self, mining_request_id: u32, randomness: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.recent_submissions.0 != mining_request_id {
            state.recent_submissions = (mining_request_id, HashSet::new());
        }
        if state.recent_submissions.1.len() >= RECENT_SUBMISSIONS_LIMIT {
            return false;
        }
        state.recent_submissions.1.insert(randomness.to_lowercase())
    }

    /// Queue a line for the writer task, waiting for buffer space
    pub async fn send_line(&self, line: String) -> bool {
        self.tx.send(line).await.is_ok()
    }

    /// Queue a line without waiting; false means the session is stalled
    pub fn try_send_line(&self, line: String) -> bool {
        self.tx.try_send(line).is_ok()
    }

    /// Ask the writer task to flush what it has and shut the socket
    pub fn close(&self) {
        self.mark_disconnected();
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }

    /// Resolves once `close` has been called
    async fn wait_closed(&self) {
        let notified = self.close_notify.notified();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}

/// The stratum listener and session registry
pub struct StratumServer {
    config: PoolConfig,
    policy: Arc<PeerPolicy>,
    distributor: Arc<WorkDistributor>,
    processor: Arc<SubmissionProcessor>,
    store: Arc<ShareStore>,
    pool_target: Target,
    clients: Mutex<HashMap<u64, Arc<ClientSession>>>,
    next_client_id: AtomicU64,
    next_message_id: AtomicU32,
}

impl StratumServer {
    /// Build the server. Fails when the configured pool name cannot
    /// leave room for a client id inside the 32-byte graffiti window.
    pub fn new(
        config: PoolConfig,
        policy: Arc<PeerPolicy>,
        distributor: Arc<WorkDistributor>,
        processor: Arc<SubmissionProcessor>,
        store: Arc<ShareStore>,
    ) -> Result<Arc<Self>, StratumError> {
        // pool name + '.' + up to 16 hex digits of client id
        let worst_case = config.pool_name.as_bytes().len() + 1 + 16;
        if worst_case > GRAFFITI_LEN {
            return Err(StratumError::InvalidGraffiti(format!(
                "pool name '{}' leaves no room for client ids in the graffiti",
                config.pool_name
            )));
        }

        let pool_target = config.pool_target();
        Ok(Arc::new(StratumServer {
            config,
            policy,
            distributor,
            processor,
            store,
            pool_target,
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(0),
            next_message_id: AtomicU32::new(0),
        }))
    }

    /// Accept connections until the stop signal flips
    pub async fn start(
        self: Arc<Self>,
        broadcast_rx: mpsc::UnboundedReceiver<WorkBroadcast>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), StratumError> {
        let listener =
            TcpListener::bind((self.config.pool_host.as_str(), self.config.pool_port)).await?;
        let tls = self.build_tls_acceptor()?;
        info!(
            "Stratum server listening on {}:{}{}",
            self.config.pool_host,
            self.config.pool_port,
            if tls.is_some() { " (TLS)" } else { "" }
        );

        tokio::spawn(self.clone().run_broadcast(broadcast_rx, stop.clone()));
        tokio::spawn(self.clone().run_score_drain(stop.clone()));

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => self.handle_connection(socket, addr, tls.clone()),
                    Err(e) => error!("Error accepting connection: {}", e),
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Stop accepting and close every live session
    fn shutdown(&self) {
        info!("Stopping stratum server");
        let sessions: Vec<Arc<ClientSession>> = {
            let mut clients = self.clients.lock().unwrap();
            clients.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.close();
        }
    }

    fn build_tls_acceptor(&self) -> Result<Option<TlsAcceptor>, StratumError> {
        let (cert_path, key_path) = match (&self.config.tls_cert_path, &self.config.tls_key_path)
        {
            (Some(cert), Some(key)) => (cert, key),
            (None, None) => return Ok(None),
            _ => {
                return Err(StratumError::Tls(
                    "tlsCertPath and tlsKeyPath must be configured together".to_string(),
                ))
            }
        };

        let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
            cert_path,
        )?))?
        .into_iter()
        .map(Certificate)
        .collect::<Vec<_>>();

        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut std::io::BufReader::new(
            std::fs::File::open(key_path)?,
        ))?;
        if keys.is_empty() {
            return Err(StratumError::Tls(format!(
                "no PKCS#8 private key found in {}",
                key_path.display()
            )));
        }

        let tls_config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, PrivateKey(keys.remove(0)))
            .map_err(|e| StratumError::Tls(e.to_string()))?;

        Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
    }

    fn handle_connection(
        self: &Arc<Self>,
        socket: TcpStream,
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
    ) {
        if !self.policy.is_allowed(addr.ip(), lodepool_util::now_ms()) {
            debug!("Rejecting connection from {}", addr);
            return;
        }

        self.policy.connection_opened(addr.ip());
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SESSION_SEND_BUFFER);
        let session = Arc::new(ClientSession::new(id, addr, tx));
        self.clients.lock().unwrap().insert(id, session.clone());
        info!("Client {} connected from {}", id, addr);

        let server = self.clone();
        match tls {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(socket).await {
                        Ok(stream) => server.run_session(session, stream, rx).await,
                        Err(e) => {
                            warn!("TLS handshake with {} failed: {}", addr, e);
                            server.drop_session(&session);
                        }
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    server.run_session(session, socket, rx).await;
                });
            }
        }
    }

    async fn run_session<S>(
        self: Arc<Self>,
        session: Arc<ClientSession>,
        stream: S,
        rx: mpsc::Receiver<String>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(stream);
        let writer = tokio::spawn(Self::run_writer(session.clone(), write_half, rx));

        let mut buffer = MessageBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        'read: loop {
            let read = match read_half.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) => {
                    debug!("Read error from client {}: {}", session.id(), e);
                    break;
                }
            };
            buffer.write(&chunk[..read]);

            let lines = match buffer.read_messages() {
                Ok(lines) => lines,
                Err(_) => {
                    warn!("Client {} sent a non-UTF-8 frame", session.id());
                    let closed = self
                        .ban_client(
                            &session,
                            Some("MALFORMED".to_string()),
                            Some("Messages must be UTF-8 JSON lines".to_string()),
                            None,
                            None,
                        )
                        .await;
                    if closed {
                        break;
                    }
                    buffer.clear();
                    continue;
                }
            };

            for line in lines {
                match self.handle_message(&session, &line).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => break 'read,
                    Err(e) => {
                        error!("Session {} failed: {}", session.id(), e);
                        break 'read;
                    }
                }
            }
        }

        self.drop_session(&session);
        session.close();
        let _ = writer.await;
    }

    async fn run_writer<W>(
        session: Arc<ClientSession>,
        mut writer: W,
        mut rx: mpsc::Receiver<String>,
    ) where
        W: AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                biased;
                line = rx.recv() => match line {
                    Some(mut line) => {
                        line.push('\n');
                        if writer.write_all(line.as_bytes()).await.is_err()
                            || writer.flush().await.is_err()
                        {
                            session.mark_disconnected();
                            break;
                        }
                    }
                    None => break,
                },
                _ = session.wait_closed() => {
                    // Flush anything already queued, then let the socket drop.
                    while let Ok(mut line) = rx.try_recv() {
                        line.push('\n');
                        if writer.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    let _ = writer.flush().await;
                    break;
                }
            }
        }
    }

    fn drop_session(&self, session: &Arc<ClientSession>) {
        let removed = self.clients.lock().unwrap().remove(&session.id());
        if removed.is_some() {
            self.policy.connection_closed(session.remote_addr().ip());
            self.policy.forget_client(session.id());
            session.mark_disconnected();
            info!("Client {} disconnected", session.id());
        }
    }

    fn next_message_id(&self) -> u32 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_message<T: Serialize>(
        &self,
        session: &Arc<ClientSession>,
        method: StratumMethod,
        body: &T,
    ) {
        match messages::serialize_message(self.next_message_id(), &method, body) {
            Ok(line) => {
                if !session.send_line(line).await {
                    session.mark_disconnected();
                }
            }
            Err(e) => error!("Failed to serialize {}: {}", method, e),
        }
    }

    /// Serialize once, deliver to every subscribed, connected,
    /// non-shadow-banned session. A stalled session is closed rather
    /// than holding up the rest.
    fn broadcast_message<T: Serialize>(&self, method: StratumMethod, body: &T) {
        let line = match messages::serialize_message(self.next_message_id(), &method, body) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize broadcast {}: {}", method, e);
                return;
            }
        };

        let recipients: Vec<Arc<ClientSession>> = {
            let clients = self.clients.lock().unwrap();
            clients
                .values()
                .filter(|session| {
                    session.is_subscribed()
                        && session.is_connected()
                        && !self.policy.is_shadow_banned(session.id())
                })
                .cloned()
                .collect()
        };

        debug!("Broadcasting {} to {} clients", method, recipients.len());
        for session in recipients {
            if !session.try_send_line(line.clone()) {
                warn!("Client {} is stalled; disconnecting", session.id());
                session.close();
            }
        }
    }

    async fn run_broadcast(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<WorkBroadcast>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(WorkBroadcast::NewWork { mining_request_id, header }) => {
                        self.broadcast_message(
                            StratumMethod::Notify,
                            &NotifyBody { mining_request_id, header },
                        );
                    }
                    Some(WorkBroadcast::WaitForWork) => {
                        self.broadcast_message(StratumMethod::WaitForWork, &Value::Null);
                    }
                    None => break,
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_score_drain(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(SCORE_DRAIN_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.policy.drain_scores(lodepool_util::now_ms()),
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn apply_policy_action(
        &self,
        session: &Arc<ClientSession>,
        action: PolicyAction,
    ) -> bool {
        match action {
            PolicyAction::None => false,
            PolicyAction::ShadowBan => {
                self.policy.shadow_ban(session.id());
                false
            }
            PolicyAction::Ban(entry) => {
                let body = DisconnectBody {
                    reason: entry.reason,
                    version_expected: entry.version_expected,
                    banned_until: Some(entry.until_ms.max(0) as u64),
                    message: entry.message,
                };
                self.send_message(session, StratumMethod::Disconnect, &body).await;
                session.close();
                true
            }
        }
    }

    /// Ban the session's address (or shadow-ban when banning is off).
    /// Returns whether the session was closed.
    async fn ban_client(
        &self,
        session: &Arc<ClientSession>,
        reason: Option<String>,
        message: Option<String>,
        until_ms: Option<i64>,
        version_expected: Option<u32>,
    ) -> bool {
        let action = self.policy.ban(
            session.remote_addr().ip(),
            reason,
            message,
            until_ms,
            version_expected,
            lodepool_util::now_ms(),
        );
        self.apply_policy_action(session, action).await
    }

    async fn punish_client(&self, session: &Arc<ClientSession>, amount: u32) -> bool {
        let action = self
            .policy
            .punish(session.remote_addr().ip(), amount, lodepool_util::now_ms());
        self.apply_policy_action(session, action).await
    }

    async fn handle_message(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        raw: &str,
    ) -> Result<Flow, StratumError> {
        let envelope: RequestEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Client {} sent an invalid envelope: {}", session.id(), e);
                let closed = self
                    .ban_client(
                        session,
                        Some("MALFORMED".to_string()),
                        Some("Invalid message envelope".to_string()),
                        None,
                        None,
                    )
                    .await;
                return Ok(if closed { Flow::Close } else { Flow::Continue });
            }
        };

        match ClientMessage::parse(&envelope.method, envelope.body) {
            Ok(ClientMessage::Subscribe(body)) => {
                self.handle_subscribe(session, envelope.id, body).await
            }
            Ok(ClientMessage::Submit(body)) => {
                self.handle_submit(session, envelope.id, body).await
            }
            Ok(ClientMessage::GetStatus(body)) => {
                self.handle_get_status(session, envelope.id, body).await
            }
            Err(StratumError::Malformed { method }) => {
                warn!(
                    "Client {} sent a malformed '{}' request",
                    session.id(),
                    method
                );
                let error_line = messages::serialize_error(
                    self.next_message_id(),
                    envelope.id,
                    &format!("Malformed request for method '{}'", method),
                );
                let _ = session.send_line(error_line).await;

                let closed = self
                    .ban_client(
                        session,
                        Some("MALFORMED".to_string()),
                        Some(format!("Malformed request for method '{}'", method)),
                        None,
                        None,
                    )
                    .await;
                Ok(if closed { Flow::Close } else { Flow::Continue })
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_subscribe(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        _request_id: u32,
        body: SubscribeBody,
    ) -> Result<Flow, StratumError> {
        if body.version < MIN_VERSION {
            info!(
                "Client {} subscribed with unsupported version {}",
                session.id(),
                body.version
            );
            let closed = self
                .ban_client(
                    session,
                    Some("BAD_VERSION".to_string()),
                    Some(format!(
                        "Client version {} is below the minimum {}",
                        body.version, MIN_VERSION
                    )),
                    Some(lodepool_util::now_ms() + crate::peers::BAN_TTL_MS),
                    Some(CURRENT_VERSION),
                )
                .await;
            return Ok(if closed { Flow::Close } else { Flow::Continue });
        }

        if let Err(e) = lodepool_util::validate_public_address(&body.public_address) {
            info!(
                "Client {} subscribed with invalid address: {}",
                session.id(),
                e
            );
            let closed = self
                .ban_client(
                    session,
                    Some("BAD_ADDRESS".to_string()),
                    Some(e.to_string()),
                    None,
                    None,
                )
                .await;
            return Ok(if closed { Flow::Close } else { Flow::Continue });
        }

        let graffiti = format!("{}.{:x}", self.config.pool_name, session.id());
        if graffiti.as_bytes().len() > GRAFFITI_LEN {
            // Guarded at construction; violating it here is fatal to
            // the session and reported loudly.
            error!(
                "Graffiti '{}' exceeds {} bytes; check poolName",
                graffiti, GRAFFITI_LEN
            );
            return Err(StratumError::InvalidGraffiti(graffiti));
        }

        self.send_message(
            session,
            StratumMethod::Subscribed,
            &SubscribedBody {
                client_id: session.id(),
                xn: session.xn(),
            },
        )
        .await;

        self.send_message(
            session,
            StratumMethod::SetTarget,
            &SetTargetBody {
                target: self.pool_target.to_hex(),
            },
        )
        .await;

        if let Some((mining_request_id, header)) = self.distributor.current_work() {
            self.send_message(
                session,
                StratumMethod::Notify,
                &NotifyBody {
                    mining_request_id,
                    header,
                },
            )
            .await;
        }

        // Subscribed last: until the initial set_target and notify are
        // queued, the broadcast fan-out must not see this session.
        session.subscribe(
            body.version,
            body.public_address.clone(),
            body.name.clone(),
            graffiti,
        );

        info!(
            "Client {} subscribed as {} ({})",
            session.id(),
            body.name.as_deref().unwrap_or("anonymous"),
            body.public_address
        );
        Ok(Flow::Continue)
    }

    async fn handle_submit(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        request_id: u32,
        body: SubmitBody,
    ) -> Result<Flow, StratumError> {
        if !session.is_subscribed() {
            let error_line = messages::serialize_error(
                self.next_message_id(),
                request_id,
                "Subscribe before submitting",
            );
            let _ = session.send_line(error_line).await;
            let closed = self.punish_client(session, 1).await;
            return Ok(if closed { Flow::Close } else { Flow::Continue });
        }

        let outcome = match self.processor.process(session, &body).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Submission from client {} failed: {}", session.id(), e);
                self.send_message(
                    session,
                    StratumMethod::Submit,
                    &SubmittedBody {
                        id: request_id,
                        result: false,
                        message: Some("internal error".to_string()),
                    },
                )
                .await;
                return Ok(Flow::Continue);
            }
        };

        let (result, message) = match &outcome {
            SubmissionOutcome::Accepted { .. } => (true, None),
            SubmissionOutcome::Stale { .. } => (false, Some("stale work")),
            SubmissionOutcome::UnknownRequest { .. } => (false, Some("unknown mining request")),
            SubmissionOutcome::Duplicate => (false, Some("duplicate submission")),
            SubmissionOutcome::InvalidRandomness => (false, Some("invalid randomness")),
            SubmissionOutcome::InvalidHeader => (false, Some("invalid submission")),
            SubmissionOutcome::AboveTarget => (false, Some("hash above target")),
        };

        let mut closed = false;
        match outcome {
            SubmissionOutcome::InvalidRandomness => {
                closed = self.punish_client(session, 1).await;
            }
            SubmissionOutcome::InvalidHeader => {
                self.policy.shadow_ban(session.id());
            }
            _ => {}
        }

        self.send_message(
            session,
            StratumMethod::Submit,
            &SubmittedBody {
                id: request_id,
                result,
                message: message.map(str::to_string),
            },
        )
        .await;

        Ok(if closed { Flow::Close } else { Flow::Continue })
    }

    async fn handle_get_status(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        _request_id: u32,
        body: GetStatusBody,
    ) -> Result<Flow, StratumError> {
        let cutoff_ms = lodepool_util::now_ms()
            - (self.config.pool_recent_share_cutoff as i64).saturating_mul(1000);

        let shares = self.store.share_count_since(cutoff_ms, None).await?;
        let address_shares = match &body.public_address {
            Some(address) => Some(
                self.store
                    .share_count_since(cutoff_ms, Some(address))
                    .await?,
            ),
            None => None,
        };
        let miners = self.clients.lock().unwrap().len() as u64;

        self.send_message(
            session,
            StratumMethod::Status,
            &StatusBody {
                name: self.config.pool_name.clone(),
                miners,
                shares,
                public_address: body.public_address,
                address_shares,
            },
        )
        .await;

        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use lodepool_consensus::ConsensusParameters;

    use crate::testing::{share_hash, zero_template, FixedKernel, MockNode};

    struct TestRig {
        server: Arc<StratumServer>,
        distributor: Arc<WorkDistributor>,
    }

    async fn rig(banning: bool) -> TestRig {
        let (broadcast_tx, _broadcast_rx) = mpsc::unbounded_channel();
        let distributor = Arc::new(WorkDistributor::new(
            ConsensusParameters::default(),
            broadcast_tx,
        ));
        let node = Arc::new(MockNode::default());
        let store = Arc::new(ShareStore::open_in_memory().await.unwrap());
        let policy = Arc::new(PeerPolicy::new(0, banning));

        let config = PoolConfig::default();
        // The scripted kernel's hash must land inside the share target.
        let processor = Arc::new(SubmissionProcessor::new(
            distributor.clone(),
            node,
            store.clone(),
            Arc::new(FixedKernel(share_hash())),
            crate::testing::pool_target(),
        ));

        let server =
            StratumServer::new(config, policy, distributor.clone(), processor, store).unwrap();
        TestRig {
            server,
            distributor,
        }
    }

    fn session(rig: &TestRig, id: u64) -> (Arc<ClientSession>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SESSION_SEND_BUFFER);
        let session = Arc::new(ClientSession::new(
            id,
            format!("127.0.0.1:{}", 40_000 + id).parse().unwrap(),
            tx,
        ));
        rig.server
            .clients
            .lock()
            .unwrap()
            .insert(id, session.clone());
        (session, rx)
    }

    fn subscribe_line(version: u32, address: &str) -> String {
        serde_json::json!({
            "id": 0,
            "method": "mining.subscribe",
            "body": { "version": version, "publicAddress": address },
        })
        .to_string()
    }

    fn valid_address() -> String {
        lodepool_util::encode_public_address(&[7u8; 20])
    }

    fn recv_method(rx: &mut mpsc::Receiver<String>) -> (String, serde_json::Value) {
        let line = rx.try_recv().expect("expected a queued message");
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        (
            value["method"].as_str().unwrap_or_default().to_string(),
            value,
        )
    }

    #[tokio::test]
    async fn test_subscribe_happy_path() {
        let rig = rig(true).await;
        let (session, mut rx) = session(&rig, 1);
        rig.distributor.process_template(zero_template()).unwrap();

        let flow = rig
            .server
            .handle_message(&session, &subscribe_line(CURRENT_VERSION, &valid_address()))
            .await
            .unwrap();
        assert!(matches!(flow, Flow::Continue));
        assert!(session.is_subscribed());

        let (method, value) = recv_method(&mut rx);
        assert_eq!(method, "mining.subscribed");
        assert_eq!(value["body"]["clientId"], 1);

        let (method, value) = recv_method(&mut rx);
        assert_eq!(method, "mining.set_target");
        assert_eq!(
            value["body"]["target"],
            PoolConfig::default().pool_target().to_hex()
        );

        let (method, value) = recv_method(&mut rx);
        assert_eq!(method, "mining.notify");
        assert_eq!(value["body"]["miningRequestId"], 0);
        assert_eq!(value["body"]["header"].as_str().unwrap().len(), 360);
    }

    #[tokio::test]
    async fn test_subscribe_without_work_sends_no_notify() {
        let rig = rig(true).await;
        let (session, mut rx) = session(&rig, 1);

        rig.server
            .handle_message(&session, &subscribe_line(CURRENT_VERSION, &valid_address()))
            .await
            .unwrap();

        let (method, _) = recv_method(&mut rx);
        assert_eq!(method, "mining.subscribed");
        let (method, _) = recv_method(&mut rx);
        assert_eq!(method, "mining.set_target");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_old_version_is_banned() {
        let rig = rig(true).await;
        let (session, mut rx) = session(&rig, 1);

        let flow = rig
            .server
            .handle_message(&session, &subscribe_line(MIN_VERSION - 1, &valid_address()))
            .await
            .unwrap();
        assert!(matches!(flow, Flow::Close));
        assert!(!session.is_subscribed());

        let (method, value) = recv_method(&mut rx);
        assert_eq!(method, "mining.disconnect");
        assert_eq!(value["body"]["reason"], "BAD_VERSION");
        assert_eq!(value["body"]["versionExpected"], CURRENT_VERSION);
        assert!(value["body"]["bannedUntil"].as_u64().is_some());

        // The address is now refused outright.
        assert!(!rig
            .server
            .policy
            .is_allowed(session.remote_addr().ip(), lodepool_util::now_ms()));
    }

    #[tokio::test]
    async fn test_invalid_address_is_banned() {
        let rig = rig(true).await;
        let (session, mut rx) = session(&rig, 1);

        let flow = rig
            .server
            .handle_message(&session, &subscribe_line(CURRENT_VERSION, "not-an-address"))
            .await
            .unwrap();
        assert!(matches!(flow, Flow::Close));

        let (method, value) = recv_method(&mut rx);
        assert_eq!(method, "mining.disconnect");
        assert_eq!(value["body"]["reason"], "BAD_ADDRESS");
    }

    #[tokio::test]
    async fn test_malformed_envelope_shadow_bans_when_banning_disabled() {
        let rig = rig(false).await;
        let (session, _rx) = session(&rig, 1);

        let flow = rig
            .server
            .handle_message(&session, "this is not json")
            .await
            .unwrap();
        assert!(matches!(flow, Flow::Continue));
        assert!(rig.server.policy.is_shadow_banned(1));
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_broadcast_skips_shadow_banned_and_unsubscribed() {
        let rig = rig(true).await;
        let (subscribed, mut subscribed_rx) = session(&rig, 1);
        let (shadow, mut shadow_rx) = session(&rig, 2);
        let (fresh, mut fresh_rx) = session(&rig, 3);

        for session in [&subscribed, &shadow] {
            session.subscribe(
                CURRENT_VERSION,
                valid_address(),
                None,
                format!("lodepool.{:x}", session.id()),
            );
        }
        rig.server.policy.shadow_ban(shadow.id());

        rig.server.broadcast_message(
            StratumMethod::Notify,
            &NotifyBody {
                mining_request_id: 0,
                header: "aa".repeat(180),
            },
        );

        assert!(subscribed_rx.try_recv().is_ok());
        assert!(shadow_rx.try_recv().is_err());
        // Never subscribed, never notified.
        assert!(fresh_rx.try_recv().is_err());
        let _ = fresh;
    }

    #[tokio::test]
    async fn test_submit_before_subscribe_is_an_error() {
        let rig = rig(true).await;
        let (session, mut rx) = session(&rig, 1);

        let line = serde_json::json!({
            "id": 4,
            "method": "mining.submit",
            "body": { "miningRequestId": 0, "randomness": "0000000000000001" },
        })
        .to_string();

        rig.server.handle_message(&session, &line).await.unwrap();
        let raw = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["error"]["id"], 4);
    }

    #[tokio::test]
    async fn test_submitted_response_for_accepted_share() {
        let rig = rig(true).await;
        let (session, mut rx) = session(&rig, 1);
        rig.distributor.process_template(zero_template()).unwrap();

        rig.server
            .handle_message(&session, &subscribe_line(CURRENT_VERSION, &valid_address()))
            .await
            .unwrap();
        // Drain the subscription messages.
        for _ in 0..3 {
            let _ = rx.try_recv().unwrap();
        }

        let line = serde_json::json!({
            "id": 9,
            "method": "mining.submit",
            "body": { "miningRequestId": 0, "randomness": "0000000000000001" },
        })
        .to_string();
        rig.server.handle_message(&session, &line).await.unwrap();

        let (method, value) = recv_method(&mut rx);
        assert_eq!(method, "mining.submitted");
        assert_eq!(value["body"]["id"], 9);
        assert_eq!(value["body"]["result"], true);
    }

    #[tokio::test]
    async fn test_pool_name_too_long_for_graffiti_rejected() {
        let (broadcast_tx, _broadcast_rx) = mpsc::unbounded_channel();
        let distributor = Arc::new(WorkDistributor::new(
            ConsensusParameters::default(),
            broadcast_tx,
        ));
        let node = Arc::new(MockNode::default());
        let store = Arc::new(ShareStore::open_in_memory().await.unwrap());
        let policy = Arc::new(PeerPolicy::new(0, true));

        let mut config = PoolConfig::default();
        config.pool_name = "a-pool-name-much-too-long-for-graffiti".to_string();
        let processor = Arc::new(SubmissionProcessor::new(
            distributor.clone(),
            node,
            store.clone(),
            Arc::new(FixedKernel(share_hash())),
            config.pool_target(),
        ));

        assert!(matches!(
            StratumServer::new(config, policy, distributor, processor, store),
            Err(StratumError::InvalidGraffiti(_))
        ));
    }
}
