//! 파일 탐색 연결
//!
//! 연결 하나 위의 요청/응답 프로토콜. 클라이언트가 먼저 `handshake`를 보내고
//! 서버가 버전을 확인한 뒤부터 양쪽 모두 요청을 보낼 수 있음.
//!
//! 요청은 ack를 기다리며 보내고, ack 타임아웃이면 같은 봉투(같은 id)를 다시 보냄.
//! 따라서 같은 요청이 두 번 도착할 수 있고, 핸들러는 `is_new`일 때만 부수 효과를 내야 함

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::connection::{ConnectionState, ConnectionTask};
use crate::model::{
    ChatMessage, EnvelopeKind, ExploreEnvelope, ExploreMessage, Handshake, RemoteFile,
    RequestFiles, RequestFolder, ShareFiles, ShareFolder,
};
use crate::package::Package;
use crate::{Config, Error, Result, EXPLORE_VERSION};

/// 요청 핸들러
///
/// `is_new`는 같은 요청 id가 처음 도착했을 때만 `true`.
/// `None`을 돌려주면 응답을 보내지 않음 (요청측은 타임아웃).
/// 블로킹 스레드에서 호출되므로 파일 시스템 접근 등 블로킹 작업을 해도 됨
pub trait ExploreRequestHandler<Req, Resp>: Send + Sync {
    fn on_request(&self, is_new: bool, request: Req) -> Option<Resp>;
}

impl<Req, Resp, F> ExploreRequestHandler<Req, Resp> for F
where
    F: Fn(bool, Req) -> Option<Resp> + Send + Sync,
{
    fn on_request(&self, is_new: bool, request: Req) -> Option<Resp> {
        self(is_new, request)
    }
}

type Handler<Req, Resp> = Arc<dyn ExploreRequestHandler<Req, Resp>>;

/// 요청 종류별 핸들러
#[derive(Clone, Default)]
pub struct ExploreHandlers {
    folder: Option<Handler<RequestFolder, ShareFolder>>,
    files: Option<Handler<RequestFiles, ShareFiles>>,
    share: Option<Handler<ShareFiles, ShareFiles>>,
    message: Option<Handler<ChatMessage, ChatMessage>>,
}

impl ExploreHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request_folder(
        mut self,
        handler: impl ExploreRequestHandler<RequestFolder, ShareFolder> + 'static,
    ) -> Self {
        self.folder = Some(Arc::new(handler));
        self
    }

    pub fn on_request_files(
        mut self,
        handler: impl ExploreRequestHandler<RequestFiles, ShareFiles> + 'static,
    ) -> Self {
        self.files = Some(Arc::new(handler));
        self
    }

    /// 상대가 파일을 보내겠다고 알림
    pub fn on_share_files(
        mut self,
        handler: impl ExploreRequestHandler<ShareFiles, ShareFiles> + 'static,
    ) -> Self {
        self.share = Some(Arc::new(handler));
        self
    }

    pub fn on_message(
        mut self,
        handler: impl ExploreRequestHandler<ChatMessage, ChatMessage> + 'static,
    ) -> Self {
        self.message = Some(Arc::new(handler));
        self
    }
}

/// 탐색 연결 옵션
#[derive(Clone)]
pub struct ExploreOptions {
    pub config: Config,
    pub local: Handshake,
    pub handlers: ExploreHandlers,
    pub pool: Option<Arc<BufferPool>>,
}

impl ExploreOptions {
    pub fn new(config: Config, device_name: impl Into<String>) -> Self {
        Self {
            config,
            local: Handshake::local(device_name),
            handlers: ExploreHandlers::default(),
            pool: None,
        }
    }

    pub fn with_handlers(mut self, handlers: ExploreHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }
}

/// 핸드셰이크 진행 상태
#[derive(Debug, Clone, PartialEq, Eq)]
enum HandshakeStatus {
    Pending,
    Accepted(Handshake),
    Rejected { got: u32 },
    Violation(String),
}

struct ExploreInner {
    connection: ConnectionTask,
    config: Config,
    local: Handshake,
    handlers: ExploreHandlers,
    status: watch::Sender<HandshakeStatus>,
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<ExploreMessage>>,
    /// 받은 요청 id와 처음 받은 시각
    seen: Mutex<HashMap<u64, Instant>>,
}

/// 탐색 연결 핸들
#[derive(Clone)]
pub struct FileExplore {
    inner: Arc<ExploreInner>,
}

impl FileExplore {
    /// 서버에 연결하고 핸드셰이크
    pub async fn connect(server: SocketAddr, options: ExploreOptions) -> Result<Self> {
        let connection = ConnectionTask::connect_with_retry(server, options.config.clone()).await?;
        let explore = Self::attach(connection, options)?;

        let local = explore.inner.local.clone();
        match explore.request(ExploreMessage::Handshake(local)).await {
            Ok(ExploreMessage::Handshake(remote)) => {
                info!("탐색 연결 완료: {} ({})", remote.device_name, server);
                Ok(explore)
            }
            Ok(other) => {
                let e = Error::ProtocolViolation(format!("핸드셰이크 대신 {}", other.kind_name()));
                explore.inner.connection.close_with(true, &e.to_string()).await;
                Err(e)
            }
            Err(e) => match explore.inner.handshake_error() {
                Some(handshake_error) => Err(handshake_error),
                None => {
                    explore.inner.connection.close(false).await;
                    Err(e)
                }
            },
        }
    }

    /// 리스너에서 클라이언트 하나를 받고 핸드셰이크를 기다림
    pub async fn accept(listener: &TcpListener, options: ExploreOptions) -> Result<Self> {
        let (stream, peer) = listener.accept().await?;
        debug!("탐색 연결 accept: {}", peer);
        Self::accept_stream(stream, options).await
    }

    /// accept 루프 시작
    ///
    /// 핸드셰이크는 연결마다 별도 태스크에서 기다리므로 응답 없는 클라이언트가
    /// 다음 accept를 막지 않음. 핸드셰이크를 마친 연결만 돌려줌
    pub fn listen(listener: TcpListener, options: ExploreOptions) -> mpsc::Receiver<FileExplore> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = tx.closed() => break,
                };
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("탐색 accept 에러: {}", e);
                        continue;
                    }
                };
                debug!("탐색 연결 accept: {}", peer);

                let (tx, options) = (tx.clone(), options.clone());
                tokio::spawn(async move {
                    match Self::accept_stream(stream, options).await {
                        Ok(explore) => {
                            if let Err(rejected) = tx.send(explore).await {
                                rejected.0.close().await;
                            }
                        }
                        Err(e) => warn!("탐색 핸드셰이크 실패: {}: {}", peer, e),
                    }
                });
            }
            debug!("탐색 accept 루프 종료");
        });
        rx
    }

    /// 이미 받은 스트림에서 핸드셰이크를 기다림
    pub async fn accept_stream(stream: TcpStream, options: ExploreOptions) -> Result<Self> {
        let connection = ConnectionTask::accepted(stream, options.config.clone())?;
        let explore = Self::attach(connection, options)?;
        explore.inner.connection.start().await?;
        explore.wait_handshake().await?;
        Ok(explore)
    }

    fn attach(connection: ConnectionTask, options: ExploreOptions) -> Result<Self> {
        let connection = match options.pool {
            Some(pool) => connection.with_buffer_pool(pool),
            None => connection,
        };
        let inbound = connection.take_inbound().ok_or(Error::NotActive)?;
        let (status, _) = watch::channel(HandshakeStatus::Pending);

        let inner = Arc::new(ExploreInner {
            connection,
            config: options.config,
            local: options.local,
            handlers: options.handlers,
            status,
            next_id: AtomicU64::new(0),
            pending: DashMap::new(),
            seen: Mutex::new(HashMap::new()),
        });
        tokio::spawn(inner.clone().run_inbound(inbound));
        Ok(Self { inner })
    }

    async fn wait_handshake(&self) -> Result<Handshake> {
        let mut status_rx = self.inner.status.subscribe();
        let waited = tokio::time::timeout(self.inner.config.handshake_timeout(), async {
            tokio::select! {
                _ = status_rx.wait_for(|status| *status != HandshakeStatus::Pending) => {}
                _ = self.inner.connection.wait_closed() => {}
            }
        })
        .await;

        if let Some(remote) = self.remote_handshake() {
            return Ok(remote);
        }
        if let Some(e) = self.inner.handshake_error() {
            return Err(e);
        }

        self.inner.connection.close(false).await;
        match waited {
            Err(_) => Err(Error::RequestTimeout),
            Ok(()) => Err(Error::ConnectionClosed),
        }
    }

    pub fn connection(&self) -> &ConnectionTask {
        &self.inner.connection
    }

    /// 상대 핸드셰이크 (완료된 경우)
    pub fn remote_handshake(&self) -> Option<Handshake> {
        match &*self.inner.status.borrow() {
            HandshakeStatus::Accepted(remote) => Some(remote.clone()),
            _ => None,
        }
    }

    pub async fn request_folder(&self, path: impl Into<String>) -> Result<ShareFolder> {
        let request = ExploreMessage::RequestFolder(RequestFolder { path: path.into() });
        match self.request(request).await? {
            ExploreMessage::ShareFolder(folder) => Ok(folder),
            other => Err(unexpected_response(&other)),
        }
    }

    /// 상대에게 파일 전송을 요청. 응답에 fingerprint와 전송 포트가 담김
    pub async fn request_files(
        &self,
        files: Vec<RemoteFile>,
        max_connections: usize,
    ) -> Result<ShareFiles> {
        let request = ExploreMessage::RequestFiles(RequestFiles {
            files,
            max_connections,
        });
        match self.request(request).await? {
            ExploreMessage::ShareFiles(share) => Ok(share),
            other => Err(unexpected_response(&other)),
        }
    }

    /// 상대에게 파일을 보내겠다고 알림
    pub async fn share_files(&self, share: ShareFiles) -> Result<ShareFiles> {
        match self.request(ExploreMessage::ShareFiles(share)).await? {
            ExploreMessage::ShareFiles(share) => Ok(share),
            other => Err(unexpected_response(&other)),
        }
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<ChatMessage> {
        let request = ExploreMessage::Message(ChatMessage { text: text.into() });
        match self.request(request).await? {
            ExploreMessage::Message(reply) => Ok(reply),
            other => Err(unexpected_response(&other)),
        }
    }

    /// 요청을 보내고 응답을 기다림
    pub async fn request(&self, message: ExploreMessage) -> Result<ExploreMessage> {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let text = ExploreEnvelope::request(id, message).to_json()?;

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);

        if let Err(e) = inner.send_request(id, text).await {
            inner.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(inner.config.request_timeout(), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                inner.pending.remove(&id);
                warn!("탐색 요청 응답 없음: id={}", id);
                Err(Error::RequestTimeout)
            }
        }
    }

    /// 종료 알림을 보내고 연결 종료
    pub async fn close(&self) -> bool {
        self.inner.connection.close(true).await
    }

    pub async fn wait_closed(&self) -> ConnectionState {
        self.inner.connection.wait_closed().await
    }
}

/// 처음 받은 요청 id면 `true`
///
/// 재전송 가능 시간이 지난 id는 지워서 연결이 오래 살아도 크기가 유지됨
fn mark_seen(seen: &mut HashMap<u64, Instant>, id: u64, now: Instant, window: Duration) -> bool {
    seen.retain(|_, first| now.saturating_duration_since(*first) < window);
    match seen.entry(id) {
        Entry::Occupied(_) => false,
        Entry::Vacant(entry) => {
            entry.insert(now);
            true
        }
    }
}

fn unexpected_response(message: &ExploreMessage) -> Error {
    Error::ProtocolViolation(format!("예상 밖의 응답: {}", message.kind_name()))
}

impl ExploreInner {
    fn handshake_error(&self) -> Option<Error> {
        match &*self.status.borrow() {
            HandshakeStatus::Rejected { got } => Some(Error::InvalidVersion {
                expected: EXPLORE_VERSION,
                got: *got,
            }),
            HandshakeStatus::Violation(reason) => Some(Error::ProtocolViolation(reason.clone())),
            _ => None,
        }
    }

    fn is_handshaken(&self) -> bool {
        matches!(&*self.status.borrow(), HandshakeStatus::Accepted(_))
    }

    /// 상대가 같은 요청을 다시 보낼 수 있는 최대 시간
    fn resend_window(&self) -> Duration {
        let attempts = self.config.request_retries + 1;
        (self.config.ack_timeout() + self.config.connect_retry_backoff()) * attempts
            + self.config.request_timeout()
    }

    /// ack 타임아웃이면 같은 봉투를 다시 보냄
    async fn send_request(&self, id: u64, text: String) -> Result<()> {
        let retries = self.config.request_retries;
        let mut attempt = 0;

        loop {
            let package = Package::json(text.clone());
            match self
                .connection
                .send_and_await_ack(package, self.config.ack_timeout())
                .await
            {
                Ok(_) => return Ok(()),
                Err(Error::AckTimeout { index }) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        "탐색 요청 ack 타임아웃, 재전송 ({}/{}): id={}, index={}",
                        attempt, retries, id, index
                    );
                    tokio::time::sleep(self.config.connect_retry_backoff()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_inbound(self: Arc<Self>, mut inbound: mpsc::Receiver<Package>) {
        while let Some(package) = inbound.recv().await {
            match package {
                Package::Json { text, .. } => match ExploreEnvelope::from_json(&text) {
                    Ok(envelope) => {
                        if !self.clone().on_envelope(envelope).await {
                            break;
                        }
                    }
                    Err(e) => {
                        self.violation(format!("탐색 메시지 해석 실패: {}", e)).await;
                        break;
                    }
                },
                Package::Timeout => {
                    warn!("탐색 연결 유휴 타임아웃");
                    break;
                }
                Package::ClientFinish(reason) | Package::ServerFinish(reason) => {
                    info!("탐색 연결 상대 종료: {}", reason);
                    break;
                }
                other => debug!("탐색 연결: 무시한 패키지 {}", other.name()),
            }
        }

        // 대기 중인 요청은 ConnectionClosed로 끝남
        self.pending.clear();
    }

    /// 계속 읽어야 하면 `true`
    async fn on_envelope(self: Arc<Self>, envelope: ExploreEnvelope) -> bool {
        let ExploreEnvelope { id, kind, message } = envelope;

        if kind == EnvelopeKind::Response {
            if let ExploreMessage::Handshake(remote) = &message {
                if !self.accept_handshake(remote).await {
                    return false;
                }
            }
            match self.pending.remove(&id) {
                Some((_, tx)) => {
                    let _ = tx.send(message);
                }
                None => debug!("대기 중이 아닌 응답 무시: id={}", id),
            }
            return true;
        }

        let is_new = mark_seen(&mut self.seen.lock(), id, Instant::now(), self.resend_window());
        if !is_new {
            debug!("중복 요청: id={} ({})", id, message.kind_name());
        }

        if let ExploreMessage::Handshake(remote) = &message {
            if !self.accept_handshake(remote).await {
                return false;
            }
            let reply = ExploreMessage::Handshake(self.local.clone());
            self.respond(id, reply).await;
            return true;
        }

        if !self.is_handshaken() {
            self.violation(format!("핸드셰이크 전 요청: {}", message.kind_name()))
                .await;
            return false;
        }

        let Some(job) = self.handler_job(is_new, message) else {
            return true;
        };
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(job).await {
                Ok(Some(reply)) => self.respond(id, reply).await,
                Ok(None) => debug!("핸들러가 응답하지 않음: id={}", id),
                Err(e) => warn!("탐색 핸들러 실패: id={}: {}", id, e),
            }
        });
        true
    }

    fn handler_job(
        &self,
        is_new: bool,
        message: ExploreMessage,
    ) -> Option<Box<dyn FnOnce() -> Option<ExploreMessage> + Send>> {
        let handlers = &self.handlers;
        match message {
            ExploreMessage::RequestFolder(request) => handlers.folder.clone().map(|handler| {
                Box::new(move || {
                    handler
                        .on_request(is_new, request)
                        .map(ExploreMessage::ShareFolder)
                }) as Box<dyn FnOnce() -> Option<ExploreMessage> + Send>
            }),
            ExploreMessage::RequestFiles(request) => handlers.files.clone().map(|handler| {
                Box::new(move || {
                    handler
                        .on_request(is_new, request)
                        .map(ExploreMessage::ShareFiles)
                }) as Box<dyn FnOnce() -> Option<ExploreMessage> + Send>
            }),
            ExploreMessage::ShareFiles(request) => handlers.share.clone().map(|handler| {
                Box::new(move || {
                    handler
                        .on_request(is_new, request)
                        .map(ExploreMessage::ShareFiles)
                }) as Box<dyn FnOnce() -> Option<ExploreMessage> + Send>
            }),
            ExploreMessage::Message(request) => handlers.message.clone().map(|handler| {
                Box::new(move || {
                    handler
                        .on_request(is_new, request)
                        .map(ExploreMessage::Message)
                }) as Box<dyn FnOnce() -> Option<ExploreMessage> + Send>
            }),
            other => {
                debug!("요청으로 쓰지 않는 메시지: {}", other.kind_name());
                None
            }
        }
    }

    /// 버전 확인. 다르면 종료 알림 후 연결 종료
    async fn accept_handshake(&self, remote: &Handshake) -> bool {
        if remote.version != EXPLORE_VERSION {
            warn!(
                "탐색 버전 불일치: expected={}, got={} ({})",
                EXPLORE_VERSION, remote.version, remote.device_name
            );
            self.status
                .send_replace(HandshakeStatus::Rejected { got: remote.version });
            let reason = Error::InvalidVersion {
                expected: EXPLORE_VERSION,
                got: remote.version,
            }
            .to_string();
            self.connection.close_with(true, &reason).await;
            return false;
        }

        self.status.send_if_modified(|status| {
            if *status == HandshakeStatus::Pending {
                *status = HandshakeStatus::Accepted(remote.clone());
                true
            } else {
                false
            }
        });
        true
    }

    async fn violation(&self, reason: String) {
        warn!("탐색 프로토콜 위반: {}", reason);
        self.status.send_if_modified(|status| {
            if *status == HandshakeStatus::Pending {
                *status = HandshakeStatus::Violation(reason.clone());
                true
            } else {
                false
            }
        });
        self.connection.close_with(true, &reason).await;
    }

    async fn respond(&self, id: u64, message: ExploreMessage) {
        let text = match ExploreEnvelope::response(id, message).to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("응답 직렬화 실패: id={}: {}", id, e);
                return;
            }
        };
        if let Err(e) = self.connection.send(Package::json(text)).await {
            debug!("응답 전송 실패: id={}: {}", id, e);
        }
    }
}
