//! 연결 태스크
//!
//! 소켓 하나(TCP 클라이언트 / TCP 서버 accept / UDP)를 소유하고
//! 코덱 파이프라인을 돌리며 상태 전이와 수신 패키지 스트림을 노출
//!
//! 상태: NotStarted → Connecting → Active → Closed(reason) | Error(cause)
//! - Closed / Error는 종단 상태이며 한 번만 설정됨
//! - 인덱스 패키지를 받으면 전달 전에 `Response(index)`를 자동 회신
//! - 유휴 시간이 지나면 `Timeout`을 수신 스트림에 넣은 뒤 종료

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::buffer::BufferPool;
use crate::codec;
use crate::correlation::PackageIndexer;
use crate::heartbeat::HeartbeatSupervisor;
use crate::package::{Decoded, Package};
use crate::{Config, Error, Result};

/// UDP 데이터그램 최대 크기
const MAX_DATAGRAM: usize = 65_507;

/// TCP 수신 버퍼 크기
const READ_BUFFER: usize = 64 * 1024;

/// 연결의 방향
///
/// 종료 알림 패키지 종류를 결정함
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// 클라이언트측: `ServerFinish`를 보냄
    Client,
    /// 서버측: `ClientFinish`를 보냄
    Server,
}

impl Side {
    /// 이 방향에서 보내는 종료 알림
    pub fn finish(self, reason: impl Into<String>) -> Package {
        match self {
            Side::Client => Package::ServerFinish(reason.into()),
            Side::Server => Package::ClientFinish(reason.into()),
        }
    }
}

/// 소켓 역할
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionRole {
    /// 서버에 연결
    TcpClient { server: SocketAddr },
    /// 바인드 후 클라이언트 하나만 accept
    TcpServer { bind: SocketAddr },
    /// 외부 리스너가 accept한 스트림
    Accepted { peer: SocketAddr },
    /// UDP 소켓 (원격 주소 고정)
    Udp {
        bind: SocketAddr,
        remote: SocketAddr,
        side: Side,
    },
}

impl ConnectionRole {
    pub fn side(&self) -> Side {
        match self {
            ConnectionRole::TcpClient { .. } => Side::Client,
            ConnectionRole::TcpServer { .. } | ConnectionRole::Accepted { .. } => Side::Server,
            ConnectionRole::Udp { side, .. } => *side,
        }
    }
}

/// 종료 원인
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 로컬에서 닫음
    Local,
    /// 상대방이 종료 알림을 보냄
    RemoteFinish(String),
    /// 유휴 타임아웃
    IdleTimeout,
    /// 상대방 소켓이 닫힘
    PeerClosed,
}

/// 연결 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    NotStarted,
    Connecting,
    Active {
        local: SocketAddr,
        remote: SocketAddr,
    },
    Closed(CloseReason),
    Error(String),
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed(_) | ConnectionState::Error(_))
    }
}

/// 시작 전에 미리 준비된 소켓
enum Pending {
    Listener(TcpListener),
    Stream(TcpStream),
    Udp(UdpSocket),
}

enum Sink {
    Tcp(OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
}

struct Writer {
    sink: Sink,
    scratch: BytesMut,
}

enum Source {
    Tcp(BufReader<OwnedReadHalf>),
    Udp { socket: Arc<UdpSocket>, buf: Vec<u8> },
}

struct Established {
    source: Source,
    sink: Sink,
    local: SocketAddr,
    remote: SocketAddr,
}

struct Inner {
    role: ConnectionRole,
    config: Config,
    pool: Mutex<Option<Arc<BufferPool>>>,
    state_tx: watch::Sender<ConnectionState>,
    indexer: PackageIndexer,
    writer: tokio::sync::Mutex<Option<Writer>>,
    pending: Mutex<Option<Pending>>,
    inbound_tx: Mutex<Option<mpsc::Sender<Package>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Package>>>,
    /// 종료 알림은 연결당 최대 한 번
    finish_sent: AtomicBool,
}

/// 연결 태스크 핸들 (복제 가능)
#[derive(Clone)]
pub struct ConnectionTask {
    inner: Arc<Inner>,
}

impl ConnectionTask {
    /// 새 연결 (소켓은 `start`에서 생성)
    pub fn new(role: ConnectionRole, config: Config) -> Self {
        Self::build(role, config, None)
    }

    /// TCP 서버: 즉시 바인드하고 `start`에서 클라이언트 하나를 accept
    pub async fn bind_server(bind: SocketAddr, config: Config) -> Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| Error::ConnectFailed {
                addr: bind.to_string(),
                source,
            })?;
        let bound = listener.local_addr()?;
        Ok(Self::build(
            ConnectionRole::TcpServer { bind: bound },
            config,
            Some(Pending::Listener(listener)),
        ))
    }

    /// 외부 리스너가 accept한 스트림 감싸기
    pub fn accepted(stream: TcpStream, config: Config) -> Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self::build(
            ConnectionRole::Accepted { peer },
            config,
            Some(Pending::Stream(stream)),
        ))
    }

    /// 이미 바인드된 UDP 소켓 감싸기
    pub fn from_udp_socket(
        socket: UdpSocket,
        remote: SocketAddr,
        side: Side,
        config: Config,
    ) -> Result<Self> {
        let bind = socket.local_addr()?;
        Ok(Self::build(
            ConnectionRole::Udp { bind, remote, side },
            config,
            Some(Pending::Udp(socket)),
        ))
    }

    /// TCP 클라이언트 연결 (고정 횟수 + 고정 간격 재시도)
    pub async fn connect_with_retry(server: SocketAddr, config: Config) -> Result<Self> {
        let attempts = config.connect_retry_attempts.max(1);
        let backoff = config.connect_retry_backoff();
        let mut last_error = Error::ConnectionClosed;

        for attempt in 1..=attempts {
            let connection = Self::new(ConnectionRole::TcpClient { server }, config.clone());
            match connection.start().await {
                Ok(()) => return Ok(connection),
                Err(e) => {
                    warn!("연결 실패 ({}/{}): {}: {}", attempt, attempts, server, e);
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_error)
    }

    fn build(role: ConnectionRole, config: Config, pending: Option<Pending>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::NotStarted);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_size.max(1));

        Self {
            inner: Arc::new(Inner {
                role,
                config,
                pool: Mutex::new(None),
                state_tx,
                indexer: PackageIndexer::new(),
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(pending),
                inbound_tx: Mutex::new(Some(inbound_tx)),
                inbound_rx: Mutex::new(Some(inbound_rx)),
                finish_sent: AtomicBool::new(false),
            }),
        }
    }

    /// 쓰기 경로에서 풀 버퍼를 인코딩 공간으로 사용
    pub fn with_buffer_pool(self, pool: Arc<BufferPool>) -> Self {
        *self.inner.pool.lock() = Some(pool);
        self
    }

    pub fn role(&self) -> &ConnectionRole {
        &self.inner.role
    }

    pub fn side(&self) -> Side {
        self.inner.role.side()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// 현재 상태
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// 활성이고 아직 종료 알림을 보내지 않았는지
    pub fn is_active(&self) -> bool {
        self.inner.state_tx.borrow().is_active() && !self.is_finishing()
    }

    /// 종료 알림을 이미 보냄 (상대가 닫기를 기다리는 중일 수 있음)
    pub fn is_finishing(&self) -> bool {
        self.inner.finish_sent.load(Ordering::Acquire)
    }

    /// 상태 변경 구독
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// 수신 패키지 스트림 (한 번만 가져갈 수 있음)
    ///
    /// 연결이 종단 상태가 되면 스트림이 끝남
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Package>> {
        self.inner.inbound_rx.lock().take()
    }

    /// 로컬 주소 (바인드 또는 연결 후)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if let ConnectionState::Active { local, .. } = &*self.inner.state_tx.borrow() {
            return Some(*local);
        }
        match &*self.inner.pending.lock() {
            Some(Pending::Listener(listener)) => listener.local_addr().ok(),
            Some(Pending::Stream(stream)) => stream.local_addr().ok(),
            Some(Pending::Udp(socket)) => socket.local_addr().ok(),
            None => None,
        }
    }

    /// 원격 주소 (활성 상태일 때)
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match &*self.inner.state_tx.borrow() {
            ConnectionState::Active { remote, .. } => Some(*remote),
            _ => None,
        }
    }

    /// 응답 대기 중인 인덱스 수
    pub fn pending_acks(&self) -> usize {
        self.inner.indexer.pending_count()
    }

    /// 연결 시작
    ///
    /// 실패하면 상태가 `Error`가 되고 에러를 그대로 돌려줌 (내부 재시도 없음)
    pub async fn start(&self) -> Result<()> {
        let began = self.inner.state_tx.send_if_modified(|state| {
            if matches!(state, ConnectionState::NotStarted) {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(if self.state().is_terminal() {
                Error::ConnectionClosed
            } else {
                Error::AlreadyStarted
            });
        }
        debug!("연결 시작: {:?}", self.inner.role);

        let established = {
            let mut state_rx = self.inner.state_tx.subscribe();
            tokio::select! {
                result = self.inner.establish() => result,
                _ = wait_terminal(&mut state_rx) => Err(Error::ConnectionClosed),
            }
        };

        let Established {
            source,
            sink,
            local,
            remote,
        } = match established {
            Ok(established) => established,
            Err(e) => {
                self.inner.set_terminal(ConnectionState::Error(e.to_string()));
                return Err(e);
            }
        };

        *self.inner.writer.lock().await = Some(Writer {
            sink,
            scratch: BytesMut::new(),
        });

        let activated = self.inner.state_tx.send_if_modified(|state| {
            if matches!(state, ConnectionState::Connecting) {
                *state = ConnectionState::Active { local, remote };
                true
            } else {
                false
            }
        });
        if !activated {
            self.inner.shutdown_writer().await;
            return Err(Error::ConnectionClosed);
        }
        info!("연결 활성: {} -> {}", local, remote);

        let inbound = self.inner.inbound_tx.lock().take();
        if let Some(inbound) = inbound {
            tokio::spawn(self.inner.clone().read_loop(source, inbound));
        }
        if self.inner.config.heartbeat_enabled {
            HeartbeatSupervisor::spawn(self.clone());
        }

        Ok(())
    }

    /// 패키지 전송 (응답 대기 없음)
    ///
    /// 인덱스 패키지면 부여한 인덱스를 돌려줌
    pub async fn send(&self, mut package: Package) -> Result<Option<u32>> {
        if !self.is_active() {
            return Err(Error::NotActive);
        }
        let index = self.inner.indexer.stamp(&mut package);
        self.inner.write(&package).await?;
        Ok(index)
    }

    /// 패키지 전송 후 같은 인덱스의 `Response`를 기다림
    ///
    /// 타임아웃이면 `AckTimeout` (연결은 유지), 연결이 끝나면 `ConnectionClosed`
    pub async fn send_and_await_ack(&self, mut package: Package, timeout: Duration) -> Result<u32> {
        if !package.is_indexed() {
            return Err(Error::NotAcknowledgeable);
        }
        if !self.is_active() {
            return Err(Error::NotActive);
        }

        let index = self.inner.indexer.next_index();
        package.stamp(index);

        // 응답이 먼저 도착해도 놓치지 않도록 전송 전에 등록
        let waiter = self.inner.indexer.register(index);
        self.inner.write(&package).await?;
        self.inner.indexer.wait(waiter, timeout).await?;
        Ok(index)
    }

    /// 연결 종료
    ///
    /// `notify_peer`이면 활성 상태일 때 종료 알림을 보냄.
    /// 실제로 알림을 보냈으면 `true`
    pub async fn close(&self, notify_peer: bool) -> bool {
        self.close_with(notify_peer, "closed").await
    }

    /// 사유를 지정해 연결 종료
    pub async fn close_with(&self, notify_peer: bool, reason: &str) -> bool {
        let notified = if notify_peer && self.is_active() {
            let grace = self.inner.config.heartbeat_interval();
            tokio::time::timeout(grace, self.inner.send_finish(reason))
                .await
                .unwrap_or(false)
        } else {
            false
        };

        if self
            .inner
            .set_terminal(ConnectionState::Closed(CloseReason::Local))
        {
            debug!("로컬 종료: {:?} (notified={})", self.inner.role, notified);
        }
        self.inner.shutdown_writer().await;
        notified
    }

    /// 종료 알림을 보내고 상대가 연결을 닫을 때까지 수신을 계속 비움
    ///
    /// 쓰기 방향만 먼저 닫아 상대가 알림을 끝까지 읽게 함.
    /// 유휴 타임아웃까지 기다린 뒤 로컬 종료. 알림을 보냈으면 `true`
    pub async fn finish_and_drain(&self, reason: &str) -> bool {
        if !self.is_active() {
            self.close(false).await;
            return false;
        }

        let grace = self.inner.config.heartbeat_interval();
        let notified = tokio::time::timeout(grace, self.inner.send_finish(reason))
            .await
            .unwrap_or(false);

        if notified {
            self.inner.shutdown_writer().await;
            let mut state_rx = self.inner.state_tx.subscribe();
            let linger = self.inner.config.idle_timeout();
            if tokio::time::timeout(linger, wait_terminal(&mut state_rx))
                .await
                .is_err()
            {
                debug!("상대 종료 대기 시간 초과: {:?}", self.inner.role);
            }
        }

        self.close(false).await;
        notified
    }

    /// 종단 상태가 될 때까지 대기
    pub async fn wait_closed(&self) -> ConnectionState {
        let mut state_rx = self.inner.state_tx.subscribe();
        wait_terminal(&mut state_rx).await;
        self.state()
    }
}

impl fmt::Debug for ConnectionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTask")
            .field("role", &self.inner.role)
            .field("state", &*self.inner.state_tx.borrow())
            .finish()
    }
}

impl Inner {
    async fn establish(&self) -> Result<Established> {
        let pending = self.pending.lock().take();

        match (&self.role, pending) {
            (ConnectionRole::Udp { remote, .. }, Some(Pending::Udp(socket))) => {
                udp_established(socket, *remote).await
            }
            (_, Some(Pending::Stream(stream))) => tcp_established(stream),
            (ConnectionRole::TcpServer { bind }, Some(Pending::Listener(listener))) => {
                accept_one(listener, *bind).await
            }
            (ConnectionRole::TcpClient { server }, None) => {
                let stream =
                    TcpStream::connect(server)
                        .await
                        .map_err(|source| Error::ConnectFailed {
                            addr: server.to_string(),
                            source,
                        })?;
                tcp_established(stream)
            }
            (ConnectionRole::TcpServer { bind }, None) => {
                let listener =
                    TcpListener::bind(bind)
                        .await
                        .map_err(|source| Error::ConnectFailed {
                            addr: bind.to_string(),
                            source,
                        })?;
                accept_one(listener, *bind).await
            }
            (ConnectionRole::Udp { bind, remote, .. }, None) => {
                let socket = UdpSocket::bind(bind)
                    .await
                    .map_err(|source| Error::ConnectFailed {
                        addr: bind.to_string(),
                        source,
                    })?;
                udp_established(socket, *remote).await
            }
            _ => Err(Error::NotActive),
        }
    }

    /// 종단 상태로 전이 (이미 종단이면 무시)
    fn set_terminal(&self, next: ConnectionState) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            self.indexer.close();
            debug!("연결 종단 상태: {:?}", *self.state_tx.borrow());
        }
        changed
    }

    fn is_terminal(&self) -> bool {
        self.state_tx.borrow().is_terminal()
    }

    async fn send_finish(&self, reason: &str) -> bool {
        if self.finish_sent.swap(true, Ordering::AcqRel) {
            return false;
        }
        let finish = self.role.side().finish(reason);
        match self.write(&finish).await {
            Ok(()) => {
                debug!("종료 알림 전송: {:?}", finish);
                true
            }
            Err(e) => {
                debug!("종료 알림 전송 실패: {}", e);
                false
            }
        }
    }

    async fn write(&self, package: &Package) -> Result<()> {
        let pool = self.pool.lock().clone();
        let mut pooled = match pool {
            Some(pool) => Some(pool.acquire().await),
            None => None,
        };

        let mut guard = self.writer.lock().await;
        let Writer { sink, scratch } = guard.as_mut().ok_or(Error::NotActive)?;
        let buf: &mut BytesMut = match pooled.as_mut() {
            Some(pooled) => &mut **pooled,
            None => scratch,
        };

        buf.clear();
        let max = self.config.max_frame_len;
        match sink {
            Sink::Tcp(_) => codec::encode_frame(package, buf, max)?,
            Sink::Udp(_) => codec::encode_datagram(package, buf, max)?,
        }

        let mut state_rx = self.state_tx.subscribe();
        if state_rx.borrow().is_terminal() {
            return Err(Error::ConnectionClosed);
        }
        let io = tokio::select! {
            io = write_sink(sink, buf) => io,
            _ = wait_terminal(&mut state_rx) => return Err(Error::ConnectionClosed),
        };
        drop(guard);

        if let Err(e) = io {
            warn!("쓰기 실패: {:?}: {}", self.role, e);
            self.set_terminal(ConnectionState::Error(e.to_string()));
            return Err(e.into());
        }
        trace!("전송: {}", package.name());
        Ok(())
    }

    async fn shutdown_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(Writer {
            sink: Sink::Tcp(mut half),
            ..
        }) = writer
        {
            let _ = half.shutdown().await;
        }
    }

    async fn read_loop(self: Arc<Self>, mut source: Source, inbound: mpsc::Sender<Package>) {
        let mut state_rx = self.state_tx.subscribe();
        let idle = self.config.idle_timeout();
        let max = self.config.max_frame_len;

        loop {
            let outcome = tokio::select! {
                _ = wait_terminal(&mut state_rx) => break,
                outcome = tokio::time::timeout(idle, read_next(&mut source, max)) => outcome,
            };

            match outcome {
                Err(_) => {
                    warn!("유휴 타임아웃: {:?} ({:?})", self.role, idle);
                    self.deliver(&inbound, &mut state_rx, Package::Timeout).await;
                    self.set_terminal(ConnectionState::Closed(CloseReason::IdleTimeout));
                    break;
                }
                Ok(Ok(None)) => {
                    debug!("상대방 소켓 종료: {:?}", self.role);
                    self.set_terminal(ConnectionState::Closed(CloseReason::PeerClosed));
                    break;
                }
                Ok(Ok(Some(decoded))) => {
                    if !self.dispatch(decoded, &inbound, &mut state_rx).await {
                        break;
                    }
                }
                Ok(Err(e)) if e.is_protocol_violation() => {
                    warn!("프로토콜 위반: {:?}: {}", self.role, e);
                    self.send_finish("protocol violation").await;
                    self.set_terminal(ConnectionState::Error(e.to_string()));
                    break;
                }
                Ok(Err(e)) => {
                    if !self.is_terminal() {
                        warn!("수신 에러: {:?}: {}", self.role, e);
                    }
                    self.set_terminal(ConnectionState::Error(e.to_string()));
                    break;
                }
            }
        }

        self.shutdown_writer().await;
    }

    /// 수신 패키지 처리. 계속 읽어야 하면 `true`
    async fn dispatch(
        &self,
        decoded: Decoded,
        inbound: &mpsc::Sender<Package>,
        state_rx: &mut watch::Receiver<ConnectionState>,
    ) -> bool {
        let package = match decoded {
            Decoded::Package(package) => package,
            Decoded::Unrecognized { tag, raw } => {
                debug!("알 수 없는 태그 무시: tag={:#04x}, len={}", tag, raw.len());
                return true;
            }
        };

        // 종료 알림 이후에는 쓰지 않고 읽기만 계속함
        let finishing = self.finish_sent.load(Ordering::Acquire);
        if package.is_indexed() && !finishing {
            if let Some(index) = package.index() {
                if let Err(e) = self.write(&Package::Response(index)).await {
                    debug!("Response 전송 실패: index={}: {}", index, e);
                    if !self.finish_sent.load(Ordering::Acquire) {
                        return false;
                    }
                }
            }
        }

        match package {
            Package::Response(index) => {
                self.indexer.notify_reply(index);
                true
            }
            Package::HeartBeat => {
                trace!("HeartBeat 수신: {:?}", self.role);
                true
            }
            Package::ClientFinish(ref reason) | Package::ServerFinish(ref reason) => {
                let reason = reason.clone();
                info!("상대방 종료 알림: {:?}: {}", self.role, reason);
                self.deliver(inbound, state_rx, package).await;
                self.set_terminal(ConnectionState::Closed(CloseReason::RemoteFinish(reason)));
                false
            }
            other => self.deliver(inbound, state_rx, other).await,
        }
    }

    /// 수신 스트림으로 전달 (소비자가 없으면 버림)
    async fn deliver(
        &self,
        inbound: &mpsc::Sender<Package>,
        state_rx: &mut watch::Receiver<ConnectionState>,
        package: Package,
    ) -> bool {
        tokio::select! {
            _ = inbound.send(package) => true,
            _ = wait_terminal(state_rx) => false,
        }
    }
}

async fn wait_terminal(state_rx: &mut watch::Receiver<ConnectionState>) {
    // 송신단은 Inner가 들고 있으므로 끊기지 않음
    let _ = state_rx.wait_for(|state| state.is_terminal()).await;
}

async fn read_next(source: &mut Source, max_frame_len: usize) -> Result<Option<Decoded>> {
    match source {
        Source::Tcp(reader) => codec::read_package(reader, max_frame_len).await,
        Source::Udp { socket, buf } => {
            let n = socket.recv(buf).await?;
            codec::decode_datagram(&buf[..n]).map(Some)
        }
    }
}

async fn write_sink(sink: &mut Sink, buf: &[u8]) -> std::io::Result<()> {
    match sink {
        Sink::Tcp(half) => half.write_all(buf).await,
        Sink::Udp(socket) => socket.send(buf).await.map(|_| ()),
    }
}

fn tcp_established(stream: TcpStream) -> Result<Established> {
    stream.set_nodelay(true)?;
    let local = stream.local_addr()?;
    let remote = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();

    Ok(Established {
        source: Source::Tcp(BufReader::with_capacity(READ_BUFFER, read_half)),
        sink: Sink::Tcp(write_half),
        local,
        remote,
    })
}

async fn accept_one(listener: TcpListener, bind: SocketAddr) -> Result<Established> {
    let (stream, peer) = listener
        .accept()
        .await
        .map_err(|source| Error::ConnectFailed {
            addr: bind.to_string(),
            source,
        })?;
    debug!("클라이언트 accept: {} (bind {})", peer, bind);
    tcp_established(stream)
}

async fn udp_established(socket: UdpSocket, remote: SocketAddr) -> Result<Established> {
    socket
        .connect(remote)
        .await
        .map_err(|source| Error::ConnectFailed {
            addr: remote.to_string(),
            source,
        })?;
    let local = socket.local_addr()?;
    let socket = Arc::new(socket);

    Ok(Established {
        source: Source::Udp {
            socket: socket.clone(),
            buf: vec![0u8; MAX_DATAGRAM],
        },
        sink: Sink::Udp(socket),
        local,
        remote,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const MAX: usize = 1024 * 1024;

    fn test_config() -> Config {
        Config {
            heartbeat_interval_ms: 50,
            idle_timeout_multiplier: 40,
            ..Config::default()
        }
    }

    async fn pair(config: Config) -> (ConnectionTask, ConnectionTask) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = ConnectionTask::new(ConnectionRole::TcpClient { server: addr }, config.clone());
        let (started, accepted) = tokio::join!(client.start(), listener.accept());
        started.unwrap();
        let server = ConnectionTask::accepted(accepted.unwrap().0, config).unwrap();
        server.start().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_send_and_await_ack() {
        let (client, server) = pair(test_config()).await;
        let mut server_in = server.take_inbound().unwrap();

        let index = client
            .send_and_await_ack(Package::text("hello"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(index, 0);

        match server_in.recv().await.unwrap() {
            Package::Text { text, index } => {
                assert_eq!(text, "hello");
                assert_eq!(index, Some(0));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(client.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_acks_matched_by_index() {
        let (client, _server) = pair(test_config()).await;

        let mut handles = Vec::new();
        for i in 0..16 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client
                    .send_and_await_ack(
                        Package::json(format!("{{\"n\":{}}}", i)),
                        Duration::from_secs(2),
                    )
                    .await
            }));
        }

        let mut indices = Vec::new();
        for handle in handles {
            indices.push(handle.await.unwrap().unwrap());
        }
        indices.sort_unstable();
        assert_eq!(indices, (0..16).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_ack_timeout_keeps_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = ConnectionTask::new(ConnectionRole::TcpClient { server: addr }, test_config());
        let (started, accepted) = tokio::join!(client.start(), listener.accept());
        started.unwrap();
        let (_silent, _) = accepted.unwrap();

        let err = client
            .send_and_await_ack(Package::text("x"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AckTimeout { index: 0 }));
        assert!(client.is_active());
    }

    #[tokio::test]
    async fn test_idle_timeout_injects_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Config {
            heartbeat_interval_ms: 50,
            idle_timeout_multiplier: 2,
            ..Config::default()
        };
        let client = ConnectionTask::new(ConnectionRole::TcpClient { server: addr }, config);
        let mut inbound = client.take_inbound().unwrap();
        let (started, accepted) = tokio::join!(client.start(), listener.accept());
        started.unwrap();
        let (_silent, _) = accepted.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(Package::Timeout));
        assert_eq!(
            client.wait_closed().await,
            ConnectionState::Closed(CloseReason::IdleTimeout)
        );
    }

    #[tokio::test]
    async fn test_close_notifies_peer_once() {
        let (client, server) = pair(test_config()).await;
        let mut server_in = server.take_inbound().unwrap();

        assert!(client.close_with(true, "bye").await);
        assert!(!client.close(true).await);
        assert_eq!(
            client.state(),
            ConnectionState::Closed(CloseReason::Local)
        );

        assert_eq!(
            server_in.recv().await,
            Some(Package::ServerFinish("bye".into()))
        );
        assert_eq!(
            server.wait_closed().await,
            ConnectionState::Closed(CloseReason::RemoteFinish("bye".into()))
        );
        assert!(server_in.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_finish_and_drain_waits_for_peer_close() {
        let (client, server) = pair(test_config()).await;
        let mut server_in = server.take_inbound().unwrap();

        let draining = {
            let client = client.clone();
            tokio::spawn(async move { client.finish_and_drain("stop").await })
        };

        assert_eq!(
            server_in.recv().await,
            Some(Package::ServerFinish("stop".into()))
        );
        assert!(client.is_finishing());
        assert!(!client.is_active());
        assert!(client.send(Package::HeartBeat).await.is_err());

        assert!(draining.await.unwrap());
        // 상대가 먼저 닫았음
        assert_eq!(
            client.state(),
            ConnectionState::Closed(CloseReason::PeerClosed)
        );
    }

    #[tokio::test]
    async fn test_quiet_close_seen_as_peer_closed() {
        let (client, server) = pair(test_config()).await;
        assert!(!server.close(false).await);
        assert_eq!(
            client.wait_closed().await,
            ConnectionState::Closed(CloseReason::PeerClosed)
        );
        assert!(matches!(
            client.send(Package::HeartBeat).await,
            Err(Error::NotActive)
        ));
    }

    #[tokio::test]
    async fn test_unknown_tag_ignored_and_indexed_acked() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (raw, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut raw = raw.unwrap();
        let server = ConnectionTask::accepted(accepted.unwrap().0, test_config()).unwrap();
        let mut inbound = server.take_inbound().unwrap();
        server.start().await.unwrap();

        raw.write_all(&[0, 0, 0, 2, 0x7F, 1]).await.unwrap();
        let mut text = Package::text("after");
        text.stamp(5);
        let mut buf = BytesMut::new();
        codec::encode_frame(&text, &mut buf, MAX).unwrap();
        raw.write_all(&buf).await.unwrap();

        assert_eq!(inbound.recv().await.unwrap(), text);
        loop {
            match codec::read_package(&mut raw, MAX).await.unwrap().unwrap() {
                Decoded::Package(Package::Response(index)) => {
                    assert_eq!(index, 5);
                    break;
                }
                Decoded::Package(Package::HeartBeat) => continue,
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert!(server.is_active());
    }

    #[tokio::test]
    async fn test_protocol_violation_sends_finish() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (raw, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut raw = raw.unwrap();
        let server = ConnectionTask::accepted(accepted.unwrap().0, test_config()).unwrap();
        server.start().await.unwrap();

        // Response 본문이 잘림
        raw.write_all(&[0, 0, 0, 2, 0x06, 1]).await.unwrap();

        loop {
            match codec::read_package(&mut raw, MAX).await.unwrap() {
                Some(Decoded::Package(Package::ClientFinish(_))) => break,
                Some(Decoded::Package(Package::HeartBeat)) => continue,
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert!(matches!(server.wait_closed().await, ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_connect_failure_is_error_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connection = ConnectionTask::new(ConnectionRole::TcpClient { server: addr }, test_config());
        assert!(matches!(
            connection.start().await,
            Err(Error::ConnectFailed { .. })
        ));
        assert!(matches!(connection.state(), ConnectionState::Error(_)));
        assert!(matches!(
            connection.start().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_tcp_server_role_accepts_one() {
        let server = ConnectionTask::bind_server("127.0.0.1:0".parse().unwrap(), test_config())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let mut server_in = server.take_inbound().unwrap();

        let accepting = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };
        let client = ConnectionTask::connect_with_retry(addr, test_config())
            .await
            .unwrap();
        accepting.await.unwrap().unwrap();

        client.send(Package::text("hi")).await.unwrap();
        assert!(matches!(
            server_in.recv().await,
            Some(Package::Text { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_while_accepting_aborts() {
        let server = ConnectionTask::bind_server("127.0.0.1:0".parse().unwrap(), test_config())
            .await
            .unwrap();
        let accepting = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        server.close(true).await;

        let result = tokio::time::timeout(Duration::from_secs(1), accepting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_udp_exchange() {
        let a_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a_socket.local_addr().unwrap();
        let b_addr = b_socket.local_addr().unwrap();

        let a = ConnectionTask::from_udp_socket(a_socket, b_addr, Side::Client, test_config())
            .unwrap();
        let b = ConnectionTask::from_udp_socket(b_socket, a_addr, Side::Server, test_config())
            .unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        let mut b_in = b.take_inbound().unwrap();

        a.send_and_await_ack(Package::bytes(vec![1u8, 2, 3]), Duration::from_secs(2))
            .await
            .unwrap();
        match b_in.recv().await.unwrap() {
            Package::Bytes { payload, .. } => assert_eq!(&payload[..], &[1, 2, 3]),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pooled_write_path() {
        let pool = BufferPool::new(2, 1024);
        let config = Config {
            heartbeat_enabled: false,
            ..test_config()
        };
        let (client, server) = pair(config).await;
        let client = client.with_buffer_pool(pool.clone());
        let mut server_in = server.take_inbound().unwrap();

        client
            .send_and_await_ack(Package::text("pooled"), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(server_in.recv().await, Some(Package::Text { .. })));
        assert_eq!(pool.available(), 2);
    }
}
