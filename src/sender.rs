//! 송신자 (프레임 서버측)
//!
//! - 전송 포트에서 프레임 연결을 무제한 accept
//! - 연결마다 프레임 요청을 읽고 해당 범위를 Bytes 패키지로 스트리밍
//! - 공유 파일 등록부: fingerprint → (경로, 크기)
//! - 수신측 ServerFinish는 원격 취소로 보고

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::connection::{CloseReason, ConnectionState, ConnectionTask};
use crate::frame::{Fingerprint, FrameRequest};
use crate::package::Package;
use crate::session::{
    CancelOutcome, CancelRegistry, Observers, TransferEvent, TransferFile, TransferObservers,
    TransferState,
};
use crate::{Config, Error, Result};

/// 로컬 취소 시 상대에게 보내는 사유
const CANCEL_REASON: &str = "Server cancel";

/// 공유 중인 파일
#[derive(Debug, Clone)]
pub struct SharedFile {
    pub file: TransferFile,
    pub path: PathBuf,
}

/// 프레임 서버 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeEvent {
    /// 데이터를 연결에 넘김
    Sent { fingerprint: Fingerprint, bytes: u64 },
    /// 수신측이 전송을 취소함
    RemoteCancel {
        fingerprint: Fingerprint,
        reason: String,
    },
    /// 프레임 제공 실패
    Failed {
        fingerprint: Option<Fingerprint>,
        error: String,
    },
}

/// 공유 등록 항목. 같은 파일을 여러 번 공유하면 사용자 수가 늘어남
struct ShareEntry {
    shared: SharedFile,
    users: usize,
}

/// 프레임 서버
pub struct FrameServer {
    config: Config,
    local_addr: SocketAddr,
    shared: DashMap<Fingerprint, ShareEntry>,
    /// 파일별 열린 프레임 연결
    serving: DashMap<Fingerprint, Arc<CancelRegistry>>,
    observers: Observers<ServeEvent>,
    running: AtomicBool,
}

impl FrameServer {
    /// 바인드 후 accept 루프 시작
    pub async fn bind(addr: SocketAddr, config: Config) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::ConnectFailed {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let server = Arc::new(Self {
            config,
            local_addr,
            shared: DashMap::new(),
            serving: DashMap::new(),
            observers: Observers::new(),
            running: AtomicBool::new(true),
        });

        info!("프레임 서버 시작: {}", local_addr);
        tokio::spawn(server.clone().accept_loop(listener));
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 이벤트 구독
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ServeEvent> {
        self.observers.subscribe()
    }

    /// 로컬 파일 공유 등록
    pub async fn share(&self, path: &Path) -> Result<TransferFile> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Error::FileNotShared(path.display().to_string()));
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = TransferFile {
            fingerprint: Fingerprint::of_file(path, metadata.len()),
            name,
            size: metadata.len(),
        };

        self.shared
            .entry(file.fingerprint)
            .and_modify(|entry| entry.users += 1)
            .or_insert_with(|| ShareEntry {
                shared: SharedFile {
                    file: file.clone(),
                    path: path.to_path_buf(),
                },
                users: 1,
            });
        self.serving
            .entry(file.fingerprint)
            .or_insert_with(|| Arc::new(CancelRegistry::new()));
        debug!("공유 등록: {} ({})", file.name, file.fingerprint);
        Ok(file)
    }

    /// 공유 해제 (진행 중인 연결은 유지)
    pub fn unshare(&self, fingerprint: &Fingerprint) -> Option<SharedFile> {
        let removed = self.shared.remove(fingerprint).map(|(_, entry)| entry.shared);
        self.serving
            .remove_if(fingerprint, |_, registry| registry.is_empty());
        removed
    }

    /// `share` 한 번을 되돌림. 마지막 사용자면 공유 해제
    pub fn release(&self, fingerprint: &Fingerprint) {
        let removed = self
            .shared
            .remove_if_mut(fingerprint, |_, entry| {
                entry.users = entry.users.saturating_sub(1);
                entry.users == 0
            })
            .is_some();
        if removed {
            self.serving
                .remove_if(fingerprint, |_, registry| registry.is_empty());
            debug!("공유 해제: {}", fingerprint);
        }
    }

    pub fn shared_file(&self, fingerprint: &Fingerprint) -> Option<SharedFile> {
        self.shared.get(fingerprint).map(|entry| entry.shared.clone())
    }

    /// 공유 중인 파일 수
    pub fn shared_count(&self) -> usize {
        self.shared.len()
    }

    /// 파일 하나의 프레임 연결 수
    pub fn active_connections(&self, fingerprint: &Fingerprint) -> usize {
        self.serving
            .get(fingerprint)
            .map(|registry| registry.len())
            .unwrap_or(0)
    }

    /// 파일 하나의 프레임 연결 모두 종료
    pub async fn cancel_file(&self, fingerprint: &Fingerprint, notify_peer: bool) -> CancelOutcome {
        let registry = self.serving.get(fingerprint).map(|entry| entry.clone());
        match registry {
            Some(registry) => registry.cancel_all(notify_peer, CANCEL_REASON).await,
            None => CancelOutcome::default(),
        }
    }

    /// accept 루프 중지
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.running.load(Ordering::SeqCst) {
            // 중지 플래그를 주기적으로 확인
            let accepted = match tokio::time::timeout(Duration::from_millis(200), listener.accept()).await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("프레임 연결 accept: {}", peer);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.clone().serve(stream).await {
                            debug!("프레임 제공 종료: {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("accept 에러: {}", e),
            }
        }
        info!("프레임 서버 중지: {}", self.local_addr);
    }

    async fn serve(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let connection = ConnectionTask::accepted(stream, self.config.clone())?;
        let mut inbound = connection.take_inbound().ok_or(Error::NotActive)?;
        connection.start().await?;

        let request = match self.read_request(&mut inbound).await {
            Ok(request) => request,
            Err(e) => {
                connection.close_with(true, &e.to_string()).await;
                self.observers.emit(ServeEvent::Failed {
                    fingerprint: None,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let (shared, registry) = match self.lookup(&request) {
            Ok(found) => found,
            Err(e) => {
                warn!("프레임 요청 거절: {}", e);
                connection.close_with(true, &e.to_string()).await;
                self.observers.emit(ServeEvent::Failed {
                    fingerprint: Some(request.fingerprint),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let key = registry.register(connection.clone());
        let watcher = tokio::spawn(watch_remote(
            inbound,
            request.fingerprint,
            self.clone(),
        ));

        let result = self.stream_range(&connection, &shared, &request).await;
        if let Err(e) = &result {
            self.report_failure(&connection, &shared, request.fingerprint, e)
                .await;
        }

        // 수신측이 범위를 다 받으면 연결을 닫음
        connection.wait_closed().await;
        registry.unregister(key);
        let _ = watcher.await;
        result
    }

    /// 범위를 다 보내기 전에 끝난 프레임 연결 보고
    ///
    /// 상대의 종료 알림이면 원격 취소, 로컬 취소면 보고하지 않음, 그 외는 실패
    async fn report_failure(
        &self,
        connection: &ConnectionTask,
        shared: &SharedFile,
        fingerprint: Fingerprint,
        error: &Error,
    ) {
        match connection.state() {
            ConnectionState::Closed(CloseReason::RemoteFinish(reason)) => {
                self.observers
                    .emit(ServeEvent::RemoteCancel { fingerprint, reason });
            }
            ConnectionState::Closed(CloseReason::Local) => {}
            _ if connection.is_finishing() => {}
            state => {
                warn!("프레임 전송 실패: {}: {} ({:?})", shared.file.name, error, state);
                connection.close(false).await;
                self.observers.emit(ServeEvent::Failed {
                    fingerprint: Some(fingerprint),
                    error: error.to_string(),
                });
            }
        }
    }

    async fn read_request(&self, inbound: &mut mpsc::Receiver<Package>) -> Result<FrameRequest> {
        let first = tokio::time::timeout(self.config.handshake_timeout(), inbound.recv())
            .await
            .map_err(|_| Error::RequestTimeout)?;

        match first {
            Some(Package::Bytes { payload, .. }) => FrameRequest::from_bytes(&payload).ok_or_else(|| {
                Error::ProtocolViolation(format!("프레임 요청 길이 불일치: {}", payload.len()))
            }),
            Some(Package::Timeout) => Err(Error::IdleTimeout),
            Some(other) => Err(Error::ProtocolViolation(format!(
                "프레임 요청 대신 {} 수신",
                other.name()
            ))),
            None => Err(Error::ConnectionClosed),
        }
    }

    fn lookup(&self, request: &FrameRequest) -> Result<(SharedFile, Arc<CancelRegistry>)> {
        let shared = self
            .shared_file(&request.fingerprint)
            .ok_or_else(|| Error::FileNotShared(request.fingerprint.to_hex()))?;

        if request.start >= request.end || request.end > shared.file.size {
            return Err(Error::InvalidRange {
                start: request.start,
                end: request.end,
                size: shared.file.size,
            });
        }

        let registry = self
            .serving
            .entry(request.fingerprint)
            .or_insert_with(|| Arc::new(CancelRegistry::new()))
            .clone();
        Ok((shared, registry))
    }

    async fn stream_range(
        &self,
        connection: &ConnectionTask,
        shared: &SharedFile,
        request: &FrameRequest,
    ) -> Result<()> {
        let mut file = File::open(&shared.path).await?;
        file.seek(SeekFrom::Start(request.start)).await?;

        let chunk_size = self.config.transfer_chunk_size as u64;
        let mut remaining = request.end - request.start;
        let mut buf = BytesMut::with_capacity(chunk_size as usize);

        debug!(
            "프레임 전송 시작: {} [{}, {})",
            shared.file.name, request.start, request.end
        );

        while remaining > 0 {
            if !connection.is_active() {
                return Err(Error::ConnectionClosed);
            }
            let n = remaining.min(chunk_size) as usize;
            buf.resize(n, 0);
            file.read_exact(&mut buf[..]).await?;

            connection.send(Package::bytes(buf.split().freeze())).await?;
            remaining -= n as u64;
            self.observers.emit(ServeEvent::Sent {
                fingerprint: request.fingerprint,
                bytes: n as u64,
            });
        }

        Ok(())
    }
}

/// 수신측 패키지 감시: ServerFinish면 원격 취소로 보고
async fn watch_remote(
    mut inbound: mpsc::Receiver<Package>,
    fingerprint: Fingerprint,
    server: Arc<FrameServer>,
) {
    while let Some(package) = inbound.recv().await {
        match package {
            Package::ServerFinish(reason) => {
                info!("수신측 취소: {}: {}", fingerprint, reason);
                server
                    .observers
                    .emit(ServeEvent::RemoteCancel { fingerprint, reason });
            }
            Package::Timeout => {
                server.observers.emit(ServeEvent::Failed {
                    fingerprint: Some(fingerprint),
                    error: Error::IdleTimeout.to_string(),
                });
            }
            other => debug!("프레임 연결: 무시한 패키지 {}", other.name()),
        }
    }
}

/// 송신 세션: 공유한 파일들의 전송 진행률 집계
pub struct SendSession {
    server: Arc<FrameServer>,
    files: Vec<TransferFile>,
    sent: Vec<AtomicU64>,
    state: watch::Sender<TransferState>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ServeEvent>>>,
    observers: TransferObservers,
}

impl SendSession {
    /// 이미 공유 등록된 파일들로 세션 생성
    ///
    /// 이벤트 구독은 생성 시점에 시작되므로 상대에게 알리기 전에 만들어야 함.
    /// 세션이 끝나면 파일마다 `release`를 한 번씩 부름
    pub fn new(server: Arc<FrameServer>, files: Vec<TransferFile>) -> Arc<Self> {
        let (state, _) = watch::channel(TransferState::NotStarted);
        let events = server.subscribe();
        let sent = files.iter().map(|_| AtomicU64::new(0)).collect();

        Arc::new(Self {
            server,
            files,
            sent,
            state,
            events: Mutex::new(Some(events)),
            observers: TransferObservers::new(),
        })
    }

    pub fn files(&self) -> &[TransferFile] {
        &self.files
    }

    pub fn state(&self) -> TransferState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        self.observers.subscribe()
    }

    /// 파일별 전송 바이트
    pub fn sent_bytes(&self, file_index: usize) -> u64 {
        self.sent
            .get(file_index)
            .map(|sent| sent.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// 모든 파일이 전송되거나 취소될 때까지 실행
    pub async fn run(self: &Arc<Self>) -> TransferState {
        let events = self.events.lock().take();
        let Some(mut events) = events else {
            return self.state();
        };
        if !self.transition(TransferState::NotStarted, TransferState::Started) {
            return self.state();
        }

        for (file_index, file) in self.files.iter().enumerate() {
            self.observers.emit(TransferEvent::Started {
                file_index,
                file: file.clone(),
            });
            if file.size == 0 {
                self.observers.emit(TransferEvent::FileFinished { file_index });
            }
        }
        if self.all_sent() {
            return self.finish(TransferState::Finished);
        }

        let mut state_rx = self.state.subscribe();
        loop {
            let event = tokio::select! {
                event = events.recv() => Some(event),
                _ = state_rx.wait_for(|state| state.is_terminal()) => None,
            };
            // 로컬 취소
            let Some(event) = event else {
                return self.state();
            };
            let Some(event) = event else {
                return self.finish(TransferState::Error("프레임 서버 종료".into()));
            };

            match event {
                ServeEvent::Sent { fingerprint, bytes } => {
                    let Some(file_index) = self.index_of(&fingerprint) else {
                        continue;
                    };
                    let file = &self.files[file_index];
                    let total = self.sent[file_index].fetch_add(bytes, Ordering::AcqRel) + bytes;
                    self.observers.emit(TransferEvent::Progress {
                        file_index,
                        transferred: total,
                        total: file.size,
                    });
                    if total == file.size {
                        self.observers.emit(TransferEvent::FileFinished { file_index });
                    }
                    if self.all_sent() {
                        return self.finish(TransferState::Finished);
                    }
                }
                ServeEvent::RemoteCancel { fingerprint, reason } => {
                    if self.index_of(&fingerprint).is_none() {
                        continue;
                    }
                    for file in &self.files {
                        self.server.cancel_file(&file.fingerprint, false).await;
                    }
                    return self.finish(TransferState::RemoteError(reason));
                }
                ServeEvent::Failed {
                    fingerprint: Some(fingerprint),
                    error,
                } if self.index_of(&fingerprint).is_some() => {
                    let terminal = match self.await_remote_cancel(&mut events).await {
                        Some(reason) => TransferState::RemoteError(reason),
                        None => TransferState::Error(error),
                    };
                    for file in &self.files {
                        self.server.cancel_file(&file.fingerprint, false).await;
                    }
                    return self.finish(terminal);
                }
                ServeEvent::Failed { fingerprint, error } => {
                    debug!("다른 전송의 실패 보고: {:?}: {}", fingerprint, error);
                }
            }
        }
    }

    /// 로컬 취소: 상대에게 한 번만 알리고 모든 프레임 연결 종료
    pub async fn cancel(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        // 먼저 종단 상태로 바꿔 취소 중 들어오는 실패 보고가 상태를 덮지 않게 함
        if self.finish(TransferState::Canceled) != TransferState::Canceled {
            return false;
        }
        let mut notified = false;
        for file in &self.files {
            let outcome = self.server.cancel_file(&file.fingerprint, !notified).await;
            notified |= outcome.notified;
        }
        notified
    }

    /// 실패 보고 직후 한 heartbeat 간격 동안 원격 취소가 오는지 확인
    ///
    /// 상대의 종료 알림은 한 연결로만 오고 나머지 연결은 그냥 닫히므로
    /// 먼저 도착한 실패 보고보다 종료 알림을 우선함
    async fn await_remote_cancel(
        &self,
        events: &mut mpsc::UnboundedReceiver<ServeEvent>,
    ) -> Option<String> {
        let grace = tokio::time::sleep(self.server.config.heartbeat_interval());
        tokio::pin!(grace);

        loop {
            tokio::select! {
                _ = &mut grace => return None,
                event = events.recv() => match event {
                    Some(ServeEvent::RemoteCancel { fingerprint, reason })
                        if self.index_of(&fingerprint).is_some() =>
                    {
                        return Some(reason)
                    }
                    Some(_) => {}
                    None => return None,
                },
            }
        }
    }

    fn index_of(&self, fingerprint: &Fingerprint) -> Option<usize> {
        self.files
            .iter()
            .position(|file| &file.fingerprint == fingerprint)
    }

    fn all_sent(&self) -> bool {
        self.files
            .iter()
            .zip(&self.sent)
            .all(|(file, sent)| sent.load(Ordering::Acquire) >= file.size)
    }

    fn transition(&self, from: TransferState, to: TransferState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn finish(&self, terminal: TransferState) -> TransferState {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = terminal.clone();
                true
            }
        });
        if changed {
            info!("송신 세션 종료: {:?}", terminal);
            for file in &self.files {
                self.server.release(&file.fingerprint);
            }
            self.observers.emit(TransferEvent::Terminal(terminal));
        }
        self.state()
    }
}
