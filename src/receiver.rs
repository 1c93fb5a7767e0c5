//! 수신자 (다운로드측)
//!
//! - 파일을 프레임으로 나누고 프레임마다 독립 연결로 병렬 수신
//! - 각 프레임은 자신의 파일 핸들로 `start + 받은 바이트` 위치에 기록
//! - 어느 프레임이든 실패하면 파일 전체를 취소 (프레임 단위 재시도 없음)
//! - 취소 시 종료 알림은 한 번만, 부분 파일은 삭제

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::connection::{CloseReason, ConnectionRole, ConnectionState, ConnectionTask};
use crate::frame::{plan_frames, FrameRange, FrameRequest};
use crate::package::Package;
use crate::session::{CancelRegistry, TransferEvent, TransferFile, TransferObservers, TransferState};
use crate::{Config, Error, Result};

/// 사용자 취소 시 상대에게 보내는 사유
const CANCEL_REASON: &str = "Client cancel";

/// 파일 하나의 멀티 연결 다운로드
pub struct FileDownloader {
    file: TransferFile,
    dest: PathBuf,
    peer: SocketAddr,
    config: Config,
    frames: Vec<FrameRange>,

    /// 파일 전체 누적 바이트
    progress: AtomicU64,

    /// 다운로드 진행 중 (완료 또는 취소 시 한 번만 false로 바뀜)
    active: AtomicBool,

    /// 열린 프레임 연결
    registry: CancelRegistry,

    /// 취소 원인 (완료면 None)
    cause: Mutex<Option<Error>>,

    done: watch::Sender<bool>,

    observers: Option<(Arc<TransferObservers>, usize)>,
}

impl FileDownloader {
    pub fn new(file: TransferFile, dest: PathBuf, peer: SocketAddr, config: Config) -> Self {
        let frames = plan_frames(file.size, config.min_frame_size, config.connection_count());
        let (done, _) = watch::channel(false);

        Self {
            file,
            dest,
            peer,
            config,
            frames,
            progress: AtomicU64::new(0),
            active: AtomicBool::new(true),
            registry: CancelRegistry::new(),
            cause: Mutex::new(None),
            done,
            observers: None,
        }
    }

    /// 진행률 이벤트를 세션 관찰자에게 전달
    pub fn with_observers(mut self, observers: Arc<TransferObservers>, file_index: usize) -> Self {
        self.observers = Some((observers, file_index));
        self
    }

    pub fn file(&self) -> &TransferFile {
        &self.file
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn frames(&self) -> &[FrameRange] {
        &self.frames
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    /// 현재 열린 프레임 연결 수
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// 다운로드 실행
    ///
    /// 완료되면 `Ok`, 취소되면 원인 에러 (부분 파일은 이미 삭제됨)
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if !self.is_done() {
            self.prepare().await?;
        }

        if self.file.size == 0 {
            self.complete();
        } else if !self.is_done() {
            info!(
                "다운로드 시작: {} ({} bytes, {} frames) from {}",
                self.file.name,
                self.file.size,
                self.frames.len(),
                self.peer
            );
            for frame in self.frames.iter().copied() {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.clone().run_frame(frame).await {
                        debug!("프레임 {} 실패: {}", frame.index, e);
                        this.fail_frame(e).await;
                    }
                });
            }
        }

        let mut done_rx = self.done.subscribe();
        let _ = done_rx.wait_for(|done| *done).await;

        match self.cause.lock().take() {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// 사용자 취소 (상대에게 한 번 알림)
    pub async fn cancel(&self) -> bool {
        self.try_cancel(true, Error::Canceled).await
    }

    /// 다운로드 취소 시도
    ///
    /// 이미 완료/취소되었으면 `false`. 완료와 경합해 모든 바이트가
    /// 이미 도착했으면 파일을 유지하고 성공으로 처리
    pub async fn try_cancel(&self, notify_peer: bool, cause: Error) -> bool {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if self.progress() >= self.file.size {
            debug!("취소가 완료와 경합: {} 유지", self.file.name);
            self.registry.cancel_all(false, CANCEL_REASON).await;
            self.done.send_replace(true);
            return false;
        }

        warn!("다운로드 취소: {}: {}", self.file.name, cause);
        let reason = match &cause {
            Error::Canceled => CANCEL_REASON.to_string(),
            other => other.to_string(),
        };
        *self.cause.lock() = Some(cause);

        let outcome = self.registry.cancel_all(notify_peer, &reason).await;
        debug!(
            "프레임 연결 종료: {} (notified={})",
            outcome.closed, outcome.notified
        );

        if let Err(e) = tokio::fs::remove_file(&self.dest).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("부분 파일 삭제 실패: {:?}: {}", self.dest, e);
            }
        }

        self.done.send_replace(true);
        true
    }

    /// 프레임 오류로 인한 취소 (상대에게 알리지 않음)
    ///
    /// 상대의 종료 알림은 한 연결로만 오고 나머지 연결은 그냥 닫히므로,
    /// 원인이 종료 알림이 아니면 한 heartbeat 간격만큼 기다려 알림이 먼저 기록되게 함
    async fn fail_frame(&self, cause: Error) {
        if !matches!(cause, Error::RemoteFinish(_)) && self.active.load(Ordering::Acquire) {
            tokio::time::sleep(self.config.heartbeat_interval()).await;
        }
        self.try_cancel(false, cause).await;
    }

    async fn prepare(&self) -> Result<()> {
        if let Some(parent) = self.dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&self.dest).await?;
        file.set_len(self.file.size).await?;
        file.sync_all().await?;
        Ok(())
    }

    fn complete(&self) {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!("다운로드 완료: {} ({} bytes)", self.file.name, self.file.size);
            self.done.send_replace(true);
        }
    }

    fn add_progress(&self, len: u64) {
        let total = self.progress.fetch_add(len, Ordering::AcqRel) + len;

        if let Some((observers, file_index)) = &self.observers {
            observers.emit(TransferEvent::Progress {
                file_index: *file_index,
                transferred: total,
                total: self.file.size,
            });
        }

        if total >= self.file.size {
            self.complete();
        }
    }

    async fn run_frame(self: Arc<Self>, frame: FrameRange) -> Result<()> {
        let connection = ConnectionTask::new(
            ConnectionRole::TcpClient { server: self.peer },
            self.config.clone(),
        );
        let mut inbound = connection.take_inbound().ok_or(Error::NotActive)?;

        let key = self.registry.register(connection.clone());
        // 등록 전에 취소된 경우
        if !self.active.load(Ordering::Acquire) {
            self.registry.unregister(key);
            connection.close(false).await;
            return Ok(());
        }

        let result = self.receive_frame(&connection, &mut inbound, frame).await;
        self.registry.unregister(key);
        result
    }

    async fn receive_frame(
        &self,
        connection: &ConnectionTask,
        inbound: &mut mpsc::Receiver<Package>,
        frame: FrameRange,
    ) -> Result<()> {
        connection.start().await?;

        let request = FrameRequest::new(self.file.fingerprint, &frame);
        connection.send(Package::bytes(request.to_bytes())).await?;

        let mut file = OpenOptions::new().write(true).open(&self.dest).await?;
        file.seek(SeekFrom::Start(frame.start)).await?;

        // heartbeat만 오고 데이터가 없는 상대도 끝나도록 패키지 사이 대기를 제한
        let stall = self.config.handshake_timeout();
        let mut received = 0u64;
        while received < frame.len() {
            let package = match tokio::time::timeout(stall, inbound.recv()).await {
                Ok(Some(package)) => package,
                Ok(None) => return Err(closed_cause(connection)),
                Err(_) => {
                    warn!("프레임 {}: {:?} 동안 데이터 없음", frame.index, stall);
                    connection.close(false).await;
                    return Err(Error::RequestTimeout);
                }
            };

            match package {
                Package::Bytes { payload, .. } => {
                    let len = payload.len() as u64;
                    if received + len > frame.len() {
                        return Err(Error::ProtocolViolation(format!(
                            "프레임 {} 범위 초과: {} + {} > {}",
                            frame.index,
                            received,
                            len,
                            frame.len()
                        )));
                    }
                    if !self.active.load(Ordering::Acquire) {
                        return Ok(());
                    }

                    file.write_all(&payload).await?;
                    file.flush().await?;
                    received += len;
                    self.add_progress(len);
                }
                Package::Timeout => return Err(Error::IdleTimeout),
                Package::ClientFinish(reason) | Package::ServerFinish(reason) => {
                    return Err(Error::RemoteFinish(reason))
                }
                other => debug!("프레임 {}: 무시한 패키지 {}", frame.index, other.name()),
            }
        }

        debug!("프레임 {} 완료: [{}, {})", frame.index, frame.start, frame.end);
        connection.close(false).await;
        Ok(())
    }
}

fn closed_cause(connection: &ConnectionTask) -> Error {
    match connection.state() {
        ConnectionState::Closed(CloseReason::RemoteFinish(reason)) => Error::RemoteFinish(reason),
        ConnectionState::Closed(CloseReason::IdleTimeout) => Error::IdleTimeout,
        ConnectionState::Error(cause) => Error::ProtocolViolation(cause),
        _ => Error::ConnectionClosed,
    }
}

/// 여러 파일을 순서대로 다운로드하는 세션
pub struct DownloadSession {
    files: Vec<TransferFile>,
    dest_dir: PathBuf,
    peer: SocketAddr,
    config: Config,
    state: watch::Sender<TransferState>,
    current_file_index: AtomicUsize,
    current: Mutex<Option<Arc<FileDownloader>>>,
    canceled: AtomicBool,
    observers: Arc<TransferObservers>,
}

impl DownloadSession {
    pub fn new(
        files: Vec<TransferFile>,
        dest_dir: impl Into<PathBuf>,
        peer: SocketAddr,
        config: Config,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(TransferState::NotStarted);
        Arc::new(Self {
            files,
            dest_dir: dest_dir.into(),
            peer,
            config,
            state,
            current_file_index: AtomicUsize::new(0),
            current: Mutex::new(None),
            canceled: AtomicBool::new(false),
            observers: Arc::new(TransferObservers::new()),
        })
    }

    pub fn files(&self) -> &[TransferFile] {
        &self.files
    }

    pub fn state(&self) -> TransferState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    /// 이벤트 구독
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        self.observers.subscribe()
    }

    pub fn current_file_index(&self) -> usize {
        self.current_file_index.load(Ordering::Acquire)
    }

    /// 현재 파일의 열린 연결 수
    pub fn active_connections(&self) -> usize {
        self.current
            .lock()
            .as_ref()
            .map(|downloader| downloader.active_connections())
            .unwrap_or(0)
    }

    /// 파일 이름을 대상 디렉터리 안의 경로로 변환
    pub fn dest_path(&self, file: &TransferFile) -> PathBuf {
        let name = Path::new(&file.name)
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| file.fingerprint.to_hex().into());
        self.dest_dir.join(name)
    }

    /// 세션 실행 (종단 상태 반환)
    pub async fn run(self: &Arc<Self>) -> TransferState {
        if !self.begin() {
            return self.state();
        }

        for (file_index, file) in self.files.iter().enumerate() {
            if self.canceled.load(Ordering::Acquire) {
                return self.finish(TransferState::Canceled);
            }

            self.current_file_index.store(file_index, Ordering::Release);
            self.observers.emit(TransferEvent::Started {
                file_index,
                file: file.clone(),
            });

            let downloader = Arc::new(
                FileDownloader::new(
                    file.clone(),
                    self.dest_path(file),
                    self.peer,
                    self.config.clone(),
                )
                .with_observers(self.observers.clone(), file_index),
            );
            *self.current.lock() = Some(downloader.clone());
            if self.canceled.load(Ordering::Acquire) {
                downloader.cancel().await;
            }

            let result = downloader.run().await;
            *self.current.lock() = None;

            match result {
                Ok(()) => self.observers.emit(TransferEvent::FileFinished { file_index }),
                Err(Error::Canceled) => return self.finish(TransferState::Canceled),
                Err(Error::RemoteFinish(reason)) => {
                    return self.finish(TransferState::RemoteError(reason))
                }
                Err(e) => return self.finish(TransferState::Error(e.to_string())),
            }
        }

        self.finish(TransferState::Finished)
    }

    /// 사용자 취소
    pub async fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        let current = self.current.lock().clone();
        if let Some(downloader) = current {
            downloader.cancel().await;
        }
    }

    fn begin(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, TransferState::NotStarted) {
                *state = TransferState::Started;
                true
            } else {
                false
            }
        })
    }

    fn finish(&self, terminal: TransferState) -> TransferState {
        info!("다운로드 세션 종료: {:?}", terminal);
        self.state.send_replace(terminal.clone());
        self.observers.emit(TransferEvent::Terminal(terminal.clone()));
        terminal
    }
}
