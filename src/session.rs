//! 전송 세션 공용 타입
//!
//! - `TransferState`: 세션 상태 (종단: Finished / Canceled / Error / RemoteError)
//! - `TransferEvent`: 관찰자에게 전달되는 이벤트
//! - `CancelRegistry`: 열린 프레임 연결 목록, 취소 시 종료 알림은 한 번만

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::ConnectionTask;
use crate::frame::Fingerprint;

/// 전송 파일 정보 (탐색 프로토콜로 교환)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferFile {
    pub fingerprint: Fingerprint,
    pub name: String,
    pub size: u64,
}

/// 세션 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    NotStarted,
    Started,
    Finished,
    /// 로컬 사용자 취소
    Canceled,
    /// 로컬 에러
    Error(String),
    /// 상대방이 전송을 끝냄
    RemoteError(String),
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Finished
                | TransferState::Canceled
                | TransferState::Error(_)
                | TransferState::RemoteError(_)
        )
    }
}

/// 전송 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// 파일 전송 시작
    Started { file_index: usize, file: TransferFile },
    /// 진행률 (파일 기준 누적 바이트)
    Progress {
        file_index: usize,
        transferred: u64,
        total: u64,
    },
    /// 파일 하나 완료
    FileFinished { file_index: usize },
    /// 세션 종료
    Terminal(TransferState),
}

/// 이벤트 관찰자 목록
pub struct Observers<E> {
    senders: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone> Observers<E> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    /// 모든 관찰자에게 전달 (끊긴 관찰자는 제거)
    pub fn emit(&self, event: E) {
        self.senders
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl<E: Clone> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

pub type TransferObservers = Observers<TransferEvent>;

/// 취소 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelOutcome {
    /// 닫은 연결 수
    pub closed: usize,
    /// 종료 알림을 보냈는지
    pub notified: bool,
}

/// 열린 연결 등록부
#[derive(Default)]
pub struct CancelRegistry {
    next_key: AtomicU64,
    connections: DashMap<u64, ConnectionTask>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: ConnectionTask) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(key, connection);
        key
    }

    pub fn unregister(&self, key: u64) {
        self.connections.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// 등록된 모든 연결 종료
    ///
    /// `notify_peer`이면 첫 번째로 알림에 성공한 연결만 종료 알림을 보내고,
    /// 상대가 그 연결을 닫은 뒤에 나머지를 조용히 닫음
    pub async fn cancel_all(&self, notify_peer: bool, reason: &str) -> CancelOutcome {
        let snapshot: Vec<(u64, ConnectionTask)> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (key, _) in &snapshot {
            self.connections.remove(key);
        }

        let mut outcome = CancelOutcome::default();
        for (_, connection) in snapshot {
            if notify_peer && !outcome.notified {
                outcome.notified = connection.finish_and_drain(reason).await;
            } else {
                connection.close(false).await;
            }
            outcome.closed += 1;
        }

        debug!(
            "연결 일괄 종료: closed={}, notified={}",
            outcome.closed, outcome.notified
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::connection::ConnectionRole;
    use crate::package::{Decoded, Package};
    use crate::Config;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_terminal_states() {
        assert!(!TransferState::NotStarted.is_terminal());
        assert!(!TransferState::Started.is_terminal());
        assert!(TransferState::Finished.is_terminal());
        assert!(TransferState::Canceled.is_terminal());
        assert!(TransferState::RemoteError("x".into()).is_terminal());
    }

    #[tokio::test]
    async fn test_observers_drop_closed_receivers() {
        let observers: Observers<u32> = Observers::new();
        let mut kept = observers.subscribe();
        let dropped = observers.subscribe();
        drop(dropped);

        observers.emit(1);
        observers.emit(2);
        assert_eq!(kept.recv().await, Some(1));
        assert_eq!(kept.recv().await, Some(2));
        assert_eq!(observers.senders.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_notifies_exactly_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Config {
            heartbeat_enabled: false,
            ..Config::default()
        };

        let registry = CancelRegistry::new();
        let notified_peer_gone = Arc::new(AtomicBool::new(false));
        let early_closes = Arc::new(AtomicUsize::new(0));
        let mut peers = Vec::new();
        for _ in 0..4 {
            let connection = ConnectionTask::new(ConnectionRole::TcpClient { server: addr }, config.clone());
            let (started, accepted) = tokio::join!(connection.start(), listener.accept());
            started.unwrap();
            registry.register(connection);

            // 알림을 받은 피어는 잠시 뒤 닫고, 나머지는 그 전에 닫히면 안 됨
            let mut peer = accepted.unwrap().0;
            let (gone, early) = (notified_peer_gone.clone(), early_closes.clone());
            peers.push(tokio::spawn(async move {
                let mut finishes = 0;
                loop {
                    match codec::read_package(&mut peer, 1024).await.unwrap() {
                        Some(Decoded::Package(Package::ServerFinish(reason))) => {
                            assert_eq!(reason, "cancel");
                            finishes += 1;
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            gone.store(true, Ordering::SeqCst);
                            return finishes;
                        }
                        Some(other) => panic!("unexpected: {:?}", other),
                        None => {
                            if !gone.load(Ordering::SeqCst) {
                                early.fetch_add(1, Ordering::SeqCst);
                            }
                            return finishes;
                        }
                    }
                }
            }));
        }

        let outcome = registry.cancel_all(true, "cancel").await;
        assert_eq!(outcome, CancelOutcome { closed: 4, notified: true });
        assert!(registry.is_empty());

        let mut finishes = 0;
        for peer in peers {
            finishes += peer.await.unwrap();
        }
        assert_eq!(finishes, 1);
        assert_eq!(early_closes.load(Ordering::SeqCst), 0);
    }
}
