//! 요청/응답 인덱스 매칭
//!
//! 연결마다 0부터 단조 증가하는 u32 인덱스를 부여하고,
//! 상대 코덱이 자동으로 돌려주는 `Response(index)`와 대기자를 짝지음

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::package::Package;
use crate::{Error, Result};

/// 연결별 인덱스 발급기 + 응답 대기 목록
#[derive(Debug, Default)]
pub struct PackageIndexer {
    next: AtomicU32,
    pending: DashMap<u32, oneshot::Sender<()>>,
    closed: AtomicBool,
}

/// 특정 인덱스의 응답 대기 핸들
#[derive(Debug)]
pub struct AckWaiter {
    index: u32,
    rx: oneshot::Receiver<()>,
}

impl AckWaiter {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl PackageIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 다음 인덱스 (u32 범위에서 순환)
    pub fn next_index(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// 인덱스 패키지에 인덱스 부여
    pub fn stamp(&self, package: &mut Package) -> Option<u32> {
        if !package.is_indexed() {
            return None;
        }
        let index = self.next_index();
        package.stamp(index);
        Some(index)
    }

    /// 전송 전에 대기 등록
    ///
    /// 이미 닫힌 발급기면 즉시 끊긴 대기자를 돌려줌
    pub fn register(&self, index: u32) -> AckWaiter {
        let (tx, rx) = oneshot::channel();
        if !self.closed.load(Ordering::Acquire) {
            self.pending.insert(index, tx);
            // register와 close가 겹친 경우
            if self.closed.load(Ordering::Acquire) {
                self.pending.remove(&index);
            }
        }
        AckWaiter { index, rx }
    }

    /// 수신한 Response 전달
    ///
    /// 대기자가 없는 인덱스는 무시하고 `false`
    pub fn notify_reply(&self, index: u32) -> bool {
        match self.pending.remove(&index) {
            Some((_, tx)) => tx.send(()).is_ok(),
            None => {
                trace!("대기자 없는 Response: index={}", index);
                false
            }
        }
    }

    /// 응답 대기
    pub async fn wait(&self, waiter: AckWaiter, timeout: Duration) -> Result<()> {
        let index = waiter.index;
        match tokio::time::timeout(timeout, waiter.rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&index);
                Err(Error::AckTimeout { index })
            }
        }
    }

    /// 대기 중인 인덱스 수
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 연결 종료: 모든 대기자를 끊음
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.clear();
    }
}
