//! 재사용 버퍼 풀
//!
//! - 생성 시 고정 개수의 버퍼를 미리 할당
//! - `acquire`: 빈 버퍼가 생길 때까지 태스크만 대기
//! - `acquire_blocking`: OS 스레드를 블로킹 (blocking 풀 전용)
//! - 반환된 가드가 drop 되면 버퍼를 비우고 풀로 되돌림

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use tokio::sync::Notify;

use crate::Config;

/// 고정 크기 버퍼 풀
pub struct BufferPool {
    free_tx: Sender<BytesMut>,
    free_rx: Receiver<BytesMut>,
    /// 버퍼 반납 알림 (async 대기자용)
    released: Notify,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    /// `capacity`개의 `buffer_size` 바이트 버퍼로 풀 생성
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (free_tx, free_rx) = bounded(capacity);
        for _ in 0..capacity {
            // 용량이 capacity와 같으므로 실패하지 않음
            let _ = free_tx.try_send(BytesMut::with_capacity(buffer_size));
        }

        Arc::new(Self {
            free_tx,
            free_rx,
            released: Notify::new(),
            buffer_size,
            capacity,
        })
    }

    pub fn from_config(config: &Config) -> Arc<Self> {
        Self::new(config.buffer_pool_size, config.buffer_size)
    }

    /// 버퍼 하나의 크기
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// 전체 버퍼 수
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 현재 빌려줄 수 있는 버퍼 수
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    /// 대기 없이 버퍼 획득
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledBuffer> {
        match self.free_rx.try_recv() {
            Ok(buf) => Some(PooledBuffer::new(self.clone(), buf)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// 버퍼가 반납될 때까지 태스크를 일시 중단
    pub async fn acquire(self: &Arc<Self>) -> PooledBuffer {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // 검사 전에 등록해야 반납 알림을 놓치지 않음
            notified.as_mut().enable();

            if let Some(buf) = self.try_acquire() {
                return buf;
            }
            notified.await;
        }
    }

    /// 버퍼가 반납될 때까지 현재 스레드를 블로킹
    ///
    /// 런타임 워커 스레드에서 호출하면 안 됨 (`spawn_blocking` 안에서 사용)
    pub fn acquire_blocking(self: &Arc<Self>) -> PooledBuffer {
        // 풀이 송신단을 들고 있으므로 recv는 끊기지 않음
        let buf = self
            .free_rx
            .recv()
            .unwrap_or_else(|_| BytesMut::with_capacity(self.buffer_size));
        PooledBuffer::new(self.clone(), buf)
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() < self.buffer_size {
            buf.reserve(self.buffer_size);
        }
        if self.free_tx.try_send(buf).is_ok() {
            self.released.notify_one();
        }
    }
}

/// 풀에서 빌린 버퍼 (drop 시 자동 반납)
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    buf: BytesMut,
}

impl PooledBuffer {
    fn new(pool: Arc<BufferPool>, buf: BytesMut) -> Self {
        Self { pool, buf }
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
