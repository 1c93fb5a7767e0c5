//! 프로토콜 설정

use std::time::Duration;

use crate::{
    Error, Result, BROADCAST_LISTENER_PORT, BROADCAST_RECEIVER_PORT, EXPLORE_PORT,
    MAX_CONNECTIONS, MIN_FRAME_SIZE, NET_BUFFER_SIZE, TRANSFER_PORT,
};

/// PFT 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 디바이스 발견 브로드캐스트 포트
    pub broadcast_port: u16,

    /// 연결 요청 수신 포트
    pub connect_request_port: u16,

    /// 파일 탐색 포트
    pub explore_port: u16,

    /// 멀티 연결 전송 포트
    pub transfer_port: u16,

    /// 연결마다 heartbeat 태스크 실행
    pub heartbeat_enabled: bool,

    /// Heartbeat 전송 간격 (밀리초)
    pub heartbeat_interval_ms: u64,

    /// 유휴 타임아웃 = heartbeat 간격 × 배수
    pub idle_timeout_multiplier: u32,

    /// Response 대기 타임아웃 (밀리초)
    pub ack_timeout_ms: u64,

    /// 탐색 핸드셰이크 타임아웃 (밀리초)
    pub handshake_timeout_ms: u64,

    /// 탐색 요청 응답 타임아웃 (밀리초)
    pub request_timeout_ms: u64,

    /// 탐색 요청 재전송 횟수 (ack 타임아웃 시)
    pub request_retries: u32,

    /// 연결 재시도 횟수
    pub connect_retry_attempts: u32,

    /// 연결 재시도 간격 (밀리초)
    pub connect_retry_backoff_ms: u64,

    /// 최소 프레임 크기 (바이트)
    pub min_frame_size: u64,

    /// 파일당 최대 동시 연결 수 (1 ~ 15)
    pub max_connections: usize,

    /// 전송 시 Bytes 패키지 하나의 최대 크기
    pub transfer_chunk_size: usize,

    /// 허용하는 최대 프레임 길이 (길이 프리픽스 제외)
    pub max_frame_len: usize,

    /// 연결별 수신 큐 크기
    pub inbound_queue_size: usize,

    /// 버퍼 풀 크기
    pub buffer_pool_size: usize,

    /// 풀 버퍼 하나의 크기
    pub buffer_size: usize,

    /// 브로드캐스트 간격 (밀리초)
    pub broadcast_interval_ms: u64,

    /// 발견된 디바이스 만료 시간 (밀리초)
    pub device_timeout_ms: u64,

    /// 만료 디바이스 정리 주기 (밀리초)
    pub prune_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broadcast_port: BROADCAST_RECEIVER_PORT,
            connect_request_port: BROADCAST_LISTENER_PORT,
            explore_port: EXPLORE_PORT,
            transfer_port: TRANSFER_PORT,
            heartbeat_enabled: true,
            heartbeat_interval_ms: 2000,        // 2초
            idle_timeout_multiplier: 3,         // 6초 무응답 시 타임아웃
            ack_timeout_ms: 12_000,             // 12초
            handshake_timeout_ms: 20_000,       // 20초
            request_timeout_ms: 20_000,
            request_retries: 2,
            connect_retry_attempts: 3,
            connect_retry_backoff_ms: 200,
            min_frame_size: MIN_FRAME_SIZE,     // 10MB
            max_connections: MAX_CONNECTIONS,   // 15
            transfer_chunk_size: 64 * 1024,     // 64KB
            max_frame_len: 8 * 1024 * 1024,     // 8MB
            inbound_queue_size: 256,
            buffer_pool_size: 100,
            buffer_size: NET_BUFFER_SIZE,       // 512KB
            broadcast_interval_ms: 300,
            device_timeout_ms: 5000,
            prune_interval_ms: 2000,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// 마지막 수신 후 이 시간이 지나면 Timeout
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.idle_timeout_multiplier
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_retry_backoff_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    /// 수신측이 사용할 연결 수 (1 ~ 15로 제한)
    pub fn connection_count(&self) -> usize {
        self.max_connections.clamp(1, MAX_CONNECTIONS)
    }

    /// 설정 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig("heartbeat_interval_ms는 0일 수 없음".into()));
        }
        if self.idle_timeout_multiplier < 2 {
            return Err(Error::InvalidConfig(
                "idle_timeout_multiplier는 2 이상이어야 함".into(),
            ));
        }
        if self.min_frame_size == 0 {
            return Err(Error::InvalidConfig("min_frame_size는 0일 수 없음".into()));
        }
        if self.max_connections == 0 || self.max_connections > MAX_CONNECTIONS {
            return Err(Error::InvalidConfig(format!(
                "max_connections는 1 ~ {} 범위여야 함: {}",
                MAX_CONNECTIONS, self.max_connections
            )));
        }
        if self.transfer_chunk_size == 0 || self.transfer_chunk_size + 5 > self.max_frame_len {
            return Err(Error::InvalidConfig(format!(
                "transfer_chunk_size({})가 max_frame_len({})을 넘음",
                self.transfer_chunk_size, self.max_frame_len
            )));
        }
        if self.buffer_pool_size == 0 || self.buffer_size == 0 {
            return Err(Error::InvalidConfig("버퍼 풀 크기는 0일 수 없음".into()));
        }
        if self.inbound_queue_size == 0 {
            return Err(Error::InvalidConfig("inbound_queue_size는 0일 수 없음".into()));
        }
        Ok(())
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            max_connections: 4,
            transfer_chunk_size: 32 * 1024,     // 32KB
            max_frame_len: 2 * 1024 * 1024,     // 2MB
            inbound_queue_size: 64,
            buffer_pool_size: 16,
            buffer_size: 128 * 1024,            // 128KB
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            heartbeat_interval_ms: 3000,
            idle_timeout_multiplier: 5,         // 15초
            ack_timeout_ms: 20_000,
            handshake_timeout_ms: 30_000,
            request_timeout_ms: 30_000,
            request_retries: 4,
            connect_retry_attempts: 5,
            connect_retry_backoff_ms: 500,
            max_connections: 8,
            transfer_chunk_size: 16 * 1024,     // 작은 청크
            device_timeout_ms: 10_000,
            ..Self::default()
        }
    }
}
