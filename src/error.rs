//! 에러 타입 정의

use thiserror::Error;

/// PFT 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 에러: {0}")]
    Json(#[from] serde_json::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("연결 실패: {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("응답 대기 타임아웃: index={index}")]
    AckTimeout { index: u32 },

    #[error("유휴 타임아웃")]
    IdleTimeout,

    #[error("프로토콜 위반: {0}")]
    ProtocolViolation(String),

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u32, got: u32 },

    #[error("잘린 패키지: tag={tag:#04x}, len={len}")]
    TruncatedPackage { tag: u8, len: usize },

    #[error("프레임 크기 초과: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("인덱스가 없는 패키지는 응답을 기다릴 수 없음")]
    NotAcknowledgeable,

    #[error("이미 시작된 연결")]
    AlreadyStarted,

    #[error("연결이 활성 상태가 아님")]
    NotActive,

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("전송 취소됨")]
    Canceled,

    #[error("상대방 종료: {0}")]
    RemoteFinish(String),

    #[error("공유되지 않은 파일: {0}")]
    FileNotShared(String),

    #[error("공유 루트 밖의 경로: {0}")]
    OutsideRoot(String),

    #[error("유효하지 않은 범위: [{start}, {end}) / size={size}")]
    InvalidRange { start: u64, end: u64, size: u64 },

    #[error("요청 응답 타임아웃")]
    RequestTimeout,

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// 연결 자체를 끝내야 하는 프로토콜 오류인지
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_)
                | Error::InvalidVersion { .. }
                | Error::TruncatedPackage { .. }
                | Error::FrameTooLarge { .. }
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
