//! # PFT (Parallel Frame Transfer)
//!
//! TCP 기반 P2P 파일 전송 코어
//!
//! ## 핵심 특징
//! - **길이 프레임 패키지**: `[u32 BE 길이][태그][본문]`, 인덱스 패키지는 자동 `Response`
//! - **연결 상태 머신**: NotStarted → Connecting → Active → Closed / Error
//! - **heartbeat + 유휴 타임아웃**: 조용한 상대는 `Timeout` 후 종료
//! - **병렬 프레임 전송**: 파일을 바이트 범위로 나눠 최대 15개 연결로 동시 전송
//! - **일괄 취소**: 종료 알림은 한 번만, 부분 파일 삭제
//! - **탐색 프로토콜**: JSON 봉투 요청/응답, 재전송 중복 감지(`is_new`)
//! - **UDP 검색**: 기기 알림 브로드캐스트와 연결 요청

pub mod buffer;
pub mod codec;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod discovery;
pub mod error;
pub mod explore;
pub mod frame;
pub mod heartbeat;
pub mod model;
pub mod package;
pub mod receiver;
pub mod sender;
pub mod session;

pub use buffer::{BufferPool, PooledBuffer};
pub use config::Config;
pub use connection::{CloseReason, ConnectionRole, ConnectionState, ConnectionTask, Side};
pub use discovery::{Announcement, BroadcastReceiver, BroadcastSender, ConnectRequestListener, RemoteDevice};
pub use error::{Error, Result};
pub use explore::{ExploreHandlers, ExploreOptions, ExploreRequestHandler, FileExplore};
pub use frame::{plan_frames, Fingerprint, FrameRange, FrameRequest};
pub use heartbeat::HeartbeatSupervisor;
pub use package::{Decoded, Package};
pub use receiver::{DownloadSession, FileDownloader};
pub use sender::{FrameServer, SendSession, ServeEvent};
pub use session::{TransferEvent, TransferFile, TransferState};

/// 탐색 프로토콜 버전
pub const EXPLORE_VERSION: u32 = 2;

/// 검색 알림 수신 포트
pub const BROADCAST_RECEIVER_PORT: u16 = 6666;

/// 연결 요청 포트
pub const BROADCAST_LISTENER_PORT: u16 = 6667;

/// 탐색 포트
pub const EXPLORE_PORT: u16 = 6668;

/// 프레임 전송 포트
pub const TRANSFER_PORT: u16 = 6669;

/// 네트워크 버퍼 크기 (바이트)
pub const NET_BUFFER_SIZE: usize = 512 * 1024; // 512KB

/// 파일당 최대 연결 수
pub const MAX_CONNECTIONS: usize = 15;

/// 최소 프레임 크기 (바이트)
pub const MIN_FRAME_SIZE: u64 = 10 * 1024 * 1024; // 10MB
