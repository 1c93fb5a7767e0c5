//! 파일 프레임 분할
//!
//! 파일을 겹치지 않는 연속 바이트 범위(프레임)로 나누고,
//! 프레임마다 독립 연결로 병렬 전송함
//!
//! 분할 규칙 (S = 파일 크기, F = 최소 프레임 크기, C = 최대 연결 수):
//! - S ≤ F×C: 프레임 크기 F, 개수 ceil(S / F)
//! - 그 외: 프레임 크기 S / max(C−1, 1), 나머지가 있으면 C개 아니면 C−1개

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::MAX_CONNECTIONS;

/// 파일 식별자 (16바이트)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub const LEN: usize = 16;

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// 경로와 크기로 식별자 생성
    pub fn of_file(path: &Path, size: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(&size.to_be_bytes());
        let hash = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 파일 안의 바이트 범위 `[start, end)`
///
/// 수신측 파일 쓰기 오프셋은 `start`와 같음
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    /// 프레임 번호 (0부터)
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl FrameRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// 파일 크기에 대한 프레임 계획
pub fn plan_frames(file_size: u64, min_frame_size: u64, max_connections: usize) -> Vec<FrameRange> {
    if file_size == 0 {
        return Vec::new();
    }

    let connections = max_connections.clamp(1, MAX_CONNECTIONS) as u64;
    let min_frame_size = min_frame_size.max(1);

    let (frame_size, frame_count) = if file_size <= min_frame_size.saturating_mul(connections) {
        (min_frame_size, file_size.div_ceil(min_frame_size))
    } else {
        let frame_size = file_size / (connections - 1).max(1);
        let frame_count = if file_size % frame_size != 0 {
            connections
        } else {
            connections - 1
        };
        (frame_size, frame_count.max(1))
    };

    (0..frame_count)
        .map(|i| {
            let start = i * frame_size;
            let end = if i + 1 == frame_count {
                file_size
            } else {
                ((i + 1) * frame_size).min(file_size)
            };
            FrameRange {
                index: i as usize,
                start,
                end,
            }
        })
        .collect()
}

/// 프레임 요청: `fingerprint(16) ‖ start(u64 BE) ‖ end(u64 BE)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRequest {
    pub fingerprint: Fingerprint,
    pub start: u64,
    pub end: u64,
}

impl FrameRequest {
    pub const LEN: usize = Fingerprint::LEN + 8 + 8;

    pub fn new(fingerprint: Fingerprint, range: &FrameRange) -> Self {
        Self {
            fingerprint,
            start: range.start,
            end: range.end,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_slice(self.fingerprint.as_bytes());
        buf.put_u64(self.start);
        buf.put_u64(self.end);
        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }

        let mut fingerprint = [0u8; 16];
        fingerprint.copy_from_slice(&bytes[..16]);
        let mut rest = &bytes[16..];
        let start = rest.get_u64();
        let end = rest.get_u64();

        Some(Self {
            fingerprint: Fingerprint(fingerprint),
            start,
            end,
        })
    }
}
