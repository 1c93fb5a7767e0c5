//! 와이어 패키지 정의
//!
//! 본문 레이아웃: `[1바이트 태그][본문]`
//! - 인덱스가 있는 패키지: `[u32 BE index][payload]`
//! - Finish 패키지: UTF-8 사유 문자열
//! - Response: `[u32 BE index]`
//!
//! 길이 프리픽스는 [`crate::codec`]에서 붙임

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// 패키지 태그
pub mod tag {
    pub const HEARTBEAT: u8 = 0x00;
    pub const CLIENT_FINISH: u8 = 0x01;
    pub const SERVER_FINISH: u8 = 0x02;
    pub const BYTES: u8 = 0x03;
    pub const JSON: u8 = 0x04;
    pub const TEXT: u8 = 0x05;
    pub const RESPONSE: u8 = 0x06;
}

/// 와이어 교환 단위
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Package {
    /// 생존 확인 (본문 없음)
    HeartBeat,

    /// 서버측이 클라이언트에게 보내는 종료 알림
    ClientFinish(String),

    /// 클라이언트측이 서버에게 보내는 종료 알림
    ServerFinish(String),

    /// 바이너리 데이터
    Bytes { payload: Bytes, index: Option<u32> },

    /// JSON 텍스트
    Json { text: String, index: Option<u32> },

    /// 일반 텍스트
    Text { text: String, index: Option<u32> },

    /// 인덱스 패키지 수신 확인
    Response(u32),

    /// 유휴 타임아웃 (로컬에서만 생성, 전송 불가)
    Timeout,
}

/// 디코딩 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Package(Package),
    /// 알 수 없는 태그: 원본 프레임을 그대로 전달
    Unrecognized { tag: u8, raw: Bytes },
}

impl Package {
    pub fn bytes(payload: impl Into<Bytes>) -> Self {
        Package::Bytes {
            payload: payload.into(),
            index: None,
        }
    }

    pub fn json(text: impl Into<String>) -> Self {
        Package::Json {
            text: text.into(),
            index: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Package::Text {
            text: text.into(),
            index: None,
        }
    }

    /// 태그 값
    pub fn tag(&self) -> Option<u8> {
        match self {
            Package::HeartBeat => Some(tag::HEARTBEAT),
            Package::ClientFinish(_) => Some(tag::CLIENT_FINISH),
            Package::ServerFinish(_) => Some(tag::SERVER_FINISH),
            Package::Bytes { .. } => Some(tag::BYTES),
            Package::Json { .. } => Some(tag::JSON),
            Package::Text { .. } => Some(tag::TEXT),
            Package::Response(_) => Some(tag::RESPONSE),
            Package::Timeout => None,
        }
    }

    /// 로그용 이름
    pub fn name(&self) -> &'static str {
        match self {
            Package::HeartBeat => "HeartBeat",
            Package::ClientFinish(_) => "ClientFinish",
            Package::ServerFinish(_) => "ServerFinish",
            Package::Bytes { .. } => "Bytes",
            Package::Json { .. } => "Json",
            Package::Text { .. } => "Text",
            Package::Response(_) => "Response",
            Package::Timeout => "Timeout",
        }
    }

    /// 응답을 요구하는 패키지인지
    pub fn is_indexed(&self) -> bool {
        matches!(
            self,
            Package::Bytes { .. } | Package::Json { .. } | Package::Text { .. }
        )
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Package::ClientFinish(_) | Package::ServerFinish(_))
    }

    pub fn index(&self) -> Option<u32> {
        match self {
            Package::Bytes { index, .. }
            | Package::Json { index, .. }
            | Package::Text { index, .. } => *index,
            Package::Response(index) => Some(*index),
            _ => None,
        }
    }

    /// 전송 시 인덱스 부여 (인덱스 패키지가 아니면 무시)
    pub fn stamp(&mut self, new_index: u32) {
        if let Package::Bytes { index, .. }
        | Package::Json { index, .. }
        | Package::Text { index, .. } = self
        {
            *index = Some(new_index);
        }
    }

    /// 태그 포함 본문 길이
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Package::HeartBeat | Package::Timeout => 0,
            Package::ClientFinish(reason) | Package::ServerFinish(reason) => reason.len(),
            Package::Bytes { payload, .. } => 4 + payload.len(),
            Package::Json { text, .. } | Package::Text { text, .. } => 4 + text.len(),
            Package::Response(_) => 4,
        }
    }

    /// `[tag][body]`를 `dst` 뒤에 기록
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let tag = self.tag().ok_or_else(|| {
            Error::ProtocolViolation("Timeout 패키지는 전송할 수 없음".into())
        })?;

        if self.is_indexed() && self.index().is_none() {
            return Err(Error::ProtocolViolation(format!(
                "인덱스가 부여되지 않은 {} 패키지",
                self.name()
            )));
        }

        dst.reserve(self.encoded_len());
        dst.put_u8(tag);

        match self {
            Package::HeartBeat | Package::Timeout => {}
            Package::ClientFinish(reason) | Package::ServerFinish(reason) => {
                dst.put_slice(reason.as_bytes());
            }
            Package::Bytes { payload, index } => {
                dst.put_u32(index.unwrap_or_default());
                dst.put_slice(payload);
            }
            Package::Json { text, index } | Package::Text { text, index } => {
                dst.put_u32(index.unwrap_or_default());
                dst.put_slice(text.as_bytes());
            }
            Package::Response(index) => dst.put_u32(*index),
        }

        Ok(())
    }

    /// `[tag][body]` 프레임 디코딩
    pub fn decode(frame: Bytes) -> Result<Decoded> {
        if frame.is_empty() {
            return Err(Error::TruncatedPackage { tag: 0, len: 0 });
        }

        let raw = frame.clone();
        let mut body = frame;
        let tag = body.get_u8();

        let package = match tag {
            tag::HEARTBEAT => Package::HeartBeat,
            tag::CLIENT_FINISH => Package::ClientFinish(utf8(tag, body)?),
            tag::SERVER_FINISH => Package::ServerFinish(utf8(tag, body)?),
            tag::BYTES => {
                let index = read_index(tag, &mut body, raw.len())?;
                Package::Bytes {
                    payload: body,
                    index: Some(index),
                }
            }
            tag::JSON => {
                let index = read_index(tag, &mut body, raw.len())?;
                Package::Json {
                    text: utf8(tag, body)?,
                    index: Some(index),
                }
            }
            tag::TEXT => {
                let index = read_index(tag, &mut body, raw.len())?;
                Package::Text {
                    text: utf8(tag, body)?,
                    index: Some(index),
                }
            }
            tag::RESPONSE => {
                let index = read_index(tag, &mut body, raw.len())?;
                if body.has_remaining() {
                    return Err(Error::ProtocolViolation(format!(
                        "Response 본문 길이 불일치: {}",
                        raw.len()
                    )));
                }
                Package::Response(index)
            }
            other => return Ok(Decoded::Unrecognized { tag: other, raw }),
        };

        Ok(Decoded::Package(package))
    }
}

fn read_index(tag: u8, body: &mut Bytes, len: usize) -> Result<u32> {
    if body.remaining() < 4 {
        return Err(Error::TruncatedPackage { tag, len });
    }
    Ok(body.get_u32())
}

fn utf8(tag: u8, body: Bytes) -> Result<String> {
    String::from_utf8(body.to_vec())
        .map_err(|e| Error::ProtocolViolation(format!("tag {:#04x}: UTF-8 아님: {}", tag, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(package: Package) -> Package {
        let mut buf = BytesMut::new();
        package.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), package.encoded_len());
        match Package::decode(buf.freeze()).unwrap() {
            Decoded::Package(p) => p,
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_every_variant() {
        let mut bytes = Package::bytes(vec![1u8, 2, 3]);
        bytes.stamp(7);
        let mut json = Package::json(r#"{"a":1}"#);
        json.stamp(0);
        let mut text = Package::text("안녕");
        text.stamp(u32::MAX);

        for package in [
            Package::HeartBeat,
            Package::ClientFinish("bye".into()),
            Package::ServerFinish(String::new()),
            bytes,
            json,
            text,
            Package::Response(42),
        ] {
            assert_eq!(round_trip(package.clone()), package);
        }
    }

    #[test]
    fn test_round_trip_payload_sizes() {
        for len in [0usize, 1, crate::NET_BUFFER_SIZE] {
            let mut package = Package::bytes(vec![0xA5u8; len]);
            package.stamp(len as u32);
            assert_eq!(round_trip(package.clone()), package);
        }
    }

    #[test]
    fn test_wire_layout() {
        let mut package = Package::text("hi");
        package.stamp(0x01020304);
        let mut buf = BytesMut::new();
        package.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[tag::TEXT, 1, 2, 3, 4, b'h', b'i']);

        let mut buf = BytesMut::new();
        Package::Response(5).encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[tag::RESPONSE, 0, 0, 0, 5]);
    }

    #[test]
    fn test_unknown_tag_passthrough() {
        let raw = Bytes::from_static(&[0x7F, 9, 9]);
        match Package::decode(raw.clone()).unwrap() {
            Decoded::Unrecognized { tag, raw: got } => {
                assert_eq!(tag, 0x7F);
                assert_eq!(got, raw);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_index_is_error() {
        let raw = Bytes::from_static(&[tag::BYTES, 0, 1]);
        assert!(matches!(
            Package::decode(raw),
            Err(Error::TruncatedPackage { tag: tag::BYTES, .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_is_violation() {
        let raw = Bytes::from_static(&[tag::JSON, 0, 0, 0, 1, 0xFF, 0xFE]);
        assert!(Package::decode(raw).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_unstamped_and_timeout_rejected() {
        let mut buf = BytesMut::new();
        assert!(Package::bytes(vec![1u8]).encode(&mut buf).is_err());
        assert!(Package::Timeout.encode(&mut buf).is_err());
        assert!(buf.is_empty());
    }
}
