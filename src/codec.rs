//! 길이 프리픽스 프레이밍
//!
//! 스트림 소켓: `[u32 BE 본문 길이][tag][body]`
//! UDP: 데이터그램 경계가 길이를 대신함

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::package::{Decoded, Package};
use crate::{Error, Result};

/// 길이 프리픽스 크기
pub const LENGTH_PREFIX: usize = 4;

/// 패키지를 길이 프리픽스 프레임으로 인코딩
pub fn encode_frame(package: &Package, dst: &mut BytesMut, max_frame_len: usize) -> Result<()> {
    let body_len = package.encoded_len();
    if body_len > max_frame_len {
        return Err(Error::FrameTooLarge {
            len: body_len,
            max: max_frame_len,
        });
    }

    dst.reserve(LENGTH_PREFIX + body_len);
    dst.put_u32(body_len as u32);
    package.encode(dst)
}

/// 프레임 하나를 `scratch`에 인코딩한 뒤 기록
pub async fn write_frame<W>(
    writer: &mut W,
    package: &Package,
    scratch: &mut BytesMut,
    max_frame_len: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    scratch.clear();
    encode_frame(package, scratch, max_frame_len)?;
    writer.write_all(scratch).await?;
    writer.flush().await?;
    Ok(())
}

/// 프레임 하나를 읽음
///
/// 프레임 경계에서 스트림이 끝나면 `Ok(None)`
pub async fn read_frame<R>(reader: &mut R, max_frame_len: usize) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::TruncatedPackage {
                tag: 0,
                len: filled,
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame_len {
        return Err(Error::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }

    let mut body = BytesMut::zeroed(len);
    reader.read_exact(&mut body).await?;
    Ok(Some(body.freeze()))
}

/// 프레임 하나를 읽고 디코딩
pub async fn read_package<R>(reader: &mut R, max_frame_len: usize) -> Result<Option<Decoded>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, max_frame_len).await? {
        Some(frame) => Package::decode(frame).map(Some),
        None => Ok(None),
    }
}

/// UDP 데이터그램 인코딩 (길이 프리픽스 없음)
pub fn encode_datagram(package: &Package, dst: &mut BytesMut, max_frame_len: usize) -> Result<()> {
    let body_len = package.encoded_len();
    if body_len > max_frame_len {
        return Err(Error::FrameTooLarge {
            len: body_len,
            max: max_frame_len,
        });
    }
    package.encode(dst)
}

/// UDP 데이터그램 디코딩
pub fn decode_datagram(datagram: &[u8]) -> Result<Decoded> {
    Package::decode(Bytes::copy_from_slice(datagram))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024 * 1024;

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut scratch = BytesMut::new();

        let mut sent = Package::bytes(vec![7u8; 3000]);
        sent.stamp(3);

        let writer = {
            let sent = sent.clone();
            tokio::spawn(async move {
                write_frame(&mut client, &Package::HeartBeat, &mut scratch, MAX)
                    .await
                    .unwrap();
                write_frame(&mut client, &sent, &mut scratch, MAX)
                    .await
                    .unwrap();
            })
        };

        let first = read_package(&mut server, MAX).await.unwrap().unwrap();
        let second = read_package(&mut server, MAX).await.unwrap().unwrap();
        writer.await.unwrap();

        assert_eq!(first, Decoded::Package(Package::HeartBeat));
        assert_eq!(second, Decoded::Package(sent));
        // 쓰기측이 닫히면 경계에서 None
        assert!(read_frame(&mut server, MAX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_too_large_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(MAX as u32 + 1).to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut server, MAX).await,
            Err(Error::FrameTooLarge { .. })
        ));

        let mut scratch = BytesMut::new();
        let mut big = Package::bytes(vec![0u8; 100]);
        big.stamp(0);
        assert!(matches!(
            encode_frame(&big, &mut scratch, 50),
            Err(Error::FrameTooLarge { len: 105, max: 50 })
        ));
    }

    #[tokio::test]
    async fn test_truncated_prefix_is_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server, MAX).await,
            Err(Error::TruncatedPackage { len: 2, .. })
        ));
    }

    #[test]
    fn test_datagram_round_trip() {
        let mut buf = BytesMut::new();
        encode_datagram(&Package::ClientFinish("x".into()), &mut buf, MAX).unwrap();
        assert_eq!(
            decode_datagram(&buf).unwrap(),
            Decoded::Package(Package::ClientFinish("x".into()))
        );
    }
}
