//! UDP 기기 검색
//!
//! - `BroadcastSender`: 주기적으로 `Announcement`를 브로드캐스트
//! - `BroadcastReceiver`: 알림을 모아 기기 목록 유지, 오래된 기기는 정리
//! - 연결 요청: `u32 BE 길이 ‖ UTF-8 기기 정보` → 1바이트 응답 (0x00 수락, 0x01 거절)

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BufMut;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::buffer::BufferPool;
use crate::{Config, Error, Result, EXPLORE_VERSION};

/// 연결 요청 응답: 수락
pub const CONNECT_ACCEPT: u8 = 0x00;
/// 연결 요청 응답: 거절
pub const CONNECT_DENY: u8 = 0x01;

/// 브로드캐스트 알림
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub version: u32,
    pub device_name: String,
}

impl Announcement {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            version: EXPLORE_VERSION,
            device_name: device_name.into(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// 알림 송신기
pub struct BroadcastSender {
    socket: UdpSocket,
    target: SocketAddr,
    announcement: Announcement,
    interval: Duration,
    pool: Arc<BufferPool>,
    running: AtomicBool,
}

impl BroadcastSender {
    /// `target`은 보통 브로드캐스트 주소와 브로드캐스트 포트
    pub async fn bind(
        bind: SocketAddr,
        target: SocketAddr,
        announcement: Announcement,
        config: &Config,
        pool: Arc<BufferPool>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|source| Error::ConnectFailed {
                addr: bind.to_string(),
                source,
            })?;
        socket.set_broadcast(true)?;

        Ok(Arc::new(Self {
            socket,
            target,
            announcement,
            interval: config.broadcast_interval(),
            pool,
            running: AtomicBool::new(true),
        }))
    }

    /// 알림 한 번 전송
    pub async fn announce_once(&self) -> Result<()> {
        let mut buf = self.pool.acquire().await;
        bincode::serialize_into((&mut *buf).writer(), &self.announcement)?;
        self.socket.send_to(&buf, self.target).await?;
        trace!("알림 전송: {} -> {}", self.announcement.device_name, self.target);
        Ok(())
    }

    /// `stop`까지 주기적으로 전송
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let sender = self.clone();
        tokio::spawn(async move {
            info!("브로드캐스트 시작: {}", sender.target);
            while sender.running.load(Ordering::SeqCst) {
                if let Err(e) = sender.announce_once().await {
                    warn!("브로드캐스트 실패: {}", e);
                }
                tokio::time::sleep(sender.interval).await;
            }
            info!("브로드캐스트 중지");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// 검색된 기기
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    pub addr: SocketAddr,
    pub device_name: String,
    pub version: u32,
    pub last_seen: Instant,
}

/// 알림 수신기
pub struct BroadcastReceiver {
    socket: UdpSocket,
    devices: DashMap<IpAddr, RemoteDevice>,
    published: watch::Sender<Vec<RemoteDevice>>,
    device_timeout: Duration,
    prune_interval: Duration,
    pool: Arc<BufferPool>,
    running: AtomicBool,
}

impl BroadcastReceiver {
    pub async fn bind(bind: SocketAddr, config: &Config, pool: Arc<BufferPool>) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|source| Error::ConnectFailed {
                addr: bind.to_string(),
                source,
            })?;
        let (published, _) = watch::channel(Vec::new());

        Ok(Arc::new(Self {
            socket,
            devices: DashMap::new(),
            published,
            device_timeout: config.device_timeout(),
            prune_interval: config.prune_interval(),
            pool,
            running: AtomicBool::new(true),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 기기 목록 변경 구독
    pub fn subscribe(&self) -> watch::Receiver<Vec<RemoteDevice>> {
        self.published.subscribe()
    }

    /// 현재 기기 목록 (주소순)
    pub fn devices(&self) -> Vec<RemoteDevice> {
        let mut devices: Vec<RemoteDevice> = self
            .devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        devices.sort_by_key(|device| device.addr);
        devices
    }

    /// 알림 기록. 목록이 바뀌었으면 `true` (시각만 갱신되면 `false`)
    pub fn record(&self, from: SocketAddr, announcement: Announcement, now: Instant) -> bool {
        let device = RemoteDevice {
            addr: from,
            device_name: announcement.device_name,
            version: announcement.version,
            last_seen: now,
        };
        let changed = match self.devices.insert(from.ip(), device.clone()) {
            None => {
                info!("기기 발견: {} ({})", device.device_name, from);
                true
            }
            Some(previous) => previous.device_name != device.device_name || previous.addr != device.addr,
        };
        if changed {
            self.publish();
        }
        changed
    }

    /// 오래된 기기 제거. 제거한 수를 돌려줌
    pub fn prune(&self, now: Instant) -> usize {
        let before = self.devices.len();
        let timeout = self.device_timeout;
        self.devices
            .retain(|_, device| now.saturating_duration_since(device.last_seen) <= timeout);
        let removed = before.saturating_sub(self.devices.len());

        if removed > 0 {
            debug!("기기 {}개 정리", removed);
            self.publish();
        }
        removed
    }

    fn publish(&self) {
        self.published.send_replace(self.devices());
    }

    /// `stop`까지 수신과 정리 반복
    ///
    /// 대기 중에는 버퍼를 잡지 않음. 읽을 데이터그램이 있을 때만 풀에서 빌림
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let receiver = self.clone();
        tokio::spawn(async move {
            let mut prune = tokio::time::interval(receiver.prune_interval);

            while receiver.running.load(Ordering::SeqCst) {
                let ready = tokio::select! {
                    ready = receiver.socket.readable() => Some(ready),
                    _ = prune.tick() => None,
                };
                match ready {
                    Some(Ok(())) => receiver.receive_one().await,
                    Some(Err(e)) => warn!("알림 수신 에러: {}", e),
                    None => {
                        receiver.prune(Instant::now());
                    }
                }
            }
            info!("알림 수신 중지");
        })
    }

    /// 데이터그램 하나 처리. 버퍼는 처리 직후 반납
    async fn receive_one(&self) {
        let mut buf = self.pool.acquire().await;
        buf.resize(self.pool.buffer_size(), 0);
        match self.socket.try_recv_from(&mut buf[..]) {
            Ok((n, from)) => self.on_datagram(&buf[..n], from),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("알림 수신 에러: {}", e),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn on_datagram(&self, datagram: &[u8], from: SocketAddr) {
        match Announcement::from_bytes(datagram) {
            Ok(announcement) if announcement.version == EXPLORE_VERSION => {
                self.record(from, announcement, Instant::now());
            }
            Ok(announcement) => debug!(
                "버전이 다른 알림 무시: {} (version={})",
                from, announcement.version
            ),
            Err(e) => debug!("알림 해석 실패: {}: {}", from, e),
        }
    }
}

/// 연결 요청 리스너 (알림을 보내는 쪽)
pub struct ConnectRequestListener {
    listener: TcpListener,
    pool: Arc<BufferPool>,
    timeout: Duration,
}

impl ConnectRequestListener {
    pub async fn bind(bind: SocketAddr, config: &Config, pool: Arc<BufferPool>) -> Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| Error::ConnectFailed {
                addr: bind.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            pool,
            timeout: config.handshake_timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 요청마다 `decide(주소, 기기 정보)`로 수락 여부 결정
    pub async fn serve<F>(self, decide: F)
    where
        F: Fn(SocketAddr, String) -> bool + Send + Sync + 'static,
    {
        let decide = Arc::new(decide);
        let this = Arc::new(self);
        loop {
            let (stream, peer) = match this.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("연결 요청 accept 에러: {}", e);
                    continue;
                }
            };

            let this = this.clone();
            let decide = decide.clone();
            tokio::spawn(async move {
                let handled = tokio::time::timeout(
                    this.timeout,
                    this.handle(stream, peer, &*decide),
                )
                .await;
                match handled {
                    Ok(Ok(accepted)) => debug!("연결 요청 {}: {}", peer, accepted),
                    Ok(Err(e)) => debug!("연결 요청 처리 실패: {}: {}", peer, e),
                    Err(_) => debug!("연결 요청 타임아웃: {}", peer),
                }
            });
        }
    }

    async fn handle<F>(&self, mut stream: TcpStream, peer: SocketAddr, decide: &F) -> Result<bool>
    where
        F: Fn(SocketAddr, String) -> bool,
    {
        let len = stream.read_u32().await? as usize;
        let mut buf = self.pool.acquire().await;
        let kept = len.min(self.pool.buffer_size());
        buf.resize(kept, 0);
        stream.read_exact(&mut buf[..]).await?;

        // 버퍼보다 긴 정보는 잘라내고 나머지는 버림
        let rest = (len - kept) as u64;
        if rest > 0 {
            let mut remainder = (&mut stream).take(rest);
            tokio::io::copy(&mut remainder, &mut tokio::io::sink()).await?;
        }

        let info = String::from_utf8_lossy(&buf).into_owned();
        let accepted = decide(peer, info);
        let reply = if accepted { CONNECT_ACCEPT } else { CONNECT_DENY };
        stream.write_u8(reply).await?;
        stream.flush().await?;
        Ok(accepted)
    }
}

/// 연결 요청 전송. 수락되면 `true`
pub async fn request_connect(addr: SocketAddr, info: &str, timeout: Duration) -> Result<bool> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|source| Error::ConnectFailed {
                addr: addr.to_string(),
                source,
            })?;
        stream.write_u32(info.len() as u32).await?;
        stream.write_all(info.as_bytes()).await?;
        stream.flush().await?;

        match stream.read_u8().await? {
            CONNECT_ACCEPT => Ok(true),
            CONNECT_DENY => Ok(false),
            other => Err(Error::ProtocolViolation(format!(
                "연결 요청 응답 바이트: {:#04x}",
                other
            ))),
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::RequestTimeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            device_timeout_ms: 1_000,
            prune_interval_ms: 50,
            ..Config::default()
        }
    }

    fn small_pool() -> Arc<BufferPool> {
        BufferPool::new(4, 1024)
    }

    #[tokio::test]
    async fn test_prune_removes_stale_devices() {
        let receiver = BroadcastReceiver::bind("127.0.0.1:0".parse().unwrap(), &test_config(), small_pool())
            .await
            .unwrap();
        let mut devices_rx = receiver.subscribe();
        let start = Instant::now();

        assert!(receiver.record("10.0.0.1:6666".parse().unwrap(), Announcement::new("old"), start));
        assert!(receiver.record(
            "10.0.0.2:6666".parse().unwrap(),
            Announcement::new("fresh"),
            start + Duration::from_millis(900),
        ));
        assert_eq!(devices_rx.borrow_and_update().len(), 2);

        let removed = receiver.prune(start + Duration::from_millis(1_500));
        assert_eq!(removed, 1);
        let devices = devices_rx.borrow_and_update().clone();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_name, "fresh");
    }

    #[tokio::test]
    async fn test_repeated_announcement_refreshes_only() {
        let receiver = BroadcastReceiver::bind("127.0.0.1:0".parse().unwrap(), &test_config(), small_pool())
            .await
            .unwrap();
        let from: SocketAddr = "10.0.0.1:6666".parse().unwrap();
        let start = Instant::now();

        assert!(receiver.record(from, Announcement::new("a"), start));
        assert!(!receiver.record(from, Announcement::new("a"), start + Duration::from_millis(800)));
        assert_eq!(receiver.prune(start + Duration::from_millis(1_500)), 0);
    }

    #[tokio::test]
    async fn test_loopback_announcement_discovered() {
        let config = test_config();
        let receiver = BroadcastReceiver::bind("127.0.0.1:0".parse().unwrap(), &config, small_pool())
            .await
            .unwrap();
        let target = receiver.local_addr().unwrap();
        let task = receiver.spawn();

        let sender = BroadcastSender::bind(
            "127.0.0.1:0".parse().unwrap(),
            target,
            Announcement::new("laptop"),
            &config,
            small_pool(),
        )
        .await
        .unwrap();
        sender.announce_once().await.unwrap();

        let mut devices_rx = receiver.subscribe();
        let devices = tokio::time::timeout(
            Duration::from_secs(2),
            devices_rx.wait_for(|devices| !devices.is_empty()),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(devices[0].device_name, "laptop");
        assert_eq!(devices[0].addr.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());

        receiver.stop();
        task.abort();
    }

    #[tokio::test]
    async fn test_receiver_returns_buffer_between_datagrams() {
        let config = test_config();
        let pool = BufferPool::new(1, 1024);
        let receiver = BroadcastReceiver::bind("127.0.0.1:0".parse().unwrap(), &config, pool.clone())
            .await
            .unwrap();
        let target = receiver.local_addr().unwrap();
        let task = receiver.spawn();

        // 대기 중인 수신 루프가 하나뿐인 버퍼를 잡고 있으면 안 됨
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.available(), 1);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut devices_rx = receiver.subscribe();
        for name in ["first", "second"] {
            let payload = bincode::serialize(&Announcement::new(name)).unwrap();
            socket.send_to(&payload, target).await.unwrap();
            tokio::time::timeout(
                Duration::from_secs(2),
                devices_rx.wait_for(|devices| devices.iter().any(|d| d.device_name == name)),
            )
            .await
            .unwrap()
            .unwrap();
            assert_eq!(pool.available(), 1);
        }

        receiver.stop();
        task.abort();
    }

    #[tokio::test]
    async fn test_connect_request_accept_and_deny() {
        let listener = ConnectRequestListener::bind("127.0.0.1:0".parse().unwrap(), &test_config(), small_pool())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(listener.serve(|_peer, info| info == "friend"));

        let timeout = Duration::from_secs(2);
        assert!(request_connect(addr, "friend", timeout).await.unwrap());
        assert!(!request_connect(addr, "stranger", timeout).await.unwrap());
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_request_info_truncated_to_buffer() {
        let listener = ConnectRequestListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            &test_config(),
            BufferPool::new(1, 8),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(String::new()));
        let server = {
            let seen = seen.clone();
            tokio::spawn(listener.serve(move |_peer, info| {
                *seen.lock() = info;
                true
            }))
        };

        assert!(request_connect(addr, "abcdefghijklmnop", Duration::from_secs(2))
            .await
            .unwrap());
        assert_eq!(*seen.lock(), "abcdefgh");
        server.abort();
    }
}
