//! Heartbeat 감독 태스크
//!
//! 연결이 활성인 동안 주기적으로 `HeartBeat`를 보내고,
//! 활성이 아니게 되면 조용히 종료. 유휴 감지는 연결의 읽기 기한이 담당

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

use crate::connection::ConnectionTask;
use crate::package::Package;

/// 연결당 하나의 heartbeat 루프
pub struct HeartbeatSupervisor;

impl HeartbeatSupervisor {
    /// 설정된 간격으로 heartbeat 루프 시작
    pub fn spawn(connection: ConnectionTask) -> JoinHandle<()> {
        let interval = connection.config().heartbeat_interval();
        Self::spawn_with_interval(connection, interval)
    }

    pub fn spawn_with_interval(connection: ConnectionTask, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut state_rx = connection.subscribe_state();

            while connection.is_active() {
                if let Err(e) = connection.send(Package::HeartBeat).await {
                    trace!("heartbeat 중단: {}", e);
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = state_rx.wait_for(|state| state.is_terminal()) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::connection::ConnectionRole;
    use crate::package::Decoded;
    use crate::Config;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_beats_while_active_and_stops_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Config {
            heartbeat_interval_ms: 20,
            idle_timeout_multiplier: 100,
            ..Config::default()
        };
        let client = ConnectionTask::new(ConnectionRole::TcpClient { server: addr }, config);
        let (started, accepted) = tokio::join!(client.start(), listener.accept());
        started.unwrap();
        let (mut raw, _) = accepted.unwrap();

        let mut beats = 0;
        while beats < 3 {
            match codec::read_package(&mut raw, 1024).await.unwrap() {
                Some(Decoded::Package(crate::Package::HeartBeat)) => beats += 1,
                other => panic!("unexpected: {:?}", other),
            }
        }

        client.close(false).await;
        // 종료 후에는 EOF까지 heartbeat만 남아 있을 수 있음
        loop {
            match codec::read_package(&mut raw, 1024).await.unwrap() {
                Some(Decoded::Package(crate::Package::HeartBeat)) => continue,
                None => break,
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_exits_when_not_active() {
        let config = Config::default();
        let connection = ConnectionTask::new(
            ConnectionRole::TcpClient {
                server: "127.0.0.1:9".parse().unwrap(),
            },
            config,
        );
        let handle = HeartbeatSupervisor::spawn_with_interval(connection, Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
