//! PFT 클라이언트 (수신자) - Parallel Frame Transfer
//!
//! 서버 폴더를 탐색하고 파일을 여러 TCP 연결로 병렬 다운로드
//! - 파일마다 프레임 계획에 따라 최대 15개 연결
//! - Ctrl-C로 취소 (서버에 한 번 알림, 부분 파일 삭제)
//!
//! 사용법:
//!   cargo run --release --bin pft-client -- [OPTIONS]
//!
//! 예시:
//!   # 서버 루트의 모든 파일 다운로드
//!   cargo run --release --bin pft-client -- --server 192.168.0.10 --output ./received
//!
//!   # 주변 서버 검색
//!   cargo run --release --bin pft-client -- --discover 3

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pft::discovery::{request_connect, BroadcastReceiver};
use pft::explore::{ExploreOptions, FileExplore};
use pft::{BufferPool, Config, DownloadSession, TransferEvent, TransferState};

/// 클라이언트 설정
struct ClientConfig {
    server_ip: IpAddr,
    remote_path: String,
    output_dir: PathBuf,
    device_name: String,
    files: Vec<String>,
    discover_secs: Option<u64>,
    connect_request: bool,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            remote_path: String::new(),
            output_dir: PathBuf::from("."),
            device_name: "pft-client".to_string(),
            files: Vec::new(),
            discover_secs: None,
            connect_request: false,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_ip = args[i + 1].parse().expect("유효한 IP 필요");
                    i += 1;
                }
            }
            "--path" | "-p" => {
                if i + 1 < args.len() {
                    config.remote_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    config.device_name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.files.push(args[i + 1].clone());
                    i += 1;
                }
            }
            "--connections" | "-c" => {
                if i + 1 < args.len() {
                    config.config.max_connections = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--explore-port" => {
                if i + 1 < args.len() {
                    config.config.explore_port = args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--discover" => {
                if i + 1 < args.len() {
                    config.discover_secs = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--connect-request" => {
                config.connect_request = true;
            }
            "--low-spec" => {
                config.config = Config {
                    explore_port: config.config.explore_port,
                    ..Config::low_spec()
                };
            }
            "--unstable" => {
                config.config = Config {
                    explore_port: config.config.explore_port,
                    ..Config::unstable_network()
                };
            }
            "--help" | "-h" => {
                println!(
                    r#"PFT Client - Parallel Frame Transfer 클라이언트

서버 폴더를 탐색하고 파일을 여러 TCP 연결로 병렬 다운로드

사용법:
  cargo run --release --bin pft-client -- [OPTIONS]

옵션:
  -s, --server <IP>         서버 IP (기본: 127.0.0.1)
  -p, --path <PATH>         서버 공유 루트 기준 폴더 (기본: 루트)
  -o, --output <DIR>        저장 디렉터리 (기본: .)
  -n, --name <NAME>         기기 이름 (기본: pft-client)
  -f, --file <NAME>         받을 파일 이름 (여러 번 지정 가능, 기본: 폴더의 모든 파일)
  -c, --connections <N>     파일당 최대 연결 수 1~15 (기본: 15)
  --explore-port <PORT>     탐색 포트 (기본: 6668)
  --discover <SECS>         SECS초 동안 주변 서버 검색 후 종료
  --connect-request         탐색 전에 연결 요청을 보내고 수락을 기다림
  --low-spec                저사양 기기 설정
  --unstable                불안정 네트워크 설정
  -h, --help                이 도움말 출력

로그 레벨은 RUST_LOG로 조정 (기본: info)

예시:
  cargo run --release --bin pft-client -- -s 192.168.0.10 -f movie.mkv -o ./downloads
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

async fn discover(config: &Config, secs: u64) -> Result<(), Box<dyn std::error::Error>> {
    let pool = BufferPool::from_config(config);
    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.broadcast_port);
    let receiver = BroadcastReceiver::bind(bind, config, pool).await?;
    let task = receiver.spawn();

    info!("Discovering for {}s on {}...", secs, bind);
    tokio::time::sleep(Duration::from_secs(secs)).await;
    receiver.stop();
    task.abort();

    let devices = receiver.devices();
    if devices.is_empty() {
        info!("No devices found");
    }
    for device in devices {
        info!("  {} ({})", device.device_name, device.addr.ip());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = parse_args();
    let config = client_config.config.clone();
    config.validate()?;

    if let Some(secs) = client_config.discover_secs {
        return discover(&config, secs).await;
    }

    info!("PFT Client starting...");
    info!("Server: {}", client_config.server_ip);
    info!("Output directory: {:?}", client_config.output_dir);

    if client_config.connect_request {
        let addr = SocketAddr::new(client_config.server_ip, config.connect_request_port);
        info!("Sending connect request to {}...", addr);
        if !request_connect(addr, &client_config.device_name, config.handshake_timeout()).await? {
            warn!("Connect request denied");
            return Ok(());
        }
    }

    // 탐색 연결
    let explore_addr = SocketAddr::new(client_config.server_ip, config.explore_port);
    let options = ExploreOptions::new(config.clone(), client_config.device_name.clone())
        .with_buffer_pool(BufferPool::from_config(&config));
    let explore = FileExplore::connect(explore_addr, options).await?;
    if let Some(remote) = explore.remote_handshake() {
        info!("Connected to {} (version {})", remote.device_name, remote.version);
    }

    let folder = explore.request_folder(client_config.remote_path.clone()).await?;
    info!(
        "Remote folder {:?}: {} folders, {} files",
        folder.path,
        folder.folders.len(),
        folder.files.len()
    );

    let wanted: Vec<_> = folder
        .files
        .into_iter()
        .filter(|file| client_config.files.is_empty() || client_config.files.contains(&file.name))
        .collect();
    if wanted.is_empty() {
        info!("Nothing to download");
        explore.close().await;
        return Ok(());
    }

    let share = explore
        .request_files(wanted, config.connection_count())
        .await?;
    let total: u64 = share.files.iter().map(|file| file.size).sum();
    info!("Downloading {} files ({} bytes)", share.files.len(), total);

    // 다운로드 세션
    let peer = SocketAddr::new(client_config.server_ip, share.transfer_port);
    // 송신측이 허용한 연결 수만큼만 프레임 분할
    let download_config = Config {
        max_connections: share.max_connections,
        ..config.clone()
    };
    let session = DownloadSession::new(share.files, client_config.output_dir.clone(), peer, download_config);
    let mut events = session.subscribe();
    let progress_task = tokio::spawn(async move {
        let mut last_report = Instant::now();
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Started { file_index, file } => {
                    info!("[{}] {} ({} bytes)", file_index, file.name, file.size);
                }
                TransferEvent::Progress {
                    file_index,
                    transferred,
                    total,
                } => {
                    if last_report.elapsed() >= Duration::from_secs(1) || transferred == total {
                        last_report = Instant::now();
                        info!(
                            "[{}] Progress: {:.1}%",
                            file_index,
                            transferred as f64 / total.max(1) as f64 * 100.0
                        );
                    }
                }
                TransferEvent::FileFinished { file_index } => info!("[{}] Done", file_index),
                TransferEvent::Terminal(_) => break,
            }
        }
    });

    let start = Instant::now();
    let mut running = {
        let session = session.clone();
        tokio::spawn(async move { session.run().await })
    };
    let state = tokio::select! {
        state = &mut running => state?,
        _ = tokio::signal::ctrl_c() => {
            info!("Canceling...");
            session.cancel().await;
            running.await?
        }
    };
    let _ = progress_task.await;
    explore.close().await;

    match state {
        TransferState::Finished => {
            let elapsed = start.elapsed();
            let throughput = total as f64 / elapsed.as_secs_f64().max(0.001) / 1_000_000.0;
            info!("Transfer complete!");
            info!("  Time: {:.2}s", elapsed.as_secs_f64());
            info!("  Throughput: {:.2} MB/s", throughput);
            Ok(())
        }
        other => Err(format!("transfer ended: {:?}", other).into()),
    }
}
