//! PFT 서버 (송신자) - Parallel Frame Transfer
//!
//! 탐색 요청에 답하고 요청받은 파일을 프레임 서버로 병렬 전송
//! - 폴더 목록 / 파일 전송 요청 / 채팅 메시지 처리
//! - 선택적으로 UDP 알림 브로드캐스트 + 연결 요청 수락
//!
//! 사용법:
//!   cargo run --release --bin pft-server -- [OPTIONS]
//!
//! 예시:
//!   # 현재 디렉터리 공유
//!   cargo run --release --bin pft-server -- --root .
//!
//!   # 검색 가능하게 공유
//!   cargo run --release --bin pft-server -- -r ~/share --name desk --broadcast

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pft::discovery::{Announcement, BroadcastSender, ConnectRequestListener};
use pft::explore::{ExploreHandlers, ExploreOptions, FileExplore};
use pft::model::{resolve_shared_path, scan_folder, ChatMessage, RequestFiles, RequestFolder, ShareFiles};
use pft::{BufferPool, Config, FrameServer, SendSession, TransferState};

/// 서버 설정
struct ServerConfig {
    bind_ip: IpAddr,
    root: PathBuf,
    device_name: String,
    broadcast: bool,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            root: PathBuf::from("."),
            device_name: "pft-server".to_string(),
            broadcast: false,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_ip = args[i + 1].parse().expect("유효한 IP 필요");
                    i += 1;
                }
            }
            "--root" | "-r" => {
                if i + 1 < args.len() {
                    config.root = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    config.device_name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--explore-port" => {
                if i + 1 < args.len() {
                    config.config.explore_port = args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--transfer-port" => {
                if i + 1 < args.len() {
                    config.config.transfer_port = args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--chunk-size" => {
                if i + 1 < args.len() {
                    config.config.transfer_chunk_size =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--broadcast" => {
                config.broadcast = true;
            }
            "--low-spec" => {
                config.config = Config {
                    explore_port: config.config.explore_port,
                    transfer_port: config.config.transfer_port,
                    ..Config::low_spec()
                };
            }
            "--unstable" => {
                config.config = Config {
                    explore_port: config.config.explore_port,
                    transfer_port: config.config.transfer_port,
                    ..Config::unstable_network()
                };
            }
            "--help" | "-h" => {
                println!(
                    r#"PFT Server - Parallel Frame Transfer 서버

탐색 요청에 답하고 파일을 여러 TCP 연결로 병렬 전송
- 폴더 목록 / 파일 전송 요청 / 채팅 메시지
- UDP 알림 브로드캐스트 (선택)

사용법:
  cargo run --release --bin pft-server -- [OPTIONS]

옵션:
  -b, --bind <IP>           바인드 IP (기본: 0.0.0.0)
  -r, --root <DIR>          공유 루트 디렉터리 (기본: .)
  -n, --name <NAME>         기기 이름 (기본: pft-server)
  --explore-port <PORT>     탐색 포트 (기본: 6668)
  --transfer-port <PORT>    전송 포트 (기본: 6669)
  --chunk-size <SIZE>       전송 청크 크기 바이트 (기본: 65536)
  --broadcast               UDP 알림 브로드캐스트 + 연결 요청 수락
  --low-spec                저사양 기기 설정
  --unstable                불안정 네트워크 설정
  -h, --help                이 도움말 출력

로그 레벨은 RUST_LOG로 조정 (기본: info)

예시:
  cargo run --release --bin pft-server -- --root ~/share --broadcast
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

fn handlers(root: PathBuf, frame_server: Arc<FrameServer>, config: &Config) -> ExploreHandlers {
    let runtime = tokio::runtime::Handle::current();
    let transfer_port = config.transfer_port;
    let local_limit = config.connection_count();

    let folder_root = root.clone();
    ExploreHandlers::new()
        .on_request_folder(move |_is_new: bool, request: RequestFolder| {
            let path = match resolve_shared_path(&folder_root, &request.path) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Folder request rejected: {:?}: {}", request.path, e);
                    return None;
                }
            };
            match scan_folder(&path) {
                Ok(mut folder) => {
                    // 상대에게는 루트 기준 경로만 보임
                    let base = request.path.trim_end_matches('/');
                    for entry in &mut folder.folders {
                        entry.path = format!("{}/{}", base, entry.name);
                    }
                    for entry in &mut folder.files {
                        entry.path = format!("{}/{}", base, entry.name);
                    }
                    folder.path = request.path;
                    Some(folder)
                }
                Err(e) => {
                    warn!("Folder listing failed: {:?}: {}", path, e);
                    None
                }
            }
        })
        .on_request_files(move |is_new: bool, request: RequestFiles| {
            let mut files = Vec::with_capacity(request.files.len());
            for remote in &request.files {
                let path = match resolve_shared_path(&root, &remote.path) {
                    Ok(path) => path,
                    Err(e) => {
                        warn!("File request rejected: {:?}: {}", remote.path, e);
                        continue;
                    }
                };
                match runtime.block_on(frame_server.share(&path)) {
                    Ok(file) => files.push(file),
                    Err(e) => warn!("Cannot share {:?}: {}", path, e),
                }
            }

            // 재전송된 요청이면 같은 응답만 다시 보냄. 세션이 없으니 공유 참조는 바로 반납
            if !is_new {
                for file in &files {
                    frame_server.release(&file.fingerprint);
                }
            } else if !files.is_empty() {
                let session = SendSession::new(frame_server.clone(), files.clone());
                runtime.spawn(async move {
                    let state = session.run().await;
                    match state {
                        TransferState::Finished => info!("Send session finished"),
                        other => warn!("Send session ended: {:?}", other),
                    }
                });
            }

            Some(ShareFiles {
                files,
                transfer_port,
                max_connections: request.accepted_connections(local_limit),
            })
        })
        .on_message(|_is_new: bool, message: ChatMessage| {
            info!("Message: {}", message.text);
            Some(message)
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();
    let config = server_config.config.clone();
    config.validate()?;

    info!("PFT Server starting...");
    info!("Shared root: {:?}", server_config.root);
    info!("Device name: {}", server_config.device_name);
    info!("Max connections per file: {}", config.connection_count());

    let pool = BufferPool::from_config(&config);
    let ip = server_config.bind_ip;

    // 프레임 서버
    let frame_server = FrameServer::bind(SocketAddr::new(ip, config.transfer_port), config.clone()).await?;
    info!("Transfer port: {}", frame_server.local_addr());

    // 검색 알림 + 연결 요청
    if server_config.broadcast {
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), config.broadcast_port);
        let sender = BroadcastSender::bind(
            SocketAddr::new(ip, 0),
            target,
            Announcement::new(server_config.device_name.clone()),
            &config,
            pool.clone(),
        )
        .await?;
        sender.spawn();

        let requests = ConnectRequestListener::bind(
            SocketAddr::new(ip, config.connect_request_port),
            &config,
            pool.clone(),
        )
        .await?;
        tokio::spawn(requests.serve(|peer, info| {
            info!("Connect request from {}: {}", peer, info);
            true
        }));
        info!("Broadcasting to {}", target);
    }

    // 탐색 연결
    let listener = TcpListener::bind(SocketAddr::new(ip, config.explore_port)).await?;
    info!("Explore listening on {}", listener.local_addr()?);

    let options = ExploreOptions::new(config.clone(), server_config.device_name.clone())
        .with_handlers(handlers(server_config.root.clone(), frame_server.clone(), &config))
        .with_buffer_pool(pool.clone());

    // 핸드셰이크는 연결마다 별도 태스크에서 진행
    let mut accepted = FileExplore::listen(listener, options);

    loop {
        tokio::select! {
            explore = accepted.recv() => {
                let Some(explore) = explore else { break };
                let peer = explore
                    .remote_handshake()
                    .map(|handshake| handshake.device_name)
                    .unwrap_or_default();
                info!("Explore connected: {}", peer);
                tokio::spawn(async move {
                    let state = explore.wait_closed().await;
                    info!("Explore closed: {} ({:?})", peer, state);
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    frame_server.stop();
    Ok(())
}
