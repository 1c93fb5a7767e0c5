//! 탐색 프로토콜 메시지 모델
//!
//! 모든 메시지는 `Json` 패키지 하나에 봉투로 담겨 전송됨:
//! `{"id": u64, "kind": "request"|"response", "message": {"type": .., "payload": ..}}`

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::session::TransferFile;
use crate::{Error, Result, MAX_CONNECTIONS};

/// 핸드셰이크 (버전, 경로 구분자, 기기 이름)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u32,
    pub path_separator: String,
    pub device_name: String,
}

impl Handshake {
    pub fn local(device_name: impl Into<String>) -> Self {
        Self {
            version: crate::EXPLORE_VERSION,
            path_separator: std::path::MAIN_SEPARATOR.to_string(),
            device_name: device_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    pub name: String,
    pub path: String,
    pub child_count: u64,
    /// unix 밀리초
    pub last_modify: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub last_modify: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFolder {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShareFolder {
    pub path: String,
    pub folders: Vec<RemoteFolder>,
    pub files: Vec<RemoteFile>,
}

/// 상대에게 파일 전송을 요청
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFiles {
    pub files: Vec<RemoteFile>,
    /// 수신측이 고른 최대 연결 수
    pub max_connections: usize,
}

impl RequestFiles {
    /// 요청한 연결 수를 로컬 한도로 제한 (1 ~ 15)
    pub fn accepted_connections(&self, local_limit: usize) -> usize {
        self.max_connections
            .min(local_limit)
            .clamp(1, MAX_CONNECTIONS)
    }
}

/// 전송할 파일과 프레임 서버 포트
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareFiles {
    pub files: Vec<TransferFile>,
    pub transfer_port: u16,
    /// 파일당 사용할 연결 수 (요청값을 송신측 한도로 제한한 값)
    pub max_connections: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
}

/// 탐색 메시지 (닫힌 합 타입)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ExploreMessage {
    Handshake(Handshake),
    RequestFolder(RequestFolder),
    ShareFolder(ShareFolder),
    RequestFiles(RequestFiles),
    ShareFiles(ShareFiles),
    Message(ChatMessage),
}

impl ExploreMessage {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ExploreMessage::Handshake(_) => "handshake",
            ExploreMessage::RequestFolder(_) => "request_folder",
            ExploreMessage::ShareFolder(_) => "share_folder",
            ExploreMessage::RequestFiles(_) => "request_files",
            ExploreMessage::ShareFiles(_) => "share_files",
            ExploreMessage::Message(_) => "message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request,
    Response,
}

/// 요청/응답 봉투. 응답은 요청의 `id`를 그대로 씀
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExploreEnvelope {
    pub id: u64,
    pub kind: EnvelopeKind,
    pub message: ExploreMessage,
}

impl ExploreEnvelope {
    pub fn request(id: u64, message: ExploreMessage) -> Self {
        Self {
            id,
            kind: EnvelopeKind::Request,
            message,
        }
    }

    pub fn response(id: u64, message: ExploreMessage) -> Self {
        Self {
            id,
            kind: EnvelopeKind::Response,
            message,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// 상대가 보낸 경로를 공유 루트 안의 로컬 경로로 해석
///
/// 빈 경로는 루트. `..`나 심볼릭 링크로 루트 밖을 가리키면 `OutsideRoot`
pub fn resolve_shared_path(root: &Path, requested: &str) -> Result<PathBuf> {
    let root = root.canonicalize()?;
    let relative = requested.trim_start_matches(['/', '\\']);
    let resolved = root.join(relative).canonicalize()?;

    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(Error::OutsideRoot(requested.to_string()))
    }
}

fn unix_millis(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// 로컬 디렉터리 목록 (이름순)
///
/// 탐색 핸들러가 블로킹 스레드에서 부름. 읽을 수 없는 항목은 건너뜀
pub fn scan_folder(path: &Path) -> Result<ShareFolder> {
    let mut folders = Vec::new();
    let mut files = Vec::new();

    for entry in std::fs::read_dir(path)? {
        let Ok(entry) = entry else { continue };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let entry_path = entry.path().to_string_lossy().into_owned();

        if metadata.is_dir() {
            let child_count = std::fs::read_dir(entry.path())
                .map(|children| children.count() as u64)
                .unwrap_or(0);
            folders.push(RemoteFolder {
                name,
                path: entry_path,
                child_count,
                last_modify: unix_millis(&metadata),
            });
        } else if metadata.is_file() {
            files.push(RemoteFile {
                name,
                path: entry_path,
                size: metadata.len(),
                last_modify: unix_millis(&metadata),
            });
        }
    }

    folders.sort_by(|a, b| a.name.cmp(&b.name));
    files.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(ShareFolder {
        path: path.to_string_lossy().into_owned(),
        folders,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Fingerprint;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = ExploreEnvelope::request(
            7,
            ExploreMessage::RequestFolder(RequestFolder { path: "/tmp".into() }),
        );
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(value["id"], 7);
        assert_eq!(value["kind"], "request");
        assert_eq!(value["message"]["type"], "request_folder");
        assert_eq!(value["message"]["payload"]["path"], "/tmp");
    }

    #[test]
    fn test_share_files_parses() {
        let fingerprint = Fingerprint::from_bytes([1; 16]);
        let text = format!(
            r#"{{"id":3,"kind":"response","message":{{"type":"share_files","payload":{{"files":[{{"fingerprint":"{}","name":"a.txt","size":10}}],"transfer_port":6669,"max_connections":8}}}}}}"#,
            fingerprint
        );
        let envelope = ExploreEnvelope::from_json(&text).unwrap();

        assert_eq!(envelope.kind, EnvelopeKind::Response);
        match envelope.message {
            ExploreMessage::ShareFiles(share) => {
                assert_eq!(share.transfer_port, 6669);
                assert_eq!(share.max_connections, 8);
                assert_eq!(share.files[0].fingerprint, fingerprint);
                assert_eq!(share.files[0].size, 10);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let text = r#"{"id":1,"kind":"request","message":{"type":"format_disk","payload":{}}}"#;
        assert!(matches!(
            ExploreEnvelope::from_json(text),
            Err(crate::Error::Json(_))
        ));
    }

    #[test]
    fn test_accepted_connections_capped() {
        let request = |max_connections| RequestFiles {
            files: Vec::new(),
            max_connections,
        };
        assert_eq!(request(15).accepted_connections(8), 8);
        assert_eq!(request(4).accepted_connections(15), 4);
        assert_eq!(request(0).accepted_connections(15), 1);
        assert_eq!(request(100).accepted_connections(100), MAX_CONNECTIONS);
    }

    #[test]
    fn test_resolve_shared_path_stays_in_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("share");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub").join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("secret.txt"), b"s").unwrap();

        let canonical = root.canonicalize().unwrap();
        assert_eq!(resolve_shared_path(&root, "").unwrap(), canonical);
        assert_eq!(
            resolve_shared_path(&root, "/sub/a.txt").unwrap(),
            canonical.join("sub").join("a.txt")
        );
        assert_eq!(
            resolve_shared_path(&root, "sub/../sub/a.txt").unwrap(),
            canonical.join("sub").join("a.txt")
        );

        for escape in ["../secret.txt", "/sub/../../secret.txt", "sub/../.."] {
            assert!(
                matches!(resolve_shared_path(&root, escape), Err(Error::OutsideRoot(_))),
                "{}",
                escape
            );
        }
        assert!(matches!(
            resolve_shared_path(&root, "missing.txt"),
            Err(Error::Io(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_shared_path_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("share");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(dir.path().join("secret.txt"), b"s").unwrap();
        std::os::unix::fs::symlink(dir.path().join("secret.txt"), root.join("link")).unwrap();

        assert!(matches!(
            resolve_shared_path(&root, "link"),
            Err(Error::OutsideRoot(_))
        ));
    }

    #[test]
    fn test_scan_folder_lists_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("x"), b"1").unwrap();

        let folder = scan_folder(dir.path()).unwrap();

        assert_eq!(folder.folders.len(), 1);
        assert_eq!(folder.folders[0].name, "sub");
        assert_eq!(folder.folders[0].child_count, 1);
        let names: Vec<_> = folder.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(folder.files[1].size, 5);
        assert!(folder.files[1].last_modify > 0);
    }
}
