//! 릴레이의 런타임 설정과 경계 글루(로그 싱크, PID 파일).
//!
//! 커맨드라인/환경 변수 파싱 자체는 바이너리 쪽('src/bin/server.rs')의 몫이고,
//! 이 모듈은 파싱된 결과가 도착하는 'Config'와 그 기본값, 그리고 프로세스
//! 수명에 묶인 부수 파일들을 정의한다.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::time::Duration;
use tracing::warn;

/// 핸드셰이크 오프닝 블록의 기본 크기(바이트).
pub const DEFAULT_BUFSIZE: usize = 250;

/// 핸드셰이크 전체(배너 전송 + 블록 읽기)에 허용하는 시한.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// 디스패처가 sweep을 수행하는 최대 주기.
pub const SELECT_TIMEOUT: Duration = Duration::from_secs(15);

/// 릴레이 동작을 결정하는 런타임 설정.
///
/// 모든 필드는 원본 리피터의 플래그와 1:1로 대응한다. 테스트는 임의 필드를
/// 덮어쓴 'Config'를 'server::run'에 직접 넘긴다.
#[derive(Debug, Clone)]
pub struct Config {
    /// 클라이언트(뷰어) 리스닝 포트.
    pub client_port: u16,

    /// 서버 측 리스닝 포트.
    pub server_port: u16,

    /// 오프닝 블록 크기. 이보다 적게 읽히면 프로토콜 위반이다.
    pub buf_size: usize,

    /// 같은 역할 충돌 시 신규 커넥션을 거절할지(true), 기존을 교체할지(false).
    pub refuse: bool,

    /// 상대측이 사라진 파킹 엔트리를 주기적으로 퇴거시킬지 여부.
    pub clean: bool,

    /// 클라이언트에게 보내는 RFB 배너를 생략한다.
    pub no_rfb: bool,

    /// 핸드셰이크 시한.
    pub init_timeout: Duration,

    /// sweep 주기 상한.
    pub select_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            client_port: crate::DEFAULT_CLIENT_PORT,
            server_port: crate::DEFAULT_SERVER_PORT,
            buf_size: DEFAULT_BUFSIZE,
            refuse: false,
            clean: true,
            no_rfb: false,
            init_timeout: INIT_TIMEOUT,
            select_timeout: SELECT_TIMEOUT,
        }
    }
}

/// '-L' 플래그가 고르는 프로세스 수명 주기 모드.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// 워커가 비정상 종료하면 1초 백오프 후 다시 띄운다.
    Respawn,

    /// 먼저 터미널과 분리한 뒤 재가동 루프로 들어간다.
    Background,
}

/// 로깅을 활성화한다.
///
/// 'path'가 주어지면 해당 파일에 append 모드로 기록하고, 없으면 stderr로
/// 내보낸다. 타임스탬프는 fmt 레이어가 붙인다.
pub fn init_logging(path: Option<&Path>) -> crate::Result<()> {
    match path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .try_init()?;
        }
        None => tracing_subscriber::fmt::try_init()?,
    }
    Ok(())
}

/// 워커 프로세스의 PID 파일.
///
/// 생성 시 자신의 PID를 기록하고, drop 시(정상 셧다운 경로) 파일을 제거한다.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// 'path'에 현재 프로세스의 PID를 기록한다.
    pub fn create(path: impl Into<PathBuf>) -> crate::Result<PidFile> {
        let path = path.into();
        fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(PidFile { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(cause = %err, path = %self.path.display(), "failed to remove pid file");
        }
    }
}
