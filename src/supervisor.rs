//! 프로세스 수명 주기: 종료 시그널, 재가동 루프, 백그라운드 분리.
//!
//! 릴레이 본체와는 철저히 분리되어 있다. 여기의 어떤 모드도 와이어 프로토콜에
//! 영향을 주지 않고, 프로세스가 언제 어떻게 다시 뜨는지만 결정한다.

use std::env;
use std::ffi::OsString;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::LoopMode;

/// 재가동 루프가 띄운 워커 자식임을 표시하는 환경 변수.
const SUPERVISED_ENV: &str = "ULTRAVNC_REPEATER_SUPERVISED";

/// BG 모드에서 이미 터미널과 분리된 수퍼바이저임을 표시하는 환경 변수.
const DETACHED_ENV: &str = "ULTRAVNC_REPEATER_DETACHED";

/// 워커 재가동 전 대기.
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// SIGINT 또는 SIGTERM이 도착하면 완료되는 future.
///
/// 'server::run'의 셧다운 아규먼트로 쓴다. 유닉스가 아닌 플랫폼에서는
/// ctrl-c만 기다린다.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(cause = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// 이 프로세스가 재가동 루프가 띄운 워커인지 확인한다.
pub fn is_supervised_worker() -> bool {
    env::var_os(SUPERVISED_ENV).is_some()
}

/// '-L' 수명 주기 모드를 수행한다.
///
/// 'Respawn'은 자신을 워커로 다시 실행해 두고, 비정상 종료 때마다 1초 백오프
/// 후 재가동한다. 워커의 정상 종료(코드 0)는 루프도 함께 끝낸다.
/// 'Background'는 그 전에 먼저 스스로를 분리된 자식으로 띄우고 부모는 즉시
/// 반환한다. 분리된 자식이 재가동 루프를 잇는다.
pub fn supervise(mode: LoopMode) -> crate::Result<()> {
    if mode == LoopMode::Background && env::var_os(DETACHED_ENV).is_none() {
        return detach();
    }
    respawn_loop()
}

/// 터미널과 분리된 수퍼바이저 자식을 띄우고 부모 쪽 절반을 끝낸다.
fn detach() -> crate::Result<()> {
    let mut command = Command::new(env::current_exe()?);
    command
        .args(passthrough_args())
        .env(DETACHED_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // 새 프로세스 그룹. 터미널의 잡 컨트롤에서 떨어져 나온다.
        command.process_group(0);
    }

    let child = command.spawn()?;
    info!(pid = child.id(), "detached supervisor started");
    Ok(())
}

/// 워커를 돌리고, 비정상 종료면 백오프 후 다시 띄운다.
fn respawn_loop() -> crate::Result<()> {
    loop {
        let status = Command::new(env::current_exe()?)
            .args(passthrough_args())
            .env(SUPERVISED_ENV, "1")
            .status()?;

        if status.success() {
            info!("worker exited cleanly");
            return Ok(());
        }

        warn!(status = %status, "worker exited abnormally; respawning");
        thread::sleep(RESPAWN_BACKOFF);
    }
}

/// 재실행 시 그대로 넘길 아규먼트들.
fn passthrough_args() -> Vec<OsString> {
    env::args_os().skip(1).collect()
}
