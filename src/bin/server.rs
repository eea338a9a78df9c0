//! vnc-repeater 서버.
//!
//! 이 파일은 이 라이브러리에 구현된 릴레이의 진입점이다. 커맨드라인과
//! 환경 변수를 파싱하고, 리스너를 바인딩한 뒤 'vnc_repeater::server'에
//! 전달한다.
//!
//! 아규먼트 파싱에는 'clap' crate를 사용한다.

use vnc_repeater::config::{self, LoopMode, PidFile, DEFAULT_BUFSIZE};
use vnc_repeater::server::{self, ListenerSet};
use vnc_repeater::{supervisor, Config, DEFAULT_CLIENT_PORT, DEFAULT_SERVER_PORT};

use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
pub async fn main() -> vnc_repeater::Result<()> {
    let cli = Cli::parse();

    // 로깅을 활성화한다. '-l'이 주어지면 stderr 대신 그 파일로 보낸다.
    config::init_logging(cli.logfile.as_deref())?;

    // '-L' 모드에서는, 재가동 루프가 띄운 워커 자식이 아닌 한 수퍼바이저로
    // 동작하고 릴레이 본체는 띄우지 않는다.
    if let Some(mode) = cli.loop_mode {
        if !supervisor::is_supervised_worker() {
            return supervisor::supervise(mode);
        }
    }

    let _pid_file = match &cli.pidfile {
        Some(path) => Some(PidFile::create(path)?),
        None => None,
    };

    let config = cli.to_config();
    info!(
        pid = std::process::id(),
        client_port = config.client_port,
        server_port = config.server_port,
        "starting repeater"
    );

    let listeners = ListenerSet::bind(&config)?;
    server::run(listeners, config, supervisor::shutdown_signal()).await
}

#[derive(Parser)]
#[command(name = "vnc-repeater", version, about = "An UltraVNC mode II repeater")]
struct Cli {
    /// Client (viewer) listen port.
    #[arg(
        short = 'c',
        long = "client-port",
        env = "ULTRAVNC_REPEATER_CLIENT_PORT",
        default_value_t = DEFAULT_CLIENT_PORT
    )]
    client_port: u16,

    /// Server listen port.
    #[arg(
        short = 's',
        long = "server-port",
        env = "ULTRAVNC_REPEATER_SERVER_PORT",
        default_value_t = DEFAULT_SERVER_PORT
    )]
    server_port: u16,

    /// Handshake block size in bytes.
    #[arg(
        short = 'b',
        long = "bufsize",
        env = "ULTRAVNC_REPEATER_BUFSIZE",
        default_value_t = DEFAULT_BUFSIZE
    )]
    buf_size: usize,

    /// Refuse (1) or replace (0) the parked side on a same-role conflict.
    #[arg(
        short = 'r',
        long = "refuse",
        env = "ULTRAVNC_REPEATER_REFUSE",
        action = clap::ArgAction::Set,
        value_parser = parse_switch,
        default_value = "0",
        num_args = 0..=1,
        default_missing_value = "1"
    )]
    refuse: bool,

    /// Periodically evict parked connections whose peer is gone.
    #[arg(
        short = 'C',
        long = "clean",
        env = "ULTRAVNC_REPEATER_CLEAN",
        action = clap::ArgAction::Set,
        value_parser = parse_switch,
        default_value = "1",
        num_args = 0..=1,
        default_missing_value = "1"
    )]
    clean: bool,

    /// Suppress the RFB banner normally sent to clients.
    #[arg(
        short = 'R',
        long = "no-rfb",
        env = "ULTRAVNC_REPEATER_NO_RFB",
        action = clap::ArgAction::Set,
        value_parser = parse_switch,
        default_value = "0",
        num_args = 0..=1,
        default_missing_value = "1"
    )]
    no_rfb: bool,

    /// Lifecycle mode: "1" respawns a crashed worker, "BG" detaches first.
    #[arg(
        short = 'L',
        long = "loop",
        env = "ULTRAVNC_REPEATER_LOOP",
        value_parser = parse_loop_mode
    )]
    loop_mode: Option<LoopMode>,

    /// Append log output to this file instead of stderr.
    #[arg(short = 'l', long = "logfile", env = "ULTRAVNC_REPEATER_LOGFILE")]
    logfile: Option<PathBuf>,

    /// Write the worker pid to this file.
    #[arg(short = 'p', long = "pidfile", env = "ULTRAVNC_REPEATER_PIDFILE")]
    pidfile: Option<PathBuf>,
}

impl Cli {
    fn to_config(&self) -> Config {
        Config {
            client_port: self.client_port,
            server_port: self.server_port,
            buf_size: self.buf_size,
            refuse: self.refuse,
            clean: self.clean,
            no_rfb: self.no_rfb,
            ..Config::default()
        }
    }
}

/// "0" 또는 "1"만 허용하는 스위치 값.
fn parse_switch(value: &str) -> Result<bool, String> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(format!("expected 0 or 1, got '{}'", other)),
    }
}

/// '-L' 값. "1"은 재가동 루프, "BG"는 백그라운드 분리.
fn parse_loop_mode(value: &str) -> Result<LoopMode, String> {
    if value == "1" {
        Ok(LoopMode::Respawn)
    } else if value.eq_ignore_ascii_case("bg") {
        Ok(LoopMode::Background)
    } else {
        Err(format!("expected 1 or BG, got '{}'", value))
    }
}
