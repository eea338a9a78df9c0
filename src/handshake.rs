//! 수락 직후의 리피터 핸드셰이크.
//!
//! 원본 리피터 프로토콜은 고정 크기 인사 블록을 예약해 둔다. 블록보다 적게
//! 보내는 커넥션은 프로토콜 위반으로 끊어서, half-open 상태의 공격자가
//! 소켓을 파킹 상태로 붙들어 두지 못하게 한다.

use std::convert::TryFrom;
use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;

use crate::config::Config;

/// 클라이언트 수락 직후 전송하는 RFB 배너. 정확히 12바이트.
pub(crate) const RFB_BANNER: &[u8] = b"RFB 000.000\n";

/// 핸드셰이크에 참여한 하프 커넥션의 역할. 어느 리스너로 들어왔는지가 정한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => "client".fmt(f),
            Role::Server => "server".fmt(f),
        }
    }
}

/// 오프닝 블록이 밝힌 커넥션의 의도.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Intent {
    /// `ID:` 태그. 레지스트리에서 같은 id의 반대 역할과 페어링을 기다린다.
    Rendezvous { id: String },

    /// 클라이언트가 지목한 직접 접속 대상. 레지스트리를 거치지 않는다.
    Direct { host: String, port: u16 },
}

/// 수락된 소켓에서 오프닝 블록을 읽고 분류한다.
///
/// 역할이 클라이언트면 먼저 RFB 배너를 쓴다('no_rfb' 설정 시 생략). 블록은
/// 'config.buf_size' 바이트 전부를 'config.init_timeout' 안에 읽어야 하며,
/// 시한 초과와 부족한 읽기는 모두 'Err'가 된다. 에러를 받은 호출자는 소켓을
/// 닫는 것 외에 할 일이 없다.
pub(crate) async fn read_intent<S>(
    stream: &mut S,
    role: Role,
    config: &Config,
) -> crate::Result<Intent>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        if role == Role::Client && !config.no_rfb {
            stream.write_all(RFB_BANNER).await?;
        }

        let mut block = vec![0u8; config.buf_size];
        stream.read_exact(&mut block).await?;
        Ok::<_, crate::Error>(block)
    };

    let block = match time::timeout(config.init_timeout, exchange).await {
        Ok(res) => res?,
        Err(_) => return Err("handshake timed out".into()),
    };

    classify(&block, role)
}

/// 블록 내용을 분류한다. 순서는 프로토콜이 정한 그대로이다.
///
/// 1. `ID:` + 워드 문자 1개 이상이면 랑데부. id는 최대 길이의 워드 문자 런이다.
/// 2. 그 외에 역할이 클라이언트라면 직접 접속 대상으로 파싱을 시도한다.
/// 3. 서버 역할은 `ID:` 태그 외의 어떤 내용도 허용하지 않는다.
fn classify(block: &[u8], role: Role) -> crate::Result<Intent> {
    if let Some(rest) = block.strip_prefix(b"ID:") {
        let len = rest.iter().take_while(|b| is_word(**b)).count();
        if len > 0 {
            let id = String::from_utf8_lossy(&rest[..len]).into_owned();
            return Ok(Intent::Rendezvous { id });
        }
    }

    if role == Role::Server {
        return Err("server handshake without ID tag".into());
    }

    parse_target(block)
}

fn is_word(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// 직접 접속 대상 `host[:port]`를 파싱한다.
///
/// 후행 공백과 NUL은 블록 패딩으로 간주해 벗겨낸다. 포트 구분은 마지막
/// 콜론에서 한다. 포트가 없으면 5900이다.
fn parse_target(block: &[u8]) -> crate::Result<Intent> {
    let end = block
        .iter()
        .rposition(|&b| b != 0 && !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(0);
    let text = std::str::from_utf8(&block[..end])
        .map_err(|_| "direct target is not valid utf-8")?;

    if text.is_empty() {
        return Err("empty direct target".into());
    }

    let (host, port) = match text.rsplit_once(':') {
        Some((host, port)) => {
            let port: i32 = port.parse().map_err(|_| "invalid port in direct target")?;
            let port = normalize_port(port).ok_or("direct target port out of range")?;
            (host, port)
        }
        None => (text, i32::from(crate::DEFAULT_CLIENT_PORT)),
    };

    if host.is_empty() {
        return Err("empty host in direct target".into());
    }
    let port = u16::try_from(port).map_err(|_| "direct target port out of range")?;

    Ok(Intent::Direct {
        host: host.to_string(),
        port,
    })
}

/// 원본 리피터의 포트 보정 규칙. 음수는 절대값으로, 200 미만은 5900대 표시
/// 포트로 본다. 절대값이 없는 'i32::MIN'은 None이다.
fn normalize_port(port: i32) -> Option<i32> {
    if port < 0 {
        port.checked_neg()
    } else if port < 200 {
        Some(port + 5900)
    } else {
        Some(port)
    }
}
