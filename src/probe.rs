//! 파킹된 하프 커넥션의 상대측 생존 확인.
//!
//! 커널 TCP 상태 테이블을 읽을 수 있는 플랫폼(리눅스의 '/proc/net/tcp')에서는
//! 소켓이 ESTABLISHED 상태인지 실제로 확인하고, 그 외의 모든 경우에는
//! 살아있다고 가정한다. "죽었는데 살아있다고 보는" 오판은 스테일 엔트리가
//! 조금 더 오래 남는 것으로 끝나지만, 반대 방향의 오판은 멀쩡한 세션을
//! 끊어버리기 때문이다.

use tokio::net::TcpStream;
use tracing::debug;

/// '/proc/net/tcp'의 state 칼럼 값 중 ESTABLISHED.
#[cfg(any(target_os = "linux", test))]
const TCP_ESTABLISHED: u8 = 1;

/// 파킹된 소켓의 상대측이 아직 연결되어 있는지 best-effort로 확인한다.
///
/// 확인이 불가능한 모든 경우(지원하지 않는 플랫폼, 테이블 읽기 실패, inode
/// 미확인)에는 'true'를 반환한다. 레지스트리 외의 어느 누구도 이 함수를
/// 호출하지 않으며, 바이트 전송 중에는 절대 호출되지 않는다.
pub(crate) fn is_alive(stream: &TcpStream) -> bool {
    match probe(stream) {
        Ok(alive) => alive,
        Err(err) => {
            debug!(cause = %err, "liveness probe unavailable; assuming alive");
            true
        }
    }
}

#[cfg(target_os = "linux")]
fn probe(stream: &TcpStream) -> crate::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let link = std::fs::read_link(format!("/proc/self/fd/{}", stream.as_raw_fd()))?;
    let inode =
        socket_inode(&link.to_string_lossy()).ok_or("descriptor does not name a socket")?;

    for table in &["/proc/net/tcp", "/proc/net/tcp6"] {
        let contents = match std::fs::read_to_string(table) {
            Ok(contents) => contents,
            Err(_) => continue,
        };
        if let Some(state) = scan_table(&contents, inode) {
            return Ok(state == TCP_ESTABLISHED);
        }
    }

    // 어느 테이블에도 없는 소켓은 판단을 보류하고 살아있는 것으로 둔다.
    Ok(true)
}

#[cfg(not(target_os = "linux"))]
fn probe(_stream: &TcpStream) -> crate::Result<bool> {
    Err("no inspectable tcp state table on this platform".into())
}

/// "socket:[1817032]" 형태의 '/proc/self/fd' 링크에서 inode를 추출한다.
#[cfg(any(target_os = "linux", test))]
fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// '/proc/net/tcp[6]' 텍스트에서 주어진 inode 행의 state 값을 찾는다.
///
/// 행 포맷: sl local_address rem_address st tx:rx tr:tm->when retrnsmt uid
/// timeout inode ... 이 중 st(16진수)와 10번째 필드인 inode만 본다.
#[cfg(any(target_os = "linux", test))]
fn scan_table(contents: &str, inode: u64) -> Option<u8> {
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        if fields[9].parse::<u64>().ok() == Some(inode) {
            return u8::from_str_radix(fields[3], 16).ok();
        }
    }
    None
}
