//! 페어링된 세션의 양방향 바이트 복사.
//!
//! VNC는 두 방향이 발맞춰 흐르지 않는 풀 듀플렉스 프로토콜이다. 한 태스크가
//! 번갈아 복사하면 한쪽 방향의 정체가 반대 방향까지 막을 수 있으므로,
//! 방향마다 독립된 복사 태스크를 둔다.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::Shutdown;

/// 방향별 읽기 버퍼 크기.
const COPY_BUF: usize = 8 * 1024;

/// 한 방향이 끝난 뒤 반대 방향에게 주는 1차 유예.
const TEARDOWN_GRACE: Duration = Duration::from_millis(250);

/// 1차 유예가 다한 뒤의 추가 확인 대기. 이마저 지나면 강제로 내린다.
const TEARDOWN_CONFIRM: Duration = Duration::from_millis(900);

/// 연결된 두 소켓의 소유권을 가져가 양방향으로 중계한다.
///
/// 두 방향 모두 끝나면 두 소켓을 닫고 (a→b, b→a) 전송량을 반환한다. 한쪽의
/// 깨끗한 EOF는 하프클로즈(쓰기 셧다운)로 전파될 뿐 반대 방향을 즉시 끊지
/// 않는다. 반대 방향은 짧은 유예 안에 스스로 끝나거나 강제 종료된다.
/// 'shutdown' 신호는 양쪽 모두를 즉시 내린다.
pub(crate) async fn splice(
    a: TcpStream,
    b: TcpStream,
    shutdown: &mut Shutdown,
) -> crate::Result<(u64, u64)> {
    let (a_rd, a_wr) = a.into_split();
    let (b_rd, b_wr) = b.into_split();

    let mut forward = tokio::spawn(copy_half(a_rd, b_wr));
    let mut reverse = tokio::spawn(copy_half(b_rd, a_wr));

    tokio::select! {
        res = &mut forward => {
            let sent = res.unwrap_or(0);
            let received = settle(&mut reverse).await;
            Ok((sent, received))
        }
        res = &mut reverse => {
            let received = res.unwrap_or(0);
            let sent = settle(&mut forward).await;
            Ok((sent, received))
        }
        _ = shutdown.recv() => {
            // 서버 셧다운. 복사 태스크를 버리면 양쪽 소켓이 닫힌다.
            forward.abort();
            reverse.abort();
            Ok((0, 0))
        }
    }
}

/// 한 방향을 복사한다. 입력 EOF, 혹은 양쪽 어느 소켓의 에러로 끝난다.
///
/// 쓰기는 'write_all'이라 전부 내보내거나 에러다. 끝날 때 출력 쪽에 쓰기
/// 셧다운을 보내 EOF를 전파한다.
async fn copy_half(mut rd: OwnedReadHalf, mut wr: OwnedWriteHalf) -> u64 {
    let mut buf = vec![0u8; COPY_BUF];
    let mut total: u64 = 0;

    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::debug!(cause = %err, "copy direction ended by read error");
                break;
            }
        };

        if let Err(err) = wr.write_all(&buf[..n]).await {
            tracing::debug!(cause = %err, "copy direction ended by write error");
            break;
        }
        total += n as u64;
    }

    let _ = wr.shutdown().await;
    total
}

/// 한 방향이 끝난 뒤, 남은 방향의 자연 종료를 유예 안에서 기다린다.
async fn settle(other: &mut JoinHandle<u64>) -> u64 {
    if let Ok(res) = time::timeout(TEARDOWN_GRACE, &mut *other).await {
        return res.unwrap_or(0);
    }
    if let Ok(res) = time::timeout(TEARDOWN_CONFIRM, &mut *other).await {
        return res.unwrap_or(0);
    }

    other.abort();
    0
}
