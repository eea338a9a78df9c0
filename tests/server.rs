//! 실행 중인 리피터를 상대로 한 종단간 시나리오.
//!
//! 임시 포트에 리스너를 직접 바인딩해 'server::run'에 넘기고, 실제 소켓으로
//! 뷰어와 VNC 서버 역할을 연기한다.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Duration};

use vnc_repeater::server::{self, ListenerSet};
use vnc_repeater::Config;

const BLOCK: usize = 250;
const RFB_BANNER: &[u8] = b"RFB 000.000\n";

/// 임시 포트로 리피터를 띄운다. 반환된 sender를 drop하면 셧다운된다.
async fn start_repeater(config: Config) -> (SocketAddr, SocketAddr, oneshot::Sender<()>) {
    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();
    let server_addr = server_listener.local_addr().unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    let listeners = ListenerSet::from_listeners(vec![client_listener], vec![server_listener]);
    tokio::spawn(async move {
        server::run(listeners, config, async {
            let _ = rx.await;
        })
        .await
        .unwrap();
    });

    (client_addr, server_addr, tx)
}

/// `ID:<id>`를 NUL로 블록 크기까지 패딩한다.
fn id_block(id: &str) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK];
    let tag = format!("ID:{}", id);
    block[..tag.len()].copy_from_slice(tag.as_bytes());
    block
}

/// 직접 접속 대상을 NUL 패딩한 블록.
fn host_block(target: &str) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK];
    block[..target.len()].copy_from_slice(target.as_bytes());
    block
}

async fn read_banner(stream: &mut TcpStream) {
    let mut banner = [0u8; 12];
    timeout(Duration::from_secs(5), stream.read_exact(&mut banner))
        .await
        .expect("no banner in time")
        .unwrap();
    assert_eq!(&banner[..], RFB_BANNER);
}

async fn expect_exact(stream: &mut TcpStream, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("no payload in time")
        .unwrap();
    assert_eq!(buf, expected);
}

async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("socket was not closed in time")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn pairs_server_and_client_by_id() {
    let (client_addr, server_addr, _guard) = start_repeater(Config::default()).await;

    // 서버가 먼저 파킹된다. 응답은 없어야 한다.
    let mut vnc_server = TcpStream::connect(server_addr).await.unwrap();
    vnc_server.write_all(&id_block("abcd")).await.unwrap();

    let mut viewer = TcpStream::connect(client_addr).await.unwrap();
    read_banner(&mut viewer).await;
    viewer.write_all(&id_block("abcd")).await.unwrap();

    // 페어링 후에는 양방향 모두 투명하다.
    viewer.write_all(b"hello").await.unwrap();
    expect_exact(&mut vnc_server, b"hello").await;

    vnc_server.write_all(b"world").await.unwrap();
    expect_exact(&mut viewer, b"world").await;

    // 뷰어가 닫으면 서버 쪽이 EOF를 본다.
    drop(viewer);
    expect_eof(&mut vnc_server).await;
}

#[tokio::test]
async fn dials_direct_target() {
    let (client_addr, _server_addr, _guard) = start_repeater(Config::default()).await;

    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();

    let mut viewer = TcpStream::connect(client_addr).await.unwrap();
    read_banner(&mut viewer).await;
    viewer
        .write_all(&host_block(&format!("127.0.0.1:{}", target_addr.port())))
        .await
        .unwrap();

    let (mut served, _) = timeout(Duration::from_secs(5), target.accept())
        .await
        .expect("relay never dialed the target")
        .unwrap();

    viewer.write_all(b"ping").await.unwrap();
    expect_exact(&mut served, b"ping").await;

    served.write_all(b"pong").await.unwrap();
    expect_exact(&mut viewer, b"pong").await;
}

#[tokio::test]
async fn refuse_mode_keeps_the_first_server() {
    let config = Config {
        refuse: true,
        ..Config::default()
    };
    let (client_addr, server_addr, _guard) = start_repeater(config).await;

    let mut server_a = TcpStream::connect(server_addr).await.unwrap();
    server_a.write_all(&id_block("x")).await.unwrap();

    // A가 먼저 파킹되도록 순서를 보장한다.
    sleep(Duration::from_millis(200)).await;

    let mut server_b = TcpStream::connect(server_addr).await.unwrap();
    server_b.write_all(&id_block("x")).await.unwrap();

    // B는 릴레이가 닫는다.
    expect_eof(&mut server_b).await;

    // 이후 도착한 클라이언트는 A와 페어링된다.
    let mut viewer = TcpStream::connect(client_addr).await.unwrap();
    read_banner(&mut viewer).await;
    viewer.write_all(&id_block("x")).await.unwrap();

    viewer.write_all(b"marco").await.unwrap();
    expect_exact(&mut server_a, b"marco").await;
    server_a.write_all(b"polo").await.unwrap();
    expect_exact(&mut viewer, b"polo").await;
}

#[tokio::test]
async fn replace_mode_prefers_the_newcomer() {
    let (client_addr, server_addr, _guard) = start_repeater(Config::default()).await;

    let mut server_a = TcpStream::connect(server_addr).await.unwrap();
    server_a.write_all(&id_block("x")).await.unwrap();

    sleep(Duration::from_millis(200)).await;

    let mut server_b = TcpStream::connect(server_addr).await.unwrap();
    server_b.write_all(&id_block("x")).await.unwrap();

    // last-writer-wins: A가 닫히고 B가 파킹 자리를 차지한다.
    expect_eof(&mut server_a).await;

    let mut viewer = TcpStream::connect(client_addr).await.unwrap();
    read_banner(&mut viewer).await;
    viewer.write_all(&id_block("x")).await.unwrap();

    viewer.write_all(b"marco").await.unwrap();
    expect_exact(&mut server_b, b"marco").await;
}

#[tokio::test]
async fn sweeps_stale_server_entry() {
    if !cfg!(target_os = "linux") {
        return;
    }

    let config = Config {
        select_timeout: Duration::from_millis(200),
        ..Config::default()
    };
    let (client_addr, server_addr, _guard) = start_repeater(config).await;

    // 서버가 파킹된 뒤 조용히 사라진다.
    let mut stale = TcpStream::connect(server_addr).await.unwrap();
    stale.write_all(&id_block("y")).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    drop(stale);

    // sweep 주기가 몇 번 지나가며 스테일 엔트리를 치운다.
    sleep(Duration::from_secs(1)).await;

    // 클라이언트는 죽은 서버와 페어링되는 대신 새로 파킹된다.
    let mut viewer = TcpStream::connect(client_addr).await.unwrap();
    read_banner(&mut viewer).await;
    viewer.write_all(&id_block("y")).await.unwrap();

    sleep(Duration::from_millis(200)).await;

    // 살아있는 서버가 도착하면 그 클라이언트와 페어링된다.
    let mut vnc_server = TcpStream::connect(server_addr).await.unwrap();
    vnc_server.write_all(&id_block("y")).await.unwrap();

    viewer.write_all(b"fresh").await.unwrap();
    expect_exact(&mut vnc_server, b"fresh").await;
}

#[tokio::test]
async fn handshake_timeout_closes_the_socket() {
    let config = Config {
        init_timeout: Duration::from_millis(200),
        ..Config::default()
    };
    let (client_addr, _server_addr, _guard) = start_repeater(config).await;

    let mut viewer = TcpStream::connect(client_addr).await.unwrap();
    read_banner(&mut viewer).await;

    // 블록을 보내지 않고 버틴다.
    expect_eof(&mut viewer).await;
}

#[tokio::test]
async fn short_handshake_block_is_rejected() {
    let (_client_addr, server_addr, _guard) = start_repeater(Config::default()).await;

    let mut vnc_server = TcpStream::connect(server_addr).await.unwrap();
    vnc_server.write_all(b"ID:abcd").await.unwrap();
    vnc_server.shutdown().await.unwrap();

    // 블록 크기에 못 미친 채 끝난 핸드셰이크는 버려진다.
    expect_eof(&mut vnc_server).await;
}

#[tokio::test]
async fn server_without_id_tag_is_dropped() {
    let (_client_addr, server_addr, _guard) = start_repeater(Config::default()).await;

    let mut vnc_server = TcpStream::connect(server_addr).await.unwrap();
    vnc_server.write_all(&vec![b'x'; BLOCK]).await.unwrap();

    expect_eof(&mut vnc_server).await;
}

#[tokio::test]
async fn no_rfb_suppresses_the_banner() {
    let config = Config {
        no_rfb: true,
        ..Config::default()
    };
    let (client_addr, server_addr, _guard) = start_repeater(config).await;

    let mut vnc_server = TcpStream::connect(server_addr).await.unwrap();
    vnc_server.write_all(&id_block("z")).await.unwrap();

    sleep(Duration::from_millis(200)).await;

    // 배너가 없으므로 뷰어가 받는 첫 바이트는 서버가 보낸 데이터다.
    let mut viewer = TcpStream::connect(client_addr).await.unwrap();
    viewer.write_all(&id_block("z")).await.unwrap();

    vnc_server.write_all(b"first").await.unwrap();
    expect_exact(&mut viewer, b"first").await;
}

#[tokio::test]
async fn shutdown_closes_parked_connections() {
    let (_client_addr, server_addr, guard) = start_repeater(Config::default()).await;

    let mut parked = TcpStream::connect(server_addr).await.unwrap();
    parked.write_all(&id_block("w")).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    // 셧다운 신호. 파킹된 소켓까지 모두 닫힌다.
    drop(guard);
    expect_eof(&mut parked).await;
}
