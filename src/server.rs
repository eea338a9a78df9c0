/**
 * UltraVNC 리피터 서버 구현.
 *
 * 바인딩된 리스너들을 받아 릴레이 전체를 가동하는 비동기 'run' 함수를
 * 제공한다. 수락된 커넥션마다 핸드셰이크 태스크를 가동하고, 랑데부 결정은
 * 전부 단일 디스패처 태스크로 모은다.
 */

use crate::config::Config;
use crate::handshake::{self, Intent, Role};
use crate::registry::{HalfConnection, RendezvousRegistry};
use crate::{splice, Shutdown};

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

/**
 * 리피터가 수용하는 최대 동시 커넥션 수.
 *
 * 핸드셰이크 중이든, 파킹 중이든, 세션에 묶여 있든 소켓 하나가 permit
 * 하나를 쥔다. 상한에 도달하면 기존 커넥션이 정리될 때까지 새 커넥션을
 * 수락하지 않는다.
 *
 * 실제 어플리케이션에서는 이 값을 따로 설정할 수 있어야 하겠지만, 여기서는
 * 하드코딩으로 둔다.
 */
const MAX_CONNECTIONS: usize = 250;

/// 직접 접속 시 각 후보 주소에 허용하는 연결 시한.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// 핸드셰이크 완료 이벤트가 디스패처로 모이는 채널의 깊이.
const EVENT_CHANNEL_DEPTH: usize = 128;

/**
 * 디스패처로 전달되는 이벤트.
 *
 * 레지스트리의 단일 작성자 속성은 락이 아니라 이 채널이 지킨다. 핸드셰이크가
 * 어느 태스크에서 끝났든, 레지스트리에 닿으려면 여기를 거쳐야 한다.
 */
enum Event {
    /// `ID:` 핸드셰이크를 마친 하프 커넥션.
    Submit(HalfConnection),

    /// 수락 루프 하나가 백오프로도 복구하지 못하고 죽었다.
    ListenerFailed(crate::Error),
}

/**
 * 역할별로 바인딩된 수락 소켓들.
 *
 * 포트마다 IPv4와 IPv6를 독립적으로 바인딩하며, 패밀리 중 하나만 성공해도
 * 진행한다. 한 포트의 전 패밀리 실패는 치명적이다.
 */
pub struct ListenerSet {
    client: Vec<TcpListener>,
    server: Vec<TcpListener>,
}

impl ListenerSet {
    /// 설정된 두 포트에 리스너들을 바인딩한다.
    pub fn bind(config: &Config) -> crate::Result<ListenerSet> {
        Ok(ListenerSet {
            client: bind_port(config.client_port)?,
            server: bind_port(config.server_port)?,
        })
    }

    /// 이미 바인딩된 리스너들로 구성한다. 테스트가 임시 포트를 쓰는 통로이다.
    pub fn from_listeners(client: Vec<TcpListener>, server: Vec<TcpListener>) -> ListenerSet {
        ListenerSet { client, server }
    }
}

/// 한 포트에 대해 IPv4/IPv6 리스너를 바인딩한다.
fn bind_port(port: u16) -> crate::Result<Vec<TcpListener>> {
    let targets = vec![
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    ];

    let mut bound = Vec::new();
    for addr in targets {
        match bind_reusable(addr) {
            Ok(listener) => {
                info!(addr = %addr, "listening");
                bound.push(listener);
            }
            Err(err) => warn!(addr = %addr, cause = %err, "bind failed"),
        }
    }

    if bound.is_empty() {
        return Err(format!("could not bind any address family on port {}", port).into());
    }
    Ok(bound)
}

/**
 * 주소 재사용을 켠 채로 바인딩한다.
 *
 * IPv6 소켓은 v6 전용으로 두어, 같은 포트에 따로 바인딩된 IPv4 소켓과
 * 공존하게 한다.
 */
fn bind_reusable(addr: SocketAddr) -> crate::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    let listener = TcpListener::from_std(socket.into())?;
    Ok(listener)
}

/**
 * 리피터를 가동한다.
 *
 * 리스너마다 수락 루프 태스크를 띄우고, 'shutdown' future가 완료될 때까지
 * 디스패처를 돌린다. 'tokio::signal::ctrl_c()' 같은 것을 'shutdown'
 * 아규먼트로 사용할 수 있다.
 *
 * 셧다운이 시작되면 리스너와 파킹된 소켓을 닫고, 진행 중이던 핸드셰이크와
 * 세션이 신호를 보고 내려올 때까지 기다린 뒤 반환한다. 디스패처가 복구
 * 불가능한 에러로 죽었다면 같은 정리를 거친 후 그 에러를 반환한다.
 */
pub async fn run(listeners: ListenerSet, config: Config, shutdown: impl Future) -> crate::Result<()> {
    let config = Arc::new(config);

    /*
    'shutdown' future가 완료되면 모든 태스크에게 알려야 한다. 이 일에는
    브로드캐스트 채널을 사용한다. 수신자가 필요한 자리마다 subscribe()로
    하나씩 만든다.
    */
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
    let limit_connections = Arc::new(Semaphore::new(MAX_CONNECTIONS));

    // 바인딩된 리스너마다 수락 루프를 가동한다.
    let ListenerSet { client, server } = listeners;
    for (role, group) in vec![(Role::Client, client), (Role::Server, server)] {
        for listener in group {
            let mut accept_loop = AcceptLoop {
                listener,
                role,
                config: config.clone(),
                limit_connections: limit_connections.clone(),
                events_tx: events_tx.clone(),
                notify_shutdown: notify_shutdown.clone(),
                shutdown_complete_tx: shutdown_complete_tx.clone(),
                shutdown: Shutdown::new(notify_shutdown.subscribe()),
            };
            tokio::spawn(async move {
                if let Err(err) = accept_loop.run().await {
                    // 복구 포기. 디스패처가 이 소식을 치명적 에러로 되올린다.
                    let _ = accept_loop
                        .events_tx
                        .send(Event::ListenerFailed(err))
                        .await;
                }
            });
        }
    }

    let mut dispatcher = Dispatcher {
        registry: RendezvousRegistry::new(config.refuse),
        config: config.clone(),
        events_rx,
        notify_shutdown: notify_shutdown.clone(),
        shutdown_complete_tx: shutdown_complete_tx.clone(),
    };

    let mut result = Ok(());

    tokio::select! {
        res = dispatcher.run() => {
            /*
            디스패처는 치명적인 경우에만 에러로 끝난다. 개별 커넥션의 에러는
            여기까지 올라오지 않는다.
            */
            if let Err(err) = &res {
                error!(cause = %err, "dispatcher failed");
            }
            result = res;
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }

    /*
    셧다운 신호를 명시적으로 전송해 구독 중인 모든 태스크를 깨운다. 수락
    루프들도 sender clone을 쥐고 있어서, 채널은 그들이 내려온 뒤에야 닫힌다.
    drop에만 기대면 "수락 루프가 닫힘을 기다리고, 닫힘은 수락 루프를
    기다리는" 교착이 된다. 신호 이후에 구독한 태스크는 값 대신 채널 닫힘을
    보게 되고, 그 역시 셧다운으로 취급된다.
    */
    let _ = notify_shutdown.send(());

    /*
    파킹된 소켓을 닫고, sender 핸들들을 명시적으로 drop한다. 이렇게 하지
    않으면 아래의 '.await'는 영원히 완료되지 않는다.
    */
    let Dispatcher { mut registry, .. } = dispatcher;
    registry.drain();
    drop(notify_shutdown);
    drop(shutdown_complete_tx);
    drop(events_tx);

    /*
    남은 'Sender'는 수락 루프, 핸드셰이크 핸들러, 세션 태스크가 쥔 clone들
    뿐이다. 그들이 모두 내려오면 채널이 닫히고 'recv()'가 'None'으로 끝난다.
    */
    let _ = shutdown_complete_rx.recv().await;

    result
}

/**
 * 디스패처. 레지스트리의 유일한 작성자이다.
 *
 * 핸드셰이크 완료 이벤트를 소비해 파킹/페어링을 결정하고, clean 모드에서는
 * 주기적으로 스테일 엔트리를 sweep한다.
 */
struct Dispatcher {
    registry: RendezvousRegistry,

    config: Arc<Config>,

    events_rx: mpsc::Receiver<Event>,

    // 페어 성사 시 세션 태스크에게 셧다운 수신자를 쥐여 주기 위한 sender.
    notify_shutdown: broadcast::Sender<()>,

    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Dispatcher {
    async fn run(&mut self) -> crate::Result<()> {
        info!("accepting inbound connections");

        // sweep 주기. 첫 틱을 주기만큼 미뤄 기동 직후의 공회전을 피한다.
        let mut sweep_tick = time::interval_at(
            Instant::now() + self.config.select_timeout,
            self.config.select_timeout,
        );

        loop {
            tokio::select! {
                maybe_event = self.events_rx.recv() => {
                    match maybe_event {
                        Some(Event::Submit(half)) => self.submit(half),
                        Some(Event::ListenerFailed(err)) => return Err(err),
                        // 'run'이 teardown에 들어가 sender가 전부 사라졌다.
                        None => return Ok(()),
                    }
                }
                _ = sweep_tick.tick(), if self.config.clean => {
                    self.registry.sweep();
                }
            }
        }
    }

    /// 하프 커넥션을 레지스트리에 제출하고, 페어가 성사되면 세션을 띄운다.
    fn submit(&mut self, half: HalfConnection) {
        if let Some((parked, fresh)) = self.registry.submit(half) {
            /*
            이 시점에 id는 이미 테이블에서 제거되었다. 두 소켓의 소유권은
            세션 태스크가 가져가고, 세션은 레지스트리와 다른 세션들로부터
            완전히 격리된다.
            */
            let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
            let shutdown_complete = self.shutdown_complete_tx.clone();
            tokio::spawn(async move {
                let _shutdown_complete = shutdown_complete;
                session(parked, fresh, &mut shutdown).await;
            });
        }
    }
}

/// 페어링된 세션 하나를 끝까지 돌리고 결과를 로깅한다.
async fn session(parked: HalfConnection, fresh: HalfConnection, shutdown: &mut Shutdown) {
    let id = parked.id.clone();
    let HalfConnection {
        stream: a,
        peer_addr: a_peer,
        _permit: _a_permit,
        ..
    } = parked;
    let HalfConnection {
        stream: b,
        peer_addr: b_peer,
        _permit: _b_permit,
        ..
    } = fresh;

    debug!(id = %id, a = %a_peer, b = %b_peer, "session started");
    match splice::splice(a, b, shutdown).await {
        Ok((sent, received)) => {
            info!(id = %id, a = %a_peer, b = %b_peer, a_to_b = sent, b_to_a = received, "session ended");
        }
        Err(err) => warn!(id = %id, cause = %err, "session failed"),
    }
}

/**
 * 리스너 하나의 수락 루프.
 *
 * 수락한 소켓마다 핸드셰이크 핸들러 태스크를 띄운다. 핸들러의 I/O가 여기의
 * 수락을 막는 일은 없다.
 */
struct AcceptLoop {
    listener: TcpListener,

    // 이 리스너로 들어오는 모든 커넥션의 역할.
    role: Role,

    config: Arc<Config>,

    /**
     * 최대 커넥션 수를 제한한다.
     *
     * 새 커넥션을 수락하기 전에 permit을 획득해야 한다. 핸드셰이크 핸들러가
     * 소켓과 함께 permit을 가져가고, 소켓이 어디에 있든(파킹, 세션) permit도
     * 따라간다. 소켓이 닫히면 permit이 세마포어로 돌아온다.
     */
    limit_connections: Arc<Semaphore>,

    events_tx: mpsc::Sender<Event>,

    notify_shutdown: broadcast::Sender<()>,

    shutdown_complete_tx: mpsc::Sender<()>,

    shutdown: Shutdown,
}

impl AcceptLoop {
    async fn run(&mut self) -> crate::Result<()> {
        loop {
            /*
            가용 permit을 기다린다. 'acquire_owned'는 'Arc'째로 소유권이
            움직이는 permit을 반환하므로 소켓을 따라 태스크 사이를 건너다닐
            수 있다. 세마포어를 닫는 일은 없으므로 'unwrap()'은 안전하다.
            */
            let permit = tokio::select! {
                permit = self.limit_connections.clone().acquire_owned() => permit.unwrap(),
                _ = self.shutdown.recv() => return Ok(()),
            };

            let (stream, peer_addr) = tokio::select! {
                res = backoff_accept(&self.listener) => res?,
                _ = self.shutdown.recv() => return Ok(()),
            };

            let handler = Handler {
                stream,
                peer_addr,
                role: self.role,
                config: self.config.clone(),
                events_tx: self.events_tx.clone(),
                shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };

            let peer_addr = handler.peer_addr;
            tokio::spawn(async move {
                if let Err(err) = handler.run(permit).await {
                    error!(peer = %peer_addr, cause = %err, "connection error");
                }
            });
        }
    }
}

/**
 * 인바운드 커넥션을 수락한다.
 *
 * 에러는 백오프 & 재시도로 핸들링한다. 첫 실패 후 1초를 기다리고, 실패가
 * 이어질 때마다 대기를 두 배로 늘린다. 64초 대기 후의 시도마저 실패하면
 * 에러를 반환한다.
 */
async fn backoff_accept(listener: &TcpListener) -> crate::Result<(TcpStream, SocketAddr)> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => return Ok((stream, peer_addr)),
            Err(err) => {
                warn!(cause = %err, "accept failed");
                if backoff > 64 {
                    // 너무 많이 실패했다. 에러를 반환한다.
                    return Err(err.into());
                }
            }
        }

        time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}

/**
 * 수락된 커넥션 하나의 핸드셰이크와 그 후속 처리.
 *
 * `ID:` 핸드셰이크는 'Event::Submit'으로 디스패처에게 넘긴다. 레지스트리에
 * 손대는 태스크는 디스패처 하나뿐이어야 하기 때문이다. 직접 접속은
 * 레지스트리와 무관하므로 이 태스크 안에서 바로 다이얼하고 스플라이스까지
 * 돌린다.
 */
struct Handler {
    stream: TcpStream,

    peer_addr: SocketAddr,

    role: Role,

    config: Arc<Config>,

    events_tx: mpsc::Sender<Event>,

    shutdown: Shutdown,

    // 직접 사용하지 않는다. drop되는 것으로 'run'의 teardown에 집계된다.
    _shutdown_complete: mpsc::Sender<()>,
}

impl Handler {
    async fn run(mut self, permit: OwnedSemaphorePermit) -> crate::Result<()> {
        /*
        핸드셰이크 자체가 'init_timeout'으로 묶여 있지만, 서버 셧다운이
        먼저 오면 그마저 기다리지 않고 소켓을 버린다.
        */
        let intent = tokio::select! {
            res = handshake::read_intent(&mut self.stream, self.role, &self.config) => res?,
            _ = self.shutdown.recv() => return Ok(()),
        };

        match intent {
            Intent::Rendezvous { id } => {
                debug!(peer = %self.peer_addr, role = %self.role, id = %id, "rendezvous handshake");
                let half = HalfConnection {
                    stream: self.stream,
                    role: self.role,
                    id,
                    peer_addr: self.peer_addr,
                    parked_at: Instant::now(),
                    _permit: Some(permit),
                };
                /*
                디스패처가 이미 내려갔다면 전송이 실패하고, 소켓은 하프
                커넥션의 drop으로 닫힌다.
                */
                let _ = self.events_tx.send(Event::Submit(half)).await;
                Ok(())
            }
            Intent::Direct { host, port } => {
                info!(peer = %self.peer_addr, host = %host, port = port, "direct dial");
                let target = match dial(&host, port).await {
                    Ok(target) => target,
                    Err(err) => {
                        // 다이얼 실패는 클라이언트 소켓을 닫는 것으로 끝난다.
                        warn!(peer = %self.peer_addr, host = %host, port = port, cause = %err, "direct dial failed");
                        return Ok(());
                    }
                };

                match splice::splice(self.stream, target, &mut self.shutdown).await {
                    Ok((sent, received)) => {
                        info!(peer = %self.peer_addr, host = %host, port = port, to_target = sent, from_target = received, "direct session ended");
                    }
                    Err(err) => {
                        warn!(peer = %self.peer_addr, cause = %err, "direct session failed");
                    }
                }
                Ok(())
            }
        }
    }
}

/**
 * 직접 접속 대상을 다이얼한다.
 *
 * 해석된 주소 중 IPv4를 먼저 모두 시도하고, 실패하면 IPv6로 넘어간다.
 * 각 시도는 'DIAL_TIMEOUT'으로 묶인다.
 */
async fn dial(host: &str, port: u16) -> crate::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    let (v4, v6): (Vec<_>, Vec<_>) = addrs.into_iter().partition(|addr| addr.is_ipv4());

    let mut last_err: Option<crate::Error> = None;
    for addr in v4.into_iter().chain(v6) {
        match time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => {
                debug!(addr = %addr, cause = %err, "dial attempt failed");
                last_err = Some(err.into());
            }
            Err(_) => {
                debug!(addr = %addr, "dial attempt timed out");
                last_err = Some("dial timed out".into());
            }
        }
    }

    Err(last_err.unwrap_or_else(|| "target resolved to no addresses".into()))
}
