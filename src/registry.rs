use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::handshake::Role;
use crate::probe;

/*
핸드셰이크를 마치고 페어링을 기다리는 하프 커넥션.

소유권이 상태를 말해준다. 레지스트리가 들고 있는 동안은 "파킹", 페어링과 함께
스플라이서로 넘어가면 "활성", drop되면 소켓이 닫힌 것이다. 파킹된 소켓의
바이트를 읽는 주체는 없다. 생존 확인('probe')조차 커널 테이블만 들여다본다.
*/
pub(crate) struct HalfConnection {
    // CONNECTED 상태의 소켓. drop 시 닫힌다.
    pub(crate) stream: TcpStream,

    // 어느 리스너로 들어왔는가.
    pub(crate) role: Role,

    // 랑데부 식별자. 워드 문자 1개 이상.
    pub(crate) id: String,

    // 로깅 전용.
    pub(crate) peer_addr: SocketAddr,

    // 파킹된 시각. 페어링 로그에 대기 시간을 남기는 용도이다.
    pub(crate) parked_at: Instant,

    // 커넥션 수 제한 permit. 소켓과 함께 이동하고 소켓과 함께 반환된다.
    pub(crate) _permit: Option<OwnedSemaphorePermit>,
}

/*
id → 파킹된 하프 커넥션 테이블. 모든 랑데부 결정의 직렬화 지점이다.

디스패처 태스크만이 이 타입에 손을 대므로 락 없이 평범한 'HashMap'으로
충분하다. 같은 id에 대한 두 'submit'이 서로 끼어들 수 없어야 한다는 것이
유일한 동시성 요구사항이고, 단일 소유자가 그것을 보장한다. 핸드셰이크가
별도 태스크에서 끝나더라도 그 결과는 채널을 타고 디스패처로 모인다.
*/
pub(crate) struct RendezvousRegistry {
    parked: HashMap<String, HalfConnection>,

    // 같은 역할 충돌 시 신규를 거절할지(true), 기존을 교체할지(false).
    refuse_extra: bool,
}

impl RendezvousRegistry {
    pub(crate) fn new(refuse_extra: bool) -> RendezvousRegistry {
        RendezvousRegistry {
            parked: HashMap::new(),
            refuse_extra,
        }
    }

    /*
    하프 커넥션을 배치하거나 페어링한다.

    반대 역할이 이미 파킹되어 있으면 해당 엔트리를 테이블에서 제거한 뒤
    (파킹되어 있던 쪽, 새로 도착한 쪽) 순서의 페어를 반환한다. 엔트리 제거가
    반환보다 먼저이므로, 페어의 소켓에 바이트가 흐르는 시점에 id는 이미
    테이블에 없다. 그 외의 모든 경우는 None이다.

    같은 역할이 이미 파킹되어 있을 때의 우선순위:
    1. 기존 소켓이 죽어있으면 정책과 무관하게 먼저 퇴거시키고 자리를 내준다.
    2. refuse 모드라면 신규를 버린다. 기존 엔트리는 파킹 시각까지 그대로다.
    3. 아니면 last-writer-wins. 기존 소켓을 닫고 신규를 파킹한다.
    */
    pub(crate) fn submit(
        &mut self,
        half: HalfConnection,
    ) -> Option<(HalfConnection, HalfConnection)> {
        let existing = match self.parked.remove(&half.id) {
            Some(existing) => existing,
            None => {
                self.park(half);
                return None;
            }
        };

        if existing.role != half.role {
            info!(
                id = %half.id,
                parked_role = %existing.role,
                parked_peer = %existing.peer_addr,
                new_peer = %half.peer_addr,
                waited_ms = existing.parked_at.elapsed().as_millis() as u64,
                "pairing connections"
            );
            return Some((existing, half));
        }

        if !probe::is_alive(&existing.stream) {
            debug!(id = %half.id, peer = %existing.peer_addr, "evicting dead parked connection");
            drop(existing);
            self.park(half);
            return None;
        }

        if self.refuse_extra {
            // 신규 쪽이 drop으로 닫힌다. 기존 엔트리는 되돌려 놓는다.
            info!(id = %half.id, role = %half.role, peer = %half.peer_addr, "refusing extra");
            self.parked.insert(existing.id.clone(), existing);
            return None;
        }

        info!(
            id = %half.id,
            role = %half.role,
            old_peer = %existing.peer_addr,
            new_peer = %half.peer_addr,
            "replacing parked connection"
        );
        drop(existing);
        self.park(half);
        None
    }

    /*
    상대측이 이미 닫은 파킹 엔트리를 퇴거시킨다.

    새 트래픽이 전혀 없어도 파일 디스크립터가 회수되도록 디스패처가 주기적으로
    호출한다. 모든 파킹 소켓이 살아있다면 아무것도 바뀌지 않는다.
    */
    pub(crate) fn sweep(&mut self) {
        self.parked.retain(|id, half| {
            let alive = probe::is_alive(&half.stream);
            if !alive {
                info!(id = %id, role = %half.role, peer = %half.peer_addr, "sweeping dead parked connection");
            }
            alive
        });
    }

    /*
    셧다운. 파킹된 소켓을 전부 닫는다.
    */
    pub(crate) fn drain(&mut self) {
        if !self.parked.is_empty() {
            info!(count = self.parked.len(), "draining parked connections");
        }
        self.parked.clear();
    }

    fn park(&mut self, mut half: HalfConnection) {
        half.parked_at = Instant::now();
        debug!(id = %half.id, role = %half.role, peer = %half.peer_addr, "parking connection");
        self.parked.insert(half.id.clone(), half);
    }

    #[cfg(test)]
    fn parked_peer(&self, id: &str) -> Option<SocketAddr> {
        self.parked.get(id).map(|half| half.peer_addr)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.parked.len()
    }
}
