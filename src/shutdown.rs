use tokio::sync::broadcast;

/// 서버 전역 셧다운 신호의 태스크별 수신기.
///
/// 셧다운 신호는 'broadcast::Receiver'를 통해 전달된다. 값은 최대 한 번만
/// 전송되며, 값이 전송되거나 sender 쪽이 모두 drop되면 서버는 정지 상태로
/// 들어가야 한다.
///
/// 수락 루프, 핸드셰이크 핸들러, 스플라이스 세션은 각자 자신의 'Shutdown'을
/// 들고 진행 중인 작업과 'recv()'를 경합시킨다.
pub(crate) struct Shutdown {
    /// 신호를 이미 수신했다면 'true'.
    received: bool,

    /// 신호를 실어 나르는 채널의 수신 절반.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// 주어진 'broadcast::Receiver'를 기반으로 하는 새로운 'Shutdown'을 생성한다.
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            received: false,
            notify,
        }
    }

    /// 셧다운 신호를 기다린다. 이미 받았다면 즉시 반환한다.
    pub(crate) async fn recv(&mut self) {
        if self.received {
            return;
        }

        // 단 하나의 값만 전송되기 때문에 "lag error"를 수신하는 일은 없다.
        // sender가 모두 drop되어 'Err'를 받는 경우도 셧다운으로 취급한다.
        let _ = self.notify.recv().await;

        self.received = true;
    }
}
