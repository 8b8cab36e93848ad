//! Tokio task driving a [`MeshNodeRuntime`]
//!
//! Everything that reaches the node (received PDUs, bearer progress and
//! commands) goes through one bounded channel, so the runtime is only ever
//! touched from the driver task.

use crate::adapter::{Bearer, SendProgress};
use crate::context::{Action, FriendshipObserver, SendEvent, SendToken};
use crate::error::{MeshError, MeshResult};
use crate::friend::FriendshipInfo;
use crate::lpn::LpnStatus;
use crate::message::{NetworkMessage, RxContext};
use crate::runtime::MeshNodeRuntime;
use crate::subnet::{IvIndex, NetKey};
use shared::models::{Address, NetIdx};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest a bearer may take for one PDU beyond its own repeat span
const SEND_DEADLINE: Duration = Duration::from_secs(5);

pub type Reply<T> = oneshot::Sender<T>;

pub enum Command {
    FriendSet(bool),
    LpnSet(bool, Reply<MeshResult<()>>),
    LpnPoll(Reply<MeshResult<()>>),
    GroupAdd(Address, Reply<MeshResult<()>>),
    GroupRemove(Address, Reply<MeshResult<()>>),
    AddSubnet(NetIdx, NetKey),
    DeleteSubnet(NetIdx, Reply<MeshResult<()>>),
    StartKeyRefresh(NetIdx, NetKey, Reply<MeshResult<()>>),
    AdvanceKeyRefresh(NetIdx, Reply<MeshResult<()>>),
    SetIvIndex(IvIndex),
    SegmentedTx(bool),
    LpnStatus(Reply<LpnStatus>),
    Friendships(Reply<Vec<FriendshipInfo>>),
}

pub enum Ingress {
    /// Transport control PDU addressed to this node
    Control {
        rx: RxContext,
        opcode: u8,
        params: Vec<u8>,
    },
    /// Network traffic the Friend may have to buffer
    Message {
        net_idx: NetIdx,
        message: NetworkMessage,
    },
    /// Relayed message our Friend delivered
    FriendData { rx: RxContext },
    Send {
        token: SendToken,
        event: SendEvent,
    },
    Command(Command),
}

fn closed<T>(_: T) -> MeshError {
    MeshError::Shutdown
}

/// Cloneable entry point into a running node.
#[derive(Clone)]
pub struct NodeHandle {
    ingress: mpsc::Sender<Ingress>,
    cancel: CancellationToken,
}

impl NodeHandle {
    async fn send(&self, ingress: Ingress) -> MeshResult<()> {
        self.ingress.send(ingress).await.map_err(closed)
    }

    /// For radio callbacks that cannot await.
    fn try_send(&self, ingress: Ingress) -> MeshResult<()> {
        self.ingress.try_send(ingress).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                MeshError::ResourceExhaustion("node ingress queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => MeshError::Shutdown,
        })
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> MeshResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(Ingress::Command(make(tx))).await?;
        rx.await.map_err(closed)
    }

    pub async fn control(&self, rx: RxContext, opcode: u8, params: Vec<u8>) -> MeshResult<()> {
        self.send(Ingress::Control { rx, opcode, params }).await
    }

    pub fn try_control(&self, rx: RxContext, opcode: u8, params: Vec<u8>) -> MeshResult<()> {
        self.try_send(Ingress::Control { rx, opcode, params })
    }

    pub async fn message(&self, net_idx: NetIdx, message: NetworkMessage) -> MeshResult<()> {
        self.send(Ingress::Message { net_idx, message }).await
    }

    pub fn try_message(&self, net_idx: NetIdx, message: NetworkMessage) -> MeshResult<()> {
        self.try_send(Ingress::Message { net_idx, message })
    }

    pub async fn friend_data(&self, rx: RxContext) -> MeshResult<()> {
        self.send(Ingress::FriendData { rx }).await
    }

    pub fn try_friend_data(&self, rx: RxContext) -> MeshResult<()> {
        self.try_send(Ingress::FriendData { rx })
    }

    pub async fn friend_set(&self, enabled: bool) -> MeshResult<()> {
        self.send(Ingress::Command(Command::FriendSet(enabled))).await
    }

    pub async fn lpn_set(&self, enabled: bool) -> MeshResult<()> {
        self.request(|r| Command::LpnSet(enabled, r)).await?
    }

    pub async fn lpn_poll(&self) -> MeshResult<()> {
        self.request(Command::LpnPoll).await?
    }

    pub async fn group_add(&self, addr: Address) -> MeshResult<()> {
        self.request(|r| Command::GroupAdd(addr, r)).await?
    }

    pub async fn group_remove(&self, addr: Address) -> MeshResult<()> {
        self.request(|r| Command::GroupRemove(addr, r)).await?
    }

    pub async fn add_subnet(&self, net_idx: NetIdx, net_key: NetKey) -> MeshResult<()> {
        self.send(Ingress::Command(Command::AddSubnet(net_idx, net_key)))
            .await
    }

    pub async fn delete_subnet(&self, net_idx: NetIdx) -> MeshResult<()> {
        self.request(|r| Command::DeleteSubnet(net_idx, r)).await?
    }

    pub async fn start_key_refresh(&self, net_idx: NetIdx, new_key: NetKey) -> MeshResult<()> {
        self.request(|r| Command::StartKeyRefresh(net_idx, new_key, r))
            .await?
    }

    pub async fn advance_key_refresh(&self, net_idx: NetIdx) -> MeshResult<()> {
        self.request(|r| Command::AdvanceKeyRefresh(net_idx, r)).await?
    }

    pub async fn set_iv_index(&self, iv: IvIndex) -> MeshResult<()> {
        self.send(Ingress::Command(Command::SetIvIndex(iv))).await
    }

    pub async fn set_segmented_tx(&self, active: bool) -> MeshResult<()> {
        self.send(Ingress::Command(Command::SegmentedTx(active)))
            .await
    }

    pub async fn lpn_status(&self) -> MeshResult<LpnStatus> {
        self.request(Command::LpnStatus).await
    }

    pub async fn friendships(&self) -> MeshResult<Vec<FriendshipInfo>> {
        self.request(Command::Friendships).await
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

pub struct NodeDriver {
    runtime: MeshNodeRuntime,
    bearer: Arc<dyn Bearer>,
    observers: Vec<Arc<dyn FriendshipObserver>>,
    ingress_tx: mpsc::Sender<Ingress>,
    ingress_rx: mpsc::Receiver<Ingress>,
    cancel: CancellationToken,
}

impl NodeDriver {
    /// # Arguments
    ///
    /// * `runtime` - Node state, already provisioned with its subnets
    /// * `bearer` - Radio used for every outgoing PDU
    /// * `capacity` - Depth of the ingress channel
    pub fn new(
        runtime: MeshNodeRuntime,
        bearer: Arc<dyn Bearer>,
        capacity: usize,
    ) -> (Self, NodeHandle) {
        let (ingress_tx, ingress_rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let handle = NodeHandle {
            ingress: ingress_tx.clone(),
            cancel: cancel.clone(),
        };
        let driver = Self {
            runtime,
            bearer,
            observers: Vec::new(),
            ingress_tx,
            ingress_rx,
            cancel,
        };
        (driver, handle)
    }

    pub fn add_observer(&mut self, observer: Arc<dyn FriendshipObserver>) {
        self.observers.push(observer);
    }

    fn now() -> std::time::Instant {
        Instant::now().into_std()
    }

    /// Runs until shut down and hands the runtime back.
    pub async fn run(mut self) -> MeshNodeRuntime {
        info!(
            "Mesh node 0x{:04x} running",
            self.runtime.primary_addr()
        );
        self.runtime.start(Self::now());

        loop {
            self.flush_actions().await;

            let deadline = self.runtime.next_deadline();
            let wake = deadline
                .map(Instant::from_std)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Mesh node 0x{:04x} shutting down", self.runtime.primary_addr());
                    break;
                }

                ingress = self.ingress_rx.recv() => {
                    match ingress {
                        Some(ingress) => self.handle(ingress),
                        None => break,
                    }
                }

                _ = sleep_until(wake), if deadline.is_some() => {
                    self.runtime.poll_timers(Self::now());
                }
            }
        }

        self.runtime
    }

    fn handle(&mut self, ingress: Ingress) {
        let now = Self::now();
        match ingress {
            Ingress::Control { rx, opcode, params } => {
                // Errors are already logged by the runtime.
                let _ = self.runtime.handle_control(now, &rx, opcode, &params);
            }
            Ingress::Message { net_idx, message } => {
                let taken = self.runtime.submit_for_lpn(now, net_idx, &message);
                if taken > 0 {
                    debug!("Message from 0x{:04x} queued for {} LPNs", message.src, taken);
                }
            }
            Ingress::FriendData { rx } => {
                let _ = self.runtime.handle_friend_data(now, &rx);
            }
            Ingress::Send { token, event } => self.runtime.on_send_event(now, token, event),
            Ingress::Command(command) => self.handle_command(now, command),
        }
    }

    fn handle_command(&mut self, now: std::time::Instant, command: Command) {
        let rt = &mut self.runtime;
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            Command::FriendSet(enabled) => rt.friend_set(now, enabled),
            Command::LpnSet(enabled, reply) => {
                let _ = reply.send(rt.lpn_set(now, enabled));
            }
            Command::LpnPoll(reply) => {
                let _ = reply.send(rt.lpn_poll(now));
            }
            Command::GroupAdd(addr, reply) => {
                let _ = reply.send(rt.lpn_group_add(now, addr));
            }
            Command::GroupRemove(addr, reply) => {
                let _ = reply.send(rt.lpn_group_remove(now, addr));
            }
            Command::AddSubnet(net_idx, key) => rt.add_subnet(now, net_idx, key),
            Command::DeleteSubnet(net_idx, reply) => {
                let _ = reply.send(rt.delete_subnet(now, net_idx));
            }
            Command::StartKeyRefresh(net_idx, key, reply) => {
                let _ = reply.send(rt.start_key_refresh(now, net_idx, key));
            }
            Command::AdvanceKeyRefresh(net_idx, reply) => {
                let _ = reply.send(rt.advance_key_refresh(now, net_idx));
            }
            Command::SetIvIndex(iv) => rt.set_iv_index(now, iv),
            Command::SegmentedTx(active) => rt.set_segmented_tx(active),
            Command::LpnStatus(reply) => {
                let _ = reply.send(rt.lpn_status());
            }
            Command::Friendships(reply) => {
                let _ = reply.send(rt.friendships());
            }
        }
    }

    async fn flush_actions(&mut self) {
        for action in self.runtime.drain_actions() {
            match action {
                Action::Send { token, pdu } => {
                    let bearer = self.bearer.clone();
                    let ingress = self.ingress_tx.clone();
                    tokio::spawn(async move {
                        let progress = SendProgress::new(token, ingress.clone());
                        let limit = SEND_DEADLINE + pdu.transmit.span();
                        let result =
                            match tokio::time::timeout(limit, bearer.transmit(&pdu, progress)).await {
                                Ok(result) => result,
                                Err(_) => Err(MeshError::TransmissionFailed(format!(
                                    "bearer still busy after {:?}",
                                    limit
                                ))),
                            };
                        if let Err(e) = &result {
                            warn!("Transmission of {:?} failed: {}", token, e);
                        }
                        let event = Ingress::Send {
                            token,
                            event: SendEvent::Sent(result),
                        };
                        if ingress.send(event).await.is_err() {
                            debug!("Node stopped before send {:?} completed", token);
                        }
                    });
                }
                Action::Scan(enabled) => {
                    if let Err(e) = self.bearer.set_scanning(enabled).await {
                        warn!("Failed to switch scanning {}: {}", if enabled { "on" } else { "off" }, e);
                    }
                }
                Action::Event(event) => {
                    debug!("Friendship event {:?}", event);
                    for observer in &self.observers {
                        observer.on_event(&event);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FriendshipEvent;
    use crate::credentials::Sha256CredentialManager;
    use crate::message::OutboundPdu;
    use crate::wire::ControlPdu;
    use async_trait::async_trait;
    use shared::config::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBearer {
        sent: Mutex<Vec<OutboundPdu>>,
        scanning: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Bearer for RecordingBearer {
        async fn transmit(&self, pdu: &OutboundPdu, mut progress: SendProgress) -> MeshResult<()> {
            progress.started().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.sent.lock().unwrap().push(pdu.clone());
            Ok(())
        }

        async fn set_scanning(&self, enabled: bool) -> MeshResult<()> {
            self.scanning.lock().unwrap().push(enabled);
            Ok(())
        }
    }

    /// Starts every transmission and never finishes it.
    #[derive(Default)]
    struct StuckBearer {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Bearer for StuckBearer {
        async fn transmit(&self, _pdu: &OutboundPdu, mut progress: SendProgress) -> MeshResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            progress.started().await;
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn set_scanning(&self, _enabled: bool) -> MeshResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct EventLog(Mutex<Vec<FriendshipEvent>>);

    impl FriendshipObserver for EventLog {
        fn on_event(&self, event: &FriendshipEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn requests(bearer: &RecordingBearer) -> usize {
        bearer
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|p| matches!(p.control(), Some(ControlPdu::Request(_))))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_lpn_keeps_looking_for_friend() {
        let mut runtime = MeshNodeRuntime::new(&Config::default(), Box::new(Sha256CredentialManager));
        runtime.add_subnet(Instant::now().into_std(), 0, [3; 16]);
        let bearer = Arc::new(RecordingBearer::default());
        let (driver, handle) = NodeDriver::new(runtime, bearer.clone(), 16);
        let task = tokio::spawn(driver.run());

        handle.lpn_set(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(requests(&bearer), 1);

        // 1.1 s without offers, then the 8 s retry timeout.
        tokio::time::sleep(Duration::from_millis(9_200)).await;
        assert_eq!(requests(&bearer), 2);

        let status = handle.lpn_status().await.unwrap();
        assert!(!status.established);

        handle.shutdown();
        let runtime = task.await.unwrap();
        assert!(!runtime.lpn_status().established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_see_friend_disable() {
        let mut runtime = MeshNodeRuntime::new(&Config::default(), Box::new(Sha256CredentialManager));
        runtime.add_subnet(Instant::now().into_std(), 0, [3; 16]);
        let (mut driver, handle) =
            NodeDriver::new(runtime, Arc::new(RecordingBearer::default()), 16);
        let log = Arc::new(EventLog::default());
        driver.add_observer(log.clone());
        let task = tokio::spawn(driver.run());

        handle.friend_set(false).await.unwrap();
        assert!(handle.friendships().await.unwrap().is_empty());
        assert!(log.0.lock().unwrap().is_empty());

        handle.shutdown();
        task.await.unwrap();
        assert!(matches!(handle.lpn_set(true).await, Err(MeshError::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_bearer_fails_the_send() {
        let mut runtime = MeshNodeRuntime::new(&Config::default(), Box::new(Sha256CredentialManager));
        runtime.add_subnet(Instant::now().into_std(), 0, [3; 16]);
        let bearer = Arc::new(StuckBearer::default());
        let (driver, handle) = NodeDriver::new(runtime, bearer.clone(), 16);
        let task = tokio::spawn(driver.run());

        handle.lpn_set(true).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(bearer.attempts.load(Ordering::SeqCst), 1);

        // The Friend Request fails at the send deadline and is retried 8 s later.
        tokio::time::sleep(Duration::from_secs(13)).await;
        assert_eq!(bearer.attempts.load(Ordering::SeqCst), 2);

        handle.shutdown();
        task.await.unwrap();
    }
}
