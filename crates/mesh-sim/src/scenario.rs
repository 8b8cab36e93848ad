//! Simulation runs: a Friend serving one LPN, and a PB-ADV transfer

use crate::medium::{Medium, MediumStats};
use ble_mesh::message::SegmentInfo;
use ble_mesh::transaction::{GenericPdu, LinkAction, LinkEvent, TransactionSegmenter};
use ble_mesh::{
    FriendshipEvent, FriendshipInfo, FriendshipObserver, LpnStatus, MeshNodeRuntime,
    NetworkMessage, NodeDriver, Sha256CredentialManager,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use shared::config::{Config, NodeConfig};
use shared::models::Address;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const FRIEND_ADDR: Address = 0x0001;
pub const LPN_ADDR: Address = 0x0100;
/// Node outside radio range whose traffic the Friend buffers
pub const REMOTE_ADDR: Address = 0x0042;
pub const GROUP_ADDR: Address = 0xc001;

const NET_KEY: [u8; 16] = [0x5a; 16];
const INGRESS_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct SimSettings {
    pub duration: Duration,
    pub loss: f64,
    pub seed: u64,
    pub traffic_interval: Duration,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(120),
            loss: 0.1,
            seed: 1,
            traffic_interval: Duration::from_secs(7),
        }
    }
}

impl SimSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            duration: Duration::from_secs(
                env::var("MESH_SIM_SECONDS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()?,
            ),
            loss: env::var("MESH_SIM_LOSS")
                .unwrap_or_else(|_| "0.1".to_string())
                .parse()?,
            seed: env::var("MESH_SIM_SEED")
                .unwrap_or_else(|_| "1".to_string())
                .parse()?,
            traffic_interval: Duration::from_millis(
                env::var("MESH_SIM_TRAFFIC_INTERVAL_MS")
                    .unwrap_or_else(|_| "7000".to_string())
                    .parse()?,
            ),
        })
    }
}

#[derive(Debug, Default)]
struct EventCounter {
    established: AtomicUsize,
    terminated: AtomicUsize,
    polls: AtomicUsize,
    poll_retries: AtomicUsize,
}

impl FriendshipObserver for EventCounter {
    fn on_event(&self, event: &FriendshipEvent) {
        match event {
            FriendshipEvent::LpnEstablished { friend, .. } => {
                info!("LPN found Friend 0x{:04x}", friend);
                self.established.fetch_add(1, Ordering::Relaxed);
            }
            FriendshipEvent::LpnTerminated { friend, .. } => {
                warn!("LPN lost Friend 0x{:04x}", friend);
                self.terminated.fetch_add(1, Ordering::Relaxed);
            }
            FriendshipEvent::LpnPolled { is_retry, .. } => {
                self.polls.fetch_add(1, Ordering::Relaxed);
                if *is_retry {
                    self.poll_retries.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FriendshipReport {
    pub established: usize,
    pub terminated: usize,
    pub lpn_polls: usize,
    pub poll_retries: usize,
    pub messages_offered: usize,
    pub lpn: LpnStatus,
    pub friendships: Vec<FriendshipInfo>,
    pub medium: MediumStats,
}

fn node_config(base: &Config, addr: Address, friend_enabled: bool) -> Config {
    let mut config = base.clone();
    config.node = NodeConfig {
        primary_addr: addr,
        element_count: 1,
    };
    config.friend.enabled = friend_enabled;
    config
}

/// Traffic from the remote node: unicast readings for the LPN, the odd
/// three-segment message, and group traffic.
fn traffic(seq: u32) -> Vec<NetworkMessage> {
    let message = |dst, seq, payload: Vec<u8>, segment| NetworkMessage {
        src: REMOTE_ADDR,
        dst,
        ttl: 5,
        seq,
        iv_index: 0,
        payload,
        segment,
    };
    match seq % 4 {
        1 => (0..3u8)
            .map(|i| {
                message(
                    LPN_ADDR,
                    seq * 3 + i as u32,
                    vec![i; 12],
                    Some(SegmentInfo {
                        seq_zero: (seq & 0x1fff) as u16,
                        seg_index: i,
                        seg_total: 3,
                    }),
                )
            })
            .collect(),
        3 => vec![message(GROUP_ADDR, seq * 3, b"group".to_vec(), None)],
        _ => vec![message(LPN_ADDR, seq * 3, format!("reading {}", seq).into_bytes(), None)],
    }
}

/// Runs a Friend and an LPN over a lossy medium for `settings.duration`.
pub async fn run_friendship(config: &Config, settings: &SimSettings) -> anyhow::Result<FriendshipReport> {
    info!(
        "Simulating friendship for {:?} with {:.0}% loss",
        settings.duration,
        settings.loss * 100.0
    );
    let medium = Medium::new(settings.loss, settings.seed);
    let events = Arc::new(EventCounter::default());
    let now = Instant::now().into_std();

    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for (addr, friend_enabled) in [(FRIEND_ADDR, true), (LPN_ADDR, false)] {
        let mut runtime = MeshNodeRuntime::new(
            &node_config(config, addr, friend_enabled),
            Box::new(Sha256CredentialManager),
        );
        runtime.add_subnet(now, 0, NET_KEY);
        let (mut driver, handle) = NodeDriver::new(runtime, medium.bearer(addr).await, INGRESS_DEPTH);
        driver.add_observer(events.clone());
        medium.attach(addr, handle.clone()).await;
        tasks.push(tokio::spawn(driver.run()));
        handles.push(handle);
    }
    let (friend, lpn) = (&handles[0], &handles[1]);

    lpn.group_add(GROUP_ADDR).await?;
    lpn.lpn_set(true).await?;

    let end = Instant::now() + settings.duration;
    let mut ticker = tokio::time::interval(settings.traffic_interval);
    let mut seq = 0u32;
    let mut offered = 0;
    while Instant::now() < end {
        ticker.tick().await;
        for message in traffic(seq) {
            friend.message(0, message).await?;
            offered += 1;
        }
        seq += 1;
    }

    let report = FriendshipReport {
        established: events.established.load(Ordering::Relaxed),
        terminated: events.terminated.load(Ordering::Relaxed),
        lpn_polls: events.polls.load(Ordering::Relaxed),
        poll_retries: events.poll_retries.load(Ordering::Relaxed),
        messages_offered: offered,
        lpn: lpn.lpn_status().await?,
        friendships: friend.friendships().await?,
        medium: medium.stats().await,
    };

    for handle in &handles {
        handle.shutdown();
    }
    for task in tasks {
        task.await?;
    }
    Ok(report)
}

#[derive(Debug, Serialize)]
pub struct TransferReport {
    pub payload_len: usize,
    pub delivered: bool,
    pub acked: bool,
    /// Reliable batches put on air, first transmission included
    pub transmissions: usize,
    pub elapsed: Duration,
}

/// Moves everything `from` wants to send to `to`, dropping copies at
/// random. Returns the events `from` raised.
fn pump(
    from: &mut TransactionSegmenter,
    to: &mut TransactionSegmenter,
    now: std::time::Instant,
    rng: &mut StdRng,
    loss: f64,
    transmissions: &mut usize,
) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    for action in from.drain() {
        match action {
            LinkAction::Transmit {
                pdus,
                transmit,
                reliable,
            } => {
                for pdu in pdus {
                    let copies = transmit.count.max(1);
                    if !(0..copies).any(|_| rng.gen::<f64>() >= loss) {
                        continue;
                    }
                    let decoded = match GenericPdu::decode(&pdu.encode()) {
                        Ok(pdu) => pdu,
                        Err(e) => {
                            warn!("Undecodable provisioning PDU: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = to.handle_pdu(&decoded) {
                        debug!("Provisioning PDU dropped: {}", e);
                    }
                }
                if reliable {
                    *transmissions += 1;
                    from.on_transmit_complete(now);
                }
            }
            LinkAction::Event(event) => events.push(event),
        }
    }
    events
}

/// Sends one provisioning PDU across a lossy PB-ADV link in virtual time.
pub fn run_transfer(payload: &[u8], loss: f64, seed: u64) -> anyhow::Result<TransferReport> {
    let mut rng = StdRng::seed_from_u64(seed);
    let link_id: u32 = rng.gen();
    let start = std::time::Instant::now();
    let mut now = start;

    let mut provisioner = TransactionSegmenter::new(link_id, true, payload.len());
    let mut device = TransactionSegmenter::new(link_id, false, payload.len());
    provisioner.send(now, payload)?;

    let mut transmissions = 0;
    let mut delivered = false;
    let mut acked = false;
    loop {
        let mut quiet = true;
        for event in pump(&mut provisioner, &mut device, now, &mut rng, loss, &mut transmissions) {
            quiet = false;
            match event {
                LinkEvent::Acked { .. } => acked = true,
                other => info!("Provisioner link event {:?}", other),
            }
        }
        for event in pump(&mut device, &mut provisioner, now, &mut rng, loss, &mut 0) {
            quiet = false;
            if let LinkEvent::Received(data) = event {
                delivered = data == payload;
            }
        }
        if acked {
            break;
        }
        if quiet {
            let Some(deadline) = provisioner.next_deadline() else {
                break;
            };
            now = deadline.max(now);
            provisioner.poll_timers(now);
        }
    }

    let report = TransferReport {
        payload_len: payload.len(),
        delivered,
        acked,
        transmissions,
        elapsed: now.saturating_duration_since(start),
    };
    info!(
        "PB-ADV transfer of {} bytes: acked={} after {} transmissions",
        report.payload_len, report.acked, report.transmissions
    );
    Ok(report)
}
