//! Simulated advertising medium shared by every node of a run

use async_trait::async_trait;
use ble_mesh::message::{OutboundBody, Security};
use ble_mesh::{Bearer, MeshResult, NodeHandle, OutboundPdu, RxContext, SendProgress};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use shared::models::{is_group, Address};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Signal strength every receiver reports
const SIM_RSSI: i8 = -45;

#[derive(Debug, Default, Clone, Serialize)]
pub struct MediumStats {
    pub transmitted: usize,
    pub delivered: usize,
    pub lost: usize,
    /// Arrived while the receiver had scanning off
    pub missed: usize,
    /// Relayed messages handed from a Friend to its LPN
    pub friend_data: usize,
}

struct Station {
    addr: Address,
    scanning: Arc<AtomicBool>,
    handle: Option<NodeHandle>,
}

struct State {
    stations: Vec<Station>,
    rng: StdRng,
    stats: MediumStats,
}

pub struct Medium {
    loss: f64,
    state: Mutex<State>,
}

impl Medium {
    /// # Arguments
    ///
    /// * `loss` - Probability that a single copy of a PDU is lost
    /// * `seed` - Seed for the loss generator, so runs can be repeated
    pub fn new(loss: f64, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            loss: loss.clamp(0.0, 1.0),
            state: Mutex::new(State {
                stations: Vec::new(),
                rng: StdRng::seed_from_u64(seed),
                stats: MediumStats::default(),
            }),
        })
    }

    /// Creates the radio of the node at `addr`; it starts out scanning.
    pub async fn bearer(self: &Arc<Self>, addr: Address) -> Arc<RadioBearer> {
        let scanning = Arc::new(AtomicBool::new(true));
        self.state.lock().await.stations.push(Station {
            addr,
            scanning: scanning.clone(),
            handle: None,
        });
        Arc::new(RadioBearer {
            addr,
            scanning,
            medium: self.clone(),
        })
    }

    /// Connects the running node behind `addr` to the medium.
    pub async fn attach(&self, addr: Address, handle: NodeHandle) {
        let mut state = self.state.lock().await;
        if let Some(station) = state.stations.iter_mut().find(|s| s.addr == addr) {
            station.handle = Some(handle);
        }
    }

    pub async fn stats(&self) -> MediumStats {
        self.state.lock().await.stats.clone()
    }

    async fn deliver(&self, from: Address, pdu: &OutboundPdu) {
        let mut guard = self.state.lock().await;
        let State {
            stations,
            rng,
            stats,
        } = &mut *guard;
        stats.transmitted += 1;

        for station in stations.iter() {
            if station.addr == from || !(station.addr == pdu.dst || is_group(pdu.dst)) {
                continue;
            }
            // The network cache drops repeats, so one surviving copy is enough.
            let copies = pdu.transmit.count.max(1);
            if !(0..copies).any(|_| rng.gen::<f64>() >= self.loss) {
                stats.lost += 1;
                trace!("PDU from 0x{:04x} lost towards 0x{:04x}", from, station.addr);
                continue;
            }
            if !station.scanning.load(Ordering::SeqCst) {
                stats.missed += 1;
                continue;
            }
            let Some(handle) = &station.handle else {
                continue;
            };

            let mut rx = RxContext {
                net_idx: pdu.net_idx,
                src: pdu.src,
                dst: pdu.dst,
                ttl: pdu.ttl,
                rssi: SIM_RSSI,
                friend_credentials: pdu.uses_friend_credentials(),
                new_key: matches!(pdu.security, Security::Friend { new_key: true, .. }),
            };
            let result = match &pdu.body {
                OutboundBody::Control(control) => {
                    handle.try_control(rx, control.opcode(), control.encode())
                }
                OutboundBody::Relayed { message, .. } => {
                    rx.src = message.src;
                    rx.dst = message.dst;
                    stats.friend_data += 1;
                    handle.try_friend_data(rx)
                }
            };
            match result {
                Ok(()) => stats.delivered += 1,
                Err(e) => debug!("Node 0x{:04x} refused a PDU: {}", station.addr, e),
            }
        }
    }
}

/// One node's view of the [`Medium`]
pub struct RadioBearer {
    addr: Address,
    scanning: Arc<AtomicBool>,
    medium: Arc<Medium>,
}

#[async_trait]
impl Bearer for RadioBearer {
    async fn transmit(&self, pdu: &OutboundPdu, mut progress: SendProgress) -> MeshResult<()> {
        progress.started().await;
        self.medium.deliver(self.addr, pdu).await;
        tokio::time::sleep(pdu.transmit.span()).await;
        Ok(())
    }

    async fn set_scanning(&self, enabled: bool) -> MeshResult<()> {
        self.scanning.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}
