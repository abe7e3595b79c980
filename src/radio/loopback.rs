//! In-process shared medium.
//!
//! Stations attach to a [`LoopbackMedium`] and only hear each other when a
//! link exists between them, with a fixed RSSI per direction. Like a real
//! radio, a transmission reaches every linked neighbour regardless of the
//! frame's destination; address filtering is the mesh core's job.

use async_trait::async_trait;
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{Radio, RadioParams, RxFrame};
use crate::error::{MeshError, MeshResult};

const LOOPBACK_SNR: i8 = 9;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct LoopbackMedium {
    stations: Mutex<HashMap<u8, mpsc::UnboundedSender<RxFrame>>>,
    /// (from, to) -> RSSI heard at `to`.
    links: Mutex<HashMap<(u8, u8), i16>>,
}

impl LoopbackMedium {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a station. Re-attaching an id replaces the previous radio.
    pub fn attach(self: &Arc<Self>, id: u8) -> LoopbackRadio {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.stations).insert(id, tx);
        LoopbackRadio {
            id,
            medium: Arc::clone(self),
            inbox: tokio::sync::Mutex::new(rx),
            configured: AtomicBool::new(false),
            fail_configure: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Symmetric link between `a` and `b`.
    pub fn link(&self, a: u8, b: u8, rssi: i16) {
        let mut links = lock(&self.links);
        links.insert((a, b), rssi);
        links.insert((b, a), rssi);
    }

    pub fn unlink(&self, a: u8, b: u8) {
        let mut links = lock(&self.links);
        links.remove(&(a, b));
        links.remove(&(b, a));
    }

    /// Link consecutive ids: `[1, 2, 3]` gives 1-2 and 2-3.
    pub fn chain(&self, ids: &[u8], rssi: i16) {
        for pair in ids.windows(2) {
            self.link(pair[0], pair[1], rssi);
        }
    }

    /// Cut every link touching `id`.
    pub fn isolate(&self, id: u8) {
        lock(&self.links).retain(|(a, b), _| *a != id && *b != id);
    }

    pub fn neighbours(&self, id: u8) -> Vec<u8> {
        let mut out: Vec<u8> = lock(&self.links)
            .keys()
            .filter(|(from, _)| *from == id)
            .map(|(_, to)| *to)
            .collect();
        out.sort_unstable();
        out
    }

    /// Deliver to every station linked from `from`; returns how many heard it.
    fn transmit(&self, from: u8, bytes: &[u8]) -> usize {
        let targets: Vec<(u8, i16)> = lock(&self.links)
            .iter()
            .filter(|((src, _), _)| *src == from)
            .map(|((_, to), rssi)| (*to, *rssi))
            .collect();
        let stations = lock(&self.stations);
        let mut heard = 0;
        for (to, rssi) in targets {
            if let Some(inbox) = stations.get(&to) {
                let frame = RxFrame {
                    bytes: bytes.to_vec(),
                    rssi,
                    snr: LOOPBACK_SNR,
                };
                if inbox.send(frame).is_ok() {
                    heard += 1;
                }
            }
        }
        trace!("Loopback: {} bytes from {} heard by {}", bytes.len(), from, heard);
        heard
    }
}

#[derive(Debug)]
pub struct LoopbackRadio {
    id: u8,
    medium: Arc<LoopbackMedium>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<RxFrame>>,
    configured: AtomicBool,
    fail_configure: AtomicBool,
    frames_sent: AtomicU64,
}

impl LoopbackRadio {
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Make the next `configure` fail, as a missing radio chip would.
    pub fn fail_configure(&self) {
        self.fail_configure.store(true, Ordering::SeqCst);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Radio for LoopbackRadio {
    async fn configure(&self, params: &RadioParams) -> MeshResult<()> {
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(MeshError::RadioInit(format!(
                "loopback station {} has no radio",
                self.id
            )));
        }
        debug!("Loopback station {} configured: {}", self.id, params);
        self.configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> MeshResult<()> {
        if !self.configured.load(Ordering::SeqCst) {
            return Err(MeshError::Radio("radio not configured".into()));
        }
        self.medium.transmit(self.id, frame);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> MeshResult<Option<RxFrame>> {
        let mut inbox = self.inbox.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(MeshError::Radio("loopback medium dropped".into())),
            Err(_) => Ok(None),
        }
    }
}
