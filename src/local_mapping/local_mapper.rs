//! Local Mapper - map maintenance worker fed by the tracker.
//!
//! KeyFrames reach the worker already inserted in the map; it receives ids
//! over a bounded channel and, for each one:
//! 1. Refreshes normals and descriptors of the points the KeyFrame matched
//! 2. Culls recently created points that tracking does not confirm
//! 3. Culls covisible KeyFrames whose points are seen well enough elsewhere
//! 4. Forwards the KeyFrame to loop closing
//!
//! The tracker steers it through the flags of [`LocalMapping`]: accepting,
//! stop and release for localization mode, and reset.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::system::collaborators::{LocalMapping, LoopClosing};
use crate::system::shared_state::SharedState;

/// Capacity of the keyframe channel between Tracking and Local Mapping.
/// When the channel is full, Tracking blocks briefly.
pub const KEYFRAME_CHANNEL_CAPACITY: usize = 5;

/// Timeout for receiving keyframes. Allows periodic shutdown, stop and
/// reset checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Polling period while stopped or waiting for a reset.
const POLL: Duration = Duration::from_millis(3);

const MIN_FOUND_RATIO: f64 = 0.25;
/// KeyFrames after creation at which a point must be well observed.
const GRACE_KEYFRAMES: u64 = 2;
/// KeyFrames after creation at which a point leaves the recent list.
const RECENT_KEYFRAMES: u64 = 3;

/// Observations a point needs in other KeyFrames to make one redundant.
const REDUNDANT_OBSERVATIONS: usize = 3;
const REDUNDANT_RATIO: f64 = 0.9;

/// Local Mapping worker state, shared between the worker thread and the
/// tracker.
pub struct LocalMapper {
    shared: Arc<SharedState>,
    monocular: bool,

    kf_sender: Sender<KeyFrameId>,
    kf_receiver: Receiver<KeyFrameId>,

    loop_closer: RwLock<Option<Arc<dyn LoopClosing>>>,

    /// Points created with a KeyFrame, with the id of that KeyFrame, still
    /// on probation.
    recent_points: Mutex<Vec<(MapPointId, KeyFrameId)>>,

    accepting: AtomicBool,
    abort_ba: AtomicBool,
    reset_requested: AtomicBool,
    running: AtomicBool,

    /// Guards the stop handshake (stop_requested, stopped, not_stop).
    stop_lock: Mutex<()>,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    not_stop: AtomicBool,
}

impl LocalMapper {
    pub fn new(shared: Arc<SharedState>, monocular: bool) -> Arc<Self> {
        let (kf_sender, kf_receiver) = bounded(KEYFRAME_CHANNEL_CAPACITY);
        Arc::new(Self {
            shared,
            monocular,
            kf_sender,
            kf_receiver,
            loop_closer: RwLock::new(None),
            recent_points: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            abort_ba: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stop_lock: Mutex::new(()),
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            not_stop: AtomicBool::new(false),
        })
    }

    /// Forward processed KeyFrames to loop closing.
    pub fn set_loop_closer(&self, loop_closer: Arc<dyn LoopClosing>) {
        *self.loop_closer.write() = Some(loop_closer);
    }

    /// Spawn the worker thread.
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mapper = Arc::clone(self);
        self.running.store(true, Ordering::SeqCst);
        thread::Builder::new()
            .name("local_mapping".into())
            .spawn(move || mapper.run())
            .context("Failed to spawn local mapping thread")
    }

    /// Main thread loop: receive keyframes and process them.
    ///
    /// This runs until shutdown is requested or the channel is closed.
    fn run(&self) {
        info!("LocalMapper thread started");
        self.running.store(true, Ordering::SeqCst);
        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }

            self.reset_if_requested();

            if self.try_stop() {
                while self.is_stopped() && !self.shared.is_shutdown_requested() {
                    if self.reset_requested.load(Ordering::SeqCst) {
                        self.reset_if_requested();
                    }
                    thread::sleep(POLL);
                }
                continue;
            }

            self.accepting.store(true, Ordering::SeqCst);
            match self.kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(kf_id) => {
                    self.accepting.store(false, Ordering::SeqCst);
                    self.process_keyframe(kf_id);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("LocalMapper thread finished");
    }

    /// Process a single keyframe.
    pub fn process_keyframe(&self, kf_id: KeyFrameId) {
        self.abort_ba.store(false, Ordering::SeqCst);

        self.refresh_keyframe_points(kf_id);
        self.cull_map_points(kf_id);

        // Culling waits while more work is queued or a stop is pending
        if self.kf_receiver.is_empty() && !self.stop_requested() && !self.abort_ba.load(Ordering::SeqCst) {
            self.cull_keyframes(kf_id);
        }

        if let Some(loop_closer) = self.loop_closer.read().as_ref() {
            loop_closer.insert_keyframe(kf_id);
        }
    }

    /// Points the KeyFrame created go on probation; points it matched get
    /// their normal and descriptor recomputed with the new observation.
    fn refresh_keyframe_points(&self, kf_id: KeyFrameId) {
        let mut map = self.shared.map.write();
        let Some(kf) = map.get_keyframe(kf_id) else {
            debug!("[LocalMapping] {} no longer in the map", kf_id);
            return;
        };
        let point_ids: Vec<MapPointId> = kf.map_point_indices().map(|(_, id)| id).collect();

        let mut recent = self.recent_points.lock();
        for mp_id in point_ids {
            let created_here = map
                .get_map_point(mp_id)
                .is_some_and(|mp| mp.ref_kf == Some(kf_id) && mp.observations.len() == 1);
            if created_here {
                recent.push((mp_id, kf_id));
            } else {
                map.update_normal_and_depth(mp_id);
                map.compute_distinctive_descriptor(mp_id);
            }
        }
    }

    /// Cull recent points.
    ///
    /// Removes points that:
    /// - are found in less than a quarter of the frames that should see them
    /// - two KeyFrames after creation, are observed by too few KeyFrames
    ///
    /// Points older than three KeyFrames leave probation.
    fn cull_map_points(&self, current_kf_id: KeyFrameId) {
        let th_obs = if self.monocular { 2 } else { 3 };

        let mut map = self.shared.map.write();
        let mut recent = self.recent_points.lock();
        let mut culled = 0;

        recent.retain(|(mp_id, first_kf)| {
            let Some(mp) = map.get_map_point(*mp_id) else {
                return false;
            };
            let age = current_kf_id.0.saturating_sub(first_kf.0);
            if mp.found_ratio() < MIN_FOUND_RATIO {
                map.erase_map_point(*mp_id);
                culled += 1;
                false
            } else if age >= GRACE_KEYFRAMES && mp.num_observations() <= th_obs {
                map.erase_map_point(*mp_id);
                culled += 1;
                false
            } else {
                age < RECENT_KEYFRAMES
            }
        });

        if culled > 0 {
            debug!(
                "[MapCulling] Removed {} map points (remaining: {})",
                culled,
                map.num_map_points()
            );
        }
    }

    /// Cull redundant keyframes.
    ///
    /// Removes covisible keyframes where more than 90% of their close points
    /// are seen, at the same or a finer scale, by at least three other
    /// keyframes. The first keyframe of the map is never culled. KeyFrames
    /// are checked one at a time, so each removal is visible to the next
    /// check.
    fn cull_keyframes(&self, current_kf_id: KeyFrameId) {
        let mut map = self.shared.map.write();
        let Some(current) = map.get_keyframe(current_kf_id) else {
            return;
        };
        let local: Vec<KeyFrameId> = current.covisibles().collect();

        let mut culled = 0;
        for kf_id in local {
            if kf_id.0 == 0 || !self.is_redundant(&map, kf_id) {
                continue;
            }
            let bow = map.get_keyframe(kf_id).and_then(|kf| kf.bow_vector.clone());
            map.erase_keyframe(kf_id);
            if let Some(bow) = bow {
                self.shared.keyframe_db.write().erase(kf_id, &bow);
            }
            culled += 1;
        }

        if culled > 0 {
            info!(
                "[KFCulling] Removed {} redundant keyframes (remaining: {})",
                culled,
                map.num_keyframes()
            );
        }
    }

    fn is_redundant(&self, map: &Map, kf_id: KeyFrameId) -> bool {
        let Some(kf) = map.get_keyframe(kf_id) else {
            return false;
        };
        let th_depth = kf.calib.th_depth;

        let mut n_points = 0;
        let mut n_redundant = 0;
        for (idx, mp_id) in kf.map_point_indices() {
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            if !self.monocular {
                let z = kf.depth[idx];
                if z > th_depth || z < 0.0 {
                    continue;
                }
            }
            n_points += 1;

            if mp.num_observations() <= REDUNDANT_OBSERVATIONS {
                continue;
            }
            let level = kf.keypoints_un[idx].octave;
            let seen_elsewhere = mp
                .observations
                .iter()
                .filter(|(other, _)| **other != kf_id)
                .filter(|(other, other_idx)| {
                    map.get_keyframe(**other)
                        .and_then(|o| o.keypoints_un.get(**other_idx))
                        .is_some_and(|kp| kp.octave <= level + 1)
                })
                .count();
            if seen_elsewhere >= REDUNDANT_OBSERVATIONS {
                n_redundant += 1;
            }
        }
        n_redundant as f64 > REDUNDANT_RATIO * n_points as f64
    }

    fn try_stop(&self) -> bool {
        let _guard = self.stop_lock.lock();
        if self.stop_requested.load(Ordering::SeqCst) && !self.not_stop.load(Ordering::SeqCst) {
            if !self.stopped.swap(true, Ordering::SeqCst) {
                info!("Local Mapping STOP");
            }
            return true;
        }
        false
    }

    fn reset_if_requested(&self) {
        if !self.reset_requested.load(Ordering::SeqCst) {
            return;
        }
        let dropped = self.kf_receiver.try_iter().count();
        self.recent_points.lock().clear();
        self.reset_requested.store(false, Ordering::SeqCst);
        debug!("[LocalMapping] Reset, {} queued keyframes dropped", dropped);
    }
}

impl LocalMapping for LocalMapper {
    fn insert_keyframe(&self, kf_id: KeyFrameId) {
        self.abort_ba.store(true, Ordering::SeqCst);
        if self.kf_sender.send(kf_id).is_err() {
            warn!("Local mapping channel closed, dropping {}", kf_id);
        }
    }

    fn accepts_keyframes(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn keyframes_in_queue(&self) -> usize {
        self.kf_receiver.len()
    }

    fn interrupt_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    fn set_not_stop(&self, flag: bool) -> bool {
        let _guard = self.stop_lock.lock();
        if flag && self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        self.not_stop.store(flag, Ordering::SeqCst);
        true
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        let _guard = self.stop_lock.lock();
        self.stop_requested.store(true, Ordering::SeqCst);
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        let _guard = self.stop_lock.lock();
        self.stopped.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        let dropped = self.kf_receiver.try_iter().count();
        info!("Local Mapping RELEASE ({} queued keyframes dropped)", dropped);
    }

    fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
        // Without a worker there is nobody to acknowledge
        if !self.running.load(Ordering::SeqCst) {
            self.reset_if_requested();
            return;
        }
        while self.reset_requested.load(Ordering::SeqCst) && self.running.load(Ordering::SeqCst) {
            thread::sleep(POLL);
        }
    }
}
