use serde_json::json;
use axum::http::StatusCode;
use std::{net::SocketAddr, sync::Arc};

// RetroTV engine
//
// Emulates broadcast TV channels from folders of video files:
//   - every folder whose name contains "channel" becomes a looping channel
//   - what a channel shows at any instant is a pure function of wall-clock
//     time, as if the channel had been playing since midnight
//   - an external mpv process renders; we drive it over its JSON IPC socket
//   - two thin front ends (HTTP control panel + terminal console) dispatch
//     onto one shared scheduling core

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::{Notify, Semaphore};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Width of the worker pool used to warm up durations at startup.
const PROBE_POOL_WIDTH: usize = 8;

/// Pause between loading a file into the player and seeking into it. The IPC
/// protocol has no "load finished" signal; a seek sent too early lands on the
/// previous file.
const SEEK_SETTLE: Duration = Duration::from_millis(300);

#[derive(Clone)]
struct AppState {
    version: String,
    catalog: Arc<Catalog>,
    session: Arc<tokio::sync::Mutex<SessionState>>,
    sequencer: Arc<Sequencer>,
}

// --- Configuration --------------------------------------------------------
//
// Everything is overridable via RETROTV_* environment variables so the same
// binary runs on a dev box and on the living-room Pi.

struct EngineConfig {
    /// HTTP bind address for the control panel.
    bind: String,
    /// Base paths scanned for channel folders, colon separated.
    base_paths: Vec<PathBuf>,
    /// Bumper clip played before every switch (skipped when absent on disk).
    bumper_path: PathBuf,
    /// How long the bumper is held on screen. A coarse wait; we never detect
    /// actual bumper completion.
    bumper_secs: f64,
    /// Duration snapshot location.
    cache_file: PathBuf,
    mpv_bin: String,
    mpv_socket: PathBuf,
    mpv_hwdec: Option<String>,
    ffprobe_bin: String,
    /// Default rotation interval in seconds.
    rotation_secs: u64,
}

impl EngineConfig {
    fn from_env() -> Self {
        let base_paths: Vec<PathBuf> = match std::env::var("RETROTV_BASE_PATHS") {
            Ok(v) => v.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect(),
            Err(_) => {
                let mut paths = Vec::new();
                if let Ok(cwd) = std::env::current_dir() {
                    paths.push(cwd);
                }
                paths.push(PathBuf::from("/mnt/myhdd/compressed_vid"));
                paths
            }
        };

        let bumper_path = std::env::var("RETROTV_BUMPER").map(PathBuf::from).unwrap_or_else(|_| {
            std::env::current_dir()
                .map(|d| d.join("transition.mp4"))
                .unwrap_or_else(|_| PathBuf::from("transition.mp4"))
        });

        let bumper_secs = std::env::var("RETROTV_BUMPER_SECS")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(3.0);

        let rotation_secs = std::env::var("RETROTV_ROTATION_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(120);

        Self {
            bind: std::env::var("RETROTV_BIND").unwrap_or_else(|_| "0.0.0.0:5000".to_string()),
            base_paths,
            bumper_path,
            bumper_secs,
            cache_file: std::env::var("RETROTV_CACHE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("durations_cache.json")),
            mpv_bin: std::env::var("RETROTV_MPV").unwrap_or_else(|_| "mpv".to_string()),
            mpv_socket: std::env::var("RETROTV_MPV_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/mpv-socket")),
            mpv_hwdec: std::env::var("RETROTV_MPV_HWDEC").ok(),
            ffprobe_bin: std::env::var("RETROTV_FFPROBE").unwrap_or_else(|_| "ffprobe".to_string()),
            rotation_secs,
        }
    }
}

// --- Duration store -------------------------------------------------------
//
// Memoizes ffprobe results keyed by path + file modification time. The whole
// map is persisted as one flat JSON snapshot (same file a previous run left
// behind is picked up on startup), rewritten via temp-file + rename after
// each warm-up batch so a crash can never truncate it.

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct CacheEntry {
    mod_time: f64,
    duration: f64,
}

struct DurationStore {
    path: PathBuf,
    ffprobe: String,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl DurationStore {
    fn load(path: PathBuf, ffprobe: String) -> Self {
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, CacheEntry>>(&bytes) {
                Ok(map) => {
                    debug!("loaded {} cached durations from {}", map.len(), path.display());
                    map
                }
                Err(e) => {
                    warn!("duration snapshot {} is unreadable, starting empty: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!("failed to read duration snapshot {}: {e}", path.display());
                HashMap::new()
            }
        };
        Self { path, ffprobe, entries: Mutex::new(entries) }
    }

    /// Runtime length of `path` in seconds. A cache entry is served only while
    /// its stored modification time matches the file's current one. A failed
    /// probe yields 0.0 and writes nothing, so the next call retries.
    fn duration_for(&self, path: &Path) -> f64 {
        let key = path.to_string_lossy().into_owned();
        let mod_time = mod_time_secs(path);

        if let Some(mt) = mod_time {
            let entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get(&key) {
                if entry.mod_time == mt {
                    return entry.duration;
                }
            }
        }

        let Some(duration) = probe_duration_secs(&self.ffprobe, path) else {
            debug!("duration probe failed for {}; treating as unknown", path.display());
            return 0.0;
        };
        if let Some(mt) = mod_time {
            self.entries
                .lock()
                .unwrap()
                .insert(key, CacheEntry { mod_time: mt, duration });
        }
        duration
    }

    /// Write-replace the full snapshot. Never mutates the live file in place.
    fn persist(&self) -> anyhow::Result<()> {
        let snapshot = self.entries.lock().unwrap().clone();
        let bytes = serde_json::to_vec(&snapshot)?;
        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn mod_time_secs(path: &Path) -> Option<f64> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    let since_epoch = mtime.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_secs_f64())
}

fn probe_duration_secs(ffprobe: &str, path: &Path) -> Option<f64> {
    use std::process::Command;

    let out = Command::new(ffprobe)
        .arg("-v").arg("error")
        .arg("-show_entries").arg("format=duration")
        .arg("-of").arg("default=noprint_wrappers=1:nokey=1")
        .arg(path)
        .output()
        .ok()?;

    if !out.status.success() {
        return None;
    }
    parse_probe_seconds(&String::from_utf8_lossy(&out.stdout))
}

fn parse_probe_seconds(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let secs: f64 = s.parse().ok()?;
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    Some(secs)
}

/// Probe a batch of items through a bounded pool and return one duration per
/// item, in input order. Results are never reordered relative to the input:
/// the catalog stores them as a vector parallel to the item list.
async fn warm_durations(store: &Arc<DurationStore>, files: &[PathBuf]) -> Vec<f64> {
    let sem = Arc::new(Semaphore::new(PROBE_POOL_WIDTH));
    let mut handles = Vec::with_capacity(files.len());

    for file in files {
        let sem = Arc::clone(&sem);
        let store = Arc::clone(store);
        let file = file.clone();
        handles.push(tokio::spawn(async move {
            let _permit = match sem.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return 0.0,
            };
            // ffprobe is a synchronous subprocess; keep it off the runtime.
            match tokio::task::spawn_blocking(move || store.duration_for(&file)).await {
                Ok(d) => d,
                Err(e) => {
                    warn!("duration probe task failed: {e}");
                    0.0
                }
            }
        }));
    }

    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.unwrap_or(0.0));
    }
    out
}

// --- Channel catalog ------------------------------------------------------

/// One virtual channel: an ordered item list plus a parallel duration vector.
/// The serving order is fixed at build time (sorted listing, one random
/// permutation) and never reordered afterwards; the position math assumes a
/// fixed order for the life of the process.
struct Channel {
    name: String,
    dir: PathBuf,
    items: Vec<PathBuf>,
    durations: Vec<f64>,
    total: f64,
}

impl Channel {
    /// Map seconds-since-midnight onto (item index, offset into that item).
    ///
    /// An empty channel resolves to nothing; a channel whose durations are all
    /// unknown resolves to its first item at offset 0. If float accumulation
    /// leaves the walk short of the wrapped position, the last item at offset
    /// 0 is the defined fallback.
    fn resolve_at(&self, elapsed: f64) -> Option<(usize, f64)> {
        if self.items.is_empty() {
            return None;
        }
        if self.total <= 0.0 {
            return Some((0, 0.0));
        }
        let pos = elapsed.rem_euclid(self.total);
        let mut cumulative = 0.0;
        for (idx, d) in self.durations.iter().enumerate() {
            if cumulative + d > pos {
                return Some((idx, pos - cumulative));
            }
            cumulative += d;
        }
        Some((self.items.len() - 1, 0.0))
    }
}

struct Catalog {
    channels: HashMap<String, Channel>,
    /// Channel names, sorted. Listing order for front ends and the source of
    /// the rotation visitation queue.
    names: Vec<String>,
}

impl Catalog {
    fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }
}

/// List a channel folder (non-recursive, regular files only), fix the serving
/// order, and warm up durations for every item.
async fn build_channel(name: &str, dir: &Path, store: &Arc<DurationStore>) -> anyhow::Result<Channel> {
    let rd = std::fs::read_dir(dir)
        .map_err(|e| anyhow::anyhow!("failed to read_dir({}): {e}", dir.display()))?;

    let mut items = Vec::new();
    for ent in rd {
        let ent = ent.map_err(|e| anyhow::anyhow!("failed to read_dir entry: {e}"))?;
        let ft = ent
            .file_type()
            .map_err(|e| anyhow::anyhow!("failed to stat {}: {e}", ent.path().display()))?;
        if !ft.is_file() {
            continue;
        }
        items.push(ent.path());
    }

    // Sort for a deterministic input order, then permute once. The shuffle is
    // the channel's "programming"; it stays fixed until the next restart.
    items.sort();
    fastrand::shuffle(&mut items);

    let durations = warm_durations(store, &items).await;
    let total = durations.iter().sum();

    Ok(Channel {
        name: name.to_string(),
        dir: dir.to_path_buf(),
        items,
        durations,
        total,
    })
}

// --- Position resolver ----------------------------------------------------

/// Seconds elapsed since local midnight, fractional. Naive local wall-clock
/// semantics: DST shifts and the midnight rollover produce a one-off jump in
/// every channel's position, which is accepted behavior.
fn seconds_since_midnight() -> f64 {
    let now = Local::now().time();
    f64::from(now.num_seconds_from_midnight()) + f64::from(now.nanosecond()) * 1e-9
}

// --- Player link (mpv IPC) ------------------------------------------------
//
// One connection per command: write a single newline-terminated
// {"command": [...]} object, read one response buffer, hang up. There is no
// correlation between requests and responses and no retry; a failed command
// is logged and dropped.

struct PlayerLink {
    socket: PathBuf,
}

impl PlayerLink {
    async fn send(&self, command: serde_json::Value) -> anyhow::Result<String> {
        let mut stream = UnixStream::connect(&self.socket).await?;
        let mut payload = serde_json::to_vec(&json!({ "command": command }))?;
        payload.push(b'\n');
        stream.write_all(&payload).await?;

        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await?;
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }

    async fn load_file(&self, path: &Path) {
        match self.send(json!(["loadfile", path.to_string_lossy(), "replace"])).await {
            Ok(resp) => debug!("player loadfile {}: {}", path.display(), resp.trim_end()),
            Err(e) => warn!("player command not confirmed (loadfile {}): {e}", path.display()),
        }
    }

    async fn seek_to(&self, offset: f64) {
        match self.send(json!(["set_property", "time-pos", offset])).await {
            Ok(resp) => debug!("player seek to {offset:.2}s: {}", resp.trim_end()),
            Err(e) => warn!("player command not confirmed (seek {offset:.2}s): {e}"),
        }
    }
}

// --- Playback sequencer ---------------------------------------------------

enum SwitchOutcome {
    Switched { channel: String, item: PathBuf, offset: f64 },
    /// The channel exists but nothing in it is playable; the player keeps
    /// whatever it was showing and session state is untouched.
    NoItem { channel: String },
    NoLiveChannel,
}

struct Sequencer {
    catalog: Arc<Catalog>,
    player: PlayerLink,
    session: Arc<tokio::sync::Mutex<SessionState>>,
    bumper: PathBuf,
    bumper_secs: f64,
    /// The IPC protocol cannot correlate a seek with the load that preceded
    /// it, so exactly one bumper/load/seek sequence may be in flight at a
    /// time. Held across the sleeps; sequences are not cancellable.
    inflight: tokio::sync::Mutex<()>,
}

impl Sequencer {
    async fn switch_to_channel(&self, name: &str, random_offset: bool) -> anyhow::Result<SwitchOutcome> {
        let channel = self
            .catalog
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {name}"))?;

        let _inflight = self.inflight.lock().await;

        self.play_bumper().await;

        let Some((idx, scheduled)) = channel.resolve_at(seconds_since_midnight()) else {
            info!("channel '{name}' has no playable items; switch is a no-op");
            return Ok(SwitchOutcome::NoItem { channel: name.to_string() });
        };

        let item = channel.items[idx].clone();
        let offset = if random_offset {
            random_offset_within(channel.durations[idx])
        } else {
            scheduled
        };

        self.load_and_seek(&item, offset).await;
        self.session.lock().await.live_channel = Some(name.to_string());
        info!("switched to channel '{name}': {} @ {offset:.2}s", item.display());
        Ok(SwitchOutcome::Switched { channel: name.to_string(), item, offset })
    }

    /// Jump to another item inside the live channel. Picks uniformly among
    /// the channel's items, excluding the one currently on air when there is
    /// more than one, so the switch is never a visible no-op.
    async fn switch_to_next(&self, random_offset: bool) -> anyhow::Result<SwitchOutcome> {
        let live = { self.session.lock().await.live_channel.clone() };
        let Some(name) = live else {
            info!("no live channel; next-item switch is a no-op");
            return Ok(SwitchOutcome::NoLiveChannel);
        };
        let channel = self
            .catalog
            .get(&name)
            .ok_or_else(|| anyhow::anyhow!("live channel '{name}' is missing from the catalog"))?;

        let _inflight = self.inflight.lock().await;

        self.play_bumper().await;

        if channel.items.is_empty() {
            info!("channel '{name}' has no playable items; next-item switch is a no-op");
            return Ok(SwitchOutcome::NoItem { channel: name });
        }

        let on_air = channel.resolve_at(seconds_since_midnight()).map(|(idx, _)| idx);
        let idx = choose_next_index(channel.items.len(), on_air);
        let item = channel.items[idx].clone();
        let duration = channel.durations[idx];
        let offset = if random_offset {
            random_offset_within(duration)
        } else if duration > 0.0 {
            seconds_since_midnight() % duration
        } else {
            0.0
        };

        self.load_and_seek(&item, offset).await;
        info!("next item on '{name}': {} @ {offset:.2}s", item.display());
        Ok(SwitchOutcome::Switched { channel: name, item, offset })
    }

    async fn play_bumper(&self) {
        if !self.bumper.exists() {
            debug!("bumper {} not found; skipping transition", self.bumper.display());
            return;
        }
        self.player.load_file(&self.bumper).await;
        // Coarse wait for the configured bumper length; completion is never
        // detected.
        tokio::time::sleep(Duration::from_secs_f64(self.bumper_secs)).await;
    }

    async fn load_and_seek(&self, item: &Path, offset: f64) {
        self.player.load_file(item).await;
        tokio::time::sleep(SEEK_SETTLE).await;
        self.player.seek_to(offset).await;
    }
}

/// Uniform offset in the first 80% of the item so there is always meaningful
/// runtime left after the seek. Unknown duration starts from the top.
fn random_offset_within(duration: f64) -> f64 {
    if duration > 0.0 {
        fastrand::f64() * duration * 0.8
    } else {
        0.0
    }
}

fn choose_next_index(len: usize, current: Option<usize>) -> usize {
    if len <= 1 {
        return 0;
    }
    let candidates: Vec<usize> = (0..len).filter(|i| Some(*i) != current).collect();
    candidates[fastrand::usize(..candidates.len())]
}

// --- Session state --------------------------------------------------------
//
// The one mutable record in the engine. Front ends and the rotation loop are
// concurrent writers; every access goes through the mutex in AppState and
// nothing else holds a copy of the live channel.

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum RotationMode {
    Off,
    Global,
    Local,
}

#[derive(Debug, PartialEq)]
enum RotationAction {
    SwitchChannel(String),
    NextInChannel,
}

struct SessionState {
    live_channel: Option<String>,
    mode: RotationMode,
    interval_secs: u64,
    /// Seconds until the next rotation activation while a mode is enabled.
    countdown: u64,
    /// Shuffled channel names consumed front-first; refilled and reshuffled
    /// when empty, so every channel is visited once before any repeats.
    visit_queue: Vec<String>,
}

impl SessionState {
    fn new(interval_secs: u64) -> Self {
        Self {
            live_channel: None,
            mode: RotationMode::Off,
            interval_secs,
            countdown: interval_secs,
            visit_queue: Vec::new(),
        }
    }

    /// Enabling (or changing) a rotation mode restarts the countdown from the
    /// full interval; a stale countdown from an earlier activation never
    /// carries over.
    fn set_mode(&mut self, mode: RotationMode) {
        if mode != self.mode && mode != RotationMode::Off {
            self.countdown = self.interval_secs;
        }
        self.mode = mode;
    }

    fn set_interval(&mut self, secs: u64) {
        self.interval_secs = secs;
    }

    fn next_rotation_channel(&mut self, all: &[String]) -> Option<String> {
        if all.is_empty() {
            return None;
        }
        if self.visit_queue.is_empty() {
            self.visit_queue = all.to_vec();
            fastrand::shuffle(&mut self.visit_queue);
        }
        Some(self.visit_queue.remove(0))
    }

    /// One second of rotation bookkeeping. Returns the activation to perform
    /// when the countdown ran out, None otherwise. Mode off idles without
    /// touching the countdown.
    fn rotation_tick(&mut self, channels: &[String]) -> Option<RotationAction> {
        if self.mode == RotationMode::Off {
            return None;
        }
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return None;
        }
        self.countdown = self.interval_secs;
        match self.mode {
            RotationMode::Off => None,
            RotationMode::Global => self
                .next_rotation_channel(channels)
                .map(RotationAction::SwitchChannel),
            RotationMode::Local => {
                if self.live_channel.is_none() {
                    // Nothing is live yet; bootstrap like global mode.
                    self.next_rotation_channel(channels)
                        .map(RotationAction::SwitchChannel)
                } else {
                    Some(RotationAction::NextInChannel)
                }
            }
        }
    }
}

// --- Rotation scheduler ---------------------------------------------------

async fn rotation_loop(state: AppState) {
    let names = state.catalog.names.clone();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    // A switch sequence sleeps for seconds (bumper + settle); delayed ticks
    // must not burst-fire afterwards and eat the countdown.
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tick.tick().await;

        let action = { state.session.lock().await.rotation_tick(&names) };
        let Some(action) = action else { continue };

        // The operator may have disabled rotation between the countdown
        // decision and here; re-check so a pending activation never fires
        // into a freshly disabled session.
        if state.session.lock().await.mode == RotationMode::Off {
            continue;
        }

        let result = match action {
            RotationAction::SwitchChannel(name) => {
                info!("rotation: switching to channel '{name}'");
                state.sequencer.switch_to_channel(&name, true).await
            }
            RotationAction::NextInChannel => {
                info!("rotation: next item in the live channel");
                state.sequencer.switch_to_next(true).await
            }
        };
        if let Err(e) = result {
            warn!("rotation activation failed: {e}");
        }
    }
}

// --- Channel discovery ----------------------------------------------------

/// Scan each base path for immediate subdirectories whose name contains
/// "channel" (case-insensitive). Later base paths win on name collisions.
fn discover_channels(base_paths: &[PathBuf]) -> Vec<(String, PathBuf)> {
    let mut found: Vec<(String, PathBuf)> = Vec::new();
    for base in base_paths {
        if !base.exists() {
            debug!("base path {} does not exist; skipping", base.display());
            continue;
        }
        let rd = match std::fs::read_dir(base) {
            Ok(rd) => rd,
            Err(e) => {
                warn!("failed to read base path {}: {e}", base.display());
                continue;
            }
        };
        for ent in rd.flatten() {
            let path = ent.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if !name.to_lowercase().contains("channel") {
                continue;
            }
            found.retain(|(existing, _)| *existing != name);
            found.push((name, path));
        }
    }
    found
}

// --- Player process -------------------------------------------------------

/// Spawn mpv with its IPC server on our socket, positioned on whatever the
/// first channel is scheduled to show right now. With nothing playable the
/// player starts idle instead; the engine never refuses to come up.
async fn start_player(cfg: &EngineConfig, catalog: &Catalog) -> anyhow::Result<tokio::process::Child> {
    if cfg.mpv_socket.exists() {
        // Stale socket from a previous run; mpv refuses to rebind otherwise.
        if let Err(e) = std::fs::remove_file(&cfg.mpv_socket) {
            warn!("failed to remove stale player socket {}: {e}", cfg.mpv_socket.display());
        }
    }

    let mut cmd = Command::new(&cfg.mpv_bin);
    cmd.arg("--loop")
        .arg("--no-input-default-bindings")
        .arg("--quiet")
        .arg(format!("--input-ipc-server={}", cfg.mpv_socket.display()));
    if let Some(hwdec) = &cfg.mpv_hwdec {
        cmd.arg(format!("--hwdec={hwdec}"));
    }

    let initial = catalog.names.first().and_then(|n| catalog.get(n)).and_then(|ch| {
        ch.resolve_at(seconds_since_midnight())
            .map(|(idx, offset)| (ch.items[idx].clone(), offset))
    });
    match initial {
        Some((item, offset)) => {
            info!("player starts on {} @ {offset:.2}s", item.display());
            cmd.arg(format!("--start={offset:.3}")).arg(&item);
        }
        None => {
            info!("no playable item at startup; player starts idle");
            cmd.arg("--idle=yes");
        }
    }

    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::null());

    let child = cmd
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn {}: {e}", cfg.mpv_bin))?;

    // Give mpv a moment to create the IPC socket before anyone talks to it.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !cfg.mpv_socket.exists() {
        if std::time::Instant::now() >= deadline {
            warn!("player IPC socket {} did not appear within 5s", cfg.mpv_socket.display());
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(child)
}

// --- HTTP control panel ---------------------------------------------------

/// Root endpoint: the panel UI (if any) sits behind a reverse proxy; the
/// engine itself only speaks JSON.
async fn root() -> &'static str {
    "RetroTV engine is running. Try /api/v1/status"
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg.into() })))
}

#[derive(Serialize)]
struct ChannelSummary {
    name: String,
    items: usize,
    total_secs: f64,
}

#[derive(Serialize)]
struct OnNow {
    channel: String,
    item: String,
    offset_secs: f64,
    duration_secs: f64,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    live_channel: Option<String>,
    mode: RotationMode,
    interval_secs: u64,
    channels: Vec<ChannelSummary>,
    /// What the live channel is scheduled to show at this instant, resolved
    /// fresh from wall-clock time.
    on_now: Option<OnNow>,
}

fn channel_summaries(catalog: &Catalog) -> Vec<ChannelSummary> {
    catalog
        .names
        .iter()
        .filter_map(|n| catalog.get(n))
        .map(|ch| ChannelSummary {
            name: ch.name.clone(),
            items: ch.items.len(),
            total_secs: ch.total,
        })
        .collect()
}

async fn api_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let (live_channel, mode, interval_secs) = {
        let s = state.session.lock().await;
        (s.live_channel.clone(), s.mode, s.interval_secs)
    };

    let on_now = live_channel.as_deref().and_then(|name| {
        let ch = state.catalog.get(name)?;
        let (idx, offset) = ch.resolve_at(seconds_since_midnight())?;
        Some(OnNow {
            channel: name.to_string(),
            item: ch.items[idx].to_string_lossy().into_owned(),
            offset_secs: offset,
            duration_secs: ch.durations[idx],
        })
    });

    Json(StatusResponse {
        version: state.version.clone(),
        live_channel,
        mode,
        interval_secs,
        channels: channel_summaries(&state.catalog),
        on_now,
    })
}

async fn api_channels(State(state): State<AppState>) -> Json<Vec<ChannelSummary>> {
    Json(channel_summaries(&state.catalog))
}

#[derive(Deserialize)]
struct SwitchChannelReq {
    channel: String,
    #[serde(default)]
    random_offset: bool,
}

async fn api_switch_channel(
    State(state): State<AppState>,
    Json(req): Json<SwitchChannelReq>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.catalog.get(&req.channel).is_none() {
        return Err(bad_request(format!("unknown channel: {}", req.channel)));
    }
    match state.sequencer.switch_to_channel(&req.channel, req.random_offset).await {
        Ok(SwitchOutcome::Switched { channel, item, offset }) => Ok(Json(json!({
            "ok": true,
            "switched": true,
            "channel": channel,
            "item": item.to_string_lossy(),
            "offset_secs": offset,
        }))),
        Ok(SwitchOutcome::NoItem { channel }) => Ok(Json(json!({
            "ok": true,
            "switched": false,
            "reason": format!("channel '{channel}' has no playable items"),
        }))),
        Ok(SwitchOutcome::NoLiveChannel) => Ok(Json(json!({
            "ok": true,
            "switched": false,
            "reason": "no live channel",
        }))),
        Err(e) => Err(bad_request(e.to_string())),
    }
}

#[derive(Deserialize)]
struct NextVideoReq {
    #[serde(default = "default_random_offset")]
    random_offset: bool,
}

fn default_random_offset() -> bool {
    true
}

async fn api_next_video(
    State(state): State<AppState>,
    req: Option<Json<NextVideoReq>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let random_offset = req.map(|Json(r)| r.random_offset).unwrap_or(true);
    match state.sequencer.switch_to_next(random_offset).await {
        Ok(SwitchOutcome::Switched { channel, item, offset }) => Ok(Json(json!({
            "ok": true,
            "switched": true,
            "channel": channel,
            "item": item.to_string_lossy(),
            "offset_secs": offset,
        }))),
        Ok(SwitchOutcome::NoItem { channel }) => Ok(Json(json!({
            "ok": true,
            "switched": false,
            "reason": format!("channel '{channel}' has no playable items"),
        }))),
        Ok(SwitchOutcome::NoLiveChannel) => Ok(Json(json!({
            "ok": true,
            "switched": false,
            "reason": "no live channel",
        }))),
        Err(e) => Err(bad_request(e.to_string())),
    }
}

#[derive(Deserialize)]
struct AutoModeReq {
    mode: String,
}

async fn api_auto_mode(
    State(state): State<AppState>,
    Json(req): Json<AutoModeReq>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mode = match req.mode.as_str() {
        "off" => RotationMode::Off,
        "global" => RotationMode::Global,
        "local" => RotationMode::Local,
        other => {
            return Err(bad_request(format!(
                "invalid rotation mode '{other}' (expected off, global or local)"
            )))
        }
    };
    state.session.lock().await.set_mode(mode);
    info!("rotation mode set to {mode:?}");
    Ok(Json(json!({ "mode": req.mode })))
}

#[derive(Deserialize)]
struct AutoIntervalReq {
    interval: i64,
}

async fn api_auto_interval(
    State(state): State<AppState>,
    Json(req): Json<AutoIntervalReq>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.interval <= 0 {
        return Err(bad_request("rotation interval must be a positive number of seconds"));
    }
    state.session.lock().await.set_interval(req.interval as u64);
    info!("rotation interval set to {}s", req.interval);
    Ok(Json(json!({ "interval": req.interval })))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/status", get(api_status))
        .route("/api/v1/channels", get(api_channels))
        .route("/api/v1/switch_channel", post(api_switch_channel))
        .route("/api/v1/next_video", post(api_next_video))
        .route("/api/v1/auto/mode", post(api_auto_mode))
        .route("/api/v1/auto/interval", post(api_auto_interval))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Terminal console -----------------------------------------------------
//
// The second front end: reads stdin lines and dispatches onto the same core
// the HTTP panel uses. Replies go to stdout (the operator is at a terminal);
// engine events keep going through tracing.

async fn console_loop(state: AppState, shutdown: Arc<Notify>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!(
        "Channels: {}. Commands: <channel name>, next, auto global|local|off, interval <secs>, channels, q",
        state.catalog.names.join(", ")
    );

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            // stdin closed (running under a supervisor); the HTTP panel
            // remains available.
            Ok(None) => return,
            Err(e) => {
                warn!("console read error: {e}");
                return;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let lower = input.to_lowercase();

        if lower == "q" {
            println!("Shutting down.");
            shutdown.notify_one();
            return;
        } else if lower == "next" {
            match state.sequencer.switch_to_next(true).await {
                Ok(SwitchOutcome::Switched { item, offset, .. }) => {
                    println!("Now playing {} @ {offset:.1}s", item.display());
                }
                Ok(SwitchOutcome::NoLiveChannel) => println!("No channel is live yet."),
                Ok(SwitchOutcome::NoItem { channel }) => {
                    println!("Channel '{channel}' has no playable items.");
                }
                Err(e) => println!("{e}"),
            }
        } else if lower == "channels" || lower == "list" {
            for name in &state.catalog.names {
                if let Some(ch) = state.catalog.get(name) {
                    println!("  {name}: {} items, {:.0}s total", ch.items.len(), ch.total);
                }
            }
        } else if let Some(rest) = lower.strip_prefix("auto ") {
            let mode = match rest.trim() {
                "global" => Some(RotationMode::Global),
                // "shuffle" is the historical name for in-channel rotation.
                "local" | "shuffle" => Some(RotationMode::Local),
                "off" => Some(RotationMode::Off),
                _ => None,
            };
            match mode {
                Some(mode) => {
                    state.session.lock().await.set_mode(mode);
                    println!("Rotation mode: {mode:?}");
                }
                None => println!("Use 'auto global', 'auto local' or 'auto off'."),
            }
        } else if let Some(rest) = lower.strip_prefix("interval ") {
            match rest.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => {
                    state.session.lock().await.set_interval(secs);
                    println!("Rotation interval: {secs}s");
                }
                _ => println!("Interval must be a positive number of seconds."),
            }
        } else if state.catalog.get(input).is_some() {
            match state.sequencer.switch_to_channel(input, false).await {
                Ok(SwitchOutcome::Switched { channel, item, offset }) => {
                    println!("Switched to '{channel}': {} @ {offset:.1}s", item.display());
                }
                Ok(SwitchOutcome::NoItem { channel }) => {
                    println!("Channel '{channel}' has no playable items.");
                }
                Ok(SwitchOutcome::NoLiveChannel) => println!("No channel is live yet."),
                Err(e) => println!("{e}"),
            }
        } else {
            println!(
                "Unknown command. Channels: {}. Or 'next', 'auto ...', 'interval <secs>', 'q'.",
                state.catalog.names.join(", ")
            );
        }
    }
}

// --- Startup --------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let cfg = EngineConfig::from_env();

    let discovered = discover_channels(&cfg.base_paths);
    if discovered.is_empty() {
        warn!(
            "no channel folders found under {:?}; the engine will idle until restarted with content",
            cfg.base_paths
        );
    } else {
        let names: Vec<&str> = discovered.iter().map(|(n, _)| n.as_str()).collect();
        info!("detected channels: {}", names.join(", "));
    }

    let store = Arc::new(DurationStore::load(cfg.cache_file.clone(), cfg.ffprobe_bin.clone()));

    let mut channels = HashMap::new();
    let mut names = Vec::new();
    for (name, dir) in discovered {
        let channel = match build_channel(&name, &dir, &store).await {
            Ok(ch) => ch,
            Err(e) => {
                warn!("failed to build channel '{name}': {e}");
                continue;
            }
        };
        info!(
            "channel '{}' ({}): {} items, {:.2}s total",
            channel.name,
            channel.dir.display(),
            channel.items.len(),
            channel.total
        );
        // One snapshot write per warm-up batch.
        if let Err(e) = store.persist() {
            warn!("failed to persist duration snapshot: {e}");
        }
        names.push(name.clone());
        channels.insert(name, channel);
    }
    names.sort();
    let catalog = Arc::new(Catalog { channels, names });

    let session = Arc::new(tokio::sync::Mutex::new(SessionState::new(cfg.rotation_secs)));

    let sequencer = Arc::new(Sequencer {
        catalog: Arc::clone(&catalog),
        player: PlayerLink { socket: cfg.mpv_socket.clone() },
        session: Arc::clone(&session),
        bumper: cfg.bumper_path.clone(),
        bumper_secs: cfg.bumper_secs,
        inflight: tokio::sync::Mutex::new(()),
    });

    // The engine outlives a missing player: switches are logged and dropped
    // until mpv is reachable again.
    let mut player_child = match start_player(&cfg, &catalog).await {
        Ok(child) => Some(child),
        Err(e) => {
            warn!("player did not start ({e}); commands will be dropped until it is reachable");
            None
        }
    };

    let state = AppState {
        version: version.clone(),
        catalog,
        session,
        sequencer,
    };

    tokio::spawn(rotation_loop(state.clone()));

    let shutdown = Arc::new(Notify::new());
    tokio::spawn(console_loop(state.clone(), Arc::clone(&shutdown)));

    let app = build_router(state);

    let addr: SocketAddr = cfg.bind.parse()?;
    info!("RetroTV engine {version} starting on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&shutdown)))
        .await?;

    if let Some(child) = player_child.as_mut() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    Ok(())
}

async fn shutdown_signal(console_quit: Arc<Notify>) {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
        _ = console_quit.notified() => {},
    }

    warn!("Shutdown signal received.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn test_channel(durations: &[f64]) -> Channel {
        let items = (0..durations.len())
            .map(|i| PathBuf::from(format!("/videos/item{i}.mp4")))
            .collect();
        Channel {
            name: "test".into(),
            dir: PathBuf::from("/videos"),
            items,
            durations: durations.to_vec(),
            total: durations.iter().sum(),
        }
    }

    fn store_in(dir: &Path) -> DurationStore {
        // A probe binary that cannot exist, so only the cache can answer.
        DurationStore::load(dir.join("durations_cache.json"), "/nonexistent/ffprobe".into())
    }

    // --- Position resolver ---

    #[test]
    fn resolve_picks_item_by_cumulative_span() {
        let ch = test_channel(&[100.0, 50.0]);

        // 620 mod 150 = 20, inside the first item.
        let (idx, offset) = ch.resolve_at(620.0).unwrap();
        assert_eq!(idx, 0);
        assert!((offset - 20.0).abs() < 1e-9);

        // 730 mod 150 = 130, 30 seconds into the second item.
        let (idx, offset) = ch.resolve_at(730.0).unwrap();
        assert_eq!(idx, 1);
        assert!((offset - 30.0).abs() < 1e-9);
    }

    #[test]
    fn resolve_offset_stays_inside_the_item() {
        let ch = test_channel(&[12.5, 100.0, 3.25, 48.0]);
        let mut elapsed = 0.0;
        while elapsed < 1000.0 {
            let (idx, offset) = ch.resolve_at(elapsed).unwrap();
            assert!(offset >= 0.0, "negative offset at elapsed {elapsed}");
            assert!(
                offset < ch.durations[idx],
                "offset {offset} spills past item {idx} at elapsed {elapsed}"
            );
            elapsed += 7.3;
        }
    }

    #[test]
    fn resolve_is_idempotent() {
        let ch = test_channel(&[33.0, 11.0, 95.5]);
        assert_eq!(ch.resolve_at(512.75), ch.resolve_at(512.75));
    }

    #[test]
    fn resolve_is_continuous_within_a_cycle() {
        let ch = test_channel(&[100.0, 50.0, 25.0]);
        let total = ch.total;

        // Absolute channel position implied by a resolution.
        let abs_pos = |elapsed: f64| {
            let (idx, offset) = ch.resolve_at(elapsed).unwrap();
            let start: f64 = ch.durations[..idx].iter().sum();
            start + offset
        };

        let t1 = 340.0;
        for delta in [0.5, 10.0, 60.0, 120.0] {
            let expected = (abs_pos(t1) + delta) % total;
            let got = abs_pos(t1 + delta);
            assert!(
                (got - expected).abs() < 1e-6,
                "advancing {delta}s moved the position from {} to {got}, expected {expected}",
                abs_pos(t1)
            );
        }
    }

    #[test]
    fn zero_duration_channel_resolves_to_first_item() {
        let ch = test_channel(&[0.0, 0.0, 0.0]);
        assert_eq!(ch.resolve_at(12345.0), Some((0, 0.0)));
    }

    #[test]
    fn empty_channel_resolves_to_nothing() {
        let ch = test_channel(&[]);
        assert_eq!(ch.resolve_at(0.0), None);
        assert_eq!(ch.resolve_at(99999.0), None);
    }

    #[test]
    fn accumulation_fallthrough_lands_on_last_item() {
        // A stored total larger than the sum of the walk makes the cumulative
        // scan fall through, which must resolve to the last item at 0.
        let mut ch = test_channel(&[1.0, 2.0]);
        ch.total = 3.5;
        assert_eq!(ch.resolve_at(3.4), Some((1, 0.0)));
    }

    // --- Sequencer helpers ---

    #[test]
    fn random_offsets_stay_in_the_first_80_percent() {
        for _ in 0..200 {
            let offset = random_offset_within(100.0);
            assert!((0.0..80.0).contains(&offset), "offset {offset} out of range");
        }
        assert_eq!(random_offset_within(0.0), 0.0);
    }

    #[test]
    fn next_item_choice_excludes_the_current_item() {
        for _ in 0..200 {
            let idx = choose_next_index(5, Some(2));
            assert!(idx < 5);
            assert_ne!(idx, 2);
        }
        // A single-item channel has nothing else to offer.
        assert_eq!(choose_next_index(1, Some(0)), 0);
    }

    // --- Rotation ---

    #[test]
    fn visitation_queue_covers_every_channel_before_repeating() {
        let channels: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let mut session = SessionState::new(60);

        for _round in 0..3 {
            let mut seen = HashSet::new();
            for _ in 0..channels.len() {
                let name = session.next_rotation_channel(&channels).unwrap();
                assert!(seen.insert(name), "channel repeated before the round finished");
            }
            assert_eq!(seen.len(), channels.len());
        }
    }

    #[test]
    fn rotation_fires_after_the_configured_interval() {
        let channels = vec!["a".to_string(), "b".to_string()];
        let mut session = SessionState::new(3);

        assert_eq!(session.rotation_tick(&channels), None); // off: idle

        session.set_mode(RotationMode::Global);
        assert_eq!(session.rotation_tick(&channels), None);
        assert_eq!(session.rotation_tick(&channels), None);
        assert!(matches!(
            session.rotation_tick(&channels),
            Some(RotationAction::SwitchChannel(_))
        ));
        // Countdown re-armed for the next activation.
        assert_eq!(session.countdown, 3);
    }

    #[test]
    fn disabling_mid_countdown_suppresses_the_pending_activation() {
        let channels = vec!["a".to_string(), "b".to_string()];
        let mut session = SessionState::new(3);
        session.set_mode(RotationMode::Global);

        assert_eq!(session.rotation_tick(&channels), None);
        session.set_mode(RotationMode::Off);
        for _ in 0..10 {
            assert_eq!(session.rotation_tick(&channels), None);
        }

        // Re-enabling restarts from the full interval, not the stale countdown.
        session.set_mode(RotationMode::Global);
        assert_eq!(session.countdown, 3);
        assert_eq!(session.rotation_tick(&channels), None);
        assert_eq!(session.rotation_tick(&channels), None);
        assert!(session.rotation_tick(&channels).is_some());
    }

    #[test]
    fn local_rotation_bootstraps_then_stays_in_channel() {
        let channels = vec!["a".to_string(), "b".to_string()];
        let mut session = SessionState::new(1);
        session.set_mode(RotationMode::Local);

        // No live channel yet: behaves like global to get something on air.
        assert!(matches!(
            session.rotation_tick(&channels),
            Some(RotationAction::SwitchChannel(_))
        ));

        session.live_channel = Some("a".to_string());
        assert_eq!(session.rotation_tick(&channels), Some(RotationAction::NextInChannel));
    }

    // --- Duration store ---

    #[test]
    fn probe_output_parsing_accepts_a_single_decimal() {
        assert_eq!(parse_probe_seconds("123.456\n"), Some(123.456));
        assert_eq!(parse_probe_seconds("  42  "), Some(42.0));
        assert_eq!(parse_probe_seconds(""), None);
        assert_eq!(parse_probe_seconds("N/A"), None);
        assert_eq!(parse_probe_seconds("-5.0"), None);
        assert_eq!(parse_probe_seconds("inf"), None);
    }

    #[test]
    fn valid_cache_entry_is_served_without_probing() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.mp4");
        std::fs::write(&file, b"not a real video").unwrap();

        let store = store_in(tmp.path());
        let mt = mod_time_secs(&file).unwrap();
        store.entries.lock().unwrap().insert(
            file.to_string_lossy().into_owned(),
            CacheEntry { mod_time: mt, duration: 42.5 },
        );

        assert_eq!(store.duration_for(&file), 42.5);
    }

    #[test]
    fn stale_entry_is_reprobed_and_a_failed_probe_is_not_cached() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.mp4");
        std::fs::write(&file, b"not a real video").unwrap();

        let store = store_in(tmp.path());
        let key = file.to_string_lossy().into_owned();
        let mt = mod_time_secs(&file).unwrap();
        store
            .entries
            .lock()
            .unwrap()
            .insert(key.clone(), CacheEntry { mod_time: mt - 100.0, duration: 42.5 });

        // The mtime no longer matches, the probe fails, and the item is
        // scheduled with an unknown duration.
        assert_eq!(store.duration_for(&file), 0.0);

        // The failure was not written back; the next call will retry.
        let entries = store.entries.lock().unwrap();
        assert_eq!(entries.get(&key).unwrap().duration, 42.5);
    }

    #[test]
    fn failed_probe_on_an_unknown_file_caches_nothing() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.mp4");
        std::fs::write(&file, b"not a real video").unwrap();

        let store = store_in(tmp.path());
        assert_eq!(store.duration_for(&file), 0.0);
        assert!(store.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn snapshot_round_trips_through_write_replace() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(tmp.path());
        store.entries.lock().unwrap().insert(
            "/videos/a.mp4".to_string(),
            CacheEntry { mod_time: 1700000000.25, duration: 61.5 },
        );
        store.entries.lock().unwrap().insert(
            "/videos/b.mp4".to_string(),
            CacheEntry { mod_time: 1700000001.5, duration: 1800.0 },
        );

        store.persist().unwrap();
        // The temp file was renamed over the snapshot, not left behind.
        assert!(tmp.path().join("durations_cache.json").exists());
        assert!(!tmp.path().join("durations_cache.json.tmp").exists());

        let reloaded = store_in(tmp.path());
        assert_eq!(
            *reloaded.entries.lock().unwrap(),
            *store.entries.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn warm_up_preserves_input_order() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(store_in(tmp.path()));

        let mut files = Vec::new();
        for (name, duration) in [("a.mp4", 10.0), ("b.mp4", 20.0), ("c.mp4", 30.0)] {
            let file = tmp.path().join(name);
            std::fs::write(&file, name).unwrap();
            let mt = mod_time_secs(&file).unwrap();
            store.entries.lock().unwrap().insert(
                file.to_string_lossy().into_owned(),
                CacheEntry { mod_time: mt, duration },
            );
            files.push(file);
        }

        // Deliberately not in insertion order.
        let batch = vec![files[2].clone(), files[0].clone(), files[1].clone()];
        let durations = warm_durations(&store, &batch).await;
        assert_eq!(durations, vec![30.0, 10.0, 20.0]);
    }

    // --- Catalog builder ---

    #[tokio::test]
    async fn channel_build_lists_only_regular_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("b.mp4"), b"b").unwrap();
        std::fs::write(tmp.path().join("a.mp4"), b"a").unwrap();
        std::fs::create_dir(tmp.path().join("extras")).unwrap();

        let store = Arc::new(store_in(tmp.path()));
        let ch = build_channel("Channel 1", tmp.path(), &store).await.unwrap();

        let names: HashSet<String> = ch
            .items
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(names, HashSet::from(["a.mp4".to_string(), "b.mp4".to_string()]));

        // No durations were probeable, so the channel is inert but valid.
        assert_eq!(ch.total, 0.0);
        assert_eq!(ch.resolve_at(5000.0), Some((0, 0.0)));
    }

    #[tokio::test]
    async fn channel_build_sums_cached_durations() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(store_in(tmp.path()));
        for (name, duration) in [("a.mp4", 10.0), ("b.mp4", 20.0)] {
            let file = tmp.path().join(name);
            std::fs::write(&file, name).unwrap();
            let mt = mod_time_secs(&file).unwrap();
            store.entries.lock().unwrap().insert(
                file.to_string_lossy().into_owned(),
                CacheEntry { mod_time: mt, duration },
            );
        }

        let ch = build_channel("Channel 1", tmp.path(), &store).await.unwrap();
        assert_eq!(ch.items.len(), 2);
        assert!((ch.total - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_folder_builds_an_inert_channel() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(store_in(tmp.path()));
        let ch = build_channel("Channel 1", tmp.path(), &store).await.unwrap();
        assert!(ch.items.is_empty());
        assert_eq!(ch.total, 0.0);
        assert_eq!(ch.resolve_at(0.0), None);
    }

    // --- Discovery ---

    #[test]
    fn discovery_picks_directories_named_like_channels() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("Channel One")).unwrap();
        std::fs::create_dir(tmp.path().join("MyCHANNEL")).unwrap();
        std::fs::create_dir(tmp.path().join("music")).unwrap();
        std::fs::write(tmp.path().join("channel.txt"), b"not a dir").unwrap();

        let found = discover_channels(&[tmp.path().to_path_buf()]);
        let names: HashSet<String> = found.into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            HashSet::from(["Channel One".to_string(), "MyCHANNEL".to_string()])
        );
    }

    #[test]
    fn later_base_paths_win_name_collisions() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::create_dir(first.path().join("channel_a")).unwrap();
        std::fs::create_dir(second.path().join("channel_a")).unwrap();

        let found =
            discover_channels(&[first.path().to_path_buf(), second.path().to_path_buf()]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, second.path().join("channel_a"));
    }

    // --- Player link ---

    #[tokio::test]
    async fn player_link_speaks_newline_delimited_command_json() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("mpv.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            write_half.write_all(b"{\"error\":\"success\"}\n").await.unwrap();
            line
        });

        let link = PlayerLink { socket };
        let response = link
            .send(json!(["loadfile", "/videos/a.mp4", "replace"]))
            .await
            .unwrap();
        assert!(response.contains("success"));

        let request: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(request["command"][0], "loadfile");
        assert_eq!(request["command"][1], "/videos/a.mp4");
        assert_eq!(request["command"][2], "replace");
    }

    #[tokio::test]
    async fn unreachable_player_is_an_error_not_a_panic() {
        let link = PlayerLink { socket: PathBuf::from("/nonexistent/mpv.sock") };
        assert!(link.send(json!(["loadfile", "/videos/a.mp4", "replace"])).await.is_err());
    }
}
