//! Shared progress state and the interval-polling monitor.
//!
//! Exactly two logical threads touch this state: the active engine loop
//! (the only writer) and the monitor (a reader). The mutex makes every
//! snapshot un-torn; the monitor's view may lag the engine by up to one
//! polling interval, which is accepted.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Stage of the active transfer, for operator display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    ScanningVolume,
    BuildingBitmap,
    WritingHeader,
    ReadingHeader,
    StreamingBlocks,
    Finalizing,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::ScanningVolume => "scanning volume",
            Stage::BuildingBitmap => "building bitmap",
            Stage::WritingHeader => "writing header",
            Stage::ReadingHeader => "reading header",
            Stage::StreamingBlocks => "streaming blocks",
            Stage::Finalizing => "finalizing",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// An operator-facing message from the engine thread.
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
}

/// Shared state between the engine thread and the monitor.
pub struct TransferProgress {
    pub stage: Stage,
    pub blocks_copied: u64,
    pub current_block: u64,
    pub total_blocks: u64,
    pub finished: bool,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub log_messages: VecDeque<LogMessage>,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self {
            stage: Stage::Idle,
            blocks_copied: 0,
            current_block: 0,
            total_blocks: 0,
            finished: false,
            error: None,
            cancel_requested: false,
            log_messages: VecDeque::new(),
        }
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedProgress = Arc<Mutex<TransferProgress>>;

/// Create a fresh shared progress handle for one transfer run.
pub fn new_shared() -> SharedProgress {
    Arc::new(Mutex::new(TransferProgress::new()))
}

/// A consistent copy of the counters, taken under the lock.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub blocks_copied: u64,
    pub current_block: u64,
    pub total_blocks: u64,
    pub finished: bool,
    pub error: Option<String>,
}

/// Take an un-torn snapshot of the current state.
pub fn snapshot(progress: &SharedProgress) -> ProgressSnapshot {
    let p = progress.lock().unwrap();
    ProgressSnapshot {
        stage: p.stage,
        blocks_copied: p.blocks_copied,
        current_block: p.current_block,
        total_blocks: p.total_blocks,
        finished: p.finished,
        error: p.error.clone(),
    }
}

/// Ask the engine to stop; honored once per block iteration.
pub fn request_cancel(progress: &SharedProgress) {
    if let Ok(mut p) = progress.lock() {
        p.cancel_requested = true;
    }
}

/// Drain queued operator messages (for a front end to render).
pub fn drain_logs(progress: &SharedProgress) -> Vec<LogMessage> {
    match progress.lock() {
        Ok(mut p) => p.log_messages.drain(..).collect(),
        Err(_) => Vec::new(),
    }
}

pub(crate) fn push_log(progress: &SharedProgress, level: LogLevel, message: impl Into<String>) {
    if let Ok(mut p) = progress.lock() {
        p.log_messages.push_back(LogMessage {
            level,
            message: message.into(),
        });
    }
}

pub(crate) fn set_stage(progress: &SharedProgress, stage: Stage) {
    if let Ok(mut p) = progress.lock() {
        p.stage = stage;
    }
}

pub(crate) fn is_cancelled(progress: &SharedProgress) -> bool {
    progress.lock().map(|p| p.cancel_requested).unwrap_or(false)
}

pub(crate) fn set_block_progress(progress: &SharedProgress, copied: u64, current: u64) {
    if let Ok(mut p) = progress.lock() {
        p.blocks_copied = copied;
        p.current_block = current;
    }
}

pub(crate) fn set_total_blocks(progress: &SharedProgress, total: u64) {
    if let Ok(mut p) = progress.lock() {
        p.total_blocks = total;
    }
}

/// Mark the run finished, recording the error message on failure.
pub(crate) fn mark_finished(progress: &SharedProgress, error: Option<String>) {
    if let Ok(mut p) = progress.lock() {
        if error.is_none() {
            p.stage = Stage::Done;
        }
        p.error = error;
        p.finished = true;
    }
}

/// Poll `progress` every `interval`, handing each snapshot to `render`.
///
/// Returns when `finished` becomes true. The final state is always
/// rendered, so a fast transfer still produces at least one frame.
pub fn run_monitor(
    progress: &SharedProgress,
    interval: Duration,
    mut render: impl FnMut(&ProgressSnapshot),
) {
    loop {
        let snap = snapshot(progress);
        render(&snap);
        if snap.finished {
            break;
        }
        thread::sleep(interval);
    }
}

/// Spawn [`run_monitor`] on its own thread.
pub fn spawn_monitor(
    progress: SharedProgress,
    interval: Duration,
    render: impl FnMut(&ProgressSnapshot) + Send + 'static,
) -> thread::JoinHandle<()> {
    thread::spawn(move || run_monitor(&progress, interval, render))
}
