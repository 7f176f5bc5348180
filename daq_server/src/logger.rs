//! Logging session: subscribes to signals and writes deliveries to tracing.

use daq::layout::{ElementLayout, Primitive, PrimitiveType};
use daq::timestamp::Timestamp;
use daq_shared_memory::{
    Session, SignalValue, SubscriptionManager, SubscriptionMode, TaskControl, VariableRegistry,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Totals of one logging session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// `new_signal_list` calls
    pub lists: u64,
    /// `new_signal_data` calls
    pub deliveries: u64,
    /// Samples across all deliveries
    pub samples: u64,
    /// Frames lost to ring overruns, all tasks
    pub lost_frames: u64,
}

/// Session that renders deliveries as log lines.
pub struct LogSession {
    name: String,
    registry: Arc<VariableRegistry>,
    summary: SessionSummary,
}

impl LogSession {
    /// Session named `name` resolving paths through `registry`.
    pub fn new(name: impl Into<String>, registry: Arc<VariableRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
            summary: SessionSummary::default(),
        }
    }

    /// Counters so far.
    pub fn summary(&self) -> SessionSummary {
        self.summary
    }

    fn path(&self, signal: usize) -> &str {
        self.registry
            .signal(signal)
            .map_or("?", |s| s.info.path.as_str())
    }
}

impl Session for LogSession {
    fn new_signal_list(&mut self, task_id: usize, signals: &[u32]) {
        self.summary.lists += 1;
        let paths: Vec<&str> = signals.iter().map(|&s| self.path(s as usize)).collect();
        info!(session = %self.name, task_id, ?paths, "transmitted signals changed");
    }

    fn new_signal_data(
        &mut self,
        task_id: usize,
        seq: u32,
        timestamp: Timestamp,
        values: &[SignalValue<'_>],
    ) {
        self.summary.deliveries += 1;
        for value in values {
            self.summary.samples += value.samples as u64;
            let Some(signal) = self.registry.signal(value.signal) else {
                continue;
            };
            // Latest sample of the block.
            let size = signal.info.layout.byte_size();
            let last = value.bytes.len().checked_sub(size).map(|start| &value.bytes[start..]);
            debug!(
                session = %self.name,
                task_id,
                seq,
                ts = %timestamp.as_nanos(),
                path = %signal.info.path,
                samples = value.samples,
                value = %last.map(|b| format_value(&signal.info.layout, b)).unwrap_or_default(),
                "signal data"
            );
        }
    }
}

/// Render one element-layout value, e.g. `1.5` or `[1, 2, 3]`.
pub fn format_value(layout: &ElementLayout, bytes: &[u8]) -> String {
    let width = layout.element_width();
    let elements: Vec<String> = bytes
        .chunks_exact(width)
        .take(layout.element_count())
        .map(|chunk| format_element(layout.primitive(), chunk))
        .collect();
    match elements.as_slice() {
        [single] if layout.element_count() == 1 => single.clone(),
        _ => format!("[{}]", elements.join(", ")),
    }
}

fn format_element(primitive: PrimitiveType, bytes: &[u8]) -> String {
    match primitive {
        PrimitiveType::Bool => bool::read_ne(bytes).to_string(),
        PrimitiveType::U8 => u8::read_ne(bytes).to_string(),
        PrimitiveType::I8 => i8::read_ne(bytes).to_string(),
        PrimitiveType::U16 => u16::read_ne(bytes).to_string(),
        PrimitiveType::I16 => i16::read_ne(bytes).to_string(),
        PrimitiveType::U32 => u32::read_ne(bytes).to_string(),
        PrimitiveType::I32 => i32::read_ne(bytes).to_string(),
        PrimitiveType::U64 => u64::read_ne(bytes).to_string(),
        PrimitiveType::I64 => i64::read_ne(bytes).to_string(),
        PrimitiveType::F32 => f32::read_ne(bytes).to_string(),
        PrimitiveType::F64 => f64::read_ne(bytes).to_string(),
    }
}

/// Subscribe `plan`, then poll every `interval` until `running` is cleared.
/// The subscriptions are released when the manager is dropped on return.
pub fn run_session(
    name: &str,
    controls: &[TaskControl],
    registry: Arc<VariableRegistry>,
    plan: &[(usize, SubscriptionMode)],
    interval: Duration,
    running: &AtomicBool,
) -> SessionSummary {
    let mut manager = SubscriptionManager::new(controls);
    for &(signal, mode) in plan {
        if let Err(e) = manager.subscribe(signal, mode) {
            warn!(session = name, signal, "subscribe failed: {e}");
        }
    }
    info!(session = name, id = %manager.id(), subscriptions = plan.len(), "session started");

    let mut session = LogSession::new(name, registry);
    while running.load(Ordering::Relaxed) {
        manager.poll(&mut session);
        std::thread::sleep(interval);
    }
    manager.poll(&mut session);

    let mut summary = session.summary();
    for control in controls {
        if let Some(stats) = manager.cursor_stats(control.task_id()) {
            summary.lost_frames += stats.lost_frames;
            info!(
                session = name,
                task_id = control.task_id(),
                data_frames = stats.data_frames,
                list_frames = stats.list_frames,
                resyncs = stats.resyncs,
                lost_frames = stats.lost_frames,
                "cursor statistics"
            );
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_scalar_and_vector() {
        let scalar = ElementLayout::scalar(PrimitiveType::F64);
        assert_eq!(format_value(&scalar, &1.5f64.to_ne_bytes()), "1.5");

        let vector = ElementLayout::vector(PrimitiveType::I16, 3).unwrap();
        let bytes: Vec<u8> = [1i16, -2, 3].iter().flat_map(|v| v.to_ne_bytes()).collect();
        assert_eq!(format_value(&vector, &bytes), "[1, -2, 3]");

        let flag = ElementLayout::scalar(PrimitiveType::Bool);
        assert_eq!(format_value(&flag, &[1]), "true");
    }
}
