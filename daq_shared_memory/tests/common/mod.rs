//! Shared fixtures for the integration tests

#![allow(dead_code)]

use daq::layout::{ElementLayout, PrimitiveType};
use daq::timestamp::Timestamp;
use daq_shared_memory::{
    ProcessImage, Session, SignalValue, TaskControl, TaskScheduler, TaskSetup, VariableRegistry,
    create_task,
};
use std::sync::Arc;

/// One `new_signal_data` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub task_id: usize,
    pub seq: u32,
    pub timestamp: Timestamp,
    /// (signal, samples, bytes)
    pub values: Vec<(usize, usize, Vec<u8>)>,
}

/// Session that records everything it is handed.
#[derive(Debug, Default)]
pub struct Recorder {
    pub lists: Vec<(usize, Vec<u32>)>,
    pub data: Vec<Delivery>,
}

impl Session for Recorder {
    fn new_signal_list(&mut self, task_id: usize, signals: &[u32]) {
        self.lists.push((task_id, signals.to_vec()));
    }

    fn new_signal_data(
        &mut self,
        task_id: usize,
        seq: u32,
        timestamp: Timestamp,
        values: &[SignalValue<'_>],
    ) {
        self.data.push(Delivery {
            task_id,
            seq,
            timestamp,
            values: values
                .iter()
                .map(|v| (v.signal, v.samples, v.bytes.to_vec()))
                .collect(),
        });
    }
}

impl Recorder {
    /// Every delivered block of `signal`, decoded as f64 samples.
    pub fn f64_blocks(&self, signal: usize) -> Vec<Vec<f64>> {
        self.data
            .iter()
            .flat_map(|d| d.values.iter())
            .filter(|(s, _, _)| *s == signal)
            .map(|(_, _, bytes)| {
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_ne_bytes(c.try_into().unwrap()))
                    .collect()
            })
            .collect()
    }

    /// Delivered f64 samples of `signal`, flattened.
    pub fn f64_values(&self, signal: usize) -> Vec<f64> {
        self.f64_blocks(signal).into_iter().flatten().collect()
    }
}

/// One task with a single f64 signal `/x` at offset 0.
pub struct SingleSignal {
    pub registry: Arc<VariableRegistry>,
    pub image: ProcessImage,
    pub task: TaskScheduler,
    pub control: TaskControl,
    pub signal: usize,
}

impl SingleSignal {
    pub fn new(ring_frames: usize) -> Self {
        let mut registry = VariableRegistry::new(1);
        let signal = registry
            .register_signal("/x", 0, 1, ElementLayout::scalar(PrimitiveType::F64), 0)
            .unwrap();
        registry.finalize();
        let registry = Arc::new(registry);
        let image = ProcessImage::for_registry(&registry);
        let (task, control) = create_task(
            &registry,
            &TaskSetup::new(0, 0.001).with_ring_frames(ring_frames),
        )
        .unwrap();
        Self {
            registry,
            image,
            task,
            control,
            signal,
        }
    }

    /// Store `value` and run one tick.
    pub fn tick(&mut self, value: f64) {
        self.image.write(0, value);
        self.task.tick(&self.image, None);
    }
}
