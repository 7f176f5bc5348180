//! Demonstration model served by the acquisition server.
//!
//! Process image layout (bytes):
//!
//! | Offset | Variable              | Kind      | Type      | Task |
//! |--------|-----------------------|-----------|-----------|------|
//! | 0      | `/model/amplitude`    | parameter | f64       |      |
//! | 8      | `/model/frequency`    | parameter | f64       |      |
//! | 16     | `/model/sine`         | signal    | f64       | 0    |
//! | 24     | `/model/temperature`  | signal    | f64       | last |
//! | 32     | `/model/counter`      | signal    | u32       | 0    |
//! | 36     | `/model/enable`       | parameter | bool      |      |
//! | 40     | `/model/axes`         | signal    | i16 x 3   | 0    |

use daq::layout::{ElementLayout, Primitive, PrimitiveType};
use daq_shared_memory::registry::raw_copy;
use daq_shared_memory::{
    AccessMode, ParameterCallback, ParameterUpdate, ProcessImage, SetupError, SetupResult,
    SubscriptionMode, VariableRegistry,
};
use std::f64::consts::TAU;
use std::sync::Arc;

const AMPLITUDE: usize = 0;
const FREQUENCY: usize = 8;
const SINE: usize = 16;
const TEMPERATURE: usize = 24;
const COUNTER: usize = 32;
const ENABLE: usize = 36;
const AXES: usize = 40;
const AXIS_COUNT: usize = 3;

/// Signal indices of the demo model.
#[derive(Debug, Clone, Copy)]
pub struct DemoSignals {
    /// `/model/sine`
    pub sine: usize,
    /// `/model/counter`
    pub counter: usize,
    /// `/model/axes`
    pub axes: usize,
    /// `/model/temperature`
    pub temperature: usize,
}

/// Parameter indices of the demo model.
#[derive(Debug, Clone, Copy)]
pub struct DemoParameters {
    /// `/model/amplitude`
    pub amplitude: usize,
    /// `/model/frequency`, rejects non-positive values
    pub frequency: usize,
    /// `/model/enable`
    pub enable: usize,
}

/// Finalized registry of the demo model.
pub struct DemoRegistry {
    /// Shared registry
    pub registry: Arc<VariableRegistry>,
    /// Signal indices
    pub signals: DemoSignals,
    /// Parameter indices
    pub parameters: DemoParameters,
}

impl DemoRegistry {
    /// Register all demo variables for `task_count` tasks. Fast signals go to
    /// task 0, the temperature to the slowest (last) task.
    pub fn build(task_count: usize) -> SetupResult<Self> {
        let mut registry = VariableRegistry::new(task_count);
        let slow = task_count.saturating_sub(1);
        let f64_scalar = ElementLayout::scalar(PrimitiveType::F64);

        let parameters = DemoParameters {
            amplitude: registry.register_parameter(
                "/model/amplitude",
                AccessMode::READ_WRITE,
                f64_scalar.clone(),
                AMPLITUDE,
                None,
            )?,
            frequency: registry.register_parameter(
                "/model/frequency",
                AccessMode::READ_WRITE,
                f64_scalar.clone(),
                FREQUENCY,
                Some(Arc::new(positive_frequency) as ParameterCallback),
            )?,
            enable: registry.register_parameter(
                "/model/enable",
                AccessMode::READ_WRITE,
                ElementLayout::scalar(PrimitiveType::Bool),
                ENABLE,
                None,
            )?,
        };

        let axes_layout = ElementLayout::vector(PrimitiveType::I16, AXIS_COUNT)
            .map_err(|source| SetupError::InvalidLayout {
                path: "/model/axes".to_string(),
                source,
            })?;
        let signals = DemoSignals {
            sine: registry.register_signal("/model/sine", 0, 1, f64_scalar.clone(), SINE)?,
            counter: registry.register_signal(
                "/model/counter",
                0,
                1,
                ElementLayout::scalar(PrimitiveType::U32),
                COUNTER,
            )?,
            axes: registry.register_signal("/model/axes", 0, 2, axes_layout, AXES)?,
            temperature: registry.register_signal(
                "/model/temperature",
                slow,
                1,
                f64_scalar,
                TEMPERATURE,
            )?,
        };

        registry.set_unit("/model/sine", "V")?;
        registry.set_unit("/model/temperature", "degC")?;
        registry.set_unit("/model/frequency", "Hz")?;
        registry.set_alias("/model/sine", "sine")?;
        registry.set_comment("/model/axes", "scaled sine at three phase offsets")?;
        registry.finalize();

        Ok(Self {
            registry: Arc::new(registry),
            signals,
            parameters,
        })
    }

    /// Process image holding the initial parameter values.
    pub fn initial_image(&self) -> ProcessImage {
        let mut image = ProcessImage::for_registry(&self.registry);
        image.write(AMPLITUDE, 1.0f64);
        image.write(FREQUENCY, 1.0f64);
        image.write(ENABLE, true);
        image
    }

    /// Subscriptions of the logging session.
    pub fn logging_plan(&self) -> Vec<(usize, SubscriptionMode)> {
        vec![
            (
                self.signals.sine,
                SubscriptionMode::Periodic {
                    decimation: 100,
                    block_size: 10,
                },
            ),
            (
                self.signals.counter,
                SubscriptionMode::Periodic {
                    decimation: 1000,
                    block_size: 1,
                },
            ),
            (
                self.signals.axes,
                SubscriptionMode::Periodic {
                    decimation: 500,
                    block_size: 1,
                },
            ),
            (self.signals.temperature, SubscriptionMode::Event),
        ]
    }
}

fn positive_frequency(update: &mut ParameterUpdate<'_>) -> i32 {
    let hz = f64::read_ne(update.src);
    if !(hz.is_finite() && hz > 0.0) {
        return -libc::EINVAL;
    }
    raw_copy(update)
}

/// Values computed every base tick from the current parameters.
#[derive(Debug, Default)]
pub struct DemoModel {
    phase: f64,
    counter: u32,
}

impl DemoModel {
    /// Advance the model by `dt` seconds and write all signals into `image`.
    pub fn compute(&mut self, image: &mut ProcessImage, dt: f64) {
        let amplitude: f64 = image.read(AMPLITUDE);
        let frequency: f64 = image.read(FREQUENCY);
        let enabled: bool = image.read(ENABLE);

        if enabled {
            self.phase = (self.phase + TAU * frequency * dt) % TAU;
        }
        self.counter = self.counter.wrapping_add(1);

        let sine = amplitude * self.phase.sin();
        image.write(SINE, sine);
        image.write(COUNTER, self.counter);
        // Slow drift, only changes while enabled.
        image.write(TEMPERATURE, 20.0 + (5.0 * (self.phase / 8.0).sin()).round());
        for axis in 0..AXIS_COUNT {
            let shifted = amplitude * (self.phase + axis as f64 * TAU / 3.0).sin();
            image.write(AXES + 2 * axis, (shifted * 1000.0) as i16);
        }
    }
}
