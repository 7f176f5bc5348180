//! # DAQ Shared Memory Transport
//!
//! Bridges a real-time control loop and any number of non-real-time client
//! sessions. Each periodic task owns one arena: a mailbox through which
//! sessions change the set of transmitted signals, and a ring of immutable
//! frames (`SignalList`, `SignalData`) the task writes once per cycle.
//! Sessions read the ring through their own cursor and turn the raw
//! per-tick values into decimated, blocked or change-triggered deliveries.
//!
//! ## Guarantees
//!
//! - **Non-blocking producer**: `TaskScheduler::tick` never waits, never
//!   allocates and never takes a lock shared with a session
//! - **Self-consistent readers**: every data frame is decoded with the signal
//!   list that was current when it was written
//! - **Bounded memory**: a reader that falls more than one ring behind loses
//!   the overwritten frames. Losses are counted in [`CursorStats`], never
//!   reported as errors, and the reader continues from the newest frame
//!
//! ## Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────── Arena (task n) ────────────────────────┐
//! ┌───────────────┐   │ ┌──────────┐   ┌────────────────────────────────────────────┐ │
//! │ TaskScheduler │◄──┼─┤ Mailbox  │   │ Frame ring                                 │ │
//! │ (RT thread)   ├───┼─┼──────────┼──►│ [List]─►[Data]─►[Data]─►[List]─►[Data]─► 0 │ │
//! └───────────────┘   │ └────▲─────┘   └──────────────┬─────────────────────────────┘ │
//!                     └──────┼────────────────────────┼───────────────────────────────┘
//!                            │ Insert/Remove          │ poll
//!                     ┌──────┴──────┐          ┌──────▼─────────┐      ┌───────────┐
//!                     │ TaskControl │◄─────────┤ Subscription   ├─────►│ Session   │
//!                     │ (refcounts) │          │ Manager+Cursor │      │ (encoder) │
//!                     └─────────────┘          └────────────────┘      └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use daq::layout::{ElementLayout, PrimitiveType};
//! use daq::timestamp::Timestamp;
//! use daq_shared_memory::{
//!     ProcessImage, Session, SignalValue, SubscriptionManager, SubscriptionMode, TaskSetup,
//!     VariableRegistry, create_task,
//! };
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl Session for Printer {
//!     fn new_signal_list(&mut self, task_id: usize, signals: &[u32]) {
//!         println!("task {task_id}: {signals:?}");
//!     }
//!
//!     fn new_signal_data(&mut self, _: usize, seq: u32, _: Timestamp, values: &[SignalValue<'_>]) {
//!         println!("#{seq}: {} values", values.len());
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = VariableRegistry::new(1);
//! let speed = registry.register_signal("/speed", 0, 1, ElementLayout::scalar(PrimitiveType::F64), 0)?;
//! registry.finalize();
//! let registry = Arc::new(registry);
//!
//! let mut image = ProcessImage::for_registry(&registry);
//! let (mut task, control) = create_task(&registry, &TaskSetup::new(0, 0.001))?;
//!
//! let mut session = SubscriptionManager::new([&control]);
//! session.subscribe(speed, SubscriptionMode::EVERY_TICK)?;
//!
//! // Real-time side
//! image.write(0, 12.5f64);
//! task.tick(&image, Some(Timestamp::now()));
//!
//! // Session side
//! session.poll(&mut Printer);
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - **TaskScheduler**: single owner, the task's real-time thread
//! - **ParameterCommitter**: single owner, the real-time thread
//! - **TaskControl / ParameterClient**: `Clone + Send + Sync`, used by sessions
//! - **SubscriptionManager / ReceiverCursor**: one per session thread

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod error;
pub mod image;
pub mod mailbox;
pub mod parameter;
pub mod platform;
pub mod receiver;
pub mod registry;
pub mod ring;
pub mod session;
pub mod subscription;
pub mod task;
pub mod version;

pub use arena::{Arena, ArenaLayout};
pub use error::{ParameterError, SetupError, SetupResult, SubscriptionError};
pub use image::ProcessImage;
pub use mailbox::{Instruction, InstructionKind, RetryPolicy};
pub use parameter::{ParameterClient, ParameterCommitter, ParameterWrite, parameter_channel};
pub use platform::ArenaMemoryConfig;
pub use receiver::{CursorEvent, CursorStats, DataFrame, ReceiverCursor};
pub use registry::{
    AccessMode, Parameter, ParameterCallback, ParameterUpdate, Signal, Variable, VariableInfo,
    VariableRegistry,
};
pub use session::{Session, SessionId, SignalValue};
pub use subscription::{Subscription, SubscriptionManager, SubscriptionMode};
pub use task::{TaskControl, TaskScheduler, TaskSetup, TaskStats, create_task};
pub use version::VersionCounter;

/// Initialize tracing for the transport's setup and session logging
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
