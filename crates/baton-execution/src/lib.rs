//! Execution orchestration for Baton.
//!
//! [`ExecutionMachine`] owns the single in-flight execution and its
//! `idle -> sending -> executing -> completed -> idle` lifecycle.
//! [`CompletionAggregator`] races the completion hook against output polling
//! once an execution is running, [`Dispatcher`] finds or provisions the
//! session a payload goes to, and [`ChainRunner`] runs payloads back-to-back.

pub mod aggregator;
pub mod chain;
pub mod dispatcher;
pub mod error;
pub mod machine;

pub use aggregator::{ArmedDetection, CompletionAggregator, PollingSettings, SignalSink};
pub use chain::{ChainOutcome, ChainRunner, ChainSpec, ChainStep, ChainTarget};
pub use dispatcher::{Dispatch, DispatchRequest, Dispatcher};
pub use error::DispatchError;
pub use machine::{
    ExecutionEvent, ExecutionHandle, ExecutionMachine, ExecutionSnapshot, MachineSettings,
};
