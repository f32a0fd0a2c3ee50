//! Rust Coroutine Library
//!
//! A single-threaded, tick-driven cooperative task scheduler with:
//! - Pooled suspension primitives (time, predicate, event, frame, callback)
//! - `All` / `OneOf` / `NumOf(n)` combinators
//! - Parent/child tasks with exception routing up the parent chain
//! - Generation-checked handles and reference-counted pools
//! - Realtime (spin_sleep) and offline (stepping) frame drivers

pub mod pool;
pub mod clock;
pub mod condition;
pub mod event;
pub mod primitive;
pub mod multi;
pub mod callback;
pub mod task;
pub mod body;
pub mod scheduler;
pub mod wait;
pub mod driver;
pub mod config;
pub mod error;
pub mod trace;


pub use body::{from_async, from_fn, Co, Step, TaskBody, TaskCx, Yield};
pub use callback::{CallbackWait, OnDone};
pub use clock::{Clock, TimeSource};
pub use condition::{Condition, SharedCondition};
pub use config::{DriverConfig, PoolConfig, SchedulerConfig};
pub use driver::FrameDriver;
pub use error::{SchedError, TaskException};
pub use event::Event;
pub use multi::MultiMode;
pub use primitive::{Payload, Suspension, SuspensionKind};
pub use scheduler::{Scheduler, WeakScheduler};
pub use task::{TaskHandle, TaskInfo, TaskOptions, TaskState};
pub use trace::init_tracing;
pub use wait::RepeatBody;
