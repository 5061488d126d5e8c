//! Request dispatch: configuration, handler resolution and the dispatch pipeline.
//!
//! 1. **Configuration** (`config`, `definitions`, `properties`): connector
//!    settings, handler definition files and custom properties
//! 2. **Resolution** (`registry`, `preprocessor`, `timestamp`): locator cascade
//!    over an atomically swapped snapshot, reloaded when files change
//! 3. **Dispatch** (`dispatch`, `internal`, `interface`): the per-request state
//!    machine, built-in transaction methods and response element discovery
//! 4. **Outbound** (`outbound`, `scheduler`): synchronous calls and delayed
//!    fire-and-forget requests
//! 5. **Middleware** (`middleware`): Tower layers around the dispatcher

pub mod config;
pub mod context;
pub mod definitions;
pub mod dispatch;
pub mod interface;
pub mod internal;
pub mod middleware;
pub mod operation;
pub mod outbound;
pub mod preprocessor;
pub mod properties;
pub mod registry;
pub mod scheduler;
pub mod timestamp;

// Re-export key types for convenient access.
pub use config::{ConfigError, ConnectorConfig};
pub use context::ConnectorContext;
pub use dispatch::Dispatcher;
pub use operation::{
    DispatchError, DispatchOutcome, DispatchState, FaultCategory, InboundRequest, OutcomeKind,
};
pub use preprocessor::{PreProcessor, PreProcessorFactory};
pub use registry::HandlerRegistry;
