//! Per-frame render hooks for a running host process.
//!
//! Symbols are resolved heuristically against a reflective host, every change is recorded in a
//! [`MutationLedger`] so it can be undone in reverse, and the frame render point is claimed by
//! one of two strategies: [`SubstitutionHook`] swaps the host's render object for a wrapper, and
//! [`CodeTransformer`] patches the compiled render method's returns with trampolines.
//! [`Coordinator`] ties it together and owns the lifecycle.

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod input;
pub mod ledger;
pub mod logging;
pub mod overlay;
pub mod patch;
pub mod resolver;
pub mod scheduler;
pub mod substitution;

pub use bridge::TeardownBridge;
pub use config::Config;
pub use coordinator::{Coordinator, HookRecord, InjectionContext, LifecycleState, StrategyKind, TeardownReport};
pub use error::{HookError, Result};
pub use host::{HostObject, HostRuntime, ObjectRef, Task, TypeInfo, Value};
pub use input::Keybinds;
pub use ledger::{InverseAction, MutationLedger, RestoreReport};
pub use overlay::{FrameContext, Overlay, OverlayRegistry};
pub use patch::{CodeLoader, CodeTransformer, Dialect, ImageLoader, ImageMemory, Memory, PatchTable};
pub use resolver::{Candidate, CandidateSet, MatchKind, Provenance, ResolvedHandle, Resolver};
pub use scheduler::{AwaitStatus, SchedulerBridge};
pub use substitution::{HookedObject, SubstitutionHook};
