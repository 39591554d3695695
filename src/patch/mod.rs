//! Binary patching: memory access, x86-64 encoding, code loading and the transformer built on them.

pub mod asm;
pub mod loader;
pub mod memory;
pub mod transformer;

pub use loader::{CodeLoader, CodeUnit, ImageLoader, Rewriter};
#[cfg(target_os = "windows")]
pub use memory::LocalMemory;
pub use memory::{ImageMemory, Memory, OwnedMem};
pub use transformer::{CodeTransformer, Dialect, FrameLogic, MethodSignature, PatchContext, PatchPoint, PatchTable, TargetUnit, Trigger};
