//! # Debugger Facade
//!
//! The interface the analyzer consumes from a low-level debugger backend.
//!
//! This trait defines everything the engine needs from a stopped target, regardless of
//! how the backend obtains it (live process attach, core dump + executable):
//!
//! - bulk memory reads at arbitrary target virtual addresses
//! - DWARF-derived facts: resolved variable and type entries, PC→function mapping,
//!   closure capture layouts, runtime-type→type resolution
//! - enumeration of goroutine tasks with stack bounds and per-task stack traces
//! - the architecture descriptor and the Go toolchain version that produced the binary
//!
//! ## Why use a trait?
//!
//! The engine never links a concrete backend. Everything downstream of the facade is
//! deterministic decoding of target memory, which keeps the whole scan testable against
//! synthetic targets and keeps platform/debugger concerns out of this crate.
//!
//! ## Lifecycle
//!
//! The target is stopped for the duration of the scan and the facade is stateful; the
//! analyzer is single-threaded and fully synchronous, so implementations need no
//! internal locking.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mem::Memory;
use crate::types::{Address, RefType};

/// Target CPU architecture.
///
/// Stack pointer-mask derivation depends on the frame conventions of the architecture;
/// outside the supported set the root builder reports the gap instead of guessing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Architecture
{
    /// 64-bit x86
    Amd64,
    /// 64-bit ARM
    Arm64,
    /// Anything else; the name is reported in diagnostics.
    Other(String),
}

impl Architecture
{
    pub fn name(&self) -> &str
    {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
            Architecture::Other(name) => name,
        }
    }

    /// Pointer width in bytes. Every supported target is 64-bit.
    pub fn ptr_size(&self) -> i64
    {
        8
    }
}

/// A goroutine-equivalent task.
#[derive(Debug, Clone)]
pub struct TaskInfo
{
    /// Backend task identifier, used for frame-variable lookups.
    pub id: i64,
    /// Lowest address of the task's stack.
    pub stack_lo: u64,
    /// One past the highest address of the task's stack.
    pub stack_hi: u64,
}

/// A function known to the backend's PC tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncInfo
{
    /// Fully qualified name, e.g. `main.(*Server).run`.
    pub name: String,
    /// Entry PC; doubles as the cache key for per-function state.
    pub entry: u64,
}

/// One frame of an unwound task stack.
#[derive(Debug, Clone)]
pub struct FrameInfo
{
    pub pc: u64,
    pub sp: u64,
    /// Frame base (canonical frame address) as computed by the unwinder.
    pub frame_base: u64,
    /// Function owning `pc`, when the PC tables cover it.
    pub func: Option<FuncInfo>,
}

/// A resolved variable entry: a root (package global) or a frame local/argument.
///
/// The backend has already evaluated the DWARF location expression against the frame's
/// registers; what arrives here is a plain target address and a resolved type.
#[derive(Debug, Clone)]
pub struct VarEntry
{
    /// Declared name. Escaped locals keep their `&` prefix; compiler-internal names
    /// (`.dict`, `.closureptr`, `#state...`) are delivered as-is and filtered by the
    /// orchestrator.
    pub name: String,
    pub typ: Arc<RefType>,
    pub addr: u64,
    /// Lexical-block depth, used to order shadowed declarations.
    pub depth: i32,
    /// Whether this entry is a formal parameter.
    pub is_parameter: bool,
}

/// A function-scope variable carrying a closure capture offset.
#[derive(Debug, Clone)]
pub struct ClosureVarEntry
{
    pub name: String,
    pub typ: Arc<RefType>,
    /// Byte offset of the capture inside the closure object.
    pub closure_offset: i64,
}

/// The debugger capability the analyzer consumes.
pub trait Target
{
    /// The root memory reader for the stopped target.
    fn memory(&self) -> Memory;

    /// Architecture descriptor of the target.
    fn architecture(&self) -> Architecture;

    /// `(major, minor)` of the Go toolchain that produced the binary, if the producer
    /// string is present. Only consulted for the classic-map sentinel selection.
    fn go_version(&self) -> Option<(u32, u32)>;

    /// Resolve a runtime global (e.g. `runtime.mheap_`) to its address and type.
    fn runtime_global(&self, name: &str) -> Result<Option<(Address, Arc<RefType>)>>;

    /// Evaluate a runtime constant (e.g. `runtime._PageSize`).
    fn runtime_constant(&self, name: &str) -> Result<Option<i64>>;

    /// Look up a type by name (e.g. `runtime.specialfinalizer`).
    fn find_type(&self, name: &str) -> Result<Option<Arc<RefType>>>;

    /// Every package-level variable, named `pkgPath.varName`.
    fn global_variables(&self) -> Result<Vec<VarEntry>>;

    /// Enumerate tasks.
    fn tasks(&self) -> Result<Vec<TaskInfo>>;

    /// Unwind up to `max_frames` frames of a task's stack, innermost first.
    fn stacktrace(&self, task: &TaskInfo, max_frames: usize) -> Result<Vec<FrameInfo>>;

    /// Locals and formal parameters visible in one frame of a task.
    fn frame_variables(&self, task: &TaskInfo, frame_index: usize) -> Result<Vec<VarEntry>>;

    /// Map a PC to the function containing it.
    fn pc_to_func(&self, pc: u64) -> Option<FuncInfo>;

    /// Variables of `func` that carry a closure capture offset, for closure struct
    /// synthesis. Order follows the DWARF tree.
    fn closure_variables(&self, func: &FuncInfo) -> Result<Vec<ClosureVarEntry>>;

    /// Resolve a runtime type descriptor address to a resolved type plus the runtime
    /// kind flags (`KIND_DIRECT_IFACE` and friends).
    fn runtime_type_to_type(&self, type_addr: u64, data_addr: u64) -> Result<Option<(Arc<RefType>, i64)>>;
}

/// How to reach the target.
#[derive(Debug, Clone, Default)]
pub struct AttachConfig
{
    /// PID of a live process to attach to.
    pub pid: Option<u32>,
    /// Path to the executable (optional for attach, required for core dumps).
    pub executable: Option<std::path::PathBuf>,
    /// Path to a core dump.
    pub core: Option<std::path::PathBuf>,
}

/// Factory for a platform debugger backend.
///
/// The engine ships no backend of its own; builds that bundle one register it here.
/// Without one, attaching reports an initialization failure up front instead of
/// producing an empty profile.
pub fn create_target(_config: &AttachConfig) -> Result<Box<dyn Target>>
{
    Err(Error::Init(
        "no debugger backend is linked into this build".to_string(),
    ))
}
