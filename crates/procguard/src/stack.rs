//! Call stack capture and formatting.
//!
//! A [`StackWalker`] produces [`StackFrame`]s innermost first. The real
//! walker unwinds with the `backtrace` crate and resolves symbols and source
//! lines from the debug info of whatever module owns each return address.
//! Every lookup can come up empty; the frame is still printed with a marker.

use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;

pub const DEFAULT_MAX_FRAMES: usize = 256;

/// Words read from the stack next to each frame.
pub const FRAME_ARGS: usize = 4;

/// Where a fault happened, taken from the signal context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultContext {
    pub pc: usize,
    pub frame_pointer: usize,
    pub stack_pointer: usize,
}

impl FaultContext {
    /// Read the interrupted registers out of a `ucontext_t`.
    ///
    /// # Safety
    ///
    /// `context` must be null or the third argument of an `SA_SIGINFO`
    /// handler currently running.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub unsafe fn from_ucontext(context: *mut std::ffi::c_void) -> Option<Self> {
        let uc = context as *const libc::ucontext_t;
        if uc.is_null() {
            return None;
        }
        let gregs = &(*uc).uc_mcontext.gregs;
        Some(Self {
            pc: gregs[libc::REG_RIP as usize] as usize,
            frame_pointer: gregs[libc::REG_RBP as usize] as usize,
            stack_pointer: gregs[libc::REG_RSP as usize] as usize,
        })
    }

    /// # Safety
    ///
    /// See the x86_64 variant.
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    pub unsafe fn from_ucontext(context: *mut std::ffi::c_void) -> Option<Self> {
        let uc = context as *const libc::ucontext_t;
        if uc.is_null() {
            return None;
        }
        let mc = &(*uc).uc_mcontext;
        Some(Self {
            pc: mc.pc as usize,
            frame_pointer: mc.regs[29] as usize,
            stack_pointer: mc.sp as usize,
        })
    }

    /// # Safety
    ///
    /// Always safe here; register layout unknown on this target.
    #[cfg(all(
        unix,
        not(all(
            target_os = "linux",
            any(target_arch = "x86_64", target_arch = "aarch64")
        ))
    ))]
    pub unsafe fn from_ucontext(_context: *mut std::ffi::c_void) -> Option<Self> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Demangled name.
    pub name: String,
    /// Bytes from the symbol start to the frame's pc.
    pub displacement: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub file: PathBuf,
    pub line: u32,
    pub column: Option<u32>,
}

impl fmt::Display for LineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)?;
        if let Some(column) = self.column {
            write!(f, ":{}", column)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub index: usize,
    pub pc: usize,
    /// Canonical frame address reported by the unwinder.
    pub frame_address: usize,
    /// Raw words at `frame_address`; the caller's argument slots on most ABIs.
    pub args: [usize; FRAME_ARGS],
    /// False when no loaded module covers `pc` (JIT code, corrupt return).
    pub in_known_module: bool,
    pub symbol: Option<SymbolInfo>,
    pub line: Option<LineInfo>,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {:#018x} (", self.index, self.pc)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:#018x}", arg)?;
        }
        f.write_str(")")?;

        if !self.in_known_module {
            return f.write_str(" <unknown module>");
        }
        match &self.symbol {
            Some(symbol) => write!(f, " {} + {:#x}", symbol.name, symbol.displacement)?,
            None => f.write_str(" <no symbol>")?,
        }
        if let Some(line) = &self.line {
            write!(f, "\n    {}", line)?;
        }
        Ok(())
    }
}

/// Source of stack frames.
pub trait StackWalker {
    /// Feed frames to `visit`, innermost first, until it returns false or
    /// the stack ends. With `start`, frames above the faulting pc (the
    /// handler's own) are skipped.
    fn walk(&self, start: Option<&FaultContext>, visit: &mut dyn FnMut(StackFrame) -> bool);
}

/// Unwinds the calling thread's stack.
#[derive(Debug, Clone, Copy)]
pub struct UnwindWalker {
    max_frames: usize,
}

impl Default for UnwindWalker {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }
}

impl UnwindWalker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames.max(1);
        self
    }

    fn walk_from(
        &self,
        skip_until: Option<usize>,
        visit: &mut dyn FnMut(StackFrame) -> bool,
    ) -> usize {
        let mut skipping = skip_until.is_some();
        let mut index = 0;
        // Unsynchronized: this also runs inside a fault handler, where the
        // crate's global lock may already be held by the faulting thread.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                let pc = frame.ip() as usize;
                if pc == 0 {
                    return false;
                }
                if skipping {
                    if Some(pc) != skip_until {
                        return true;
                    }
                    skipping = false;
                }
                let described = describe_frame(frame, index);
                index += 1;
                visit(described) && index < self.max_frames
            });
        }
        index
    }
}

impl StackWalker for UnwindWalker {
    fn walk(&self, start: Option<&FaultContext>, visit: &mut dyn FnMut(StackFrame) -> bool) {
        let emitted = self.walk_from(start.map(|ctx| ctx.pc), visit);
        if emitted == 0 && start.is_some() {
            // The faulting pc never showed up; print the whole stack instead.
            self.walk_from(None, visit);
        }
    }
}

struct ModuleSymbol {
    name: Option<String>,
    addr: usize,
}

#[cfg(unix)]
fn module_lookup(pc: usize) -> Option<ModuleSymbol> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    if unsafe { libc::dladdr(pc as *const libc::c_void, &mut info) } == 0 {
        return None;
    }
    let name = if info.dli_sname.is_null() {
        None
    } else {
        let raw = unsafe { std::ffi::CStr::from_ptr(info.dli_sname) };
        Some(raw.to_string_lossy().into_owned())
    };
    Some(ModuleSymbol {
        name,
        addr: info.dli_saddr as usize,
    })
}

#[cfg(not(unix))]
fn module_lookup(_pc: usize) -> Option<ModuleSymbol> {
    Some(ModuleSymbol {
        name: None,
        addr: 0,
    })
}

fn read_stack_words(addr: usize) -> [usize; FRAME_ARGS] {
    let mut words = [0usize; FRAME_ARGS];
    if addr == 0 || addr % std::mem::align_of::<usize>() != 0 {
        return words;
    }
    let base = addr as *const usize;
    for (i, word) in words.iter_mut().enumerate() {
        *word = unsafe { std::ptr::read_volatile(base.add(i)) };
    }
    words
}

unsafe fn describe_frame(frame: &backtrace::Frame, index: usize) -> StackFrame {
    let pc = frame.ip() as usize;
    let frame_address = frame.sp() as usize;
    let mut out = StackFrame {
        index,
        pc,
        frame_address,
        args: read_stack_words(frame_address),
        in_known_module: false,
        symbol: None,
        line: None,
    };

    let Some(module) = module_lookup(pc) else {
        return out;
    };
    out.in_known_module = true;

    // Called once per inlined function, innermost first.
    backtrace::resolve_frame_unsynchronized(frame, |symbol| {
        if out.symbol.is_none() {
            if let Some(name) = symbol.name() {
                let start = symbol.addr().map_or(pc, |addr| addr as usize);
                out.symbol = Some(SymbolInfo {
                    name: name.to_string(),
                    displacement: pc.saturating_sub(start),
                });
            }
        }
        if out.line.is_none() {
            if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                out.line = Some(LineInfo {
                    file: file.to_path_buf(),
                    line,
                    column: symbol.colno(),
                });
            }
        }
    });

    if out.symbol.is_none() {
        if let Some(name) = module.name {
            out.symbol = Some(SymbolInfo {
                name,
                displacement: pc.saturating_sub(module.addr),
            });
        }
    }
    out
}

/// Write every frame `walker` yields, one per line.
pub fn write_trace(
    walker: &dyn StackWalker,
    start: Option<&FaultContext>,
    out: &mut dyn Write,
) -> io::Result<()> {
    let mut frames = 0usize;
    let mut result = Ok(());
    walker.walk(start, &mut |frame| {
        frames += 1;
        match writeln!(out, "{}", frame) {
            Ok(()) => true,
            Err(err) => {
                result = Err(err);
                false
            }
        }
    });
    result?;
    if frames == 0 {
        writeln!(out, "<stack trace unavailable>")?;
    }
    out.flush()
}

/// Print the current thread's stack to `out`.
pub fn print_stack_trace(out: &mut dyn Write) -> io::Result<()> {
    write_trace(&UnwindWalker::default(), None, out)
}
