//! Module assembly and compilation driving.
//!
//! A [`Module`] owns the functions, imported symbols and globals of one
//! translation unit. Compilation verifies every function, runs the
//! optimisation pipeline, then fans functions out to worker threads: a
//! shared atomic counter hands out indices, every worker compiles into its
//! own scratch arena, and the per-function outputs are merged after the
//! join. The finished module can be written out as a native object file or
//! finalised in place for execution.

mod jit;
mod obj;

pub use jit::JitModule;

use keel_codegen::binemit::CompiledCode;
use keel_codegen::ir::{ExternalId, FuncId, Function, GlobalId, Prototype};
use keel_codegen::isa::{x64, FeatureSet, System, TargetIsa, UnsupportedTarget};
use keel_codegen::verifier::verify_function;
use keel_codegen::OptLevel;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use target_lexicon::Triple;
use thiserror::Error;

/// Where a global variable lives.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Storage {
    /// Ordinary mutable data.
    Data,
    /// One instance per thread. Code generation for these follows the
    /// Windows TEB scheme and is rejected elsewhere.
    Tls,
}

/// A global variable declaration.
pub struct Global {
    pub name: String,
    pub size: u32,
    pub align: u32,
    pub storage: Storage,
    /// Initial bytes; zero-initialised when absent.
    pub init: Option<Vec<u8>>,
}

/// An imported symbol.
pub struct External {
    pub name: String,
}

/// Errors surfaced by module-level operations. Everything else in the
/// backend treats failure as a bug and aborts.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Target(#[from] UnsupportedTarget),
    #[error("module failed verification with {count} errors")]
    Verification { count: usize },
    #[error("function {0} has not been compiled yet")]
    NotCompiled(u32),
    #[error("object emission failed: {0}")]
    Object(#[from] object::write::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("executable memory: {0}")]
    Jit(String),
    #[error("unresolved symbol {0}")]
    UnresolvedSymbol(String),
    #[error("{0} cannot be expressed in this output")]
    Unsupported(String),
}

/// A compilation unit.
pub struct Module {
    isa: TargetIsa,
    functions: Vec<Function>,
    externals: Vec<External>,
    globals: Vec<Global>,
    compiled: Vec<Option<CompiledCode>>,
    tls_index: Option<ExternalId>,
}

impl Module {
    /// Create a module targeting `triple`.
    pub fn new(triple: &Triple, features: FeatureSet) -> Result<Module, ModuleError> {
        let isa = TargetIsa::from_triple(triple, features)?;
        Ok(Module {
            isa,
            functions: Vec::new(),
            externals: Vec::new(),
            globals: Vec::new(),
            compiled: Vec::new(),
            tls_index: None,
        })
    }

    /// The resolved target description.
    pub fn isa(&self) -> &TargetIsa {
        &self.isa
    }

    /// Declare a function and get a handle for building and calling it.
    pub fn declare_function(&mut self, name: impl Into<String>, proto: Prototype) -> FuncId {
        let id = FuncId::from_u32(self.functions.len() as u32);
        self.functions.push(Function::new(id, name, proto));
        self.compiled.push(None);
        id
    }

    /// Declare an imported symbol. The import named `_tls_index` doubles
    /// as the anchor of the Windows TLS access sequence.
    pub fn declare_external(&mut self, name: impl Into<String>) -> ExternalId {
        let name = name.into();
        let id = ExternalId::from_u32(self.externals.len() as u32);
        if name == "_tls_index" {
            self.tls_index = Some(id);
        }
        self.externals.push(External { name });
        id
    }

    /// Declare a global variable.
    pub fn declare_global(
        &mut self,
        name: impl Into<String>,
        size: u32,
        align: u32,
        storage: Storage,
    ) -> GlobalId {
        let id = GlobalId::from_u32(self.globals.len() as u32);
        self.globals.push(Global { name: name.into(), size, align, storage, init: None });
        id
    }

    /// Provide initial bytes for a global.
    pub fn define_global(&mut self, id: GlobalId, init: Vec<u8>) {
        let g = &mut self.globals[id.index()];
        assert_eq!(init.len() as u32, g.size, "initialiser size mismatch for {}", g.name);
        g.init = Some(init);
    }

    /// The function behind an id.
    pub fn func(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    /// Mutable access for building a function body.
    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    /// The output of a compiled function.
    pub fn compiled(&self, id: FuncId) -> Result<&CompiledCode, ModuleError> {
        self.compiled[id.index()].as_ref().ok_or(ModuleError::NotCompiled(id.as_u32()))
    }

    /// Verify, optimise and compile every function.
    ///
    /// `max_threads` of 0 or 1 compiles on the calling thread.
    pub fn compile(&mut self, opt: OptLevel, max_threads: usize) -> Result<(), ModuleError> {
        // Refuse to compile corrupt input.
        let mut error_count = 0usize;
        for f in &self.functions {
            if let Err(errors) = verify_function(f) {
                for e in &errors {
                    log::error!("{}: {e}", f.name);
                }
                error_count += errors.len();
            }
        }
        if error_count > 0 {
            return Err(ModuleError::Verification { count: error_count });
        }

        if opt == OptLevel::Speed {
            // Inlining needs callee bodies while callers mutate, so the
            // pass pipeline works against a pre-optimisation snapshot.
            let snapshot = self.functions.clone();
            for f in &mut self.functions {
                keel_codegen::opt::run(f, Some(snapshot.as_slice()));
            }
        }

        let tls_globals: Vec<bool> =
            self.globals.iter().map(|g| g.storage == Storage::Tls).collect();
        let env = x64::FuncEnv { tls_globals: &tls_globals, tls_index: self.tls_index };
        let isa = self.isa;
        let functions = &self.functions;
        let count = functions.len();

        if max_threads <= 1 {
            let mut scratch = bumpalo::Bump::new();
            for (i, f) in functions.iter().enumerate() {
                let out = x64::compile_function(f, &isa, &env, &scratch);
                scratch.reset();
                self.compiled[i] = Some(out);
            }
            return Ok(());
        }

        // Worker threads pull indices from a shared counter and buffer
        // their outputs; the buffers merge after the join so the hot path
        // takes no lock per function.
        let next = AtomicUsize::new(0);
        let done: Mutex<Vec<(usize, CompiledCode)>> = Mutex::new(Vec::with_capacity(count));
        std::thread::scope(|scope| {
            for _ in 0..max_threads.min(count.max(1)) {
                scope.spawn(|| {
                    let mut scratch = bumpalo::Bump::new();
                    let mut local: Vec<(usize, CompiledCode)> = Vec::new();
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        if i >= count {
                            break;
                        }
                        let out = x64::compile_function(&functions[i], &isa, &env, &scratch);
                        scratch.reset();
                        local.push((i, out));
                    }
                    done.lock().unwrap().extend(local);
                });
            }
        });

        for (i, out) in done.into_inner().unwrap() {
            self.compiled[i] = Some(out);
        }
        Ok(())
    }

    /// Write the compiled module as a native object file: COFF for Windows
    /// targets, ELF64 otherwise.
    pub fn write_object(&self, w: &mut dyn std::io::Write) -> Result<(), ModuleError> {
        obj::write(self, w)
    }

    /// Map the compiled module into executable memory and resolve every
    /// reference in place. `resolve` supplies addresses for imported
    /// symbols.
    pub fn finalize_jit(
        &self,
        resolve: impl Fn(&str) -> Option<*const u8>,
    ) -> Result<JitModule, ModuleError> {
        jit::finalize(self, resolve)
    }

    pub(crate) fn system(&self) -> System {
        self.isa.system
    }

    pub(crate) fn all_compiled(&self) -> Result<Vec<&CompiledCode>, ModuleError> {
        self.compiled
            .iter()
            .enumerate()
            .map(|(i, c)| c.as_ref().ok_or(ModuleError::NotCompiled(i as u32)))
            .collect()
    }

    pub(crate) fn externals(&self) -> &[External] {
        &self.externals
    }

    pub(crate) fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub(crate) fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|f| f.name.as_str())
    }
}

pub(crate) fn align_up(x: usize, to: usize) -> usize {
    (x + to - 1) & !(to - 1)
}

/// The composed text and constant pool of a compiled module, with every
/// function-internal and cross-function reference already resolved and the
/// remaining reference classes rebased to section offsets.
pub(crate) struct ModuleLayout {
    pub text: Vec<u8>,
    /// Start of each function's image in `text`.
    pub func_offsets: Vec<usize>,
    pub rodata: Vec<u8>,
    /// `(text offset of a 32-bit field, rodata offset it refers to)`.
    pub rodata_refs: Vec<(usize, usize)>,
    /// `(text offset, import)`: pc-relative 32-bit references.
    pub extern_refs: Vec<(usize, ExternalId)>,
    /// `(text offset, global, section_relative)`.
    pub global_refs: Vec<(usize, GlobalId, bool)>,
}

pub(crate) fn layout(module: &Module) -> Result<ModuleLayout, ModuleError> {
    let compiled = module.all_compiled()?;

    let mut text = Vec::new();
    let mut func_offsets = Vec::with_capacity(compiled.len());
    let mut body_offsets = Vec::with_capacity(compiled.len());
    let mut rodata = Vec::new();
    let mut rodata_refs = Vec::new();
    let mut extern_refs = Vec::new();
    let mut global_refs = Vec::new();

    for code in &compiled {
        let start = align_up(text.len(), 16);
        text.resize(start, 0xCC);
        func_offsets.push(start);
        let body = start + code.prologue.len();
        body_offsets.push(body);
        code.write_image(&mut text);

        for p in &code.rodata_patches {
            let off = align_up(rodata.len(), p.align.max(1) as usize);
            rodata.resize(off, 0);
            rodata.extend_from_slice(&p.data);
            rodata_refs.push((body + p.pos as usize, off));
        }
        for p in &code.extern_patches {
            extern_refs.push((body + p.pos as usize, p.target));
        }
        for p in &code.global_patches {
            global_refs.push((body + p.pos as usize, p.target, p.section_relative));
        }
    }

    // Calls between module functions resolve now; both ends live in the
    // text section.
    for (i, code) in compiled.iter().enumerate() {
        for p in &code.call_patches {
            let at = body_offsets[i] + p.pos as usize;
            let target = func_offsets[p.target.index()];
            let disp = (target as i64 - (at as i64 + 4)) as i32;
            text[at..at + 4].copy_from_slice(&disp.to_le_bytes());
        }
    }

    Ok(ModuleLayout { text, func_offsets, rodata, rodata_refs, extern_refs, global_refs })
}
