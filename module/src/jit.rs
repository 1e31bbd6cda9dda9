//! In-process finalisation.
//!
//! The composed module image is copied into fresh pages, every remaining
//! reference is resolved numerically, and the pages are flipped from
//! writable to executable. The returned handle owns the mapping; function
//! pointers taken from it die with it.

use crate::{align_up, layout, Module, ModuleError, Storage};
use keel_codegen::ir::FuncId;
use region::Protection;

/// A module mapped into executable memory.
pub struct JitModule {
    mapping: region::Allocation,
    func_offsets: Vec<usize>,
}

impl JitModule {
    /// The entry point of a compiled function.
    ///
    /// The pointer is valid for as long as this handle lives. Calling it
    /// is as unsafe as calling any foreign function.
    pub fn code_ptr(&self, id: FuncId) -> *const u8 {
        unsafe { self.mapping.as_ptr::<u8>().add(self.func_offsets[id.index()]) }
    }
}

fn pc_rel32(target: usize, at: usize) -> Result<i32, ModuleError> {
    let disp = target as i64 - (at as i64 + 4);
    i32::try_from(disp).map_err(|_| ModuleError::Jit("displacement out of range".into()))
}

pub(crate) fn finalize(
    module: &Module,
    resolve: impl Fn(&str) -> Option<*const u8>,
) -> Result<JitModule, ModuleError> {
    let l = layout(module)?;

    // Image plan: text, then the constant pool, then globals.
    let rodata_base = align_up(l.text.len(), 16);
    let mut global_offsets = Vec::with_capacity(module.globals().len());
    let mut total = rodata_base + l.rodata.len();
    for g in module.globals() {
        if g.storage == Storage::Tls {
            return Err(ModuleError::Unsupported("thread-local globals in the jit".into()));
        }
        total = align_up(total, g.align.max(1) as usize);
        global_offsets.push(total);
        total += g.size as usize;
    }

    let mut mapping = region::alloc(total.max(1), Protection::READ_WRITE)
        .map_err(|e| ModuleError::Jit(e.to_string()))?;
    let image: &mut [u8] =
        unsafe { std::slice::from_raw_parts_mut(mapping.as_mut_ptr::<u8>(), mapping.len()) };
    image[..l.text.len()].copy_from_slice(&l.text);
    image[rodata_base..rodata_base + l.rodata.len()].copy_from_slice(&l.rodata);
    for (g, &off) in module.globals().iter().zip(&global_offsets) {
        if let Some(init) = &g.init {
            image[off..off + init.len()].copy_from_slice(init);
        }
    }

    let base = image.as_ptr() as usize;
    for (at, ro_off) in &l.rodata_refs {
        let disp = pc_rel32(rodata_base + ro_off, *at)?;
        image[*at..*at + 4].copy_from_slice(&disp.to_le_bytes());
    }
    for (at, global, section_relative) in &l.global_refs {
        if *section_relative {
            return Err(ModuleError::Unsupported("thread-local globals in the jit".into()));
        }
        let disp = pc_rel32(global_offsets[global.index()], *at)?;
        image[*at..*at + 4].copy_from_slice(&disp.to_le_bytes());
    }
    for (at, ext) in &l.extern_refs {
        let name = &module.externals()[ext.index()].name;
        let addr = resolve(name).ok_or_else(|| ModuleError::UnresolvedSymbol(name.clone()))? as usize;
        let disp = i32::try_from(addr as i64 - (base as i64 + *at as i64 + 4))
            .map_err(|_| ModuleError::Jit(format!("{name} is out of rel32 range")))?;
        image[*at..*at + 4].copy_from_slice(&disp.to_le_bytes());
    }

    unsafe {
        region::protect(mapping.as_ptr::<u8>(), mapping.len(), Protection::READ_EXECUTE)
            .map_err(|e| ModuleError::Jit(e.to_string()))?;
    }

    Ok(JitModule { mapping, func_offsets: l.func_offsets })
}
