//! Binary emission buffers and per-function output.
//!
//! The code generator writes machine code into a [`CodeBuffer`] and records
//! the positions that need fixing up later: internal branches whose target
//! label has not been placed yet, and the four reference classes the module
//! layer resolves after all functions are compiled (pooled constants,
//! calls between module functions, imported symbols and globals).

use crate::ir::{ExternalId, FileId, FuncId, GlobalId, Label};

/// Offset in bytes from the beginning of a function's body.
pub type CodeOffset = u32;

/// A growable little-endian byte buffer.
#[derive(Default)]
pub struct CodeBuffer {
    data: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> CodeBuffer {
        CodeBuffer { data: Vec::with_capacity(64) }
    }

    /// Current write position.
    pub fn offset(&self) -> CodeOffset {
        self.data.len() as CodeOffset
    }

    /// Make room for `n` more bytes.
    pub fn reserve(&mut self, n: usize) {
        self.data.reserve(n);
    }

    pub fn put1(&mut self, b: u8) {
        self.data.push(b);
    }

    pub fn put2(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put4(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put8(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Overwrite four bytes at an earlier position.
    pub fn patch4(&mut self, at: CodeOffset, v: u32) {
        let at = at as usize;
        self.data[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// A branch displacement awaiting its target label's offset.
#[derive(Copy, Clone, Debug)]
pub struct LabelPatch {
    /// Position of the 32-bit displacement field.
    pub pos: CodeOffset,
    pub target: Label,
}

/// A 32-bit field referencing an entry in the module's constant pool.
#[derive(Clone, Debug)]
pub struct RodataPatch {
    /// Position of the 32-bit displacement field; the displacement is
    /// RIP-relative, measured from the end of the field.
    pub pos: CodeOffset,
    /// The pooled bytes.
    pub data: Box<[u8]>,
    /// Required alignment of the pooled bytes.
    pub align: u32,
}

/// A 32-bit relative reference to another function in the module.
#[derive(Copy, Clone, Debug)]
pub struct CallPatch {
    pub pos: CodeOffset,
    pub target: FuncId,
}

/// A 32-bit relative reference to an imported symbol.
#[derive(Copy, Clone, Debug)]
pub struct ExternPatch {
    pub pos: CodeOffset,
    pub target: ExternalId,
}

/// A 32-bit reference to a module global.
#[derive(Copy, Clone, Debug)]
pub struct GlobalPatch {
    pub pos: CodeOffset,
    pub target: GlobalId,
    /// True when the field holds a secondary TLS offset rather than a
    /// RIP-relative displacement.
    pub section_relative: bool,
}

/// One source line table entry.
#[derive(Copy, Clone, Debug)]
pub struct LineInfo {
    pub file: FileId,
    pub line: u32,
    pub offset: CodeOffset,
}

/// Everything the compilation of one function produces.
///
/// `code` holds the function body with internal branches already resolved;
/// the patch lists hold body-relative offsets of the 32-bit placeholder
/// fields, which are zero until the module layer fills them in. The
/// prologue and epilogue are kept separate so the module layer can compose
/// the final image.
pub struct CompiledCode {
    pub prologue: Vec<u8>,
    pub code: Vec<u8>,
    pub epilogue: Vec<u8>,

    /// Frame size in bytes, rounded to 16, including the return address.
    pub stack_usage: u32,
    /// Callee-saved registers the function touches: GPRs in the low 16
    /// bits, XMMs in the high 16.
    pub saved_regs: u32,

    pub lines: Vec<LineInfo>,
    pub rodata_patches: Vec<RodataPatch>,
    pub call_patches: Vec<CallPatch>,
    pub extern_patches: Vec<ExternPatch>,
    pub global_patches: Vec<GlobalPatch>,
}

impl CompiledCode {
    /// Total image size once prologue, body and epilogue are composed.
    pub fn image_len(&self) -> usize {
        self.prologue.len() + self.code.len() + self.epilogue.len()
    }

    /// Copy the composed image into a buffer.
    pub fn write_image(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.prologue);
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&self.epilogue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_writes() {
        let mut buf = CodeBuffer::new();
        buf.put1(0x01);
        buf.put2(0x0302);
        buf.put4(0x0706_0504);
        buf.put8(0x0F0E_0D0C_0B0A_0908);
        assert_eq!(
            buf.as_slice(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F]
        );
    }

    #[test]
    fn patching() {
        let mut buf = CodeBuffer::new();
        buf.put1(0xE9);
        let at = buf.offset();
        buf.put4(0);
        buf.put1(0xC3);
        buf.patch4(at, 0x11223344);
        assert_eq!(buf.as_slice(), &[0xE9, 0x44, 0x33, 0x22, 0x11, 0xC3]);
    }
}
