//! Native object emission.
//!
//! The composed text section goes out with one symbol per function;
//! pooled constants land in `.rodata`, globals in their data or TLS
//! sections, and every unresolved reference becomes a relocation. COFF is
//! selected for Windows triples and ELF64 for the rest; the `object`
//! writer owns the format details.

use crate::{layout, Module, ModuleError, Storage};
use keel_codegen::isa::System;
use object::write::{Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SymbolFlags, SymbolKind, SymbolScope,
};

pub(crate) fn write(module: &Module, w: &mut dyn std::io::Write) -> Result<(), ModuleError> {
    let format = match module.system() {
        System::Windows => BinaryFormat::Coff,
        System::Linux => BinaryFormat::Elf,
        System::MacOs => BinaryFormat::MachO,
    };
    let mut obj = Object::new(format, Architecture::X86_64, Endianness::Little);
    let l = layout(module)?;

    // Text plus one symbol per function.
    let text = obj.section_id(StandardSection::Text);
    obj.append_section_data(text, &l.text, 16);

    let compiled = module.all_compiled()?;
    for ((name, &off), code) in
        module.function_names().zip(&l.func_offsets).zip(&compiled)
    {
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: off as u64,
            size: code.image_len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    }

    // The constant pool.
    let rodata_sym = if l.rodata.is_empty() {
        None
    } else {
        let rodata = obj.section_id(StandardSection::ReadOnlyData);
        obj.append_section_data(rodata, &l.rodata, 16);
        Some(obj.section_symbol(rodata))
    };

    // Imports.
    let extern_syms: Vec<SymbolId> = module
        .externals()
        .iter()
        .map(|e| {
            obj.add_symbol(Symbol {
                name: e.name.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::Unknown,
                scope: SymbolScope::Unknown,
                weak: false,
                section: SymbolSection::Undefined,
                flags: SymbolFlags::None,
            })
        })
        .collect();

    // Globals, placed by storage class and initialisation.
    let global_syms: Vec<SymbolId> = module
        .globals()
        .iter()
        .map(|g| {
            let (section, offset) = match (g.storage, &g.init) {
                (Storage::Data, Some(init)) => {
                    let s = obj.section_id(StandardSection::Data);
                    (s, obj.append_section_data(s, init, u64::from(g.align)))
                }
                (Storage::Data, None) => {
                    let s = obj.section_id(StandardSection::UninitializedData);
                    (s, obj.append_section_bss(s, u64::from(g.size), u64::from(g.align)))
                }
                (Storage::Tls, Some(init)) => {
                    let s = obj.section_id(StandardSection::Tls);
                    (s, obj.append_section_data(s, init, u64::from(g.align)))
                }
                (Storage::Tls, None) => {
                    let s = obj.section_id(StandardSection::UninitializedTls);
                    (s, obj.append_section_bss(s, u64::from(g.size), u64::from(g.align)))
                }
            };
            obj.add_symbol(Symbol {
                name: g.name.as_bytes().to_vec(),
                value: offset,
                size: u64::from(g.size),
                kind: SymbolKind::Data,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(section),
                flags: SymbolFlags::None,
            })
        })
        .collect();

    let pc_rel = RelocationFlags::Generic {
        kind: RelocationKind::Relative,
        encoding: RelocationEncoding::Generic,
        size: 32,
    };

    for (at, ro_off) in &l.rodata_refs {
        obj.add_relocation(
            text,
            Relocation {
                offset: *at as u64,
                symbol: rodata_sym.expect("constant reference without a pool"),
                addend: *ro_off as i64 - 4,
                flags: pc_rel,
            },
        )?;
    }

    // Imports prefer PLT-relative fixups on ELF so the linker may route
    // them through a stub.
    let extern_flags = if format == BinaryFormat::Elf {
        RelocationFlags::Generic {
            kind: RelocationKind::PltRelative,
            encoding: RelocationEncoding::X86Branch,
            size: 32,
        }
    } else {
        pc_rel
    };
    for (at, ext) in &l.extern_refs {
        obj.add_relocation(
            text,
            Relocation {
                offset: *at as u64,
                symbol: extern_syms[ext.index()],
                addend: -4,
                flags: extern_flags,
            },
        )?;
    }

    for (at, global, section_relative) in &l.global_refs {
        let flags = if *section_relative {
            if format != BinaryFormat::Coff {
                return Err(ModuleError::Unsupported(
                    "section-relative TLS references outside COFF".into(),
                ));
            }
            RelocationFlags::Generic {
                kind: RelocationKind::SectionOffset,
                encoding: RelocationEncoding::Generic,
                size: 32,
            }
        } else {
            pc_rel
        };
        obj.add_relocation(
            text,
            Relocation {
                offset: *at as u64,
                symbol: global_syms[global.index()],
                addend: if *section_relative { 0 } else { -4 },
                flags,
            },
        )?;
    }

    let bytes = obj.write()?;
    w.write_all(&bytes)?;
    Ok(())
}
