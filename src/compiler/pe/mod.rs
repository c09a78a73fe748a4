/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! PE64 image assembly: lay the four sections out at file-aligned raw
//! offsets and section-aligned RVAs, patch the import directory, resolve
//! every recorded rel32 fixup against the final label RVAs, and serialise
//! the headers. No external linker is involved.

pub mod data;
pub mod import_table;

use crate::compiler::encoder::Artifacts;
use crate::compiler::encoder::helpers::ENTRY;
use crate::errors::CompileError;
use import_table::build_import_table;
use std::collections::HashMap;

pub const FILE_ALIGN: u32 = 0x200;
pub const SECTION_ALIGN: u32 = 0x1000;
pub const IMAGE_BASE: u64 = 0x1_4000_0000;

const DOS_STUB: &[u8] = b"This program cannot be run in DOS mode.\r\r\n$";
const PE_FILE_HEADER_SIZE: u32 = 24;
const OPTIONAL_HEADER_SIZE: u32 = 240;
const SECTION_HEADER_SIZE: u32 = 40;
const SECTION_COUNT: u32 = 4;

pub fn align_up(x: u32, a: u32) -> u32 {
    (x + (a - 1)) & !(a - 1)
}

struct SectionPlan {
    name: &'static [u8],
    virtual_size: u32,
    rva: u32,
    raw_size: u32,
    raw_offset: u32,
    characteristics: u32,
}

pub fn build_image(art: Artifacts) -> Result<Vec<u8>, CompileError> {
    let Artifacts {
        mut code,
        rdata,
        data,
        imports,
    } = art;

    let mut idata = build_import_table(&imports);

    // Section RVAs, .text first at one section alignment.
    let rva_text = SECTION_ALIGN;
    let rva_rdata = rva_text + align_up(code.len() as u32, SECTION_ALIGN);
    let rva_data = rva_rdata + align_up(rdata.bytes.len() as u32, SECTION_ALIGN);
    let rva_idata = rva_data + align_up(data.bytes.len() as u32, SECTION_ALIGN);

    let iat_labels = idata.patch(rva_idata);

    // One label, one RVA, exactly one defining section.
    let mut rva_of: HashMap<String, u32> = HashMap::new();
    let define = |map: &mut HashMap<String, u32>, label: &str, rva: u32| {
        if map.insert(label.to_string(), rva).is_some() {
            return Err(CompileError::LayoutError {
                reason: format!("Label defined in more than one section: {}", label),
            });
        }
        Ok(())
    };
    for (label, offset) in &code.label_offsets {
        define(&mut rva_of, label, rva_text + *offset as u32)?;
    }
    for (label, offset) in &rdata.label_offsets {
        define(&mut rva_of, label, rva_rdata + offset)?;
    }
    for (label, offset) in &data.label_offsets {
        define(&mut rva_of, label, rva_data + offset)?;
    }
    for (label, rva) in &iat_labels {
        define(&mut rva_of, label, *rva)?;
    }

    // Resolve fixups: disp32 = target - (next instruction byte).
    for fixup in &code.rel32_fixups {
        let target = rva_of
            .get(&fixup.target)
            .copied()
            .ok_or_else(|| CompileError::LayoutError {
                reason: format!("Unresolved rel32 target: {}", fixup.target),
            })?;
        let next = rva_text + fixup.at as u32 + 4;
        let disp = (target as i64 - next as i64) as u32;
        code.bytes[fixup.at..fixup.at + 4].copy_from_slice(&disp.to_le_bytes());
    }

    let entry_offset = code
        .label_offsets
        .get(ENTRY)
        .copied()
        .ok_or_else(|| CompileError::LayoutError {
            reason: format!("Unresolved entry point label: {}", ENTRY),
        })?;
    let entry_rva = rva_text + entry_offset as u32;

    // Raw layout after the header region.
    let headers_size = align_up(
        0x80 + PE_FILE_HEADER_SIZE + OPTIONAL_HEADER_SIZE + SECTION_COUNT * SECTION_HEADER_SIZE,
        FILE_ALIGN,
    );
    let raw_text = headers_size;
    let raw_rdata = raw_text + align_up(code.len() as u32, FILE_ALIGN);
    let raw_data = raw_rdata + align_up(rdata.bytes.len() as u32, FILE_ALIGN);
    let raw_idata = raw_data + align_up(data.bytes.len() as u32, FILE_ALIGN);

    let sections = [
        SectionPlan {
            name: b".text\0\0\0",
            virtual_size: code.len() as u32,
            rva: rva_text,
            raw_size: align_up(code.len() as u32, FILE_ALIGN),
            raw_offset: raw_text,
            characteristics: 0x6000_0020, // code | execute | read
        },
        SectionPlan {
            name: b".rdata\0\0",
            virtual_size: rdata.bytes.len() as u32,
            rva: rva_rdata,
            raw_size: align_up(rdata.bytes.len() as u32, FILE_ALIGN),
            raw_offset: raw_rdata,
            characteristics: 0x4000_0040, // initialised | read
        },
        SectionPlan {
            name: b".data\0\0\0",
            virtual_size: data.bytes.len() as u32,
            rva: rva_data,
            raw_size: align_up(data.bytes.len() as u32, FILE_ALIGN),
            raw_offset: raw_data,
            characteristics: 0xC000_0040, // initialised | read | write
        },
        SectionPlan {
            name: b".idata\0\0",
            virtual_size: idata.bytes.len() as u32,
            rva: rva_idata,
            raw_size: align_up(idata.bytes.len() as u32, FILE_ALIGN),
            raw_offset: raw_idata,
            characteristics: 0xC000_0040,
        },
    ];

    let size_of_image = align_up(rva_idata + sections[3].virtual_size, SECTION_ALIGN);
    let size_of_initialized_data =
        sections[1].raw_size + sections[2].raw_size + sections[3].raw_size;

    let mut out = vec![0u8; (raw_idata + sections[3].raw_size) as usize];

    write_dos_header(&mut out);
    let mut at = 0x80;
    at = write_pe_file_header(&mut out, at);
    at = write_optional_header(
        &mut out,
        at,
        OptionalHeaderFields {
            size_of_code: sections[0].raw_size,
            size_of_initialized_data,
            entry_rva,
            base_of_code: rva_text,
            size_of_image,
            size_of_headers: headers_size,
            import_rva: rva_idata,
            import_size: idata.bytes.len() as u32,
        },
    );
    for section in &sections {
        at = write_section_header(&mut out, at, section);
    }
    debug_assert_eq!(
        at as u32,
        0x80 + PE_FILE_HEADER_SIZE + OPTIONAL_HEADER_SIZE + SECTION_COUNT * SECTION_HEADER_SIZE
    );

    copy_at(&mut out, raw_text, &code.bytes);
    copy_at(&mut out, raw_rdata, &rdata.bytes);
    copy_at(&mut out, raw_data, &data.bytes);
    copy_at(&mut out, raw_idata, &idata.bytes);

    Ok(out)
}

fn copy_at(out: &mut [u8], offset: u32, bytes: &[u8]) {
    out[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
}

fn put_u16(out: &mut [u8], at: usize, v: u16) -> usize {
    out[at..at + 2].copy_from_slice(&v.to_le_bytes());
    at + 2
}

fn put_u32(out: &mut [u8], at: usize, v: u32) -> usize {
    out[at..at + 4].copy_from_slice(&v.to_le_bytes());
    at + 4
}

fn put_u64(out: &mut [u8], at: usize, v: u64) -> usize {
    out[at..at + 8].copy_from_slice(&v.to_le_bytes());
    at + 8
}

fn write_dos_header(out: &mut [u8]) {
    let mut at = 0;
    at = put_u16(out, at, 0x5A4D); // e_magic "MZ"
    at = put_u16(out, at, 0x0090); // e_cblp
    at = put_u16(out, at, 0x0003); // e_cp
    at = put_u16(out, at, 0); // e_crlc
    at = put_u16(out, at, 0x0004); // e_cparhdr
    at = put_u16(out, at, 0); // e_minalloc
    at = put_u16(out, at, 0xFFFF); // e_maxalloc
    at = put_u16(out, at, 0); // e_ss
    at = put_u16(out, at, 0x00B8); // e_sp
    at = put_u16(out, at, 0); // e_csum
    at = put_u16(out, at, 0); // e_ip
    at = put_u16(out, at, 0); // e_cs
    at = put_u16(out, at, 0x0040); // e_lfarlc
    at = put_u16(out, at, 0); // e_ovno
    at += 8; // e_res
    at = put_u16(out, at, 0); // e_oemid
    at = put_u16(out, at, 0); // e_oeminfo
    at += 20; // e_res2
    put_u32(out, at, 0x80); // e_lfanew
    out[0x40..0x40 + DOS_STUB.len()].copy_from_slice(DOS_STUB);
}

fn write_pe_file_header(out: &mut [u8], mut at: usize) -> usize {
    out[at..at + 4].copy_from_slice(b"PE\0\0");
    at += 4;
    at = put_u16(out, at, 0x8664); // machine
    at = put_u16(out, at, SECTION_COUNT as u16);
    at = put_u32(out, at, 0); // TimeDateStamp, zero for reproducibility
    at = put_u32(out, at, 0); // PointerToSymbolTable
    at = put_u32(out, at, 0); // NumberOfSymbols
    at = put_u16(out, at, OPTIONAL_HEADER_SIZE as u16);
    put_u16(out, at, 0x0022) // EXECUTABLE | LARGE_ADDRESS_AWARE
}

struct OptionalHeaderFields {
    size_of_code: u32,
    size_of_initialized_data: u32,
    entry_rva: u32,
    base_of_code: u32,
    size_of_image: u32,
    size_of_headers: u32,
    import_rva: u32,
    import_size: u32,
}

fn write_optional_header(out: &mut [u8], mut at: usize, f: OptionalHeaderFields) -> usize {
    at = put_u16(out, at, 0x20B); // PE32+
    out[at] = 1; // MajorLinkerVersion
    out[at + 1] = 0;
    at += 2;
    at = put_u32(out, at, f.size_of_code);
    at = put_u32(out, at, f.size_of_initialized_data);
    at = put_u32(out, at, 0); // SizeOfUninitializedData
    at = put_u32(out, at, f.entry_rva);
    at = put_u32(out, at, f.base_of_code);
    at = put_u64(out, at, IMAGE_BASE);
    at = put_u32(out, at, SECTION_ALIGN);
    at = put_u32(out, at, FILE_ALIGN);
    at = put_u16(out, at, 6); // MajorOperatingSystemVersion
    at = put_u16(out, at, 0);
    at = put_u16(out, at, 0); // MajorImageVersion
    at = put_u16(out, at, 0);
    at = put_u16(out, at, 6); // MajorSubsystemVersion
    at = put_u16(out, at, 0);
    at = put_u32(out, at, 0); // Win32VersionValue
    at = put_u32(out, at, f.size_of_image);
    at = put_u32(out, at, f.size_of_headers);
    at = put_u32(out, at, 0); // CheckSum
    at = put_u16(out, at, 3); // WINDOWS_CUI
    at = put_u16(out, at, 0x8160); // NX | ASLR | HIGH_ENTROPY_VA | TS_AWARE
    at = put_u64(out, at, 1 << 20); // SizeOfStackReserve
    at = put_u64(out, at, 1 << 12); // SizeOfStackCommit
    at = put_u64(out, at, 1 << 20); // SizeOfHeapReserve
    at = put_u64(out, at, 1 << 12); // SizeOfHeapCommit
    at = put_u32(out, at, 0); // LoaderFlags
    at = put_u32(out, at, 16); // NumberOfRvaAndSizes
    for index in 0..16 {
        if index == 1 {
            at = put_u32(out, at, f.import_rva);
            at = put_u32(out, at, f.import_size);
        } else {
            at = put_u32(out, at, 0);
            at = put_u32(out, at, 0);
        }
    }
    at
}

fn write_section_header(out: &mut [u8], mut at: usize, section: &SectionPlan) -> usize {
    out[at..at + 8].copy_from_slice(section.name);
    at += 8;
    at = put_u32(out, at, section.virtual_size);
    at = put_u32(out, at, section.rva);
    at = put_u32(out, at, section.raw_size);
    at = put_u32(out, at, section.raw_offset);
    at = put_u32(out, at, 0); // PointerToRelocations
    at = put_u32(out, at, 0); // PointerToLinenumbers
    at = put_u16(out, at, 0); // NumberOfRelocations
    at = put_u16(out, at, 0); // NumberOfLinenumbers
    put_u32(out, at, section.characteristics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::encoder::code_buffer::CodeBuffer;
    use crate::compiler::pe::data::{DataBuilder, RDataBuilder};
    use crate::compiler::pe::import_table::ImportSpec;

    fn tiny_artifacts() -> Artifacts {
        let mut code = CodeBuffer::new();
        code.define_label(ENTRY).unwrap();
        code.jmp("lbl$fwd");
        code.lea_rcx_rip("str$0");
        code.call_iat("iat$ExitProcess");
        code.define_label("lbl$fwd").unwrap();
        code.ret();

        let mut rdata = RDataBuilder::new();
        rdata.add_cstr("str$0", "hi\n");
        let mut data = DataBuilder::new();
        data.add_u64("g$stdout", 0);

        Artifacts {
            code,
            rdata,
            data,
            imports: ImportSpec::kernel32(),
        }
    }

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_dos_and_pe_signatures() {
        let image = build_image(tiny_artifacts()).unwrap();
        assert_eq!(&image[0..2], b"MZ");
        assert_eq!(read_u32(&image, 0x3C), 0x80);
        assert_eq!(&image[0x80..0x84], b"PE\0\0");
        assert_eq!(
            u16::from_le_bytes(image[0x84..0x86].try_into().unwrap()),
            0x8664
        );
        assert_eq!(
            u16::from_le_bytes(image[0x86..0x88].try_into().unwrap()),
            4
        );
        // DOS stub text sits at 0x40
        assert_eq!(&image[0x40..0x44], b"This");
    }

    #[test]
    fn test_section_layout_equalities() {
        let image = build_image(tiny_artifacts()).unwrap();
        let section_table = 0x80 + 24 + 240;
        let mut prev_rva = 0;
        let mut prev_raw = 0;
        for index in 0..4 {
            let hdr = section_table + index * 40;
            let rva = read_u32(&image, hdr + 12);
            let raw_size = read_u32(&image, hdr + 16);
            let raw_ptr = read_u32(&image, hdr + 20);
            assert_eq!(rva % SECTION_ALIGN, 0);
            assert_eq!(raw_ptr % FILE_ALIGN, 0);
            assert!(rva > prev_rva);
            assert!(raw_ptr > prev_raw);
            if index == 0 {
                assert_eq!(rva, 0x1000);
                assert_eq!(raw_ptr, 0x400);
            } else {
                // raw offsets are exactly packed: previous raw + raw size
                let prev_hdr = section_table + (index - 1) * 40;
                let prev_size = read_u32(&image, prev_hdr + 16);
                let prev_ptr = read_u32(&image, prev_hdr + 20);
                assert_eq!(raw_ptr, prev_ptr + prev_size);
            }
            prev_rva = rva;
            prev_raw = raw_ptr;
            let _ = raw_size;
        }
    }

    #[test]
    fn test_entry_point_targets_the_trampoline() {
        let image = build_image(tiny_artifacts()).unwrap();
        let entry = read_u32(&image, 0x80 + 24 + 16);
        // ENTRY was defined at offset 0 of .text
        assert_eq!(entry, 0x1000);
    }

    #[test]
    fn test_rel32_fixup_displacement_equation() {
        let image = build_image(tiny_artifacts()).unwrap();
        let raw_text = 0x400;
        // jmp at text offset 0; lbl$fwd lands at 18 (jmp=5, lea=7, call=6)
        let disp = read_u32(&image, raw_text + 1);
        let target_rva = 0x1000 + 18;
        let next_rva = 0x1000 + 1 + 4;
        assert_eq!(disp, target_rva - next_rva);
    }

    #[test]
    fn test_rip_relative_data_reference_resolves_into_rdata() {
        let image = build_image(tiny_artifacts()).unwrap();
        let raw_text = 0x400;
        // lea rcx starts at offset 5; its disp32 field at 8
        let disp = read_u32(&image, raw_text + 8) as i32;
        let next_rva = 0x1000 + 8 + 4;
        let rva_rdata = 0x2000;
        assert_eq!(next_rva + disp, rva_rdata);
        // and the string bytes landed at that raw position
        let raw_rdata = 0x600;
        assert_eq!(&image[raw_rdata..raw_rdata + 4], b"hi\n\0");
    }

    #[test]
    fn test_import_directory_entry_points_at_idata() {
        let image = build_image(tiny_artifacts()).unwrap();
        let data_dir_1 = 0x80 + 24 + 112 + 8;
        let import_rva = read_u32(&image, data_dir_1);
        // idata is the fourth section: text, rdata, data each occupy one
        // section alignment here
        assert_eq!(import_rva, 0x4000);
        // the DLL name is present in the raw idata
        let raw_idata = 0xA00;
        let window = &image[raw_idata..];
        let found = window
            .windows("KERNEL32.dll".len())
            .any(|w| w == "KERNEL32.dll".as_bytes());
        assert!(found);
    }

    #[test]
    fn test_unresolved_fixup_is_fatal_and_names_the_label() {
        let mut art = tiny_artifacts();
        art.code.jmp("lbl$missing");
        let err = build_image(art).unwrap_err();
        match err {
            CompileError::LayoutError { reason } => {
                assert!(reason.contains("lbl$missing"))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_missing_entry_label_is_fatal() {
        let mut art = tiny_artifacts();
        art.code.label_offsets.remove(ENTRY);
        assert!(build_image(art).is_err());
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = build_image(tiny_artifacts()).unwrap();
        let b = build_image(tiny_artifacts()).unwrap();
        assert_eq!(a, b);
    }
}
