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

//! The .idata section: one import descriptor for KERNEL32 plus a null
//! terminator, the name-pointer and IAT thunk arrays, the DLL name, and one
//! hint/name record per imported function. Descriptor fields and thunks are
//! patched once the section RVA is known; each IAT slot is then published
//! under `iat$<function>` for code-side fixups.

use std::collections::HashMap;

const IMPORT_DESCRIPTOR_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct ImportSpec {
    pub dll: String,
    pub funcs: Vec<String>,
}

impl ImportSpec {
    pub fn kernel32() -> Self {
        Self {
            dll: "KERNEL32.dll".to_string(),
            funcs: vec![
                "ExitProcess".to_string(),
                "GetStdHandle".to_string(),
                "WriteFile".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportTable {
    pub bytes: Vec<u8>,
    desc_off: u32,
    oft_off: u32,
    ft_off: u32,
    dll_off: u32,
    hint_name_offs: Vec<u32>,
    funcs: Vec<String>,
}

pub fn build_import_table(spec: &ImportSpec) -> ImportTable {
    let mut bytes = Vec::new();
    let align = |bytes: &mut Vec<u8>, a: usize| {
        while bytes.len() % a != 0 {
            bytes.push(0);
        }
    };

    // two descriptors, the second stays null
    let desc_off = bytes.len() as u32;
    bytes.resize(bytes.len() + IMPORT_DESCRIPTOR_SIZE * 2, 0);

    align(&mut bytes, 8);
    let oft_off = bytes.len() as u32;
    bytes.resize(bytes.len() + (spec.funcs.len() + 1) * 8, 0);

    align(&mut bytes, 8);
    let ft_off = bytes.len() as u32;
    bytes.resize(bytes.len() + (spec.funcs.len() + 1) * 8, 0);

    let dll_off = bytes.len() as u32;
    bytes.extend_from_slice(spec.dll.as_bytes());
    bytes.push(0);

    let mut hint_name_offs = Vec::with_capacity(spec.funcs.len());
    for func in &spec.funcs {
        align(&mut bytes, 2);
        hint_name_offs.push(bytes.len() as u32);
        bytes.extend_from_slice(&[0, 0]); // hint
        bytes.extend_from_slice(func.as_bytes());
        bytes.push(0);
    }

    ImportTable {
        bytes,
        desc_off,
        oft_off,
        ft_off,
        dll_off,
        hint_name_offs,
        funcs: spec.funcs.clone(),
    }
}

impl ImportTable {
    fn patch_u32(&mut self, at: u32, v: u32) {
        self.bytes[at as usize..at as usize + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn patch_u64(&mut self, at: u32, v: u64) {
        self.bytes[at as usize..at as usize + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Resolve every internal reference against the final section RVA and
    /// return the `iat$<func>` label map.
    pub fn patch(&mut self, rva_idata: u32) -> HashMap<String, u32> {
        let rva_oft = rva_idata + self.oft_off;
        let rva_ft = rva_idata + self.ft_off;
        let rva_dll = rva_idata + self.dll_off;

        // descriptor 0: OriginalFirstThunk, Name, FirstThunk
        self.patch_u32(self.desc_off, rva_oft);
        self.patch_u32(self.desc_off + 12, rva_dll);
        self.patch_u32(self.desc_off + 16, rva_ft);

        let mut iat = HashMap::new();
        for (index, func) in self.funcs.clone().into_iter().enumerate() {
            let hint_name_rva = (rva_idata + self.hint_name_offs[index]) as u64;
            self.patch_u64(self.oft_off + (index as u32) * 8, hint_name_rva);
            self.patch_u64(self.ft_off + (index as u32) * 8, hint_name_rva);
            iat.insert(
                format!("iat${}", func),
                rva_idata + self.ft_off + (index as u32) * 8,
            );
        }
        iat
    }
}
