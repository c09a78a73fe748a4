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

//! Builders for the read-only string pool (.rdata) and the writable globals
//! section (.data). Labels are section-relative offsets until the PE layout
//! assigns RVAs.

use std::collections::HashMap;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RDataBuilder {
    pub bytes: Vec<u8>,
    pub label_offsets: HashMap<String, u32>,
}

impl RDataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cstr(&mut self, label: &str, s: &str) {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.label_offsets.insert(label.to_string(), offset);
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DataBuilder {
    pub bytes: Vec<u8>,
    pub label_offsets: HashMap<String, u32>,
}

impl DataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn align(&mut self, a: usize) {
        while self.bytes.len() % a != 0 {
            self.bytes.push(0);
        }
    }

    pub fn add_u64(&mut self, label: &str, init: u64) {
        self.align(8);
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(&init.to_le_bytes());
        self.label_offsets.insert(label.to_string(), offset);
    }

    /// Zeroed block of `count` 8-byte slots.
    pub fn add_u64_array(&mut self, label: &str, count: u32) {
        self.align(8);
        let offset = self.bytes.len() as u32;
        self.bytes.resize(self.bytes.len() + count as usize * 8, 0);
        self.label_offsets.insert(label.to_string(), offset);
    }

    /// Zeroed word array, 16-aligned (MMIO backing stores).
    pub fn add_u32_array(&mut self, label: &str, count: u32) {
        self.align(16);
        let offset = self.bytes.len() as u32;
        self.bytes.resize(self.bytes.len() + count as usize * 4, 0);
        self.label_offsets.insert(label.to_string(), offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cstrings_are_nul_terminated_and_labelled() {
        let mut rdata = RDataBuilder::new();
        rdata.add_cstr("str$0", "hi\n");
        rdata.add_cstr("str$1", "x");
        assert_eq!(rdata.bytes, b"hi\n\0x\0");
        assert_eq!(rdata.label_offsets["str$0"], 0);
        assert_eq!(rdata.label_offsets["str$1"], 4);
    }

    #[test]
    fn test_data_alignment() {
        let mut data = DataBuilder::new();
        data.add_u64("g$stdout", 0);
        data.add_u32_array("mmio$R", 3);
        assert_eq!(data.label_offsets["g$stdout"], 0);
        assert_eq!(data.label_offsets["mmio$R"], 16);
        assert_eq!(data.bytes.len(), 28);
    }

    #[test]
    fn test_u64_array_reserves_zeroed_slots() {
        let mut data = DataBuilder::new();
        data.add_u64_array("g$slots", 16);
        assert_eq!(data.bytes.len(), 128);
        assert!(data.bytes.iter().all(|b| *b == 0));
    }
}
