// Content-addressed cache of successful compiles, keyed by contentHash.

use std::collections::HashMap;

use super::compiler::CompileOutput;

#[derive(Debug, Default)]
pub struct IrCache {
    entries: HashMap<String, CompileOutput>,
}

impl IrCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, content_hash: &str) -> Option<&CompileOutput> {
        self.entries.get(content_hash)
    }

    /// Only outputs carrying an IR are stored.
    pub fn insert(&mut self, content_hash: String, output: &CompileOutput) -> bool {
        if output.ir.is_none() {
            return false;
        }
        self.entries.insert(content_hash, output.clone());
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
