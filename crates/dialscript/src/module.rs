//! In-memory bytecode module: the compiler's output and the VM's input.
//!
//! A module bundles the instruction stream with its constant/global/function
//! pools, entry points, app metadata, and an optional PC → source-line map.
//! Instructions refer to pool entries by index; the tables are interned so
//! identical strings share one slot.

/// `.dsb` container magic.
pub const MAGIC: [u8; 4] = *b"DSBC";
/// Container format version. Readers accept any `1.x`.
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

/// App metadata carried in the module header.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Metadata {
    pub app_name: String,
    pub app_version: String,
    pub author: String,
    /// Heap budget in bytes for the VM's allocation accounting.
    pub heap_size: u32,
    /// App-defined version number.
    pub version: u32,
    /// Unix timestamp of compilation, seconds.
    pub timestamp: u64,
    /// Sum of code bytes mod 2^16, written by the serializer.
    pub checksum: u16,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            app_version: String::new(),
            author: String::new(),
            heap_size: 64 * 1024,
            version: 0,
            timestamp: 0,
            checksum: 0,
        }
    }
}

/// One entry of the optional debug line map, sorted by `pc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LineEntry {
    pub pc: u32,
    pub line: u32,
}

/// A compiled bytecode module.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BytecodeModule {
    /// Contiguous instruction stream.
    pub code: Vec<u8>,
    /// Interned strings: literals, field names, class names.
    pub constants: Vec<String>,
    /// Interned global-variable names.
    pub globals: Vec<String>,
    /// Function names: free functions, `Class::constructor`, `Class::method`.
    pub functions: Vec<String>,
    /// Entry PC of each function, parallel to `functions`.
    pub function_entry_points: Vec<u32>,
    /// PC at which top-level code begins. Functions are laid out first, so
    /// this is ≥ every function entry.
    pub main_entry_point: u32,
    pub metadata: Metadata,
    /// Optional sorted PC → source-line map.
    pub debug_line_map: Option<Vec<LineEntry>>,
}

impl Default for BytecodeModule {
    fn default() -> Self {
        Self {
            code: Vec::new(),
            constants: Vec::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            function_entry_points: Vec::new(),
            main_entry_point: 0,
            metadata: Metadata::default(),
            debug_line_map: None,
        }
    }
}

impl BytecodeModule {
    /// Source line for a runtime PC, when a debug map is present.
    ///
    /// Returns the line of the last map entry at or before `pc`.
    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        let map = self.debug_line_map.as_ref()?;
        match map.binary_search_by_key(&pc, |e| e.pc) {
            Ok(i) => Some(map[i].line),
            Err(0) => None,
            Err(i) => Some(map[i - 1].line),
        }
    }

    /// Index of a function by exact name.
    pub fn function_index(&self, name: &str) -> Option<u16> {
        self.functions
            .iter()
            .position(|f| f == name)
            .map(|i| i as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_lookup_uses_last_entry_at_or_before_pc() {
        let module = BytecodeModule {
            debug_line_map: Some(vec![
                LineEntry { pc: 0, line: 1 },
                LineEntry { pc: 5, line: 2 },
                LineEntry { pc: 9, line: 4 },
            ]),
            ..Default::default()
        };
        assert_eq!(module.line_for_pc(0), Some(1));
        assert_eq!(module.line_for_pc(4), Some(1));
        assert_eq!(module.line_for_pc(5), Some(2));
        assert_eq!(module.line_for_pc(100), Some(4));
    }

    #[test]
    fn line_lookup_without_map_is_none() {
        assert_eq!(BytecodeModule::default().line_for_pc(0), None);
    }
}
