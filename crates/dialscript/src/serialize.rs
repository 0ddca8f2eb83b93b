//! `.dsb` container serializer and deserializer.
//!
//! The container is little-endian throughout: a 4-byte magic, a major/minor
//! version, reserved flags, the metadata block, the constant/global/function
//! pools (u32 count, u16-length-prefixed UTF-8 entries), the function
//! entry-point table plus main entry, the code section, and an optional
//! debug-line section.
//!
//! Two serializer generations exist in the wild: older files end the
//! functions section after the names, newer ones append the parallel
//! entry-PC table and the main entry. The reader first parses the tail in
//! the new shape and falls back to the legacy shape if that fails to
//! account for every byte; a legacy file executes with main as its only
//! entry, starting at PC 0. The writer always produces the new shape.

use tracing::debug;

use crate::error::{Error, Result};
use crate::module::{BytecodeModule, LineEntry, Metadata, MAGIC, VERSION_MAJOR, VERSION_MINOR};

/// Sum of code bytes mod 2^16, stored in the metadata block.
pub fn checksum(code: &[u8]) -> u16 {
    code.iter().fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Serialize a module. The stored checksum is recomputed from the code.
pub fn serialize(module: &BytecodeModule) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(&MAGIC);
    out.push(VERSION_MAJOR);
    out.push(VERSION_MINOR);
    out.extend_from_slice(&0u16.to_le_bytes()); // reserved flags

    write_string(&mut out, &module.metadata.app_name);
    write_string(&mut out, &module.metadata.app_version);
    write_string(&mut out, &module.metadata.author);
    out.extend_from_slice(&module.metadata.heap_size.to_le_bytes());
    out.extend_from_slice(&module.metadata.version.to_le_bytes());
    out.extend_from_slice(&module.metadata.timestamp.to_le_bytes());
    out.extend_from_slice(&checksum(&module.code).to_le_bytes());

    write_pool(&mut out, &module.constants);
    write_pool(&mut out, &module.globals);
    write_pool(&mut out, &module.functions);
    for &entry in &module.function_entry_points {
        out.extend_from_slice(&entry.to_le_bytes());
    }
    out.extend_from_slice(&module.main_entry_point.to_le_bytes());

    out.extend_from_slice(&(module.code.len() as u32).to_le_bytes());
    out.extend_from_slice(&module.code);

    if let Some(map) = &module.debug_line_map {
        out.extend_from_slice(&(map.len() as u32).to_le_bytes());
        for entry in map {
            out.extend_from_slice(&entry.pc.to_le_bytes());
            out.extend_from_slice(&entry.line.to_le_bytes());
        }
    }

    out
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_pool(out: &mut Vec<u8>, pool: &[String]) {
    out.extend_from_slice(&(pool.len() as u32).to_le_bytes());
    for entry in pool {
        write_string(out, entry);
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Byte cursor over the input; every read is bounds-checked.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::Deserialize("Unexpected end of bytecode file".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Deserialize("Invalid string encoding".to_string()))
    }

    fn read_pool(&mut self) -> Result<Vec<String>> {
        let count = self.read_u32()? as usize;
        let mut pool = Vec::new();
        for _ in 0..count {
            pool.push(self.read_string()?);
        }
        Ok(pool)
    }
}

/// Deserialize a `.dsb` container.
pub fn deserialize(bytes: &[u8]) -> Result<BytecodeModule> {
    let mut reader = Reader::new(bytes);

    let magic = reader
        .take(4)
        .map_err(|_| Error::Deserialize("Invalid bytecode file format".to_string()))?;
    if magic != MAGIC {
        return Err(Error::Deserialize(
            "Invalid bytecode file format".to_string(),
        ));
    }
    let major = reader.read_u8()?;
    let _minor = reader.read_u8()?;
    if major != VERSION_MAJOR {
        return Err(Error::Deserialize(
            "Unsupported bytecode version".to_string(),
        ));
    }
    let _flags = reader.read_u16()?;

    let metadata = Metadata {
        app_name: reader.read_string()?,
        app_version: reader.read_string()?,
        author: reader.read_string()?,
        heap_size: reader.read_u32()?,
        version: reader.read_u32()?,
        timestamp: reader.read_u64()?,
        checksum: reader.read_u16()?,
    };

    let constants = reader.read_pool()?;
    let globals = reader.read_pool()?;
    let functions = reader.read_pool()?;

    // The tail exists in two shapes; try the entry-point shape first and
    // fall back to the legacy one.
    let tail_start = reader.pos;
    match read_tail(&mut reader, functions.len(), true) {
        Ok(tail) => {
            debug!(functions = functions.len(), "bytecode module loaded");
            Ok(assemble(metadata, constants, globals, functions, tail))
        }
        Err(_) => {
            reader.pos = tail_start;
            let tail = read_tail(&mut reader, functions.len(), false)?;
            debug!(
                functions = functions.len(),
                "legacy bytecode module loaded (no entry-point table)"
            );
            Ok(assemble(metadata, constants, globals, functions, tail))
        }
    }
}

struct Tail {
    entry_points: Vec<u32>,
    main_entry_point: u32,
    code: Vec<u8>,
    debug_line_map: Option<Vec<LineEntry>>,
}

fn read_tail(reader: &mut Reader<'_>, function_count: usize, with_entries: bool) -> Result<Tail> {
    let (entry_points, main_entry_point) = if with_entries {
        let mut entries = Vec::with_capacity(function_count);
        for _ in 0..function_count {
            entries.push(reader.read_u32()?);
        }
        (entries, reader.read_u32()?)
    } else {
        // Legacy shape: main is the only entry and the whole code vector is
        // its body.
        (vec![0; function_count], 0)
    };

    let code_len = reader.read_u32()? as usize;
    let code = reader.take(code_len)?.to_vec();

    for &entry in &entry_points {
        if entry as usize > code.len() {
            return Err(Error::Deserialize(
                "Function entry point outside code section".to_string(),
            ));
        }
    }
    if main_entry_point as usize > code.len() {
        return Err(Error::Deserialize(
            "Main entry point outside code section".to_string(),
        ));
    }

    let debug_line_map = if reader.at_end() {
        None
    } else {
        let count = reader.read_u32()? as usize;
        let mut map = Vec::new();
        for _ in 0..count {
            let pc = reader.read_u32()?;
            let line = reader.read_u32()?;
            map.push(LineEntry { pc, line });
        }
        Some(map)
    };

    if !reader.at_end() {
        return Err(Error::Deserialize(
            "Trailing bytes after bytecode sections".to_string(),
        ));
    }

    Ok(Tail {
        entry_points,
        main_entry_point,
        code,
        debug_line_map,
    })
}

fn assemble(
    metadata: Metadata,
    constants: Vec<String>,
    globals: Vec<String>,
    functions: Vec<String>,
    tail: Tail,
) -> BytecodeModule {
    BytecodeModule {
        code: tail.code,
        constants,
        globals,
        functions,
        function_entry_points: tail.entry_points,
        main_entry_point: tail.main_entry_point,
        metadata,
        debug_line_map: tail.debug_line_map,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_module() -> BytecodeModule {
        BytecodeModule {
            code: vec![0x04, 0x7F], // PUSH_NULL, HALT
            constants: vec!["hello".to_string()],
            globals: vec!["x".to_string()],
            functions: vec!["f".to_string()],
            function_entry_points: vec![0],
            main_entry_point: 0,
            metadata: Metadata {
                app_name: "demo".to_string(),
                app_version: "1.0".to_string(),
                author: "tester".to_string(),
                heap_size: 4096,
                version: 3,
                timestamp: 1_700_000_000,
                checksum: 0,
            },
            debug_line_map: Some(vec![LineEntry { pc: 0, line: 1 }]),
        }
    }

    #[test]
    fn round_trip_is_field_wise_identical() {
        let module = sample_module();
        let bytes = serialize(&module);
        let restored = deserialize(&bytes).unwrap();
        let mut expected = module.clone();
        expected.metadata.checksum = checksum(&module.code);
        assert_eq!(restored, expected);
    }

    #[test]
    fn short_input_is_invalid_format() {
        let err = deserialize(b"XYZ").unwrap_err();
        assert_eq!(
            err,
            Error::Deserialize("Invalid bytecode file format".to_string())
        );
    }

    #[test]
    fn wrong_magic_is_invalid_format() {
        let err = deserialize(b"XYZW").unwrap_err();
        assert_eq!(
            err,
            Error::Deserialize("Invalid bytecode file format".to_string())
        );
    }

    #[test]
    fn wrong_major_version_is_unsupported() {
        let mut bytes = serialize(&sample_module());
        bytes[4] = 2; // bump major
        let err = deserialize(&bytes).unwrap_err();
        assert_eq!(
            err,
            Error::Deserialize("Unsupported bytecode version".to_string())
        );
    }

    #[test]
    fn minor_version_bump_is_accepted() {
        let mut bytes = serialize(&sample_module());
        bytes[5] = 9;
        assert!(deserialize(&bytes).is_ok());
    }

    #[test]
    fn truncated_section_is_rejected() {
        let bytes = serialize(&sample_module());
        let err = deserialize(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::Deserialize(_)));
    }

    #[test]
    fn legacy_shape_without_entry_table_loads() {
        // Build the tail by hand: names, then code, with no entry table.
        let module = sample_module();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION_MAJOR);
        bytes.push(VERSION_MINOR);
        bytes.extend_from_slice(&0u16.to_le_bytes());
        write_string(&mut bytes, &module.metadata.app_name);
        write_string(&mut bytes, &module.metadata.app_version);
        write_string(&mut bytes, &module.metadata.author);
        bytes.extend_from_slice(&module.metadata.heap_size.to_le_bytes());
        bytes.extend_from_slice(&module.metadata.version.to_le_bytes());
        bytes.extend_from_slice(&module.metadata.timestamp.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        write_pool(&mut bytes, &module.constants);
        write_pool(&mut bytes, &module.globals);
        write_pool(&mut bytes, &module.functions);
        bytes.extend_from_slice(&(module.code.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&module.code);

        let restored = deserialize(&bytes).unwrap();
        // Main is the only entry in the legacy shape.
        assert_eq!(restored.main_entry_point, 0);
        assert_eq!(restored.function_entry_points, vec![0]);
        assert_eq!(restored.code, module.code);
        assert!(restored.debug_line_map.is_none());
    }

    #[test]
    fn checksum_is_recomputed_on_write() {
        let module = sample_module();
        let restored = deserialize(&serialize(&module)).unwrap();
        assert_eq!(restored.metadata.checksum, checksum(&module.code));
    }

    #[test]
    fn checksum_sums_code_bytes() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[1, 2, 3]), 6);
        assert_eq!(checksum(&[0xFF; 1000]), (1000u32 * 255 % 65536) as u16);
    }
}
