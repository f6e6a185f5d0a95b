//! Serialization of handler arguments into wasm linear memory.
//!
//! Strings and lists of strings are passed to wasm handlers by offset. The
//! layout is symmetric between writer and reader so a handler can echo an
//! argument offset back as its return value:
//!
//! - string at offset: `u32` little-endian byte length, then that many
//!   UTF-8 bytes;
//! - list of strings at offset: `u32` element count, then that many `u32`
//!   absolute offsets, each pointing at a string.
//!
//! Writers allocate by bumping a cursor through linear memory; running out
//! of memory mid-write fails the whole call.

const LEN_PREFIX: usize = size_of::<u32>();

fn bump(cursor: &mut usize, bytes: usize, limit: usize) -> Option<usize> {
    let start = *cursor;
    let end = start.checked_add(bytes)?;
    if end > limit {
        return None;
    }
    *cursor = end;
    Some(start)
}

/// Write one length-prefixed string; returns its offset.
pub fn write_string(memory: &mut [u8], cursor: &mut usize, value: &str) -> Option<u32> {
    let bytes = value.as_bytes();
    let start = bump(cursor, LEN_PREFIX + bytes.len(), memory.len())?;
    memory[start..start + LEN_PREFIX].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    memory[start + LEN_PREFIX..start + LEN_PREFIX + bytes.len()].copy_from_slice(bytes);
    u32::try_from(start).ok()
}

/// Write a list of strings (elements first, then the offset table);
/// returns the offset of the table.
pub fn write_list_of_string(memory: &mut [u8], cursor: &mut usize, values: &[String]) -> Option<u32> {
    let mut offsets = Vec::with_capacity(values.len());
    for value in values {
        offsets.push(write_string(memory, cursor, value)?);
    }
    let table_len = LEN_PREFIX + LEN_PREFIX * values.len();
    let start = bump(cursor, table_len, memory.len())?;
    memory[start..start + LEN_PREFIX].copy_from_slice(&(values.len() as u32).to_le_bytes());
    for (index, offset) in offsets.iter().enumerate() {
        let at = start + LEN_PREFIX + index * LEN_PREFIX;
        memory[at..at + LEN_PREFIX].copy_from_slice(&offset.to_le_bytes());
    }
    u32::try_from(start).ok()
}

fn read_u32(memory: &[u8], offset: usize) -> Option<u32> {
    let bytes = memory.get(offset..offset + LEN_PREFIX)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a length-prefixed string back from linear memory.
pub fn read_string(memory: &[u8], offset: u32) -> Option<String> {
    let offset = offset as usize;
    let len = read_u32(memory, offset)? as usize;
    let data = memory.get(offset + LEN_PREFIX..offset + LEN_PREFIX + len)?;
    String::from_utf8(data.to_vec()).ok()
}

/// Read a list of strings back from linear memory.
pub fn read_list_of_string(memory: &[u8], offset: u32) -> Option<Vec<String>> {
    let table = offset as usize;
    let count = read_u32(memory, table)? as usize;
    // A count that cannot possibly fit is a garbage offset, not a list.
    if count > memory.len() / LEN_PREFIX {
        return None;
    }
    let mut values = Vec::with_capacity(count);
    for index in 0..count {
        let entry = read_u32(memory, table + LEN_PREFIX + index * LEN_PREFIX)?;
        values.push(read_string(memory, entry)?);
    }
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trips_at_written_offset() {
        let mut memory = vec![0u8; 256];
        let mut cursor = 0;
        let offset = write_string(&mut memory, &mut cursor, "Foobar").unwrap();
        assert_eq!(read_string(&memory, offset).unwrap(), "Foobar");
        assert_eq!(cursor, LEN_PREFIX + "Foobar".len());
    }

    #[test]
    fn list_round_trips_and_preserves_order() {
        let mut memory = vec![0u8; 256];
        let mut cursor = 0;
        let values = vec!["a".to_string(), "".to_string(), "longer value".to_string()];
        let offset = write_list_of_string(&mut memory, &mut cursor, &values).unwrap();
        assert_eq!(read_list_of_string(&memory, offset).unwrap(), values);
    }

    #[test]
    fn writes_bump_allocate_contiguously() {
        let mut memory = vec![0u8; 256];
        let mut cursor = 0;
        let first = write_string(&mut memory, &mut cursor, "one").unwrap();
        let second = write_string(&mut memory, &mut cursor, "two").unwrap();
        assert_eq!(second as usize, first as usize + LEN_PREFIX + 3);
        assert_eq!(read_string(&memory, first).unwrap(), "one");
        assert_eq!(read_string(&memory, second).unwrap(), "two");
    }

    #[test]
    fn overflow_is_reported_not_truncated() {
        let mut memory = vec![0u8; 8];
        let mut cursor = 0;
        assert!(write_string(&mut memory, &mut cursor, "this does not fit").is_none());
    }

    #[test]
    fn reads_of_garbage_offsets_fail_cleanly() {
        let memory = vec![0xffu8; 32];
        assert!(read_string(&memory, 30).is_none());
        assert!(read_list_of_string(&memory, 0).is_none());
    }
}
