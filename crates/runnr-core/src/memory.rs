//! Bounds-checked access to guest linear memory.
//!
//! Guest pointers and lengths arrive as `i32`. Negative values, overflowing
//! ranges and ranges past the end of memory are rejected with
//! [`RuntimeError::MemoryAccess`] instead of panicking the host.

use std::ops::Range;

use wasmtime::{AsContext, AsContextMut, Caller, Extern, Memory};

use runnr_common::RuntimeError;

/// Name of the linear memory every Runnable exports.
pub const MEMORY_EXPORT: &str = "memory";

fn range(ptr: i32, len: usize, memory_len: usize) -> Option<Range<usize>> {
    let start = usize::try_from(ptr).ok()?;
    let end = start.checked_add(len)?;
    (end <= memory_len).then_some(start..end)
}

fn out_of_bounds(ptr: i32, len: usize) -> RuntimeError {
    RuntimeError::MemoryAccess {
        ptr,
        len: i32::try_from(len).unwrap_or(i32::MAX),
    }
}

/// Copy `len` bytes starting at `ptr` out of `data`.
pub fn read_bytes(data: &[u8], ptr: i32, len: i32) -> Result<Vec<u8>, RuntimeError> {
    let len_usize = usize::try_from(len).map_err(|_| RuntimeError::MemoryAccess { ptr, len })?;
    range(ptr, len_usize, data.len())
        .map(|r| data[r].to_vec())
        .ok_or(RuntimeError::MemoryAccess { ptr, len })
}

/// Copy `bytes` into `data` starting at `ptr`.
pub fn write_bytes(data: &mut [u8], ptr: i32, bytes: &[u8]) -> Result<(), RuntimeError> {
    let r = range(ptr, bytes.len(), data.len()).ok_or_else(|| out_of_bounds(ptr, bytes.len()))?;
    data[r].copy_from_slice(bytes);
    Ok(())
}

/// Read from an instance's memory.
pub fn read(memory: Memory, store: impl AsContext, ptr: i32, len: i32) -> Result<Vec<u8>, RuntimeError> {
    read_bytes(memory.data(&store), ptr, len)
}

/// Write into an instance's memory.
pub fn write(
    memory: Memory,
    mut store: impl AsContextMut,
    ptr: i32,
    bytes: &[u8],
) -> Result<(), RuntimeError> {
    write_bytes(memory.data_mut(&mut store), ptr, bytes)
}

/// The calling instance's exported memory.
pub fn caller_memory<T>(caller: &mut Caller<'_, T>) -> Result<Memory, RuntimeError> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .ok_or_else(|| RuntimeError::MissingExport {
            name: MEMORY_EXPORT.into(),
        })
}

/// Copy `len` bytes out of the calling instance's memory.
pub fn read_caller<T>(caller: &mut Caller<'_, T>, ptr: i32, len: i32) -> Result<Vec<u8>, RuntimeError> {
    let memory = caller_memory(caller)?;
    read(memory, &*caller, ptr, len)
}

/// Read a UTF-8 string from guest memory, replacing invalid sequences.
pub fn read_string<T>(caller: &mut Caller<'_, T>, ptr: i32, len: i32) -> Result<String, RuntimeError> {
    let bytes = read_caller(caller, ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bytes() {
        let data = b"hello world";
        assert_eq!(read_bytes(data, 6, 5).unwrap(), b"world");
        assert_eq!(read_bytes(data, 11, 0).unwrap(), b"");
    }

    #[test]
    fn test_read_bytes_out_of_bounds() {
        let data = [0u8; 16];
        assert!(read_bytes(&data, 10, 7).is_err());
        assert!(read_bytes(&data, -1, 1).is_err());
        assert!(read_bytes(&data, 0, -1).is_err());
        assert!(read_bytes(&data, i32::MAX, i32::MAX).is_err());
    }

    #[test]
    fn test_write_bytes() {
        let mut data = [0u8; 8];
        write_bytes(&mut data, 2, b"abc").unwrap();
        assert_eq!(&data[..6], b"\0\0abc\0");

        let err = write_bytes(&mut data, 6, b"abc").unwrap_err();
        assert!(matches!(err, RuntimeError::MemoryAccess { ptr: 6, len: 3 }));
    }
}
