//! Guest memory abstraction.
//!
//! The engine reads guest code and lets translated code perform loads and
//! stores through this seam. Implementations also expose the process memory
//! map, which the exec broker queries to resolve modules by name or address.

use bitflags::bitflags;
use std::fmt;
use std::ops::Range;
use thiserror::Error;

bitflags! {
    /// Access rights of a mapped region.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Permission: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = ['-', '-', '-'];
        if self.contains(Permission::READ) {
            s[0] = 'r';
        }
        if self.contains(Permission::WRITE) {
            s[1] = 'w';
        }
        if self.contains(Permission::EXEC) {
            s[2] = 'x';
        }
        write!(f, "{}{}{}", s[0], s[1], s[2])
    }
}

/// One entry of the guest memory map.
#[derive(Clone, Debug)]
pub struct MemoryMap {
    pub range: Range<u64>,
    pub permission: Permission,
    pub name: String,
}

/// A failed guest memory access.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("unmapped access of {len} bytes at {address:#x}")]
    Unmapped { address: u64, len: usize },
    #[error("write to non-writable region at {address:#x}")]
    Protected { address: u64 },
}

/// Byte-addressed guest memory.
pub trait Memory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError>;

    /// The memory map, in ascending address order.
    fn maps(&self) -> Vec<MemoryMap>;

    fn read_u8(&self, address: u64) -> Result<u8, MemoryError> {
        let mut b = [0u8; 1];
        self.read(address, &mut b)?;
        Ok(b[0])
    }

    fn read_u64(&self, address: u64) -> Result<u64, MemoryError> {
        let mut b = [0u8; 8];
        self.read(address, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn write_u8(&mut self, address: u64, value: u8) -> Result<(), MemoryError> {
        self.write(address, &[value])
    }

    fn write_u64(&mut self, address: u64, value: u64) -> Result<(), MemoryError> {
        self.write(address, &value.to_le_bytes())
    }

    /// Read up to `len` bytes starting at `address`, stopping at the end of
    /// the containing region. Used by the decoder, which must not fault when
    /// an instruction sits near the end of a mapping.
    fn read_code(&self, address: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; len];
        let mut n = len;
        loop {
            match self.read(address, &mut buf[..n]) {
                Ok(()) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(_) if n > 1 => n -= 1,
                Err(e) => return Err(e),
            }
        }
    }
}

struct Region {
    range: Range<u64>,
    permission: Permission,
    name: String,
    bytes: Vec<u8>,
}

/// An in-process guest address space made of named, permission-tagged
/// regions. The standard backing store for embedders and tests.
#[derive(Default)]
pub struct FlatMemory {
    regions: Vec<Region>,
}

impl FlatMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a zero-filled region. Panics if it overlaps an existing one.
    pub fn map_region(&mut self, name: &str, start: u64, size: u64, permission: Permission) {
        let range = start..start.checked_add(size).expect("region wraps the address space");
        assert!(
            !self
                .regions
                .iter()
                .any(|r| r.range.start < range.end && range.start < r.range.end),
            "region {name} at {start:#x} overlaps an existing mapping"
        );
        self.regions.push(Region {
            range,
            permission,
            name: name.to_string(),
            bytes: vec![0; size as usize],
        });
        self.regions.sort_by_key(|r| r.range.start);
    }

    /// Map a region holding `image`, typically an assembled code image.
    pub fn map_image(&mut self, name: &str, start: u64, image: &[u8], permission: Permission) {
        self.map_region(name, start, image.len() as u64, permission);
        self.write_ignoring_permissions(start, image);
    }

    /// Write through permission checks; loaders use this to fill read-only
    /// code regions.
    pub fn write_ignoring_permissions(&mut self, address: u64, data: &[u8]) {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.range.contains(&address))
            .expect("write_ignoring_permissions outside any region");
        let off = (address - region.range.start) as usize;
        region.bytes[off..off + data.len()].copy_from_slice(data);
    }

    fn region_of(&self, address: u64) -> Option<&Region> {
        self.regions.iter().find(|r| r.range.contains(&address))
    }
}

impl Memory for FlatMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let region = self.region_of(address).ok_or(MemoryError::Unmapped {
            address,
            len: buf.len(),
        })?;
        let off = (address - region.range.start) as usize;
        let avail = region.bytes.len() - off;
        if buf.len() > avail {
            return Err(MemoryError::Unmapped {
                address: region.range.end,
                len: buf.len() - avail,
            });
        }
        buf.copy_from_slice(&region.bytes[off..off + buf.len()]);
        Ok(())
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.range.contains(&address))
            .ok_or(MemoryError::Unmapped {
                address,
                len: data.len(),
            })?;
        if !region.permission.contains(Permission::WRITE) {
            return Err(MemoryError::Protected { address });
        }
        let off = (address - region.range.start) as usize;
        let avail = region.bytes.len() - off;
        if data.len() > avail {
            return Err(MemoryError::Unmapped {
                address: region.range.end,
                len: data.len() - avail,
            });
        }
        region.bytes[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn maps(&self) -> Vec<MemoryMap> {
        self.regions
            .iter()
            .map(|r| MemoryMap {
                range: r.range.clone(),
                permission: r.permission,
                name: r.name.clone(),
            })
            .collect()
    }
}
