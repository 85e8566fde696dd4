//! Memory management unit: an ordered list of named buses exposing a uniform
//! read/write interface, routed by address (§4.5, §9 design notes).

use tracing::trace;

use crate::error::RuntimeError;
use crate::immediate::{DataSize, Immediate};

/// A uniform read/write interface backing a contiguous address range
/// (GLOSSARY: Bus).
///
/// All current blocks are flat zero-initialized byte buffers; the trait
/// exists so the MMU's dispatch loop stays independent of storage kind, per
/// §9's note that heterogeneous buses should share one dispatch path rather
/// than a per-kind match.
pub trait Bus {
    fn name(&self) -> &str;
    fn size(&self) -> usize;
    fn read_slice(&self, start: usize, end: usize) -> &[u8];
    fn write_slice(&mut self, start: usize, data: &[u8]);
}

/// A named, fixed-length, zero-initialized byte buffer — the only bus kind
/// Nyx currently needs (§3 Memory block).
#[derive(Debug)]
pub struct MemoryBlock {
    name: String,
    storage: Vec<u8>,
}

impl MemoryBlock {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            storage: vec![0u8; size],
        }
    }

    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            storage: bytes,
        }
    }
}

impl Bus for MemoryBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.storage.len()
    }

    fn read_slice(&self, start: usize, end: usize) -> &[u8] {
        &self.storage[start..end]
    }

    fn write_slice(&mut self, start: usize, data: &[u8]) {
        self.storage[start..start + data.len()].copy_from_slice(data);
    }
}

/// Routes a flat address space across an ordered list of [`Bus`]es.
#[derive(Default)]
pub struct Mmu {
    buses: Vec<Box<dyn Bus>>,
}

impl Mmu {
    pub fn new() -> Self {
        Self { buses: Vec::new() }
    }

    /// Total addressable size: the sum of every bus's size (§3 invariant).
    pub fn size(&self) -> usize {
        self.buses.iter().map(|b| b.size()).sum()
    }

    /// Append an already-constructed block (used for the initial `Program`
    /// and `Memory` blocks at VM construction, §4.6).
    pub fn push_block(&mut self, bus: impl Bus + 'static) {
        self.buses.push(Box::new(bus));
    }

    /// Allocate a fresh zero-initialized block and return its absolute base
    /// address (§4.5 `add_block`).
    pub fn add_block(&mut self, name: impl Into<String>, size: usize) -> usize {
        let base = self.size();
        self.buses.push(Box::new(MemoryBlock::new(name, size)));
        base
    }

    /// Remove the block whose base address equals `base`. Used by the
    /// `free` syscall (§5); returns `false` if no block starts there.
    pub fn free_block_at(&mut self, base: usize) -> bool {
        let mut offset = 0usize;
        for (i, bus) in self.buses.iter().enumerate() {
            if offset == base {
                self.buses.remove(i);
                return true;
            }
            offset += bus.size();
        }
        false
    }

    /// Find the bus containing `addr` and the offset within it.
    fn locate(&self, addr: usize) -> Option<(usize, usize)> {
        let mut offset = 0usize;
        for (i, bus) in self.buses.iter().enumerate() {
            if addr < offset + bus.size() {
                return Some((i, addr - offset));
            }
            offset += bus.size();
        }
        None
    }

    pub fn read(&self, addr: usize, size: DataSize) -> Result<Immediate, RuntimeError> {
        let bytes = self.read_slice(addr, addr + size.bytes())?;
        Ok(Immediate::from_le_bytes(size, &bytes))
    }

    pub fn write(&mut self, addr: usize, value: &Immediate) -> Result<(), RuntimeError> {
        self.write_slice(addr, &value.to_le_bytes())
    }

    /// Read `[start, end)`, continuing across consecutive buses when the
    /// range straddles a boundary (§4.5).
    pub fn read_slice(&self, start: usize, end: usize) -> Result<Vec<u8>, RuntimeError> {
        if end < start {
            return Err(RuntimeError::AddressOutOfBounds(start));
        }

        let mut out = Vec::with_capacity(end - start);
        let mut cursor = start;
        let mut bus_offset = 0usize;

        for bus in &self.buses {
            let bus_start = bus_offset;
            let bus_end = bus_offset + bus.size();
            bus_offset = bus_end;

            if cursor >= end {
                break;
            }
            if cursor >= bus_end {
                continue;
            }

            let local_start = cursor - bus_start;
            let local_end = (end.min(bus_end)) - bus_start;
            trace!(bus = bus.name(), local_start, local_end, "mmu read");
            out.extend_from_slice(bus.read_slice(local_start, local_end));
            cursor = bus_start + local_end;
        }

        if cursor != end {
            return Err(RuntimeError::AddressOutOfBounds(end.saturating_sub(1)));
        }

        Ok(out)
    }

    /// Write `data` starting at `start`, continuing across consecutive buses.
    pub fn write_slice(&mut self, start: usize, data: &[u8]) -> Result<(), RuntimeError> {
        let end = start + data.len();
        let mut cursor = start;
        let mut written = 0usize;
        let mut bus_offset = 0usize;

        for bus in &mut self.buses {
            let bus_start = bus_offset;
            let bus_end = bus_offset + bus.size();
            bus_offset = bus_end;

            if cursor >= end {
                break;
            }
            if cursor >= bus_end {
                continue;
            }

            let local_start = cursor - bus_start;
            let local_end = (end.min(bus_end)) - bus_start;
            let chunk_len = local_end - local_start;
            bus.write_slice(local_start, &data[written..written + chunk_len]);
            written += chunk_len;
            cursor = bus_start + local_end;
        }

        if cursor != end {
            return Err(RuntimeError::AddressOutOfBounds(end.saturating_sub(1)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mmu_with_two_blocks(a: usize, b: usize) -> Mmu {
        let mut mmu = Mmu::new();
        mmu.push_block(MemoryBlock::new("a", a));
        mmu.push_block(MemoryBlock::new("b", b));
        mmu
    }

    #[test]
    fn last_byte_succeeds_word_at_same_address_fails() {
        let mmu = mmu_with_two_blocks(4, 4);
        let last = mmu.size() - 1;
        assert!(mmu.read(last, DataSize::Byte).is_ok());
        assert!(mmu.read(last, DataSize::Word).is_err());
    }

    #[test]
    fn straddling_write_then_read_round_trips() {
        let mut mmu = mmu_with_two_blocks(4, 4);
        let data = vec![1, 2, 3, 4, 5, 6];
        mmu.write_slice(2, &data).unwrap();
        assert_eq!(mmu.read_slice(2, 8).unwrap(), data);
    }

    #[test]
    fn add_block_returns_base_after_existing_blocks() {
        let mut mmu = mmu_with_two_blocks(4, 4);
        let base = mmu.add_block("heap", 16);
        assert_eq!(base, 8);
        assert_eq!(mmu.size(), 24);
    }

    #[test]
    fn free_block_removes_only_matching_base() {
        let mut mmu = mmu_with_two_blocks(4, 4);
        let base = mmu.add_block("heap", 16);
        assert!(!mmu.free_block_at(base + 1));
        assert!(mmu.free_block_at(base));
        assert_eq!(mmu.size(), 8);
    }

    #[test]
    fn gap_or_overrun_is_out_of_bounds() {
        let mmu = mmu_with_two_blocks(4, 4);
        assert!(mmu.read_slice(6, 10).is_err());
    }
}
