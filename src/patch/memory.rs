use crate::error::{HookError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

pub const PAGE_SIZE: usize = 0x1000;
const SAFETY: usize = 0x10;
const MAX_ALLOC_ATTEMPTS: usize = 100_000;

/// Byte-level access to the address space being patched.
pub trait Memory: Send + Sync {
  fn read(&self, address: usize, len: usize) -> Result<Vec<u8>>;

  fn write(&self, address: usize, bytes: &[u8]) -> Result<()>;

  /// Allocates executable memory, close enough to `near` for a rel32 jump when possible.
  fn alloc_near(&self, near: usize, size: usize) -> Result<OwnedMem>;
}

/// A block of executable memory owned by the patcher, filled front to back.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct OwnedMem {
  pub address: usize,
  pub size: usize,
  pub used: usize,
}

impl OwnedMem {
  pub fn new(address: usize, size: usize) -> Self { Self { address, size, used: 0 } }

  /// Next free address.
  pub fn cursor(&self) -> usize { self.address + self.used }

  /// Reserves `size` bytes and returns their address.
  pub fn take(&mut self, size: usize) -> Option<usize> {
    if !self.is_mem_enough(size) {
      return None;
    }
    let at = self.cursor();
    self.used += size;
    Some(at)
  }

  /// Whether `address` can reach this block with a rel32 jump.
  pub fn is_nearby(&self, address: usize) -> bool { self.address.abs_diff(address) <= i32::MAX as usize }

  pub fn is_mem_enough(&self, required_size: usize) -> bool {
    let available = self.size.saturating_sub(self.used + SAFETY);
    required_size <= available
  }

  pub fn address(&self) -> usize { self.address }

  pub fn size(&self) -> usize { self.size }

  pub fn used(&self) -> usize { self.used }
}

fn align_down(address: usize, align: usize) -> usize { address & !(align - 1) }

fn align_up(size: usize, align: usize) -> usize { (size + align - 1) & !(align - 1) }

/// A sparse address space made of mapped regions. Stands in for a process image when patching
/// offline or under test.
#[derive(Default, Debug)]
pub struct ImageMemory {
  regions: RwLock<BTreeMap<usize, Vec<u8>>>,
}

impl ImageMemory {
  pub fn new() -> Self { Self::default() }

  /// Maps `bytes` at `base`. Regions may not overlap.
  pub fn map(&self, base: usize, bytes: Vec<u8>) -> Result<()> {
    let mut regions = self.regions.write();
    if overlaps(&regions, base, bytes.len()) {
      return Err(HookError::memory(base, "region overlaps an existing mapping"));
    }
    regions.insert(base, bytes);
    Ok(())
  }

  pub fn regions(&self) -> Vec<(usize, usize)> { self.regions.read().iter().map(|(base, bytes)| (*base, bytes.len())).collect() }
}

fn overlaps(regions: &BTreeMap<usize, Vec<u8>>, base: usize, len: usize) -> bool { regions.iter().any(|(start, bytes)| *start < base + len && base < *start + bytes.len()) }

fn locate(regions: &BTreeMap<usize, Vec<u8>>, address: usize, len: usize) -> Result<(usize, usize)> {
  let (base, bytes) = regions.range(..=address).next_back().ok_or_else(|| HookError::memory(address, "not mapped"))?;
  let offset = address - base;
  if offset + len > bytes.len() {
    return Err(HookError::memory(address, format!("{len} byte(s) run past the mapping at {base:#X}")));
  }
  Ok((*base, offset))
}

impl Memory for ImageMemory {
  fn read(&self, address: usize, len: usize) -> Result<Vec<u8>> {
    let regions = self.regions.read();
    let (base, offset) = locate(&regions, address, len)?;
    Ok(regions[&base][offset..offset + len].to_vec())
  }

  fn write(&self, address: usize, bytes: &[u8]) -> Result<()> {
    let mut regions = self.regions.write();
    let (base, offset) = locate(&regions, address, bytes.len())?;
    if let Some(region) = regions.get_mut(&base) {
      region[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
    Ok(())
  }

  fn alloc_near(&self, near: usize, size: usize) -> Result<OwnedMem> {
    let size = align_up(size.max(1), PAGE_SIZE);
    let mut regions = self.regions.write();
    let start = align_down(near, PAGE_SIZE);

    // Walk down first, then up, one page at a time.
    for attempt in 1..=MAX_ALLOC_ATTEMPTS {
      let below = start.checked_sub(attempt * PAGE_SIZE);
      let above = start.checked_add(attempt * PAGE_SIZE);
      for candidate in [below, above].into_iter().flatten() {
        if candidate == 0 || candidate.abs_diff(near) > i32::MAX as usize || overlaps(&regions, candidate, size) {
          continue;
        }
        regions.insert(candidate, vec![0xCC; size]);
        return Ok(OwnedMem::new(candidate, size));
      }
    }

    Err(HookError::memory(near, "no free range within rel32 reach"))
  }
}

#[cfg(target_os = "windows")]
pub use local::LocalMemory;

#[cfg(target_os = "windows")]
mod local {
  use super::*;
  use ntapi::ntmmapi::{MemoryBasicInformation, NtAllocateVirtualMemory, NtQueryVirtualMemory};
  use winapi::{
    shared::ntdef::NT_SUCCESS,
    um::{
      memoryapi::{ReadProcessMemory, VirtualProtect, VirtualQuery},
      processthreadsapi::{FlushInstructionCache, GetCurrentProcess},
      winnt::{MEM_COMMIT, MEM_FREE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE},
    },
  };

  const ALLOC_GRANULARITY: usize = 0x10000;

  /// The current process, patched in place.
  #[derive(Clone, Copy, Debug, Default)]
  pub struct LocalMemory;

  impl LocalMemory {
    fn region_size(address: usize) -> Result<usize> {
      let mut mem_info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
      let result = unsafe { VirtualQuery(address as *mut _, &mut mem_info, std::mem::size_of::<MEMORY_BASIC_INFORMATION>()) };

      if result > 0 { Ok(mem_info.RegionSize) } else { Err(HookError::memory(address, "failed to retrieve region size")) }
    }
  }

  impl Memory for LocalMemory {
    fn read(&self, address: usize, len: usize) -> Result<Vec<u8>> {
      let mut bytes = vec![0u8; len];
      let mut bytes_read = 0;

      if unsafe { ReadProcessMemory(GetCurrentProcess(), address as _, bytes.as_mut_ptr() as *mut _, len, &mut bytes_read) } == 0 || bytes_read != len {
        return Err(HookError::memory(address, format!("read failed: {}", std::io::Error::last_os_error())));
      }
      Ok(bytes)
    }

    fn write(&self, address: usize, bytes: &[u8]) -> Result<()> {
      if bytes.is_empty() {
        return Ok(());
      }

      let mut old_protection = 0;
      if unsafe { VirtualProtect(address as _, bytes.len(), PAGE_EXECUTE_READWRITE, &mut old_protection) } == 0 {
        return Err(HookError::memory(address, format!("VirtualProtect failed: {}", std::io::Error::last_os_error())));
      }

      unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        let mut ignored = 0;
        VirtualProtect(address as _, bytes.len(), old_protection, &mut ignored);
        FlushInstructionCache(GetCurrentProcess(), address as _, bytes.len());
      }
      Ok(())
    }

    fn alloc_near(&self, near: usize, size: usize) -> Result<OwnedMem> {
      let process = unsafe { GetCurrentProcess() };
      let mut mem_info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
      let mut return_length: usize = 0;
      let mut current_address = align_down(near, ALLOC_GRANULARITY);
      let wanted = align_up(size.max(1), PAGE_SIZE);

      for _ in 0..MAX_ALLOC_ATTEMPTS {
        if current_address == 0 || current_address.abs_diff(near) > i32::MAX as usize {
          break;
        }

        let status = unsafe { NtQueryVirtualMemory(process, current_address as _, MemoryBasicInformation, &mut mem_info as *mut _ as _, std::mem::size_of::<MEMORY_BASIC_INFORMATION>(), &mut return_length as *mut _ as *mut _) };

        if NT_SUCCESS(status) {
          if mem_info.State == MEM_FREE && mem_info.RegionSize >= wanted {
            let mut base_address = current_address as _;
            let mut region_size = wanted;

            let alloc_status = unsafe { NtAllocateVirtualMemory(process, &mut base_address, 0, &mut region_size, MEM_RESERVE | MEM_COMMIT, PAGE_EXECUTE_READWRITE) };

            if NT_SUCCESS(alloc_status) && !base_address.is_null() {
              let size = Self::region_size(base_address as usize)?;
              return Ok(OwnedMem::new(base_address as usize, size));
            }
          }

          // Move to the allocation boundary below this region.
          current_address = align_down((mem_info.BaseAddress as usize).saturating_sub(1), ALLOC_GRANULARITY);
        } else {
          current_address = current_address.saturating_sub(ALLOC_GRANULARITY);
        }
      }

      Err(HookError::memory(near, "no free region within rel32 reach"))
    }
  }
}
