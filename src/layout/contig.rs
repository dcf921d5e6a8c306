//! Contiguous storage: one block of `nelmts * elem_size` bytes, staged
//! through the sieve buffer.

use super::sieve::Sieve;
use super::{SpaceStatus, checked_mem_range, checked_src_range};
use crate::dataset::FillValue;
use crate::error::{Result, StorageError};
use crate::file::StorageFile;
use crate::io::{IoOp, SeqList, pair_vv};
use tracing::debug;

/// Largest piece of fill written at a time when storage is first allocated.
const FILL_BLOCK: u64 = 1 << 20;

pub(crate) struct ContigStorage {
    addr: Option<u64>,
    size: u64,
    sieve: Sieve,
    fill: FillValue,
}

impl ContigStorage {
    pub(crate) fn new(addr: Option<u64>, size: u64, sieve_buf_size: usize, fill: FillValue) -> Self {
        Self {
            addr,
            size,
            sieve: Sieve::new(sieve_buf_size),
            fill,
        }
    }

    pub(crate) fn addr(&self) -> Option<u64> {
        self.addr
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn storage_size(&self) -> u64 {
        if self.addr.is_some() { self.size } else { 0 }
    }

    pub(crate) fn allocation_status(&self) -> SpaceStatus {
        match self.addr {
            Some(_) => SpaceStatus::Allocated,
            None if self.size == 0 => SpaceStatus::Allocated,
            None => SpaceStatus::NotAllocated,
        }
    }

    /// Allocate the block and write the fill value over it.
    pub(crate) async fn allocate(&mut self, file: &StorageFile) -> Result<u64> {
        if let Some(addr) = self.addr {
            return Ok(addr);
        }
        let addr = file.alloc(self.size);
        let block = FILL_BLOCK.min(self.size) as usize;
        let mut pattern = vec![0u8; block];
        let mut off = 0;
        while off < self.size {
            let n = (self.size - off).min(FILL_BLOCK) as usize;
            self.fill.fill_at(&mut pattern[..n], off);
            if let Err(e) = file.write_at(addr + off, &pattern[..n]).await {
                file.free(addr, self.size);
                return Err(e);
            }
            off += n as u64;
        }
        debug!(addr, size = self.size, "contiguous storage allocated");
        self.addr = Some(addr);
        Ok(addr)
    }

    fn check(&self, off: u64, len: u64) -> Result<()> {
        if off + len > self.size {
            return Err(StorageError::InvalidSelection(format!(
                "range {off}+{len} runs past {}-byte contiguous storage",
                self.size
            )));
        }
        Ok(())
    }

    pub(crate) async fn readvv(
        &mut self,
        file: &StorageFile,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &mut [u8],
    ) -> Result<u64> {
        let pieces = pair_vv(dset, mem);
        let mut total = 0;
        for p in &pieces {
            self.check(p.dset_off, p.len)?;
            let dst = checked_mem_range(buf, p.mem_off, p.len)?;
            match self.addr {
                None => self.fill.fill_at(dst, p.dset_off),
                Some(addr) => {
                    let limit = addr + self.size;
                    self.sieve.read(file, limit, addr + p.dset_off, dst).await?;
                }
            }
            total += p.len;
        }
        Ok(total)
    }

    pub(crate) async fn writevv(
        &mut self,
        file: &StorageFile,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &[u8],
    ) -> Result<u64> {
        let pieces = pair_vv(dset, mem);
        let addr = self.allocate(file).await?;
        let mut total = 0;
        for p in &pieces {
            self.check(p.dset_off, p.len)?;
            let src = checked_src_range(buf, p.mem_off, p.len)?;
            self.sieve.write(file, addr + p.dset_off, src).await?;
            total += p.len;
        }
        Ok(total)
    }

    pub(crate) async fn flush(&mut self, file: &StorageFile) -> Result<()> {
        self.sieve.flush(file).await
    }

    /// Make the file authoritative before a transfer that bypasses the sieve.
    pub(crate) async fn prepare_direct(&mut self, file: &StorageFile, op: IoOp) -> Result<()> {
        self.sieve.flush(file).await?;
        if op == IoOp::Write {
            self.sieve.invalidate();
        }
        Ok(())
    }
}
