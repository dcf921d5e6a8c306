//! Scatter/gather between a layout and a user buffer.
//!
//! With a no-op conversion the two span walks are fed straight into the
//! layout's vectored calls in batches of at most `vector_size` sequences.
//! Otherwise the selection is strip-mined `request_nelmts` elements at a time
//! through the conversion buffer.

use super::seq::{SeqFeed, SeqList, gather_mem, scatter_mem};
use super::IoInfo;
use crate::error::{Result, StorageError};
use crate::file::StorageFile;
use crate::layout::Layout;
use crate::layout::chunk::ChunkInfo;
use crate::utils::NumCastExt;
use tracing::trace;

fn diverged() -> StorageError {
    StorageError::InvalidSelection("file and memory selections diverged".to_string())
}

async fn drive_read(
    layout: &mut Layout,
    file: &StorageFile,
    chunk: Option<&ChunkInfo>,
    dset: &mut SeqList,
    mem: &mut SeqList,
    buf: &mut [u8],
) -> Result<()> {
    while !dset.is_empty() && !mem.is_empty() {
        let n = layout.readvv(file, chunk, dset, mem, buf).await?;
        if n == 0 {
            return Err(StorageError::Io(anyhow::anyhow!(
                "vectored read made no progress"
            )));
        }
    }
    if dset.is_empty() != mem.is_empty() {
        return Err(diverged());
    }
    Ok(())
}

async fn drive_write(
    layout: &mut Layout,
    file: &StorageFile,
    chunk: Option<&ChunkInfo>,
    dset: &mut SeqList,
    mem: &mut SeqList,
    buf: &[u8],
) -> Result<()> {
    while !dset.is_empty() && !mem.is_empty() {
        let n = layout.writevv(file, chunk, dset, mem, buf).await?;
        if n == 0 {
            return Err(StorageError::Io(anyhow::anyhow!(
                "vectored write made no progress"
            )));
        }
    }
    if dset.is_empty() != mem.is_empty() {
        return Err(diverged());
    }
    Ok(())
}

/// Transfer `nelmts` selected elements from the layout into `buf`.
///
/// `file_spans` are element spans in the layout's address space (the whole
/// dataset, or one chunk); `mem_spans` are element spans of `buf`.
pub(crate) async fn read<I, J>(
    layout: &mut Layout,
    io: &mut IoInfo<'_>,
    chunk: Option<&ChunkInfo>,
    file_spans: I,
    mem_spans: J,
    nelmts: u64,
    buf: &mut [u8],
) -> Result<()>
where
    I: Iterator<Item = (u64, u64)>,
    J: Iterator<Item = (u64, u64)>,
{
    let file = io.file;
    let vector_size = io.xfer.vector_size.max(1);
    let ti = &mut io.type_info;
    let mut dfeed = SeqFeed::new(file_spans, ti.src_size);
    let mut mfeed = SeqFeed::new(mem_spans, ti.dst_size);

    if ti.is_conv_noop {
        let mut dset = SeqList::default();
        let mut mem = SeqList::default();
        loop {
            if dset.is_empty() {
                dfeed.fill(&mut dset, vector_size, u64::MAX);
            }
            if mem.is_empty() {
                mfeed.fill(&mut mem, vector_size, u64::MAX);
            }
            match (dset.is_empty(), mem.is_empty()) {
                (true, true) => return Ok(()),
                (false, false) => {}
                _ => return Err(diverged()),
            }
            let n = layout.readvv(file, chunk, &mut dset, &mut mem, buf).await?;
            if n == 0 {
                return Err(StorageError::Io(anyhow::anyhow!(
                    "vectored read made no progress"
                )));
            }
        }
    }

    let (src_size, dst_size) = (ti.src_size as u64, ti.dst_size as u64);
    let need_bkg = ti.need_bkg;
    let mut remaining = nelmts;
    while remaining > 0 {
        let n = remaining.min(ti.request_nelmts as u64);
        trace!(n, remaining, "read strip");
        let path = ti.path.clone();
        let (tconv, bkg) = ti.buffers(nelmts)?;

        // gather file -> tconv
        let want = n * src_size;
        let mut got = 0;
        while got < want {
            let mut dset = SeqList::default();
            let added = dfeed.fill(&mut dset, vector_size, want - got);
            if added == 0 {
                return Err(diverged());
            }
            let mut into = SeqList::single(got, added);
            drive_read(layout, file, chunk, &mut dset, &mut into, tconv).await?;
            got += added;
        }

        let mut mem = SeqList::default();
        if mfeed.fill(&mut mem, usize::MAX, n * dst_size) != n * dst_size {
            return Err(diverged());
        }
        let bkg_len = (n * dst_size).as_usize();
        if need_bkg {
            gather_mem(buf, &mem, &mut bkg[..bkg_len])?;
        }
        let bkg = need_bkg.then(|| &bkg[..bkg_len]);
        path.convert(n.as_usize(), src_size.as_usize(), dst_size.as_usize(), tconv, bkg)?;
        scatter_mem(&tconv[..(n * dst_size).as_usize()], &mem, buf)?;
        remaining -= n;
    }
    Ok(())
}

/// Transfer `nelmts` selected elements from `buf` into the layout.
pub(crate) async fn write<I, J>(
    layout: &mut Layout,
    io: &mut IoInfo<'_>,
    chunk: Option<&ChunkInfo>,
    file_spans: I,
    mem_spans: J,
    nelmts: u64,
    buf: &[u8],
) -> Result<()>
where
    I: Iterator<Item = (u64, u64)>,
    J: Iterator<Item = (u64, u64)>,
{
    let file = io.file;
    let vector_size = io.xfer.vector_size.max(1);
    let ti = &mut io.type_info;
    let mut dfeed = SeqFeed::new(file_spans, ti.dst_size);
    let mut mfeed = SeqFeed::new(mem_spans, ti.src_size);

    if ti.is_conv_noop {
        let mut dset = SeqList::default();
        let mut mem = SeqList::default();
        loop {
            if dset.is_empty() {
                dfeed.fill(&mut dset, vector_size, u64::MAX);
            }
            if mem.is_empty() {
                mfeed.fill(&mut mem, vector_size, u64::MAX);
            }
            match (dset.is_empty(), mem.is_empty()) {
                (true, true) => return Ok(()),
                (false, false) => {}
                _ => return Err(diverged()),
            }
            let n = layout.writevv(file, chunk, &mut dset, &mut mem, buf).await?;
            if n == 0 {
                return Err(StorageError::Io(anyhow::anyhow!(
                    "vectored write made no progress"
                )));
            }
        }
    }

    let (src_size, dst_size) = (ti.src_size as u64, ti.dst_size as u64);
    let need_bkg = ti.need_bkg;
    let mut remaining = nelmts;
    while remaining > 0 {
        let n = remaining.min(ti.request_nelmts as u64);
        trace!(n, remaining, "write strip");
        let path = ti.path.clone();
        let (tconv, bkg) = ti.buffers(nelmts)?;

        let mut mem = SeqList::default();
        if mfeed.fill(&mut mem, usize::MAX, n * src_size) != n * src_size {
            return Err(diverged());
        }
        gather_mem(buf, &mem, &mut tconv[..(n * src_size).as_usize()])?;

        let mut dset = SeqList::default();
        if dfeed.fill(&mut dset, usize::MAX, n * dst_size) != n * dst_size {
            return Err(diverged());
        }
        let bkg_len = (n * dst_size).as_usize();
        if need_bkg {
            let mut from = dset.clone();
            let mut into = SeqList::single(0, n * dst_size);
            drive_read(layout, file, chunk, &mut from, &mut into, &mut bkg[..bkg_len]).await?;
        }
        let bkg = need_bkg.then(|| &bkg[..bkg_len]);
        path.convert(n.as_usize(), src_size.as_usize(), dst_size.as_usize(), tconv, bkg)?;

        let mut from = SeqList::single(0, n * dst_size);
        drive_write(layout, file, chunk, &mut dset, &mut from, tconv).await?;
        remaining -= n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, XferConfig};
    use crate::dataset::FillValue;
    use crate::file::MemFile;
    use crate::filter::FilterPipeline;
    use crate::io::{IoOp, TypeInfo};
    use crate::layout::LayoutDescriptor;
    use crate::space::{Dataspace, Hyperslab};
    use crate::types::Datatype;
    use std::sync::Arc;

    fn u16s(b: &[u8]) -> Vec<u16> {
        b.chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[tokio::test]
    async fn test_strip_mined_conversion_over_strided_selection() {
        let file = StorageFile::open(Arc::new(MemFile::new()), EngineConfig::default())
            .await
            .unwrap();
        let mut layout = Layout::create(
            &file,
            &LayoutDescriptor::Compact { data: vec![] },
            2,
            &[8],
            &FillValue::zero(),
            &FilterPipeline::new(),
        )
        .unwrap();
        // two elements per strip, one sequence per vectored call
        let xfer = XferConfig::default().tconv_buf_size(8).vector_size(1);
        let mut fs = Dataspace::new(&[8]);
        fs.select_hyperslab(Hyperslab {
            start: vec![1],
            stride: vec![2],
            count: vec![4],
            block: vec![1],
        })
        .unwrap();
        let ms = Dataspace::new(&[4]);
        let src: Vec<u8> = [10i32, 20, 70000, -5]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();

        let mut io = IoInfo {
            file: &file,
            xfer: &xfer,
            op: IoOp::Write,
            type_info: TypeInfo::new(&Datatype::i32(), &Datatype::u16(), IoOp::Write, &xfer)
                .unwrap(),
            file_space: &fs,
            mem_space: &ms,
            nelmts: 4,
        };
        write(&mut layout, &mut io, None, fs.spans(), ms.spans(), 4, &src)
            .await
            .unwrap();

        let all = Dataspace::new(&[8]);
        let mut back = vec![0u8; 16];
        let mut io = IoInfo {
            file: &file,
            xfer: &xfer,
            op: IoOp::Read,
            type_info: TypeInfo::new(&Datatype::u16(), &Datatype::u16(), IoOp::Read, &xfer)
                .unwrap(),
            file_space: &all,
            mem_space: &all,
            nelmts: 8,
        };
        read(&mut layout, &mut io, None, all.spans(), all.spans(), 8, &mut back)
            .await
            .unwrap();
        assert_eq!(u16s(&back), vec![0, 10, 0, 20, 0, 65535, 0, 0]);

        let mut picked = vec![0u8; 8];
        read(&mut layout, &mut io, None, fs.spans(), ms.spans(), 4, &mut picked)
            .await
            .unwrap();
        assert_eq!(u16s(&picked), vec![10, 20, 65535, 0]);
    }

    #[tokio::test]
    async fn test_short_memory_selection_diverges() {
        let file = StorageFile::open(Arc::new(MemFile::new()), EngineConfig::default())
            .await
            .unwrap();
        let mut layout = Layout::create(
            &file,
            &LayoutDescriptor::Compact { data: vec![] },
            1,
            &[4],
            &FillValue::zero(),
            &FilterPipeline::new(),
        )
        .unwrap();
        let xfer = XferConfig::default();
        let fs = Dataspace::new(&[4]);
        let ms = Dataspace::new(&[3]);
        let mut io = IoInfo {
            file: &file,
            xfer: &xfer,
            op: IoOp::Write,
            type_info: TypeInfo::new(&Datatype::u8(), &Datatype::u8(), IoOp::Write, &xfer)
                .unwrap(),
            file_space: &fs,
            mem_space: &ms,
            nelmts: 4,
        };
        let err = write(&mut layout, &mut io, None, fs.spans(), ms.spans(), 4, &[1, 2, 3])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidSelection(_)));
    }
}
