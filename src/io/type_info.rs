//! Type-conversion context: computed once per transfer.

use super::IoOp;
use crate::config::XferConfig;
use crate::error::{Result, StorageError};
use crate::types::{ConvPath, Datatype};

pub(crate) struct TypeInfo {
    pub path: ConvPath,
    pub src_size: usize,
    pub dst_size: usize,
    /// Larger of the two element sizes; sizes the scratch buffers.
    pub max_type_size: usize,
    pub is_conv_noop: bool,
    pub need_bkg: bool,
    /// Strip-mine element count.
    pub request_nelmts: usize,
    tconv: Vec<u8>,
    bkg: Vec<u8>,
}

impl TypeInfo {
    /// Reads convert file to memory, writes memory to file.
    pub(crate) fn new(
        mem_type: &Datatype,
        file_type: &Datatype,
        op: IoOp,
        xfer: &XferConfig,
    ) -> Result<Self> {
        let (src_type, dst_type) = match op {
            IoOp::Read => (file_type.clone(), mem_type.clone()),
            IoOp::Write => (mem_type.clone(), file_type.clone()),
        };
        let path = ConvPath::find(&src_type, &dst_type)?;
        let src_size = src_type.size();
        let dst_size = dst_type.size();
        let max_type_size = src_size.max(dst_size);
        let is_conv_noop = path.is_noop();
        let need_bkg = path.need_bkg();

        let request_nelmts = xfer.tconv_buf_size / max_type_size;
        if !is_conv_noop && request_nelmts == 0 {
            return Err(StorageError::invalid(format!(
                "type conversion buffer of {} bytes cannot hold one {max_type_size}-byte element",
                xfer.tconv_buf_size
            )));
        }

        Ok(Self {
            path,
            src_size,
            dst_size,
            max_type_size,
            is_conv_noop,
            need_bkg,
            request_nelmts,
            tconv: Vec::new(),
            bkg: Vec::new(),
        })
    }

    /// Scratch and background buffers, allocated on first use and sized for
    /// at most `nelmts` elements of one strip.
    pub(crate) fn buffers(&mut self, nelmts: u64) -> Result<(&mut [u8], &mut [u8])> {
        let strip = (self.request_nelmts as u64).min(nelmts.max(1)) as usize;
        grow(&mut self.tconv, strip * self.max_type_size)?;
        if self.need_bkg {
            grow(&mut self.bkg, strip * self.dst_size)?;
        }
        Ok((&mut self.tconv[..], &mut self.bkg[..]))
    }
}

fn grow(buf: &mut Vec<u8>, len: usize) -> Result<()> {
    if buf.len() >= len {
        return Ok(());
    }
    buf.try_reserve_exact(len - buf.len())
        .map_err(|_| StorageError::Alloc { bytes: len })?;
    buf.resize(len, 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_context() {
        let ti = TypeInfo::new(
            &Datatype::i32(),
            &Datatype::i32(),
            IoOp::Read,
            &XferConfig::default(),
        )
        .unwrap();
        assert!(ti.is_conv_noop);
        assert!(!ti.need_bkg);
        assert_eq!(ti.max_type_size, 4);
    }

    #[test]
    fn test_strip_size_from_buffer() {
        let xfer = XferConfig::default().tconv_buf_size(64);
        let mut ti =
            TypeInfo::new(&Datatype::i16(), &Datatype::f64(), IoOp::Write, &xfer).unwrap();
        assert_eq!(ti.src_size, 2);
        assert_eq!(ti.dst_size, 8);
        assert_eq!(ti.request_nelmts, 8);

        let (tconv, bkg) = ti.buffers(3).unwrap();
        assert_eq!(tconv.len(), 24);
        assert!(bkg.is_empty());
    }

    #[test]
    fn test_buffer_too_small() {
        let xfer = XferConfig::default().tconv_buf_size(4);
        let err = TypeInfo::new(&Datatype::i32(), &Datatype::f64(), IoOp::Read, &xfer);
        assert!(matches!(err, Err(StorageError::InvalidArgument(_))));

        // A no-op conversion never touches the buffer.
        assert!(TypeInfo::new(&Datatype::f64(), &Datatype::f64(), IoOp::Read, &xfer).is_ok());
    }
}
