//! Conversion paths between datatypes.
//!
//! Conversion happens in place: the buffer holds `nelmts` packed source
//! elements on entry and `nelmts` packed destination elements on return, so it
//! must be sized for the larger of the two.

use super::{ByteOrder, Datatype};
use crate::error::{Result, StorageError};

#[derive(Debug, Clone, PartialEq)]
pub enum ConvPath {
    /// Identical types.
    Noop,
    /// Same type in the opposite byte order.
    Swap { size: usize },
    /// Any other atomic-to-atomic conversion, clamping on overflow.
    Numeric { src: Datatype, dst: Datatype },
    Compound(CompoundPlan),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompoundPlan {
    members: Vec<MemberConv>,
    need_bkg: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct MemberConv {
    src_offset: usize,
    src_size: usize,
    dst_offset: usize,
    dst_size: usize,
    path: ConvPath,
}

#[derive(Debug, Clone, Copy)]
enum Value {
    Int(i128),
    Float(f64),
}

impl ConvPath {
    pub fn find(src: &Datatype, dst: &Datatype) -> Result<Self> {
        if src == dst {
            return Ok(ConvPath::Noop);
        }
        match (src, dst) {
            (
                Datatype::Integer {
                    size: a,
                    signed: sa,
                    ..
                },
                Datatype::Integer {
                    size: b,
                    signed: sb,
                    ..
                },
            ) if a == b && sa == sb => Ok(ConvPath::Swap { size: *a }),
            (Datatype::Float { size: a, .. }, Datatype::Float { size: b, .. }) if a == b => {
                Ok(ConvPath::Swap { size: *a })
            }
            (
                Datatype::Compound {
                    members: src_members,
                    ..
                },
                Datatype::Compound {
                    members: dst_members,
                    ..
                },
            ) => {
                let mut members = Vec::with_capacity(dst_members.len());
                let mut need_bkg = false;
                for dm in dst_members {
                    match src_members.iter().find(|sm| sm.name == dm.name) {
                        Some(sm) => {
                            let path = ConvPath::find(&sm.dtype, &dm.dtype)?;
                            need_bkg |= path.need_bkg();
                            members.push(MemberConv {
                                src_offset: sm.offset,
                                src_size: sm.dtype.size(),
                                dst_offset: dm.offset,
                                dst_size: dm.dtype.size(),
                                path,
                            });
                        }
                        None => need_bkg = true,
                    }
                }
                Ok(ConvPath::Compound(CompoundPlan { members, need_bkg }))
            }
            (s, d) if s.is_atomic() && d.is_atomic() => Ok(ConvPath::Numeric {
                src: s.clone(),
                dst: d.clone(),
            }),
            _ => Err(StorageError::Conversion(
                "no conversion path between atomic and compound types".to_string(),
            )),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, ConvPath::Noop)
    }

    /// Whether destination contents must be supplied so that parts of the
    /// destination element the source does not cover survive conversion.
    pub fn need_bkg(&self) -> bool {
        match self {
            ConvPath::Compound(plan) => plan.need_bkg,
            _ => false,
        }
    }

    /// Convert `nelmts` elements in place. `bkg`, when given, holds `nelmts`
    /// packed destination elements.
    pub fn convert(
        &self,
        nelmts: usize,
        src_size: usize,
        dst_size: usize,
        buf: &mut [u8],
        bkg: Option<&[u8]>,
    ) -> Result<()> {
        let needed = nelmts * src_size.max(dst_size);
        if buf.len() < needed {
            return Err(StorageError::Conversion(format!(
                "conversion buffer holds {} bytes, {needed} required",
                buf.len()
            )));
        }
        match self {
            ConvPath::Noop => Ok(()),
            ConvPath::Swap { size } => {
                buf[..nelmts * size]
                    .chunks_exact_mut(*size)
                    .for_each(|e| e.reverse());
                Ok(())
            }
            _ => {
                let mut src = vec![0u8; src_size];
                let mut dst = vec![0u8; dst_size];
                // Growing elements are converted back to front so that no
                // unconverted source element is overwritten.
                let order: Box<dyn Iterator<Item = usize>> = if dst_size > src_size {
                    Box::new((0..nelmts).rev())
                } else {
                    Box::new(0..nelmts)
                };
                for i in order {
                    src.copy_from_slice(&buf[i * src_size..(i + 1) * src_size]);
                    let bkg_elem = bkg.map(|b| &b[i * dst_size..(i + 1) * dst_size]);
                    self.convert_one(&src, &mut dst, bkg_elem)?;
                    buf[i * dst_size..(i + 1) * dst_size].copy_from_slice(&dst);
                }
                Ok(())
            }
        }
    }

    fn convert_one(&self, src: &[u8], dst: &mut [u8], bkg: Option<&[u8]>) -> Result<()> {
        match self {
            ConvPath::Noop => dst.copy_from_slice(src),
            ConvPath::Swap { .. } => {
                dst.copy_from_slice(src);
                dst.reverse();
            }
            ConvPath::Numeric { src: st, dst: dt } => write_value(dt, read_value(st, src), dst),
            ConvPath::Compound(plan) => {
                match bkg {
                    Some(b) => dst.copy_from_slice(b),
                    None => dst.fill(0),
                }
                for m in &plan.members {
                    let sub_bkg = bkg.map(|b| &b[m.dst_offset..m.dst_offset + m.dst_size]);
                    m.path.convert_one(
                        &src[m.src_offset..m.src_offset + m.src_size],
                        &mut dst[m.dst_offset..m.dst_offset + m.dst_size],
                        sub_bkg,
                    )?;
                }
            }
        }
        Ok(())
    }
}

fn read_value(t: &Datatype, bytes: &[u8]) -> Value {
    let mut le = [0u8; 8];
    let size = bytes.len().min(8);
    le[..size].copy_from_slice(&bytes[..size]);
    match t {
        Datatype::Integer { order, signed, .. } => {
            if *order == ByteOrder::Big {
                le[..size].reverse();
            }
            let raw = u64::from_le_bytes(le);
            if *signed {
                let shift = 64 - size * 8;
                Value::Int(((raw << shift) as i64 >> shift) as i128)
            } else {
                Value::Int(raw as i128)
            }
        }
        Datatype::Float { order, .. } => {
            if *order == ByteOrder::Big {
                le[..size].reverse();
            }
            if size == 4 {
                Value::Float(f32::from_le_bytes([le[0], le[1], le[2], le[3]]) as f64)
            } else {
                Value::Float(f64::from_le_bytes(le))
            }
        }
        Datatype::Compound { .. } => Value::Int(0),
    }
}

fn int_range(size: usize, signed: bool) -> (i128, i128) {
    let bits = (size * 8) as u32;
    if signed {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    }
}

fn write_value(t: &Datatype, v: Value, out: &mut [u8]) {
    match t {
        Datatype::Integer {
            size,
            signed,
            order,
        } => {
            let (min, max) = int_range(*size, *signed);
            let iv = match v {
                Value::Int(i) => i.clamp(min, max),
                Value::Float(f) if f.is_nan() => 0,
                Value::Float(f) => (f as i128).clamp(min, max),
            };
            out.copy_from_slice(&(iv as u64).to_le_bytes()[..*size]);
            if *order == ByteOrder::Big {
                out.reverse();
            }
        }
        Datatype::Float { size, order } => {
            let fv = match v {
                Value::Int(i) => i as f64,
                Value::Float(f) => f,
            };
            if *size == 4 {
                out.copy_from_slice(&(fv as f32).to_le_bytes());
            } else {
                out.copy_from_slice(&fv.to_le_bytes());
            }
            if *order == ByteOrder::Big {
                out.reverse();
            }
        }
        Datatype::Compound { .. } => out.fill(0),
    }
}
