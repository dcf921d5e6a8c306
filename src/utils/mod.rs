pub(crate) mod gaps;
pub(crate) mod num;

pub(crate) use gaps::*;
pub(crate) use num::*;
