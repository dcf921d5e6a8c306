use super::fill::{AllocTime, FillValue};
use crate::config::ConfigError;
use crate::error::Result;
use crate::filter::FilterPipeline;
use crate::layout::{ExternalEntry, LayoutDescriptor};
use crate::types::Datatype;
use serde::{Deserialize, Serialize};

/// Everything the metadata layer persists about a dataset's raw data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Address of the dataset's object header; also its identity in the file.
    pub addr: u64,
    pub dtype: Datatype,
    pub dims: Vec<u64>,
    pub maxdims: Vec<Option<u64>>,
    pub layout: LayoutDescriptor,
    #[serde(default)]
    pub fill: FillValue,
    #[serde(default)]
    pub filters: FilterPipeline,
    #[serde(default)]
    pub alloc_time: AllocTime,
}

impl DatasetDescriptor {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }
}

/// Creation request for a new dataset.
///
/// ```ignore
/// let req = DatasetCreate::new(Datatype::f32(), &[100, 100])
///     .maxdims(&[None, Some(100)])
///     .chunked(&[10, 10])
///     .filters(FilterPipeline::new().with(Filter::Deflate { level: 6 }));
/// ```
#[derive(Debug, Clone)]
pub struct DatasetCreate {
    pub(crate) dtype: Datatype,
    pub(crate) dims: Vec<u64>,
    pub(crate) maxdims: Option<Vec<Option<u64>>>,
    pub(crate) layout: LayoutDescriptor,
    pub(crate) fill: FillValue,
    pub(crate) filters: FilterPipeline,
    pub(crate) alloc_time: AllocTime,
}

impl DatasetCreate {
    /// Fixed-size, contiguous, zero-filled, allocated on first write.
    pub fn new(dtype: Datatype, dims: &[u64]) -> Self {
        Self {
            dtype,
            dims: dims.to_vec(),
            maxdims: None,
            layout: LayoutDescriptor::Contiguous {
                addr: None,
                size: 0,
            },
            fill: FillValue::zero(),
            filters: FilterPipeline::new(),
            alloc_time: AllocTime::Late,
        }
    }

    pub fn maxdims(self, maxdims: &[Option<u64>]) -> Self {
        Self {
            maxdims: Some(maxdims.to_vec()),
            ..self
        }
    }

    pub fn chunked(self, chunk_dims: &[u64]) -> Self {
        Self {
            layout: LayoutDescriptor::Chunked {
                chunk_dims: chunk_dims.to_vec(),
                index: None,
            },
            ..self
        }
    }

    pub fn compact(self) -> Self {
        Self {
            layout: LayoutDescriptor::Compact { data: Vec::new() },
            ..self
        }
    }

    pub fn external(self, entries: Vec<ExternalEntry>) -> Self {
        Self {
            layout: LayoutDescriptor::External { entries },
            ..self
        }
    }

    pub fn fill(self, fill: FillValue) -> Self {
        Self { fill, ..self }
    }

    pub fn filters(self, filters: FilterPipeline) -> Self {
        Self { filters, ..self }
    }

    pub fn alloc_time(self, alloc_time: AllocTime) -> Self {
        Self { alloc_time, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::layout::LayoutKind;

    #[test]
    fn test_builder_defaults() {
        let req = DatasetCreate::new(Datatype::i32(), &[4]);
        assert_eq!(req.layout.kind(), LayoutKind::Contiguous);
        assert_eq!(req.alloc_time, AllocTime::Late);
        assert!(req.fill.is_zero());

        let req = req.chunked(&[2]).alloc_time(AllocTime::Early);
        assert_eq!(req.layout.kind(), LayoutKind::Chunked);
        assert_eq!(req.alloc_time, AllocTime::Early);
    }

    #[test]
    fn test_descriptor_yaml() {
        let desc = DatasetDescriptor {
            addr: 64,
            dtype: Datatype::u16().be(),
            dims: vec![10, 20],
            maxdims: vec![None, Some(20)],
            layout: LayoutDescriptor::Chunked {
                chunk_dims: vec![5, 5],
                index: None,
            },
            fill: FillValue::new(vec![0xFF, 0xFF]),
            filters: FilterPipeline::new().with(Filter::Fletcher32),
            alloc_time: AllocTime::Late,
        };
        let yaml = desc.to_yaml().unwrap();
        assert!(yaml.contains("kind: chunked"));
        assert_eq!(DatasetDescriptor::from_yaml(&yaml).unwrap(), desc);
        assert!(DatasetDescriptor::from_yaml("addr: [").is_err());
    }
}
