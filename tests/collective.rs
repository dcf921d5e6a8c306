//! Collective transfers across an in-process group of ranks. Each rank opens
//! the dataset through its own `StorageFile` over one shared backing file,
//! the way separate processes would.

use std::sync::Arc;

use arraystore::{
    AllocTime, Dataset, DatasetCreate, DatasetDescriptor, Dataspace, Datatype, EngineConfig,
    Hyperslab, LocalComm, LocalGroup, MemFile, StorageFile, TransferStrategy, XferConfig,
};

/// Creates a 4x4 i32 dataset with every byte of storage allocated up front.
async fn prepare(raw: &Arc<MemFile>, req: DatasetCreate) -> DatasetDescriptor {
    let file = Arc::new(
        StorageFile::open(raw.clone(), EngineConfig::default())
            .await
            .unwrap(),
    );
    let ds = Dataset::create(&file, req.alloc_time(AllocTime::Early))
        .await
        .unwrap();
    ds.close().await.unwrap()
}

/// Rank `r` writes rows `2r..2r+2` with values `100 * r + column`, using
/// `mem_type` for its buffer. Returns whether the written chunk stayed cached,
/// which only happens on the independent path.
async fn rank_writes_rows(
    raw: Arc<MemFile>,
    desc: DatasetDescriptor,
    comm: LocalComm,
    rank: u64,
    mem_type: Datatype,
) -> bool {
    let file = Arc::new(StorageFile::open(raw, EngineConfig::default()).await.unwrap());
    let ds = Dataset::open(&file, &desc).await.unwrap();
    let mut fs = ds.space().await;
    fs.select_hyperslab(Hyperslab::block(&[2 * rank, 0], &[2, 4]))
        .unwrap();
    let ms = Dataspace::new(&[2, 4]);
    let values: Vec<i64> = (0..8).map(|i| 100 * rank as i64 + i % 4).collect();
    let buf: Vec<u8> = if mem_type == Datatype::i64() {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    } else {
        values.iter().flat_map(|&v| (v as i32).to_le_bytes()).collect()
    };
    let xfer = XferConfig::default().strategy(TransferStrategy::collective(comm));
    ds.write(&buf, &mem_type, &ms, Some(&fs), &xfer)
        .await
        .unwrap();
    let cached = ds.is_chunk_cached(&[2 * rank, 0]).await;
    ds.close().await.unwrap();
    cached
}

async fn read_all(raw: &Arc<MemFile>, desc: &DatasetDescriptor) -> Vec<i32> {
    let file = Arc::new(
        StorageFile::open(raw.clone(), EngineConfig::default())
            .await
            .unwrap(),
    );
    let ds = Dataset::open(&file, desc).await.unwrap();
    let mut buf = vec![0u8; 64];
    ds.read(&mut buf, &Datatype::i32(), &Dataspace::new(&[4, 4]), None, &XferConfig::default())
        .await
        .unwrap();
    ds.close().await.unwrap();
    buf.chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn expected_rows() -> Vec<i32> {
    (0..16).map(|i| 100 * (i / 8) + i % 4).collect()
}

async fn run_two_ranks(
    raw: &Arc<MemFile>,
    desc: &DatasetDescriptor,
    rank1_type: Datatype,
) -> (bool, bool) {
    let comms = LocalGroup::ranks(2);
    let r0 = tokio::spawn(rank_writes_rows(
        raw.clone(),
        desc.clone(),
        comms[0].clone(),
        0,
        Datatype::i32(),
    ));
    let r1 = tokio::spawn(rank_writes_rows(
        raw.clone(),
        desc.clone(),
        comms[1].clone(),
        1,
        rank1_type,
    ));
    (r0.await.unwrap(), r1.await.unwrap())
}

#[tokio::test]
async fn test_one_ineligible_rank_sends_everyone_independent() {
    let raw = Arc::new(MemFile::new());
    let desc = prepare(&raw, DatasetCreate::new(Datatype::i32(), &[4, 4]).chunked(&[2, 4])).await;

    // Rank 1 needs i64 -> i32 conversion and votes against.
    let (cached0, cached1) = run_two_ranks(&raw, &desc, Datatype::i64()).await;
    assert!(cached0, "rank 0 should have gone through the chunk cache");
    assert!(cached1);
    assert_eq!(read_all(&raw, &desc).await, expected_rows());
}

#[tokio::test]
async fn test_collective_chunked_write_bypasses_cache() {
    let raw = Arc::new(MemFile::new());
    let desc = prepare(&raw, DatasetCreate::new(Datatype::i32(), &[4, 4]).chunked(&[2, 4])).await;

    let (cached0, cached1) = run_two_ranks(&raw, &desc, Datatype::i32()).await;
    assert!(!cached0);
    assert!(!cached1);
    assert_eq!(read_all(&raw, &desc).await, expected_rows());
}

#[tokio::test]
async fn test_collective_contiguous_write() {
    let raw = Arc::new(MemFile::new());
    let desc = prepare(&raw, DatasetCreate::new(Datatype::i32(), &[4, 4])).await;

    run_two_ranks(&raw, &desc, Datatype::i32()).await;
    assert_eq!(read_all(&raw, &desc).await, expected_rows());
}

#[tokio::test]
async fn test_unallocated_storage_is_not_collective() {
    let raw = Arc::new(MemFile::new());
    let file = Arc::new(
        StorageFile::open(raw.clone(), EngineConfig::default())
            .await
            .unwrap(),
    );
    let ds = Dataset::create(&file, DatasetCreate::new(Datatype::i32(), &[4, 4]).chunked(&[2, 4]))
        .await
        .unwrap();
    let desc = ds.close().await.unwrap();

    // Late allocation: no chunk exists yet, so both ranks fall back.
    let (cached0, cached1) = run_two_ranks(&raw, &desc, Datatype::i32()).await;
    assert!(cached0);
    assert!(cached1);
}
