use std::path::PathBuf;
use std::sync::Arc;

use arraystore::{
    Dataset, DatasetCreate, DatasetDescriptor, Datatype, Dataspace, EngineConfig, Filter,
    FilterPipeline, LocalFile, StorageFile, XferConfig,
};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "arraystore", version, about = "arraystore raw-data CLI")]
struct Cli {
    /// Engine configuration (YAML). Defaults apply when omitted.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a chunked 2-D dataset and save its descriptor next to the file.
    Demo(DemoArgs),
    /// Open a dataset from its descriptor and dump its persisted chunk index.
    InspectIndex(InspectArgs),
}

#[derive(Args)]
struct DemoArgs {
    /// Backing file to create or extend.
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Rows and columns.
    #[arg(long, num_args = 2, default_values_t = [64, 64])]
    dims: Vec<u64>,

    /// Chunk rows and columns.
    #[arg(long, num_args = 2, default_values_t = [16, 16])]
    chunk: Vec<u64>,

    /// Deflate level; 0 stores chunks unfiltered.
    #[arg(long, default_value_t = 0)]
    deflate: u32,
}

#[derive(Args)]
struct InspectArgs {
    /// Backing file.
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Descriptor written by `demo`. Defaults to FILE with a `.yaml` suffix.
    #[arg(long, value_name = "YAML")]
    descriptor: Option<PathBuf>,
}

fn descriptor_path(file: &std::path::Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(".yaml");
    PathBuf::from(name)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "arraystore=info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    match cli.cmd {
        Command::Demo(args) => demo_cmd(args, config).await?,
        Command::InspectIndex(args) => inspect_cmd(args, config).await?,
    }

    Ok(())
}

async fn demo_cmd(args: DemoArgs, config: EngineConfig) -> anyhow::Result<()> {
    let raw = LocalFile::create(&args.file).await?;
    let file = Arc::new(StorageFile::open(Arc::new(raw), config).await?);

    let mut filters = FilterPipeline::new();
    if args.deflate > 0 {
        filters = filters.with(Filter::Deflate {
            level: args.deflate,
        });
    }
    let req = DatasetCreate::new(Datatype::i32(), &args.dims)
        .chunked(&args.chunk)
        .filters(filters);
    let ds = Dataset::create(&file, req).await?;

    let space = Dataspace::new(&args.dims);
    let data: Vec<u8> = (0..space.extent_nelmts() as i32)
        .flat_map(i32::to_le_bytes)
        .collect();
    ds.write(&data, &Datatype::i32(), &space, None, &XferConfig::default())
        .await?;
    if let Some(stats) = ds.cache_stats().await {
        println!("cache: {}", serde_yaml::to_string(&stats)?.trim_end());
    }
    let desc = ds.close().await?;
    file.sync().await?;

    let yaml = desc.to_yaml()?;
    let out = descriptor_path(&args.file);
    std::fs::write(&out, &yaml)?;
    print!("{yaml}");
    println!("descriptor saved to {}", out.display());
    Ok(())
}

async fn inspect_cmd(args: InspectArgs, config: EngineConfig) -> anyhow::Result<()> {
    let yaml_path = args
        .descriptor
        .unwrap_or_else(|| descriptor_path(&args.file));
    let desc = DatasetDescriptor::from_yaml(&std::fs::read_to_string(&yaml_path)?)?;
    let raw = LocalFile::open(&args.file).await?;
    let file = Arc::new(StorageFile::open(Arc::new(raw), config).await?);
    let ds = Dataset::open(&file, &desc).await?;

    println!("layout:     {:?}", desc.layout.kind());
    println!("dims:       {:?}", desc.dims);
    println!("storage:    {} bytes", ds.get_storage_size().await);
    println!("allocation: {:?}", ds.get_allocation_status().await);
    for record in ds.chunk_records().await {
        println!(
            "  chunk {:?} at {} ({} bytes, mask {:#x})",
            record.offset, record.addr, record.nbytes, record.filter_mask
        );
    }
    ds.close().await?;
    Ok(())
}
