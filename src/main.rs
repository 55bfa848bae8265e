use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use curated_candle::convert::{
    AlbertEncoder, FromHf, LlamaDecoder, RefinedWebModelDecoder, RobertaEncoder,
};
use curated_candle::model::ModelOutput;
use curated_candle::Result;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Arch {
    Llama,
    RefinedWebModel,
    Roberta,
    Albert,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Precision {
    F32,
    F16,
    Bf16,
}

impl From<Precision> for DType {
    fn from(precision: Precision) -> Self {
        match precision {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "curated-candle")]
#[command(about = "Run a transformer checkpoint over a sequence of piece ids")]
struct Args {
    /// Checkpoint directory with config.json and SafeTensors weights
    #[arg(short, long)]
    checkpoint: PathBuf,

    /// Model architecture of the checkpoint
    #[arg(short, long, value_enum)]
    arch: Arch,

    /// Comma-separated piece ids
    #[arg(short, long, value_delimiter = ',', required = true)]
    ids: Vec<u32>,

    /// Parameter data type
    #[arg(long, value_enum, default_value = "f32")]
    dtype: Precision,

    /// Device to run on
    #[arg(long, value_enum, default_value = "cpu")]
    device: DeviceKind,
}

fn select_device(kind: DeviceKind) -> Result<Device> {
    let device = match kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => {
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(0)?
            }
            #[cfg(not(feature = "cuda"))]
            {
                warn!("CUDA requested but not compiled in; falling back to CPU");
                Device::Cpu
            }
        }
        DeviceKind::Metal => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)?
            }
            #[cfg(not(feature = "metal"))]
            {
                warn!("Metal requested but not compiled in; falling back to CPU");
                Device::Cpu
            }
        }
    };
    Ok(device)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let device = select_device(args.device)?;
    let dtype = DType::from(args.dtype);

    info!(checkpoint = %args.checkpoint.display(), arch = ?args.arch, "loading checkpoint");
    let input_ids = Tensor::new(args.ids.as_slice(), &device)?.unsqueeze(0)?;

    let output = match args.arch {
        Arch::Llama => {
            let decoder = LlamaDecoder::from_hf_dir(&args.checkpoint, dtype, &device)?;
            let output = decoder.forward(&input_ids, None, None, true)?;
            report_cache(output.cache_len());
            output.output
        }
        Arch::RefinedWebModel => {
            let decoder = RefinedWebModelDecoder::from_hf_dir(&args.checkpoint, dtype, &device)?;
            let output = decoder.forward(&input_ids, None, None, true)?;
            report_cache(output.cache_len());
            output.output
        }
        Arch::Roberta => {
            let encoder = RobertaEncoder::from_hf_dir(&args.checkpoint, dtype, &device)?;
            encoder.forward(&input_ids, None, None)?
        }
        Arch::Albert => {
            let encoder = AlbertEncoder::from_hf_dir(&args.checkpoint, dtype, &device)?;
            encoder.forward(&input_ids, None, None)?
        }
    };

    report(&output)
}

fn report_cache(cache_len: Option<usize>) {
    if let Some(cache_len) = cache_len {
        println!("Cached positions: {cache_len}");
    }
}

fn report(output: &ModelOutput) -> Result<()> {
    println!("Embedding output: {:?}", output.embedding_output.dims());
    println!("Layers: {}", output.layer_hidden_states.len());

    let last = output.last_hidden_layer_state();
    println!("Last hidden state: {:?}", last.dims());

    let norm: f32 = last
        .to_dtype(DType::F32)?
        .sqr()?
        .sum_all()?
        .sqrt()?
        .to_scalar()?;
    println!("Last hidden state norm: {norm:.4}");
    Ok(())
}
