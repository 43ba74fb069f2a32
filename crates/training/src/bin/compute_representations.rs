use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use clmbr_training::{
    checkpoint,
    representations::{
        ensure_batches, BatchRequest, CommandBatchBuilder, ExtractionOptions, JsonPatientDatabase,
        RepresentationExtractor,
    },
    select_device, Precision, TrainingError,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("representation extraction failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PrecisionArg {
    Fp32,
    Fp16,
    Bf16,
}

impl From<PrecisionArg> for Precision {
    fn from(value: PrecisionArg) -> Self {
        match value {
            PrecisionArg::Fp32 => Precision::Fp32,
            PrecisionArg::Fp16 => Precision::Fp16,
            PrecisionArg::Bf16 => Precision::Bf16,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Compute CLMBR representations for labeled prediction times", long_about = None)]
struct Args {
    /// Output JSON file.
    destination: PathBuf,

    #[arg(long, value_name = "DIR", help = "Run directory of a trained model")]
    model_dir: PathBuf,

    #[arg(
        long,
        value_name = "DIR",
        help = "Labeled-patient batch directory; built with the batch builder when missing"
    )]
    batches_path: PathBuf,

    #[arg(long, value_name = "PATH", help = "JSON patient table with birth dates")]
    patients: PathBuf,

    #[arg(long, value_name = "PATH", help = "Patient data extract passed to the batch builder")]
    data_path: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Labeled prediction times passed to the batch builder")]
    prediction_times_path: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Dictionary passed to the batch builder")]
    dictionary_path: Option<PathBuf>,

    #[arg(long, default_value = "clmbr_create_batches", help = "Batch builder program")]
    batch_builder: PathBuf,

    #[arg(long, default_value_t = BatchRequest::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    #[arg(long, value_enum, default_value = "fp16")]
    precision: PrecisionArg,

    #[arg(long, help = "Do not append the constant bias column")]
    no_bias_column: bool,

    #[arg(
        long,
        help = "Take representations straight from labeled slots instead of aligning labels"
    )]
    direct: bool,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let store = if args.batches_path.exists() {
        clmbr_training::DirectoryBatchStore::open(&args.batches_path)?
    } else {
        let run = checkpoint::load_config(&args.model_dir)?;
        let request = BatchRequest {
            destination: args.batches_path.clone(),
            data_path: required(args.data_path.clone(), "--data-path")?,
            labeled_patients_path: required(
                args.prediction_times_path.clone(),
                "--prediction-times-path",
            )?,
            dictionary_path: required(args.dictionary_path.clone(), "--dictionary-path")?,
            is_hierarchical: run.transformer.is_hierarchical,
            vocab_size: run.transformer.vocab_size,
            batch_size: args.batch_size,
            val_start: BatchRequest::DEFAULT_VAL_START,
        };
        ensure_batches(&CommandBatchBuilder::new(&args.batch_builder), &request)?
    };

    let patients = JsonPatientDatabase::open(&args.patients)?;
    let device = select_device();
    let extractor = RepresentationExtractor::load(
        &args.model_dir,
        &device,
        ExtractionOptions {
            precision: args.precision.into(),
            append_bias_column: !args.no_bias_column,
        },
    )?;

    let output = if args.direct {
        extractor.extract_direct(&store, &patients)?
    } else {
        extractor.extract(&store, &patients)?
    };
    output.write_json(&args.destination)?;
    log::info!(
        "wrote {} representations to {}",
        output.len(),
        args.destination.display()
    );
    Ok(())
}

fn required(value: Option<PathBuf>, flag: &str) -> Result<PathBuf, TrainingError> {
    value.ok_or_else(|| {
        TrainingError::initialization(format!("{flag} is required to build missing batches"))
    })
}
