use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "inferlink", version, about = "Load and run models through inferlink")]
pub struct Cli {
    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, global = true, default_value = "info", env = "INFERLINK_LOG")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open a model and print its input and output nodes as JSON
    Inspect {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Run one inference and print the outputs as JSON
    Run {
        #[command(flatten)]
        model: ModelArgs,

        /// Raw little-endian input data, as NAME=PATH
        #[arg(long = "input", value_name = "NAME=PATH")]
        inputs: Vec<String>,

        /// Concrete shape for a tensor with dynamic dimensions, as NAME=1x3x224x224
        #[arg(long = "shape", value_name = "NAME=DIMS")]
        shapes: Vec<String>,

        /// Output to fetch; defaults to every model output
        #[arg(long = "output", value_name = "NAME")]
        outputs: Vec<String>,

        /// Write each output's raw bytes to DIR/NAME.bin
        #[arg(long, value_name = "DIR")]
        out_dir: Option<PathBuf>,
    },

    /// Encrypt a block-aligned byte range of a model file
    Encrypt {
        /// Plain model file
        #[arg(long)]
        model: PathBuf,

        /// Destination for the encrypted copy
        #[arg(long)]
        out: PathBuf,

        /// First encrypted byte; multiple of 16
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Encrypted byte count; multiple of 16
        #[arg(long)]
        length: u64,

        #[command(flatten)]
        key: KeyArgs,
    },
}

#[derive(Args, Debug)]
pub struct ModelArgs {
    /// Model configuration (.json, .yaml or .yml)
    #[arg(long)]
    pub config: PathBuf,

    #[command(flatten)]
    pub key: KeyArgs,
}

#[derive(Args, Debug)]
pub struct KeyArgs {
    /// AES-128 model key, 32 hex characters
    #[arg(long = "key-hex", env = "INFERLINK_MODEL_KEY", hide_env_values = true)]
    pub key_hex: Option<String>,
}
