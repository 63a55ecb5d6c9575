mod cli;

use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command, KeyArgs, ModelArgs};
use inferlink_backend_ort::OrtEngine;
use inferlink_core::{
    AesBlockDecryptor, ElementType, EncryptedRange, InferError, ModelConfig, ModelSession,
    NodeInfo, Runtime, TensorBuffer, TensorDescriptor, TensorSet,
};
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(&cli.log) {
        eprintln!("invalid --log filter: {err:#}");
        return ExitCode::from(2);
    }

    match dispatch(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "inferlink failed");
            let code = err
                .downcast_ref::<InferError>()
                .map(|e| e.code() as i32)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn init_tracing(log: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log).context("parsing log filter")?;
    // stdout carries the JSON results
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Inspect { model } => inspect(&model),
        Command::Run {
            model,
            inputs,
            shapes,
            outputs,
            out_dir,
        } => run(&model, &inputs, &shapes, &outputs, out_dir.as_deref()),
        Command::Encrypt {
            model,
            out,
            offset,
            length,
            key,
        } => encrypt(&model, &out, EncryptedRange { offset, length }, &key),
    }
}

fn runtime(key: &KeyArgs) -> Result<Runtime<OrtEngine>> {
    let runtime = Runtime::new(OrtEngine::new());
    Ok(match &key.key_hex {
        Some(hex) => runtime.with_decryptor(AesBlockDecryptor::from_hex(hex)?),
        None => runtime,
    })
}

fn load_config(args: &ModelArgs) -> Result<ModelConfig> {
    let config = ModelConfig::from_file(&args.config)
        .with_context(|| format!("reading config {}", args.config.display()))?;
    config.validate()?;
    Ok(config)
}

/// Load a model, freeing the sets again if it fails.
fn load(
    runtime: &Runtime<OrtEngine>,
    config: &ModelConfig,
    inputs: TensorSet,
    outputs: TensorSet,
) -> Result<ModelSession<OrtEngine>> {
    match runtime.load_model(config, inputs, outputs) {
        Ok(session) => Ok(session),
        Err(err) => {
            let (error, inputs, outputs) = err.into_parts();
            runtime.deinit_tensors(inputs, outputs)?;
            Err(error.into())
        }
    }
}

/// Open the model with nothing bound and return its node metadata.
fn read_nodes(
    runtime: &Runtime<OrtEngine>,
    config: &ModelConfig,
) -> Result<(Vec<NodeInfo>, Vec<NodeInfo>)> {
    let (inputs, outputs) = runtime.init_tensors(&[], &[])?;
    let session = load(runtime, config, inputs, outputs)?;
    let nodes = (session.input_nodes(), session.output_nodes());
    let (inputs, outputs) = runtime.release_model(session)?;
    runtime.deinit_tensors(inputs, outputs)?;
    Ok(nodes)
}

fn inspect(args: &ModelArgs) -> Result<()> {
    let config = load_config(args)?;
    let runtime = runtime(&args.key)?;
    let (inputs, outputs) = read_nodes(&runtime, &config)?;

    let report = json!({
        "model": config.model_path,
        "engine": "onnxruntime",
        "inputs": inputs.iter().map(node_json).collect::<Vec<_>>(),
        "outputs": outputs.iter().map(node_json).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run(
    args: &ModelArgs,
    input_files: &[String],
    shape_args: &[String],
    output_names: &[String],
    out_dir: Option<&Path>,
) -> Result<()> {
    let config = load_config(args)?;
    let runtime = runtime(&args.key)?;
    let (input_nodes, output_nodes) = read_nodes(&runtime, &config)?;

    let files = parse_pairs(input_files, "--input")?;
    let mut shapes = HashMap::new();
    for (name, dims) in parse_pairs(shape_args, "--shape")? {
        shapes.insert(name, parse_dims(&dims)?);
    }

    let input_descs = input_nodes
        .iter()
        .map(|node| descriptor(node, &shapes))
        .collect::<Result<Vec<_>>>()?;

    let wanted: Vec<&NodeInfo> = if output_names.is_empty() {
        output_nodes.iter().collect()
    } else {
        output_names
            .iter()
            .map(|name| {
                output_nodes
                    .iter()
                    .find(|n| &n.name == name)
                    .with_context(|| format!("model has no output named {name}"))
            })
            .collect::<Result<_>>()?
    };
    let output_descs = wanted
        .iter()
        .map(|node| descriptor(node, &shapes))
        .collect::<Result<Vec<_>>>()?;

    let (inputs, outputs) = runtime.init_tensors(&input_descs, &output_descs)?;
    let session = load(&runtime, &config, inputs, outputs)?;

    session.with_inputs(|inputs| -> Result<()> {
        for buf in inputs.iter_mut() {
            let Some(path) = files.get(buf.name()) else {
                info!(input = buf.name(), "no data given; input left zeroed");
                continue;
            };
            let data = std::fs::read(path).with_context(|| format!("reading {path}"))?;
            if data.len() != buf.len() {
                bail!(
                    "{path} holds {} bytes but input {} needs {}",
                    data.len(),
                    buf.name(),
                    buf.len()
                );
            }
            buf.as_bytes_mut().copy_from_slice(&data);
        }
        Ok(())
    })?;

    runtime.run_inference(&session)?;

    let report = session.with_outputs(|outputs| -> Result<Value> {
        if let Some(dir) = out_dir {
            std::fs::create_dir_all(dir)?;
            for buf in outputs.iter() {
                let path = dir.join(format!("{}.bin", buf.name()));
                std::fs::write(&path, buf.as_bytes())
                    .with_context(|| format!("writing {}", path.display()))?;
            }
        }
        Ok(Value::Array(outputs.iter().map(output_json).collect::<Result<_>>()?))
    })?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let (inputs, outputs) = runtime.release_model(session)?;
    runtime.deinit_tensors(inputs, outputs)?;
    Ok(())
}

fn encrypt(model: &Path, out: &Path, range: EncryptedRange, key: &KeyArgs) -> Result<()> {
    range.validate()?;
    let hex = key
        .key_hex
        .as_deref()
        .context("a key is required: pass --key-hex or set INFERLINK_MODEL_KEY")?;
    let aes = AesBlockDecryptor::from_hex(hex)?;

    let mut data =
        std::fs::read(model).with_context(|| format!("reading {}", model.display()))?;
    let (start_block, block_count) = range.blocks();
    aes.encrypt_in_place(&mut data, start_block, block_count)?;
    std::fs::write(out, &data).with_context(|| format!("writing {}", out.display()))?;

    info!(
        model = %model.display(),
        out = %out.display(),
        offset = range.offset,
        length = range.length,
        "model encrypted"
    );
    Ok(())
}

fn descriptor(node: &NodeInfo, shapes: &HashMap<String, Vec<i64>>) -> Result<TensorDescriptor> {
    let element_type = node
        .element_type
        .with_context(|| format!("node {} has an element type inferlink cannot hold", node.name))?;
    let dims = match shapes.get(&node.name) {
        Some(dims) => dims.clone(),
        None if node.dims.iter().any(|d| *d < 0) => {
            bail!("node {} has dynamic dimensions; pass --shape {}=DIMS", node.name, node.name)
        }
        None => node.dims.clone(),
    };
    Ok(TensorDescriptor::new(node.name.as_str(), element_type, &dims)?)
}

fn parse_pairs(raw: &[String], flag: &str) -> Result<HashMap<String, String>> {
    raw.iter()
        .map(|pair| {
            let (name, value) = pair
                .split_once('=')
                .with_context(|| format!("{flag} expects NAME=VALUE, got {pair}"))?;
            Ok((name.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_dims(raw: &str) -> Result<Vec<i64>> {
    raw.split(['x', ','])
        .map(|d| {
            d.trim()
                .parse::<i64>()
                .with_context(|| format!("bad dimension {d:?} in {raw}"))
        })
        .collect()
}

fn node_json(node: &NodeInfo) -> Value {
    json!({
        "name": node.name,
        "element_type": node.element_type.map(ElementType::as_str),
        "dims": node.dims,
    })
}

fn output_json(buf: &TensorBuffer) -> Result<Value> {
    let values = match buf.element_type() {
        ElementType::Float32 => json!(buf.to_vec::<f32>()?),
        ElementType::Float64 => json!(buf.to_vec::<f64>()?),
        ElementType::Int32 => json!(buf.to_vec::<i32>()?),
        ElementType::Int64 => json!(buf.to_vec::<i64>()?),
        ElementType::Int16 => json!(buf.to_vec::<i16>()?),
        ElementType::Int8 => json!(buf.to_vec::<i8>()?),
        ElementType::Uint8 | ElementType::Bool => json!(buf.as_bytes()),
        ElementType::String => Value::Null,
    };
    let desc = buf.descriptor();
    Ok(json!({
        "name": desc.name(),
        "element_type": desc.element_type().as_str(),
        "dims": desc.shape().dims(),
        "values": values,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_accept_x_and_comma() {
        assert_eq!(parse_dims("1x3x224x224").unwrap(), vec![1, 3, 224, 224]);
        assert_eq!(parse_dims("2, 5").unwrap(), vec![2, 5]);
        assert!(parse_dims("1xq").is_err());
    }

    #[test]
    fn pairs_need_separator() {
        let pairs = parse_pairs(&["x=a.bin".to_string()], "--input").unwrap();
        assert_eq!(pairs["x"], "a.bin");
        assert!(parse_pairs(&["x".to_string()], "--input").is_err());
    }

    #[test]
    fn dynamic_nodes_need_a_shape() {
        let node = NodeInfo {
            name: "input_1".to_string(),
            element_type: Some(ElementType::Float32),
            dims: vec![-1, 3],
        };
        assert!(descriptor(&node, &HashMap::new()).is_err());

        let shapes = HashMap::from([("input_1".to_string(), vec![2, 3])]);
        let desc = descriptor(&node, &shapes).unwrap();
        assert_eq!(desc.byte_length(), 24);
    }
}
