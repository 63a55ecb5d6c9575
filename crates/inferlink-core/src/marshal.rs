//! Moves caller-owned tensor buffers into and out of engine values for a
//! single run.
//!
//! Everything that can be checked without the engine is checked before it is
//! called, and returned values are all verified before any of them is copied
//! out, so a failed run leaves every output buffer untouched.

use tracing::warn;

use crate::engine::{EngineValue, InputTensor, NodeInfo};
use crate::error::{EngineStage, InferError, Result};
use crate::tensor::{TensorBuffer, TensorSet};

pub struct InferenceMarshaler<'s> {
    input_nodes: &'s [NodeInfo],
    output_nodes: &'s [NodeInfo],
}

impl<'s> InferenceMarshaler<'s> {
    pub fn new(input_nodes: &'s [NodeInfo], output_nodes: &'s [NodeInfo]) -> Self {
        Self {
            input_nodes,
            output_nodes,
        }
    }

    /// Validate the inputs and refresh their derived sizes.
    pub fn check_inputs(&self, inputs: &mut TensorSet) -> Result<()> {
        if inputs.len() != self.input_nodes.len() {
            return Err(InferError::failed(format!(
                "model expects {} inputs, got {}",
                self.input_nodes.len(),
                inputs.len()
            )));
        }
        for buf in inputs.iter_mut() {
            buf.descriptor().require_positive()?;
            buf.recompute()?;
            let ty = buf.element_type();
            if !ty.is_marshalable() {
                return Err(InferError::failed(format!(
                    "unsupported tensor data type {ty} for input `{}`",
                    buf.name()
                )));
            }
            if buf.len() != buf.descriptor().byte_length() {
                return Err(InferError::failed(format!(
                    "input `{}` holds {} bytes but its shape needs {}",
                    buf.name(),
                    buf.len(),
                    buf.descriptor().byte_length()
                )));
            }
        }
        Ok(())
    }

    /// Borrowed engine inputs, paired with model input nodes by position.
    ///
    /// Call after [`Self::check_inputs`].
    pub fn input_views<'a>(&'a self, inputs: &'a TensorSet) -> Vec<InputTensor<'a>> {
        self.input_nodes
            .iter()
            .zip(inputs.iter())
            .map(|(node, buf)| InputTensor {
                name: node.name.as_str(),
                element_type: buf.element_type(),
                shape: buf.descriptor().shape(),
                data: buf.as_bytes(),
            })
            .collect()
    }

    /// Names of the requested outputs; every one must be a model output.
    pub fn output_names<'a>(&self, outputs: &'a TensorSet) -> Result<Vec<&'a str>> {
        outputs
            .iter()
            .map(|buf| {
                if self.output_nodes.iter().any(|n| n.name == buf.name()) {
                    Ok(buf.name())
                } else {
                    Err(InferError::failed(format!(
                        "output name not found in model: {}",
                        buf.name()
                    )))
                }
            })
            .collect()
    }

    /// Copy engine values into the output buffers, one value per buffer.
    pub fn write_outputs(&self, outputs: &mut TensorSet, values: &[EngineValue]) -> Result<()> {
        if values.len() != outputs.len() {
            return Err(InferError::engine(
                EngineStage::Run,
                anyhow::anyhow!(
                    "engine returned {} values for {} requested outputs",
                    values.len(),
                    outputs.len()
                ),
            ));
        }

        let mut sources = Vec::with_capacity(values.len());
        for (buf, value) in outputs.iter_mut().zip(values) {
            buf.recompute()?;
            sources.push(output_source(buf, value)?);
        }

        for (buf, src) in outputs.iter_mut().zip(sources) {
            let n = buf.descriptor().byte_length();
            buf.as_bytes_mut()[..n].copy_from_slice(&src[..n]);
        }
        Ok(())
    }
}

fn output_source<'v>(buf: &TensorBuffer, value: &'v EngineValue) -> Result<&'v [u8]> {
    let (element_type, shape, data) = match value {
        EngineValue::Tensor {
            element_type,
            shape,
            data,
        } => (element_type, shape, data),
        EngineValue::NonTensor { kind } => {
            return Err(InferError::engine(
                EngineStage::Run,
                anyhow::anyhow!("output `{}` is a {kind}, not a tensor", buf.name()),
            ));
        }
    };

    let want = buf.descriptor().byte_length();
    if data.len() < want {
        return Err(InferError::failed(format!(
            "output `{}` expects {want} bytes but the engine produced {} (shape {shape:?})",
            buf.name(),
            data.len()
        )));
    }
    if data.len() > want {
        warn!(
            output = buf.name(),
            engine_bytes = data.len(),
            buffer_bytes = want,
            "engine output larger than buffer, truncating"
        );
    }
    if *element_type != Some(buf.element_type()) {
        warn!(
            output = buf.name(),
            buffer_type = %buf.element_type(),
            engine_type = ?element_type,
            "output element type differs from descriptor"
        );
    }
    if buf.len() < want {
        return Err(InferError::failed(format!(
            "output `{}` buffer holds {} bytes, descriptor needs {want}",
            buf.name(),
            buf.len()
        )));
    }
    Ok(&data[..])
}
