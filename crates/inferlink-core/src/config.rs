//! Model configuration.
//!
//! A [`ModelConfig`] is an immutable snapshot: sessions clone it at
//! construction and never observe later changes made by the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{InferError, Result};
use crate::tensor::MAX_NAME_LEN;

/// Cipher block size the encrypted byte range is expressed in.
pub const ENCRYPTION_BLOCK: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
}

impl FromStr for Device {
    type Err = InferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" | "cuda" => Ok(Self::Gpu),
            other => Err(InferError::config(format!("Invalid device: {other}"))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

/// How GPU memory is partitioned for this model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuMemory {
    /// Fraction of each visible card's memory.
    Fraction(f32),
    /// Virtual GPUs per card: card index to the memory fraction of each
    /// virtual device carved out of it.
    VirtualGpus(BTreeMap<u32, Vec<f32>>),
}

impl Default for GpuMemory {
    fn default() -> Self {
        Self::Fraction(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    #[default]
    Onnx,
    SavedModel,
    FrozenGraph,
}

/// Engine graph optimization level, in increasing order of rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeLevel {
    Disabled,
    #[default]
    Basic,
    Extended,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Int8,
}

/// Tuning for the graph-compiling accelerator provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorTuning {
    pub dynamic_shapes: bool,
    pub max_batch_size: u32,
    pub max_workspace_bytes: u64,
    pub precision: Precision,
    pub min_segment_size: u64,
    pub max_cached_engines: u64,
}

impl Default for AcceleratorTuning {
    fn default() -> Self {
        Self {
            dynamic_shapes: true,
            max_batch_size: 1,
            max_workspace_bytes: 1 << 30,
            precision: Precision::Fp32,
            min_segment_size: 3,
            max_cached_engines: 1,
        }
    }
}

/// Byte range of the model file that is stored encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRange {
    pub offset: u64,
    pub length: u64,
}

impl EncryptedRange {
    /// `(start_block, block_count)` in cipher blocks.
    pub fn blocks(&self) -> (u64, u64) {
        (self.offset / ENCRYPTION_BLOCK, self.length / ENCRYPTION_BLOCK)
    }

    /// The range must be non-empty and block aligned at both ends.
    pub fn validate(&self) -> Result<()> {
        if self.length == 0 {
            return Err(InferError::config("encrypted range is empty"));
        }
        if self.offset % ENCRYPTION_BLOCK != 0 || self.length % ENCRYPTION_BLOCK != 0 {
            return Err(InferError::config(format!(
                "encrypted range {}+{} is not aligned to {ENCRYPTION_BLOCK} byte blocks",
                self.offset, self.length
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub device: Device,

    #[serde(default)]
    pub gpu_id: u32,

    /// Cards the engine may see; empty means all.
    #[serde(default)]
    pub visible_cards: Vec<u32>,

    /// Written as a one-key map, `fraction: 0.5` or `virtual_gpus: {...}`.
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub gpu_memory: GpuMemory,

    pub model_path: PathBuf,

    #[serde(default)]
    pub signature_tag: Option<String>,

    #[serde(default)]
    pub encryption: Option<EncryptedRange>,

    #[serde(default)]
    pub model_format: ModelFormat,

    #[serde(default)]
    pub optimize_level: OptimizeLevel,

    #[serde(default)]
    pub accelerator: AcceleratorTuning,
}

impl ModelConfig {
    pub fn builder(model_path: impl Into<PathBuf>) -> ModelConfigBuilder {
        ModelConfigBuilder::new(model_path)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Check field ranges. Called by the session before anything is opened.
    pub fn validate(&self) -> Result<()> {
        let path_len = self.model_path.as_os_str().len();
        if path_len == 0 {
            return Err(InferError::ParamNull("model_path"));
        }
        if path_len > MAX_NAME_LEN {
            return Err(InferError::config(format!(
                "model path of {path_len} bytes exceeds the {MAX_NAME_LEN} byte limit"
            )));
        }
        if let Some(tag) = &self.signature_tag {
            if tag.len() > MAX_NAME_LEN {
                return Err(InferError::config("signature tag is too long"));
            }
        }

        match &self.gpu_memory {
            GpuMemory::Fraction(f) => check_fraction(*f)?,
            GpuMemory::VirtualGpus(cards) => {
                for (card, parts) in cards {
                    if parts.is_empty() {
                        return Err(InferError::config(format!(
                            "card {card} lists no virtual GPUs"
                        )));
                    }
                    for f in parts {
                        check_fraction(*f)?;
                    }
                    let total: f32 = parts.iter().sum();
                    if total > 1.0 + f32::EPSILON {
                        return Err(InferError::config(format!(
                            "virtual GPUs on card {card} claim {total:.3} of its memory"
                        )));
                    }
                }
            }
        }

        if let Some(range) = &self.encryption {
            range.validate()?;
        }

        Ok(())
    }

    /// Absolute model path: absolute paths are kept, relative ones are joined
    /// onto the current working directory.
    pub fn resolved_model_path(&self) -> Result<PathBuf> {
        resolve_path(&self.model_path)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load a configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Load a configuration, choosing the parser by file extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            _ => Self::from_json_file(path),
        }
    }
}

fn check_fraction(f: f32) -> Result<()> {
    if !(f > 0.0 && f <= 1.0) {
        return Err(InferError::config(format!(
            "GPU memory fraction {f} is outside (0, 1]"
        )));
    }
    Ok(())
}

pub(crate) fn resolve_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Fluent construction of a [`ModelConfig`].
#[derive(Debug, Clone)]
pub struct ModelConfigBuilder {
    config: ModelConfig,
}

impl ModelConfigBuilder {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            config: ModelConfig {
                device: Device::Cpu,
                gpu_id: 0,
                visible_cards: Vec::new(),
                gpu_memory: GpuMemory::default(),
                model_path: model_path.into(),
                signature_tag: None,
                encryption: None,
                model_format: ModelFormat::Onnx,
                optimize_level: OptimizeLevel::default(),
                accelerator: AcceleratorTuning::default(),
            },
        }
    }

    pub fn gpu(mut self, gpu_id: u32) -> Self {
        self.config.device = Device::Gpu;
        self.config.gpu_id = gpu_id;
        self
    }

    pub fn visible_cards(mut self, cards: impl IntoIterator<Item = u32>) -> Self {
        self.config.visible_cards = cards.into_iter().collect();
        self
    }

    pub fn gpu_memory(mut self, memory: GpuMemory) -> Self {
        self.config.gpu_memory = memory;
        self
    }

    pub fn signature_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.signature_tag = Some(tag.into());
        self
    }

    pub fn encrypted(mut self, offset: u64, length: u64) -> Self {
        self.config.encryption = Some(EncryptedRange { offset, length });
        self
    }

    pub fn model_format(mut self, format: ModelFormat) -> Self {
        self.config.model_format = format;
        self
    }

    pub fn optimize_level(mut self, level: OptimizeLevel) -> Self {
        self.config.optimize_level = level;
        self
    }

    pub fn accelerator(mut self, tuning: AcceleratorTuning) -> Self {
        self.config.accelerator = tuning;
        self
    }

    pub fn build(self) -> Result<ModelConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_uses_defaults() {
        let config: ModelConfig = serde_json::from_str(r#"{ "model_path": "net.onnx" }"#).unwrap();
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.optimize_level, OptimizeLevel::Basic);
        assert_eq!(config.model_format, ModelFormat::Onnx);
        assert!(!config.is_encrypted());
        config.validate().unwrap();
    }

    #[test]
    fn yaml_with_virtual_gpus() {
        let yaml = r#"
device: gpu
gpu_id: 1
model_path: /srv/models/detector.onnx
gpu_memory:
  virtual_gpus:
    0: [0.5, 0.25]
    1: [1.0]
encryption:
  offset: 32
  length: 1024
optimize_level: all
accelerator:
  precision: fp16
  max_batch_size: 8
"#;
        let config: ModelConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.device, Device::Gpu);
        assert_eq!(config.accelerator.precision, Precision::Fp16);
        assert_eq!(config.accelerator.max_batch_size, 8);
        assert_eq!(config.accelerator.min_segment_size, 3);
        assert_eq!(config.encryption.unwrap().blocks(), (2, 64));

        let mut cards = BTreeMap::new();
        cards.insert(0, vec![0.5, 0.25]);
        cards.insert(1, vec![1.0]);
        assert_eq!(config.gpu_memory, GpuMemory::VirtualGpus(cards));
    }

    #[test]
    fn gpu_memory_is_a_one_key_map() {
        let yaml = "model_path: m.onnx\ngpu_memory:\n  fraction: 0.5\n";
        let config: ModelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.gpu_memory, GpuMemory::Fraction(0.5));

        let json = r#"{ "model_path": "m.onnx", "gpu_memory": { "virtual_gpus": { "2": [0.3] } } }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.gpu_memory,
            GpuMemory::VirtualGpus(BTreeMap::from([(2, vec![0.3])]))
        );

        let written = serde_yaml::to_string(&config).unwrap();
        assert!(written.contains("virtual_gpus:"), "{written}");
        let reread: ModelConfig = serde_yaml::from_str(&written).unwrap();
        assert_eq!(reread.gpu_memory, config.gpu_memory);
    }

    #[test]
    fn rejects_bad_ranges() {
        assert!(matches!(
            ModelConfig::builder("").build(),
            Err(InferError::ParamNull("model_path"))
        ));
        assert!(ModelConfig::builder("m.onnx").encrypted(8, 32).build().is_err());
        assert!(ModelConfig::builder("m.onnx").encrypted(0, 0).build().is_err());
        assert!(ModelConfig::builder("m.onnx")
            .gpu_memory(GpuMemory::Fraction(1.5))
            .build()
            .is_err());

        let mut cards = BTreeMap::new();
        cards.insert(0, vec![0.6, 0.6]);
        assert!(ModelConfig::builder("m.onnx")
            .gpu_memory(GpuMemory::VirtualGpus(cards))
            .build()
            .is_err());
    }

    #[test]
    fn path_resolution() {
        let abs = ModelConfig::builder("/opt/m.onnx").build().unwrap();
        assert_eq!(abs.resolved_model_path().unwrap(), PathBuf::from("/opt/m.onnx"));

        let rel = ModelConfig::builder("models/m.onnx").build().unwrap();
        let resolved = rel.resolved_model_path().unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("models/m.onnx"));
    }

    #[test]
    fn optimize_levels_are_ordered() {
        assert!(OptimizeLevel::Basic > OptimizeLevel::Disabled);
        assert!(OptimizeLevel::All > OptimizeLevel::Extended);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Gpu);
    }
}
