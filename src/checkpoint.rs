//! Checkpoints: a network's layer widths together with its learned parameters
//!
//! On disk a checkpoint is a single file:
//!
//! ```text
//! ┌──────────────┬──────────────────────┬───────────────────────────┐
//! │ 8 bytes      │ N bytes              │ parameter data            │
//! │ header size  │ JSON header (UTF-8)  │ f32 LE, row-major,        │
//! │ (u64 LE)     │                      │ contiguous                │
//! └──────────────┴──────────────────────┴───────────────────────────┘
//! ```
//!
//! The header carries `input_size`, `output_size`, `hidden_layers` and, per parameter,
//! its shape and the `[start, end)` byte range of its data. Values are stored as raw bits
//! so a save/load round trip is exact.

use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    nn::{Module, NNError, Network, parameter_shapes},
    tensor::{StateDict, Tensor, TensorError},
};

/// Value of the header's `format` field
pub const FORMAT: &str = "fcnet";
/// Newest header layout this build reads and the one it writes
pub const VERSION: u32 = 1;
/// Used when a checkpoint does not record its dropout probability
pub const DEFAULT_DROP_P: f32 = 0.5;

const HEADER_LEN_BYTES: usize = 8;
const F32_BYTES: usize = 4;

/// A stored parameter whose shape differs from the slot it would be loaded into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub name: String,
    /// shape of the model's slot
    pub expected: Vec<usize>,
    /// shape found in the checkpoint
    pub actual: Vec<usize>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {:?}, found {:?}",
            self.name, self.expected, self.actual
        )
    }
}

fn describe_mismatch(
    mismatches: &[ShapeMismatch],
    missing: &[String],
    unexpected: &[String],
) -> String {
    let count = mismatches.len() + missing.len() + unexpected.len();
    let mut parts = mismatches
        .iter()
        .map(ShapeMismatch::to_string)
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        parts.push(format!("missing from checkpoint: {missing:?}"));
    }
    if !unexpected.is_empty() {
        parts.push(format!("not in model: {unexpected:?}"));
    }
    format!(
        "shape mismatch in {} parameter(s): {}",
        count,
        parts.join("; ")
    )
}

/// Errors for saving and loading checkpoints
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The stored parameters do not fit the model's slots. Slots present on only one side
    /// are listed by name, so a different number of hidden layers also lands here.
    #[error("{}", describe_mismatch(.mismatches, .missing, .unexpected))]
    ShapeMismatch {
        mismatches: Vec<ShapeMismatch>,
        /// slots of the model with nothing stored for them
        missing: Vec<String>,
        /// stored parameters the model has no slot for
        unexpected: Vec<String>,
    },
    #[error("invalid checkpoint record: {0}")]
    InvalidRecord(String),
    #[error("not a checkpoint file, format is {0:?}")]
    Format(String),
    #[error("unsupported checkpoint version {0} (supported: {supported})", supported = VERSION)]
    UnsupportedVersion(u32),
    #[error("checkpoint truncated: needs {needed} bytes but only {available} are present")]
    Truncated { needed: u64, available: u64 },
    #[error("malformed checkpoint header: {0}")]
    Header(#[from] serde_json::Error),
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot build network from checkpoint: {0}")]
    Network(#[from] NNError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    format: String,
    version: u32,
    input_size: usize,
    output_size: usize,
    hidden_layers: Vec<usize>,
    #[serde(default = "default_drop_p")]
    drop_p: f32,
    parameters: BTreeMap<String, TensorEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorEntry {
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

fn default_drop_p() -> f32 {
    DEFAULT_DROP_P
}

/// A point-in-time snapshot of a [`Network`], enough to rebuild an identical one
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub input_size: usize,
    pub output_size: usize,
    pub hidden_layers: Vec<usize>,
    pub drop_p: f32,
    pub parameters: StateDict,
}

impl Checkpoint {
    /// Snapshots the model's widths and current parameter values
    pub fn from_model(model: &Network) -> Self {
        Self {
            input_size: model.input_size(),
            output_size: model.output_size(),
            hidden_layers: model.hidden_layers().to_vec(),
            drop_p: model.drop_p(),
            parameters: model.state_dict(),
        }
    }

    /// Total number of stored values
    pub fn n_values(&self) -> usize {
        self.parameters.values().map(Tensor::numel).sum()
    }

    /// Checks the stored parameters against the shapes implied by the recorded widths
    /// without building a network
    pub fn validate(&self) -> Result<(), CheckpointError> {
        let expected = parameter_shapes(self.input_size, self.output_size, &self.hidden_layers);
        check_state(&expected, &self.parameters)
    }

    /// Builds a network with the recorded widths and copies the stored values into it
    pub fn into_model(&self) -> Result<Network, CheckpointError> {
        let mut model = Network::new(
            self.input_size,
            self.output_size,
            &self.hidden_layers,
            self.drop_p,
        )?;
        model.load_state_dict(&self.parameters)?;
        log::info!(
            "restored network {} -> {:?} -> {}",
            self.input_size,
            self.hidden_layers,
            self.output_size
        );
        Ok(model)
    }

    /// Copies the stored values into an existing network. On error `model` is unchanged.
    pub fn load_into(&self, model: &mut Network) -> Result<(), CheckpointError> {
        model.load_state_dict(&self.parameters)
    }

    /// Encodes the checkpoint into `writer`
    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), CheckpointError> {
        let mut offset = 0;
        let mut entries = BTreeMap::new();
        for (name, tensor) in self.parameters.iter() {
            let end = offset + tensor.numel() * F32_BYTES;
            entries.insert(
                name.clone(),
                TensorEntry {
                    shape: tensor.shape().to_vec(),
                    data_offsets: [offset, end],
                },
            );
            offset = end;
        }
        let header = Header {
            format: FORMAT.to_string(),
            version: VERSION,
            input_size: self.input_size,
            output_size: self.output_size,
            hidden_layers: self.hidden_layers.clone(),
            drop_p: self.drop_p,
            parameters: entries,
        };
        let header = serde_json::to_vec(&header)?;

        writer.write_all(&(header.len() as u64).to_le_bytes())?;
        writer.write_all(&header)?;
        // BTreeMap iteration order matches the offsets assigned above
        for tensor in self.parameters.values() {
            for v in tensor.data() {
                writer.write_all(&v.to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// Decodes a checkpoint from `reader`
    pub fn read_from(reader: &mut impl Read) -> Result<Self, CheckpointError> {
        let mut buf = vec![];
        reader.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, CheckpointError> {
        let available = buf.len() as u64;
        if buf.len() < HEADER_LEN_BYTES {
            return Err(CheckpointError::Truncated {
                needed: HEADER_LEN_BYTES as u64,
                available,
            });
        }
        let mut len_bytes = [0u8; HEADER_LEN_BYTES];
        len_bytes.copy_from_slice(&buf[..HEADER_LEN_BYTES]);
        let header_len = u64::from_le_bytes(len_bytes);
        let data_start = (HEADER_LEN_BYTES as u64).saturating_add(header_len);
        if data_start > available {
            return Err(CheckpointError::Truncated {
                needed: data_start,
                available,
            });
        }
        let data_start = data_start as usize;

        let header: Header = serde_json::from_slice(&buf[HEADER_LEN_BYTES..data_start])?;
        if header.format != FORMAT {
            return Err(CheckpointError::Format(header.format));
        }
        if header.version != VERSION {
            return Err(CheckpointError::UnsupportedVersion(header.version));
        }

        let data = &buf[data_start..];
        let mut parameters = StateDict::new();
        for (name, entry) in header.parameters {
            let [start, end] = entry.data_offsets;
            if end < start {
                return Err(CheckpointError::InvalidRecord(format!(
                    "{name}: data offsets [{start}, {end}) are reversed"
                )));
            }
            if end > data.len() {
                return Err(CheckpointError::Truncated {
                    needed: (data_start + end) as u64,
                    available,
                });
            }
            let n_bytes = entry
                .shape
                .iter()
                .try_fold(F32_BYTES, |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| {
                    CheckpointError::InvalidRecord(format!(
                        "{name}: shape {:?} is too large",
                        entry.shape
                    ))
                })?;
            if end - start != n_bytes {
                return Err(CheckpointError::InvalidRecord(format!(
                    "{name}: shape {:?} needs {n_bytes} bytes but {} are stored",
                    entry.shape,
                    end - start
                )));
            }
            let values = data[start..end]
                .chunks_exact(F32_BYTES)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            parameters.insert(name, Tensor::new(entry.shape, values)?);
        }

        Ok(Self {
            input_size: header.input_size,
            output_size: header.output_size,
            hidden_layers: header.hidden_layers,
            drop_p: header.drop_p,
            parameters,
        })
    }

    /// Writes the checkpoint to `path`, replacing any existing file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        log::info!(
            "saved checkpoint with {} tensors ({} values) to '{}'",
            self.parameters.len(),
            self.n_values(),
            path.display()
        );
        Ok(())
    }

    /// Reads a checkpoint from `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        let checkpoint = Self::read_from(&mut reader)?;
        log::info!(
            "loaded checkpoint with {} tensors from '{}'",
            checkpoint.parameters.len(),
            path.display()
        );
        Ok(checkpoint)
    }
}

/// Compares `state` slot by slot against the `expected` shapes, reporting every
/// difference at once
pub(crate) fn check_state(
    expected: &BTreeMap<String, Vec<usize>>,
    state: &StateDict,
) -> Result<(), CheckpointError> {
    let mut mismatches = vec![];
    let mut missing = vec![];
    for (name, shape) in expected.iter() {
        match state.get(name) {
            None => missing.push(name.clone()),
            Some(t) if t.shape() != shape.as_slice() => mismatches.push(ShapeMismatch {
                name: name.clone(),
                expected: shape.clone(),
                actual: t.shape().to_vec(),
            }),
            Some(_) => {}
        }
    }
    let unexpected = state
        .keys()
        .filter(|k| !expected.contains_key(*k))
        .cloned()
        .collect::<Vec<_>>();

    if mismatches.is_empty() && missing.is_empty() && unexpected.is_empty() {
        return Ok(());
    }
    Err(CheckpointError::ShapeMismatch {
        mismatches,
        missing,
        unexpected,
    })
}

/// Snapshots `model` and writes it to `path`
pub fn save_checkpoint(model: &Network, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
    Checkpoint::from_model(model).save(path)
}

/// Reads the checkpoint at `path` and rebuilds the network it describes
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Network, CheckpointError> {
    Checkpoint::load(path)?.into_model()
}
