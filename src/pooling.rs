//! Named strategies that decide how much to draw from each pooled input.
//!
//! The JSON shape matches what lab front ends send:
//! `{"function": "amplicon", "parameters": {"dna_amount": 240, ...}}`.

use crate::error::LabError;
use labtrack_protocol::CompositionId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqualParameters {
    pub total_vol: f64,
    /// When set, blanks get this volume and `total_vol` is split among the rest.
    #[serde(default)]
    pub blank_volume: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmpliconParameters {
    /// Target DNA per well, ng.
    pub dna_amount: f64,
    pub min_val: f64,
    pub max_val: f64,
    #[serde(default)]
    pub blank_volume: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassthroughParameters {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", content = "parameters", rename_all = "snake_case")]
pub enum PoolingFunction {
    Equal(EqualParameters),
    Amplicon(AmpliconParameters),
    #[serde(alias = "amplicon_pool")]
    Passthrough(PassthroughParameters),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolingInput {
    pub composition: CompositionId,
    pub concentration: Option<f64>,
    pub blank: bool,
    pub input_volume: f64,
    pub percentage_of_output: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolingPolicy {
    pub percentage_tolerance: f64,
    pub default_blank_volume: Option<f64>,
}

impl Default for PoolingPolicy {
    fn default() -> Self {
        Self {
            percentage_tolerance: 1e-5,
            default_blank_volume: None,
        }
    }
}

pub trait PoolingStrategy {
    fn name(&self) -> &'static str;

    /// One draw volume per input, in input order.
    fn volumes(&self, inputs: &[PoolingInput], policy: &PoolingPolicy) -> Result<Vec<f64>, LabError>;
}

impl PoolingStrategy for EqualParameters {
    fn name(&self) -> &'static str {
        "equal"
    }

    fn volumes(&self, inputs: &[PoolingInput], _policy: &PoolingPolicy) -> Result<Vec<f64>, LabError> {
        if !(self.total_vol > 0.0) {
            return Err(LabError::validation("total_vol", "total_vol must be positive"));
        }
        let share = |n: usize| self.total_vol / n as f64;
        match self.blank_volume {
            Some(blank_volume) => {
                let n = inputs.iter().filter(|i| !i.blank).count();
                if n == 0 {
                    return Err(LabError::validation(
                        "inputs",
                        "Equal pooling needs at least one non-blank input",
                    ));
                }
                Ok(inputs
                    .iter()
                    .map(|i| if i.blank { blank_volume } else { share(n) })
                    .collect())
            }
            None => Ok(vec![share(inputs.len()); inputs.len()]),
        }
    }
}

impl PoolingStrategy for AmpliconParameters {
    fn name(&self) -> &'static str {
        "amplicon"
    }

    fn volumes(&self, inputs: &[PoolingInput], policy: &PoolingPolicy) -> Result<Vec<f64>, LabError> {
        if !(self.dna_amount > 0.0) {
            return Err(LabError::validation("dna_amount", "dna_amount must be positive"));
        }
        if !(self.min_val >= 0.0) || !(self.max_val >= self.min_val) {
            return Err(LabError::validation(
                "min_val",
                format!("Invalid clamp range [{}, {}]", self.min_val, self.max_val),
            ));
        }
        let blank_volume = self
            .blank_volume
            .or(policy.default_blank_volume)
            .unwrap_or(self.min_val);
        Ok(inputs
            .iter()
            .map(|i| {
                if i.blank {
                    return blank_volume;
                }
                match i.concentration {
                    Some(c) if c > 0.0 => (self.dna_amount / c).clamp(self.min_val, self.max_val),
                    _ => self.max_val,
                }
            })
            .collect())
    }
}

impl PoolingStrategy for PassthroughParameters {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn volumes(&self, inputs: &[PoolingInput], _policy: &PoolingPolicy) -> Result<Vec<f64>, LabError> {
        Ok(inputs.iter().map(|i| i.input_volume).collect())
    }
}

impl PoolingFunction {
    pub fn names() -> Vec<String> {
        ["equal", "amplicon", "passthrough"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn strategy(&self) -> &dyn PoolingStrategy {
        match self {
            Self::Equal(p) => p,
            Self::Amplicon(p) => p,
            Self::Passthrough(p) => p,
        }
    }

    /// Validates the request and returns the volume to draw per input.
    pub fn compute(&self, inputs: &[PoolingInput], policy: &PoolingPolicy) -> Result<Vec<f64>, LabError> {
        validate_inputs(inputs, policy)?;
        let volumes = self.strategy().volumes(inputs, policy)?;
        if let Some((idx, v)) = volumes
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(LabError::validation(
                "input_volume",
                format!(
                    "Pooling function '{}' produced volume {v} for input {}",
                    self.strategy().name(),
                    inputs[idx].composition
                ),
            ));
        }
        Ok(volumes)
    }
}

pub fn validate_inputs(inputs: &[PoolingInput], policy: &PoolingPolicy) -> Result<(), LabError> {
    if inputs.is_empty() {
        return Err(LabError::validation("inputs", "A pool needs at least one input"));
    }
    for input in inputs {
        if !input.percentage_of_output.is_finite() || input.percentage_of_output < 0.0 {
            return Err(LabError::validation(
                "percentage_of_output",
                format!(
                    "Input {} has percentage_of_output {}",
                    input.composition, input.percentage_of_output
                ),
            ));
        }
        if !input.input_volume.is_finite() || input.input_volume < 0.0 {
            return Err(LabError::validation(
                "input_volume",
                format!("Input {} has input_volume {}", input.composition, input.input_volume),
            ));
        }
    }
    let sum: f64 = inputs.iter().map(|i| i.percentage_of_output).sum();
    if (sum - 1.0).abs() > policy.percentage_tolerance {
        return Err(LabError::validation(
            "percentage_of_output",
            format!(
                "Percentages of output sum to {sum}, expected 1 ± {}",
                policy.percentage_tolerance
            ),
        ));
    }
    Ok(())
}
