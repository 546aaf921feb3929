//! Model families and the invocation contract of each.
//!
//! | family   | signal input          | state inputs                       | state shape      |
//! |----------|-----------------------|------------------------------------|------------------|
//! | `silero` | `x` `[1, 512]`        | `h`, `c`                           | 2 x `[2, 1, 64]` |
//! | `ten`    | `input_1` `[1, 3, 41]`| `input_2`, `input_3`, `input_6`, `input_7` | 4 x `[1, 64]` |
//!
//! Outputs are read in graph order: the speech probability first, then the next
//! recurrent state tensors in the same order as the state inputs.

use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;

const SILERO_STATE: &[&[usize]] = &[&[2, 1, 64], &[2, 1, 64]];
const TEN_STATE: &[&[usize]] = &[&[1, 64], &[1, 64], &[1, 64], &[1, 64]];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    /// LSTM hidden/cell pair over the raw 512-sample waveform.
    Silero,
    /// Four-tensor recurrent cell bank over the `[3, 41]` feature tensor.
    Ten,
}

impl ModelFamily {
    /// Shapes of the recurrent state tensors, in input order.
    pub fn state_shapes(&self) -> &'static [&'static [usize]] {
        match self {
            ModelFamily::Silero => SILERO_STATE,
            ModelFamily::Ten => TEN_STATE,
        }
    }

    pub fn signal_input(&self) -> &'static str {
        match self {
            ModelFamily::Silero => "x",
            ModelFamily::Ten => "input_1",
        }
    }

    pub fn state_inputs(&self) -> &'static [&'static str] {
        match self {
            ModelFamily::Silero => &["h", "c"],
            ModelFamily::Ten => &["input_2", "input_3", "input_6", "input_7"],
        }
    }

    /// Whether the model consumes engineered features instead of the waveform.
    pub fn needs_features(&self) -> bool {
        matches!(self, ModelFamily::Ten)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Silero => "silero",
            ModelFamily::Ten => "ten",
        }
    }
}

impl FromStr for ModelFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silero" | "silero-vad" | "silero_vad" => Ok(ModelFamily::Silero),
            "ten" | "ten-vad" | "ten_vad" => Ok(ModelFamily::Ten),
            other => Err(anyhow!("Unknown model family: {} (expected \"silero\" or \"ten\")", other)),
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_family() {
        assert_eq!("silero".parse::<ModelFamily>().unwrap(), ModelFamily::Silero);
        assert_eq!("TEN-VAD".parse::<ModelFamily>().unwrap(), ModelFamily::Ten);
        assert!("whisper".parse::<ModelFamily>().is_err());
    }

    #[test]
    fn test_state_inputs_match_shapes() {
        for family in [ModelFamily::Silero, ModelFamily::Ten] {
            assert_eq!(family.state_inputs().len(), family.state_shapes().len());
        }
        assert!(ModelFamily::Ten.needs_features());
        assert!(!ModelFamily::Silero.needs_features());
    }
}
