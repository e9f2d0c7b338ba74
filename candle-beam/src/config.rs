use std::path::Path;

use crate::error::{Error, Result};

pub const PAD_TOKEN_ID: u32 = 0;
pub const UNK_TOKEN_ID: u32 = 1;
pub const BOS_TOKEN_ID: u32 = 2;
pub const EOS_TOKEN_ID: u32 = 3;

fn default_max_steps() -> usize {
    100
}

fn default_bos_token_id() -> u32 {
    BOS_TOKEN_ID
}

fn default_eos_token_id() -> u32 {
    EOS_TOKEN_ID
}

fn default_pad_token_id() -> u32 {
    PAD_TOKEN_ID
}

/// Search parameters for [`crate::BeamSearchDecoder`].
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct BeamSearchConfig {
    /// Number of candidates kept per instance.
    pub beam_size: usize,
    /// Number of hypotheses returned per instance, at most `beam_size`.
    pub n_best: usize,
    /// Hard cap on the number of decoder invocations.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: u32,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,
}

impl BeamSearchConfig {
    pub fn new(beam_size: usize, n_best: usize) -> Result<Self> {
        let cfg = Self {
            beam_size,
            n_best,
            max_steps: default_max_steps(),
            bos_token_id: BOS_TOKEN_ID,
            eos_token_id: EOS_TOKEN_ID,
            pad_token_id: PAD_TOKEN_ID,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_special_tokens(mut self, bos: u32, eos: u32, pad: u32) -> Self {
        self.bos_token_id = bos;
        self.eos_token_id = eos;
        self.pad_token_id = pad;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.beam_size == 0 {
            return Err(Error::Config("beam_size must be positive".to_string()));
        }
        if self.n_best == 0 {
            return Err(Error::Config("n_best must be positive".to_string()));
        }
        if self.n_best > self.beam_size {
            return Err(Error::Config(format!(
                "n_best ({}) cannot exceed beam_size ({})",
                self.n_best, self.beam_size
            )));
        }
        if self.max_steps == 0 {
            return Err(Error::Config("max_steps must be positive".to_string()));
        }
        Ok(())
    }

    /// Reads a JSON config file, filling in defaults for the optional fields.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let cfg: Self = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{:?}: {e}", path.as_ref())))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_sizes() {
        assert!(BeamSearchConfig::new(0, 1).is_err());
        assert!(BeamSearchConfig::new(4, 0).is_err());
        assert!(matches!(
            BeamSearchConfig::new(2, 3),
            Err(Error::Config(_))
        ));
        let cfg = BeamSearchConfig::new(4, 4).unwrap().with_max_steps(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_defaults() {
        let cfg: BeamSearchConfig =
            serde_json::from_str(r#"{"beam_size": 5, "n_best": 2}"#).unwrap();
        assert_eq!(cfg.max_steps, 100);
        assert_eq!(cfg.bos_token_id, BOS_TOKEN_ID);
        assert_eq!(cfg.eos_token_id, EOS_TOKEN_ID);
        assert_eq!(cfg.pad_token_id, PAD_TOKEN_ID);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn json_file_is_validated() -> Result<()> {
        let path =
            std::env::temp_dir().join(format!("candle-beam-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"beam_size": 2, "n_best": 4}"#)?;
        let err = BeamSearchConfig::from_json_file(&path);
        std::fs::write(&path, r#"{"beam_size": 4, "n_best": 2, "max_steps": 20}"#)?;
        let cfg = BeamSearchConfig::from_json_file(&path);
        std::fs::remove_file(&path)?;
        assert!(matches!(err, Err(Error::Config(_))));
        assert_eq!(cfg?.max_steps, 20);
        Ok(())
    }
}
