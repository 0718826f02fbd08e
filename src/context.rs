use burn::backend::libtorch::LibTorchDevice;
use log::debug;

use crate::{cli, config::Config, utils::env::Credentials};

/// Explicit per-run state handed to every component instead of process-wide globals
#[derive(Clone, Debug)]
pub struct RunContext {
    /// Device selected once at startup
    pub device: LibTorchDevice,

    /// Debug output enabled
    pub debug: bool,

    /// Random seed for every seeded operation in the run
    pub seed: u64,

    /// Credentials loaded from the `.env` file
    pub credentials: Credentials,
}

impl RunContext {
    /// Build the context from the loaded configuration. Console logging is
    /// set up from the debug flag before the credentials are read, so their
    /// warnings are visible.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut context = Self {
            device: select_device(&config.device)?,
            debug: config.debug,
            seed: config.seed,
            credentials: Credentials::default(),
        };

        cli::init_logging(context.debug);
        debug!("DEVICE : {:?}", context.device);

        context.credentials = Credentials::load(&config.env_file);

        Ok(context)
    }

    /// Seed LibTorch's global generators
    pub fn seed_backend(&self) {
        tch::manual_seed(self.seed as i64);
    }
}

/// Resolve a device preference, preferring CUDA when "auto" and available
pub fn select_device(preference: &str) -> anyhow::Result<LibTorchDevice> {
    match preference.to_lowercase().as_str() {
        "auto" => {
            if tch::Cuda::is_available() {
                Ok(LibTorchDevice::Cuda(0))
            } else {
                Ok(LibTorchDevice::Cpu)
            }
        }
        "cuda" | "gpu" => Ok(LibTorchDevice::Cuda(0)),
        "cpu" => Ok(LibTorchDevice::Cpu),
        other => Err(anyhow!("Unsupported device: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn carries_the_run_settings() {
        let config = Config::from_yaml_str(
            "\
seed: 7
debug: true
device: cpu
env_file: does/not/exist/.env
data:
  train_name: train
  output_dir: out
  test_size: 0.2
  max_length: 16
train:
  train_batch_size: 4
  eval_batch_size: 4
  lr: 0.00005
model: {}
exp:
  username: me
tracking:
  project: p
  entity: e
",
        )
        .unwrap();

        let context = RunContext::new(&config).unwrap();

        assert!(context.debug);
        assert_eq!(context.seed, 7);
        assert_eq!(context.device, LibTorchDevice::Cpu);
    }

    #[test]
    fn rejects_unknown_devices() {
        assert!(select_device("tpu").is_err());
        assert_eq!(select_device("CPU").unwrap(), LibTorchDevice::Cpu);
    }
}
