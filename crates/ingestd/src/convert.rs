use models::SensorKind;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A registered converter: the opaque executable for one sensor kind plus its
/// invocation shape. Adding or tuning a converter is a data-only change, via
/// the registry config file.
#[derive(Debug, Clone)]
pub struct Converter {
    pub sensor: SensorKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// JSON parameter blob appended as a final argument; only the 4D NeXus
    /// pipeline takes one.
    pub extra_params: Option<serde_json::Value>,
}

impl Converter {
    /// Build the subprocess invocation: program, fixed args, input dir,
    /// output dir, and the serialized parameter blob when present.
    pub fn command(&self, input_dir: &Path, output_dir: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).arg(input_dir).arg(output_dir);
        if let Some(params) = &self.extra_params {
            cmd.arg(params.to_string());
        }
        cmd
    }
}

// One entry of the registry config file.
#[derive(Debug, Deserialize)]
struct ConverterConfig {
    sensor: SensorKind,
    program: String,
    #[serde(default)]
    args: Vec<String>,
    timeout_minutes: u64,
    #[serde(default)]
    extra_params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    by_sensor: HashMap<SensorKind, Converter>,
}

const DEFAULT_TIMEOUT_MINUTES: u64 = 120;

impl Registry {
    /// The built-in table: every concrete sensor kind maps to the generic
    /// `dataset_conversion` tool, except 4D NeXus which has its own pipeline
    /// with a parameter blob and a longer deadline. `OTHER` is deliberately
    /// unregistered; claiming one records `conversion_failed`.
    pub fn with_defaults(bin_dir: &Path) -> Registry {
        let mut registry = Registry::default();
        for &sensor in SensorKind::ALL {
            match sensor {
                SensorKind::Other => continue,
                SensorKind::FourDNexus => registry.register(Converter {
                    sensor,
                    program: bin_dir.join("nexus_conversion"),
                    args: Vec::new(),
                    timeout: Duration::from_secs(240 * 60),
                    extra_params: Some(serde_json::json!({})),
                }),
                _ => registry.register(Converter {
                    sensor,
                    program: bin_dir.join("dataset_conversion"),
                    args: vec![sensor.as_str().to_string()],
                    timeout: Duration::from_secs(DEFAULT_TIMEOUT_MINUTES * 60),
                    extra_params: None,
                }),
            }
        }
        registry
    }

    /// Load the registry from a JSON array of converter entries, replacing
    /// the defaults wholesale.
    pub fn from_config(path: &Path) -> anyhow::Result<Registry> {
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<ConverterConfig> = serde_json::from_str(&raw)?;

        let mut registry = Registry::default();
        for entry in entries {
            registry.register(Converter {
                sensor: entry.sensor,
                program: PathBuf::from(entry.program),
                args: entry.args,
                timeout: Duration::from_secs(entry.timeout_minutes * 60),
                extra_params: entry.extra_params,
            });
        }
        Ok(registry)
    }

    pub fn from_converters(converters: impl IntoIterator<Item = Converter>) -> Registry {
        let mut registry = Registry::default();
        for converter in converters {
            registry.register(converter);
        }
        registry
    }

    pub fn register(&mut self, converter: Converter) {
        self.by_sensor.insert(converter.sensor, converter);
    }

    pub fn get(&self, sensor: SensorKind) -> Option<&Converter> {
        self.by_sensor.get(&sensor)
    }

    /// The longest registered timeout; the stale-claim threshold must exceed
    /// it.
    pub fn max_timeout(&self) -> Duration {
        self.by_sensor
            .values()
            .map(|c| c.timeout)
            .max()
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_MINUTES * 60))
    }
}
