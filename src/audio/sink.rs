//! PulseAudio null sink lifecycle
//!
//! Applications play into the null sink; its monitor source is what gets
//! broadcast. The sink is loaded with `pactl load-module module-null-sink`
//! and unloaded exactly once, on `close()` or on drop.

use std::collections::BTreeMap;
use std::process::Command;

use crate::error::SourceError;

/// A `module-null-sink` instance owned by this process
#[derive(Debug)]
pub struct NullSink {
    pub name: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub use_system_clock_for_timing: bool,
    properties: BTreeMap<String, String>,
    module_index: Option<u32>,
}

impl NullSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sample_rate: None,
            channels: None,
            use_system_clock_for_timing: false,
            properties: BTreeMap::new(),
            module_index: None,
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn is_open(&self) -> bool {
        self.module_index.is_some()
    }

    /// Arguments passed to `pactl`
    pub fn load_args(&self) -> Result<Vec<String>, SourceError> {
        if self.name.is_empty() {
            return Err(SourceError::Unavailable("sink name is required".to_string()));
        }

        let mut args = vec![
            "load-module".to_string(),
            "module-null-sink".to_string(),
            format!("sink_name={}", self.name),
        ];
        if let Some(rate) = self.sample_rate.filter(|r| *r > 0) {
            args.push(format!("rate={}", rate));
        }
        if let Some(channels) = self.channels.filter(|c| *c > 0) {
            args.push(format!("channels={}", channels));
        }
        if self.use_system_clock_for_timing {
            args.push("use_system_clock_for_timing=yes".to_string());
        }
        if !self.properties.is_empty() {
            let props: Vec<String> = self
                .properties
                .iter()
                .map(|(k, v)| format!("{}='{}'", k, v))
                .collect();
            args.push(format!("sink_properties={}", props.join(" ")));
        }
        Ok(args)
    }

    /// Load the sink module
    pub fn open(&mut self) -> Result<(), SourceError> {
        if self.is_open() {
            return Ok(());
        }

        let args = self.load_args()?;
        tracing::debug!(?args, "pactl");
        let output = Command::new("pactl")
            .args(&args)
            .output()
            .map_err(|e| SourceError::Unavailable(format!("failed to run pactl: {}", e)))?;

        if !output.status.success() {
            return Err(SourceError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let index = parse_module_index(&String::from_utf8_lossy(&output.stdout))?;
        tracing::info!(sink = %self.name, module = index, "Loaded null sink");
        self.module_index = Some(index);
        Ok(())
    }

    /// Unload the sink module. Closing a sink that is not open does nothing.
    pub fn close(&mut self) -> Result<(), SourceError> {
        let Some(index) = self.module_index.take() else {
            return Ok(());
        };

        let output = Command::new("pactl")
            .args(["unload-module", &index.to_string()])
            .output()
            .map_err(|e| SourceError::Unavailable(format!("failed to run pactl: {}", e)))?;

        if !output.status.success() {
            return Err(SourceError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        tracing::info!(sink = %self.name, module = index, "Unloaded null sink");
        Ok(())
    }
}

impl Drop for NullSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to unload null sink {}: {}", self.name, e);
        }
    }
}

fn parse_module_index(stdout: &str) -> Result<u32, SourceError> {
    stdout
        .trim()
        .parse()
        .map_err(|_| SourceError::Unavailable(format!("unexpected pactl output: {:?}", stdout)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_args() {
        let mut sink = NullSink::new("PACC");
        sink.sample_rate = Some(44100);
        sink.channels = Some(2);
        sink.use_system_clock_for_timing = true;
        sink.set_property("device.description", "PACC Output");

        let args = sink.load_args().unwrap();
        assert_eq!(
            args,
            vec![
                "load-module",
                "module-null-sink",
                "sink_name=PACC",
                "rate=44100",
                "channels=2",
                "use_system_clock_for_timing=yes",
                "sink_properties=device.description='PACC Output'",
            ]
        );
        assert_eq!(sink.property("device.description"), Some("PACC Output"));
    }

    #[test]
    fn test_name_required() {
        let sink = NullSink::new("");
        assert!(matches!(sink.load_args(), Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn test_parse_module_index() {
        assert_eq!(parse_module_index("27\n").unwrap(), 27);
        assert!(parse_module_index("Failure: Module initialization failed").is_err());
    }

    #[test]
    fn test_close_unopened_is_noop() {
        let mut sink = NullSink::new("PACC");
        assert!(!sink.is_open());
        assert!(sink.close().is_ok());
    }
}
