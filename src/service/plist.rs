//! LaunchAgent plist for starting selfcontrol at login (macOS).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{Result, ServiceError};

/// LaunchAgent plist structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelfControlLaunchAgent {
    /// Service label (reverse domain format)
    #[serde(rename = "Label")]
    pub label: String,

    /// Program to execute with its arguments
    #[serde(rename = "ProgramArguments")]
    pub program_arguments: Vec<String>,

    /// Whether to start at login
    #[serde(rename = "RunAtLoad")]
    pub run_at_load: bool,

    /// Whether launchd restarts the process when it exits
    #[serde(rename = "KeepAlive")]
    pub keep_alive: bool,

    /// Path to stdout log file
    #[serde(rename = "StandardOutPath")]
    pub standard_out_path: String,

    /// Path to stderr log file
    #[serde(rename = "StandardErrorPath")]
    pub standard_error_path: String,

    /// Environment variables
    #[serde(rename = "EnvironmentVariables")]
    pub environment_variables: BTreeMap<String, String>,
}

impl SelfControlLaunchAgent {
    /// Service label.
    pub const LABEL: &'static str = "com.selfcontrol.startup";

    /// Creates a LaunchAgent that runs `binary_path` in startup mode.
    ///
    /// The process exits on its own once resumed blocks end, so launchd
    /// must not restart it.
    pub fn new(binary_path: impl Into<String>, log_path: impl Into<String>) -> Self {
        let log_path = log_path.into();
        Self {
            label: Self::LABEL.to_string(),
            program_arguments: vec![binary_path.into()],
            run_at_load: true,
            keep_alive: false,
            standard_out_path: log_path.clone(),
            standard_error_path: log_path,
            environment_variables: BTreeMap::new(),
        }
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }

    /// Generates the plist XML string.
    pub fn to_xml(&self) -> Result<String> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, self).map_err(ServiceError::PlistSerialize)?;
        String::from_utf8(buf).map_err(ServiceError::PlistUtf8)
    }
}
