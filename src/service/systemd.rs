//! systemd unit for starting selfcontrol at boot (Linux).

use std::fmt::Write as _;

/// A system service unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemdUnit {
    /// `Description=` line
    pub description: String,
    /// Absolute path of the binary
    pub exec_start: String,
    /// `Environment=` assignments in order
    pub environment: Vec<(String, String)>,
    /// `WantedBy=` target
    pub wanted_by: String,
}

impl SystemdUnit {
    /// Unit file name.
    pub const NAME: &'static str = "selfcontrol.service";

    /// Creates a unit that runs `binary_path` when the system boots.
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            description: "Selfcontrol website blocker".to_string(),
            exec_start: binary_path.into(),
            environment: Vec::new(),
            wanted_by: "multi-user.target".to_string(),
        }
    }

    /// Adds an environment assignment.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    /// Renders the unit file.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[Unit]\n");
        let _ = writeln!(out, "Description={}", self.description);
        out.push_str("\n[Service]\n");
        out.push_str("Type=simple\n");
        let _ = writeln!(out, "ExecStart=\"{}\"", self.exec_start);
        for (key, value) in &self.environment {
            let _ = writeln!(out, "Environment=\"{key}={value}\"");
        }
        out.push_str("\n[Install]\n");
        let _ = writeln!(out, "WantedBy={}", self.wanted_by);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_startup_unit() {
        let unit = SystemdUnit::new("/usr/local/bin/selfcontrol")
            .with_env("SELFCONTROL_STARTUP", "1")
            .with_env("SELFCONTROL_HOME", "/home/me/.selfcontrol");

        assert_eq!(
            unit.render(),
            "[Unit]\n\
             Description=Selfcontrol website blocker\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart=\"/usr/local/bin/selfcontrol\"\n\
             Environment=\"SELFCONTROL_STARTUP=1\"\n\
             Environment=\"SELFCONTROL_HOME=/home/me/.selfcontrol\"\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n"
        );
    }

    #[test]
    fn test_unit_name() {
        assert_eq!(SystemdUnit::NAME, "selfcontrol.service");
    }
}
