//! Device participants: roles, transports, tuning, and command building.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default device-control program for HackRF boards.
pub const DEFAULT_DEVICE_PROGRAM: &str = "hackrf_transfer";

/// Role a radio plays in a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Rx1,
    Rx2,
    Tx,
}

impl DeviceRole {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceRole::Rx1 => "rx1",
            DeviceRole::Rx2 => "rx2",
            DeviceRole::Tx => "tx",
        }
    }

    pub fn is_receiver(&self) -> bool {
        matches!(self, DeviceRole::Rx1 | DeviceRole::Rx2)
    }

    /// Per-device log filename inside the run directory.
    pub fn log_filename(&self) -> String {
        format!("{}.log", self.name())
    }
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How the device-control process is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    /// Direct process launch on this host.
    Local,
    /// Launch through `ssh user@host`.
    Remote {
        host: String,
        user: String,
        /// Optional SSH identity file (`-i`). Never persisted contents, only the path.
        #[serde(skip_serializing_if = "Option::is_none")]
        identity_file: Option<PathBuf>,
    },
}

impl Transport {
    pub fn is_remote(&self) -> bool {
        matches!(self, Transport::Remote { .. })
    }
}

/// RF tuning and gain knobs passed to the device program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tuning {
    /// Center frequency (Hz).
    pub freq_hz: u64,
    /// Sample rate (Hz).
    pub sample_rate_hz: u64,
    /// Fixed capture length in samples.
    pub num_samples: u64,
    /// RX LNA gain (dB).
    pub lna_db: u32,
    /// RX VGA gain (dB).
    pub vga_db: u32,
    /// TX VGA gain (dB).
    pub txvga_db: u32,
    /// Enable the RF amplifier.
    pub rf_amp: bool,
    /// Enable antenna port power (bias tee).
    pub antenna_power: bool,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            freq_hz: 520_000_000,
            sample_rate_hz: 20_000_000,
            num_samples: 7_000,
            lna_db: 32,
            vga_db: 32,
            txvga_db: 45,
            rf_amp: true,
            antenna_power: false,
        }
    }
}

/// Immutable description of one radio participant in a run.
///
/// Two specs with the same role may not coexist in one plan; the run plan
/// validates that at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSpec {
    pub role: DeviceRole,
    pub transport: Transport,
    /// Device serial passed as `-d`. None lets the driver pick any board.
    pub selector: Option<String>,
    pub tuning: Tuning,
    /// Disabled devices are launched by nobody and excluded from gating
    /// and status computation.
    pub enabled: bool,
    /// Device-control program name.
    pub program: String,
    /// Artifact filename inside the run directory (receivers).
    pub output_name: Option<String>,
    /// Capture path on the remote host (remote receivers).
    pub remote_outfile: Option<PathBuf>,
    /// TX waveform file (transmitter).
    pub pulse_path: Option<PathBuf>,
    /// Raw command line override; bypasses the argv builder entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command_override: Option<Vec<String>>,
}

impl DeviceSpec {
    /// A receiver spec with the standard capture argv.
    pub fn receiver(role: DeviceRole, transport: Transport, selector: Option<String>, tuning: Tuning) -> Self {
        let output_name = match role {
            DeviceRole::Rx1 => "capture_1.iq",
            DeviceRole::Rx2 => "capture_2.iq",
            DeviceRole::Tx => "capture_tx.iq",
        };
        Self {
            role,
            transport,
            selector,
            tuning,
            enabled: true,
            program: DEFAULT_DEVICE_PROGRAM.to_string(),
            output_name: Some(output_name.to_string()),
            remote_outfile: None,
            pulse_path: None,
            command_override: None,
        }
    }

    /// The transmitter spec: replays a waveform file once.
    pub fn transmitter(transport: Transport, selector: Option<String>, tuning: Tuning, pulse_path: PathBuf) -> Self {
        Self {
            role: DeviceRole::Tx,
            transport,
            selector,
            tuning,
            enabled: true,
            program: DEFAULT_DEVICE_PROGRAM.to_string(),
            output_name: None,
            remote_outfile: None,
            pulse_path: Some(pulse_path),
            command_override: None,
        }
    }

    /// A spec that runs an arbitrary command line in place of the device
    /// program. Used by tests and by non-HackRF device wrappers.
    pub fn custom(role: DeviceRole, command: Vec<String>) -> Self {
        Self {
            role,
            transport: Transport::Local,
            selector: None,
            tuning: Tuning::default(),
            enabled: true,
            program: command.first().cloned().unwrap_or_default(),
            output_name: None,
            remote_outfile: None,
            pulse_path: None,
            command_override: Some(command),
        }
    }

    /// Mark this device administratively disabled for the run.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_remote_outfile(mut self, path: PathBuf) -> Self {
        self.remote_outfile = Some(path);
        self
    }

    /// Capture output path as seen by the device process.
    fn capture_path(&self, run_dir: &Path) -> Option<PathBuf> {
        if self.transport.is_remote() {
            self.remote_outfile
                .clone()
                .or_else(|| self.output_name.as_ref().map(PathBuf::from))
        } else {
            self.output_name.as_ref().map(|name| run_dir.join(name))
        }
    }

    /// Artifact paths this device is expected to produce, as recorded
    /// before any retrieval stage runs.
    pub fn expected_artifacts(&self, run_dir: &Path) -> Vec<PathBuf> {
        if self.role.is_receiver() {
            self.capture_path(run_dir).into_iter().collect()
        } else {
            Vec::new()
        }
    }

    /// Build the device-control argv for this role.
    ///
    /// `hw_trigger` appends `-H` so receivers arm and wait for the hardware
    /// trigger line instead of free-running.
    pub fn command(&self, run_dir: &Path, hw_trigger: bool) -> Vec<String> {
        if let Some(cmd) = &self.command_override {
            return cmd.clone();
        }

        let mut cmd = vec![self.program.clone()];
        if let Some(serial) = &self.selector {
            cmd.push("-d".to_string());
            cmd.push(serial.clone());
        }

        match self.role {
            DeviceRole::Rx1 | DeviceRole::Rx2 => {
                if let Some(out) = self.capture_path(run_dir) {
                    cmd.push("-r".to_string());
                    cmd.push(out.to_string_lossy().into_owned());
                }
                cmd.push("-n".to_string());
                cmd.push(self.tuning.num_samples.to_string());
                cmd.push("-f".to_string());
                cmd.push(self.tuning.freq_hz.to_string());
                cmd.push("-s".to_string());
                cmd.push(self.tuning.sample_rate_hz.to_string());
                cmd.push("-l".to_string());
                cmd.push(self.tuning.lna_db.to_string());
                cmd.push("-g".to_string());
                cmd.push(self.tuning.vga_db.to_string());
                if hw_trigger {
                    cmd.push("-H".to_string());
                }
            }
            DeviceRole::Tx => {
                if let Some(pulse) = &self.pulse_path {
                    cmd.push("-t".to_string());
                    cmd.push(pulse.to_string_lossy().into_owned());
                }
                cmd.push("-f".to_string());
                cmd.push(self.tuning.freq_hz.to_string());
                cmd.push("-s".to_string());
                cmd.push(self.tuning.sample_rate_hz.to_string());
                cmd.push("-x".to_string());
                cmd.push(self.tuning.txvga_db.to_string());
                cmd.push("-a".to_string());
                cmd.push(if self.tuning.rf_amp { "1" } else { "0" }.to_string());
                cmd.push("-p".to_string());
                cmd.push(if self.tuning.antenna_power { "1" } else { "0" }.to_string());
            }
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiver_command_has_capture_flags() {
        let spec = DeviceSpec::receiver(
            DeviceRole::Rx1,
            Transport::Local,
            Some("0000aaaa".to_string()),
            Tuning::default(),
        );
        let cmd = spec.command(Path::new("/tmp/run_0001"), true);

        assert_eq!(cmd[0], "hackrf_transfer");
        assert!(cmd.contains(&"-r".to_string()));
        assert!(cmd.contains(&"/tmp/run_0001/capture_1.iq".to_string()));
        assert!(cmd.contains(&"-d".to_string()));
        assert!(cmd.contains(&"0000aaaa".to_string()));
        assert!(cmd.contains(&"-n".to_string()));
        assert!(cmd.contains(&"7000".to_string()));
        assert!(cmd.contains(&"-H".to_string()));
    }

    #[test]
    fn receiver_command_without_hw_trigger() {
        let spec = DeviceSpec::receiver(DeviceRole::Rx2, Transport::Local, None, Tuning::default());
        let cmd = spec.command(Path::new("/tmp/run_0001"), false);
        assert!(!cmd.contains(&"-H".to_string()));
        assert!(!cmd.contains(&"-d".to_string()));
        assert!(cmd.contains(&"/tmp/run_0001/capture_2.iq".to_string()));
    }

    #[test]
    fn transmitter_command_replays_pulse() {
        let spec = DeviceSpec::transmitter(
            Transport::Local,
            None,
            Tuning::default(),
            PathBuf::from("/opt/waveforms/pilot.iq"),
        );
        let cmd = spec.command(Path::new("/tmp/run_0001"), true);
        assert!(cmd.contains(&"-t".to_string()));
        assert!(cmd.contains(&"/opt/waveforms/pilot.iq".to_string()));
        assert!(cmd.contains(&"-x".to_string()));
        assert!(cmd.contains(&"45".to_string()));
        assert!(cmd.contains(&"-a".to_string()));
        // TX never takes the hardware trigger flag.
        assert!(!cmd.contains(&"-H".to_string()));
    }

    #[test]
    fn remote_receiver_uses_remote_outfile() {
        let spec = DeviceSpec::receiver(
            DeviceRole::Rx1,
            Transport::Remote {
                host: "10.0.0.5".to_string(),
                user: "pi1".to_string(),
                identity_file: None,
            },
            None,
            Tuning::default(),
        )
        .with_remote_outfile(PathBuf::from("/home/pi1/capture_1.iq"));

        let cmd = spec.command(Path::new("/tmp/run_0001"), false);
        assert!(cmd.contains(&"/home/pi1/capture_1.iq".to_string()));
        assert!(!cmd.iter().any(|a| a.starts_with("/tmp/run_0001")));
    }

    #[test]
    fn custom_command_passthrough() {
        let spec = DeviceSpec::custom(
            DeviceRole::Rx1,
            vec!["sh".to_string(), "-c".to_string(), "echo armed".to_string()],
        );
        let cmd = spec.command(Path::new("/anywhere"), true);
        assert_eq!(cmd, vec!["sh", "-c", "echo armed"]);
    }

    #[test]
    fn disabled_spec_keeps_fields() {
        let spec = DeviceSpec::receiver(DeviceRole::Rx2, Transport::Local, None, Tuning::default()).disabled();
        assert!(!spec.enabled);
        assert_eq!(spec.role, DeviceRole::Rx2);
    }

    #[test]
    fn spec_serde_roundtrip() {
        let spec = DeviceSpec::receiver(
            DeviceRole::Rx1,
            Transport::Remote {
                host: "host".to_string(),
                user: "user".to_string(),
                identity_file: Some(PathBuf::from("/keys/id_ed25519")),
            },
            Some("serial".to_string()),
            Tuning::default(),
        );
        let json = serde_json::to_string(&spec).expect("serialize");
        let back: DeviceSpec = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(spec, back);
    }
}
