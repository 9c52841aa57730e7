use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tk_table::SizeSymbol;
use tk_types::StatPath;
use tracing::info;

use crate::HarnessError;

/// Environment variable used to preload the memory profiling library into
/// every spawned engine process.
pub const PRELOAD_ENV: &str = "LD_PRELOAD";

/// Where and how a sweep runs.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub result_root: PathBuf,
    pub tmp_dir: PathBuf,
    pub runs: usize,
    pub ks: Vec<u64>,
    pub max_processes: usize,
    pub preload_library: Option<PathBuf>,
    pub extra_env: Vec<(String, String)>,
    pub stop_on_first_failure: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        Self {
            result_root: repo_root.join("results"),
            tmp_dir: repo_root.join("tmp"),
            runs: 3,
            ks: vec![1, 10, 100],
            max_processes: 1,
            preload_library: None,
            extra_env: Vec::new(),
            stop_on_first_failure: false,
        }
    }

    /// `<result_root>/<YYYYmmdd_HHMMSS>-<name>`
    #[must_use]
    pub fn result_dir_at(&self, name: &str, at: DateTime<Local>) -> PathBuf {
        self.result_root
            .join(format!("{}-{name}", at.format("%Y%m%d_%H%M%S")))
    }

    /// Creates a fresh timestamped result directory for `name`.
    pub fn create_result_dir(&self, name: &str) -> Result<PathBuf, HarnessError> {
        let dir = self.result_dir_at(name, Local::now());
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn check_preload_library(&self) -> Result<(), HarnessError> {
        match &self.preload_library {
            Some(path) if !path.exists() => Err(HarnessError::PreloadLibraryMissing(path.clone())),
            _ => Ok(()),
        }
    }

    pub fn log_summary(&self, executable: &ExecutableSpec) {
        info!(
            executable = %executable.name,
            command = %executable.command.join(" "),
            tmp_dir = %self.tmp_dir.display(),
            result_root = %self.result_root.display(),
            runs = self.runs,
            ks = ?self.ks,
            max_processes = self.max_processes,
            preload = ?self.preload_library,
            "sweep configuration"
        );
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

/// A named engine command, written `NAME:command args` on the command line.
/// Without a `NAME:` prefix the whole string doubles as the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableSpec {
    pub name: String,
    pub command: Vec<String>,
}

impl ExecutableSpec {
    pub fn parse(spec: &str) -> Result<Self, HarnessError> {
        let (name, command) = spec.split_once(':').unwrap_or((spec, spec));
        let name = name.trim();
        let command: Vec<String> = command.split_whitespace().map(str::to_owned).collect();
        if name.is_empty() || command.is_empty() {
            return Err(HarnessError::InvalidExecutable(spec.to_owned()));
        }
        Ok(Self {
            name: name.to_owned(),
            command,
        })
    }

    #[must_use]
    pub fn program(&self) -> &str {
        self.command.first().map_or("", String::as_str)
    }

    /// Copies the program into `tmp_dir` so rebuilding it mid-sweep cannot
    /// change what is measured, and points the command at the copy.
    pub fn stage(&self, tmp_dir: &Path) -> Result<Self, HarnessError> {
        fs::create_dir_all(tmp_dir)?;
        let staged = tmp_dir.join(format!("executable-{}", self.name));
        fs::copy(self.program(), &staged)?;
        let mut command = self.command.clone();
        if let Some(program) = command.first_mut() {
            *program = staged.to_string_lossy().into_owned();
        }
        Ok(Self {
            name: self.name.clone(),
            command,
        })
    }
}

/// Which statistics are averaged and tabulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Groups read from the stdout JSON `statistics` object.
    pub base_layers: Vec<StatPath>,
    /// Per-round groups, tabulated round by round.
    pub round_layers: Vec<StatPath>,
    /// Labels scanned in plain-text stderr.
    pub text_layers: Vec<StatPath>,
    pub symbols: Vec<SizeSymbol>,
    /// Only tables whose statistic key equals one of these are written.
    /// Empty keeps everything.
    pub keep_prefixes: Vec<String>,
    /// Stdout lines such as `Filtering time (in ms): 12` averaged per
    /// instance, keyed by their leading text.
    pub prefixed_values: Vec<String>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            base_layers: vec![
                StatPath::new(["index"]),
                StatPath::new(["filter", "global"]),
            ],
            round_layers: vec![StatPath::new(["filter", "rounds"])],
            text_layers: vec![StatPath::new(["heap peak"])],
            symbols: vec![
                SizeSymbol::new(82.09, "TB"),
                SizeSymbol::new(111.12, "XMark1"),
                SizeSymbol::new(222.9, "XMark2"),
                SizeSymbol::new(446.71, "XMark4"),
                SizeSymbol::new(895.03, "XMark8"),
                SizeSymbol::new(1791.0, "XMark16"),
                SizeSymbol::new(2161.17, "DBLP"),
                SizeSymbol::new(6137.29, "SP"),
            ],
            keep_prefixes: [
                "heap",
                "timingfiltering",
                "timingdelete",
                "timingrename",
                "timingtotal",
                "timingindexing",
                "verificationstotal",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            prefixed_values: Vec::new(),
        }
    }
}

impl ReportConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, HarnessError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    /// Layers averaged over stdout: base groups followed by round groups.
    #[must_use]
    pub fn stdout_layers(&self) -> Vec<StatPath> {
        self.base_layers
            .iter()
            .chain(&self.round_layers)
            .cloned()
            .collect()
    }

    /// Layers tabulated across the base pivots, including the stderr groups.
    #[must_use]
    pub fn table_layers(&self) -> Vec<StatPath> {
        self.base_layers
            .iter()
            .chain(&self.text_layers)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn keeps(&self, stat_prefix: &str) -> bool {
        self.keep_prefixes.is_empty()
            || self
                .keep_prefixes
                .iter()
                .any(|prefix| prefix == stat_prefix)
    }
}
