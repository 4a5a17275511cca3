/// Virtual display sessions: turn `[[display]]` entries into the watchdog
/// request that runs a maximised xterm on its own Xvfb server.
use crate::config::{DisplayConfig, PathsConfig};
use crate::data_dir::DataDir;
use crate::request::SupervisionRequest;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Lowest display number handed out automatically.
pub const FIRST_DISPLAY: u32 = 99;

/// Process that owns a display; the watchdog locates and kills it by this name.
pub const KILL_TARGET: &str = "Xvfb";

const DEFAULT_FONT: &str = "Default";

#[cfg(target_os = "macos")]
const PLATFORM_PATHS: &[&str] = &[
    "/usr/local/opt/gnu-getopt/bin",
    "/opt/homebrew/opt/gnu-getopt/bin",
    "/opt/X11/bin",
];
#[cfg(not(target_os = "macos"))]
const PLATFORM_PATHS: &[&str] = &[];

/// Errors from validating a `[[display]]` entry.
#[derive(Debug, PartialEq, Eq)]
pub enum DisplayError {
    MissingExe,
    BadDimensions { value: String },
    DuplicateDisplay { display_num: u32 },
}

impl std::fmt::Display for DisplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisplayError::MissingExe => write!(f, "no executable configured"),
            DisplayError::BadDimensions { value } => {
                write!(f, "dimensions {:?} are not WIDTHxHEIGHT", value)
            }
            DisplayError::DuplicateDisplay { display_num } => {
                write!(f, "display {} is configured more than once", display_num)
            }
        }
    }
}

impl std::error::Error for DisplayError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl std::str::FromStr for Dimensions {
    type Err = DisplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DisplayError::BadDimensions {
            value: s.to_string(),
        };
        let (w, h) = s.trim().split_once('x').ok_or_else(bad)?;
        let width: u32 = w.parse().map_err(|_| bad())?;
        let height: u32 = h.parse().map_err(|_| bad())?;
        if width == 0 || height == 0 {
            return Err(bad());
        }
        Ok(Self { width, height })
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A validated display entry with its display number assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySession {
    pub display_num: u32,
    pub dimensions: Dimensions,
    pub exe: String,
    pub args: String,
    pub font: String,
}

impl DisplaySession {
    /// Name used in logs, e.g. `Xvfb 99`.
    pub fn label(&self) -> String {
        format!("{KILL_TARGET} {}", self.display_num)
    }

    /// `xvfb-run` invocation that starts the server and the terminal.
    pub fn command_line(&self, xvfb_run: &Path, xauth_prefix: &Path) -> String {
        let n = self.display_num;
        let mut parts = vec![
            xvfb_run.display().to_string(),
            format!("-n {n}"),
            format!("-s '-screen 0 {}x24'", self.dimensions),
            format!("-f {}{n}", xauth_prefix.display()),
            "xterm".to_string(),
        ];
        if !self.font.is_empty() && self.font != DEFAULT_FONT {
            parts.push(format!("-fa '{}'", self.font));
        }
        parts.push("-en UTF-8 -maximized".to_string());
        parts.push(format!("-e {}", self.exe));
        if !self.args.trim().is_empty() {
            parts.push(self.args.trim().to_string());
        }
        parts.join(" ")
    }

    /// Watchdog request for one run of this session.
    pub fn request(
        &self,
        paths: &PathsConfig,
        data_dir: &DataDir,
        heartbeat: Option<PathBuf>,
    ) -> SupervisionRequest {
        let inherited = std::env::var("PATH").unwrap_or_default();
        SupervisionRequest {
            command: self.command_line(&paths.xvfb_run, &data_dir.xauth_prefix()),
            env: session_env(&paths.extra_paths, &inherited, data_home()),
            kill_target: Some(KILL_TARGET.to_string()),
            session_id: Some(self.display_num.to_string()),
            heartbeat,
        }
    }
}

/// `$XDG_DATA_HOME`, else `~/.local/share`. Only set for sessions on Linux.
fn data_home() -> Option<String> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME") {
        return Some(dir.to_string_lossy().into_owned());
    }
    std::env::var_os("HOME").map(|home| {
        Path::new(&home)
            .join(".local/share")
            .to_string_lossy()
            .into_owned()
    })
}

/// Each entry in turn is prepended, so the last one ends up first.
fn compose_path(extra_paths: &[PathBuf], inherited: &str) -> String {
    let mut path = inherited.to_string();
    let platform = PLATFORM_PATHS.iter().map(PathBuf::from);
    for extra in platform.chain(extra_paths.iter().cloned()) {
        path = format!("{}:{}", extra.display(), path);
    }
    while path.ends_with(':') {
        path.pop();
    }
    path
}

/// Environment layered over the watchdog's own for a display session.
pub fn session_env(
    extra_paths: &[PathBuf],
    inherited_path: &str,
    data_home: Option<String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("LANG".to_string(), "en_US.UTF-8".to_string());
    env.insert("PATH".to_string(), compose_path(extra_paths, inherited_path));
    if let Some(dir) = data_home {
        env.insert("XDG_DATA_HOME".to_string(), dir);
    }
    env
}

/// Lowest display number from `FIRST_DISPLAY` up that is not in `used`.
pub fn next_display_num(used: &BTreeSet<u32>) -> u32 {
    (FIRST_DISPLAY..)
        .find(|n| !used.contains(n))
        .unwrap_or(FIRST_DISPLAY)
}

fn validate(entry: &DisplayConfig) -> Result<Dimensions, DisplayError> {
    if entry.exe.trim().is_empty() {
        return Err(DisplayError::MissingExe);
    }
    entry.dimensions.parse()
}

/// Validate the configured displays and assign numbers to those without one.
/// Invalid entries are logged and skipped.
pub fn resolve_sessions(entries: &[DisplayConfig]) -> Vec<DisplaySession> {
    let mut used: BTreeSet<u32> = BTreeSet::new();
    let mut sessions = Vec::new();
    let mut pending = Vec::new();

    // Explicit numbers are claimed first so automatic ones never collide.
    for (index, entry) in entries.iter().enumerate() {
        let dimensions = match validate(entry) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(index, error = %e, "skipping display");
                continue;
            }
        };
        match entry.display_num {
            Some(num) if !used.insert(num) => {
                let e = DisplayError::DuplicateDisplay { display_num: num };
                tracing::warn!(index, error = %e, "skipping display");
            }
            Some(num) => sessions.push((index, session(entry, num, dimensions))),
            None => pending.push((index, entry, dimensions)),
        }
    }
    for (index, entry, dimensions) in pending {
        let num = next_display_num(&used);
        used.insert(num);
        sessions.push((index, session(entry, num, dimensions)));
    }

    sessions.sort_by_key(|(index, _)| *index);
    sessions.into_iter().map(|(_, s)| s).collect()
}

fn session(entry: &DisplayConfig, display_num: u32, dimensions: Dimensions) -> DisplaySession {
    DisplaySession {
        display_num,
        dimensions,
        exe: entry.exe.trim().to_string(),
        args: entry.args.clone(),
        font: entry.font.clone(),
    }
}
