//! Program descriptors.
//!
//! A [`Program`] is the immutable per-reload description of one supervised
//! unit: command line, environment, restart policy, stop behavior, and
//! log-capture settings. The config layer builds these (from whatever file
//! format it likes) and hands them to the supervisor; the core never reads
//! configuration files itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::tm::signals::parse_signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Never respawn after exit; terminal state is EXITED.
    Never,
    /// Respawn after every exit, expected or not.
    Always,
    /// Respawn only when the exit code is not in `exitcodes`.
    #[default]
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Program {
    pub name: String,
    /// Batch-operation bucket; defaults to the program's own name.
    #[serde(default)]
    pub group: Option<String>,
    /// Lower starts earlier in batch dispatch.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Instance number, only meaningful for `%(process_num)s` expansion.
    #[serde(default)]
    pub process_num: u32,

    /// Argv after shell-free tokenization. Must not be empty to spawn.
    pub command: Vec<String>,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub umask: Option<u32>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default)]
    pub autorestart: RestartPolicy,
    /// Minimum uptime (seconds) before a start counts as RUNNING.
    /// 0 means RUNNING as soon as the spawn succeeds.
    #[serde(default = "default_startsecs")]
    pub startsecs: u64,
    #[serde(default = "default_startretries")]
    pub startretries: u32,
    /// Exit codes considered expected.
    #[serde(default = "default_exitcodes")]
    pub exitcodes: Vec<i32>,

    /// Signals tried in order during a graceful stop.
    #[serde(default = "default_stopsignals")]
    pub stopsignals: Vec<String>,
    /// Total graceful-stop budget (seconds) before SIGKILL.
    #[serde(default = "default_stopwaitsecs")]
    pub stopwaitsecs: u64,
    #[serde(default)]
    pub stopasgroup: bool,
    /// Defaults to `stopasgroup` when unset: an escalated group stop must
    /// not orphan the group.
    #[serde(default)]
    pub killasgroup: Option<bool>,

    #[serde(default)]
    pub stdout_logfile: Option<PathBuf>,
    #[serde(default = "default_logfile_maxbytes")]
    pub stdout_logfile_maxbytes: u64,
    #[serde(default = "default_logfile_backups")]
    pub stdout_logfile_backups: usize,
    #[serde(default)]
    pub stdout_events_enabled: bool,
    /// 0 disables capture mode on this stream.
    #[serde(default)]
    pub stdout_capture_maxbytes: u64,

    #[serde(default)]
    pub stderr_logfile: Option<PathBuf>,
    #[serde(default = "default_logfile_maxbytes")]
    pub stderr_logfile_maxbytes: u64,
    #[serde(default = "default_logfile_backups")]
    pub stderr_logfile_backups: usize,
    #[serde(default)]
    pub stderr_events_enabled: bool,
    #[serde(default)]
    pub stderr_capture_maxbytes: u64,

    /// Merge the child's stderr into the stdout pipe.
    #[serde(default)]
    pub redirect_stderr: bool,
}

fn default_priority() -> i32 {
    999
}
fn default_true() -> bool {
    true
}
fn default_startsecs() -> u64 {
    1
}
fn default_startretries() -> u32 {
    3
}
fn default_exitcodes() -> Vec<i32> {
    vec![0]
}
fn default_stopsignals() -> Vec<String> {
    vec!["TERM".to_string()]
}
fn default_stopwaitsecs() -> u64 {
    10
}
fn default_logfile_maxbytes() -> u64 {
    50 * 1024 * 1024
}
fn default_logfile_backups() -> usize {
    10
}

impl Program {
    /// Minimal descriptor with defaults, for programmatic construction.
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            priority: default_priority(),
            process_num: 0,
            command,
            directory: None,
            user: None,
            umask: None,
            environment: BTreeMap::new(),
            autostart: true,
            autorestart: RestartPolicy::default(),
            startsecs: default_startsecs(),
            startretries: default_startretries(),
            exitcodes: default_exitcodes(),
            stopsignals: default_stopsignals(),
            stopwaitsecs: default_stopwaitsecs(),
            stopasgroup: false,
            killasgroup: None,
            stdout_logfile: None,
            stdout_logfile_maxbytes: default_logfile_maxbytes(),
            stdout_logfile_backups: default_logfile_backups(),
            stdout_events_enabled: false,
            stdout_capture_maxbytes: 0,
            stderr_logfile: None,
            stderr_logfile_maxbytes: default_logfile_maxbytes(),
            stderr_logfile_backups: default_logfile_backups(),
            stderr_events_enabled: false,
            stderr_capture_maxbytes: 0,
            redirect_stderr: false,
        }
    }

    pub fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.name)
    }

    pub fn killasgroup(&self) -> bool {
        self.killasgroup.unwrap_or(self.stopasgroup)
    }

    /// Stop signals resolved against the platform table, in order.
    /// Unknown names are skipped; an empty result falls back to TERM.
    pub fn stop_signal_list(&self) -> Vec<Signal> {
        let mut v: Vec<Signal> = self
            .stopsignals
            .iter()
            .filter_map(|s| parse_signal(s).ok())
            .collect();
        if v.is_empty() {
            v.push(Signal::SIGTERM);
        }
        v
    }

    /// Expansion base directory: the program's directory, else the
    /// supervisor's cwd.
    pub fn here(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn expanded_command(&self) -> Vec<String> {
        let here = self.here();
        self.command
            .iter()
            .map(|a| expand_tokens(a, self, &here))
            .collect()
    }

    pub fn expanded_directory(&self) -> Option<PathBuf> {
        let here = self.here();
        self.directory
            .as_ref()
            .map(|d| PathBuf::from(expand_tokens(&d.to_string_lossy(), self, &here)))
    }

    pub fn stdout_log_path(&self) -> Option<PathBuf> {
        self.resolve_log_path(self.stdout_logfile.as_ref())
    }

    pub fn stderr_log_path(&self) -> Option<PathBuf> {
        self.resolve_log_path(self.stderr_logfile.as_ref())
    }

    /// Log paths expand tokens and resolve relative to the program
    /// directory.
    fn resolve_log_path(&self, p: Option<&PathBuf>) -> Option<PathBuf> {
        let p = p?;
        let here = self.here();
        let expanded = PathBuf::from(expand_tokens(&p.to_string_lossy(), self, &here));
        if expanded.is_absolute() {
            Some(expanded)
        } else {
            Some(here.join(expanded))
        }
    }
}

/// Substitutes `%(...)s` tokens: `program_name`, `group_name`,
/// `process_num`, `here`, and `ENV_X` (program environment wins over the
/// supervisor's own). Unknown tokens are left verbatim.
pub fn expand_tokens(input: &str, prog: &Program, here: &Path) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("%(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find(")s") {
            Some(end) => {
                let token = &after[..end];
                match lookup_token(token, prog, here) {
                    Some(v) => out.push_str(&v),
                    None => {
                        out.push_str("%(");
                        out.push_str(token);
                        out.push_str(")s");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("%(");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup_token(token: &str, prog: &Program, here: &Path) -> Option<String> {
    match token {
        "program_name" => Some(prog.name.clone()),
        "group_name" => Some(prog.group_name().to_string()),
        "process_num" => Some(prog.process_num.to_string()),
        "here" => Some(here.to_string_lossy().into_owned()),
        _ => {
            let name = token.strip_prefix("ENV_")?;
            prog.environment
                .get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prog() -> Program {
        let mut p = Program::new("web", vec!["/bin/true".into()]);
        p.group = Some("backend".into());
        p.process_num = 2;
        p.environment.insert("PORT".into(), "8080".into());
        p
    }

    #[test]
    fn defaults_match_the_descriptor_contract() {
        let p = Program::new("web", vec!["/bin/true".into()]);
        assert!(p.autostart);
        assert_eq!(p.autorestart, RestartPolicy::Unexpected);
        assert_eq!(p.startsecs, 1);
        assert_eq!(p.startretries, 3);
        assert_eq!(p.exitcodes, vec![0]);
        assert_eq!(p.stopsignals, vec!["TERM".to_string()]);
        assert_eq!(p.stopwaitsecs, 10);
        assert_eq!(p.priority, 999);
        assert_eq!(p.group_name(), "web");
    }

    #[test]
    fn killasgroup_follows_stopasgroup() {
        let mut p = prog();
        assert!(!p.killasgroup());
        p.stopasgroup = true;
        assert!(p.killasgroup());
        p.killasgroup = Some(false);
        assert!(!p.killasgroup());
    }

    #[test]
    fn token_expansion() {
        let p = prog();
        let here = PathBuf::from("/srv/web");
        assert_eq!(
            expand_tokens("%(program_name)s-%(process_num)s", &p, &here),
            "web-2"
        );
        assert_eq!(expand_tokens("%(group_name)s", &p, &here), "backend");
        assert_eq!(expand_tokens("%(here)s/run", &p, &here), "/srv/web/run");
        assert_eq!(expand_tokens("--port=%(ENV_PORT)s", &p, &here), "--port=8080");
        // Unknown tokens survive verbatim.
        assert_eq!(expand_tokens("%(mystery)s", &p, &here), "%(mystery)s");
        assert_eq!(expand_tokens("50%(", &p, &here), "50%(");
    }

    #[test]
    fn log_paths_resolve_relative_to_directory() {
        let mut p = prog();
        p.directory = Some(PathBuf::from("/srv/web"));
        p.stdout_logfile = Some(PathBuf::from("logs/%(program_name)s.out"));
        assert_eq!(
            p.stdout_log_path().unwrap(),
            PathBuf::from("/srv/web/logs/web.out")
        );
        p.stderr_logfile = Some(PathBuf::from("/var/log/web.err"));
        assert_eq!(p.stderr_log_path().unwrap(), PathBuf::from("/var/log/web.err"));
    }

    #[test]
    fn stop_signal_list_skips_unknown_and_never_ends_empty() {
        let mut p = prog();
        p.stopsignals = vec!["USR2".into(), "bogus".into(), "INT".into()];
        assert_eq!(
            p.stop_signal_list(),
            vec![Signal::SIGUSR2, Signal::SIGINT]
        );
        p.stopsignals = vec!["bogus".into()];
        assert_eq!(p.stop_signal_list(), vec![Signal::SIGTERM]);
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let p: Program = serde_json::from_str(
            r#"{"name":"db","command":["/usr/bin/postgres","-D","/data"],"startsecs":5}"#,
        )
        .unwrap();
        assert_eq!(p.startsecs, 5);
        assert_eq!(p.startretries, 3);
        assert!(p.stdout_logfile.is_none());
        // Unknown fields are configuration bugs, not silent noise.
        assert!(serde_json::from_str::<Program>(
            r#"{"name":"db","command":["x"],"startscs":5}"#
        )
        .is_err());
    }
}
