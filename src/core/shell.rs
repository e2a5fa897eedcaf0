//! Shell resolution
//!
//! Picks the interactive shell for a new pane and the fallback used once if
//! that shell dies right after launch.

use crate::config::Config;

#[cfg(unix)]
pub const FALLBACK_SHELL: &str = "/bin/sh";
#[cfg(windows)]
pub const FALLBACK_SHELL: &str = "cmd.exe";

#[cfg(target_os = "macos")]
const HARDCODED_SHELL: &str = "/bin/zsh";
#[cfg(all(unix, not(target_os = "macos")))]
const HARDCODED_SHELL: &str = "/bin/bash";
#[cfg(windows)]
const HARDCODED_SHELL: &str = "powershell.exe";

/// Shell families that need different init handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Zsh,
    Bash,
    Fish,
    Sh,
    PowerShell,
    Cmd,
    Other,
}

impl ShellKind {
    pub fn from_path(shell: &str) -> Self {
        // Windows paths may show up on any host, so split on both separators
        let base = shell.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(shell);
        let name = base.split('.').next().unwrap_or(base).to_ascii_lowercase();
        match name.as_str() {
            "zsh" => ShellKind::Zsh,
            "bash" => ShellKind::Bash,
            "fish" => ShellKind::Fish,
            "sh" | "dash" | "ash" => ShellKind::Sh,
            "pwsh" | "powershell" => ShellKind::PowerShell,
            "cmd" => ShellKind::Cmd,
            _ => ShellKind::Other,
        }
    }
}

/// Default + fallback shell selection
#[derive(Debug, Clone, Default)]
pub struct ShellResolver {
    shell: Option<String>,
    fallback: Option<String>,
}

impl ShellResolver {
    pub fn new(shell: Option<String>, fallback: Option<String>) -> Self {
        Self { shell, fallback }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.shell.clone(), config.fallback_shell.clone())
    }

    /// Configured shell, else the detected platform default
    pub fn default_shell(&self) -> String {
        match &self.shell {
            Some(shell) if !shell.trim().is_empty() => shell.clone(),
            _ => detect_default_shell(),
        }
    }

    /// Always available minimal shell for crash recovery
    pub fn fallback_shell(&self) -> String {
        match &self.fallback {
            Some(shell) if !shell.trim().is_empty() => shell.clone(),
            _ => FALLBACK_SHELL.to_string(),
        }
    }
}

/// OS account database first, then the environment, then a fixed path
pub fn detect_default_shell() -> String {
    #[cfg(unix)]
    let (os_shell, env_shell) = (passwd_shell(), std::env::var("SHELL").ok());
    #[cfg(windows)]
    let (os_shell, env_shell) = (None, std::env::var("COMSPEC").ok());

    pick_shell(os_shell, env_shell)
}

fn pick_shell(os_shell: Option<String>, env_shell: Option<String>) -> String {
    os_shell
        .filter(|s| !s.trim().is_empty())
        .or_else(|| env_shell.filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| HARDCODED_SHELL.to_string())
}

#[cfg(unix)]
fn passwd_shell() -> Option<String> {
    use nix::unistd::{getuid, User};

    let user = User::from_uid(getuid()).ok().flatten()?;
    let shell = user.shell;
    if shell.as_os_str().is_empty() || !shell.exists() {
        return None;
    }
    shell.to_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_path() {
        assert_eq!(ShellKind::from_path("/bin/zsh"), ShellKind::Zsh);
        assert_eq!(ShellKind::from_path("/usr/local/bin/bash"), ShellKind::Bash);
        assert_eq!(ShellKind::from_path("fish"), ShellKind::Fish);
        assert_eq!(ShellKind::from_path("/bin/dash"), ShellKind::Sh);
        assert_eq!(ShellKind::from_path("C:\\Windows\\System32\\cmd.exe"), ShellKind::Cmd);
        assert_eq!(ShellKind::from_path("pwsh.exe"), ShellKind::PowerShell);
        assert_eq!(ShellKind::from_path("/usr/bin/nu"), ShellKind::Other);
    }

    #[test]
    fn os_detection_beats_environment() {
        assert_eq!(
            pick_shell(Some("/bin/zsh".into()), Some("/bin/bash".into())),
            "/bin/zsh"
        );
        assert_eq!(pick_shell(None, Some("/bin/fish".into())), "/bin/fish");
        assert_eq!(pick_shell(Some("  ".into()), None), HARDCODED_SHELL);
    }

    #[test]
    fn configured_shells_win() {
        let resolver = ShellResolver::new(Some("/opt/zsh".into()), Some("/opt/sh".into()));
        assert_eq!(resolver.default_shell(), "/opt/zsh");
        assert_eq!(resolver.fallback_shell(), "/opt/sh");
    }

    #[test]
    fn fallback_is_always_available() {
        let resolver = ShellResolver::default();
        assert_eq!(resolver.fallback_shell(), FALLBACK_SHELL);
        assert!(!resolver.default_shell().is_empty());
    }
}
