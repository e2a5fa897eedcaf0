//! Environment Builder
//!
//! Builds the complete environment and launch arguments for a pane's shell.
//! Nothing from the host leaks through unless it is on the allowlist below;
//! the result is merged in this order (later wins):
//!
//! 1. allowlisted host variables (string values only)
//! 2. shell init overrides pointing the shell at the installed wrappers
//! 3. session identity (`PANEHOST_*`)
//! 4. terminal identification and capability hints
//! 5. a UTF-8 locale

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::core::shell::ShellKind;

/// Locale used when the host has none or a non UTF-8 one
pub const FALLBACK_LOCALE: &str = "en_US.UTF-8";

/// Host variables passed through verbatim
const ALLOWED_VARS: &[&str] = &[
    // core infra
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TMPDIR",
    "TZ",
    "DISPLAY",
    "WAYLAND_DISPLAY",
    // locale
    "LANG",
    "LANGUAGE",
    // ssh agent
    "SSH_AUTH_SOCK",
    "SSH_AGENT_PID",
    // proxies
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "ALL_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
    "all_proxy",
    // editor preference
    "EDITOR",
    "VISUAL",
    "PAGER",
    // language version managers
    "NVM_DIR",
    "NVM_BIN",
    "VOLTA_HOME",
    "PNPM_HOME",
    "BUN_INSTALL",
    "FNM_DIR",
    "PYENV_ROOT",
    "RBENV_ROOT",
    "GOPATH",
    "GOROOT",
    "CARGO_HOME",
    "RUSTUP_HOME",
    "JAVA_HOME",
    "SDKMAN_DIR",
    "ASDF_DIR",
    "ASDF_DATA_DIR",
    "MISE_DATA_DIR",
    // windows infra
    "SYSTEMROOT",
    "WINDIR",
    "COMSPEC",
    "PATHEXT",
    "USERPROFILE",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "PROGRAMDATA",
    "PROGRAMFILES",
    "PROGRAMFILES(X86)",
    "TEMP",
    "TMP",
];

/// Host variable prefixes passed through verbatim
const ALLOWED_PREFIXES: &[&str] = &["LC_", "XDG_", "HOMEBREW_"];

/// Identity of the pane a shell is launched for
#[derive(Debug, Clone, Default)]
pub struct SessionIdentity {
    pub pane_id: String,
    pub tab_id: String,
    pub workspace_id: String,
    pub workspace_name: Option<String>,
    pub root_path: Option<PathBuf>,
}

/// Program, arguments and environment for one spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellLaunch {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct EnvBuilder {
    wrapper_dir: Option<PathBuf>,
    notify_port: u16,
}

impl EnvBuilder {
    pub fn new(wrapper_dir: Option<PathBuf>, notify_port: u16) -> Self {
        Self {
            wrapper_dir,
            notify_port,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.shell_wrapper_dir.clone(), config.notify_port)
    }

    /// Launch description for `shell`, built from the given host environment
    pub fn build<I>(&self, shell: &str, identity: &SessionIdentity, host: I) -> ShellLaunch
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let kind = ShellKind::from_path(shell);
        let host = sanitize_host_env(host);
        let mut env = host
            .iter()
            .filter(|(name, _)| is_allowed(name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<BTreeMap<_, _>>();

        env.extend(shell_overrides(kind, self.wrapper_dir.as_deref(), &host));
        env.extend(self.identity_vars(identity));
        env.extend(terminal_vars());

        let locale = resolve_locale(&host);
        env.insert("LANG".to_string(), locale.clone());
        if env.get("LC_ALL").is_some_and(|v| !is_utf8_locale(v)) {
            env.insert("LC_ALL".to_string(), locale);
        }

        ShellLaunch {
            program: shell.to_string(),
            args: shell_args(kind, self.wrapper_dir.as_deref()),
            env,
        }
    }

    fn identity_vars(&self, identity: &SessionIdentity) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("PANEHOST_PANE_ID".to_string(), identity.pane_id.clone());
        vars.insert("PANEHOST_TAB_ID".to_string(), identity.tab_id.clone());
        vars.insert(
            "PANEHOST_WORKSPACE_ID".to_string(),
            identity.workspace_id.clone(),
        );
        if let Some(name) = &identity.workspace_name {
            vars.insert("PANEHOST_WORKSPACE_NAME".to_string(), name.clone());
        }
        if let Some(root) = &identity.root_path {
            vars.insert(
                "PANEHOST_WORKSPACE_PATH".to_string(),
                root.to_string_lossy().into_owned(),
            );
        }
        vars.insert("PANEHOST_PORT".to_string(), self.notify_port.to_string());
        vars
    }
}

/// String-valued host entries only
pub fn sanitize_host_env<I>(host: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    host.into_iter()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

pub fn is_allowed(name: &str) -> bool {
    if ALLOWED_VARS.contains(&name) {
        return true;
    }
    // Windows variable names are case-insensitive
    let upper = name.to_ascii_uppercase();
    if cfg!(windows) && ALLOWED_VARS.contains(&upper.as_str()) {
        return true;
    }
    ALLOWED_PREFIXES.iter().any(|prefix| upper.starts_with(prefix))
}

/// Extra arguments making the shell run the app wrapper first
pub fn shell_args(kind: ShellKind, wrapper_dir: Option<&Path>) -> Vec<String> {
    match (kind, wrapper_dir) {
        (ShellKind::Zsh, _) => vec!["-l".to_string()],
        (ShellKind::Bash, Some(dir)) => vec![
            "--rcfile".to_string(),
            dir.join("bash").join("rcfile").to_string_lossy().into_owned(),
        ],
        (ShellKind::Bash, None) => vec!["-l".to_string()],
        (ShellKind::Fish, Some(dir)) => vec![
            "-l".to_string(),
            "--init-command".to_string(),
            format!(
                "source '{}'",
                dir.join("fish").join("init.fish").to_string_lossy()
            ),
        ],
        (ShellKind::Fish, None) => vec!["-l".to_string()],
        (ShellKind::PowerShell, _) => vec!["-NoLogo".to_string()],
        _ => Vec::new(),
    }
}

/// Variables redirecting the shell's config search to the wrapper
pub fn shell_overrides(
    kind: ShellKind,
    wrapper_dir: Option<&Path>,
    host: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    let Some(dir) = wrapper_dir else {
        return vars;
    };

    if kind == ShellKind::Zsh {
        // The wrapper sources the user's real config from here
        let original = host
            .get("ZDOTDIR")
            .or_else(|| host.get("HOME"))
            .cloned()
            .unwrap_or_default();
        vars.insert("PANEHOST_ORIG_ZDOTDIR".to_string(), original);
        vars.insert(
            "ZDOTDIR".to_string(),
            dir.join("zsh").to_string_lossy().into_owned(),
        );
    }
    vars.insert(
        "PANEHOST_SHELL_DIR".to_string(),
        dir.to_string_lossy().into_owned(),
    );
    vars
}

fn terminal_vars() -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("TERM".to_string(), "xterm-256color".to_string());
    vars.insert("COLORTERM".to_string(), "truecolor".to_string());
    vars.insert("TERM_PROGRAM".to_string(), "panehost".to_string());
    vars.insert(
        "TERM_PROGRAM_VERSION".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    vars.insert("PANEHOST".to_string(), "1".to_string());
    vars
}

/// First UTF-8 locale among `LC_ALL`, `LC_CTYPE`, `LANG`
pub fn resolve_locale(host: &BTreeMap<String, String>) -> String {
    ["LC_ALL", "LC_CTYPE", "LANG"]
        .iter()
        .filter_map(|name| host.get(*name))
        .find(|value| is_utf8_locale(value))
        .cloned()
        .unwrap_or_else(|| FALLBACK_LOCALE.to_string())
}

fn is_utf8_locale(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.contains("utf-8") || lower.contains("utf8")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(vars: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        vars.iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect()
    }

    fn identity() -> SessionIdentity {
        SessionIdentity {
            pane_id: "pane-1".into(),
            tab_id: "tab-1".into(),
            workspace_id: "ws-1".into(),
            workspace_name: Some("demo".into()),
            root_path: Some(PathBuf::from("/work/demo")),
        }
    }

    #[test]
    fn unknown_and_secret_variables_are_dropped() {
        let builder = EnvBuilder::new(None, 4000);
        let launch = builder.build(
            "/bin/bash",
            &identity(),
            host(&[
                ("PATH", "/usr/bin"),
                ("AWS_SECRET_ACCESS_KEY", "hunter2"),
                ("GITHUB_TOKEN", "ghp_x"),
                ("XDG_CONFIG_HOME", "/cfg"),
                ("LC_TIME", "C"),
            ]),
        );
        assert_eq!(launch.env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(launch.env.get("XDG_CONFIG_HOME").map(String::as_str), Some("/cfg"));
        assert_eq!(launch.env.get("LC_TIME").map(String::as_str), Some("C"));
        assert!(!launch.env.contains_key("AWS_SECRET_ACCESS_KEY"));
        assert!(!launch.env.contains_key("GITHUB_TOKEN"));
    }

    #[test]
    fn identity_and_terminal_vars_are_set() {
        let builder = EnvBuilder::new(None, 4000);
        let launch = builder.build("/bin/zsh", &identity(), host(&[]));
        let get = |k: &str| launch.env.get(k).map(String::as_str);
        assert_eq!(get("PANEHOST_PANE_ID"), Some("pane-1"));
        assert_eq!(get("PANEHOST_TAB_ID"), Some("tab-1"));
        assert_eq!(get("PANEHOST_WORKSPACE_ID"), Some("ws-1"));
        assert_eq!(get("PANEHOST_WORKSPACE_NAME"), Some("demo"));
        assert_eq!(get("PANEHOST_WORKSPACE_PATH"), Some("/work/demo"));
        assert_eq!(get("PANEHOST_PORT"), Some("4000"));
        assert_eq!(get("TERM"), Some("xterm-256color"));
        assert_eq!(get("COLORTERM"), Some("truecolor"));
        assert_eq!(get("TERM_PROGRAM"), Some("panehost"));
        assert_eq!(launch.program, "/bin/zsh");
        assert_eq!(launch.args, vec!["-l".to_string()]);
    }

    #[test]
    fn locale_falls_back_to_utf8() {
        let non_utf8 = sanitize_host_env(host(&[("LANG", "de_DE.ISO-8859-1")]));
        assert_eq!(resolve_locale(&non_utf8), FALLBACK_LOCALE);

        let utf8 = sanitize_host_env(host(&[("LANG", "C"), ("LC_CTYPE", "fr_FR.UTF-8")]));
        assert_eq!(resolve_locale(&utf8), "fr_FR.UTF-8");

        let builder = EnvBuilder::new(None, 1);
        let launch = builder.build(
            "/bin/sh",
            &identity(),
            host(&[("LANG", "POSIX"), ("LC_ALL", "C")]),
        );
        assert_eq!(launch.env.get("LANG").map(String::as_str), Some(FALLBACK_LOCALE));
        assert_eq!(launch.env.get("LC_ALL").map(String::as_str), Some(FALLBACK_LOCALE));
    }

    #[test]
    fn zsh_wrapper_redirects_zdotdir() {
        let builder = EnvBuilder::new(Some(PathBuf::from("/app/shell")), 1);
        let launch = builder.build(
            "/bin/zsh",
            &identity(),
            host(&[("HOME", "/home/me"), ("ZDOTDIR", "/home/me/.config/zsh")]),
        );
        assert_eq!(
            launch.env.get("ZDOTDIR").map(String::as_str),
            Some(Path::new("/app/shell").join("zsh").to_str().unwrap())
        );
        assert_eq!(
            launch.env.get("PANEHOST_ORIG_ZDOTDIR").map(String::as_str),
            Some("/home/me/.config/zsh")
        );
    }

    #[test]
    fn bash_wrapper_uses_rcfile() {
        let args = shell_args(ShellKind::Bash, Some(Path::new("/app/shell")));
        assert_eq!(args[0], "--rcfile");
        assert!(args[1].ends_with("rcfile"));
        assert!(shell_args(ShellKind::Sh, Some(Path::new("/app/shell"))).is_empty());
    }

    #[test]
    fn non_utf8_host_values_are_skipped() {
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStringExt;
            let bad = OsString::from_vec(vec![0xff, 0xfe]);
            let env = sanitize_host_env(vec![
                (OsString::from("PATH"), bad),
                (OsString::from("HOME"), OsString::from("/home/me")),
            ]);
            assert!(!env.contains_key("PATH"));
            assert_eq!(env.get("HOME").map(String::as_str), Some("/home/me"));
        }
    }
}
