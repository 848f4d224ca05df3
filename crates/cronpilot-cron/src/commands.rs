//! Typed builders for the shell commands the bridge runs.
//!
//! Every caller-supplied value passes through [`shell_quote`] here, so quoting
//! rules live in exactly one place.

use std::fmt;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// One OS-level operation, rendered to a single `sh -c` command string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    /// Print the user's crontab.
    ListCrontab { user: String },
    /// Replace the user's crontab with stdin.
    ReplaceCrontab { user: String },
    /// Replace the user's crontab with inline content, base64 in transit.
    ReplaceCrontabInline { user: String, content: String },
    /// Numeric uid of a user.
    UserId { user: String },
    /// Numeric primary gid of a user.
    GroupId { user: String },
    MakeExecutable { path: PathBuf },
    RunScript { path: PathBuf },
    /// One file name per line from the crontab spool directory.
    ListCrontabsDir { dir: PathBuf },
    /// Owner name of the docker socket.
    DockerSocketOwner { socket: PathBuf },
}

impl ShellCommand {
    pub fn list_crontab(user: impl Into<String>) -> Self {
        Self::ListCrontab { user: user.into() }
    }

    pub fn replace_crontab(user: impl Into<String>) -> Self {
        Self::ReplaceCrontab { user: user.into() }
    }

    pub fn replace_crontab_inline(user: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ReplaceCrontabInline {
            user: user.into(),
            content: content.into(),
        }
    }

    pub fn user_id(user: impl Into<String>) -> Self {
        Self::UserId { user: user.into() }
    }

    pub fn group_id(user: impl Into<String>) -> Self {
        Self::GroupId { user: user.into() }
    }

    pub fn make_executable(path: impl Into<PathBuf>) -> Self {
        Self::MakeExecutable { path: path.into() }
    }

    pub fn run_script(path: impl Into<PathBuf>) -> Self {
        Self::RunScript { path: path.into() }
    }

    pub fn list_crontabs_dir(dir: impl Into<PathBuf>) -> Self {
        Self::ListCrontabsDir { dir: dir.into() }
    }

    pub fn docker_socket_owner() -> Self {
        Self::DockerSocketOwner {
            socket: PathBuf::from("/var/run/docker.sock"),
        }
    }

    /// Render the exact command string.
    pub fn render(&self) -> String {
        match self {
            ShellCommand::ListCrontab { user } => format!("crontab -l -u {}", shell_quote(user)),
            ShellCommand::ReplaceCrontab { user } => format!("crontab -u {} -", shell_quote(user)),
            ShellCommand::ReplaceCrontabInline { user, content } => {
                let encoded = BASE64.encode(content.as_bytes());
                format!(
                    "echo {} | base64 -d | crontab -u {} -",
                    shell_quote(&encoded),
                    shell_quote(user)
                )
            }
            ShellCommand::UserId { user } => format!("id -u {}", shell_quote(user)),
            ShellCommand::GroupId { user } => format!("id -g {}", shell_quote(user)),
            ShellCommand::MakeExecutable { path } => {
                format!("chmod +x {}", shell_quote(&path.to_string_lossy()))
            }
            ShellCommand::RunScript { path } => {
                format!("/bin/sh {}", shell_quote(&path.to_string_lossy()))
            }
            ShellCommand::ListCrontabsDir { dir } => {
                format!("ls -1 {} 2>/dev/null", shell_quote(&dir.to_string_lossy()))
            }
            ShellCommand::DockerSocketOwner { socket } => {
                format!("stat -c '%U' {}", shell_quote(&socket.to_string_lossy()))
            }
        }
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Single-quote a value for POSIX sh. Embedded quotes become `'\''`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote only when the value contains characters sh would interpret.
pub fn shell_quote_if_needed(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | ':' | '@' | '%' | '='));
    if safe {
        value.to_string()
    } else {
        shell_quote(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crontab_commands() {
        assert_eq!(ShellCommand::list_crontab("root").render(), "crontab -l -u 'root'");
        assert_eq!(ShellCommand::replace_crontab("deploy").render(), "crontab -u 'deploy' -");
    }

    #[test]
    fn test_inline_replace_is_base64() {
        let content = "* * * * * echo 'it''s' $(whoami) ; rm -rf /\n";
        let rendered = ShellCommand::replace_crontab_inline("root", content).render();
        let encoded = BASE64.encode(content);
        assert_eq!(
            rendered,
            format!("echo '{encoded}' | base64 -d | crontab -u 'root' -")
        );
        assert!(!rendered.contains("whoami"));
    }

    #[test]
    fn test_user_lookups() {
        assert_eq!(ShellCommand::user_id("www-data").render(), "id -u 'www-data'");
        assert_eq!(ShellCommand::group_id("www-data").render(), "id -g 'www-data'");
    }

    #[test]
    fn test_script_commands() {
        assert_eq!(
            ShellCommand::make_executable("/opt/x y/run.sh").render(),
            "chmod +x '/opt/x y/run.sh'"
        );
        assert_eq!(
            ShellCommand::run_script("/tmp/run.sh").render(),
            "/bin/sh '/tmp/run.sh'"
        );
    }

    #[test]
    fn test_discovery_commands() {
        assert_eq!(
            ShellCommand::list_crontabs_dir("/var/spool/cron/crontabs").render(),
            "ls -1 '/var/spool/cron/crontabs' 2>/dev/null"
        );
        assert_eq!(
            ShellCommand::docker_socket_owner().to_string(),
            "stat -c '%U' '/var/run/docker.sock'"
        );
    }

    #[test]
    fn test_shell_quote_escapes_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(
            ShellCommand::list_crontab("x'; rm -rf / #").render(),
            r"crontab -l -u 'x'\''; rm -rf / #'"
        );
    }

    #[test]
    fn test_quote_if_needed() {
        assert_eq!(shell_quote_if_needed("/usr/local/bin/x.sh"), "/usr/local/bin/x.sh");
        assert_eq!(shell_quote_if_needed("/a b/x.sh"), "'/a b/x.sh'");
        assert_eq!(shell_quote_if_needed(""), "''");
    }
}
