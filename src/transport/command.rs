use std::collections::BTreeMap;

/// A shell command line plus environment for the remote side.
///
/// Environment entries are exported by the shell itself instead of being
/// sent as SSH `env` requests, which most `sshd` configurations reject.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    text: String,
    env: BTreeMap<String, String>,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Renders the command as one line for a POSIX shell. Keys that are not
    /// valid shell identifiers are dropped.
    pub fn to_shell_line(&self) -> String {
        let exports: Vec<String> = self
            .env
            .iter()
            .filter(|(k, _)| is_shell_identifier(k))
            .map(|(k, v)| format!("{k}={}", shell_quote(v)))
            .collect();

        if exports.is_empty() {
            return self.text.clone();
        }
        format!("export {}; {}", exports.join(" "), self.text)
    }
}

// Values may carry tokens, so only the command text is displayed.
impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Single-quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn is_shell_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
