//! Config-value expansion and proxy-command placeholder substitution.
//!
//! `${env:VAR}` references and leading `~` are expanded before a config is
//! used. Proxy-command strings additionally support the OpenSSH-style `%x`
//! tokens; unknown tokens pass through unchanged.

/// Expand `${env:VAR}` references. Unset variables expand to nothing.
pub fn expand_env_placeholders(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${env:") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 6..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if let Ok(v) = std::env::var(var) {
                    out.push_str(&v);
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference, keep it literal.
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    } else if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Substitute proxy-command placeholders:
///
/// | token | value |
/// |---|---|
/// | `%d` | local home directory |
/// | `%h` | remote host name |
/// | `%l` / `%n` | local host name |
/// | `%p` | remote port |
/// | `%r` | remote user name |
/// | `%u` | local user name |
/// | `%z` | remote home directory |
pub fn substitute_command_placeholders(
    text: &str,
    remote_host: &str,
    remote_port: u16,
    remote_user: &str,
    remote_home: &str,
) -> String {
    let hostname = local_hostname();
    let home = dirs::home_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let pairs = [
        ("%d", home),
        ("%h", remote_host.to_string()),
        ("%l", hostname.clone()),
        ("%n", hostname),
        ("%p", remote_port.to_string()),
        ("%r", remote_user.to_string()),
        ("%u", local_user()),
        ("%z", remote_home.to_string()),
    ];
    let mut out = text.to_string();
    for (token, value) in pairs {
        out = out.replace(token, &value);
    }
    out
}

fn local_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    std::process::Command::new("hostname")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_placeholder_expands() {
        std::env::set_var("TERMBRIDGE_TEST_VAR", "bastion");
        assert_eq!(
            expand_env_placeholders("${env:TERMBRIDGE_TEST_VAR}.example.com"),
            "bastion.example.com"
        );
    }

    #[test]
    fn unset_env_placeholder_expands_to_nothing() {
        std::env::remove_var("TERMBRIDGE_TEST_UNSET");
        assert_eq!(
            expand_env_placeholders("a${env:TERMBRIDGE_TEST_UNSET}b"),
            "ab"
        );
    }

    #[test]
    fn unterminated_placeholder_stays_literal() {
        assert_eq!(expand_env_placeholders("host${env:HOME"), "host${env:HOME");
    }

    #[test]
    fn plain_strings_unchanged() {
        assert_eq!(expand_env_placeholders("example.com"), "example.com");
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().unwrap().to_string_lossy().into_owned();
        assert_eq!(expand_tilde("~"), home);
        assert!(expand_tilde("~/.ssh/id_rsa").starts_with(&home));
    }

    #[test]
    fn tilde_in_the_middle_is_literal() {
        assert_eq!(expand_tilde("/tmp/~file"), "/tmp/~file");
    }

    #[test]
    fn command_placeholders_substitute() {
        let out = substitute_command_placeholders(
            "ssh -W %h:%p jump-user@bastion",
            "target.internal",
            2222,
            "deploy",
            "",
        );
        assert_eq!(out, "ssh -W target.internal:2222 jump-user@bastion");
    }

    #[test]
    fn remote_user_and_home_substitute() {
        let out = substitute_command_placeholders("%r:%z", "h", 22, "deploy", "/home/deploy");
        assert_eq!(out, "deploy:/home/deploy");
    }

    #[test]
    fn unknown_tokens_pass_through() {
        let out = substitute_command_placeholders("nc %h %p %q", "host", 22, "u", "");
        assert_eq!(out, "nc host 22 %q");
    }
}
