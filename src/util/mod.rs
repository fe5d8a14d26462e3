pub mod fs;

use nix::unistd::{geteuid, Uid, User};

/// Name and uid of the effective user.
pub fn current_user() -> (String, u32) {
    let uid = geteuid();
    let name = User::from_uid(uid)
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string());
    (name, uid.as_raw())
}

pub fn is_root() -> bool {
    geteuid() == Uid::from_raw(0)
}

/// Quotes `args` so a POSIX shell splits them back into the same words.
pub fn shell_join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_escape::unix::escape(a.as_ref().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs an unprivileged host command and returns its stdout.
pub fn run_command(args: &[String]) -> anyhow::Result<String> {
    use anyhow::Context;

    let (program, rest) = args
        .split_first()
        .ok_or_else(|| crate::error::Error::Config("empty command".into()))?;
    log::debug!("running {}", shell_join(args));
    let output = std::process::Command::new(program)
        .args(rest)
        .output()
        .with_context(|| format!("executing {program}"))?;
    if !output.status.success() {
        return Err(crate::error::Error::Command {
            code: output.status.code().unwrap_or(1),
            cmdline: shell_join(args),
            output: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Expands a leading `~` using the invoking user's home directory.
pub fn expand_home(path: &str) -> std::path::PathBuf {
    match path.strip_prefix('~') {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => std::path::PathBuf::from(path),
        },
        None => std::path::PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_join_round_trips() {
        let args = ["rpmbuild", "--define", "_topdir /home/x", "it's", ""];
        let joined = shell_join(&args);
        let back = shlex::split(&joined).unwrap();
        assert_eq!(back, args);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn shell_join_splits_back(args in prop::collection::vec("[^\\x00]{0,16}", 0..10)) {
            let joined = shell_join(&args);
            prop_assert_eq!(shlex::split(&joined).unwrap(), args);
        }
    }
}
