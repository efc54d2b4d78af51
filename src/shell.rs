//! Shell command construction for commands run through the sandbox host.
//!
//! Every value interpolated into a command (paths, job names, messages) goes
//! through [`quote`] so that spaces, quotes, `$` and backticks cannot change
//! the command's meaning.

use std::borrow::Cow;
use std::path::Path;

use shell_escape::unix::escape;

/// Quote an arbitrary string for a POSIX shell
pub fn quote(value: &str) -> String {
    escape(Cow::Borrowed(value)).into_owned()
}

/// Quote a path, optionally forcing a trailing slash (rsync "contents of")
pub fn quote_path(path: &Path, trailing_slash: bool) -> String {
    let mut rendered = path.to_string_lossy().into_owned();
    if trailing_slash && !rendered.ends_with('/') {
        rendered.push('/');
    }
    quote(&rendered)
}

/// Join steps so every step runs even if an earlier one fails
pub fn chain_best_effort<I, S>(steps: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    steps
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Join steps so the first failure stops the chain
pub fn chain_strict<I, S>(steps: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    steps
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(" && ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_values_untouched() {
        assert_eq!(quote("auto-study"), "auto-study");
        assert_eq!(quote("/data/backup"), "/data/backup");
    }

    #[test]
    fn test_special_characters_quoted() {
        assert_eq!(quote("hello world"), "'hello world'");
        assert_eq!(quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert!(quote("it's").contains("\\'"));
    }

    #[test]
    fn test_quote_path_trailing_slash() {
        assert_eq!(quote_path(Path::new("/root/.agentd"), true), "/root/.agentd/");
        assert_eq!(quote_path(Path::new("/root/dir/"), true), "/root/dir/");
        assert_eq!(quote_path(Path::new("/my dir"), false), "'/my dir'");
    }

    #[test]
    fn test_chains() {
        assert_eq!(chain_best_effort(["a", "b"]), "a; b");
        assert_eq!(chain_strict(vec!["a".to_string(), "b".to_string()]), "a && b");
        assert_eq!(chain_strict(Vec::<String>::new()), "");
    }
}
