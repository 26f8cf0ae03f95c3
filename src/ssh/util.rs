//! Path helpers.

use camino::Utf8PathBuf;

/// Expands a leading `~/` prefix to the user's home directory.
///
/// When `HOME` is unset the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use spotbroker::ssh::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path").as_str(), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> Utf8PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return Utf8PathBuf::from(home.to_string_lossy().into_owned()).join(rest);
    }
    Utf8PathBuf::from(path)
}
