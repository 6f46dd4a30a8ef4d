use anyhow::{bail, Context, Result};
use secrecy::SecretString;
use std::{fs, path::PathBuf};

/// Resolves a secret-valued option, giving precedence to a file source
/// over an inline value. File contents have a single trailing newline
/// stripped so that `echo secret > file` round-trips.
pub fn resolve_secret(
    base_opt_name: &str,
    path: Option<PathBuf>,
    value: Option<SecretString>,
) -> Result<SecretString> {
    match resolve_optional_secret(base_opt_name, path, value)? {
        Some(secret) => Ok(secret),
        None => {
            bail!("either option `{base_opt_name}-file` or `{base_opt_name}` needs to be specified")
        }
    }
}

/// Like [`resolve_secret`], but an entirely unset option is `None`.
pub fn resolve_optional_secret(
    _base_opt_name: &str,
    path: Option<PathBuf>,
    value: Option<SecretString>,
) -> Result<Option<SecretString>> {
    match (path, value) {
        (Some(_), Some(_)) => unreachable!("options should conflict"),
        (Some(path), None) => {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read file `{path}`", path = path.display()))?;
            let trimmed = raw.strip_suffix('\n').unwrap_or(&raw);
            Ok(Some(trimmed.to_string().into()))
        }
        (None, Some(value)) => Ok(Some(value)),
        (None, None) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    const BASE_OPT_NAME: &str = "cache-password";

    #[test]
    fn missing_file_is_an_error() {
        let err = resolve_secret(
            BASE_OPT_NAME,
            Some(PathBuf::from("tests/nonexistent.txt")),
            None,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "failed to read file `tests/nonexistent.txt`");
    }

    #[test]
    fn inline_value_is_used_when_no_file_is_given() {
        let secret = resolve_secret(BASE_OPT_NAME, None, Some(String::from("welcome456").into()))
            .unwrap();
        assert_eq!(secret.expose_secret(), "welcome456");
    }

    #[test]
    fn file_contents_lose_their_trailing_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "welcome456").unwrap();

        let secret = resolve_secret(BASE_OPT_NAME, Some(file.path().to_path_buf()), None).unwrap();
        assert_eq!(secret.expose_secret(), "welcome456");
    }

    #[test]
    fn unset_required_secret_is_an_error() {
        let err = resolve_secret(BASE_OPT_NAME, None, None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "either option `cache-password-file` or `cache-password` needs to be specified"
        );
    }

    #[test]
    fn unset_optional_secret_is_none() {
        assert!(resolve_optional_secret(BASE_OPT_NAME, None, None)
            .unwrap()
            .is_none());
    }
}
