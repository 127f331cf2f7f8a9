//! Per-user secret file reader.
//!
//! Secret files live at `<secrets_dir>/<email>` and are written by an
//! external utility. Every non-blank line is base64 (standard alphabet):
//!
//! | auth mode         | line 1        | line 2        |
//! |-------------------|---------------|---------------|
//! | `password`        | password      |               |
//! | `static_token`    | access token  |               |
//! | `federated_token` | access token  | refresh token |

use crate::model::AuthMode;
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use std::path::{Path, PathBuf};

/// Decoded credential material for one user.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    StaticToken(String),
    FederatedToken {
        access_token: String,
        refresh_token: String,
    },
}

impl Credential {
    pub fn auth_mode(&self) -> AuthMode {
        match self {
            Credential::Password(_) => AuthMode::Password,
            Credential::StaticToken(_) => AuthMode::StaticToken,
            Credential::FederatedToken { .. } => AuthMode::FederatedToken,
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential({})", self.auth_mode().as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("reading secret file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("secret file '{path}' line {line} is not valid base64")]
    Decode { path: PathBuf, line: usize },
    #[error("secret file '{path}' line {line} is not valid UTF-8")]
    Utf8 { path: PathBuf, line: usize },
    #[error("secret file '{path}' has {found} entries, expected {expected}")]
    Shape {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
}

/// Path of the secret file for `email`.
pub fn secret_path(secrets_dir: &Path, email: &str) -> PathBuf {
    secrets_dir.join(email)
}

/// Read and decode the secret file for `email` in the given auth mode.
pub fn load_credential(
    secrets_dir: &Path,
    email: &str,
    mode: AuthMode,
) -> Result<Credential, SecretError> {
    let path = secret_path(secrets_dir, email);
    let content = std::fs::read_to_string(&path).map_err(|source| SecretError::Io {
        path: path.clone(),
        source,
    })?;
    parse_credential(&content, mode, &path)
}

/// Decode secret file content. `path` is only used for error messages.
pub fn parse_credential(
    content: &str,
    mode: AuthMode,
    path: &Path,
) -> Result<Credential, SecretError> {
    let mut values = Vec::with_capacity(2);
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let bytes = B64.decode(line).map_err(|_| SecretError::Decode {
            path: path.to_path_buf(),
            line: idx + 1,
        })?;
        let value = String::from_utf8(bytes).map_err(|_| SecretError::Utf8 {
            path: path.to_path_buf(),
            line: idx + 1,
        })?;
        values.push(value.trim().to_owned());
    }

    let expected = match mode {
        AuthMode::Password | AuthMode::StaticToken => 1,
        AuthMode::FederatedToken => 2,
    };
    if values.len() != expected {
        return Err(SecretError::Shape {
            path: path.to_path_buf(),
            expected,
            found: values.len(),
        });
    }

    let mut it = values.into_iter();
    let first = it.next().unwrap_or_default();
    Ok(match mode {
        AuthMode::Password => Credential::Password(first),
        AuthMode::StaticToken => Credential::StaticToken(first),
        AuthMode::FederatedToken => Credential::FederatedToken {
            access_token: first,
            refresh_token: it.next().unwrap_or_default(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(s: &str) -> String {
        B64.encode(s)
    }

    #[test]
    fn password_single_line() {
        let content = format!("{}\n", enc("s3cret"));
        let c = parse_credential(&content, AuthMode::Password, Path::new("x")).unwrap();
        assert_eq!(c, Credential::Password("s3cret".to_owned()));
    }

    #[test]
    fn federated_pair_skips_blank_lines() {
        let content = format!("\n{}\n\n{}\n", enc("acc"), enc("ref"));
        let c = parse_credential(&content, AuthMode::FederatedToken, Path::new("x")).unwrap();
        assert_eq!(
            c,
            Credential::FederatedToken {
                access_token: "acc".to_owned(),
                refresh_token: "ref".to_owned(),
            }
        );
    }

    #[test]
    fn federated_with_one_line_is_rejected() {
        let content = enc("acc");
        let err = parse_credential(&content, AuthMode::FederatedToken, Path::new("x")).unwrap_err();
        assert!(matches!(
            err,
            SecretError::Shape {
                expected: 2,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn invalid_base64_reports_line() {
        let err = parse_credential("%%%", AuthMode::Password, Path::new("x")).unwrap_err();
        assert!(matches!(err, SecretError::Decode { line: 1, .. }));
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let c = Credential::Password("hunter2".to_owned());
        assert!(!format!("{c:?}").contains("hunter2"));
    }
}
