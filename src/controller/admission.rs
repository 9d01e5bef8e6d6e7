//! Request validation for session creation.
//!
//! Validation is deliberately strict and literal: the worker entrypoint
//! interpolates `CODE_URL`, `COMMAND` and `INSTALL_CMD` into a shell, so
//! anything that smells like command substitution is rejected outright
//! rather than escaped.

use serde::Deserialize;

use crate::error::ApiError;

/// Upper bound, in bytes, on `command` and `install_cmd`.
pub const MAX_COMMAND_BYTES: usize = 500;

/// Substrings that would reach the worker's shell as substitutions.
const FORBIDDEN: [&str; 3] = ["$(", "`", "${"];

/// Body of `POST /api/sessions`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub code_url: String,
    pub command: String,
    #[serde(default)]
    pub install_cmd: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Validates a creation request against the admission rules. Returns the
/// first violation as a `BadRequest`.
pub fn validate(body: &CreateSessionRequest) -> Result<(), ApiError> {
    validate_code_url(&body.code_url)?;
    validate_command("command", &body.command)?;
    if let Some(install_cmd) = &body.install_cmd {
        validate_command("install_cmd", install_cmd)?;
    }
    Ok(())
}

fn validate_command(field: &str, value: &str) -> Result<(), ApiError> {
    if value.is_empty() {
        return Err(ApiError::InvalidRequest(format!("{field} must not be empty")));
    }
    if value.len() > MAX_COMMAND_BYTES {
        return Err(ApiError::InvalidRequest(format!(
            "{field} exceeds {MAX_COMMAND_BYTES} bytes"
        )));
    }
    for pattern in FORBIDDEN {
        if value.contains(pattern) {
            return Err(ApiError::InvalidRequest(format!(
                "{field} contains forbidden sequence '{pattern}'"
            )));
        }
    }
    Ok(())
}

fn validate_code_url(url: &str) -> Result<(), ApiError> {
    if url.is_empty() {
        return Err(ApiError::InvalidRequest("code_url must not be empty".into()));
    }
    for pattern in FORBIDDEN {
        if url.contains(pattern) {
            return Err(ApiError::InvalidRequest(format!(
                "code_url contains forbidden sequence '{pattern}'"
            )));
        }
    }

    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    let Some(rest) = without_scheme else {
        return Err(ApiError::InvalidRequest(
            "code_url must be an http(s) URL".into(),
        ));
    };

    if is_github_tree(rest) || has_archive_suffix(rest) {
        return Ok(());
    }

    Err(ApiError::InvalidRequest(
        "code_url must be a github.com tree URL, a .zip/.tar.gz/.tgz archive, or a .git repository"
            .into(),
    ))
}

/// `github.com/{owner}/{repo}/tree/{ref}/{path}` with every segment present.
fn is_github_tree(rest: &str) -> bool {
    let mut parts = rest.split('/');
    let host_ok = parts.next() == Some("github.com");
    let owner = parts.next();
    let repo = parts.next();
    let tree = parts.next();
    let git_ref = parts.next();
    let path_head = parts.next();

    host_ok
        && owner.is_some_and(|s| !s.is_empty())
        && repo.is_some_and(|s| !s.is_empty())
        && tree == Some("tree")
        && git_ref.is_some_and(|s| !s.is_empty())
        && path_head.is_some_and(|s| !s.is_empty())
}

fn has_archive_suffix(rest: &str) -> bool {
    // Suffix check on the path, ignoring any query string.
    let path = rest.split('?').next().unwrap_or(rest);
    path.ends_with(".zip")
        || path.ends_with(".tar.gz")
        || path.ends_with(".tgz")
        || path.ends_with(".git")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(code_url: &str, command: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            code_url: code_url.to_string(),
            command: command.to_string(),
            install_cmd: None,
            prompt: None,
        }
    }

    #[test]
    fn github_tree_url_accepted() {
        let body = request("https://github.com/x/y/tree/main/p", "node index.js");
        assert!(validate(&body).is_ok());
    }

    #[test]
    fn github_tree_with_nested_path_accepted() {
        let body = request(
            "https://github.com/acme/monorepo/tree/v1.2/services/api",
            "npm start",
        );
        assert!(validate(&body).is_ok());
    }

    #[test]
    fn github_url_without_tree_rejected() {
        let body = request("https://github.com/x/y", "node index.js");
        assert!(validate(&body).is_err());
    }

    #[test]
    fn github_tree_without_path_rejected() {
        let body = request("https://github.com/x/y/tree/main", "node index.js");
        assert!(validate(&body).is_err());
    }

    #[test]
    fn archive_urls_accepted() {
        for url in [
            "https://example.com/bundle.zip",
            "https://example.com/bundle.tar.gz",
            "https://example.com/bundle.tgz",
            "https://example.com/repo.git",
            "https://example.com/bundle.zip?sig=abc123",
        ] {
            assert!(validate(&request(url, "make run")).is_ok(), "{url}");
        }
    }

    #[test]
    fn non_http_scheme_rejected() {
        let body = request("ftp://example.com/bundle.zip", "node index.js");
        assert!(validate(&body).is_err());
    }

    #[test]
    fn random_url_rejected() {
        let body = request("https://example.com/page.html", "node index.js");
        assert!(validate(&body).is_err());
    }

    #[test]
    fn backtick_in_code_url_rejected() {
        let body = request("https://example.com/`whoami`.zip", "node index.js");
        assert!(validate(&body).is_err());
    }

    #[test]
    fn command_at_limit_accepted() {
        let body = request(
            "https://github.com/x/y/tree/main/p",
            &"a".repeat(MAX_COMMAND_BYTES),
        );
        assert!(validate(&body).is_ok());
    }

    #[test]
    fn command_over_limit_rejected() {
        let body = request(
            "https://github.com/x/y/tree/main/p",
            &"a".repeat(MAX_COMMAND_BYTES + 1),
        );
        assert!(validate(&body).is_err());
    }

    #[test]
    fn empty_command_rejected() {
        let body = request("https://github.com/x/y/tree/main/p", "");
        assert!(validate(&body).is_err());
    }

    #[test]
    fn substitution_sequences_rejected_in_command() {
        for bad in ["echo $(whoami)", "echo `whoami`", "echo ${HOME}"] {
            let body = request("https://github.com/x/y/tree/main/p", bad);
            assert!(validate(&body).is_err(), "{bad}");
        }
    }

    #[test]
    fn install_cmd_validated_when_present() {
        let mut body = request("https://github.com/x/y/tree/main/p", "node index.js");
        body.install_cmd = Some("npm install $(curl evil)".into());
        assert!(validate(&body).is_err());

        body.install_cmd = Some("npm ci".into());
        assert!(validate(&body).is_ok());
    }

    #[test]
    fn prompt_is_not_command_validated() {
        // Prompts are data for the agent, not shell input; substitution
        // sequences are allowed there.
        let mut body = request("https://github.com/x/y/tree/main/p", "node index.js");
        body.prompt = Some("explain what ${HOME} expands to".into());
        assert!(validate(&body).is_ok());
    }
}
