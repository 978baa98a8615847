//! Auth bootstrap (component D).
//!
//! Every path here is side-effecting only: it mutates global git config
//! and/or the environment before the sync loop starts, then returns. None
//! of it touches the root directory or the worktree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::process::CommandRunner;

#[derive(Clone, Debug)]
pub enum AuthMethod {
    None,
    UserPassword { username: String, password: String },
    Ssh { key_file: PathBuf, known_hosts: KnownHosts },
    CookieFile { path: PathBuf },
    Askpass { url: String },
    GitHubApp {
        app_id: String,
        installation_id: String,
        private_key_pem: String,
        api_url: String,
    },
}

#[derive(Clone, Debug)]
pub enum KnownHosts {
    Verify(PathBuf),
    Skip,
}

/// Outcome of a GitHub-App token exchange: the rewritten remote URL to use
/// and the instant the scheduler should re-authenticate by.
#[derive(Clone, Debug)]
pub struct GitHubAppToken {
    pub remote_url: String,
    pub expires_at: SystemTime,
}

#[derive(Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Serialize)]
struct JwtClaims {
    iat: u64,
    exp: u64,
    iss: String,
}

/// Perform the one-shot (or per-cycle, for ASKPASS) side effects for the
/// configured auth method. Always applies the default git config first.
/// Returns `Some` only for `GitHubApp`, whose installation token is
/// short-lived - the caller is expected to call this again before
/// `GitHubAppToken::expires_at` to keep the credential fresh (spec.md §4.D).
pub async fn bootstrap(
    ct: &CancellationToken,
    runner: &CommandRunner,
    method: &AuthMethod,
    remote_template: &str,
) -> Result<Option<GitHubAppToken>> {
    apply_default_git_config(ct, runner).await?;

    match method {
        AuthMethod::None => Ok(None),
        AuthMethod::UserPassword { username, password } => {
            configure_user_password(ct, runner, remote_template, username, password).await?;
            Ok(None)
        }
        AuthMethod::Ssh { key_file, known_hosts } => {
            configure_ssh(key_file, known_hosts)?;
            Ok(None)
        }
        AuthMethod::CookieFile { path } => {
            configure_cookie_file(ct, runner, path).await?;
            Ok(None)
        }
        AuthMethod::Askpass { url } => {
            let (username, password) = fetch_askpass_credentials(url).await?;
            configure_user_password(ct, runner, remote_template, &username, &password).await?;
            Ok(None)
        }
        AuthMethod::GitHubApp {
            app_id,
            installation_id,
            private_key_pem,
            api_url,
        } => {
            let token =
                exchange_github_app_token(app_id, installation_id, private_key_pem, api_url, remote_template).await?;
            Ok(Some(token))
        }
    }
}

async fn apply_default_git_config(ct: &CancellationToken, runner: &CommandRunner) -> Result<()> {
    for (key, value) in [("gc.autoDetach", "false"), ("gc.pruneExpire", "now")] {
        git_config_global(ct, runner, key, value).await?;
    }
    Ok(())
}

async fn git_config_global(
    ct: &CancellationToken,
    runner: &CommandRunner,
    key: &str,
    value: &str,
) -> Result<()> {
    runner
        .run(ct, None, None, Duration::from_secs(10), "git", ["config", "--global", key, value])
        .await
        .with_context(|| format!("git config --global {key} {value}"))?;
    Ok(())
}

/// Apply additional `key:value,key:value...` pairs, per the grammar of
/// spec.md §4.D, on top of the defaults.
pub async fn apply_extra_git_config(
    ct: &CancellationToken,
    runner: &CommandRunner,
    raw: &str,
) -> Result<()> {
    for (key, value) in parse_git_config_pairs(raw)? {
        git_config_global(ct, runner, &key, &value).await?;
    }
    Ok(())
}

async fn configure_user_password(
    ct: &CancellationToken,
    runner: &CommandRunner,
    remote_template: &str,
    username: &str,
    password: &str,
) -> Result<()> {
    git_config_global(ct, runner, "credential.helper", "store").await?;
    let input = format!("url={remote_template}\nusername={username}\npassword={password}\n\n");
    runner
        .run_with_stdin(
            ct,
            None,
            None,
            Duration::from_secs(10),
            input.as_bytes(),
            "git",
            ["credential", "approve"],
        )
        .await
        .context("git credential approve failed")?;
    Ok(())
}

fn configure_ssh(key_file: &Path, known_hosts: &KnownHosts) -> Result<()> {
    if !key_file.exists() {
        bail!("ssh key file {key_file:?} does not exist");
    }
    let command = match known_hosts {
        KnownHosts::Verify(known_hosts_file) => {
            if !known_hosts_file.exists() {
                bail!("known_hosts file {known_hosts_file:?} does not exist");
            }
            format!(
                "ssh -o StrictHostKeyChecking=yes -o UserKnownHostsFile={} -i {}",
                shell_quote(&known_hosts_file.to_string_lossy()),
                shell_quote(&key_file.to_string_lossy()),
            )
        }
        KnownHosts::Skip => format!(
            "ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -i {}",
            shell_quote(&key_file.to_string_lossy()),
        ),
    };
    debug!("setting GIT_SSH_COMMAND={command}");
    std::env::set_var("GIT_SSH_COMMAND", command);
    Ok(())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

async fn configure_cookie_file(ct: &CancellationToken, runner: &CommandRunner, path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("cookie file {path:?} does not exist");
    }
    git_config_global(ct, runner, "http.cookiefile", &path.to_string_lossy()).await
}

/// Single GET with a 1-second timeout; the response body is `key=value`
/// lines, recognizing `username` and `password`.
async fn fetch_askpass_credentials(url: &str) -> Result<(String, String)> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()
        .context("building askpass http client")?;
    let response = client
        .get(url)
        .send()
        .await
        .context("askpass request failed")?;
    if !response.status().is_success() {
        bail!("askpass endpoint returned {}", response.status());
    }
    let body = response.text().await.context("reading askpass response body")?;

    let mut username = None;
    let mut password = None;
    for line in body.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "username" => username = Some(value.to_owned()),
            "password" => password = Some(value.to_owned()),
            _ => {}
        }
    }
    let username = username.ok_or_else(|| anyhow!("askpass response missing username"))?;
    let password = password.ok_or_else(|| anyhow!("askpass response missing password"))?;
    Ok((username, password))
}

async fn exchange_github_app_token(
    app_id: &str,
    installation_id: &str,
    private_key_pem: &str,
    api_url: &str,
    remote: &str,
) -> Result<GitHubAppToken> {
    let jwt = sign_github_app_jwt(app_id, private_key_pem)?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("building github app http client")?;
    let url = format!("{api_url}/app/installations/{installation_id}/access_tokens");
    let response = client
        .post(&url)
        .bearer_auth(jwt)
        .header("Accept", "application/vnd.github+json")
        .header("User-Agent", "gitsync")
        .send()
        .await
        .context("github app installation token request failed")?;
    if !response.status().is_success() {
        bail!("github app token endpoint returned {}", response.status());
    }
    let parsed: InstallationTokenResponse = response
        .json()
        .await
        .context("parsing github app token response")?;

    let expires_at = chrono::DateTime::parse_from_rfc3339(&parsed.expires_at)
        .with_context(|| format!("parsing expires_at {:?}", parsed.expires_at))?;
    let expires_at = SystemTime::UNIX_EPOCH + Duration::from_secs(expires_at.timestamp().max(0) as u64);

    // Rewrite the actual repo remote's userinfo rather than fabricating a
    // URL from the API endpoint - the token is only good for the host/path
    // pair of the repo being synced, not for api_url.
    let mut remote_url = reqwest::Url::parse(remote).with_context(|| format!("parsing repo remote {remote:?}"))?;
    remote_url
        .set_username("x-access-token")
        .map_err(|()| anyhow!("remote {remote:?} cannot carry userinfo"))?;
    remote_url
        .set_password(Some(&parsed.token))
        .map_err(|()| anyhow!("remote {remote:?} cannot carry userinfo"))?;

    Ok(GitHubAppToken { remote_url: remote_url.to_string(), expires_at })
}

fn sign_github_app_jwt(app_id: &str, private_key_pem: &str) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs();
    // Back-date iat by 60s to tolerate clock skew against GitHub's servers,
    // as their docs recommend.
    let claims = JwtClaims {
        iat: now.saturating_sub(60),
        exp: now + 9 * 60,
        iss: app_id.to_owned(),
    };
    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .context("parsing github app private key as RSA PEM")?;
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .context("signing github app jwt")
}

/// Parses the `key:value,key:value...` grammar of spec.md §4.D. Either side
/// may be double-quoted; quoted values honour the escapes `\n` `\t` `\\`
/// `\"`. A closing quote must be followed by `,` or end of string; an
/// unterminated quote is an error.
pub fn parse_git_config_pairs(raw: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = raw.chars().peekable();

    while chars.peek().is_some() {
        let key = parse_token(&mut chars, ':')?;
        match chars.next() {
            Some(':') => {}
            other => bail!("expected ':' after key {key:?}, found {other:?}"),
        }
        let value = parse_token(&mut chars, ',')?;
        pairs.push((key, value));
        match chars.peek() {
            Some(',') => {
                chars.next();
            }
            Some(other) => bail!("expected ',' after value {value:?}, found {other:?}"),
            None => break,
        }
    }
    Ok(pairs)
}

fn parse_token(chars: &mut std::iter::Peekable<std::str::Chars>, terminator: char) -> Result<String> {
    if chars.peek() == Some(&'"') {
        chars.next();
        let mut out = String::new();
        loop {
            match chars.next() {
                None => bail!("unterminated quoted string"),
                Some('"') => break,
                Some('\\') => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('\\') => out.push('\\'),
                    Some('"') => out.push('"'),
                    Some(other) => bail!("invalid escape '\\{other}'"),
                    None => bail!("unterminated quoted string"),
                },
                Some(c) => out.push(c),
            }
        }
        match chars.peek() {
            None => {}
            Some(c) if *c == terminator => {}
            Some(c) => bail!("expected '{terminator}' or end of string after closing quote, found '{c}'"),
        }
        Ok(out)
    } else {
        let mut out = String::new();
        while let Some(&c) = chars.peek() {
            if c == terminator {
                break;
            }
            out.push(c);
            chars.next();
        }
        Ok(out)
    }
}

/// Serializes in the same grammar `parse_git_config_pairs` accepts, quoting
/// a value whenever it contains a character the unquoted grammar can't
/// represent. Round-tripping this pair is P7 in spec.md §8.
pub fn serialize_git_config_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}:{}", quote_if_needed(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn quote_if_needed(value: &str) -> String {
    if value.contains([',', ':', '"', '\\']) || value.is_empty() {
        let mut out = String::from("\"");
        for c in value.chars() {
            match c {
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                '\\' => out.push_str("\\\\"),
                '"' => out.push_str("\\\""),
                other => out.push(other),
            }
        }
        out.push('"');
        out
    } else {
        value.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_pairs() {
        let pairs = parse_git_config_pairs("http.sslVerify:false,core.compression:9").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("http.sslVerify".to_owned(), "false".to_owned()),
                ("core.compression".to_owned(), "9".to_owned()),
            ]
        );
    }

    #[test]
    fn parses_quoted_value_with_escapes() {
        let pairs = parse_git_config_pairs(r#"user.name:"a\tb\nc,d""#).unwrap();
        assert_eq!(pairs, vec![("user.name".to_owned(), "a\tb\nc,d".to_owned())]);
    }

    #[test]
    fn rejects_unterminated_quote() {
        let err = parse_git_config_pairs(r#"key:"unterminated"#).unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn rejects_garbage_after_closing_quote() {
        let err = parse_git_config_pairs(r#"key:"value"garbage"#).unwrap_err();
        assert!(err.to_string().contains("expected"));
    }

    #[test]
    fn round_trips_through_serialize() {
        let original = vec![
            ("a".to_owned(), "plain".to_owned()),
            ("b".to_owned(), "needs,quoting".to_owned()),
            ("c".to_owned(), "has\ttab\nand\\backslash".to_owned()),
        ];
        let serialized = serialize_git_config_pairs(&original);
        let reparsed = parse_git_config_pairs(&serialized).unwrap();
        assert_eq!(reparsed, original);
    }
}
