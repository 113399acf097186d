use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{CreateRequest, DirListing, MoveRequest, StatDocument};

/// Route prefix of the file API on the repository server.
const FILE_API: &str = "/api/files";

/// Header carrying the session CSRF token.
const CSRF_HEADER: &str = "x-csrf-token";

/// Connection parameters for [`RepoClient::connect`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Origin of the repository server, e.g. `https://repo.example.com:8443`.
    pub url: String,
    pub user: String,
    pub password: String,
    /// Directory inside the repository mounted as the root, `/` for the whole
    /// repository.
    pub base: String,
    /// Accept TLS certificates that fail verification.
    pub insecure: bool,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl ClientOptions {
    pub fn new(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            user: user.into(),
            password: password.into(),
            base: "/".to_string(),
            insecure: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Authenticated client for the repository file API.
///
/// Every request carries basic auth and the current CSRF token. When the
/// server reports the token expired (403 plus `x-csrf-token: required`),
/// the client fetches a fresh token and retries the request once.
#[derive(Debug)]
pub struct RepoClient {
    http: reqwest::Client,
    origin: Url,
    /// Normalized base directory, empty when mounting the repository root.
    base: String,
    user: String,
    password: String,
    token: RwLock<String>,
}

impl RepoClient {
    /// Builds the client and performs the initial token handshake, which also
    /// validates the credentials.
    pub async fn connect(opts: ClientOptions) -> Result<Self> {
        let origin = Url::parse(&opts.url)
            .map_err(|e| Error::Config(format!("invalid repository url {:?}: {e}", opts.url)))?;
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .pool_max_idle_per_host(50)
            .timeout(opts.timeout)
            .danger_accept_invalid_certs(opts.insecure)
            .build()?;
        let client = Self {
            http,
            origin,
            base: clean_base(&opts.base),
            user: opts.user,
            password: opts.password,
            token: RwLock::new(String::new()),
        };
        client.refresh_token().await?;
        debug!(url = %client.origin, base = %client.base, "connected to repository");
        Ok(client)
    }

    /// The base directory this client is rooted at, empty for the repository
    /// root. Listing entries report repository-absolute locations; callers
    /// strip this prefix to get mount-relative paths.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Fetches the metadata document of a single entry.
    pub async fn stat(&self, path: &str) -> Result<StatDocument> {
        let url = self.file_url(path)?;
        let resp = self
            .send(|http| {
                http.get(url.clone())
                    .query(&[("depth", "0"), ("parts", "meta")])
            })
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            s if s.is_success() => {
                let body = resp.bytes().await?;
                Ok(serde_json::from_slice(&body)?)
            }
            _ => Err(Self::unexpected(resp)),
        }
    }

    /// Fetches a directory listing expanded `depth` levels deep.
    pub async fn list_directory(&self, path: &str, depth: u32) -> Result<DirListing> {
        let url = self.file_url(path)?;
        let depth = depth.to_string();
        let resp = self
            .send(|http| http.get(url.clone()).query(&[("depth", depth.as_str())]))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            s if s.is_success() => {
                let body = resp.bytes().await?;
                Ok(serde_json::from_slice(&body)?)
            }
            _ => Err(Self::unexpected(resp)),
        }
    }

    /// Reads the full content of a file.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.file_url(path)?;
        let resp = self.send(|http| http.get(url.clone())).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            s if s.is_success() => Ok(resp.bytes().await?.to_vec()),
            _ => Err(Self::unexpected(resp)),
        }
    }

    /// Replaces the full content of an existing file.
    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let url = self.file_url(path)?;
        let resp = self
            .send(|http| http.put(url.clone()).body(content.to_vec()))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            s if s.is_success() => Ok(()),
            _ => Err(Self::unexpected(resp)),
        }
    }

    /// Creates a file or directory named `name` inside `dir`.
    pub async fn create(&self, dir: &str, name: &str, directory: bool) -> Result<()> {
        let url = self.file_url(dir)?;
        let body = CreateRequest { name, directory };
        let resp = self.send(|http| http.post(url.clone()).json(&body)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            s if s.is_success() => Ok(()),
            _ => Err(Self::unexpected(resp)),
        }
    }

    /// Deletes a file or directory.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = self.file_url(path)?;
        let resp = self
            .send(|http| http.request(Method::DELETE, url.clone()))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            s if s.is_success() => Ok(()),
            _ => Err(Self::unexpected(resp)),
        }
    }

    /// Renames an entry within its directory. The server only supports moves
    /// that keep the parent, so cross-directory renames are rejected here
    /// before any request is made.
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = clean_path(old);
        let new = clean_path(new);
        let (old_dir, old_name) = split_path(&old);
        let (new_dir, new_name) = split_path(&new);
        if old_dir != new_dir {
            return Err(Error::OpNotAllowed(format!(
                "move across directories ({old_dir} -> {new_dir})"
            )));
        }
        if old_name == new_name {
            return Ok(());
        }
        let url = self.file_url(old_dir)?;
        let location = format!("{}{}", self.base, old);
        let body = MoveRequest {
            location: &location,
            target: new_name,
        };
        let resp = self
            .send(|http| {
                http.post(url.clone())
                    .header("X-Create-Options", "move,no-overwrite")
                    .json(&body)
            })
            .await?;
        match resp.status() {
            StatusCode::CREATED => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            s => Err(Error::OpNotAllowed(format!(
                "server refused move of {old_name} to {new_name} ({s})"
            ))),
        }
    }

    /// Sends one request built by `build`, attaching credentials and the
    /// current token, retrying once after a token refresh if the server says
    /// the token expired.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let resp = self.authed(build(&self.http)).await?;
        if !Self::token_expired(&resp) {
            return Ok(resp);
        }
        debug!(url = %resp.url(), "csrf token expired, refreshing and retrying");
        self.refresh_token().await?;
        self.authed(build(&self.http)).await
    }

    async fn authed(&self, builder: RequestBuilder) -> Result<Response> {
        let token = self.token.read().await.clone();
        let resp = builder
            .basic_auth(&self.user, Some(&self.password))
            .header(CSRF_HEADER, token)
            .send()
            .await?;
        Ok(resp)
    }

    /// Token handshake: a HEAD on the API root with `x-csrf-token: fetch`
    /// answers with a fresh token in the same header.
    async fn refresh_token(&self) -> Result<()> {
        let url = self.api_root()?;
        let resp = self
            .http
            .head(url)
            .basic_auth(&self.user, Some(&self.password))
            .header(CSRF_HEADER, "fetch")
            .send()
            .await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Auth("user or password rejected".into()));
        }
        let token = resp
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("required"))
            .ok_or_else(|| Error::Auth("server did not issue a csrf token".into()))?
            .to_string();
        *self.token.write().await = token;
        Ok(())
    }

    fn token_expired(resp: &Response) -> bool {
        resp.status() == StatusCode::FORBIDDEN
            && resp
                .headers()
                .get(CSRF_HEADER)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("required"))
    }

    fn unexpected(resp: Response) -> Error {
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Error::Auth("user or password rejected".into());
        }
        Error::Status {
            status: status.as_u16(),
            url: resp.url().to_string(),
        }
    }

    fn api_root(&self) -> Result<Url> {
        self.origin
            .join(FILE_API)
            .map_err(|e| Error::Config(format!("cannot build api url: {e}")))
    }

    fn file_url(&self, path: &str) -> Result<Url> {
        let path = clean_path(path);
        let full = format!("{FILE_API}{}{path}", self.base);
        self.origin
            .join(&full)
            .map_err(|e| Error::Config(format!("cannot build url for {path:?}: {e}")))
    }
}

/// Normalizes a caller path: forward slashes only, exactly one leading slash,
/// no trailing slash except for the root itself.
fn clean_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for part in path.split(['/', '\\']).filter(|p| !p.is_empty()) {
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

fn clean_base(base: &str) -> String {
    let cleaned = clean_path(base);
    if cleaned == "/" { String::new() } else { cleaned }
}

/// Splits a normalized path into its parent directory and entry name. The
/// root splits into itself and an empty name.
fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) if path.len() == 1 => ("/", ""),
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("/", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_normalizes_separators() {
        assert_eq!(clean_path("a\\b/c"), "/a/b/c");
        assert_eq!(clean_path("//a//b/"), "/a/b");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path(""), "/");
    }

    #[test]
    fn clean_base_drops_root() {
        assert_eq!(clean_base("/"), "");
        assert_eq!(clean_base(""), "");
        assert_eq!(clean_base("project/"), "/project");
        assert_eq!(clean_base("\\a\\b"), "/a/b");
    }

    #[test]
    fn split_path_handles_root_children() {
        assert_eq!(split_path("/a"), ("/", "a"));
        assert_eq!(split_path("/a/b"), ("/a", "b"));
        assert_eq!(split_path("/"), ("/", ""));
    }
}
