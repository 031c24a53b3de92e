//! Control URL handling.
//!
//! The executor is configured with one scheduler URL carrying its execution
//! token as userinfo, e.g. `ws://<execToken>@host:8701/executor-control`.
//! Whatever scheme or path the operator supplies is normalised to that form.
//! Two further URLs derive from it per container:
//!
//! - the artifact download URL, with *no* embedded auth (the token travels
//!   in the `x-mesh-token` header instead), and
//! - the container's own control URL, carrying that container's distinct
//!   token so the supervised process authenticates under its own identity.

use std::fmt;

use url::Url;

/// Path component of the executor's control endpoint.
const CONTROL_PATH: &str = "/executor-control";

/// Header carrying the execution token on artifact downloads.
pub const TOKEN_HEADER: &str = "x-mesh-token";

/// The scheduler control URL an executor was configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlUrl {
    url: Url,
}

/// Failure to interpret a control URL.
#[derive(Debug, thiserror::Error)]
pub enum ControlUrlError {
    /// The URL did not parse.
    #[error("invalid control URL: {0}")]
    Parse(#[from] url::ParseError),

    /// The URL has no host.
    #[error("control URL {0:?} has no host")]
    MissingHost(String),
}

impl ControlUrl {
    /// Parses and normalises a control URL (scheme `ws`, path
    /// `/executor-control`; userinfo and authority preserved).
    pub fn parse(raw: &str) -> Result<Self, ControlUrlError> {
        let mut url = Url::parse(raw)?;
        if url.host_str().is_none() {
            return Err(ControlUrlError::MissingHost(raw.to_owned()));
        }
        // ws and http are both special schemes, so the conversion cannot
        // fail for a URL that has a host.
        let _ = url.set_scheme("ws");
        url.set_path(CONTROL_PATH);
        Ok(Self { url })
    }

    /// The execution token (userinfo) used for artifact downloads.
    #[must_use]
    pub fn token(&self) -> &str {
        self.url.username()
    }

    /// Scheduler host.
    #[must_use]
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Scheduler port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    /// Artifact download URL for one container and deployment. Carries no
    /// auth; the execution token travels in [`TOKEN_HEADER`].
    #[must_use]
    pub fn download_url(&self, id: &crate::ContainerId, deployment_id: &str) -> Url {
        let mut url = self.url.clone();
        let _ = url.set_scheme("http");
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_path(&format!("artifacts/executor/{id}/{deployment_id}"));
        url
    }

    /// Control URL for a supervised process, carrying its own token and no
    /// path.
    #[must_use]
    pub fn container_url(&self, container_token: &str) -> Url {
        let mut url = self.url.clone();
        let _ = url.set_scheme("http");
        let _ = url.set_username(container_token);
        let _ = url.set_password(None);
        url.set_path("/");
        url
    }

    /// The normalised URL itself.
    #[must_use]
    pub fn as_url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for ControlUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}
