#![expect(
    clippy::module_name_repetitions,
    reason = "Session types expose their domain in the name for clarity"
)]

use bon::Builder;
use secrecy::{ExposeSecret as _, SecretString};
use tokio::sync::watch;
use url::Url;

use crate::Result;
use crate::error::Error;
use crate::ws::ConnectionManager;
use crate::ws::config::Config;

/// Where and how a [`Session`] opens its push channel.
///
/// ```rust
/// use runboard_live::live::SessionConfig;
///
/// let config = SessionConfig::builder()
///     .api_base("https://api.example.com")
///     .build();
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct SessionConfig {
    /// Base address of the REST API; the push endpoint is derived from it
    #[builder(into)]
    pub api_base: String,
    /// Path of the push endpoint relative to `api_base`
    #[builder(into, default = "/ws".to_owned())]
    pub push_path: String,
    #[builder(default)]
    pub connection: Config,
}

/// Owns the one [`ConnectionManager`] of an authenticated session.
///
/// A manager exists exactly while a credential is present. Changing the
/// credential disconnects the previous manager before the next one is built,
/// so at most one channel is ever open per session. Dropping the session
/// disconnects it.
///
/// Bindings hold clones of the manager; after a credential change they keep
/// the old, disconnected manager and must be recreated from
/// [`manager`](Self::manager).
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    push_endpoint: Url,
    credential: Option<SecretString>,
    manager: Option<ConnectionManager>,
}

impl Session {
    /// Validate the configuration and derive the push endpoint. Nothing is
    /// opened until a credential is set.
    pub fn new(config: SessionConfig) -> Result<Self> {
        let push_endpoint = push_endpoint(&config.api_base, &config.push_path)?;
        Ok(Self {
            config,
            push_endpoint,
            credential: None,
            manager: None,
        })
    }

    /// Push endpoint derived from the API base (`http` to `ws`, `https` to `wss`).
    #[must_use]
    pub fn push_endpoint(&self) -> &Url {
        &self.push_endpoint
    }

    /// The live manager, present while a credential is set.
    #[must_use]
    pub fn manager(&self) -> Option<&ConnectionManager> {
        self.manager.as_ref()
    }

    /// Replace the credential. Setting the current credential again is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if a new manager must be connected outside a Tokio runtime.
    pub fn set_credential(&mut self, credential: Option<SecretString>) -> Result<()> {
        if same_credential(self.credential.as_ref(), credential.as_ref()) {
            return Ok(());
        }

        self.end();

        let Some(credential) = credential else {
            return Ok(());
        };

        let manager = ConnectionManager::new(
            self.push_endpoint.as_str(),
            Some(credential.clone()),
            self.config.connection.clone(),
        )?;
        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.push_endpoint, "Opening session channel");
        manager.connect();

        self.credential = Some(credential);
        self.manager = Some(manager);
        Ok(())
    }

    /// Disconnect and release the manager.
    pub fn end(&mut self) {
        self.credential = None;
        if let Some(manager) = self.manager.take() {
            #[cfg(feature = "tracing")]
            tracing::debug!(endpoint = %self.push_endpoint, "Closing session channel");
            manager.disconnect();
        }
    }

    /// Drive the session from a credential source until it closes.
    ///
    /// Every change of the current manager (including to `None`) is
    /// published on `managers`. The session ends when `credentials` is
    /// dropped.
    pub async fn follow(
        mut self,
        mut credentials: watch::Receiver<Option<SecretString>>,
        managers: watch::Sender<Option<ConnectionManager>>,
    ) -> Result<()> {
        loop {
            let credential = credentials.borrow_and_update().clone();
            self.set_credential(credential)?;
            publish(&managers, self.manager.clone());

            if credentials.changed().await.is_err() {
                break;
            }
        }

        self.end();
        publish(&managers, None);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.end();
    }
}

fn same_credential(current: Option<&SecretString>, next: Option<&SecretString>) -> bool {
    match (current, next) {
        (Some(current), Some(next)) => current.expose_secret() == next.expose_secret(),
        (None, None) => true,
        _ => false,
    }
}

fn publish(managers: &watch::Sender<Option<ConnectionManager>>, next: Option<ConnectionManager>) {
    managers.send_if_modified(|current| {
        let changed = match (current.as_ref(), next.as_ref()) {
            (Some(current), Some(next)) => !current.same_channel(next),
            (None, None) => false,
            _ => true,
        };
        if changed {
            current.clone_from(&next);
        }
        changed
    });
}

/// `http(s)://host/base` becomes `ws(s)://host/base/<path>`.
fn push_endpoint(api_base: &str, push_path: &str) -> Result<Url> {
    let mut url = Url::parse(api_base)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::validation(format!(
                "unsupported API scheme {other:?}, expected http or https"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::validation(format!("cannot derive push endpoint from {api_base}")))?;

    let path = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        push_path.trim_start_matches('/')
    );
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
