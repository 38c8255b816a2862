use crate::state::{password_hash, Dialer, Info};
use crate::{Charm, CoreError, Service, State, Unit};
use cairn_schema::{CharmArchive, CharmUrl, EnvironConfig, ResolvedMode, StateConfig};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Initialise a fresh environment's state. The stored configuration holds
/// only known attributes, never the admin secret, and the admin password
/// is set to the secret's hash until the first [`Conn`] rotates it.
pub fn bootstrap(
    info: &Info,
    config: StateConfig,
    environ: &EnvironConfig,
    dialer: Option<&dyn Dialer>,
) -> Result<State, CoreError> {
    let secret = environ.admin_secret().ok_or_else(|| {
        CoreError::Config("environment configuration has no admin-secret".to_owned())
    })?;
    let state = State::open(info, config, dialer)?;
    let mut stored = environ.clone().without_attr("admin-secret");
    for key in environ.unknown_attrs().keys() {
        stored = stored.without_attr(key);
    }
    state.set_environ_config(&stored)?;
    state.set_admin_password(&password_hash(secret))?;
    info!("bootstrapped environment {}", environ.name());
    Ok(state)
}

/// A client connection to an environment: the state plus the local
/// environment configuration it was opened with.
pub struct Conn {
    state: State,
    environ: EnvironConfig,
}

impl Conn {
    /// Connect using the admin secret of `environ`.
    ///
    /// The first connection after bootstrap finds the hashed secret as
    /// password, reconnects with it and replaces it with the secret itself.
    /// Unknown attributes of `environ` are then pushed to the shared
    /// environment settings, keeping any value already stored.
    pub fn new(
        environ: EnvironConfig,
        mut info: Info,
        config: StateConfig,
        dialer: Option<&dyn Dialer>,
    ) -> Result<Conn, CoreError> {
        let secret = environ
            .admin_secret()
            .ok_or_else(|| CoreError::Config("cannot connect without admin-secret".to_owned()))?
            .to_owned();
        info.password = secret.clone();
        let state = match State::open(&info, config.clone(), dialer) {
            Err(CoreError::Unauthorized(_)) => {
                debug!("admin secret rejected; trying its hash");
                info.password = password_hash(&secret);
                let state = State::open(&info, config, dialer)?;
                if let Err(e) = state.set_admin_password(&secret) {
                    let _ = state.close();
                    return Err(e);
                }
                info!("admin password rotated to the admin secret");
                state
            }
            other => other?,
        };
        let conn = Conn { state, environ };
        if let Err(e) = conn.push_secrets() {
            let _ = conn.state.close();
            return Err(e);
        }
        Ok(conn)
    }

    fn push_secrets(&self) -> Result<(), CoreError> {
        let unknown = self.environ.unknown_attrs();
        if unknown.is_empty() {
            return Ok(());
        }
        let mut settings = self.state.environ_settings()?;
        let written = settings.push_absent(&unknown)?;
        if written.len() < unknown.len() {
            debug!(
                "{} environment attributes already set",
                unknown.len() - written.len()
            );
        }
        Ok(())
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn environ(&self) -> &EnvironConfig {
        &self.environ
    }

    pub fn close(&self) -> Result<(), CoreError> {
        self.state.close()
    }

    /// Store `archive` as a revision of the charm at `url`.
    ///
    /// Without `bump`, an already stored revision (the one `url` names, or
    /// the latest when it names none) is returned unchanged. With `bump`,
    /// the archive is stored as one revision past the latest, even when
    /// other connections are bumping the same charm concurrently.
    pub fn put_charm(
        &self,
        url: &CharmUrl,
        archive: &CharmArchive,
        bump: bool,
    ) -> Result<Charm, CoreError> {
        if bump {
            return self.state.add_next_charm_revision(url, archive);
        }
        if let Some(charm) = self.stored_charm(url)? {
            if charm.bundle_sha256() != archive.sha256() {
                warn!(
                    "charm {} is already stored with different content",
                    charm.url()
                );
            }
            return Ok(charm);
        }
        match url.revision {
            Some(_) => self.state.add_charm(url, archive),
            None => self.state.add_next_charm_revision(url, archive),
        }
    }

    fn stored_charm(&self, url: &CharmUrl) -> Result<Option<Charm>, CoreError> {
        if url.revision.is_none() {
            return self.state.latest_charm(url);
        }
        match self.state.charm(url) {
            Ok(charm) => Ok(Some(charm)),
            Err(CoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn add_service(&self, name: &str, charm: &Charm) -> Result<Service, CoreError> {
        self.state.add_service(name, charm)
    }

    /// Add `n` units to `service`, each on a machine of its own.
    pub fn add_units(&self, service: &mut Service, n: usize) -> Result<Vec<Unit>, CoreError> {
        if n == 0 {
            return Err(CoreError::Validation(
                "must add at least one unit".to_owned(),
            ));
        }
        let mut units = Vec::with_capacity(n);
        for _ in 0..n {
            let mut unit = service.add_unit()?;
            unit.assign_to_unused_machine()?;
            units.push(unit);
        }
        Ok(units)
    }

    /// Start destroying the named units.
    ///
    /// Each unit is handled in its own transaction. Units that can be
    /// destroyed are, even when others cannot; the others are reported
    /// together in one [`CoreError::Aggregate`].
    pub fn destroy_units(&self, names: &[&str]) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        let mut failures = Vec::new();
        for name in names.iter().filter(|n| seen.insert(**n)) {
            let mut unit = match self.state.unit(name) {
                Ok(unit) => unit,
                Err(CoreError::NotFound(_) | CoreError::Validation(_)) => {
                    failures.push(format!("unit \"{name}\" is not alive"));
                    continue;
                }
                Err(e) => return Err(e),
            };
            match unit.destroy() {
                Ok(()) => {}
                Err(e @ CoreError::PreconditionFailed { .. }) => failures.push(e.to_string()),
                Err(e) => return Err(e),
            }
        }
        if failures.is_empty() {
            return Ok(());
        }
        warn!("{} of {} units not destroyed", failures.len(), seen.len());
        Err(CoreError::Aggregate {
            operation: "destroy units".to_owned(),
            failures,
        })
    }

    /// Mark an errored unit resolved, retrying its failed hook unless
    /// `no_hooks` is set.
    pub fn resolved(&self, unit: &mut Unit, no_hooks: bool) -> Result<(), CoreError> {
        let mode = if no_hooks {
            ResolvedMode::NoHooks
        } else {
            ResolvedMode::RetryHooks
        };
        unit.set_resolved(mode)
    }
}
