use crate::state::CHARMS;
use crate::{CoreError, State};
use cairn_schema::{CharmArchive, CharmMeta, CharmUrl};
use cairn_store::document::encode;
use cairn_store::{Document, Op};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct CharmDoc {
    url: CharmUrl,
    /// URL without revision, shared by every revision of the charm.
    base: String,
    revision: u32,
    meta: CharmMeta,
    sha256: String,
    size: u64,
}

fn charm_doc(url: &CharmUrl, revision: u32, archive: &CharmArchive) -> Result<CharmDoc, CoreError> {
    if archive.meta.name != url.name {
        return Err(CoreError::Validation(format!(
            "cannot add charm \"{url}\": metadata names charm \"{}\"",
            archive.meta.name
        )));
    }
    Ok(CharmDoc {
        url: url.clone(),
        base: url.base(),
        revision,
        meta: archive.meta.clone(),
        sha256: archive.sha256(),
        size: archive.bytes.len() as u64,
    })
}

/// A charm revision recorded in state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charm {
    doc: CharmDoc,
}

impl Charm {
    fn from_doc(doc: &Document) -> Result<Self, CoreError> {
        Ok(Self { doc: doc.decode()? })
    }

    pub fn url(&self) -> &CharmUrl {
        &self.doc.url
    }

    pub fn revision(&self) -> u32 {
        self.doc.revision
    }

    pub fn meta(&self) -> &CharmMeta {
        &self.doc.meta
    }

    pub fn bundle_sha256(&self) -> &str {
        &self.doc.sha256
    }

    pub fn size(&self) -> u64 {
        self.doc.size
    }
}

impl State {
    /// Record `archive` as the charm at `url`, which must carry a revision.
    /// A `(name, revision)` pair can only be recorded once.
    pub fn add_charm(&self, url: &CharmUrl, archive: &CharmArchive) -> Result<Charm, CoreError> {
        let Some(revision) = url.revision else {
            return Err(CoreError::Validation(format!(
                "cannot add charm \"{url}\": revision is not set"
            )));
        };
        let doc = charm_doc(url, revision, archive)?;
        let key = doc.url.to_string();
        self.run_transaction(|_| {
            if self.read(CHARMS, &key)?.is_some() {
                return Err(CoreError::precondition(
                    format!("charm \"{key}\""),
                    format!("cannot add charm \"{key}\": charm already exists"),
                ));
            }
            Ok(vec![Op::new(CHARMS, key.as_str()).insert(encode(&doc)?)])
        })?;
        info!("added charm {key} (sha256 {})", doc.sha256);
        Ok(Charm { doc })
    }

    /// Record `archive` as the revision after the latest one stored for the
    /// charm at `url`. With no revision stored yet, `url`'s own revision (or
    /// 0) is used. Losing a race to another writer re-reads the latest
    /// revision and tries the next one.
    pub fn add_next_charm_revision(
        &self,
        url: &CharmUrl,
        archive: &CharmArchive,
    ) -> Result<Charm, CoreError> {
        let mut added = None;
        self.run_transaction(|attempt| {
            let revision = match self.latest_charm(url)? {
                Some(latest) => latest.revision() + 1,
                None => url.revision.unwrap_or(0),
            };
            let doc = charm_doc(&url.with_revision(revision), revision, archive)?;
            let key = doc.url.to_string();
            if attempt > 0 {
                debug!("retrying charm upload as {key}");
            }
            let op = Op::new(CHARMS, key.as_str()).insert(encode(&doc)?);
            added = Some(doc);
            Ok(vec![op])
        })?;
        let doc = added.ok_or_else(|| {
            CoreError::Validation(format!("cannot add charm \"{url}\": nothing to add"))
        })?;
        info!("added charm {} (sha256 {})", doc.url, doc.sha256);
        Ok(Charm { doc })
    }

    pub fn charm(&self, url: &CharmUrl) -> Result<Charm, CoreError> {
        let key = url.to_string();
        let doc = self
            .read(CHARMS, &key)?
            .ok_or_else(|| CoreError::NotFound(format!("charm \"{key}\"")))?;
        Charm::from_doc(&doc)
    }

    /// The highest revision recorded for the charm at `url`, whatever
    /// revision `url` itself names.
    pub fn latest_charm(&self, url: &CharmUrl) -> Result<Option<Charm>, CoreError> {
        let mut latest: Option<Charm> = None;
        for doc in self.find(CHARMS, "base", &Value::from(url.base()))? {
            let charm = Charm::from_doc(&doc)?;
            let newer = match &latest {
                Some(l) => charm.revision() > l.revision(),
                None => true,
            };
            if newer {
                latest = Some(charm);
            }
        }
        Ok(latest)
    }
}
