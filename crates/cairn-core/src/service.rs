use crate::lifecycle::{doc_life, Lifecycle};
use crate::relation::{Relation, RelationDoc};
use crate::state::{RELATIONS, SERVICES, SETTINGS, UNITS};
use crate::unit::UnitDoc;
use crate::{Charm, CoreError, Settings, State, Unit};
use cairn_schema::{
    validate_service_name, CharmUrl, Endpoint, Life, StatusData, StatusInfo, UnitName,
    WorkloadStatus,
};
use cairn_store::document::encode;
use cairn_store::{Assert, Document, FieldOp, Fields, Op};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct ServiceDoc {
    pub name: String,
    pub charm_url: CharmUrl,
    pub life: Life,
    #[serde(default)]
    pub subordinate: bool,
    /// Number handed to the next unit.
    #[serde(default)]
    pub unit_seq: u64,
    #[serde(default)]
    pub unit_count: u64,
    #[serde(default)]
    pub leader: String,
    #[serde(default)]
    pub status: Option<StatusInfo>,
}

pub(crate) fn settings_key(service: &str) -> String {
    format!("s#{service}")
}

/// Ops creating the next unit of the service in `service`, which the
/// caller has checked is alive.
pub(crate) fn new_unit_ops(
    service: &Document,
    principal: &str,
    machine_id: &str,
) -> Result<(UnitDoc, Vec<Op>), CoreError> {
    let name = service.str_field("name");
    let n = service.i64_field("unit_seq");
    let unit = UnitDoc::new(
        UnitName::for_service(name, n.max(0) as u64),
        name,
        principal,
        machine_id,
    );
    let ops = vec![
        Op::new(SERVICES, name)
            .assert(Assert::eq("life", Life::Alive.as_str()))
            .assert(Assert::eq("unit_seq", n))
            .update(vec![
                FieldOp::Inc("unit_seq".to_owned(), 1),
                FieldOp::Inc("unit_count".to_owned(), 1),
            ]),
        Op::new(UNITS, unit.name.as_str()).insert(encode(&unit)?),
    ];
    Ok((unit, ops))
}

/// A deployed application.
#[derive(Clone)]
pub struct Service {
    state: State,
    doc: ServiceDoc,
}

impl Service {
    pub(crate) fn from_doc(state: &State, doc: &Document) -> Result<Self, CoreError> {
        Ok(Self {
            state: state.clone(),
            doc: doc.decode()?,
        })
    }

    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn charm_url(&self) -> &CharmUrl {
        &self.doc.charm_url
    }

    pub fn is_subordinate(&self) -> bool {
        self.doc.subordinate
    }

    /// The unit elected leader, if any.
    pub fn leader(&self) -> Option<&str> {
        Some(self.doc.leader.as_str()).filter(|l| !l.is_empty())
    }

    pub fn status(&self) -> Option<&StatusInfo> {
        self.doc.status.as_ref()
    }

    pub fn unit_count(&self) -> u64 {
        self.doc.unit_count
    }

    pub fn refresh(&mut self) -> Result<(), CoreError> {
        let doc = self
            .state
            .read(SERVICES, &self.doc.name)?
            .ok_or_else(|| CoreError::NotFound(self.describe()))?;
        self.doc = doc.decode()?;
        Ok(())
    }

    pub fn charm(&self) -> Result<Charm, CoreError> {
        self.state.charm(&self.doc.charm_url)
    }

    pub fn endpoints(&self) -> Result<Vec<Endpoint>, CoreError> {
        Ok(self.charm()?.meta().endpoints(&self.doc.name))
    }

    pub fn endpoint(&self, relation_name: &str) -> Result<Endpoint, CoreError> {
        self.endpoints()?
            .into_iter()
            .find(|ep| ep.relation_name == relation_name)
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "relation \"{relation_name}\" of service \"{}\"",
                    self.doc.name
                ))
            })
    }

    pub fn settings(&self) -> Result<Settings, CoreError> {
        Settings::read(&self.state, &settings_key(&self.doc.name))
    }

    /// Add a principal unit. It is not assigned to any machine.
    pub fn add_unit(&mut self) -> Result<Unit, CoreError> {
        if self.doc.subordinate {
            return Err(CoreError::precondition(
                self.describe(),
                format!(
                    "cannot directly add units to subordinate service \"{}\"",
                    self.doc.name
                ),
            ));
        }
        let mut added = None;
        self.state.run_transaction(|_| {
            let doc = self.alive_doc("cannot add unit")?;
            let (unit, ops) = new_unit_ops(&doc, "", "")?;
            added = Some(unit);
            Ok(ops)
        })?;
        let unit = added.ok_or_else(|| CoreError::Conflict("unit was not added".to_owned()))?;
        info!("added unit {}", unit.name);
        self.refresh()?;
        Ok(Unit::new(&self.state, unit))
    }

    fn alive_doc(&self, action: &str) -> Result<Document, CoreError> {
        match self.state.read(SERVICES, &self.doc.name)? {
            Some(doc) if doc_life(&doc)? == Life::Alive => Ok(doc),
            _ => Err(CoreError::precondition(
                self.describe(),
                format!("{action}: {} is not alive", self.describe()),
            )),
        }
    }

    pub fn all_units(&self) -> Result<Vec<Unit>, CoreError> {
        let mut units = self
            .state
            .find(UNITS, "service", &Value::from(self.doc.name.as_str()))?
            .iter()
            .map(|doc| Unit::from_doc(&self.state, doc))
            .collect::<Result<Vec<_>, _>>()?;
        units.sort_by_key(|u| u.number());
        Ok(units)
    }

    pub fn relations(&self) -> Result<Vec<Relation>, CoreError> {
        self.state
            .find(
                RELATIONS,
                "endpoints.service_name",
                &Value::from(self.doc.name.as_str()),
            )?
            .iter()
            .map(|doc| Relation::from_doc(&self.state, doc))
            .collect()
    }

    /// Make `unit` the leader. Succeeds when it already is; fails while
    /// another live unit holds leadership.
    pub fn claim_leadership(&mut self, unit: &Unit) -> Result<(), CoreError> {
        if unit.service_name() != self.doc.name {
            return Err(CoreError::Validation(format!(
                "unit \"{}\" does not belong to {}",
                unit.name(),
                self.describe()
            )));
        }
        let name = unit.name().to_string();
        self.state.run_transaction(|_| {
            let doc = self.alive_doc("cannot claim leadership")?;
            let current = doc.str_field("leader");
            if current == name {
                return Ok(Vec::new());
            }
            let mut ops = Vec::new();
            if !current.is_empty() {
                let holder = self.state.read(UNITS, current)?;
                match holder {
                    Some(holder) if doc_life(&holder)? == Life::Alive => {
                        return Err(CoreError::precondition(
                            self.describe(),
                            format!(
                                "{} already has leader \"{current}\"",
                                self.describe()
                            ),
                        ));
                    }
                    Some(_) => ops.push(
                        Op::new(UNITS, current).assert(Assert::ne("life", Life::Alive.as_str())),
                    ),
                    None => ops.push(Op::new(UNITS, current).assert(Assert::Missing)),
                }
            }
            ops.push(
                Op::new(UNITS, name.as_str())
                    .assert(Assert::eq("life", Life::Alive.as_str())),
            );
            ops.push(
                Op::new(SERVICES, self.doc.name.as_str())
                    .assert(Assert::eq("leader", current))
                    .update(vec![FieldOp::set("leader", name.as_str())]),
            );
            Ok(ops)
        })?;
        info!("unit {name} leads {}", self.describe());
        self.refresh()
    }

    /// Record the service-level workload status on behalf of `leader`,
    /// which must hold leadership when the write commits.
    pub fn set_status(
        &mut self,
        leader: &Unit,
        status: WorkloadStatus,
        message: &str,
        data: StatusData,
    ) -> Result<(), CoreError> {
        let info = crate::unit::status_info(status, message, data)?;
        let value = serde_json::to_value(&info)?;
        let leader = leader.name().to_string();
        self.state.run_transaction(|_| {
            let doc = self.alive_doc("cannot set status")?;
            if doc.str_field("leader") != leader {
                return Err(CoreError::precondition(
                    format!("unit \"{leader}\""),
                    "this unit is not the leader",
                ));
            }
            Ok(vec![Op::new(SERVICES, self.doc.name.as_str())
                .assert(Assert::eq("life", Life::Alive.as_str()))
                .assert(Assert::eq("leader", leader.as_str()))
                .update(vec![FieldOp::Set("status".to_owned(), value.clone())])])
        })?;
        self.refresh()
    }
}

impl Lifecycle for Service {
    fn state(&self) -> &State {
        &self.state
    }

    fn collection(&self) -> &'static str {
        SERVICES
    }

    fn doc_id(&self) -> &str {
        &self.doc.name
    }

    fn describe(&self) -> String {
        format!("service \"{}\"", self.doc.name)
    }

    fn life(&self) -> Life {
        self.doc.life
    }

    fn set_cached_life(&mut self, life: Life) {
        self.doc.life = life;
    }

    fn transition_guard(&self, doc: &Document, to: Life) -> Result<Vec<Assert>, CoreError> {
        if to != Life::Dead {
            return Ok(Vec::new());
        }
        let count = doc.i64_field("unit_count");
        if count > 0 {
            return Err(CoreError::precondition(
                self.describe(),
                format!("{} still has {count} units", self.describe()),
            ));
        }
        Ok(vec![Assert::eq("unit_count", 0)])
    }
}

impl State {
    /// Deploy `charm` as a service. An empty `name` uses the charm's name.
    ///
    /// Peer relations declared by the charm are created in the same
    /// transaction, so the service is never visible without them.
    pub fn add_service(&self, name: &str, charm: &Charm) -> Result<Service, CoreError> {
        let name = if name.is_empty() {
            charm.meta().name.as_str()
        } else {
            name
        };
        validate_service_name(name)?;
        let doc = ServiceDoc {
            name: name.to_owned(),
            charm_url: charm.url().clone(),
            life: Life::Alive,
            subordinate: charm.meta().subordinate,
            unit_seq: 0,
            unit_count: 0,
            leader: String::new(),
            status: None,
        };
        let peers = charm.meta().peer_endpoints(name);
        self.run_transaction(|_| {
            if self.read(SERVICES, name)?.is_some() {
                return Err(CoreError::precondition(
                    format!("service \"{name}\""),
                    format!("cannot add service \"{name}\": service already exists"),
                ));
            }
            let mut ops = vec![
                Op::new(crate::state::CHARMS, charm.url().to_string()).assert(Assert::Exists),
                Op::new(SERVICES, name).insert(encode(&doc)?),
                Op::new(SETTINGS, settings_key(name)).insert(Fields::new()),
            ];
            if !peers.is_empty() {
                let (first_id, seq) = self.sequence("relation", peers.len() as u64)?;
                ops.push(seq);
                for (offset, ep) in peers.iter().enumerate() {
                    let rel = RelationDoc::new(first_id + offset as u64, vec![ep.clone()]);
                    ops.push(Op::new(RELATIONS, rel.key.as_str()).insert(encode(&rel)?));
                }
            }
            Ok(ops)
        })?;
        info!(
            "added service {name} running {} with {} peer relations",
            charm.url(),
            peers.len()
        );
        Ok(Service {
            state: self.clone(),
            doc,
        })
    }

    pub fn service(&self, name: &str) -> Result<Service, CoreError> {
        let doc = self
            .read(SERVICES, name)?
            .ok_or_else(|| CoreError::NotFound(format!("service \"{name}\"")))?;
        Service::from_doc(self, &doc)
    }

    pub fn all_services(&self) -> Result<Vec<Service>, CoreError> {
        let mut services = self
            .list(SERVICES)?
            .iter()
            .map(|doc| Service::from_doc(self, doc))
            .collect::<Result<Vec<_>, _>>()?;
        services.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(services)
    }
}
