use crate::lifecycle::{doc_life, Lifecycle};
use crate::service::new_unit_ops;
use crate::state::{RELATIONS, RELATION_SCOPES, SERVICES, UNITS};
use crate::unit::UnitDoc;
use crate::{CoreError, State, Unit};
use cairn_schema::{
    relation_key, Endpoint, Life, RelationRole, RelationScope, UnitName, JUJU_INFO,
};
use cairn_store::document::encode;
use cairn_store::{Assert, ChangeEntry, Document, FieldOp, Op};
use cairn_watch::{Subscription, Target};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct RelationDoc {
    pub key: String,
    pub id: u64,
    pub endpoints: Vec<Endpoint>,
    pub life: Life,
    /// Number of units currently in scope.
    #[serde(default)]
    pub unit_count: u64,
}

impl RelationDoc {
    pub(crate) fn new(id: u64, endpoints: Vec<Endpoint>) -> Self {
        Self {
            key: relation_key(&endpoints),
            id,
            endpoints,
            life: Life::Alive,
            unit_count: 0,
        }
    }
}

fn relation_desc(key: &str) -> String {
    format!("relation \"{key}\"")
}

/// A relation between two services, or a peer relation of one service
/// with itself.
#[derive(Clone)]
pub struct Relation {
    state: State,
    doc: RelationDoc,
}

impl Relation {
    pub(crate) fn from_doc(state: &State, doc: &Document) -> Result<Self, CoreError> {
        Ok(Self {
            state: state.clone(),
            doc: doc.decode()?,
        })
    }

    pub fn key(&self) -> &str {
        &self.doc.key
    }

    pub fn id(&self) -> u64 {
        self.doc.id
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.doc.endpoints
    }

    pub fn unit_count(&self) -> u64 {
        self.doc.unit_count
    }

    pub fn is_container_scoped(&self) -> bool {
        self.doc
            .endpoints
            .iter()
            .any(|ep| ep.scope == RelationScope::Container)
    }

    pub fn refresh(&mut self) -> Result<(), CoreError> {
        let doc = self
            .state
            .read(RELATIONS, &self.doc.key)?
            .ok_or_else(|| CoreError::NotFound(self.describe()))?;
        self.doc = doc.decode()?;
        Ok(())
    }

    /// The endpoint `service` takes part through.
    pub fn endpoint(&self, service: &str) -> Result<&Endpoint, CoreError> {
        self.doc
            .endpoints
            .iter()
            .find(|ep| ep.service_name == service)
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "service \"{service}\" is not a member of {}",
                    self.describe()
                ))
            })
    }

    /// Endpoints on the other side of the relation from `service`. For a
    /// peer relation this is the service's own endpoint.
    pub fn related_endpoints(&self, service: &str) -> Result<Vec<Endpoint>, CoreError> {
        let own = self.endpoint(service)?;
        let wanted = own.role.counterpart();
        Ok(self
            .doc
            .endpoints
            .iter()
            .filter(|ep| ep.role == wanted)
            .cloned()
            .collect())
    }

    /// The view of this relation from `unit`.
    pub fn unit(&self, unit: &Unit) -> Result<RelationUnit, CoreError> {
        let endpoint = self.endpoint(unit.service_name())?.clone();
        Ok(RelationUnit {
            relation: self.clone(),
            unit: unit.clone(),
            endpoint,
        })
    }

    /// Start destroying the relation. One with no units in scope is removed
    /// at once; otherwise it turns `Dying` and the last unit to leave scope
    /// removes it.
    pub fn destroy(&mut self) -> Result<(), CoreError> {
        let key = self.doc.key.clone();
        let mut removed = false;
        self.state.run_transaction(|_| {
            removed = false;
            let Some(doc) = self.state.read(RELATIONS, &key)? else {
                removed = true;
                return Ok(Vec::new());
            };
            let life = doc_life(&doc)?;
            let count = doc.i64_field("unit_count");
            if count == 0 {
                removed = true;
                return Ok(vec![Op::new(RELATIONS, key.as_str())
                    .assert(Assert::eq("unit_count", 0))
                    .remove()]);
            }
            if life != Life::Alive {
                return Ok(Vec::new());
            }
            Ok(vec![Op::new(RELATIONS, key.as_str())
                .assert(Assert::eq("life", Life::Alive.as_str()))
                .assert(Assert::ne("unit_count", 0))
                .update(vec![FieldOp::set("life", Life::Dying.as_str())])])
        })?;
        if removed {
            info!("removed {}", self.describe());
            self.doc.life = Life::Dead;
        } else {
            info!("{} is dying", self.describe());
            self.doc.life = Life::Dying;
        }
        Ok(())
    }

    pub fn watch(&self) -> Result<Subscription<Target, ChangeEntry>, CoreError> {
        self.state.watch_document(RELATIONS, &self.doc.key)
    }
}

impl Lifecycle for Relation {
    fn state(&self) -> &State {
        &self.state
    }

    fn collection(&self) -> &'static str {
        RELATIONS
    }

    fn doc_id(&self) -> &str {
        &self.doc.key
    }

    fn describe(&self) -> String {
        relation_desc(&self.doc.key)
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
                format!("{} still has {count} units in scope", self.describe()),
            ));
        }
        Ok(vec![Assert::eq("unit_count", 0)])
    }
}

/// A unit's membership of a relation.
#[derive(Clone)]
pub struct RelationUnit {
    relation: Relation,
    unit: Unit,
    endpoint: Endpoint,
}

impl RelationUnit {
    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn scope_key(&self) -> String {
        format!("r#{}#{}", self.relation.doc.id, self.unit.name())
    }

    fn state(&self) -> &State {
        &self.relation.state
    }

    /// Whether the scope record for this unit exists.
    pub fn in_scope(&self) -> Result<bool, CoreError> {
        Ok(self
            .state()
            .read(RELATION_SCOPES, &self.scope_key())?
            .is_some())
    }

    /// Join the relation. Entering a container-scoped relation from a
    /// principal unit also creates that unit's subordinate, unless one of
    /// the subordinate service already exists for it.
    pub fn enter_scope(&self) -> Result<(), CoreError> {
        let state = self.state();
        let scope_key = self.scope_key();
        let rel_key = self.relation.key();
        let unit_name = self.unit.name().to_string();
        let mut created: Option<UnitName> = None;
        state.run_transaction(|_| {
            created = None;
            if state.read(RELATION_SCOPES, &scope_key)?.is_some() {
                return Ok(Vec::new());
            }
            let alive = match state.read(RELATIONS, rel_key)? {
                Some(doc) => doc_life(&doc)? == Life::Alive,
                None => false,
            };
            if !alive {
                return Err(CoreError::precondition(
                    self.relation.describe(),
                    format!(
                        "cannot enter scope of {}: relation is not alive",
                        self.relation.describe()
                    ),
                ));
            }
            let Some(unit_doc) = state.read(UNITS, &unit_name)? else {
                return Err(CoreError::NotFound(format!("unit \"{unit_name}\"")));
            };
            if doc_life(&unit_doc)? != Life::Alive {
                return Err(CoreError::precondition(
                    format!("unit \"{unit_name}\""),
                    format!("cannot enter scope: unit \"{unit_name}\" is not alive"),
                ));
            }
            let unit: UnitDoc = unit_doc.decode()?;
            let mut ops = vec![
                Op::new(RELATIONS, rel_key)
                    .assert(Assert::eq("life", Life::Alive.as_str()))
                    .update(vec![FieldOp::Inc("unit_count".to_owned(), 1)]),
                Op::new(RELATION_SCOPES, scope_key.as_str()).insert(encode(&json!({
                    "relation": rel_key,
                    "unit": unit_name,
                }))?),
            ];
            if self.relation.is_container_scoped() && unit.principal.is_empty() {
                if let Some((sub_ops, name)) = self.subordinate_ops(&unit)? {
                    ops.extend(sub_ops);
                    created = Some(name);
                }
            }
            Ok(ops)
        })?;
        debug!("unit {unit_name} entered scope of {}", self.relation.describe());
        if let Some(name) = created {
            info!("added subordinate unit {name} to {unit_name}");
        }
        Ok(())
    }

    /// Ops creating the subordinate unit for principal `unit`, when the
    /// other side of this relation is a subordinate service that has no
    /// unit on the principal yet.
    fn subordinate_ops(&self, unit: &UnitDoc) -> Result<Option<(Vec<Op>, UnitName)>, CoreError> {
        let state = self.state();
        let related = self.relation.related_endpoints(&unit.service)?;
        let Some(other) = related.first() else {
            return Ok(None);
        };
        let Some(service) = state.read(SERVICES, &other.service_name)? else {
            return Err(CoreError::NotFound(format!(
                "service \"{}\"",
                other.service_name
            )));
        };
        if !service.bool_field("subordinate") {
            return Ok(None);
        }
        let prefix = format!("{}/", other.service_name);
        if unit.subordinates.iter().any(|s| s.starts_with(&prefix)) {
            return Ok(None);
        }
        if doc_life(&service)? != Life::Alive {
            return Err(CoreError::precondition(
                format!("service \"{}\"", other.service_name),
                format!(
                    "cannot add subordinate unit: service \"{}\" is not alive",
                    other.service_name
                ),
            ));
        }
        let (sub, mut ops) = new_unit_ops(&service, &unit.name, &unit.machine_id)?;
        ops.push(
            Op::new(UNITS, unit.name.as_str())
                .assert(Assert::eq("life", Life::Alive.as_str()))
                .update(vec![FieldOp::AddToSet(
                    "subordinates".to_owned(),
                    sub.name.as_str().into(),
                )]),
        );
        Ok(Some((ops, sub.name)))
    }

    /// Leave the relation. The last unit to leave a dying relation removes
    /// it.
    pub fn leave_scope(&self) -> Result<(), CoreError> {
        let state = self.state();
        let scope_key = self.scope_key();
        let rel_key = self.relation.key();
        let mut removed = false;
        state.run_transaction(|_| {
            removed = false;
            if state.read(RELATION_SCOPES, &scope_key)?.is_none() {
                return Ok(Vec::new());
            }
            let mut ops = vec![Op::new(RELATION_SCOPES, scope_key.as_str())
                .assert(Assert::Exists)
                .remove()];
            if let Some(rel) = state.read(RELATIONS, rel_key)? {
                let count = rel.i64_field("unit_count");
                let rel_op = Op::new(RELATIONS, rel_key).assert(Assert::eq("unit_count", count));
                if count <= 1 && doc_life(&rel)? != Life::Alive {
                    removed = true;
                    ops.push(rel_op.remove());
                } else {
                    ops.push(rel_op.update(vec![FieldOp::Inc("unit_count".to_owned(), -1)]));
                }
            }
            Ok(ops)
        })?;
        debug!("unit {} left scope of {}", self.unit.name(), self.relation.describe());
        if removed {
            info!("removed {}", self.relation.describe());
        }
        Ok(())
    }
}

/// Split `svc` or `svc:relation`.
fn parse_endpoint_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once(':') {
        Some((svc, rel)) => (svc, Some(rel)),
        None => (name, None),
    }
}

fn quoted_keys(candidates: &[Vec<Endpoint>]) -> String {
    candidates
        .iter()
        .map(|eps| format!("\"{}\"", relation_key(eps)))
        .collect::<Vec<_>>()
        .join(", ")
}

impl State {
    fn named_endpoints(&self, name: &str) -> Result<Vec<Endpoint>, CoreError> {
        let (svc, rel) = parse_endpoint_name(name);
        let endpoints = self.service(svc)?.endpoints()?;
        Ok(match rel {
            Some(rel) => endpoints
                .into_iter()
                .filter(|ep| ep.relation_name == rel)
                .collect(),
            None => endpoints,
        })
    }

    /// Work out the endpoints of the relation described by one or two names,
    /// each `service` or `service:relation`.
    pub fn infer_endpoints(&self, names: &[&str]) -> Result<Vec<Endpoint>, CoreError> {
        let mut candidates: Vec<Vec<Endpoint>> = match names {
            [one] => self
                .named_endpoints(one)?
                .into_iter()
                .filter(|ep| ep.role == RelationRole::Peer)
                .map(|ep| vec![ep])
                .collect(),
            [a, b] => {
                let lhs = self.named_endpoints(a)?;
                let rhs = self.named_endpoints(b)?;
                let mut pairs = Vec::new();
                for l in &lhs {
                    for r in rhs.iter().filter(|r| l.can_relate_to(r)) {
                        pairs.push(vec![l.clone(), r.clone()]);
                    }
                }
                pairs
            }
            _ => {
                return Err(CoreError::Validation(format!(
                    "cannot relate {} endpoints",
                    names.len()
                )))
            }
        };
        if candidates.len() > 1 {
            candidates.retain(|eps| eps.iter().all(|ep| ep.relation_name != JUJU_INFO));
        }
        match candidates.len() {
            0 => Err(CoreError::Validation(format!(
                "no relations found for \"{}\"",
                names.join(" ")
            ))),
            1 => {
                let mut eps = candidates.remove(0);
                if eps.iter().any(|ep| ep.scope == RelationScope::Container) {
                    for ep in &mut eps {
                        ep.scope = RelationScope::Container;
                    }
                }
                Ok(eps)
            }
            _ => Err(CoreError::Validation(format!(
                "ambiguous relation: \"{}\" could refer to {}",
                names.join(" "),
                quoted_keys(&candidates)
            ))),
        }
    }

    /// Add a relation between the services of `endpoints`.
    pub fn add_relation(&self, endpoints: &[Endpoint]) -> Result<Relation, CoreError> {
        let key = relation_key(endpoints);
        match endpoints {
            [ep] if ep.role == RelationRole::Peer => {}
            [a, b] if a.can_relate_to(b) => {}
            _ => {
                return Err(CoreError::Validation(format!(
                    "cannot add relation \"{key}\": endpoints do not relate"
                )))
            }
        }
        let container = endpoints
            .iter()
            .any(|ep| ep.scope == RelationScope::Container);
        let mut added = None;
        self.run_transaction(|_| {
            added = None;
            if self.read(RELATIONS, &key)?.is_some() {
                return Err(CoreError::precondition(
                    relation_desc(&key),
                    format!("cannot add relation \"{key}\": relation already exists"),
                ));
            }
            let mut ops = Vec::new();
            let mut subordinates = 0;
            for (i, ep) in endpoints.iter().enumerate() {
                if endpoints[..i]
                    .iter()
                    .any(|prev| prev.service_name == ep.service_name)
                {
                    continue;
                }
                let alive = match self.read(SERVICES, &ep.service_name)? {
                    Some(doc) => {
                        if doc.bool_field("subordinate") {
                            subordinates += 1;
                        }
                        doc_life(&doc)? == Life::Alive
                    }
                    None => false,
                };
                if !alive {
                    return Err(CoreError::precondition(
                        format!("service \"{}\"", ep.service_name),
                        format!(
                            "cannot add relation \"{key}\": service \"{}\" is not alive",
                            ep.service_name
                        ),
                    ));
                }
                ops.push(
                    Op::new(SERVICES, ep.service_name.as_str())
                        .assert(Assert::eq("life", Life::Alive.as_str())),
                );
            }
            if container && subordinates == 0 {
                return Err(CoreError::Validation(format!(
                    "cannot add relation \"{key}\": container scoped relation requires a subordinate service"
                )));
            }
            let (id, seq) = self.sequence("relation", 1)?;
            let doc = RelationDoc::new(id, endpoints.to_vec());
            ops.push(seq);
            ops.push(Op::new(RELATIONS, key.as_str()).insert(encode(&doc)?));
            added = Some(doc);
            Ok(ops)
        })?;
        let doc = added.ok_or_else(|| CoreError::Conflict("relation was not added".to_owned()))?;
        info!("added relation {} ({key})", doc.id);
        Ok(Relation {
            state: self.clone(),
            doc,
        })
    }

    pub fn relation(&self, key: &str) -> Result<Relation, CoreError> {
        let doc = self
            .read(RELATIONS, key)?
            .ok_or_else(|| CoreError::NotFound(relation_desc(key)))?;
        Relation::from_doc(self, &doc)
    }

    pub fn all_relations(&self) -> Result<Vec<Relation>, CoreError> {
        let mut relations = self
            .list(RELATIONS)?
            .iter()
            .map(|doc| Relation::from_doc(self, doc))
            .collect::<Result<Vec<_>, _>>()?;
        relations.sort_by_key(Relation::id);
        Ok(relations)
    }
}
